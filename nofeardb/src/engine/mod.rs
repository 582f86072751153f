mod json;
mod registry;

use crate::config::EngineConfig;
use crate::document::{
    summarize, DocHandle, Document, DocumentGraph, DocumentStatus, Model, ModelDescriptor,
};
use crate::error::{NoFearDbError, Result};
use crate::lock::{DocumentLock, LockInfo};
use crate::query::{Expr, QueryFilter};
use json::NAME_SEPARATOR;
use registry::Registry;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Handles already present in a graph, by type name and identity.
type KnownDocuments = HashMap<(&'static str, Uuid), DocHandle>;

/// Persists documents as JSON files under a root directory.
///
/// Each document type gets its own directory, named after the type's document name. Writes
/// are batched over the whole dependency graph of the document passed in: everything new or
/// modified that it can reach is validated, locked and written together.
#[derive(Debug)]
pub struct StorageEngine {
    root: PathBuf,
    config: EngineConfig,
    registry: Registry,
}

impl StorageEngine {
    /// Engine with the default configuration. The root directory is created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_config(root, EngineConfig::default())
    }

    pub fn with_config(root: impl AsRef<Path>, config: EngineConfig) -> Self {
        StorageEngine {
            root: root.as_ref().to_path_buf(),
            config,
            registry: Registry::default(),
        }
    }

    /// Open an existing data directory, reading `nofeardb.yaml` from it when present.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(NoFearDbError::Config(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }
        let config = EngineConfig::load(root)?;
        Ok(Self::with_config(root, config))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make document types known to [`read`](Self::read). Registering a type twice is a no-op.
    pub fn register_models(&mut self, models: &[ModelDescriptor]) -> Result<()> {
        let added = self.registry.register(models)?;
        if !added.is_empty() {
            log::info!(
                "Registered {} ({} types known)",
                added.join(", "),
                self.registry.len()
            );
        }
        Ok(())
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.registry.get(type_name).is_some()
    }

    /// Directory the documents of `model`'s type live in.
    pub fn document_dir(&self, model: &dyn Model) -> PathBuf {
        self.root.join(model.document_name())
    }

    /// `doc` followed by every document reachable from it, each once.
    pub fn resolve_dependencies(
        &self,
        graph: &DocumentGraph,
        doc: DocHandle,
    ) -> Result<Vec<DocHandle>> {
        graph.dependencies(doc)
    }

    /// Persist a new document together with its new or modified dependencies.
    pub fn create(&self, graph: &mut DocumentGraph, doc: DocHandle) -> Result<()> {
        let status = graph.model(doc)?.status();
        if status != DocumentStatus::New {
            return Err(NoFearDbError::State(format!(
                "only NEW documents can be created, this one is {status}"
            )));
        }
        self.persist(graph, doc)
    }

    /// Persist changes to a stored document together with its new or modified dependencies.
    pub fn update(&self, graph: &mut DocumentGraph, doc: DocHandle) -> Result<()> {
        let status = graph.model(doc)?.status();
        if matches!(status, DocumentStatus::New | DocumentStatus::Del) {
            return Err(NoFearDbError::State(format!(
                "{status} documents cannot be updated"
            )));
        }
        self.persist(graph, doc)
    }

    /// Mark a stored document for deletion. Its file is left in place.
    pub fn delete(&self, graph: &mut DocumentGraph, doc: DocHandle) -> Result<()> {
        let meta = graph.model_mut(doc)?.meta_mut();
        match meta.status() {
            DocumentStatus::New => Err(NoFearDbError::State(format!(
                "document {} was never persisted",
                meta.id()
            ))),
            DocumentStatus::Del => Ok(()),
            _ => {
                meta.set_status(DocumentStatus::Del);
                log::debug!("Marked {} for deletion", meta.id());
                Ok(())
            }
        }
    }

    /// Read every stored document of type `T`, optionally keeping only those matching `filter`.
    pub fn read<T: Document>(
        &self,
        graph: &mut DocumentGraph,
        filter: Option<&Expr>,
    ) -> Result<QueryFilter> {
        self.read_type(graph, T::TYPE_NAME, filter)
    }

    /// All stored documents of type `T`, for further filtering.
    pub fn query<T: Document>(&self, graph: &mut DocumentGraph) -> Result<QueryFilter> {
        self.read_type(graph, T::TYPE_NAME, None)
    }

    /// Read every stored document of a registered type.
    ///
    /// Documents already in `graph` are reused: LAZY and SYNC ones are refreshed from disk,
    /// modified ones are left as they are. Related documents that are not part of the graph
    /// yet are added as LAZY stubs, to be hydrated with [`load`](Self::load).
    pub fn read_type(
        &self,
        graph: &mut DocumentGraph,
        type_name: &str,
        filter: Option<&Expr>,
    ) -> Result<QueryFilter> {
        let descriptor = self.registry.require(type_name)?.clone();
        for rel in descriptor.instantiate().relationships() {
            self.registry.require(rel.target())?;
        }
        let dir = self.root.join(descriptor.document_name());
        let mut known = index(graph);
        let mut scanned = Vec::new();
        let mut handles = Vec::new();

        for path in document_files(&dir)? {
            let (sample, raw, id) = match read_document(&descriptor, &path) {
                Ok(document) => document,
                Err(e) => {
                    log::warn!("Skipping unreadable document {}: {}", path.display(), e);
                    continue;
                }
            };

            let handle = match known.get(&(descriptor.type_name(), id)) {
                Some(&handle) => {
                    let model = graph.model_mut(handle)?;
                    if matches!(model.status(), DocumentStatus::Lazy | DocumentStatus::Sync) {
                        hydrate_fields(model, &raw, id)?;
                        scanned.push((handle, raw));
                    }
                    handle
                }
                None => {
                    let handle = graph.insert_boxed(sample);
                    known.insert((descriptor.type_name(), id), handle);
                    scanned.push((handle, raw));
                    handle
                }
            };
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }

        for (handle, raw) in &scanned {
            self.hydrate_relationships(graph, *handle, raw, &mut known)?;
            finish_hydration(graph, *handle)?;
        }
        log::debug!("Read {} {} documents", handles.len(), type_name);

        let result = QueryFilter::new(handles);
        match filter {
            Some(expr) => result.filter(graph, expr),
            None => Ok(result),
        }
    }

    /// Hydrate a LAZY stub from its file.
    pub fn load(&self, graph: &mut DocumentGraph, doc: DocHandle) -> Result<()> {
        let model = graph.model(doc)?;
        if model.status() != DocumentStatus::Lazy {
            return Err(NoFearDbError::State(format!(
                "only LAZY documents can be loaded, {} is {}",
                model.id(),
                model.status()
            )));
        }
        let id = model.id();
        let dir = self.document_dir(model);
        let path = find_document_file(&dir, id)?.ok_or_else(|| {
            NoFearDbError::NotFound(format!("{}/{}", model.document_name(), id))
        })?;

        let descriptor = self.registry.require(model.type_name())?;
        let (_, raw, _) = read_document(descriptor, &path)?;
        let mut known = index(graph);
        hydrate_fields(graph.model_mut(doc)?, &raw, id)?;
        self.hydrate_relationships(graph, doc, &raw, &mut known)?;
        finish_hydration(graph, doc)
    }

    /// Complete JSON object for a document.
    pub fn create_json(&self, graph: &DocumentGraph, doc: DocHandle) -> Result<Value> {
        json::create_json(graph, doc)
    }

    /// `previous` with the document's pending changes applied.
    pub fn update_json(
        &self,
        previous: Value,
        graph: &DocumentGraph,
        doc: DocHandle,
    ) -> Result<Value> {
        json::update_json(previous, graph, doc)
    }

    /// Write a document's file, replacing the previous version. Returns the new path.
    ///
    /// New documents are serialized in full, others are merged into their stored object. The
    /// content goes to a temporary sibling first, is synced, and is renamed into place once
    /// the previous file is gone.
    pub fn write_json(&self, graph: &DocumentGraph, doc: DocHandle) -> Result<PathBuf> {
        let model = graph.model(doc)?;
        let id = model.id();
        let dir = self.document_dir(model);
        fs::create_dir_all(&dir)?;

        let previous = find_document_file(&dir, id)?;
        let object = match &previous {
            Some(path) if model.status() != DocumentStatus::New => {
                let stored = Value::Object(read_object(path)?);
                json::update_json(stored, graph, doc)?
            }
            _ => json::create_json(graph, doc)?,
        };
        let content = if self.config.pretty_json {
            serde_json::to_string_pretty(&object)?
        } else {
            serde_json::to_string(&object)?
        };

        let path = json::document_path(&dir, id, &content);
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        if let Some(previous) = previous.filter(|p| *p != path) {
            fs::remove_file(&previous)?;
        }
        fs::rename(&tmp, &path)?;
        log::debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Lock guarding `model`'s file, configured from the engine settings. Not yet acquired.
    pub fn lock_for(&self, model: &dyn Model) -> DocumentLock {
        DocumentLock::new(
            &self.document_dir(model),
            model.id(),
            self.config.lock_expiration(),
        )
        .with_heartbeat_interval(self.config.heartbeat_interval())
    }

    /// Stored objects under `document_name`, without going through a registered type.
    pub fn raw_documents(&self, document_name: &str) -> Result<Vec<(PathBuf, Value)>> {
        let mut documents = Vec::new();
        for path in document_files(&self.root.join(document_name))? {
            match read_object(&path) {
                Ok(object) => documents.push((path, Value::Object(object))),
                Err(e) => log::warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }
        Ok(documents)
    }

    /// Lock files currently present under `document_name`.
    pub fn locks(&self, document_name: &str) -> Result<Vec<LockInfo>> {
        let pattern = format!("{}/*.lock", escaped(&self.root.join(document_name)));
        let mut locks = Vec::new();
        for path in glob_paths(&pattern)? {
            if let Some(info) = LockInfo::read(&path)? {
                locks.push(info);
            }
        }
        Ok(locks)
    }

    /// Remove expired lock files under `document_name`. Returns the removed paths.
    pub fn clear_stale_locks(&self, document_name: &str) -> Result<Vec<PathBuf>> {
        let expiration = self.config.lock_expiration();
        let mut removed = Vec::new();
        for info in self.locks(document_name)? {
            if !info.is_expired(expiration) {
                continue;
            }
            match fs::remove_file(&info.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
            log::info!("Removed stale lock {}", info.path.display());
            removed.push(info.path);
        }
        Ok(removed)
    }

    fn persist(&self, graph: &mut DocumentGraph, root: DocHandle) -> Result<()> {
        let dependencies = self.resolve_dependencies(graph, root)?;
        let mut pending = Vec::new();
        for handle in dependencies {
            if matches!(
                graph.model(handle)?.status(),
                DocumentStatus::New | DocumentStatus::Mod
            ) {
                pending.push(handle);
            }
        }
        if pending.is_empty() {
            log::debug!("Nothing to write");
            return Ok(());
        }

        self.check_all_documents_can_be_written(graph, &pending)?;
        let summary = summarize(graph, &pending);
        let locks = self.lock_docs(graph, &pending)?;

        let mut outcome = Ok(());
        for handle in &pending {
            if let Err(e) = self.write_document(graph, *handle) {
                outcome = Err(e);
                break;
            }
        }
        self.unlock_docs(locks);
        outcome?;

        log::info!("Wrote {} documents ({})", pending.len(), summary);
        Ok(())
    }

    fn write_document(&self, graph: &mut DocumentGraph, handle: DocHandle) -> Result<()> {
        self.write_json(graph, handle)?;

        let model = graph.model_mut(handle)?;
        let id = model.id();
        if let Some(key) = model
            .fields_mut()
            .into_iter()
            .find(|f| f.is_primary_key() && !f.is_set())
        {
            key.load_identity(id)?;
        }
        model.meta_mut().mark_synced();
        model.create_snapshot();
        Ok(())
    }

    /// Reject the batch before anything is written: new documents must not exist on disk yet
    /// and must have every required field set, modified ones must exist.
    pub(crate) fn check_all_documents_can_be_written(
        &self,
        graph: &DocumentGraph,
        pending: &[DocHandle],
    ) -> Result<()> {
        for handle in pending {
            let model = graph.model(*handle)?;
            let dir = self.document_dir(model);
            let exists = find_document_file(&dir, model.id())?.is_some();
            let collision = || NoFearDbError::Collision {
                collection: model.document_name(),
                id: model.id().to_string(),
            };

            match model.status() {
                DocumentStatus::New if exists => return Err(collision()),
                DocumentStatus::New => {
                    if let Some(field) = model
                        .fields()
                        .into_iter()
                        .find(|f| !f.is_primary_key() && !f.is_nullable() && !f.is_set())
                    {
                        return Err(NoFearDbError::Validation(format!(
                            "{}.{} is required",
                            model.type_name(),
                            field.name()
                        )));
                    }
                }
                DocumentStatus::Mod if !exists => return Err(collision()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Acquire one lock per distinct file. On failure the locks taken so far are released.
    pub(crate) fn lock_docs(
        &self,
        graph: &DocumentGraph,
        docs: &[DocHandle],
    ) -> Result<Vec<DocumentLock>> {
        let mut wanted: Vec<DocumentLock> = Vec::new();
        for handle in docs {
            let lock = self.lock_for(graph.model(*handle)?);
            if !wanted.iter().any(|l| l.path() == lock.path()) {
                wanted.push(lock);
            }
        }

        let mut held = Vec::with_capacity(wanted.len());
        for mut lock in wanted {
            if let Err(e) = lock.lock() {
                log::debug!("Failed to lock {}: {}", lock.path().display(), e);
                self.unlock_docs(held);
                return Err(e);
            }
            held.push(lock);
        }
        Ok(held)
    }

    /// Release every lock. Failures are logged and otherwise ignored.
    pub(crate) fn unlock_docs(&self, locks: Vec<DocumentLock>) {
        for mut lock in locks {
            if let Err(e) = lock.release() {
                log::warn!("Failed to release lock {}: {}", lock.path().display(), e);
            }
        }
    }

    fn hydrate_relationships(
        &self,
        graph: &mut DocumentGraph,
        handle: DocHandle,
        raw: &Map<String, Value>,
        known: &mut KnownDocuments,
    ) -> Result<()> {
        type Edge = (&'static str, &'static str, bool, Option<&'static str>);
        let edges: Vec<Edge> = graph
            .model(handle)?
            .relationships()
            .iter()
            .map(|r| (r.name(), r.target(), r.kind().is_collection(), r.back_populates()))
            .collect();

        for (name, target, collection, back) in edges {
            let mut ids = json::referenced_ids(raw.get(name))?;
            if !collection {
                ids.truncate(1);
            }
            let mut related = Vec::with_capacity(ids.len());
            for id in ids {
                related.push(self.resolve_reference(graph, target, id, known)?);
            }

            let model = graph.model_mut(handle)?;
            let mut previous = Vec::new();
            if let Some(rel) = model.relationship_mut(name) {
                previous = rel.related();
                for current in &previous {
                    rel.detach(*current);
                }
                for item in &related {
                    rel.attach(*item);
                }
            }

            let Some(back) = back else {
                continue;
            };
            for item in previous.into_iter().filter(|h| !related.contains(h)) {
                mirror_onto_stub(graph, item, back, handle, false)?;
            }
            for item in related {
                mirror_onto_stub(graph, item, back, handle, true)?;
            }
        }
        Ok(())
    }

    /// Handle for a referenced document, adding a LAZY stub when the graph has none.
    fn resolve_reference(
        &self,
        graph: &mut DocumentGraph,
        target: &'static str,
        id: Uuid,
        known: &mut KnownDocuments,
    ) -> Result<DocHandle> {
        if let Some(handle) = known.get(&(target, id)) {
            return Ok(*handle);
        }
        let mut stub = self.registry.require(target)?.instantiate();
        stub.meta_mut().set_id(id);
        stub.meta_mut().set_status(DocumentStatus::Lazy);
        if let Some(key) = stub.fields_mut().into_iter().find(|f| f.is_primary_key()) {
            key.load_identity(id)?;
        }
        let handle = graph.insert_boxed(stub);
        known.insert((target, id), handle);
        Ok(handle)
    }
}

fn index(graph: &DocumentGraph) -> KnownDocuments {
    graph
        .handles()
        .filter_map(|h| graph.model(h).ok().map(|m| ((m.type_name(), m.id()), h)))
        .collect()
}

/// Keep the reverse slot of a LAZY stub in step with a hydrated owner, without recording a
/// change. Loaded documents get their reverse slots from their own files.
fn mirror_onto_stub(
    graph: &mut DocumentGraph,
    stub: DocHandle,
    back: &str,
    owner: DocHandle,
    attach: bool,
) -> Result<()> {
    let model = graph.model_mut(stub)?;
    if model.status() != DocumentStatus::Lazy {
        return Ok(());
    }
    if let Some(rel) = model.relationship_mut(back) {
        if attach {
            rel.attach(owner);
        } else {
            rel.detach(owner);
        }
    }
    Ok(())
}

/// Parse a stored document into a fresh instance of its type. Nothing in a graph is touched
/// until the file is known to be readable, including its relationship references.
fn read_document(
    descriptor: &ModelDescriptor,
    path: &Path,
) -> Result<(Box<dyn Model>, Map<String, Value>, Uuid)> {
    let raw = read_object(path)?;
    let mut sample = descriptor.instantiate();
    let id = json::stored_identity(sample.as_ref(), &raw, path)?;
    hydrate_fields(sample.as_mut(), &raw, id)?;
    for rel in sample.relationships() {
        json::referenced_ids(raw.get(rel.name()))?;
    }
    Ok((sample, raw, id))
}

fn hydrate_fields(model: &mut dyn Model, raw: &Map<String, Value>, id: Uuid) -> Result<()> {
    model.meta_mut().set_id(id);
    for field in model.fields_mut() {
        if field.is_primary_key() {
            field.load_identity(id)?;
        } else if let Some(value) = raw.get(field.name()) {
            field.load_json(value)?;
        }
    }
    Ok(())
}

fn finish_hydration(graph: &mut DocumentGraph, handle: DocHandle) -> Result<()> {
    let model = graph.model_mut(handle)?;
    model.meta_mut().mark_loaded();
    model.create_snapshot();
    Ok(())
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path)?;
    match serde_json::from_str(&content)? {
        Value::Object(object) => Ok(object),
        _ => Err(NoFearDbError::Conversion(format!(
            "{} does not contain a JSON object",
            path.display()
        ))),
    }
}

fn escaped(dir: &Path) -> String {
    glob::Pattern::escape(&dir.display().to_string())
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| NoFearDbError::Glob(format!("{pattern}: {e}")))?
        .filter_map(|r| r.ok())
        .collect();
    paths.sort();
    Ok(paths)
}

/// Document files in `dir`, sorted by name. A missing directory holds no documents.
fn document_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    glob_paths(&format!("{}/*.json", escaped(dir)))
}

/// The current file of document `id` in `dir`, whatever its content hash.
fn find_document_file(dir: &Path, id: Uuid) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let pattern = format!("{}/{}{}*.json", escaped(dir), id, NAME_SEPARATOR);
    Ok(glob_paths(&pattern)?.into_iter().next())
}
