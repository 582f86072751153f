use super::{DocHandle, Document, DocumentStatus, Model, RelationshipKind};
use crate::error::{NoFearDbError, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// Arena that owns a set of related documents.
///
/// Relationships refer to each other by [`DocHandle`], so cyclic graphs (a parent that lists
/// its children, each child pointing back at the parent) need no shared ownership. Every
/// relationship mutation goes through this type so that both sides of a back-populated pair
/// stay consistent and the change is recorded on the documents involved.
#[derive(Default)]
pub struct DocumentGraph {
    docs: Vec<Box<dyn Model>>,
}

struct Edge {
    kind: RelationshipKind,
    target: &'static str,
    back_populates: Option<&'static str>,
    related: Vec<DocHandle>,
}

impl DocumentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a document into the graph.
    pub fn insert<T: Document>(&mut self, doc: T) -> DocHandle {
        self.insert_boxed(Box::new(doc))
    }

    pub(crate) fn insert_boxed(&mut self, doc: Box<dyn Model>) -> DocHandle {
        self.docs.push(doc);
        DocHandle(self.docs.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = DocHandle> {
        (0..self.docs.len()).map(DocHandle)
    }

    pub fn model(&self, handle: DocHandle) -> Result<&dyn Model> {
        self.docs
            .get(handle.0)
            .map(|doc| doc.as_ref())
            .ok_or_else(|| stale(handle))
    }

    pub fn model_mut(&mut self, handle: DocHandle) -> Result<&mut dyn Model> {
        match self.docs.get_mut(handle.0) {
            Some(doc) => Ok(doc.as_mut()),
            None => Err(stale(handle)),
        }
    }

    /// Borrow a document as its concrete type.
    pub fn get<T: Document>(&self, handle: DocHandle) -> Result<&T> {
        let model = self.model(handle)?;
        let type_name = model.type_name();
        model
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| wrong_type(type_name, T::TYPE_NAME))
    }

    pub fn get_mut<T: Document>(&mut self, handle: DocHandle) -> Result<&mut T> {
        let model = self.model_mut(handle)?;
        let type_name = model.type_name();
        model
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| wrong_type(type_name, T::TYPE_NAME))
    }

    /// Handle of the document of `type_name` with identity `id`, if present.
    pub fn find(&self, type_name: &str, id: Uuid) -> Option<DocHandle> {
        self.docs
            .iter()
            .position(|doc| doc.type_name() == type_name && doc.id() == id)
            .map(DocHandle)
    }

    /// Current members of a relationship, in order.
    pub fn related(&self, owner: DocHandle, relationship: &str) -> Result<Vec<DocHandle>> {
        Ok(self.edge(owner, relationship)?.related)
    }

    /// Value of a many-to-one relationship.
    pub fn related_one(&self, owner: DocHandle, relationship: &str) -> Result<Option<DocHandle>> {
        let edge = self.edge(owner, relationship)?;
        if edge.kind.is_collection() {
            return Err(NoFearDbError::Validation(format!(
                "relationship '{relationship}' is {}, not many-to-one",
                edge.kind
            )));
        }
        Ok(edge.related.first().copied())
    }

    /// Append `item` to a to-many relationship. Appending an existing member is a no-op.
    pub fn append(&mut self, owner: DocHandle, relationship: &str, item: DocHandle) -> Result<()> {
        let edge = self.collection_edge(owner, relationship)?;
        if edge.related.contains(&item) {
            return Ok(());
        }
        self.check_link(owner, &edge, item)?;
        self.link(owner, relationship, item, None)
    }

    /// Remove `item` from a relationship.
    pub fn remove(&mut self, owner: DocHandle, relationship: &str, item: DocHandle) -> Result<()> {
        let edge = self.edge(owner, relationship)?;
        if !edge.related.contains(&item) {
            return Err(NoFearDbError::NotFound(format!(
                "document {} is not a member of '{relationship}'",
                item.0
            )));
        }
        self.ensure_mutable(&[owner, item])?;
        self.unlink(owner, relationship, item)
    }

    /// Replace the member at `index` of a to-many relationship with `item`.
    pub fn replace(
        &mut self,
        owner: DocHandle,
        relationship: &str,
        index: usize,
        item: DocHandle,
    ) -> Result<()> {
        let edge = self.collection_edge(owner, relationship)?;
        let Some(&current) = edge.related.get(index) else {
            return Err(NoFearDbError::NotFound(format!(
                "index {index} is out of range for '{relationship}' ({} items)",
                edge.related.len()
            )));
        };
        if current == item {
            return Ok(());
        }
        self.ensure_mutable(&[current])?;
        self.check_link(owner, &edge, item)?;
        self.unlink(owner, relationship, current)?;
        self.link(owner, relationship, item, Some(index))
    }

    /// Replace the whole membership of a to-many relationship.
    ///
    /// Members missing from `items` are detached, the rest keep their position and new ones
    /// are appended in the given order.
    pub fn set_related(
        &mut self,
        owner: DocHandle,
        relationship: &str,
        items: Vec<DocHandle>,
    ) -> Result<()> {
        let edge = self.collection_edge(owner, relationship)?;
        let mut wanted = Vec::with_capacity(items.len());
        for item in items {
            if !wanted.contains(&item) {
                wanted.push(item);
            }
        }

        let dropped: Vec<DocHandle> = edge
            .related
            .iter()
            .copied()
            .filter(|h| !wanted.contains(h))
            .collect();
        self.ensure_mutable(&dropped)?;
        for item in &wanted {
            if !edge.related.contains(item) {
                self.check_link(owner, &edge, *item)?;
            }
        }

        for item in dropped {
            self.unlink(owner, relationship, item)?;
        }
        for item in wanted {
            self.link(owner, relationship, item, None)?;
        }
        Ok(())
    }

    /// Set or clear a many-to-one relationship.
    pub fn set_related_one(
        &mut self,
        owner: DocHandle,
        relationship: &str,
        item: Option<DocHandle>,
    ) -> Result<()> {
        let edge = self.edge(owner, relationship)?;
        if edge.kind.is_collection() {
            return Err(NoFearDbError::Validation(format!(
                "relationship '{relationship}' is {}; use append or set_related",
                edge.kind
            )));
        }
        let current = edge.related.first().copied();
        match item {
            Some(item) if current == Some(item) => Ok(()),
            Some(item) => {
                self.check_link(owner, &edge, item)?;
                self.link(owner, relationship, item, None)
            }
            None => match current {
                Some(current) => {
                    self.ensure_mutable(&[owner, current])?;
                    self.unlink(owner, relationship, current)
                }
                None => Ok(()),
            },
        }
    }

    pub fn create_snapshot(&mut self, handle: DocHandle) -> Result<()> {
        self.model_mut(handle)?.create_snapshot();
        Ok(())
    }

    /// Restore a document to its last snapshot. Other documents are left untouched.
    pub fn reset(&mut self, handle: DocHandle) -> Result<()> {
        self.model_mut(handle)?.reset();
        Ok(())
    }

    /// Transitive closure of `root` over relationship edges, `root` first.
    ///
    /// Depth-first with an explicit stack: a document is appended when popped and is pushed
    /// at most once, so cycles terminate and a document already queued keeps its place.
    /// Edges recorded as removed are followed after the current ones, so a document detached
    /// in memory is still part of the batch that persists the detachment.
    pub fn dependencies(&self, root: DocHandle) -> Result<Vec<DocHandle>> {
        let mut queued = HashSet::from([root]);
        let mut order = Vec::new();
        let mut stack = vec![root];

        while let Some(handle) = stack.pop() {
            order.push(handle);

            let model = self.model(handle)?;
            let relationships = model.relationships();
            let removed = model.meta().removed_relationships();
            let current = relationships.iter().flat_map(|r| r.related());
            let detached = relationships
                .iter()
                .filter_map(|r| removed.get(r.name()))
                .flatten()
                .copied();
            for next in current.chain(detached) {
                if queued.insert(next) {
                    stack.push(next);
                }
            }
        }

        Ok(order)
    }

    fn edge(&self, owner: DocHandle, relationship: &str) -> Result<Edge> {
        let model = self.model(owner)?;
        let rel = model.relationship(relationship).ok_or_else(|| {
            NoFearDbError::NotFound(format!(
                "{} has no relationship named '{relationship}'",
                model.type_name()
            ))
        })?;
        Ok(Edge {
            kind: rel.kind(),
            target: rel.target(),
            back_populates: rel.back_populates(),
            related: rel.related(),
        })
    }

    fn collection_edge(&self, owner: DocHandle, relationship: &str) -> Result<Edge> {
        let edge = self.edge(owner, relationship)?;
        if !edge.kind.is_collection() {
            return Err(NoFearDbError::Validation(format!(
                "relationship '{relationship}' is many-to-one; use set_related_one"
            )));
        }
        Ok(edge)
    }

    fn ensure_mutable(&self, handles: &[DocHandle]) -> Result<()> {
        for handle in handles {
            self.model(*handle)?.meta().ensure_mutable()?;
        }
        Ok(())
    }

    /// Everything that must hold before `item` is linked into `owner`'s relationship, checked
    /// up front so a failure leaves both sides untouched.
    fn check_link(&self, owner: DocHandle, edge: &Edge, item: DocHandle) -> Result<()> {
        let item_model = self.model(item)?;
        if item_model.type_name() != edge.target {
            return Err(NoFearDbError::Validation(format!(
                "expected a {} document, got {}",
                edge.target,
                item_model.type_name()
            )));
        }

        let mut touched = vec![owner, item];
        if !edge.kind.is_collection() {
            touched.extend(edge.related.iter().copied());
        }
        if let Some(back) = edge.back_populates {
            if let Some(rel) = item_model.relationship(back) {
                if !rel.kind().is_collection() {
                    touched.extend(rel.related());
                }
            }
        }
        self.ensure_mutable(&touched)
    }

    fn link(
        &mut self,
        owner: DocHandle,
        relationship: &str,
        item: DocHandle,
        index: Option<usize>,
    ) -> Result<()> {
        let edge = self.edge(owner, relationship)?;
        if edge.related.contains(&item) {
            return Ok(());
        }
        if !edge.kind.is_collection() {
            if let Some(&previous) = edge.related.first() {
                self.unlink(owner, relationship, previous)?;
            }
        }

        let model = self.model_mut(owner)?;
        if let Some(rel) = model.relationship_mut(relationship) {
            match index {
                Some(index) => rel.insert_at(index, item),
                None => rel.attach(item),
            }
        }
        model.meta_mut().record_added(relationship, item);

        if let Some(back) = edge.back_populates {
            self.link(item, back, owner, None)?;
        }
        Ok(())
    }

    fn unlink(&mut self, owner: DocHandle, relationship: &str, item: DocHandle) -> Result<()> {
        let model = self.model_mut(owner)?;
        let lazy = model.status() == DocumentStatus::Lazy;
        let recorded = model
            .meta()
            .removed_relationships()
            .get(relationship)
            .is_some_and(|removed| removed.contains(&item));
        let Some(rel) = model.relationship_mut(relationship) else {
            return Ok(());
        };
        let back = rel.back_populates();
        // A LAZY document has not loaded its relationships, so the removal is recorded even
        // though the item is not in memory. It is merged into the stored list on write.
        if !rel.detach(item) && (!lazy || recorded) {
            return Ok(());
        }
        model.meta_mut().record_removed(relationship, item);

        if let Some(back) = back {
            self.unlink(item, back, owner)?;
        }
        Ok(())
    }
}

/// Status counts, for log lines.
pub(crate) fn summarize(graph: &DocumentGraph, handles: &[DocHandle]) -> String {
    let mut counts = [0usize; 5];
    for handle in handles {
        if let Ok(model) = graph.model(*handle) {
            let slot = match model.status() {
                DocumentStatus::New => 0,
                DocumentStatus::Sync => 1,
                DocumentStatus::Mod => 2,
                DocumentStatus::Del => 3,
                DocumentStatus::Lazy => 4,
            };
            counts[slot] += 1;
        }
    }
    format!(
        "{} new, {} sync, {} mod, {} del, {} lazy",
        counts[0], counts[1], counts[2], counts[3], counts[4]
    )
}

fn stale(handle: DocHandle) -> NoFearDbError {
    NoFearDbError::NotFound(format!("no document with handle {}", handle.0))
}

fn wrong_type(actual: &str, expected: &str) -> NoFearDbError {
    NoFearDbError::Validation(format!("document is a {actual}, not a {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::testing::*;
    use crate::document::PersistableRelationship;
    use pretty_assertions::assert_eq;

    fn synced<T: Document>(mut doc: T) -> T {
        doc.meta_mut().set_status(DocumentStatus::Sync);
        doc
    }

    #[test]
    fn test_one_to_many_back_population() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let rel1 = graph.insert(TestRelDoc::default());
        let rel2 = graph.insert(TestRelDoc::default());

        graph.append(doc, "items", rel1).unwrap();
        assert_eq!(graph.related_one(rel1, "owner").unwrap(), Some(doc));
        assert_eq!(graph.get::<TestDoc>(doc).unwrap().items.items(), [rel1]);

        graph.set_related_one(rel2, "owner", Some(doc)).unwrap();
        assert_eq!(graph.related(doc, "items").unwrap(), vec![rel1, rel2]);

        graph.remove(doc, "items", rel1).unwrap();
        assert_eq!(graph.related_one(rel1, "owner").unwrap(), None);
        assert_eq!(graph.related(doc, "items").unwrap(), vec![rel2]);

        graph.set_related_one(rel2, "owner", None).unwrap();
        assert!(graph.related(doc, "items").unwrap().is_empty());
    }

    #[test]
    fn test_reassigning_owner_detaches_from_previous() {
        let mut graph = DocumentGraph::new();
        let first = graph.insert(synced(TestDoc::default()));
        let second = graph.insert(synced(TestDoc::default()));
        let item = graph.insert(synced(TestRelDoc::default()));

        graph.append(first, "items", item).unwrap();
        for handle in [first, second, item] {
            graph.model_mut(handle).unwrap().meta_mut().clear_changes();
        }
        graph.append(second, "items", item).unwrap();

        assert!(graph.related(first, "items").unwrap().is_empty());
        assert_eq!(graph.related(second, "items").unwrap(), vec![item]);
        assert_eq!(graph.related_one(item, "owner").unwrap(), Some(second));

        let first_meta = graph.model(first).unwrap().meta();
        assert_eq!(first_meta.status(), DocumentStatus::Mod);
        assert!(first_meta.added_relationships().is_empty());
        assert_eq!(first_meta.removed_relationships()["items"], vec![item]);
        assert_eq!(
            graph.model(item).unwrap().meta().added_relationships()["owner"],
            vec![second]
        );
        assert_eq!(
            graph.model(item).unwrap().meta().removed_relationships()["owner"],
            vec![first]
        );
    }

    #[test]
    fn test_many_to_many_symmetry() {
        let mut graph = DocumentGraph::new();
        let a = graph.insert(TestDoc::default());
        let b = graph.insert(TestDoc::default());
        let tag = graph.insert(synced(TagDoc::default()));

        graph.append(a, "tags", tag).unwrap();
        graph.append(b, "tags", tag).unwrap();
        graph.append(b, "tags", tag).unwrap();

        assert_eq!(graph.related(tag, "docs").unwrap(), vec![a, b]);
        assert_eq!(graph.model(tag).unwrap().status(), DocumentStatus::Mod);

        graph.remove(tag, "docs", a).unwrap();
        assert!(graph.related(a, "tags").unwrap().is_empty());
        assert_eq!(graph.related(b, "tags").unwrap(), vec![tag]);
    }

    #[test]
    fn test_replace_by_index() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let rels: Vec<_> = (0..3).map(|_| graph.insert(TestRelDoc::default())).collect();
        for rel in &rels {
            graph.append(doc, "items", *rel).unwrap();
        }
        let replacement = graph.insert(TestRelDoc::default());

        graph.replace(doc, "items", 1, replacement).unwrap();
        assert_eq!(
            graph.related(doc, "items").unwrap(),
            vec![rels[0], replacement, rels[2]]
        );
        assert_eq!(graph.related_one(rels[1], "owner").unwrap(), None);
        assert_eq!(graph.related_one(replacement, "owner").unwrap(), Some(doc));

        let err = graph.replace(doc, "items", 7, rels[1]).unwrap_err();
        assert!(matches!(err, NoFearDbError::NotFound(_)));
    }

    #[test]
    fn test_set_related_detaches_missing_members() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let a = graph.insert(TestRelDoc::default());
        let b = graph.insert(TestRelDoc::default());
        let c = graph.insert(TestRelDoc::default());
        graph.set_related(doc, "items", vec![a, b]).unwrap();

        graph.set_related(doc, "items", vec![c, b, c]).unwrap();
        assert_eq!(graph.related(doc, "items").unwrap(), vec![b, c]);
        assert_eq!(graph.related_one(a, "owner").unwrap(), None);
        assert_eq!(graph.related_one(c, "owner").unwrap(), Some(doc));
    }

    #[test]
    fn test_wrong_target_type_is_rejected() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let other = graph.insert(TestDoc::default());
        let err = graph.append(doc, "items", other).unwrap_err();
        assert!(matches!(err, NoFearDbError::Validation(_)));
        assert!(graph.related(doc, "items").unwrap().is_empty());
    }

    #[test]
    fn test_deleted_side_blocks_both_sides() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(synced(TestDoc::default()));
        let mut deleted = TestRelDoc::default();
        deleted.meta.set_status(DocumentStatus::Del);
        let deleted = graph.insert(deleted);

        let err = graph.append(doc, "items", deleted).unwrap_err();
        assert!(matches!(err, NoFearDbError::State(_)));
        assert!(graph.related(doc, "items").unwrap().is_empty());
        assert_eq!(graph.model(doc).unwrap().status(), DocumentStatus::Sync);
        assert_eq!(graph.model(deleted).unwrap().status(), DocumentStatus::Del);
    }

    #[test]
    fn test_unknown_relationship() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let rel = graph.insert(TestRelDoc::default());
        let err = graph.append(doc, "nope", rel).unwrap_err();
        assert!(matches!(err, NoFearDbError::NotFound(_)));
        let err = graph.append(rel, "owner", doc).unwrap_err();
        assert!(matches!(err, NoFearDbError::Validation(_)));
    }

    #[test]
    fn test_typed_access() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        graph.get_mut::<TestDoc>(doc).unwrap().set_title("typed").unwrap();
        assert_eq!(
            graph.get::<TestDoc>(doc).unwrap().title.get().map(String::as_str),
            Some("typed")
        );
        assert!(graph.get::<TestRelDoc>(doc).is_err());
        assert!(graph.model(DocHandle(99)).is_err());

        let id = graph.model(doc).unwrap().id();
        assert_eq!(graph.find("TestDoc", id), Some(doc));
        assert_eq!(graph.find("TestRelDoc", id), None);
    }

    #[test]
    fn test_dependencies_terminate_on_cycles() {
        let mut graph = DocumentGraph::new();
        let a = graph.insert(TestDoc::default());
        let b = graph.insert(TestDoc::default());
        let tag = graph.insert(TagDoc::default());
        let item = graph.insert(TestRelDoc::default());

        graph.append(a, "tags", tag).unwrap();
        graph.append(b, "tags", tag).unwrap();
        graph.append(a, "items", item).unwrap();

        let deps = graph.dependencies(a).unwrap();
        assert_eq!(deps[0], a);
        assert_eq!(deps.len(), 4);
        let unique: HashSet<_> = deps.iter().collect();
        assert_eq!(unique.len(), 4);

        let from_item = graph.dependencies(item).unwrap();
        assert_eq!(from_item[0], item);
        assert_eq!(from_item.len(), 4);
    }

    #[test]
    fn test_dependencies_keep_the_position_of_queued_documents() {
        let mut graph = DocumentGraph::new();
        let root = graph.insert(TestDoc::default());
        let other = graph.insert(TestDoc::default());
        let t1 = graph.insert(TagDoc::default());
        let t2 = graph.insert(TagDoc::default());
        let item = graph.insert(TestRelDoc::default());

        graph.set_related(root, "tags", vec![t1, t2]).unwrap();
        graph.set_related(other, "tags", vec![t2, t1]).unwrap();
        graph.append(other, "items", item).unwrap();

        assert_eq!(
            graph.dependencies(root).unwrap(),
            vec![root, t2, other, item, t1]
        );
    }

    #[test]
    fn test_dependencies_follow_removed_edges() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(synced(TestDoc::default()));
        let item = graph.insert(synced(TestRelDoc::default()));
        graph.append(doc, "items", item).unwrap();
        graph.model_mut(doc).unwrap().meta_mut().clear_changes();
        graph.model_mut(item).unwrap().meta_mut().clear_changes();

        graph.set_related_one(item, "owner", None).unwrap();
        assert_eq!(graph.dependencies(item).unwrap(), vec![item, doc]);
    }

    #[test]
    fn test_reset_restores_relationships() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(synced(TestDoc::default()));
        let item = graph.insert(TestRelDoc::default());
        graph.create_snapshot(doc).unwrap();

        graph.append(doc, "items", item).unwrap();
        graph.reset(doc).unwrap();

        let restored = graph.get::<TestDoc>(doc).unwrap();
        assert!(restored.items.is_empty());
        assert!(restored.meta.added_relationships().is_empty());
        assert_eq!(restored.status(), DocumentStatus::Sync);
        assert!(restored.items.related().is_empty());
    }

    #[test]
    fn test_summarize() {
        let mut graph = DocumentGraph::new();
        let a = graph.insert(TestDoc::default());
        let b = graph.insert(synced(TagDoc::default()));
        assert_eq!(
            summarize(&graph, &[a, b]),
            "1 new, 1 sync, 0 mod, 0 del, 0 lazy"
        );
    }
}
