//! Mapping between documents and their JSON files.
//!
//! A document file is a flat object: `"id"`, one key per non-primary-key field holding the
//! field's serialized string (or null), and one key per relationship holding the identity of
//! the related document (many-to-one) or an ordered list of identities (to-many).

use crate::document::{DocHandle, DocumentGraph, Model, PersistableRelationship};
use crate::error::{NoFearDbError, Result};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Separates the identity from the content hash in a document file name.
pub(crate) const NAME_SEPARATOR: &str = "__";

/// Build the complete JSON object for a document.
pub(crate) fn create_json(graph: &DocumentGraph, handle: DocHandle) -> Result<Value> {
    let model = graph.model(handle)?;
    let mut object = Map::new();
    object.insert("id".into(), Value::String(model.id().to_string()));

    for field in model.fields() {
        if !field.is_primary_key() {
            object.insert(field.name().into(), field.to_json());
        }
    }
    for rel in model.relationships() {
        object.insert(rel.name().into(), relationship_json(graph, rel)?);
    }
    Ok(Value::Object(object))
}

/// Apply a document's pending changes to the object previously stored for it.
///
/// Only fields listed as changed and relationships with recorded additions or removals are
/// touched; every other key of `previous` is kept as is.
pub(crate) fn update_json(previous: Value, graph: &DocumentGraph, handle: DocHandle) -> Result<Value> {
    let model = graph.model(handle)?;
    let meta = model.meta();
    let mut object = match previous {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    object.insert("id".into(), Value::String(model.id().to_string()));

    for name in meta.changed_fields() {
        if let Some(field) = model.field(name) {
            object.insert(name.clone(), field.to_json());
        }
    }

    for rel in model.relationships() {
        let added = ids(graph, meta.added_relationships().get(rel.name()))?;
        let removed = ids(graph, meta.removed_relationships().get(rel.name()))?;
        if added.is_empty() && removed.is_empty() {
            continue;
        }

        let stored = object.remove(rel.name()).unwrap_or(Value::Null);
        let patched = if rel.kind().is_collection() {
            let mut list = match stored {
                Value::Array(list) => list,
                _ => Vec::new(),
            };
            list.retain(|v| !v.as_str().is_some_and(|id| removed.iter().any(|r| r == id)));
            for id in added {
                if !list.iter().any(|v| v.as_str() == Some(id.as_str())) {
                    list.push(Value::String(id));
                }
            }
            Value::Array(list)
        } else {
            let mut slot = stored;
            if slot.as_str().is_some_and(|id| removed.iter().any(|r| r == id)) {
                slot = Value::Null;
            }
            match added.into_iter().last() {
                Some(id) => Value::String(id),
                None => slot,
            }
        };
        object.insert(rel.name().into(), patched);
    }
    Ok(Value::Object(object))
}

fn relationship_json(graph: &DocumentGraph, rel: &dyn PersistableRelationship) -> Result<Value> {
    let related = rel.related();
    if rel.kind().is_collection() {
        let ids = ids(graph, Some(&related))?;
        return Ok(Value::Array(ids.into_iter().map(Value::String).collect()));
    }
    match related.first() {
        Some(handle) => Ok(Value::String(graph.model(*handle)?.id().to_string())),
        None => Ok(Value::Null),
    }
}

fn ids(graph: &DocumentGraph, handles: Option<&Vec<DocHandle>>) -> Result<Vec<String>> {
    handles
        .into_iter()
        .flatten()
        .map(|h| Ok(graph.model(*h)?.id().to_string()))
        .collect()
}

/// Identities referenced by a stored relationship value.
pub(crate) fn referenced_ids(raw: Option<&Value>) -> Result<Vec<Uuid>> {
    let parse = |v: &Value| -> Result<Uuid> {
        let s = v.as_str().ok_or_else(|| {
            NoFearDbError::Conversion(format!("relationship reference {v} is not a string"))
        })?;
        Uuid::parse_str(s)
            .map_err(|_| NoFearDbError::Conversion(format!("'{s}' is not a document identity")))
    };
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse).collect(),
        Some(other) => Ok(vec![parse(other)?]),
    }
}

/// Identity of a stored document: the primary-key key, then `"id"`, then the file name.
pub(crate) fn stored_identity(model: &dyn Model, raw: &Map<String, Value>, path: &Path) -> Result<Uuid> {
    let keys = model
        .primary_key_field()
        .map(|f| f.name())
        .into_iter()
        .chain(std::iter::once("id"));
    for key in keys {
        if let Some(Value::String(s)) = raw.get(key) {
            if let Ok(id) = Uuid::parse_str(s) {
                return Ok(id);
            }
        }
    }
    identity_from_file_name(path).ok_or_else(|| {
        NoFearDbError::Conversion(format!("cannot determine the identity of {}", path.display()))
    })
}

pub(crate) fn identity_from_file_name(path: &Path) -> Option<Uuid> {
    let name = path.file_name()?.to_str()?;
    let prefix = name.split(NAME_SEPARATOR).next()?;
    let prefix = prefix.strip_suffix(".json").unwrap_or(prefix);
    Uuid::parse_str(prefix).ok()
}

/// `<id>__<hash>.json` inside `dir`.
pub(crate) fn document_path(dir: &Path, id: Uuid, content: &str) -> PathBuf {
    dir.join(format!("{id}{NAME_SEPARATOR}{}.json", content_hash(content)))
}

pub(crate) fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::testing::*;
    use crate::document::DocumentStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_create_json_shape() {
        let mut graph = DocumentGraph::new();
        let mut doc = TestDoc::default();
        doc.set_title("hello").unwrap();
        let doc = graph.insert(doc);
        let item = graph.insert(TestRelDoc::default());
        graph.append(doc, "items", item).unwrap();

        let doc_id = graph.model(doc).unwrap().id().to_string();
        let item_id = graph.model(item).unwrap().id().to_string();

        assert_eq!(
            create_json(&graph, doc).unwrap(),
            json!({
                "id": doc_id,
                "title": "hello",
                "count": null,
                "items": [item_id],
                "tags": [],
            })
        );
        assert_eq!(
            create_json(&graph, item).unwrap(),
            json!({ "id": item_id, "label": null, "owner": doc_id })
        );
    }

    #[test]
    fn test_primary_key_is_not_duplicated() {
        let mut graph = DocumentGraph::new();
        let mut m = Measurement::default();
        let key = Uuid::new_v4();
        m.key.set(&mut m.meta, Some(key)).unwrap();
        m.value.set(&mut m.meta, Some(2.0)).unwrap();
        let h = graph.insert(m);

        assert_eq!(
            create_json(&graph, h).unwrap(),
            json!({ "id": key.to_string(), "value": "2.0", "taken_at": null })
        );
    }

    #[test]
    fn test_update_json_patches_only_changes() {
        let mut graph = DocumentGraph::new();
        let doc = graph.insert(TestDoc::default());
        let kept = graph.insert(TestRelDoc::default());
        let added = graph.insert(TestRelDoc::default());
        graph.append(doc, "items", kept).unwrap();
        for h in [doc, kept] {
            graph.model_mut(h).unwrap().meta_mut().mark_synced();
        }
        let id = |h: DocHandle| graph.model(h).unwrap().id().to_string();
        let (doc_id, kept_id, added_id) = (id(doc), id(kept), id(added));
        let gone = Uuid::new_v4().to_string();

        let previous = json!({
            "id": doc_id,
            "title": "old",
            "count": "4",
            "items": [gone, kept_id],
            "tags": [],
            "extra": true,
        });

        graph.get_mut::<TestDoc>(doc).unwrap().set_count(Some(5)).unwrap();
        graph.append(doc, "items", added).unwrap();
        graph.remove(doc, "items", kept).unwrap();

        let patched = update_json(previous, &graph, doc).unwrap();
        assert_eq!(
            patched,
            json!({
                "id": doc_id,
                "title": "old",
                "count": "5",
                "items": [gone, added_id],
                "tags": [],
                "extra": true,
            })
        );
    }

    #[test]
    fn test_update_json_many_to_one() {
        let mut graph = DocumentGraph::new();
        let mut item = TestRelDoc::default();
        item.meta.set_status(DocumentStatus::Sync);
        let item = graph.insert(item);
        let owner = graph.insert(TestDoc::default());
        let owner_id = graph.model(owner).unwrap().id().to_string();

        graph.set_related_one(item, "owner", Some(owner)).unwrap();
        let patched = update_json(json!({ "owner": null }), &graph, item).unwrap();
        assert_eq!(patched["owner"], json!(owner_id));

        graph.model_mut(item).unwrap().meta_mut().clear_changes();
        graph.set_related_one(item, "owner", None).unwrap();
        let patched = update_json(patched, &graph, item).unwrap();
        assert_eq!(patched["owner"], Value::Null);
    }

    #[test]
    fn test_referenced_ids() {
        let a = Uuid::new_v4();
        assert!(referenced_ids(None).unwrap().is_empty());
        assert!(referenced_ids(Some(&Value::Null)).unwrap().is_empty());
        assert_eq!(referenced_ids(Some(&json!(a.to_string()))).unwrap(), vec![a]);
        assert_eq!(referenced_ids(Some(&json!([a.to_string()]))).unwrap(), vec![a]);
        assert!(referenced_ids(Some(&json!([1]))).is_err());
    }

    #[test]
    fn test_file_names() {
        let id = Uuid::new_v4();
        let path = document_path(Path::new("/data/doc"), id, "{}");
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(&format!("{id}__")));
        assert_eq!(name.len(), 36 + 2 + 16 + 5);
        assert_eq!(identity_from_file_name(&path), Some(id));
        assert_eq!(content_hash("{}"), content_hash("{}"));
        assert_ne!(content_hash("{}"), content_hash("[]"));
    }
}
