// Document model - identity, lifecycle status, dirty tracking and the Model trait

mod field;
mod graph;
mod relationship;

pub use field::{Field, PersistableField};
pub use graph::DocumentGraph;
pub(crate) use graph::summarize;
pub use relationship::{
    ManyToMany, ManyToOne, OneToMany, PersistableRelationship, RelationshipKind,
};

use crate::datatypes::Value;
use crate::error::{NoFearDbError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    /// Never persisted.
    New,
    /// Persisted and unmodified since the last read or write.
    Sync,
    /// Persisted and modified in memory.
    Mod,
    /// Marked for deletion. Terminal.
    Del,
    /// Referenced from another document but not yet loaded from disk.
    Lazy,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentStatus::New => "NEW",
            DocumentStatus::Sync => "SYNC",
            DocumentStatus::Mod => "MOD",
            DocumentStatus::Del => "DEL",
            DocumentStatus::Lazy => "LAZY",
        };
        f.write_str(name)
    }
}

/// Handle to a document stored in a [`DocumentGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocHandle(pub(crate) usize);

impl DocHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Bookkeeping shared by every document: identity, status and pending changes.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    id: Uuid,
    status: DocumentStatus,
    changed_fields: Vec<String>,
    added_relationships: HashMap<String, Vec<DocHandle>>,
    removed_relationships: HashMap<String, Vec<DocHandle>>,
    /// Modified before its stored state was ever loaded.
    unloaded: bool,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentMeta {
    pub fn new() -> Self {
        DocumentMeta {
            id: Uuid::new_v4(),
            status: DocumentStatus::New,
            changed_fields: Vec::new(),
            added_relationships: HashMap::new(),
            removed_relationships: HashMap::new(),
            unloaded: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    /// Names of fields modified since the document was last synchronised, in order.
    pub fn changed_fields(&self) -> &[String] {
        &self.changed_fields
    }

    pub fn added_relationships(&self) -> &HashMap<String, Vec<DocHandle>> {
        &self.added_relationships
    }

    pub fn removed_relationships(&self) -> &HashMap<String, Vec<DocHandle>> {
        &self.removed_relationships
    }

    pub(crate) fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }

    pub(crate) fn set_status(&mut self, status: DocumentStatus) {
        self.status = status;
    }

    pub(crate) fn ensure_mutable(&self) -> Result<()> {
        if self.status == DocumentStatus::Del {
            return Err(NoFearDbError::State(format!(
                "document {} is marked for deletion and cannot be modified",
                self.id
            )));
        }
        Ok(())
    }

    /// SYNC and LAZY documents become MOD on their first mutation.
    pub(crate) fn mark_modified(&mut self) {
        match self.status {
            DocumentStatus::Sync => self.status = DocumentStatus::Mod,
            DocumentStatus::Lazy => {
                self.unloaded = true;
                self.status = DocumentStatus::Mod;
            }
            _ => {}
        }
    }

    pub(crate) fn record_field_change(&mut self, name: &str) {
        self.mark_modified();
        if self.status == DocumentStatus::Mod && !self.changed_fields.iter().any(|f| f == name) {
            self.changed_fields.push(name.to_string());
        }
    }

    pub(crate) fn record_added(&mut self, relationship: &str, item: DocHandle) {
        if !strike(&mut self.removed_relationships, relationship, item) {
            let added = self
                .added_relationships
                .entry(relationship.to_string())
                .or_default();
            if !added.contains(&item) {
                added.push(item);
            }
        }
        self.mark_modified();
    }

    pub(crate) fn record_removed(&mut self, relationship: &str, item: DocHandle) {
        if !strike(&mut self.added_relationships, relationship, item) {
            let removed = self
                .removed_relationships
                .entry(relationship.to_string())
                .or_default();
            if !removed.contains(&item) {
                removed.push(item);
            }
        }
        self.mark_modified();
    }

    pub(crate) fn clear_changes(&mut self) {
        self.changed_fields.clear();
        self.added_relationships.clear();
        self.removed_relationships.clear();
    }

    /// After a successful write. A stub that was modified without being loaded stays LAZY.
    pub(crate) fn mark_synced(&mut self) {
        self.status = if self.unloaded {
            DocumentStatus::Lazy
        } else {
            DocumentStatus::Sync
        };
        self.unloaded = false;
        self.clear_changes();
    }

    /// After the stored state has been read into the document.
    pub(crate) fn mark_loaded(&mut self) {
        self.unloaded = false;
        self.status = DocumentStatus::Sync;
        self.clear_changes();
    }

    /// Forget pending changes, returning a modified document to its persisted status.
    pub(crate) fn discard_changes(&mut self) {
        self.clear_changes();
        if self.status == DocumentStatus::Mod {
            self.mark_synced();
        }
    }
}

/// Remove `item` from the set stored under `key`, dropping the key once empty.
fn strike(map: &mut HashMap<String, Vec<DocHandle>>, key: &str, item: DocHandle) -> bool {
    let Some(items) = map.get_mut(key) else {
        return false;
    };
    let Some(pos) = items.iter().position(|h| *h == item) else {
        return false;
    };
    items.remove(pos);
    if items.is_empty() {
        map.remove(key);
    }
    true
}

/// Object-safe view of a persistable document type.
///
/// Implementations are normally generated with [`impl_document!`](crate::impl_document).
pub trait Model: Any + Send {
    /// Name of the Rust type, used to resolve relationship targets.
    fn type_name(&self) -> &'static str;

    /// Directory name the documents of this type are stored under.
    fn document_name(&self) -> String {
        self.type_name().to_lowercase()
    }

    fn meta(&self) -> &DocumentMeta;

    fn meta_mut(&mut self) -> &mut DocumentMeta;

    fn fields(&self) -> Vec<&dyn PersistableField>;

    fn fields_mut(&mut self) -> Vec<&mut dyn PersistableField>;

    fn relationships(&self) -> Vec<&dyn PersistableRelationship>;

    fn relationships_mut(&mut self) -> Vec<&mut dyn PersistableRelationship>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn id(&self) -> Uuid {
        self.meta().id()
    }

    fn status(&self) -> DocumentStatus {
        self.meta().status()
    }

    fn field(&self, name: &str) -> Option<&dyn PersistableField> {
        self.fields().into_iter().find(|f| f.name() == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut dyn PersistableField> {
        self.fields_mut().into_iter().find(|f| f.name() == name)
    }

    fn primary_key_field(&self) -> Option<&dyn PersistableField> {
        self.fields().into_iter().find(|f| f.is_primary_key())
    }

    fn relationship(&self, name: &str) -> Option<&dyn PersistableRelationship> {
        self.relationships().into_iter().find(|r| r.name() == name)
    }

    fn relationship_mut(&mut self, name: &str) -> Option<&mut dyn PersistableRelationship> {
        self.relationships_mut()
            .into_iter()
            .find(|r| r.name() == name)
    }

    /// Current value of a field by name. `"id"` resolves to the document identity.
    fn field_value(&self, name: &str) -> Option<Value> {
        match self.field(name) {
            Some(field) => Some(field.value()),
            None if name == "id" => Some(Value::Uuid(self.id())),
            None => None,
        }
    }

    /// Capture every field and relationship value for a later [`Model::reset`].
    fn create_snapshot(&mut self) {
        for field in self.fields_mut() {
            field.create_snapshot();
        }
        for relationship in self.relationships_mut() {
            relationship.create_snapshot();
        }
    }

    /// Restore the last snapshot and forget all pending changes.
    fn reset(&mut self) {
        for field in self.fields_mut() {
            field.reset();
        }
        for relationship in self.relationships_mut() {
            relationship.reset();
        }
        self.meta_mut().discard_changes();
    }
}

/// A concrete document type that the engine can instantiate.
pub trait Document: Model + Default {
    const TYPE_NAME: &'static str;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::of::<Self>()
    }
}

/// Type-erased constructor and naming information for a registered document type.
#[derive(Clone)]
pub struct ModelDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    document_name: String,
    factory: fn() -> Box<dyn Model>,
}

fn instantiate<T: Document>() -> Box<dyn Model> {
    Box::new(T::default())
}

impl ModelDescriptor {
    pub fn of<T: Document>() -> Self {
        ModelDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: T::TYPE_NAME,
            document_name: T::default().document_name(),
            factory: instantiate::<T>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    /// Build an empty NEW instance of the type.
    pub fn instantiate(&self) -> Box<dyn Model> {
        (self.factory)()
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("type_name", &self.type_name)
            .field("document_name", &self.document_name)
            .finish()
    }
}

/// Implement [`Model`] and [`Document`] for a struct with a `meta: DocumentMeta` member.
///
/// ```ignore
/// impl_document!(Invoice, name = "invoices" {
///     fields: [number, issued_at],
///     relationships: [lines],
/// });
/// ```
///
/// The type must also implement `Default`, constructing every field and relationship
/// with its persisted name.
#[macro_export]
macro_rules! impl_document {
    ($ty:ident $(, name = $name:literal)? {
        fields: [$($field:ident),* $(,)?],
        relationships: [$($rel:ident),* $(,)?] $(,)?
    }) => {
        impl $crate::document::Model for $ty {
            fn type_name(&self) -> &'static str {
                stringify!($ty)
            }

            $(
                fn document_name(&self) -> String {
                    ($name).to_string()
                }
            )?

            fn meta(&self) -> &$crate::document::DocumentMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::document::DocumentMeta {
                &mut self.meta
            }

            fn fields(&self) -> Vec<&dyn $crate::document::PersistableField> {
                vec![$(&self.$field as &dyn $crate::document::PersistableField),*]
            }

            fn fields_mut(&mut self) -> Vec<&mut dyn $crate::document::PersistableField> {
                vec![$(&mut self.$field as &mut dyn $crate::document::PersistableField),*]
            }

            fn relationships(&self) -> Vec<&dyn $crate::document::PersistableRelationship> {
                vec![$(&self.$rel as &dyn $crate::document::PersistableRelationship),*]
            }

            fn relationships_mut(
                &mut self,
            ) -> Vec<&mut dyn $crate::document::PersistableRelationship> {
                vec![$(&mut self.$rel as &mut dyn $crate::document::PersistableRelationship),*]
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }

        impl $crate::document::Document for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);
        }
    };
}

#[cfg(test)]
pub(crate) mod testing {
    //! Document types shared by the unit tests of this crate.

    use super::*;
    use crate::datatypes::{DateTime, Float, Integer, Text, Uuid as UuidType};

    pub struct TestDoc {
        pub meta: DocumentMeta,
        pub title: Field<Text>,
        pub count: Field<Integer>,
        pub items: OneToMany,
        pub tags: ManyToMany,
    }

    impl Default for TestDoc {
        fn default() -> Self {
            TestDoc {
                meta: DocumentMeta::new(),
                title: Field::new("title"),
                count: Field::new("count"),
                items: OneToMany::new("items", "TestRelDoc").back_populates("owner"),
                tags: ManyToMany::new("tags", "TagDoc").back_populates("docs"),
            }
        }
    }

    impl TestDoc {
        pub fn set_title(&mut self, title: &str) -> Result<()> {
            self.title.set(&mut self.meta, Some(title.to_string()))
        }

        pub fn set_count(&mut self, count: Option<i64>) -> Result<()> {
            self.count.set(&mut self.meta, count)
        }
    }

    crate::impl_document!(TestDoc, name = "test_doc" {
        fields: [title, count],
        relationships: [items, tags],
    });

    pub struct TestRelDoc {
        pub meta: DocumentMeta,
        pub label: Field<Text>,
        pub owner: ManyToOne,
    }

    impl Default for TestRelDoc {
        fn default() -> Self {
            TestRelDoc {
                meta: DocumentMeta::new(),
                label: Field::required("label"),
                owner: ManyToOne::new("owner", "TestDoc").back_populates("items"),
            }
        }
    }

    impl TestRelDoc {
        pub fn set_label(&mut self, label: Option<&str>) -> Result<()> {
            self.label.set(&mut self.meta, label.map(str::to_string))
        }
    }

    crate::impl_document!(TestRelDoc, name = "rel_test_doc" {
        fields: [label],
        relationships: [owner],
    });

    pub struct TagDoc {
        pub meta: DocumentMeta,
        pub docs: ManyToMany,
    }

    impl Default for TagDoc {
        fn default() -> Self {
            TagDoc {
                meta: DocumentMeta::new(),
                docs: ManyToMany::new("docs", "TestDoc").back_populates("tags"),
            }
        }
    }

    crate::impl_document!(TagDoc {
        fields: [],
        relationships: [docs],
    });

    /// Scalar-only document with a custom primary key.
    pub struct Measurement {
        pub meta: DocumentMeta,
        pub key: Field<UuidType>,
        pub value: Field<Float>,
        pub taken_at: Field<DateTime>,
    }

    impl Default for Measurement {
        fn default() -> Self {
            Measurement {
                meta: DocumentMeta::new(),
                key: Field::primary_key("key"),
                value: Field::new("value"),
                taken_at: Field::new("taken_at"),
            }
        }
    }

    crate::impl_document!(Measurement {
        fields: [key, value, taken_at],
        relationships: [],
    });
}
