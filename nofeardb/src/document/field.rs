use super::DocumentMeta;
use crate::datatypes::{DataType, Value};
use crate::error::{NoFearDbError, Result};
use std::marker::PhantomData;
use uuid::Uuid;

/// A typed scalar slot on a document.
#[derive(Debug, Clone)]
pub struct Field<D: DataType> {
    name: &'static str,
    primary_key: bool,
    nullable: bool,
    value: Option<D::Value>,
    snapshot: Option<Option<D::Value>>,
    _type: PhantomData<D>,
}

impl<D: DataType> Field<D> {
    /// A nullable field.
    pub fn new(name: &'static str) -> Self {
        Field {
            name,
            primary_key: false,
            nullable: true,
            value: None,
            snapshot: None,
            _type: PhantomData,
        }
    }

    /// A field that rejects null values.
    pub fn required(name: &'static str) -> Self {
        Field {
            nullable: false,
            ..Self::new(name)
        }
    }

    /// A field that overrides the document identity. Must be of the UUID datatype.
    pub fn primary_key(name: &'static str) -> Self {
        Field {
            primary_key: true,
            nullable: false,
            ..Self::new(name)
        }
    }

    pub fn get(&self) -> Option<&D::Value> {
        self.value.as_ref()
    }

    /// Set the value, recording the change on the owning document.
    pub fn set(&mut self, meta: &mut DocumentMeta, value: Option<D::Value>) -> Result<()> {
        let Some(new_value) = value else {
            if !self.nullable {
                return Err(NoFearDbError::Validation(format!(
                    "field '{}' is not nullable",
                    self.name
                )));
            }
            meta.ensure_mutable()?;
            self.value = None;
            meta.record_field_change(self.name);
            return Ok(());
        };

        if self.primary_key {
            let Value::Uuid(id) = D::to_value(&new_value) else {
                return Err(NoFearDbError::Validation(format!(
                    "primary key field '{}' must be a uuid, not {}",
                    self.name,
                    D::NAME
                )));
            };
            meta.ensure_mutable()?;
            if meta.status() != super::DocumentStatus::New && meta.id() != id {
                return Err(NoFearDbError::State(format!(
                    "cannot change the identity of persisted document {}",
                    meta.id()
                )));
            }
            meta.set_id(id);
            self.value = Some(new_value);
            return Ok(());
        }

        meta.ensure_mutable()?;
        self.value = Some(new_value);
        meta.record_field_change(self.name);
        Ok(())
    }
}

/// Type-erased access to a [`Field`], used by the engine for (de)serialization.
pub trait PersistableField: Send {
    fn name(&self) -> &'static str;

    fn type_name(&self) -> &'static str;

    fn is_primary_key(&self) -> bool;

    fn is_nullable(&self) -> bool;

    fn is_set(&self) -> bool;

    fn value(&self) -> Value;

    /// Serialized form stored in the document file: the datatype string, or null.
    fn to_json(&self) -> serde_json::Value;

    /// Load a stored value without change tracking.
    fn load_json(&mut self, raw: &serde_json::Value) -> Result<()>;

    /// Load the document identity into a primary-key field.
    fn load_identity(&mut self, id: Uuid) -> Result<()>;

    fn create_snapshot(&mut self);

    fn reset(&mut self);
}

impl<D: DataType> PersistableField for Field<D> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn type_name(&self) -> &'static str {
        D::NAME
    }

    fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    fn is_nullable(&self) -> bool {
        self.nullable
    }

    fn is_set(&self) -> bool {
        self.value.is_some()
    }

    fn value(&self) -> Value {
        self.value.as_ref().map(D::to_value).unwrap_or(Value::Null)
    }

    fn to_json(&self) -> serde_json::Value {
        match &self.value {
            Some(v) => serde_json::Value::String(D::serialize(v)),
            None => serde_json::Value::Null,
        }
    }

    fn load_json(&mut self, raw: &serde_json::Value) -> Result<()> {
        self.value = match raw {
            serde_json::Value::Null if self.nullable => None,
            serde_json::Value::Null => {
                return Err(NoFearDbError::Validation(format!(
                    "stored value of field '{}' is null but the field is not nullable",
                    self.name
                )))
            }
            serde_json::Value::String(s) => Some(D::deserialize(s)?),
            other => Some(D::cast(other)?),
        };
        Ok(())
    }

    fn load_identity(&mut self, id: Uuid) -> Result<()> {
        self.value = Some(D::cast(&serde_json::Value::String(id.to_string()))?);
        Ok(())
    }

    fn create_snapshot(&mut self) {
        self.snapshot = Some(self.value.clone());
    }

    fn reset(&mut self) {
        if let Some(saved) = &self.snapshot {
            self.value = saved.clone();
        }
    }
}
