use crate::document::{Model, ModelDescriptor};
use crate::error::{NoFearDbError, Result};
use std::collections::{HashMap, HashSet};

/// Document types known to an engine, keyed by type name.
#[derive(Debug, Default, Clone)]
pub(crate) struct Registry {
    models: HashMap<&'static str, ModelDescriptor>,
}

impl Registry {
    pub fn get(&self, type_name: &str) -> Option<&ModelDescriptor> {
        self.models.get(type_name)
    }

    /// Look up a type that a document or a stored reference names.
    pub fn require(&self, type_name: &str) -> Result<&ModelDescriptor> {
        self.get(type_name).ok_or_else(|| {
            NoFearDbError::Config(format!("document type '{type_name}' is not registered"))
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Validate every descriptor against the others, then add them all. Nothing is added if any
    /// of them is rejected.
    pub fn register(&mut self, descriptors: &[ModelDescriptor]) -> Result<Vec<&'static str>> {
        let mut merged = self.models.clone();
        let mut added = Vec::new();

        for descriptor in descriptors {
            match merged.get(descriptor.type_name()) {
                Some(existing) if existing.type_id() == descriptor.type_id() => continue,
                Some(_) => {
                    return Err(NoFearDbError::Config(format!(
                        "another type named '{}' is already registered",
                        descriptor.type_name()
                    )))
                }
                None => {}
            }
            if let Some(clash) = merged
                .values()
                .find(|d| d.document_name() == descriptor.document_name())
            {
                return Err(NoFearDbError::Config(format!(
                    "{} and {} both store documents under '{}'",
                    clash.type_name(),
                    descriptor.type_name(),
                    descriptor.document_name()
                )));
            }
            validate_shape(descriptor)?;
            merged.insert(descriptor.type_name(), descriptor.clone());
            added.push(descriptor.type_name());
        }

        validate_back_references(&merged)?;
        self.models = merged;
        Ok(added)
    }
}

fn invalid(type_name: &str, message: String) -> NoFearDbError {
    NoFearDbError::Validation(format!("{type_name}: {message}"))
}

/// Checks that only need the type itself.
fn validate_shape(descriptor: &ModelDescriptor) -> Result<()> {
    let sample = descriptor.instantiate();
    let type_name = descriptor.type_name();

    if sample.type_name() != type_name {
        return Err(invalid(
            type_name,
            format!("instances report type name '{}'", sample.type_name()),
        ));
    }
    let document_name = descriptor.document_name();
    if document_name.is_empty()
        || document_name.starts_with('.')
        || document_name.contains(['/', '\\'])
    {
        return Err(invalid(
            type_name,
            format!("'{document_name}' is not a valid directory name"),
        ));
    }

    let mut names = HashSet::new();
    let mut primary_keys = 0;
    for field in sample.fields() {
        if field.name() == "id" {
            return Err(invalid(type_name, "'id' is reserved for the identity".into()));
        }
        if !names.insert(field.name()) {
            return Err(invalid(type_name, format!("duplicate name '{}'", field.name())));
        }
        if field.is_primary_key() {
            primary_keys += 1;
            if field.type_name() != "uuid" {
                return Err(invalid(
                    type_name,
                    format!(
                        "primary key '{}' must be a uuid, not {}",
                        field.name(),
                        field.type_name()
                    ),
                ));
            }
            if field.is_nullable() {
                return Err(invalid(
                    type_name,
                    format!("primary key '{}' cannot be nullable", field.name()),
                ));
            }
        }
    }
    if primary_keys > 1 {
        return Err(invalid(type_name, "more than one primary key".into()));
    }

    for rel in sample.relationships() {
        if rel.name() == "id" {
            return Err(invalid(type_name, "'id' is reserved for the identity".into()));
        }
        if !names.insert(rel.name()) {
            return Err(invalid(type_name, format!("duplicate name '{}'", rel.name())));
        }
    }
    Ok(())
}

/// Every `back_populates` pair between registered types must mirror each other.
fn validate_back_references(models: &HashMap<&'static str, ModelDescriptor>) -> Result<()> {
    let samples: HashMap<&str, Box<dyn Model>> = models
        .iter()
        .map(|(name, descriptor)| (*name, descriptor.instantiate()))
        .collect();

    for (type_name, sample) in &samples {
        for rel in sample.relationships() {
            let Some(back) = rel.back_populates() else {
                continue;
            };
            let Some(target) = samples.get(rel.target()) else {
                continue;
            };
            let Some(mirror) = target.relationship(back) else {
                return Err(invalid(
                    type_name,
                    format!(
                        "'{}' back-populates {}.{}, which does not exist",
                        rel.name(),
                        rel.target(),
                        back
                    ),
                ));
            };
            if mirror.target() != *type_name || mirror.back_populates() != Some(rel.name()) {
                return Err(invalid(
                    type_name,
                    format!(
                        "'{}' and {}.{} do not back-populate each other",
                        rel.name(),
                        rel.target(),
                        back
                    ),
                ));
            }
            if mirror.kind() != rel.kind().inverse() {
                return Err(invalid(
                    type_name,
                    format!(
                        "'{}' is {} but {}.{} is {}",
                        rel.name(),
                        rel.kind(),
                        rel.target(),
                        back,
                        mirror.kind()
                    ),
                ));
            }
        }
    }
    Ok(())
}
