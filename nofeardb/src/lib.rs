pub mod config;
pub mod datatypes;
pub mod document;
pub mod engine;
pub mod error;
pub mod lock;
pub mod query;

pub use config::EngineConfig;
pub use datatypes::Value;
pub use document::{
    DocHandle, Document, DocumentGraph, DocumentMeta, DocumentStatus, Field, ManyToMany,
    ManyToOne, Model, ModelDescriptor, OneToMany, PersistableField, PersistableRelationship,
    RelationshipKind,
};
pub use engine::StorageEngine;
pub use error::{NoFearDbError, Result};
pub use lock::{DocumentLock, LockInfo};
pub use query::{Expr, QueryFilter};
