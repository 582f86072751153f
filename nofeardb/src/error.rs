use thiserror::Error;

#[derive(Error, Debug)]
pub enum NoFearDbError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid document state: {0}")]
    State(String),

    #[error("Document collision: {collection}/{id}")]
    Collision { collection: String, id: String },

    #[error("Document is locked: {path}")]
    LockConflict { path: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Glob error: {0}")]
    Glob(String),
}

pub type Result<T> = std::result::Result<T, NoFearDbError>;
