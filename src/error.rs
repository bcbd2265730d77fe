use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UmbraError>;

/// Errors surfaced by the storage engine.
///
/// `Serialization` is the only error a well-behaved caller is expected to
/// handle by retrying the transaction; the durability and recovery variants
/// are fatal to the operation that raised them but not to the storage
/// instance.
#[derive(Debug, Error)]
pub enum UmbraError {
    #[error("serialization conflict, transaction must retry")]
    Serialization,
    #[error("object does not exist")]
    NonexistentObject,
    #[error("object was deleted")]
    DeletedObject,
    #[error("vertex has edges and must be detach deleted")]
    VertexHasEdges,
    #[error("edge properties are disabled")]
    PropertiesDisabled,
    #[error("wrong property value type: {0}")]
    WrongType(#[from] PropertyValueError),
    #[error("durability error: {0}")]
    Durability(String),
    #[error("recovery error: {0}")]
    Recovery(String),
    #[error("replication error: {0}")]
    Replication(String),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Raised by typed [`crate::storage::PropertyValue`] accessors when the
/// stored kind does not match the requested one. Reaching this is a caller
/// bug, not a storage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PropertyValueError {
    #[error("value is not of the requested type")]
    WrongType,
}
