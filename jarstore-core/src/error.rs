use thiserror::Error;

/// Errors raised by the persistent-object kernel and by jars.
#[derive(Error, Debug)]
pub enum Error {
    /// The object is not attached well enough for the operation (missing jar
    /// or oid, ghost state, no attribute storage).
    #[error("Integrity error: {0}")]
    Integrity(String),
    /// A typed setter was handed a value of the wrong shape.
    #[error("Validation error: {0}")]
    Validation(String),
    /// A jar could not find the requested object or annotation.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Opaque failure from the storage behind a jar.
    #[error("Jar error: {0}")]
    Jar(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Wrap a storage error so it can cross the [`Jar`](crate::Jar) boundary.
    pub fn jar(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Jar(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
