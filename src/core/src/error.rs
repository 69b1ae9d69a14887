use thiserror::Error;

/// Errors surfaced by the graph store and its collaborators.
#[derive(Error, Debug)]
pub enum GraphError {
    /// No image resolves to the given id or prefix.
    #[error("no such image: {0}")]
    NotFound(String),

    /// A truncated id matches more than one stored image.
    #[error("ambiguous id prefix '{0}' matches multiple images")]
    AmbiguousPrefix(String),

    /// Registration of an id that is already present.
    #[error("image {0} already exists")]
    AlreadyExists(String),

    /// The id does not satisfy the syntactic id rule.
    #[error("invalid image id '{0}': expected 64 lowercase hex characters")]
    InvalidId(String),

    /// Malformed input: bad manifest, bad archive entry, bad bundle layout.
    #[error("{0}")]
    Malformed(String),

    /// The metadata stored under an id directory carries a different id.
    #[error("image stored at '{path}' has wrong id '{found}'")]
    WrongId { path: String, found: String },

    /// Surfaced verbatim from the copy-on-write driver.
    #[error("driver error: {0}")]
    Driver(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    /// Whether this error means "the thing looked up does not exist".
    ///
    /// Callers branch on this to distinguish a missing image from a real
    /// failure, so every boundary that can produce a not-found condition
    /// (index, filesystem, driver) must map onto it.
    pub fn is_not_found(&self) -> bool {
        match self {
            GraphError::NotFound(_) => true,
            GraphError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Serialization(err.to_string())
    }
}

/// Result type alias for graph store operations.
pub type Result<T> = std::result::Result<T, GraphError>;
