use std::fmt;

use thiserror::Error;

/// Why a conditional write matched no document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// The stored version no longer equals the version this session loaded.
    Version { expected: i64 },
    /// Another holder set the lock marker on the document.
    Locked,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Version { expected } => write!(f, "expected version {expected}"),
            ConflictKind::Locked => f.write_str("document is locked"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("concurrency conflict on {class} `{id}`: {kind}")]
    ConcurrencyConflict {
        class: String,
        id: String,
        kind: ConflictKind,
    },
    #[error("{class} object is not managed by this session")]
    UnmanagedObject { class: String },
    #[error("detached {class} object cannot be persisted; merge it instead")]
    DetachedObject { class: String },
    #[error("new {class} object found through `{owner}.{field}`, which does not cascade persist")]
    NewObjectThroughRelationship {
        owner: String,
        field: String,
        class: String,
    },
    #[error("unresolvable insert order cycle: {}", classes.join(" -> "))]
    CascadeCycle { classes: Vec<String> },
    #[error("identifier of {class} `{id}` cannot be reassigned")]
    IdentifierReassignment { class: String, id: String },
    #[error("shard key `{field}` of {class} `{id}` cannot change after insert")]
    ShardKeyImmutable {
        class: String,
        id: String,
        field: String,
    },
    #[error("strategy `{strategy}` on `{class}.{path}` is only allowed on a top-level collection field")]
    CollectionStrategyPlacement {
        class: String,
        path: String,
        strategy: String,
    },
    #[error("identity {class} `{id}` is already managed by another object")]
    IdentityConflict { class: String, id: String },
    #[error("{class} needs an identifier before it can be persisted")]
    MissingIdentifier { class: String },
    #[error("{class} `{id}` is not loaded")]
    NotLoaded { class: String, id: String },
    #[error("document not found")]
    DocNotFound,
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("unknown field `{class}.{field}`")]
    UnknownField { class: String, field: String },
    #[error("invalid value for `{field}`: {detail}")]
    InvalidValue { field: String, detail: String },
    #[error("mapping error: {0}")]
    Mapping(String),
    #[error("constraint violation on `{constraint}`: {detail}")]
    ConstraintViolation { constraint: String, detail: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// True for the errors a caller may resolve by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::ConcurrencyConflict { .. } => true,
            Error::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
