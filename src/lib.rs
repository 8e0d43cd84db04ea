//! Unit-of-work document mapper for Rust, with an in-memory and a
//! Postgres backend.

pub mod backend;
pub mod cascade;
pub mod changeset;
pub mod commit_order;
pub mod context;
mod error;
mod graph;
mod hydrator;
pub mod identity;
pub mod metadata;
pub mod metrics;
pub mod object;
pub mod path;
pub mod persister;
pub mod session;
pub mod store;
pub mod testing;
pub mod value;

pub use backend::{DocumentStore, MemoryStore, PostgresStore};
pub use changeset::{ChangeSet, CollectionChange, FieldChange};
pub use context::{SessionContext, SessionOptions};
pub use error::{ConflictKind, Error, Result, WithContext};
pub use identity::{LockMode, ObjectState};
pub use metadata::{
    Association, Cascade, CascadeOp, ClassMetadata, CollectionStrategy, FieldType, IdStrategy,
    MetadataRegistry, ReferenceStorage,
};
pub use object::ObjectId;
pub use session::{DocumentSession, FlushReport};
pub use store::Store;
pub use value::{Identifier, Value};

pub mod prelude {
    pub use crate::{
        Association, Cascade, ClassMetadata, CollectionStrategy, DocumentSession, FieldType,
        IdStrategy, Identifier, LockMode, MetadataRegistry, ObjectId, Result, Store, Value,
    };
}
