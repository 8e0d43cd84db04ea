#![allow(dead_code)]

use std::sync::Arc;

use rillodm::{
    Association, Cascade, ClassMetadata, CollectionStrategy, FieldType, IdStrategy, MemoryStore,
    MetadataRegistry, Store,
    backend::{FieldOp, Operation, Write},
};

pub fn registry() -> MetadataRegistry {
    MetadataRegistry::builder()
        .class(
            ClassMetadata::document("User", "users")
                .id("id", IdStrategy::Uuid)
                .field("name", FieldType::String)
                .field("email", FieldType::String)
                .version("version")
                .embed_one("address", Association::to("Address"))
                .embed_many("phones", Association::to("Phone"))
                .reference_many("groups", Association::to("Group").cascade(Cascade::PERSIST))
                .reference_one("manager", Association::to("User")),
        )
        .class(
            ClassMetadata::embedded("Address")
                .field("street", FieldType::String)
                .field("city", FieldType::String),
        )
        .class(ClassMetadata::embedded("Phone").field("number", FieldType::String))
        .class(
            ClassMetadata::document("Group", "groups")
                .id("id", IdStrategy::Uuid)
                .field("name", FieldType::String),
        )
        .class(
            ClassMetadata::document("Order", "orders")
                .id("id", IdStrategy::Increment)
                .field("region", FieldType::String)
                .field("total", FieldType::Float)
                .shard_key(["region"])
                .version("version")
                .lock("locked")
                .embed_many(
                    "lines",
                    Association::to("Line").strategy(CollectionStrategy::AtomicSet),
                ),
        )
        .class(
            ClassMetadata::embedded("Line")
                .field("sku", FieldType::String)
                .field("qty", FieldType::Int),
        )
        .class(
            ClassMetadata::document("Project", "projects")
                .id("id", IdStrategy::Uuid)
                .field("name", FieldType::String)
                .reference_many(
                    "tasks",
                    Association::to("Task").cascade(Cascade::ALL).orphan_removal(),
                )
                .reference_one(
                    "lead",
                    Association::to("Task").cascade(Cascade::PERSIST).orphan_removal(),
                ),
        )
        .class(
            ClassMetadata::document("Task", "tasks")
                .id("id", IdStrategy::Uuid)
                .field("title", FieldType::String),
        )
        .class(
            ClassMetadata::document("Author", "authors")
                .id("id", IdStrategy::Uuid)
                .field("name", FieldType::String)
                .reference_one("book", Association::to("Book").cascade(Cascade::ALL)),
        )
        .class(
            ClassMetadata::document("Book", "books")
                .id("id", IdStrategy::Uuid)
                .field("title", FieldType::String)
                .reference_one("author", Association::to("Author").cascade(Cascade::ALL)),
        )
        .class(
            ClassMetadata::document("Left", "lefts")
                .id("id", IdStrategy::Store)
                .reference_one("right", Association::to("Right").cascade(Cascade::PERSIST)),
        )
        .class(
            ClassMetadata::document("Right", "rights")
                .id("id", IdStrategy::Store)
                .reference_one("left", Association::to("Left").cascade(Cascade::PERSIST)),
        )
        .class(
            ClassMetadata::document("Board", "boards")
                .id("id", IdStrategy::Uuid)
                .embed_many(
                    "labels",
                    Association::to("Label").strategy(CollectionStrategy::AddToSet),
                )
                .reference_many(
                    "members",
                    Association::to("User").strategy(CollectionStrategy::Set),
                ),
        )
        .class(ClassMetadata::embedded("Label").field("text", FieldType::String))
        .class(
            ClassMetadata::document("Report", "reports")
                .id("id", IdStrategy::Manual(FieldType::String))
                .field("title", FieldType::String)
                .read_only(),
        )
        .build()
        .expect("test registry is valid")
}

pub fn store() -> (Store, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let store = Store::with_backend(registry(), backend.clone());
    (store, backend)
}

/// Field ops of the single applied update in `ops`.
pub fn single_update(ops: &[Operation]) -> Vec<FieldOp> {
    let updates: Vec<&Operation> = ops.iter().filter(|op| op.is_update()).collect();
    assert_eq!(updates.len(), 1, "expected one update, got {ops:#?}");
    match updates[0] {
        Operation::Update {
            write: Write::Fields(ops),
            ..
        } => ops.clone(),
        other => panic!("expected a field update, got {other:?}"),
    }
}

/// Paths touched by `ops`, rendered with dots.
pub fn paths(ops: &[FieldOp]) -> Vec<String> {
    ops.iter().map(|op| op.path().to_string()).collect()
}
