mod common;

use anyhow::Result;
use rillodm::{
    Association, ClassMetadata, CollectionStrategy, Error, FieldType, IdStrategy,
    MetadataRegistry,
    backend::{FieldOp, Operation, Write},
    path::FieldPath,
};
use serde_json::json;

#[test]
fn atomic_strategy_below_the_top_level_is_rejected_at_build() {
    let err = MetadataRegistry::builder()
        .class(
            ClassMetadata::document("Catalog", "catalogs")
                .id("id", IdStrategy::Uuid)
                .embed_one("section", Association::to("Section")),
        )
        .class(ClassMetadata::embedded("Section").embed_many(
            "items",
            Association::to("Item").strategy(CollectionStrategy::AtomicSetArray),
        ))
        .class(ClassMetadata::embedded("Item").field("name", FieldType::String))
        .build()
        .unwrap_err();
    match err {
        Error::CollectionStrategyPlacement { strategy, .. } => {
            assert_eq!(strategy, "atomicSetArray");
        }
        other => panic!("expected a placement error, got {other:?}"),
    }
}

#[tokio::test]
async fn atomic_collection_rewrites_the_whole_document() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let order = session.create("Order")?;
    session.set(order, "region", "eu")?;
    session.persist(order).await?;
    session.flush().await?;
    let id = session.identifier(order).expect("assigned");

    backend.clear_operations();
    let line = session.create("Line")?;
    session.set(line, "sku", "A-1")?;
    session.set(line, "qty", 2)?;
    session.push(order, "lines", line)?;
    session.set(order, "total", 5.0)?;
    let report = session.flush().await?;
    assert_eq!(report.updated, 1);

    let ops = backend.operations();
    assert_eq!(ops.len(), 1);
    let Operation::Update {
        write: Write::Replace(document),
        ..
    } = &ops[0]
    else {
        panic!("expected a whole-document write, got {ops:?}");
    };
    assert_eq!(document["lines"], json!([{ "sku": "A-1", "qty": 2 }]));
    assert_eq!(document["total"], json!(5.0));
    assert_eq!(document["region"], json!("eu"));
    assert_eq!(document["version"], json!(2));

    let stored = backend.get_raw("orders", &id.to_json()).expect("stored");
    assert_eq!(stored["_id"], id.to_json());
    assert_eq!(stored["lines"], json!([{ "sku": "A-1", "qty": 2 }]));

    backend.clear_operations();
    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn add_to_set_appends_only_new_values() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let board = session.create("Board")?;
    let first = session.create("Label")?;
    session.set(first, "text", "bug")?;
    let duplicate = session.create("Label")?;
    session.set(duplicate, "text", "bug")?;
    assert!(session.push(board, "labels", first)?);
    assert!(!session.push(board, "labels", duplicate)?);
    session.persist(board).await?;
    session.flush().await?;

    backend.clear_operations();
    let second = session.create("Label")?;
    session.set(second, "text", "ui")?;
    assert!(session.push(board, "labels", second)?);
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops,
        vec![FieldOp::AddToSet(
            FieldPath::root("labels"),
            vec![json!({ "text": "ui" })]
        )]
    );
    Ok(())
}

#[tokio::test]
async fn set_strategy_writes_the_whole_array() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let alice = session.create("User")?;
    let bob = session.create("User")?;
    let board = session.create("Board")?;
    session.push(board, "members", alice)?;
    session.persist(alice).await?;
    session.persist(bob).await?;
    session.persist(board).await?;
    session.flush().await?;
    let alice_id = session.identifier(alice).expect("assigned");
    let bob_id = session.identifier(bob).expect("assigned");

    backend.clear_operations();
    session.push(board, "members", bob)?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops,
        vec![FieldOp::Set(
            FieldPath::root("members"),
            json!([alice_id.to_json(), bob_id.to_json()])
        )]
    );
    Ok(())
}

#[tokio::test]
async fn add_to_set_insert_skips_an_equal_element() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let board = session.create("Board")?;
    let label = session.create("Label")?;
    session.set(label, "text", "x")?;
    session.push(board, "labels", label)?;
    session.persist(board).await?;
    session.flush().await?;
    let id = session.identifier(board).expect("assigned");

    backend.clear_operations();
    let twin = session.create("Label")?;
    session.set(twin, "text", "x")?;
    assert!(!session.insert_element(board, "labels", 0, twin)?);
    assert_eq!(session.elements(board, "labels")?, &[label]);
    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());

    let other = session.create("Label")?;
    session.set(other, "text", "y")?;
    assert!(session.insert_element(board, "labels", 0, other)?);
    session.flush().await?;
    let stored = backend.get_raw("boards", &id.to_json()).expect("stored");
    assert_eq!(stored["labels"], json!([{ "text": "y" }, { "text": "x" }]));
    Ok(())
}
