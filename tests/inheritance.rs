use std::sync::Arc;

use anyhow::Result;
use rillodm::{
    Association, ClassMetadata, FieldType, IdStrategy, MemoryStore, MetadataRegistry, Store,
    Value,
};
use serde_json::json;

fn registry() -> MetadataRegistry {
    MetadataRegistry::builder()
        .class(
            ClassMetadata::document("Employee", "employees")
                .id("id", IdStrategy::Uuid)
                .field("name", FieldType::String)
                .discriminator("type")
                .default_discriminator("employee")
                .discriminator_value("employee")
                .embed_one("badge", Association::to("Badge")),
        )
        .class(
            ClassMetadata::subclass("Manager", "Employee")
                .discriminator_value("manager")
                .field("reports", FieldType::Int),
        )
        .class(ClassMetadata::embedded("Badge").field("code", FieldType::String))
        .build()
        .expect("registry is valid")
}

fn store() -> (Store, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    (Store::with_backend(registry(), backend.clone()), backend)
}

#[tokio::test]
async fn subclass_is_stored_with_its_discriminator() -> Result<()> {
    let (store, backend) = store();
    let mut session = store.session();
    let manager = session.create("Manager")?;
    session.set(manager, "name", "grace")?;
    session.set(manager, "reports", 4)?;
    session.persist(manager).await?;
    session.flush().await?;

    let id = session.identifier(manager).expect("assigned");
    let stored = backend.get_raw("employees", &id.to_json()).expect("stored");
    assert_eq!(stored["type"], json!("manager"));
    assert_eq!(stored["reports"], json!(4));
    Ok(())
}

#[tokio::test]
async fn find_through_the_base_class_yields_the_concrete_class() -> Result<()> {
    let (store, _backend) = store();
    let mut session = store.session();
    let manager = session.create("Manager")?;
    session.set(manager, "reports", 2)?;
    session.persist(manager).await?;
    session.flush().await?;
    let id = session.identifier(manager).expect("assigned");

    let mut session = store.session();
    let found = session.find("Employee", id.clone()).await?.expect("stored");
    assert_eq!(session.class_of(found)?, "Manager");
    assert_eq!(session.get(found, "reports")?, &Value::Int(2));
    // One identity per root class.
    assert_eq!(session.find("Manager", id).await?, Some(found));
    Ok(())
}

#[tokio::test]
async fn find_through_an_unrelated_subclass_misses() -> Result<()> {
    let (store, _backend) = store();
    let mut session = store.session();
    let employee = session.create("Employee")?;
    session.persist(employee).await?;
    session.flush().await?;
    let id = session.identifier(employee).expect("assigned");

    let mut fresh = store.session();
    assert_eq!(fresh.find("Manager", id.clone()).await?, None);
    // Already in the identity map as an Employee.
    assert_eq!(session.find("Manager", id).await?, None);
    Ok(())
}

#[tokio::test]
async fn missing_discriminator_falls_back_to_the_default() -> Result<()> {
    let (store, backend) = store();
    let id = uuid::Uuid::new_v4();
    let raw = json!({ "_id": id.to_string(), "name": "legacy" });
    let serde_json::Value::Object(raw) = raw else {
        unreachable!()
    };
    backend.put_raw("employees", raw);

    let mut session = store.session();
    let found = session.find("Employee", id).await?.expect("stored");
    assert_eq!(session.class_of(found)?, "Employee");
    assert_eq!(session.get(found, "name")?, &Value::from("legacy"));
    Ok(())
}
