mod common;

use anyhow::Result;
use rillodm::{
    Error, ObjectState, Value,
    backend::{FieldOp, Operation},
    path::FieldPath,
};
use serde_json::json;

#[tokio::test]
async fn identity_map_returns_one_instance_per_document() -> Result<()> {
    let (store, _backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("uuid assigned at persist");

    assert_eq!(session.find("User", id.clone()).await?, Some(user));

    let mut other = store.session();
    let first = other.find("User", id.clone()).await?.expect("stored");
    let second = other.find("User", id).await?.expect("stored");
    assert_eq!(first, second);
    assert_eq!(other.identity_map().len(), 1);
    assert_eq!(other.get(first, "name")?, &Value::from("ada"));
    Ok(())
}

#[tokio::test]
async fn second_flush_without_changes_writes_nothing() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    let address = session.create("Address")?;
    session.set(address, "city", "Lyon")?;
    session.set(user, "address", Value::Embedded(address))?;
    let phone = session.create("Phone")?;
    session.set(phone, "number", "1")?;
    session.push(user, "phones", phone)?;
    session.persist(user).await?;

    let report = session.flush().await?;
    assert_eq!(report.inserted, 1);
    assert_eq!(session.state(user), Some(ObjectState::Managed));
    assert_eq!(session.state(address), Some(ObjectState::Managed));

    backend.clear_operations();
    let report = session.flush().await?;
    assert!(report.is_empty());
    assert!(backend.operations().is_empty());

    let mut reloaded = store.session();
    let id = session.identifier(user).expect("assigned");
    let loaded = reloaded.find("User", id).await?.expect("stored");
    backend.clear_operations();
    assert!(reloaded.flush().await?.is_empty());
    assert!(backend.operations().is_empty());
    assert_eq!(reloaded.elements(loaded, "phones")?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn update_sets_only_changed_fields() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    session.set(user, "email", "ada@example.com")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    let mut session = store.session();
    let user = session.find("User", id.clone()).await?.expect("stored");
    session.set(user, "name", "ada")?;
    assert!(session.change_set(user)?.is_empty());

    session.set(user, "name", "grace")?;
    let change_set = session.change_set(user)?;
    assert_eq!(change_set.fields().collect::<Vec<_>>(), vec!["name"]);

    backend.clear_operations();
    let report = session.flush().await?;
    assert_eq!(report.updated, 1);
    let ops = common::single_update(&backend.operations());
    assert_eq!(common::paths(&ops), vec!["name", "version"]);
    assert_eq!(ops[0], FieldOp::Set(FieldPath::root("name"), json!("grace")));

    let stored = backend.get_raw("users", &id.to_json()).expect("stored");
    assert_eq!(stored["name"], json!("grace"));
    assert_eq!(stored["email"], json!("ada@example.com"));
    assert_eq!(stored["version"], json!(2));
    assert_eq!(session.get(user, "version")?, &Value::Int(2));
    Ok(())
}

#[tokio::test]
async fn setting_a_field_to_null_unsets_it() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "email", "a@b.c")?;
    session.persist(user).await?;
    session.flush().await?;

    backend.clear_operations();
    session.set(user, "email", Value::Null)?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(ops[0], FieldOp::Unset(FieldPath::root("email")));

    let id = session.identifier(user).expect("assigned");
    let stored = backend.get_raw("users", &id.to_json()).expect("stored");
    assert!(stored.get("email").is_none());
    Ok(())
}

#[tokio::test]
async fn embedded_changes_are_written_at_their_nested_path() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let address = session.create("Address")?;
    session.set(address, "street", "Main")?;
    session.set(address, "city", "Lyon")?;
    session.set(user, "address", Value::Embedded(address))?;
    session.persist(user).await?;
    session.flush().await?;

    backend.clear_operations();
    session.set(address, "city", "Paris")?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops[0],
        FieldOp::Set(FieldPath::from("address.city"), json!("Paris"))
    );

    // Same content under a new handle is not a change.
    let copy = session.create("Address")?;
    session.set(copy, "street", "Main")?;
    session.set(copy, "city", "Paris")?;
    session.set(user, "address", Value::Embedded(copy))?;
    backend.clear_operations();
    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());

    let moved = session.create("Address")?;
    session.set(moved, "city", "Oslo")?;
    session.set(user, "address", Value::Embedded(moved))?;
    backend.clear_operations();
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops[0],
        FieldOp::Set(FieldPath::root("address"), json!({ "city": "Oslo" }))
    );
    Ok(())
}

#[tokio::test]
async fn collection_changes_issue_one_update_per_flush() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let mut phones = Vec::new();
    for number in ["1", "2", "3"] {
        let phone = session.create("Phone")?;
        session.set(phone, "number", number)?;
        phones.push(phone);
    }
    session.push(user, "phones", phones[0])?;
    session.push(user, "phones", phones[1])?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    backend.clear_operations();
    session.remove_element(user, "phones", phones[0])?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(ops[0], FieldOp::PullAt(FieldPath::root("phones"), vec![0]));
    assert_eq!(session.state(phones[0]), None);

    backend.clear_operations();
    session.push(user, "phones", phones[2])?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops[0],
        FieldOp::Push(FieldPath::root("phones"), vec![json!({ "number": "3" })])
    );

    let stored = backend.get_raw("users", &id.to_json()).expect("stored");
    assert_eq!(
        stored["phones"],
        json!([{ "number": "2" }, { "number": "3" }])
    );
    Ok(())
}

#[tokio::test]
async fn reordering_or_clearing_rewrites_the_array() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let a = session.create("Phone")?;
    let b = session.create("Phone")?;
    session.set(a, "number", "a")?;
    session.set(b, "number", "b")?;
    session.push(user, "phones", a)?;
    session.push(user, "phones", b)?;
    session.persist(user).await?;
    session.flush().await?;

    backend.clear_operations();
    session.remove_element(user, "phones", a)?;
    session.push(user, "phones", a)?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops[0],
        FieldOp::Set(
            FieldPath::root("phones"),
            json!([{ "number": "b" }, { "number": "a" }])
        )
    );

    backend.clear_operations();
    session.clear_collection(user, "phones")?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(ops[0], FieldOp::Set(FieldPath::root("phones"), json!([])));
    Ok(())
}

#[tokio::test]
async fn changed_collection_element_is_set_in_place() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let a = session.create("Phone")?;
    let b = session.create("Phone")?;
    session.set(a, "number", "a")?;
    session.set(b, "number", "b")?;
    session.push(user, "phones", a)?;
    session.push(user, "phones", b)?;
    session.persist(user).await?;
    session.flush().await?;

    backend.clear_operations();
    session.set(b, "number", "b2")?;
    session.flush().await?;
    let ops = common::single_update(&backend.operations());
    assert_eq!(
        ops[0],
        FieldOp::Set(FieldPath::from("phones.1.number"), json!("b2"))
    );
    Ok(())
}

#[tokio::test]
async fn refresh_discards_local_changes() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    let mut stored = backend.get_raw("users", &id.to_json()).expect("stored");
    stored.insert("name".into(), json!("from elsewhere"));
    stored.insert("version".into(), json!(2));
    backend.put_raw("users", stored);

    session.set(user, "name", "local")?;
    session.refresh(user).await?;
    assert_eq!(session.get(user, "name")?, &Value::from("from elsewhere"));
    assert_eq!(session.get(user, "version")?, &Value::Int(2));

    backend.clear_operations();
    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn detached_changes_come_back_through_merge() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    session.detach(user)?;
    assert_eq!(session.state(user), Some(ObjectState::Detached));
    assert!(session.identity_map().is_empty());
    assert!(matches!(
        session.persist(user).await,
        Err(Error::DetachedObject { .. })
    ));

    session.set(user, "name", "grace")?;
    let managed = session.merge(user).await?;
    assert_ne!(managed, user);
    assert_eq!(session.state(managed), Some(ObjectState::Managed));
    assert_eq!(session.get(managed, "name")?, &Value::from("grace"));
    assert_eq!(session.find("User", id.clone()).await?, Some(managed));

    backend.clear_operations();
    let report = session.flush().await?;
    assert_eq!(report.updated, 1);
    let stored = backend.get_raw("users", &id.to_json()).expect("stored");
    assert_eq!(stored["name"], json!("grace"));
    Ok(())
}

#[tokio::test]
async fn merging_an_unknown_object_schedules_an_insert() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "new")?;

    let managed = session.merge(user).await?;
    assert_ne!(managed, user);
    assert_eq!(session.state(user), None);
    assert_eq!(session.state(managed), Some(ObjectState::New));

    let report = session.flush().await?;
    assert_eq!(report.inserted, 1);
    assert_eq!(backend.documents("users").len(), 1);
    Ok(())
}

#[tokio::test]
async fn read_only_documents_are_inserted_but_never_updated() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();

    let report = session.create("Report")?;
    session.set(report, "title", "q1")?;
    assert!(matches!(
        session.persist(report).await,
        Err(Error::MissingIdentifier { .. })
    ));

    session.set(report, "id", "r-1")?;
    session.persist(report).await?;
    session.flush().await?;

    backend.clear_operations();
    session.set(report, "title", "q2")?;
    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());

    let user = session.create("User")?;
    session.persist(user).await?;
    session.flush().await?;
    session.mark_read_only(user)?;
    session.set(user, "name", "ignored")?;
    backend.clear_operations();
    session.flush().await?;
    assert!(backend.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn references_load_lazily() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let boss = session.create("User")?;
    session.set(boss, "name", "boss")?;
    let user = session.create("User")?;
    session.set(user, "manager", Value::Reference(boss))?;
    session.persist(boss).await?;
    session.persist(user).await?;
    session.flush().await?;
    let user_id = session.identifier(user).expect("assigned");
    let boss_id = session.identifier(boss).expect("assigned");

    let stored = backend.get_raw("users", &user_id.to_json()).expect("stored");
    assert_eq!(stored["manager"], boss_id.to_json());

    let mut session = store.session();
    let user = session.find("User", user_id).await?.expect("stored");
    let Value::Reference(manager) = session.get(user, "manager")?.clone() else {
        panic!("manager is a reference");
    };
    assert!(!session.is_loaded(manager));
    assert!(matches!(
        session.get(manager, "name"),
        Err(Error::NotLoaded { .. })
    ));

    session.ensure_loaded(manager).await?;
    assert_eq!(session.get(manager, "name")?, &Value::from("boss"));
    assert_eq!(session.find("User", boss_id).await?, Some(manager));

    let missing = session.get_reference("User", uuid::Uuid::new_v4())?;
    assert!(matches!(
        session.ensure_loaded(missing).await,
        Err(Error::DocNotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn removing_a_new_object_writes_nothing() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.persist(user).await?;
    session.remove(user).await?;
    assert_eq!(session.state(user), None);

    assert!(session.flush().await?.is_empty());
    assert!(backend.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn removed_documents_are_deleted_and_forgotten() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    session.remove(user).await?;
    assert_eq!(session.state(user), Some(ObjectState::Removed));
    assert_eq!(session.find("User", id.clone()).await?, None);

    let report = session.flush().await?;
    assert_eq!(report.removed, 1);
    assert!(backend.get_raw("users", &id.to_json()).is_none());
    assert!(matches!(
        backend.operations().last(),
        Some(Operation::Delete { matched: 1, .. })
    ));
    assert_eq!(session.state(user), None);
    Ok(())
}

#[tokio::test]
async fn managed_identifier_cannot_be_reassigned() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    session.persist(user).await?;
    session.flush().await?;
    let id = session.identifier(user).expect("assigned");

    backend.clear_operations();
    session.set(user, "id", uuid::Uuid::new_v4())?;
    session.set(user, "name", "grace")?;
    let err = session.flush().await.unwrap_err();
    match err {
        Error::IdentifierReassignment { class, id: reported } => {
            assert_eq!(class, "User");
            assert_eq!(reported, id.to_string());
        }
        other => panic!("expected an identifier error, got {other:?}"),
    }
    assert!(backend.operations().is_empty());
    assert!(matches!(
        session.change_set(user),
        Err(Error::IdentifierReassignment { .. })
    ));

    session.set(user, "id", id.clone())?;
    assert_eq!(session.flush().await?.updated, 1);
    let stored = backend.get_raw("users", &id.to_json()).expect("stored");
    assert_eq!(stored["name"], json!("grace"));
    Ok(())
}
