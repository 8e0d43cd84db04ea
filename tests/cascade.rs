mod common;

use anyhow::Result;
use rillodm::{Error, ObjectState, Value, backend::Operation};
use serde_json::json;

#[tokio::test]
async fn cyclic_cascade_inserts_each_document_once() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let author = session.create("Author")?;
    let book = session.create("Book")?;
    session.set(author, "book", Value::Reference(book))?;
    session.set(book, "author", Value::Reference(author))?;

    session.persist(author).await?;
    assert_eq!(session.state(book), Some(ObjectState::New));

    let report = session.flush().await?;
    assert_eq!(report.inserted, 2);
    let ops = backend.operations();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(Operation::is_insert));

    let book_id = session.identifier(book).expect("assigned");
    let author_id = session.identifier(author).expect("assigned");
    let stored = backend.get_raw("authors", &author_id.to_json()).expect("stored");
    assert_eq!(stored["book"], book_id.to_json());
    Ok(())
}

#[tokio::test]
async fn store_assigned_cycle_is_rejected_before_any_write() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let left = session.create("Left")?;
    let right = session.create("Right")?;
    session.set(left, "right", Value::Reference(right))?;
    session.set(right, "left", Value::Reference(left))?;
    session.persist(left).await?;

    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, Error::CascadeCycle { .. }));
    assert!(backend.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn referenced_store_assigned_document_is_inserted_first() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let left = session.create("Left")?;
    let right = session.create("Right")?;
    session.set(left, "right", Value::Reference(right))?;
    session.persist(left).await?;
    session.flush().await?;

    let ops = backend.operations();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].collection(), "rights");
    assert_eq!(ops[1].collection(), "lefts");

    let right_id = session.identifier(right).expect("assigned by the store");
    let left_id = session.identifier(left).expect("assigned by the store");
    let stored = backend.get_raw("lefts", &left_id.to_json()).expect("stored");
    assert_eq!(stored["right"], right_id.to_json());
    assert_eq!(session.get(left, "id")?, &left_id.to_value());
    Ok(())
}

#[tokio::test]
async fn new_object_through_plain_reference_is_rejected() -> Result<()> {
    let (store, _backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let stranger = session.create("User")?;
    session.set(user, "manager", Value::Reference(stranger))?;

    let err = session.persist(user).await.unwrap_err();
    assert!(matches!(err, Error::NewObjectThroughRelationship { .. }));
    assert_eq!(session.state(user), None);
    Ok(())
}

#[tokio::test]
async fn persist_cascade_follows_reference_collections() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let group = session.create("Group")?;
    session.set(group, "name", "admins")?;
    session.push(user, "groups", group)?;
    session.persist(user).await?;
    assert!(session.is_scheduled_for_insert(group));

    let report = session.flush().await?;
    assert_eq!(report.inserted, 2);
    let user_id = session.identifier(user).expect("assigned");
    let group_id = session.identifier(group).expect("assigned");
    let stored = backend.get_raw("users", &user_id.to_json()).expect("stored");
    assert_eq!(stored["groups"], json!([group_id.to_json()]));
    Ok(())
}

#[tokio::test]
async fn dropped_orphans_are_deleted() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let project = session.create("Project")?;
    let first = session.create("Task")?;
    let second = session.create("Task")?;
    session.push(project, "tasks", first)?;
    session.push(project, "tasks", second)?;
    session.persist(project).await?;
    session.flush().await?;
    let first_id = session.identifier(first).expect("assigned");

    session.remove_element(project, "tasks", first)?;
    let report = session.flush().await?;
    assert_eq!(report.updated, 1);
    assert_eq!(report.removed, 1);
    assert!(backend.get_raw("tasks", &first_id.to_json()).is_none());
    assert_eq!(backend.documents("tasks").len(), 1);
    assert_eq!(session.state(first), None);
    Ok(())
}

#[tokio::test]
async fn orphan_moved_to_another_owner_survives() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let from = session.create("Project")?;
    let to = session.create("Project")?;
    let task = session.create("Task")?;
    session.push(from, "tasks", task)?;
    session.persist(from).await?;
    session.persist(to).await?;
    session.flush().await?;
    let task_id = session.identifier(task).expect("assigned");

    session.remove_element(from, "tasks", task)?;
    session.push(to, "tasks", task)?;
    let report = session.flush().await?;
    assert_eq!(report.removed, 0);
    assert_eq!(report.updated, 2);
    assert!(backend.get_raw("tasks", &task_id.to_json()).is_some());
    assert_eq!(session.state(task), Some(ObjectState::Managed));
    Ok(())
}

#[tokio::test]
async fn remove_cascades_to_referenced_documents() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let project = session.create("Project")?;
    for _ in 0..2 {
        let task = session.create("Task")?;
        session.push(project, "tasks", task)?;
    }
    session.persist(project).await?;
    session.flush().await?;
    let project_id = session.identifier(project).expect("assigned");

    // Cascades also reach documents only known as lazy references.
    let mut session = store.session();
    let project = session.find("Project", project_id).await?.expect("stored");
    session.remove(project).await?;
    let report = session.flush().await?;
    assert_eq!(report.removed, 3);
    assert!(backend.documents("tasks").is_empty());
    assert!(backend.documents("projects").is_empty());
    Ok(())
}

#[tokio::test]
async fn persist_revives_a_removed_document() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    session.persist(user).await?;
    session.flush().await?;

    session.remove(user).await?;
    session.persist(user).await?;
    assert_eq!(session.state(user), Some(ObjectState::Managed));

    backend.clear_operations();
    assert!(session.flush().await?.is_empty());
    assert_eq!(backend.documents("users").len(), 1);
    Ok(())
}

#[tokio::test]
async fn reference_to_a_detached_document_fails_the_flush() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let user = session.create("User")?;
    let boss = session.create("User")?;
    session.persist(user).await?;
    session.persist(boss).await?;
    session.flush().await?;

    session.detach(boss)?;
    session.set(user, "manager", Value::Reference(boss))?;
    backend.clear_operations();
    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, Error::DetachedObject { .. }));
    assert!(backend.operations().is_empty());
    assert!(session.change_set(user)?.contains("manager"));
    Ok(())
}

#[tokio::test]
async fn nulled_orphan_reference_is_deleted() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let project = session.create("Project")?;
    let lead = session.create("Task")?;
    session.set(lead, "title", "plan")?;
    session.set(project, "lead", Value::Reference(lead))?;
    session.persist(project).await?;
    session.flush().await?;
    let project_id = session.identifier(project).expect("assigned");
    let lead_id = session.identifier(lead).expect("assigned");

    session.set(project, "lead", Value::Null)?;
    let report = session.flush().await?;
    assert_eq!(report.updated, 1);
    assert_eq!(report.removed, 1);
    assert!(backend.get_raw("tasks", &lead_id.to_json()).is_none());
    let stored = backend.get_raw("projects", &project_id.to_json()).expect("stored");
    assert!(stored.get("lead").is_none());
    assert_eq!(session.state(lead), None);
    Ok(())
}

#[tokio::test]
async fn mutually_referencing_documents_are_removed_together() -> Result<()> {
    let (store, backend) = common::store();
    let mut session = store.session();
    let right = session.create("Right")?;
    session.persist(right).await?;
    session.flush().await?;
    let left = session.create("Left")?;
    session.set(left, "right", Value::Reference(right))?;
    session.persist(left).await?;
    session.flush().await?;
    session.set(right, "left", Value::Reference(left))?;
    session.flush().await?;

    backend.clear_operations();
    session.remove(left).await?;
    session.remove(right).await?;
    let report = session.flush().await?;
    assert_eq!(report.removed, 2);
    let ops = backend.operations();
    assert!(ops.iter().all(Operation::is_delete));
    assert_eq!(ops[0].collection(), "rights");
    assert_eq!(ops[1].collection(), "lefts");
    assert!(backend.documents("lefts").is_empty());
    assert!(backend.documents("rights").is_empty());
    Ok(())
}
