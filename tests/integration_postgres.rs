mod common;

use std::sync::Arc;

use anyhow::Result;
use rillodm::{ConflictKind, Error, LockMode, PostgresStore, Store, Value};
use sqlx::postgres::PgPoolOptions;
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

#[tokio::test]
async fn roundtrip() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await?;
    rillodm::testing::migrate_core_schema(&pool).await?;
    let store = Store::with_backend(
        common::registry(),
        Arc::new(PostgresStore::new(pool.clone())),
    );

    // insert with a cascade through a reference collection
    let mut session = store.session();
    let user = session.create("User")?;
    session.set(user, "name", "ada")?;
    let address = session.create("Address")?;
    session.set(address, "city", "London")?;
    session.set(user, "address", Value::Embedded(address))?;
    let group = session.create("Group")?;
    session.set(group, "name", "admins")?;
    session.push(user, "groups", group)?;
    session.persist(user).await?;
    let report = session.flush().await?;
    assert_eq!(report.inserted, 2);
    let user_id = session.identifier(user).expect("assigned");

    // load in a fresh session, change a nested field
    let mut session = store.session();
    let loaded = session.find("User", user_id.clone()).await?.expect("stored");
    assert_eq!(session.get(loaded, "name")?, &Value::from("ada"));
    let Value::Embedded(address) = session.get(loaded, "address")?.clone() else {
        panic!("address not hydrated");
    };
    session.set(address, "city", "Paris")?;
    assert_eq!(session.flush().await?.updated, 1);
    assert_eq!(session.get(loaded, "version")?, &Value::Int(2));

    // a stale session conflicts on version
    let mut stale = store.session();
    let other = stale.find("User", user_id.clone()).await?.expect("stored");
    session.set(loaded, "email", "ada@example.com")?;
    session.flush().await?;
    stale.set(other, "name", "late")?;
    let err = stale.flush().await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConcurrencyConflict {
            kind: ConflictKind::Version { expected: 2 },
            ..
        }
    ));

    // increment ids and pessimistic locks
    let mut session = store.session();
    let order = session.create("Order")?;
    session.set(order, "region", "eu")?;
    session.persist(order).await?;
    session.flush().await?;
    assert_eq!(session.identifier(order), Some(rillodm::Identifier::Int(1)));
    session.lock(order, LockMode::PessimisticWrite, None).await?;

    let mut rival = store.session();
    let contended = rival
        .find("Order", rillodm::Identifier::Int(1))
        .await?
        .expect("stored");
    let err = rival
        .lock(contended, LockMode::PessimisticWrite, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    session.unlock(order).await?;
    rival.lock(contended, LockMode::PessimisticWrite, None).await?;

    // removal
    let mut session = store.session();
    let loaded = session.find("User", user_id.clone()).await?.expect("stored");
    session.remove(loaded).await?;
    assert_eq!(session.flush().await?.removed, 1);
    let mut session = store.session();
    assert!(session.find("User", user_id).await?.is_none());

    rillodm::testing::truncate_documents(&pool).await?;
    Ok(())
}
