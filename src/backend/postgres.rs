use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};
use uuid::Uuid;

use crate::{Error, Result};

use super::{Condition, Document, DocumentStore, Predicate, Write, ops};

/// Documents in a single jsonb table keyed by `(collection, id)`.
///
/// The schema lives in `sql/0001_init.sql`; see
/// [`crate::testing::migrate_core_schema`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Row key of a stored identifier; the JSON text keeps `1` and `"1"`
    /// apart.
    fn row_id(id: &JsonValue) -> String {
        id.to_string()
    }

    fn push_conditions(qb: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
        for condition in predicate.conditions() {
            match condition {
                Condition::Eq(path, value) => {
                    let mut nested = value.clone();
                    for part in path.parts().iter().rev() {
                        let mut map = Document::new();
                        map.insert(part.clone(), nested);
                        nested = JsonValue::Object(map);
                    }
                    qb.push(" and doc @> ");
                    qb.push_bind(Json(nested));
                }
                Condition::Missing(path) => {
                    qb.push(" and (doc #> ");
                    qb.push_bind(path.parts().to_vec());
                    qb.push(") is null");
                }
            }
        }
    }

    fn map_insert_error(collection: &str, err: sqlx::Error) -> Error {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return Error::ConstraintViolation {
                    constraint: db_err
                        .constraint()
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("{collection}._id")),
                    detail: db_err.message().to_owned(),
                };
            }
        }
        err.into()
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn insert(&self, collection: &str, mut document: Document) -> Result<JsonValue> {
        let id = match document.get("_id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => JsonValue::String(Uuid::new_v4().simple().to_string()[..24].to_owned()),
        };
        document.insert("_id".into(), id.clone());
        sqlx::query("insert into rillodm_documents (collection, id, doc) values ($1, $2, $3)")
            .bind(collection)
            .bind(Self::row_id(&id))
            .bind(Json(JsonValue::Object(document)))
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_insert_error(collection, e))?;
        Ok(id)
    }

    async fn update(&self, collection: &str, predicate: &Predicate, write: &Write) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut select = QueryBuilder::<Postgres>::new(
            "select id, doc from rillodm_documents where collection = ",
        );
        select.push_bind(collection);
        Self::push_conditions(&mut select, predicate);
        select.push(" for update");
        let rows: Vec<(String, Json<Document>)> = select.build_query_as().fetch_all(&mut *tx).await?;

        let matched = rows.len() as u64;
        for (id, Json(mut document)) in rows {
            ops::apply_write(&mut document, write)?;
            sqlx::query("update rillodm_documents set doc = $3 where collection = $1 and id = $2")
                .bind(collection)
                .bind(id)
                .bind(Json(JsonValue::Object(document)))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(matched)
    }

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("delete from rillodm_documents where collection = ");
        qb.push_bind(collection);
        Self::push_conditions(&mut qb, predicate);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn find_one(&self, collection: &str, predicate: &Predicate) -> Result<Option<Document>> {
        let mut qb = QueryBuilder::<Postgres>::new("select doc from rillodm_documents where collection = ");
        qb.push_bind(collection);
        Self::push_conditions(&mut qb, predicate);
        qb.push(" order by id limit 1");
        let row: Option<(Json<Document>,)> = qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(|(Json(doc),)| doc))
    }

    async fn find_many(&self, collection: &str, predicate: &Predicate) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::<Postgres>::new("select doc from rillodm_documents where collection = ");
        qb.push_bind(collection);
        Self::push_conditions(&mut qb, predicate);
        qb.push(" order by id");
        let rows: Vec<(Json<Document>,)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }

    async fn next_sequence(&self, name: &str) -> Result<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"insert into rillodm_sequences (name, value) values ($1, 1)
               on conflict (name) do update set value = rillodm_sequences.value + 1
               returning value"#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }
}
