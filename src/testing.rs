use sqlx::{Pool, Postgres};

use crate::Result;

/// Create the document and sequence tables from `sql/0001_init.sql`.
pub async fn migrate_core_schema(pool: &Pool<Postgres>) -> Result<()> {
    let ddl = std::fs::read_to_string("sql/0001_init.sql")?;
    for stmt in split_statements(&ddl) {
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

/// Split SQL by semicolons, ignoring semicolons inside `$$ ... $$` blocks.
fn split_statements(ddl: &str) -> Vec<String> {
    let mut stmts: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut chars = ddl.chars().peekable();
    let mut in_dollar = false;
    while let Some(ch) = chars.next() {
        if ch == '$' {
            if let Some('$') = chars.peek().copied() {
                in_dollar = !in_dollar;
                buf.push('$');
                buf.push('$');
                chars.next();
                continue;
            }
        }
        if ch == ';' && !in_dollar {
            let stmt = buf.trim();
            if !stmt.is_empty() {
                stmts.push(stmt.to_string());
            }
            buf.clear();
        } else {
            buf.push(ch);
        }
    }
    let tail = buf.trim();
    if !tail.is_empty() {
        stmts.push(tail.to_string());
    }
    stmts
}

/// Remove every stored document and sequence.
pub async fn truncate_documents(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("truncate rillodm_documents, rillodm_sequences")
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons() {
        let stmts = split_statements("create table a (x int);\n do $$ begin; end $$;\n");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[1].contains("begin; end"));
    }
}
