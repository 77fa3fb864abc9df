use super::StateStore;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

/// Postgres-backed store: a single `nimbus_kv(key, value)` table.
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        run_inline_migrations(&db).await?;
        Ok(Self { db })
    }
}

/// Minimal schema for the key-value table (idempotent).
pub async fn run_inline_migrations(pool: &Pool<Postgres>) -> Result<()> {
    tracing::info!("📦 Running store migrations (inline schema)...");
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS nimbus_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
        // text_pattern_ops lets `LIKE 'prefix%'` use the index regardless of collation.
        r#"CREATE INDEX IF NOT EXISTS nimbus_kv_key_prefix ON nimbus_kv (key text_pattern_ops)"#,
    ];
    for stmt in statements {
        sqlx::query(stmt).execute(pool).await?;
    }
    tracing::info!("✅ Store migrations applied");
    Ok(())
}

/// Escape LIKE wildcards so the prefix matches literally (escape char `\`).
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[async_trait]
impl StateStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM nimbus_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO nimbus_kv (key, value, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM nimbus_kv WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"SELECT key, value FROM nimbus_kv WHERE key LIKE $1 ESCAPE '\' ORDER BY key"#,
        )
        .bind(like_prefix(prefix))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let res = match expected {
            Some(expected) => {
                sqlx::query(
                    "UPDATE nimbus_kv SET value = $3, updated_at = NOW()
                     WHERE key = $1 AND value = $2",
                )
                .bind(key)
                .bind(expected)
                .bind(value)
                .execute(&self.db)
                .await?
            }
            None => {
                sqlx::query(
                    "INSERT INTO nimbus_kv (key, value, updated_at) VALUES ($1, $2, NOW())
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(key)
                .bind(value)
                .execute(&self.db)
                .await?
            }
        };
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("/ns/a/mci/"), "/ns/a/mci/%");
        assert_eq!(like_prefix("/ns/a_b/"), "/ns/a\\_b/%");
        assert_eq!(like_prefix("50%"), "50\\%%");
    }
}
