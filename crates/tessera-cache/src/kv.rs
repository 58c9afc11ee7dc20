//! Cache bookkeeping in the `cache_kv` table.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::{Error, MetadataCache};

/// When the cache was last filled from the store (RFC 3339).
pub(crate) const HYDRATED_AT: &str = "hydrated_at";
/// Highest display number ever assigned.
pub(crate) const DISPLAY_NUMBER_HIGH_WATER: &str = "display_number_high_water";

impl MetadataCache {
  pub async fn kv_get(&self, key: &str) -> Result<Option<String>, Error> {
    let mut conn = self.pool.acquire().await?;
    get(&mut conn, key).await
  }

  pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    set(&mut conn, key, value).await
  }
}

pub(crate) async fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>, Error> {
  let value = sqlx::query_scalar("SELECT value FROM cache_kv WHERE key = ?")
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
  Ok(value)
}

pub(crate) async fn set(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO cache_kv (key, value, updatedAt) VALUES (?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updatedAt = excluded.updatedAt
    "#,
  )
  .bind(key)
  .bind(value)
  .bind(Utc::now())
  .execute(&mut *conn)
  .await?;
  Ok(())
}

pub(crate) async fn delete(conn: &mut SqliteConnection, key: &str) -> Result<(), Error> {
  sqlx::query("DELETE FROM cache_kv WHERE key = ?")
    .bind(key)
    .execute(&mut *conn)
    .await?;
  Ok(())
}

pub(crate) async fn get_i64(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>, Error> {
  Ok(get(conn, key).await?.and_then(|v| v.parse().ok()))
}

/// Store `value` unless a larger number is already there.
pub(crate) async fn raise_i64(conn: &mut SqliteConnection, key: &str, value: i64) -> Result<(), Error> {
  let current = get_i64(conn, key).await?;
  if current.is_none_or(|current| value > current) {
    set(conn, key, &value.to_string()).await?;
  }
  Ok(())
}
