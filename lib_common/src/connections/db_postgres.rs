//! # PostgreSQL Store
//!
//! `Store` implementation on a `sqlx` connection pool.
//!
//! - Members are read from the membership table, one row per entity.
//! - Changes arrive through `LISTEN <table>_changes`; the trigger in
//!   `migrations/001_membership_notify.sql` publishes them.
//! - A batch is one statement: the rows travel as a single JSON array and
//!   `jsonb_populate_recordset` expands them against the destination table's
//!   row type. Categories with configured key columns upsert on that key
//!   (`ON CONFLICT (..) DO UPDATE`); the rest are plain inserts.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;

use crate::store::{ChangeStream, Store, StoreError};
use crate::telemetry::{Category, MemberFilter, MemberRow, MemberStatus, MembershipEvent, Record};

/// A `Store` over a PostgreSQL connection pool.
pub struct PgStore {
    /// The underlying sqlx connection pool.
    pool: PgPool,
    membership_table: String,
    conflict_keys: BTreeMap<Category, Vec<String>>,
}

impl PgStore {
    /// Connects a pool of up to `max_connections` to `database_url`.
    ///
    /// `membership_table` is the table members are read from and whose
    /// status column is updated.
    pub async fn new(database_url: &str, max_connections: u32, membership_table: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
            .map_err(|e: sqlx::Error| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            membership_table: membership_table.to_string(),
            conflict_keys: BTreeMap::new(),
        })
    }

    /// Sets the unique key each category's batches upsert on.
    pub fn with_conflict_keys(mut self, conflict_keys: BTreeMap<Category, Vec<String>>) -> Self {
        self.conflict_keys = conflict_keys;
        self
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for PgStore {
    async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<MemberRow>, StoreError> {
        let sql = members_sql(&self.membership_table);
        let rows = sqlx::query(&sql)
            .bind(filter.provider.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(MemberRow {
                    external_id: row.try_get("user_id")?,
                    internal_id: row.try_get("mediar_user_id")?,
                    token: row.try_get("token")?,
                    provider: row.try_get("provider")?,
                    status: row.try_get::<Option<Value>, _>("status")?.map(MemberStatus),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn watch_changes(&self, table: &str) -> Result<ChangeStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let channel = format!("{}_changes", table);
        listener
            .listen(&channel)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        log::info!("Listening on '{}'", channel);

        let changes = stream::unfold((listener, false), |(mut listener, failed)| async move {
            // The listener reconnects on the next `recv`; pace the attempts.
            if failed {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let (item, failed) = match listener.recv().await {
                Ok(notification) => (decode_change(notification.payload()), false),
                Err(e) => (Err(StoreError::Connection(e.to_string())), true),
            };
            Some((item, (listener, failed)))
        });
        Ok(changes.boxed())
    }

    async fn batch_upsert(&self, category: &Category, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let rows: Vec<Value> = records.iter().map(Record::to_row).collect();
        let keys = self.conflict_keys.get(category).map(Vec::as_slice).unwrap_or_default();
        let sql = upsert_sql(category.as_str(), &column_union(&rows), keys);

        sqlx::query(&sql)
            .bind(Json(Value::Array(rows)))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_status(&self, external_id: &str, status: &MemberStatus) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $1 WHERE user_id::text = $2",
            quote_ident(&self.membership_table)
        );
        sqlx::query(&sql)
            .bind(Json(&status.0))
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}

fn decode_change(payload: &str) -> Result<MembershipEvent, StoreError> {
    match MembershipEvent::parse(payload) {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(StoreError::Payload(format!("no usable row image in {}", payload))),
        Err(e) => Err(StoreError::Payload(e.to_string())),
    }
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Every top-level key of `rows`, in first-seen order.
pub fn column_union(rows: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for key in rows.iter().filter_map(Value::as_object).flat_map(|obj| obj.keys()) {
        if !columns.iter().any(|c| c == key) {
            columns.push(key.clone());
        }
    }
    columns
}

/// The membership read for `table`; `$1` is the provider name.
pub fn members_sql(table: &str) -> String {
    format!(
        "SELECT user_id::text AS user_id, mediar_user_id::text AS mediar_user_id, token, provider, status \
         FROM {} WHERE provider = $1 ORDER BY user_id",
        quote_ident(table)
    )
}

/// The batched write statement for `table`; `$1` is the JSON array of rows.
///
/// With `keys`, rows whose key already exists overwrite the other columns
/// present in the batch. Without, the statement is a plain insert.
pub fn upsert_sql(table: &str, columns: &[String], keys: &[String]) -> String {
    let table = quote_ident(table);
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let insert = format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1)"
    );
    if keys.is_empty() {
        return insert;
    }

    let key_list = keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ");
    let updates = columns
        .iter()
        .filter(|c| !keys.contains(c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect::<Vec<_>>();
    if updates.is_empty() {
        format!("{insert} ON CONFLICT ({key_list}) DO NOTHING")
    } else {
        format!("{insert} ON CONFLICT ({key_list}) DO UPDATE SET {}", updates.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_union_covers_every_row() {
        let rows = vec![
            json!({ "user_id": "E1", "metadata": {} }),
            json!({ "user_id": "E2", "probability": 0.3, "metadata": {} }),
        ];
        let mut columns = column_union(&rows);
        assert_eq!(columns.len(), 3);
        columns.sort();
        assert_eq!(columns, vec!["metadata", "probability", "user_id"]);
    }

    #[test]
    fn test_members_sql_is_ordered_by_external_id() {
        let sql = members_sql("tokens");
        assert!(sql.contains("FROM \"tokens\" WHERE provider = $1"));
        assert!(sql.ends_with("ORDER BY user_id"));
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_upsert_sql_without_key_is_plain_insert() {
        let sql = upsert_sql("states", &cols(&["user_id", "metadata"]), &[]);
        assert_eq!(
            sql,
            "INSERT INTO \"states\" (\"user_id\", \"metadata\") \
             SELECT \"user_id\", \"metadata\" FROM jsonb_populate_recordset(NULL::\"states\", $1)"
        );
    }

    #[test]
    fn test_upsert_sql_updates_non_key_columns() {
        let sql = upsert_sql(
            "states",
            &cols(&["user_id", "probability", "metadata"]),
            &cols(&["user_id"]),
        );
        assert!(sql.starts_with("INSERT INTO \"states\" (\"user_id\", \"probability\", \"metadata\")"));
        assert!(sql.ends_with(
            "ON CONFLICT (\"user_id\") DO UPDATE SET \
             \"probability\" = EXCLUDED.\"probability\", \"metadata\" = EXCLUDED.\"metadata\""
        ));
    }

    #[test]
    fn test_upsert_sql_with_only_key_columns() {
        let sql = upsert_sql("states", &cols(&["user_id"]), &cols(&["user_id"]));
        assert!(sql.ends_with("ON CONFLICT (\"user_id\") DO NOTHING"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_decode_change() {
        let payload = r#"{"eventType":"DELETE","new":null,"old":{"user_id":"u1","mediar_user_id":"E1"}}"#;
        assert!(matches!(decode_change(payload), Ok(MembershipEvent::Removed(_))));
        assert!(matches!(decode_change(r#"{"eventType":"INSERT","new":null}"#), Err(StoreError::Payload(_))));
        assert!(matches!(decode_change("{"), Err(StoreError::Payload(_))));
    }
}
