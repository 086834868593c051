//! The user store: an in-memory mapping over a small on-disk relational
//! store (SQLite), serving as the source of truth for subscriptions, nick
//! mappings, and cross-service links.
//!
//! # Description
//!
//! [`UserStore::load`] opens the backing database, creates any missing
//! tables declared in [`schema::SCHEMA`], and reads every row into an
//! in-memory mirror. After that, reads only ever touch the mirror — a
//! plain [`std::sync::RwLock`] guards it, since a mutation is always a
//! synchronous `HashMap` write sandwiched between two already-`await`ed
//! SQL statements, never held across an `.await` itself. Reads stay fully
//! synchronous so [`crate::chat_source::ChatSource`] implementations can
//! call them directly.

pub mod schema;

use crate::errors::BeemError;
use schema::{FieldKind, TableSchema, SCHEMA};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
}

impl FieldValue {
    pub fn as_text(&self) -> &str {
        match self {
            FieldValue::Text(s) => s.as_str(),
            FieldValue::Int(_) => "",
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            FieldValue::Int(i) => *i,
            FieldValue::Text(_) => 0,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
        }
    }
}

/// A single row, keyed by its (case-preserved) username plus its field map.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub fields: HashMap<String, FieldValue>,
}

impl Row {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn text(&self, field: &str) -> &str {
        self.fields.get(field).map(|v| v.as_text()).unwrap_or("")
    }

    pub fn int(&self, field: &str) -> i64 {
        self.fields.get(field).map(|v| v.as_int()).unwrap_or(0)
    }
}

type TableMirror = HashMap<String, Row>;

pub struct UserStore {
    pool: SqlitePool,
    mirror: RwLock<HashMap<&'static str, TableMirror>>,
}

impl UserStore {
    /// Opens (creating if necessary) the backing SQLite file, ensures every
    /// table in [`schema::SCHEMA`] exists, and loads all rows into memory.
    pub async fn load(db_file: &Path) -> Result<Self, BeemError> {
        let options = SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true);

        // A single connection is sufficient and enforces the single-writer
        // discipline described in the spec at the pool level too.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| BeemError::StoreInit(e.to_string()))?;

        let mut mirror = HashMap::new();
        for table in SCHEMA {
            create_table(&pool, table).await?;
            let rows = load_table(&pool, table).await?;
            mirror.insert(table.name, rows);
        }

        Ok(UserStore {
            pool,
            mirror: RwLock::new(mirror),
        })
    }

    /// Case-insensitive row lookup. Returns an empty [`Row`] on miss, per
    /// the spec ("returns empty result on miss"). Touches only the
    /// in-memory mirror, so this never suspends — callable from the
    /// synchronous [`crate::chat_source::ChatSource`] accessors.
    pub fn get_row(&self, table: &str, username: &str) -> Row {
        let key = username.to_lowercase();
        let mirror = self.mirror.read().unwrap();
        mirror
            .get(table)
            .and_then(|t| t.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, table: &str, username: &str) -> bool {
        let key = username.to_lowercase();
        let mirror = self.mirror.read().unwrap();
        mirror.get(table).map(|t| t.contains_key(&key)).unwrap_or(false)
    }

    /// Inserts a new row with default field values, failing with
    /// [`BeemError::Duplicate`] if the (service, lowercased username) key
    /// already exists.
    pub async fn add_row(&self, table_name: &'static str, username: &str) -> Result<Row, BeemError> {
        let schema = table_schema(table_name)?;
        let key = username.to_lowercase();

        if self.contains(table_name, username) {
            return Err(BeemError::Duplicate(format!("{table_name}:{username}")));
        }

        let mut fields = HashMap::new();
        for f in schema.fields {
            fields.insert(f.name.to_string(), TableSchema::default_for(f.kind));
        }
        let row = Row { fields };

        insert_row(&self.pool, schema, username, &row).await?;

        // Write-through: mutate the mirror only after the backing write
        // has succeeded, and never across an await.
        let mut mirror = self.mirror.write().unwrap();
        mirror.entry(table_name).or_default().insert(key, row.clone());
        Ok(row)
    }

    /// Updates a single field, writing through to the backing store first.
    pub async fn set_row_field(
        &self,
        table_name: &'static str,
        username: &str,
        field: &str,
        value: FieldValue,
    ) -> Result<(), BeemError> {
        let schema = table_schema(table_name)?;
        let key = username.to_lowercase();

        if !self.contains(table_name, username) {
            return Err(BeemError::NotFound(format!("{table_name}:{username}")));
        }

        update_field(&self.pool, schema, username, field, &value).await?;

        let mut mirror = self.mirror.write().unwrap();
        if let Some(row) = mirror.entry(table_name).or_default().get_mut(&key) {
            row.fields.insert(field.to_string(), value);
        }
        Ok(())
    }
}

fn table_schema(name: &str) -> Result<&'static TableSchema, BeemError> {
    SCHEMA
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| BeemError::StoreInit(format!("unknown table {name}")))
}

async fn create_table(pool: &SqlitePool, table: &TableSchema) -> Result<(), BeemError> {
    let mut columns = vec!["username TEXT COLLATE NOCASE PRIMARY KEY".to_string()];
    for f in table.fields {
        let sql_type = match f.kind {
            FieldKind::Text => "TEXT COLLATE NOCASE",
            FieldKind::Integer => "INTEGER",
        };
        columns.push(format!("{} {}", f.name, sql_type));
    }
    let statement = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.name,
        columns.join(", ")
    );
    sqlx::query(&statement)
        .execute(pool)
        .await
        .map_err(|e| BeemError::StoreInit(e.to_string()))?;
    Ok(())
}

async fn load_table(pool: &SqlitePool, table: &TableSchema) -> Result<TableMirror, BeemError> {
    let field_list: Vec<&str> = table.fields.iter().map(|f| f.name).collect();
    let statement = format!(
        "SELECT username, {} FROM {}",
        field_list.join(", "),
        table.name
    );
    let rows = sqlx::query(&statement)
        .fetch_all(pool)
        .await
        .map_err(|e| BeemError::StoreInit(e.to_string()))?;

    let mut out = HashMap::new();
    for r in rows {
        let username: String = r
            .try_get("username")
            .map_err(|e| BeemError::StoreInit(e.to_string()))?;
        let mut fields = HashMap::new();
        for f in table.fields {
            let value = match f.kind {
                FieldKind::Text => FieldValue::Text(
                    r.try_get::<String, _>(f.name)
                        .map_err(|e| BeemError::StoreInit(e.to_string()))?,
                ),
                FieldKind::Integer => FieldValue::Int(
                    r.try_get::<i64, _>(f.name)
                        .map_err(|e| BeemError::StoreInit(e.to_string()))?,
                ),
            };
            fields.insert(f.name.to_string(), value);
        }
        out.insert(username.to_lowercase(), Row { fields });
    }
    Ok(out)
}

async fn insert_row(
    pool: &SqlitePool,
    table: &TableSchema,
    username: &str,
    row: &Row,
) -> Result<(), BeemError> {
    let field_list: Vec<&str> = table.fields.iter().map(|f| f.name).collect();
    let placeholders: Vec<String> = (0..=field_list.len()).map(|_| "?".to_string()).collect();
    let statement = format!(
        "INSERT INTO {} (username, {}) VALUES ({})",
        table.name,
        field_list.join(", "),
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&statement).bind(username);
    for f in table.fields {
        query = match row.fields.get(f.name) {
            Some(FieldValue::Text(s)) => query.bind(s.clone()),
            Some(FieldValue::Int(i)) => query.bind(*i),
            None => query.bind(""),
        };
    }
    query
        .execute(pool)
        .await
        .map_err(|e| BeemError::WriteFailed(e.to_string()))?;
    Ok(())
}

async fn update_field(
    pool: &SqlitePool,
    table: &TableSchema,
    username: &str,
    field: &str,
    value: &FieldValue,
) -> Result<(), BeemError> {
    table
        .field(field)
        .ok_or_else(|| BeemError::NotFound(format!("unknown field {field}")))?;
    let statement = format!(
        "UPDATE {} SET {} = ? WHERE username = ? COLLATE NOCASE",
        table.name, field
    );
    let query = sqlx::query(&statement);
    let query = match value {
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Int(i) => query.bind(*i),
    };
    query
        .bind(username)
        .execute(pool)
        .await
        .map_err(|e| BeemError::WriteFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::WEBTILES_USERS;

    async fn fresh_store() -> UserStore {
        UserStore::load(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_get_round_trips_and_is_case_insensitive() {
        let store = fresh_store().await;
        store.add_row(WEBTILES_USERS.name, "Alice").await.unwrap();

        let row = store.get_row(WEBTILES_USERS.name, "alice");
        assert!(!row.is_empty());
        assert_eq!(row.int("subscription"), 0);

        let row_other_case = store.get_row(WEBTILES_USERS.name, "ALICE");
        assert_eq!(row_other_case.int("subscription"), 0);
    }

    #[tokio::test]
    async fn add_row_twice_is_duplicate() {
        let store = fresh_store().await;
        store.add_row(WEBTILES_USERS.name, "bob").await.unwrap();
        let err = store.add_row(WEBTILES_USERS.name, "Bob").await.unwrap_err();
        assert!(matches!(err, BeemError::Duplicate(_)));
    }

    #[tokio::test]
    async fn get_row_on_miss_is_empty() {
        let store = fresh_store().await;
        let row = store.get_row(WEBTILES_USERS.name, "nobody");
        assert!(row.is_empty());
    }

    #[tokio::test]
    async fn set_row_field_is_idempotent() {
        let store = fresh_store().await;
        store.add_row(WEBTILES_USERS.name, "carol").await.unwrap();
        store
            .set_row_field(WEBTILES_USERS.name, "carol", "subscription", FieldValue::Int(1))
            .await
            .unwrap();
        store
            .set_row_field(WEBTILES_USERS.name, "carol", "subscription", FieldValue::Int(1))
            .await
            .unwrap();

        let row = store.get_row(WEBTILES_USERS.name, "carol");
        assert_eq!(row.int("subscription"), 1);
    }
}
