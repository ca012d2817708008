//! Backend contracts the kit service depends on.
//!
//! The service only needs a handful of row operations over four tables, an
//! object bucket for images, and a way to ask who is signed in. Anything that
//! implements these traits can back it:
//!
//! - `SupabaseClient` (in `api`) talks to the hosted backend over REST
//! - `MemoryStore` / `MemoryBucket` keep everything in process

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::api::ApiError;

pub use memory::{MemoryBucket, MemoryStore, StoreAction};

/// A row as exchanged with the store: a JSON object keyed by column.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Kits,
    KitSections,
    KitItems,
    Fundraisers,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Kits => "kits",
            Table::KitSections => "kit_sections",
            Table::KitItems => "kit_items",
            Table::Fundraisers => "fundraisers",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row selection for `RowStore::select`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(&'static str, String),
    In(&'static str, Vec<String>),
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<String>) -> Self {
        Filter::Eq(column, value.into())
    }

    /// Whether `row` passes this filter. Values compare by their string form.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => column_str(row, column).as_deref() == Some(value.as_str()),
            Filter::In(column, values) => column_str(row, column)
                .map(|v| values.iter().any(|candidate| *candidate == v))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: &'static str,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: &'static str) -> Self {
        Self { column, ascending: true }
    }

    pub fn desc(column: &'static str) -> Self {
        Self { column, ascending: false }
    }
}

/// String form of a scalar column, `None` for null or missing.
pub fn column_str(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("No row {id} in {table}")]
    MissingRow { table: Table, id: String },

    #[error("Malformed row: {0}")]
    Malformed(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

/// Row-oriented access to the kit tables.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert a row and return it as stored, including its new `id`.
    async fn insert(&self, table: Table, fields: Row) -> Result<Row, StoreError>;

    async fn update(&self, table: Table, id: &str, fields: Row) -> Result<(), StoreError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError>;

    async fn select(&self, table: Table, filter: &Filter, order: Option<Order>) -> Result<Vec<Row>, StoreError>;

    /// True when deleting a kit or section also removes its children.
    fn cascades_deletes(&self) -> bool {
        false
    }
}

/// Public object bucket for kit images.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    fn public_url(&self, key: &str) -> String;
}

/// Who is signed in, used to stamp ownership on new rows.
pub trait AuthProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Identity that never changes, for service accounts and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedIdentity(pub Option<String>);

impl FixedIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }
}

impl AuthProvider for FixedIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.0.clone()
    }
}
