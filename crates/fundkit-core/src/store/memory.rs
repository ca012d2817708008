//! In-process implementations of the backend contracts.
//!
//! Used by the test suite and for dry runs. Failures can be injected per table
//! and action so partial-save behaviour can be exercised without a network.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use super::{column_str, Filter, ObjectStorage, Order, Row, RowStore, StoreError, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Insert,
    Update,
    Delete,
    Select,
}

#[derive(Debug, Clone)]
struct FailRule {
    table: Table,
    action: StoreAction,
    filter: Filter,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, Vec<Row>>>,
    rules: Mutex<Vec<FailRule>>,
    next_id: AtomicU64,
    cascade: bool,
    latency: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn id_prefix(table: Table) -> &'static str {
    match table {
        Table::Kits => "kit",
        Table::KitSections => "sec",
        Table::KitItems => "item",
        Table::Fundraisers => "fr",
    }
}

fn compare_column(a: &Row, b: &Row, column: &str) -> Ordering {
    match (a.get(column), b.get(column)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        _ => column_str(a, column).cmp(&column_str(b, column)),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that removes children when a kit or section is deleted.
    pub fn cascading() -> Self {
        Self {
            cascade: true,
            ..Self::default()
        }
    }

    /// Delay every call, for exercising timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every `action` on `table`.
    pub fn fail_on(&self, table: Table, action: StoreAction) {
        self.fail_when(table, action, Filter::All);
    }

    /// Fail `action` on `table` for rows matching `filter`. Inserts are matched
    /// against the submitted fields, updates and deletes against `id` plus fields.
    pub fn fail_when(&self, table: Table, action: StoreAction, filter: Filter) {
        lock(&self.rules).push(FailRule { table, action, filter });
    }

    pub fn clear_failures(&self) {
        lock(&self.rules).clear();
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        lock(&self.tables).get(&table).cloned().unwrap_or_default()
    }

    pub fn count(&self, table: Table) -> usize {
        lock(&self.tables).get(&table).map(Vec::len).unwrap_or(0)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check(&self, table: Table, action: StoreAction, probe: &Row) -> Result<(), StoreError> {
        let rules = lock(&self.rules);
        let hit = rules
            .iter()
            .any(|r| r.table == table && r.action == action && r.filter.matches(probe));
        if hit {
            Err(StoreError::Rejected(format!("injected {:?} failure on {}", action, table)))
        } else {
            Ok(())
        }
    }

    fn probe(id: &str, fields: Option<&Row>) -> Row {
        let mut probe = fields.cloned().unwrap_or_default();
        probe.insert("id".to_string(), Value::String(id.to_string()));
        probe
    }

    fn remove_where(rows: &mut Vec<Row>, column: &str, ids: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        rows.retain(|row| match column_str(row, column) {
            Some(value) if ids.contains(&value) => {
                if let Some(id) = column_str(row, "id") {
                    removed.push(id);
                }
                false
            }
            _ => true,
        });
        removed
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn insert(&self, table: Table, mut fields: Row) -> Result<Row, StoreError> {
        self.pause().await;
        self.check(table, StoreAction::Insert, &fields)?;

        if column_str(&fields, "id").is_none() {
            let n = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            fields.insert("id".to_string(), Value::String(format!("{}-{}", id_prefix(table), n)));
        }
        if matches!(table, Table::Kits | Table::Fundraisers) && !fields.contains_key("created_at") {
            fields.insert("created_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        }

        lock(&self.tables).entry(table).or_default().push(fields.clone());
        Ok(fields)
    }

    async fn update(&self, table: Table, id: &str, fields: Row) -> Result<(), StoreError> {
        self.pause().await;
        self.check(table, StoreAction::Update, &Self::probe(id, Some(&fields)))?;

        let mut tables = lock(&self.tables);
        let row = tables
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|r| column_str(r, "id").as_deref() == Some(id)))
            .ok_or_else(|| StoreError::MissingRow {
                table,
                id: id.to_string(),
            })?;
        for (column, value) in fields {
            if column != "id" {
                row.insert(column, value);
            }
        }
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        self.pause().await;
        self.check(table, StoreAction::Delete, &Self::probe(id, None))?;

        let mut tables = lock(&self.tables);
        let ids = vec![id.to_string()];
        if let Some(rows) = tables.get_mut(&table) {
            Self::remove_where(rows, "id", &ids);
        }

        if self.cascade {
            let section_ids = match table {
                Table::Kits => tables
                    .get_mut(&Table::KitSections)
                    .map(|rows| Self::remove_where(rows, "kit_id", &ids))
                    .unwrap_or_default(),
                Table::KitSections => ids,
                _ => Vec::new(),
            };
            if let Some(items) = tables.get_mut(&Table::KitItems) {
                let removed = Self::remove_where(items, "section_id", &section_ids);
                debug!(table = %table, id = id, items = removed.len(), "Cascaded delete");
            }
        }
        Ok(())
    }

    async fn select(&self, table: Table, filter: &Filter, order: Option<Order>) -> Result<Vec<Row>, StoreError> {
        self.pause().await;
        self.check(table, StoreAction::Select, &Row::new())?;

        let mut rows: Vec<Row> = lock(&self.tables)
            .get(&table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ord = compare_column(a, b, order.column);
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        Ok(rows)
    }

    fn cascades_deletes(&self) -> bool {
        self.cascade
    }
}

/// Object bucket held in memory, serving URLs under a fixed base.
pub struct MemoryBucket {
    base_url: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    failing: AtomicBool,
    latency: Option<Duration>,
}

impl MemoryBucket {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject every upload until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Stored bytes and content type for `key`.
    pub fn object(&self, key: &str) -> Option<(Vec<u8>, String)> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStorage for MemoryBucket {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(StoreError::Rejected(format!("upload of {} refused", key)));
        }
        lock(&self.objects).insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_select_orders() {
        let store = MemoryStore::new();
        for (name, position) in [("b", 1), ("c", 2), ("a", 0)] {
            store
                .insert(Table::KitSections, row(json!({"kit_id": "k1", "name": name, "position": position})))
                .await
                .expect("insert section");
        }
        store
            .insert(Table::KitSections, row(json!({"kit_id": "k2", "name": "other", "position": 0})))
            .await
            .expect("insert section");

        let rows = store
            .select(Table::KitSections, &Filter::eq("kit_id", "k1"), Some(Order::asc("position")))
            .await
            .expect("select sections");
        let names: Vec<String> = rows.iter().filter_map(|r| column_str(r, "name")).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(rows.iter().all(|r| column_str(r, "id").is_some()));
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let store = MemoryStore::new();
        let err = store
            .update(Table::Kits, "nope", row(json!({"name": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingRow { table: Table::Kits, .. }));
    }

    #[tokio::test]
    async fn test_cascading_delete_removes_children() {
        let store = MemoryStore::cascading();
        store.insert(Table::Kits, row(json!({"id": "k1", "name": "Kit"}))).await.expect("kit");
        store
            .insert(Table::KitSections, row(json!({"id": "s1", "kit_id": "k1"})))
            .await
            .expect("section");
        store
            .insert(Table::KitItems, row(json!({"id": "i1", "section_id": "s1"})))
            .await
            .expect("item");

        store.delete(Table::Kits, "k1").await.expect("delete kit");
        assert_eq!(store.count(Table::Kits), 0);
        assert_eq!(store.count(Table::KitSections), 0);
        assert_eq!(store.count(Table::KitItems), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_matches_filter() {
        let store = MemoryStore::new();
        store.fail_when(Table::KitSections, StoreAction::Insert, Filter::eq("name", "Broken"));

        assert!(store.insert(Table::KitSections, row(json!({"name": "Fine"}))).await.is_ok());
        assert!(store.insert(Table::KitSections, row(json!({"name": "Broken"}))).await.is_err());

        store.clear_failures();
        assert!(store.insert(Table::KitSections, row(json!({"name": "Broken"}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_bucket_upload_and_url() {
        let bucket = MemoryBucket::new("https://cdn.test/kit_media/");
        bucket.upload("kits/a.png", vec![1, 2], "image/png").await.expect("upload");
        assert_eq!(bucket.public_url("kits/a.png"), "https://cdn.test/kit_media/kits/a.png");
        assert_eq!(bucket.object("kits/a.png"), Some((vec![1, 2], "image/png".to_string())));

        bucket.set_failing(true);
        assert!(bucket.upload("kits/b.png", vec![3], "image/png").await.is_err());
        assert!(bucket.object("kits/b.png").is_none());
    }
}
