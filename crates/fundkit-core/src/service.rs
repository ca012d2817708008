//! Kit aggregate service.
//!
//! A kit is stored as one `kits` row, its `kit_sections` rows and their
//! `kit_items` rows. `KitService` reads and writes that as a single unit on
//! top of any `RowStore`. The store exposes no multi-table transaction, so
//! saves are best effort: every independent write is attempted, failures are
//! collected, and the caller gets the read-back state together with the list
//! of what did not land.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{FailureCause, Failures, KitError, Operation, Result};
use crate::models::{is_valid_kit, is_valid_section, normalize_fundraiser_ref, Fundraiser, Item, Kit, Section};
use crate::reconcile::{self, Change, ItemFields, SavePlan, SectionFields, Upsert};
use crate::store::{column_str, AuthProvider, Filter, Order, Row, RowStore, StoreError, Table};

/// Default limit for a single store call.
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

pub struct KitService {
    store: Arc<dyn RowStore>,
    auth: Arc<dyn AuthProvider>,
    timeout: Duration,
}

fn blank_to_none(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn to_row<T: Serialize>(value: &T) -> std::result::Result<Row, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Malformed(format!("expected an object, got {}", other))),
    }
}

fn from_row<T: DeserializeOwned>(row: Row) -> std::result::Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn kit_fields(kit: &Kit) -> Row {
    let mut row = Row::new();
    row.insert("name".to_string(), json!(kit.name.trim()));
    row.insert("description".to_string(), json!(kit.description));
    row.insert("header_desktop_image".to_string(), json!(blank_to_none(&kit.header_desktop_image)));
    row.insert("header_mobile_image".to_string(), json!(blank_to_none(&kit.header_mobile_image)));
    row.insert(
        "fundraiser_id".to_string(),
        json!(normalize_fundraiser_ref(kit.fundraiser_id.as_deref())),
    );
    row
}

fn child_row<T: Serialize>(fields: &T, parent_column: &str, parent_id: &str) -> std::result::Result<Row, StoreError> {
    let mut row = to_row(fields)?;
    row.insert(parent_column.to_string(), json!(parent_id));
    Ok(row)
}

fn inserted_id(row: &Row, table: Table) -> std::result::Result<String, StoreError> {
    column_str(row, "id").ok_or_else(|| StoreError::Malformed(format!("row inserted into {} has no id", table)))
}

/// Reject a kit before any store call is made.
fn validate(kit: &Kit) -> Result<()> {
    if kit.name.trim().is_empty() {
        return Err(KitError::Validation("name is required".to_string()));
    }
    if !is_valid_kit(kit) {
        return Err(KitError::Validation(
            "a desktop or mobile header image is required".to_string(),
        ));
    }
    if let Some((index, section)) = kit.sections.iter().enumerate().find(|(_, s)| !is_valid_section(s)) {
        return Err(KitError::Validation(format!(
            "section {} ({}) has negative position {}",
            index, section.section_type, section.position
        )));
    }
    Ok(())
}

impl KitService {
    pub fn new(store: Arc<dyn RowStore>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            store,
            auth,
            timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
        }
    }

    /// Limit each individual store call to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn guarded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(self.timeout)))
    }

    async fn read(&self, table: Table, filter: Filter, order: Option<Order>) -> Result<Vec<Row>> {
        self.guarded(self.store.select(table, &filter, order))
            .await
            .map_err(|e| KitError::storage(Operation::Read { table: table.name() }, e))
    }

    // ===== Kits =====

    /// Persist a new kit with all its sections and items.
    pub async fn create_kit(&self, kit: &Kit) -> Result<Kit> {
        validate(kit)?;

        let mut row = kit_fields(kit);
        if let Some(user_id) = self.auth.current_user_id() {
            row.insert("user_id".to_string(), json!(user_id));
        }

        let stored = self
            .guarded(self.store.insert(Table::Kits, row))
            .await
            .and_then(|stored| inserted_id(&stored, Table::Kits))
            .map_err(|e| KitError::storage(Operation::InsertKit, e))?;
        info!(kit_id = %stored, sections = kit.sections.len(), "Created kit");

        let save = reconcile::plan(&[], &kit.sections);
        let failures = self.apply(&stored, &save).await;
        self.finish(&stored, failures).await
    }

    /// Load a kit with its sections and items, both ordered by position.
    pub async fn get_kit(&self, id: &str) -> Result<Kit> {
        let mut kit = self.fetch_kit_row(id).await?;
        kit.sections = self.load_sections(id).await?;
        Ok(kit)
    }

    /// Replace a kit's fields and reconcile its sections with the persisted ones.
    pub async fn update_kit(&self, kit: &Kit) -> Result<Kit> {
        let kit_id = kit
            .id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| KitError::Validation("kit id is required for update".to_string()))?;
        validate(kit)?;
        self.fetch_kit_row(kit_id).await?;

        let mut row = kit_fields(kit);
        row.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        self.guarded(self.store.update(Table::Kits, kit_id, row))
            .await
            .map_err(|e| KitError::storage(Operation::UpdateKit { id: kit_id.to_string() }, e))?;

        let persisted = self.load_sections(kit_id).await?;
        let save = reconcile::plan(&persisted, &kit.sections);
        debug!(
            kit_id = kit_id,
            section_deletes = save.deletes.len(),
            section_writes = save.writes.len(),
            item_changes = save.item_change_count(),
            "Reconciled kit sections"
        );

        let failures = self.apply(kit_id, &save).await;
        info!(kit_id = kit_id, failed = failures.len(), "Updated kit");
        self.finish(kit_id, failures).await
    }

    /// Delete a kit and everything under it.
    ///
    /// Without a cascading store, items go first, then sections, then the kit
    /// row. If any child cannot be removed the kit row is kept so nothing is
    /// left orphaned.
    pub async fn delete_kit(&self, id: &str) -> Result<()> {
        self.fetch_kit_row(id).await?;

        if !self.store.cascades_deletes() {
            let sections = self.read(Table::KitSections, Filter::eq("kit_id", id), None).await?;
            let section_ids: Vec<String> = sections.iter().filter_map(|r| column_str(r, "id")).collect();

            let mut failures = Failures::default();
            for result in join_all(section_ids.iter().map(|sid| self.delete_section(sid))).await {
                failures.extend(result);
            }
            if !failures.is_empty() {
                warn!(kit_id = id, failed = failures.len(), "Kit delete stopped, children remain");
                return Err(KitError::Incomplete {
                    kit_id: Some(id.to_string()),
                    kit: self.get_kit(id).await.ok().map(Box::new),
                    failures,
                });
            }
        }

        self.guarded(self.store.delete(Table::Kits, id))
            .await
            .map_err(|e| KitError::storage(Operation::DeleteKit { id: id.to_string() }, e))?;
        info!(kit_id = id, "Deleted kit");
        Ok(())
    }

    /// All kits, newest first, without their sections.
    pub async fn list_kits(&self) -> Result<Vec<Kit>> {
        let rows = self.read(Table::Kits, Filter::All, Some(Order::desc("created_at"))).await?;
        rows.into_iter()
            .map(|row| from_row(row).map_err(|e| KitError::storage(Operation::Read { table: "kits" }, e)))
            .collect()
    }

    async fn fetch_kit_row(&self, id: &str) -> Result<Kit> {
        let row = self
            .read(Table::Kits, Filter::eq("id", id), None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KitError::NotFound(format!("kit {}", id)))?;
        from_row(row).map_err(|e| KitError::storage(Operation::Read { table: "kits" }, e))
    }

    async fn load_sections(&self, kit_id: &str) -> Result<Vec<Section>> {
        let rows = self
            .read(Table::KitSections, Filter::eq("kit_id", kit_id), Some(Order::asc("position")))
            .await?;
        let mut sections: Vec<Section> = rows
            .into_iter()
            .map(from_row)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| KitError::storage(Operation::Read { table: "kit_sections" }, e))?;

        let section_ids: Vec<String> = sections.iter().filter_map(|s| s.id.clone()).collect();
        if section_ids.is_empty() {
            return Ok(sections);
        }

        let rows = self
            .read(Table::KitItems, Filter::In("section_id", section_ids), Some(Order::asc("position")))
            .await?;
        let mut by_section: HashMap<String, Vec<Item>> = HashMap::new();
        for row in rows {
            let item: Item = from_row(row).map_err(|e| KitError::storage(Operation::Read { table: "kit_items" }, e))?;
            if let Some(section_id) = item.section_id.clone() {
                by_section.entry(section_id).or_default().push(item);
            }
        }

        for section in &mut sections {
            if let Some(id) = section.id.as_deref() {
                section.items = by_section.remove(id).unwrap_or_default();
            }
        }
        Ok(sections)
    }

    /// Turn collected failures into the final result, always reading back
    /// what the store actually holds.
    async fn finish(&self, kit_id: &str, failures: Failures) -> Result<Kit> {
        if failures.is_empty() {
            return self.get_kit(kit_id).await;
        }

        warn!(kit_id = kit_id, failed = failures.len(), "Kit saved with failures: {}", failures);
        Err(KitError::Incomplete {
            kit_id: Some(kit_id.to_string()),
            kit: self.get_kit(kit_id).await.ok().map(Box::new),
            failures,
        })
    }

    // ===== Plan execution =====

    /// Run a save plan: section deletes, then section writes in order, then
    /// each section's item changes.
    async fn apply(&self, kit_id: &str, save: &SavePlan) -> Failures {
        let mut failures = Failures::default();

        for result in join_all(save.deletes.iter().map(|id| self.delete_section(id))).await {
            failures.extend(result);
        }

        // Parent id per written section, None when its insert failed
        let mut parents: Vec<Option<String>> = Vec::with_capacity(save.writes.len());
        for write in &save.writes {
            let parent = match &write.change {
                Upsert::Insert(fields) => {
                    let op = Operation::InsertSection { position: fields.position };
                    match self.insert_section(kit_id, fields).await {
                        Ok(id) => Some(id),
                        Err(e) => {
                            failures.store(op, &e);
                            None
                        }
                    }
                }
                Upsert::Update { id, fields } => {
                    if let Err(e) = self.update_row(Table::KitSections, id, fields).await {
                        failures.store(Operation::UpdateSection { id: id.clone() }, &e);
                    }
                    Some(id.clone())
                }
            };
            parents.push(parent);
        }

        for (write, parent) in save.writes.iter().zip(parents) {
            let section_position = write.change.fields().position;
            match parent {
                Some(section_id) => {
                    failures.extend(self.apply_items(&section_id, section_position, &write.items).await);
                }
                None => {
                    let blocked = Operation::InsertSection { position: section_position };
                    for change in &write.items {
                        if let Change::Insert(fields) = change {
                            failures.push(
                                Operation::InsertItem { section_position, position: fields.position },
                                FailureCause::Dependency(blocked.clone()),
                            );
                        }
                    }
                }
            }
        }

        failures
    }

    async fn apply_items(&self, section_id: &str, section_position: i32, changes: &[Change<ItemFields>]) -> Failures {
        let mut failures = Failures::default();

        let deletes = changes.iter().filter_map(|c| match c {
            Change::Delete { id } => Some(id),
            _ => None,
        });
        let results = join_all(deletes.map(|id| async move {
            (id, self.guarded(self.store.delete(Table::KitItems, id)).await)
        }))
        .await;
        for (id, result) in results {
            if let Err(e) = result {
                failures.store(Operation::DeleteItem { id: id.clone() }, &e);
            }
        }

        for change in changes {
            match change {
                Change::Insert(fields) => {
                    let inserted = match child_row(fields, "section_id", section_id) {
                        Ok(row) => self.guarded(self.store.insert(Table::KitItems, row)).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = inserted {
                        failures.store(
                            Operation::InsertItem { section_position, position: fields.position },
                            &e,
                        );
                    }
                }
                Change::Update { id, fields } => {
                    if let Err(e) = self.update_row(Table::KitItems, id, fields).await {
                        failures.store(Operation::UpdateItem { id: id.clone() }, &e);
                    }
                }
                Change::Delete { .. } => {}
            }
        }

        failures
    }

    async fn insert_section(&self, kit_id: &str, fields: &SectionFields) -> std::result::Result<String, StoreError> {
        let row = child_row(fields, "kit_id", kit_id)?;
        let stored = self.guarded(self.store.insert(Table::KitSections, row)).await?;
        inserted_id(&stored, Table::KitSections)
    }

    async fn update_row<T: Serialize>(&self, table: Table, id: &str, fields: &T) -> std::result::Result<(), StoreError> {
        let row = to_row(fields)?;
        self.guarded(self.store.update(table, id, row)).await
    }

    /// Delete one section. Without store cascade its items are removed first,
    /// and the section is kept if any of them cannot be.
    async fn delete_section(&self, id: &str) -> Failures {
        let mut failures = Failures::default();
        let op = Operation::DeleteSection { id: id.to_string() };

        if !self.store.cascades_deletes() {
            let items = match self
                .guarded(self.store.select(Table::KitItems, &Filter::eq("section_id", id), None))
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    failures.store(op, &e);
                    return failures;
                }
            };

            let item_ids: Vec<String> = items.iter().filter_map(|r| column_str(r, "id")).collect();
            let results = join_all(item_ids.iter().map(|item_id| async move {
                (item_id, self.guarded(self.store.delete(Table::KitItems, item_id)).await)
            }))
            .await;

            let mut blocked_by = None;
            for (item_id, result) in results {
                if let Err(e) = result {
                    let item_op = Operation::DeleteItem { id: item_id.clone() };
                    failures.store(item_op.clone(), &e);
                    blocked_by.get_or_insert(item_op);
                }
            }
            if let Some(item_op) = blocked_by {
                failures.push(op, FailureCause::Dependency(item_op));
                return failures;
            }
        }

        if let Err(e) = self.guarded(self.store.delete(Table::KitSections, id)).await {
            failures.store(op, &e);
        }
        failures
    }

    // ===== Fundraisers =====

    /// All fundraisers ordered by name.
    pub async fn list_fundraisers(&self) -> Result<Vec<Fundraiser>> {
        let rows = self.read(Table::Fundraisers, Filter::All, Some(Order::asc("name"))).await?;
        rows.into_iter()
            .map(|row| from_row(row).map_err(|e| KitError::storage(Operation::Read { table: "fundraisers" }, e)))
            .collect()
    }

    pub async fn create_fundraiser(&self, fundraiser: &Fundraiser) -> Result<Fundraiser> {
        let name = fundraiser.name.trim();
        if name.is_empty() {
            return Err(KitError::Validation("fundraiser name is required".to_string()));
        }

        let mut row = Row::new();
        row.insert("name".to_string(), json!(name));
        row.insert("description".to_string(), json!(blank_to_none(&fundraiser.description)));
        if let Some(user_id) = self.auth.current_user_id() {
            row.insert("user_id".to_string(), json!(user_id));
        }

        let stored = self
            .guarded(self.store.insert(Table::Fundraisers, row))
            .await
            .and_then(from_row::<Fundraiser>)
            .map_err(|e| KitError::storage(Operation::InsertFundraiser, e))?;
        info!(name = name, "Created fundraiser");
        Ok(stored)
    }

    /// Delete a fundraiser. Kits assigned to it are kept and unassigned first.
    pub async fn delete_fundraiser(&self, id: &str) -> Result<()> {
        let existing = self.read(Table::Fundraisers, Filter::eq("id", id), None).await?;
        if existing.is_empty() {
            return Err(KitError::NotFound(format!("fundraiser {}", id)));
        }

        let kits = self.read(Table::Kits, Filter::eq("fundraiser_id", id), None).await?;
        let kit_ids: Vec<String> = kits.iter().filter_map(|r| column_str(r, "id")).collect();

        let results = join_all(kit_ids.iter().map(|kit_id| async move {
            let mut row = Row::new();
            row.insert("fundraiser_id".to_string(), Value::Null);
            (kit_id, self.guarded(self.store.update(Table::Kits, kit_id, row)).await)
        }))
        .await;

        let mut failures = Failures::default();
        for (kit_id, result) in results {
            if let Err(e) = result {
                failures.store(Operation::ClearFundraiser { kit_id: kit_id.clone() }, &e);
            }
        }
        if !failures.is_empty() {
            return Err(KitError::Incomplete {
                kit_id: None,
                failures,
                kit: None,
            });
        }

        self.guarded(self.store.delete(Table::Fundraisers, id))
            .await
            .map_err(|e| KitError::storage(Operation::DeleteFundraiser { id: id.to_string() }, e))?;
        info!(fundraiser_id = id, unassigned_kits = kit_ids.len(), "Deleted fundraiser");
        Ok(())
    }
}
