//! Section and item reconciliation.
//!
//! Compares the persisted sections of a kit with the list the author just
//! edited and produces the writes that bring storage in line with it. The
//! engine is pure: it never talks to a store, so the same inputs always give
//! the same plan and a retry can simply re-diff against freshly read state.
//!
//! Positions are always rewritten from the order of the edited list, which
//! keeps them a dense `0..N` sequence after reorders, removals and inserts.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::models::{Item, Section, SectionType};

/// One write against a table.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<F> {
    Insert(F),
    Update { id: String, fields: F },
    Delete { id: String },
}

impl<F> Change<F> {
    pub fn is_insert(&self) -> bool {
        matches!(self, Change::Insert(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }

    /// Fields carried by inserts and updates
    pub fn fields(&self) -> Option<&F> {
        match self {
            Change::Insert(fields) | Change::Update { fields, .. } => Some(fields),
            Change::Delete { .. } => None,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Change::Insert(_) => None,
            Change::Update { id, .. } | Change::Delete { id } => Some(id),
        }
    }
}

/// A write that keeps the row: insert or update, never delete.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert<F> {
    Insert(F),
    Update { id: String, fields: F },
}

impl<F> Upsert<F> {
    pub fn is_insert(&self) -> bool {
        matches!(self, Upsert::Insert(_))
    }

    pub fn fields(&self) -> &F {
        match self {
            Upsert::Insert(fields) | Upsert::Update { fields, .. } => fields,
        }
    }
}

impl<F> From<Upsert<F>> for Change<F> {
    fn from(upsert: Upsert<F>) -> Self {
        match upsert {
            Upsert::Insert(fields) => Change::Insert(fields),
            Upsert::Update { id, fields } => Change::Update { id, fields },
        }
    }
}

/// Columns written for a section row (the parent kit id is added by the caller).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionFields {
    pub name: String,
    pub description: Option<String>,
    pub section_type: SectionType,
    pub position: i32,
}

/// Columns written for an item row (the parent section id is added by the caller).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFields {
    pub title: String,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub link_url: Option<String>,
    pub link_text: Option<String>,
    pub description: Option<String>,
    pub position: i32,
}

/// Something with an optional storage identity that can be diffed.
pub trait Reconcile {
    type Fields;

    fn identity(&self) -> Option<&str>;

    /// Row fields for this entry placed at `position`.
    fn fields_at(&self, position: i32) -> Self::Fields;

    /// Whether this entry may overwrite `persisted` in place.
    fn can_update(&self, _persisted: &Self) -> bool {
        true
    }
}

impl Reconcile for Section {
    type Fields = SectionFields;

    fn identity(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn fields_at(&self, position: i32) -> SectionFields {
        SectionFields {
            name: self.name.clone(),
            description: self.description.clone(),
            section_type: self.section_type,
            position,
        }
    }

    // Type is fixed at creation; a changed type is a delete plus a fresh insert.
    fn can_update(&self, persisted: &Self) -> bool {
        self.section_type == persisted.section_type
    }
}

impl Reconcile for Item {
    type Fields = ItemFields;

    fn identity(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn fields_at(&self, position: i32) -> ItemFields {
        ItemFields {
            title: self.title.clone(),
            content: self.content.clone(),
            image_url: self.image_url.clone(),
            video_url: self.video_url.clone(),
            link_url: self.link_url.clone(),
            link_text: self.link_text.clone(),
            description: self.description.clone(),
            position,
        }
    }
}

/// Diff one level of a list.
///
/// Deletes come first, then exactly one insert or update per `next` entry in
/// the given order. An identity that matches nothing in `previous` is treated
/// as new, and only the first occurrence of a repeated identity updates.
pub fn diff<T: Reconcile>(previous: &[T], next: &[T]) -> Vec<Change<T::Fields>> {
    let persisted: HashMap<&str, &T> = previous
        .iter()
        .filter_map(|entry| entry.identity().map(|id| (id, entry)))
        .collect();

    let mut kept: HashSet<&str> = HashSet::new();
    let targets: Vec<Option<&str>> = next
        .iter()
        .map(|entry| {
            let id = entry.identity()?;
            let old = persisted.get(id)?;
            (entry.can_update(old) && kept.insert(id)).then_some(id)
        })
        .collect();

    let mut changes = Vec::with_capacity(previous.len() + next.len());

    for entry in previous {
        if let Some(id) = entry.identity() {
            if !kept.contains(id) {
                changes.push(Change::Delete { id: id.to_string() });
            }
        }
    }

    for (position, (entry, target)) in next.iter().zip(targets).enumerate() {
        let fields = entry.fields_at(position as i32);
        match target {
            Some(id) => changes.push(Change::Update {
                id: id.to_string(),
                fields,
            }),
            None => changes.push(Change::Insert(fields)),
        }
    }

    changes
}

/// Insert or update of one section plus the item changes scoped to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionWrite {
    pub change: Upsert<SectionFields>,
    pub items: Vec<Change<ItemFields>>,
}

/// Everything needed to move a kit's sections from persisted to edited state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SavePlan {
    /// Sections to remove; their items go with them.
    pub deletes: Vec<String>,
    /// One entry per edited section, in display order.
    pub writes: Vec<SectionWrite>,
}

impl SavePlan {
    /// Section-level changes in execution order.
    pub fn section_changes(&self) -> Vec<Change<SectionFields>> {
        self.deletes
            .iter()
            .map(|id| Change::Delete { id: id.clone() })
            .chain(self.writes.iter().map(|w| w.change.clone().into()))
            .collect()
    }

    pub fn item_change_count(&self) -> usize {
        self.writes.iter().map(|w| w.items.len()).sum()
    }
}

/// Build the save plan for a kit.
pub fn plan(previous: &[Section], next: &[Section]) -> SavePlan {
    let persisted: HashMap<&str, &Section> = previous
        .iter()
        .filter_map(|s| s.id.as_deref().map(|id| (id, s)))
        .collect();

    let mut deletes = Vec::new();
    let mut section_writes = Vec::with_capacity(next.len());
    for change in diff(previous, next) {
        match change {
            Change::Delete { id } => deletes.push(id),
            Change::Insert(fields) => section_writes.push(Upsert::Insert(fields)),
            Change::Update { id, fields } => section_writes.push(Upsert::Update { id, fields }),
        }
    }

    let writes = section_writes
        .into_iter()
        .zip(next)
        .map(|(change, section)| {
            let old_items: &[Item] = match &change {
                Upsert::Update { id, .. } => persisted
                    .get(id.as_str())
                    .map(|s| s.items.as_slice())
                    .unwrap_or(&[]),
                Upsert::Insert(_) => &[],
            };
            SectionWrite {
                items: diff(old_items, &section.items),
                change,
            }
        })
        .collect();

    SavePlan { deletes, writes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(id: &str, ty: SectionType, position: i32) -> Section {
        Section {
            id: Some(id.to_string()),
            position,
            ..Section::new(id.to_uppercase(), ty)
        }
    }

    fn fresh(name: &str) -> Section {
        Section::new(name, SectionType::Info)
    }

    fn item(id: Option<&str>, title: &str) -> Item {
        Item {
            id: id.map(str::to_string),
            ..Item::new(title)
        }
    }

    fn positions(changes: &[Change<SectionFields>]) -> Vec<i32> {
        let mut out: Vec<i32> = changes
            .iter()
            .filter_map(|c| c.fields().map(|f| f.position))
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn test_new_sections_against_empty_previous() {
        let next = vec![fresh("one"), fresh("two"), fresh("three")];
        let changes = diff(&[], &next);

        assert_eq!(changes.len(), 3);
        for (i, change) in changes.iter().enumerate() {
            match change {
                Change::Insert(fields) => {
                    assert_eq!(fields.position, i as i32);
                    assert_eq!(fields.name, next[i].name);
                }
                other => panic!("expected insert, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_reorder_emits_only_updates() {
        let a = persisted("a", SectionType::Video, 0);
        let b = persisted("b", SectionType::Links, 1);
        let c = persisted("c", SectionType::Social, 2);
        let previous = vec![a.clone(), b.clone(), c.clone()];
        let next = vec![c, a, b];

        let changes = diff(&previous, &next);
        let updates: Vec<(&str, i32)> = changes
            .iter()
            .map(|c| match c {
                Change::Update { id, fields } => (id.as_str(), fields.position),
                other => panic!("expected update, got {:?}", other),
            })
            .collect();
        assert_eq!(updates, vec![("c", 0), ("a", 1), ("b", 2)]);
    }

    #[test]
    fn test_delete_and_insert_close_gap() {
        let a = persisted("a", SectionType::Video, 0);
        let b = persisted("b", SectionType::Links, 1);
        let next = vec![b.clone(), fresh("new")];

        let changes = diff(&[a, b], &next);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], Change::Delete { id: "a".to_string() });
        assert!(matches!(&changes[1], Change::Update { id, fields } if id == "b" && fields.position == 0));
        assert!(matches!(&changes[2], Change::Insert(fields) if fields.name == "new" && fields.position == 1));
    }

    #[test]
    fn test_targets_match_identity_sets() {
        let previous = vec![
            persisted("a", SectionType::Video, 0),
            persisted("b", SectionType::Info, 1),
            persisted("c", SectionType::Whatsapp, 2),
        ];
        let next = vec![
            fresh("x"),
            persisted("c", SectionType::Whatsapp, 2),
            persisted("a", SectionType::Video, 0),
            fresh("y"),
        ];

        let changes = diff(&previous, &next);
        let updated: HashSet<&str> = changes
            .iter()
            .filter(|c| matches!(c, Change::Update { .. }))
            .filter_map(|c| c.target_id())
            .collect();
        let deleted: Vec<&str> = changes
            .iter()
            .filter(|c| c.is_delete())
            .filter_map(|c| c.target_id())
            .collect();

        assert_eq!(updated, HashSet::from(["a", "c"]));
        assert_eq!(deleted, vec!["b"]);
        assert_eq!(changes.iter().filter(|c| c.is_insert()).count(), 2);
    }

    #[test]
    fn test_positions_are_contiguous() {
        for n in 0..8usize {
            let previous: Vec<Section> = (0..n)
                .filter(|i| i % 2 == 0)
                .map(|i| persisted(&format!("s{}", i), SectionType::Info, (i * 3) as i32))
                .collect();
            let next: Vec<Section> = (0..n)
                .rev()
                .map(|i| {
                    if i % 2 == 0 {
                        persisted(&format!("s{}", i), SectionType::Info, 99)
                    } else {
                        fresh(&format!("new{}", i))
                    }
                })
                .collect();

            let changes = diff(&previous, &next);
            assert_eq!(positions(&changes), (0..n as i32).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_diff_is_deterministic() {
        let previous = vec![persisted("a", SectionType::Video, 0), persisted("b", SectionType::Info, 1)];
        let next = vec![fresh("n"), persisted("b", SectionType::Info, 1)];

        assert_eq!(diff(&previous, &next), diff(&previous, &next));
        assert_eq!(plan(&previous, &next), plan(&previous, &next));
    }

    #[test]
    fn test_unknown_identity_is_inserted() {
        let previous = vec![persisted("a", SectionType::Video, 0)];
        let next = vec![persisted("a", SectionType::Video, 0), persisted("ghost", SectionType::Info, 1)];

        let changes = diff(&previous, &next);
        assert!(matches!(&changes[0], Change::Update { id, .. } if id == "a"));
        assert!(matches!(&changes[1], Change::Insert(fields) if fields.position == 1));
    }

    #[test]
    fn test_changed_type_recreates_section() {
        let previous = vec![persisted("a", SectionType::Video, 0)];
        let mut retyped = persisted("a", SectionType::Video, 0);
        retyped.section_type = SectionType::Links;
        retyped.items = vec![item(Some("i1"), "kept?")];

        let save = plan(&previous, &[retyped]);
        assert_eq!(save.deletes, vec!["a".to_string()]);
        assert!(save.writes[0].change.is_insert());
        assert!(save.writes[0].items.iter().all(|c| c.is_insert()));
    }

    #[test]
    fn test_duplicate_identity_updates_once() {
        let previous = vec![persisted("a", SectionType::Info, 0)];
        let next = vec![persisted("a", SectionType::Info, 0), persisted("a", SectionType::Info, 0)];

        let changes = diff(&previous, &next);
        assert!(matches!(&changes[0], Change::Update { id, fields } if id == "a" && fields.position == 0));
        assert!(matches!(&changes[1], Change::Insert(fields) if fields.position == 1));
    }

    #[test]
    fn test_items_are_scoped_to_their_section() {
        let mut a = persisted("a", SectionType::WhatToDo, 0);
        a.items = vec![item(Some("i1"), "first"), item(Some("i2"), "second")];
        let mut b = persisted("b", SectionType::WhatToDo, 1);
        b.items = vec![item(Some("i3"), "third")];
        let previous = vec![a.clone(), b.clone()];

        // i2 moves from a to b
        let mut next_a = a.clone();
        next_a.items = vec![item(Some("i1"), "first")];
        let mut next_b = b.clone();
        next_b.items = vec![item(Some("i2"), "second"), item(Some("i3"), "third"), item(None, "fourth")];

        let save = plan(&previous, &[next_a, next_b]);
        assert!(save.deletes.is_empty());

        let a_items = &save.writes[0].items;
        assert_eq!(a_items[0], Change::Delete { id: "i2".to_string() });
        assert!(matches!(&a_items[1], Change::Update { id, fields } if id == "i1" && fields.position == 0));

        let b_items = &save.writes[1].items;
        assert_eq!(b_items.len(), 3);
        assert!(matches!(&b_items[0], Change::Insert(fields) if fields.title == "second" && fields.position == 0));
        assert!(matches!(&b_items[1], Change::Update { id, fields } if id == "i3" && fields.position == 1));
        assert!(matches!(&b_items[2], Change::Insert(fields) if fields.title == "fourth" && fields.position == 2));
    }

    #[test]
    fn test_plan_orders_deletes_before_writes() {
        let previous = vec![persisted("a", SectionType::Video, 0), persisted("b", SectionType::Info, 1)];
        let next = vec![fresh("n").with_items(vec![item(None, "x"), item(None, "y")])];

        let save = plan(&previous, &next);
        let changes = save.section_changes();
        assert!(changes[0].is_delete());
        assert!(changes[1].is_delete());
        assert!(changes[2].is_insert());
        assert_eq!(save.item_change_count(), 2);
    }
}
