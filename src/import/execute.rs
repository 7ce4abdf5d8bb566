//! Applies validated rows or grouped change sets one unit at a time.
//!
//! [`Execution`] is an iterator: every call to `next` performs exactly one
//! persistence operation (plus any link rows for a create) and yields a
//! [`ProgressEvent`]. A failing unit never stops the batch.

use crate::import::diff::{stored_value, ChangeRecord};
use crate::import::lookup::LookupIndex;
use crate::import::schema::{ImportSchema, LinkSpec};
use crate::import::validate::ValidatedRow;
use crate::store::{Fields, RecordStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_MAX_REPORTED_FAILURES: usize = 20;
pub const DEFAULT_LINK_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Failure details kept in the outcome; later failures are only counted.
    pub max_reported_failures: usize,
    pub link_separator: char,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_reported_failures: DEFAULT_MAX_REPORTED_FAILURES,
            link_separator: DEFAULT_LINK_SEPARATOR,
        }
    }
}

/// Every change for one business key, applied as a single update.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub key: String,
    pub row: usize,
    pub changes: Vec<ChangeRecord>,
}

/// Groups change records by business key in first-seen order.
pub fn group_changes(changes: &[ChangeRecord]) -> Vec<ChangeSet> {
    let mut sets: Vec<ChangeSet> = Vec::new();
    for c in changes {
        match sets.iter_mut().find(|s| s.key == c.business_key) {
            Some(set) => set.changes.push(c.clone()),
            None => sets.push(ChangeSet {
                key: c.business_key.clone(),
                row: c.row,
                changes: vec![c.clone()],
            }),
        }
    }
    sets
}

#[derive(Debug, Clone)]
pub enum ExecutionUnit {
    Create(ValidatedRow),
    Update(ChangeSet),
}

impl ExecutionUnit {
    pub fn key(&self) -> &str {
        match self {
            Self::Create(row) => &row.key,
            Self::Update(set) => &set.key,
        }
    }

    pub fn row(&self) -> usize {
        match self {
            Self::Create(row) => row.line,
            Self::Update(set) => set.row,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Created,
    Updated,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
    pub key: String,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFailure {
    pub row: usize,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub links_created: usize,
    /// Link labels that did not resolve plus link writes the store refused.
    pub links_skipped: usize,
    /// Update rows that matched their record exactly and were never applied.
    pub no_changes: usize,
    pub failures: Vec<UnitFailure>,
}

/// Rounded percentage; held at 99 until the final unit so 100 is seen once.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 || completed >= total {
        return 100;
    }
    let pct = (completed * 100 + total / 2) / total;
    pct.min(99) as u8
}

pub struct Execution<'a, S: RecordStore + ?Sized> {
    schema: &'static ImportSchema,
    store: &'a mut S,
    lookups: &'a LookupIndex,
    options: ExecutorOptions,
    units: std::vec::IntoIter<ExecutionUnit>,
    total: usize,
    completed: usize,
    outcome: ExecutionOutcome,
}

impl<'a, S: RecordStore + ?Sized> Execution<'a, S> {
    pub fn new(
        schema: &'static ImportSchema,
        store: &'a mut S,
        lookups: &'a LookupIndex,
        units: Vec<ExecutionUnit>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            schema,
            store,
            lookups,
            options,
            total: units.len(),
            units: units.into_iter(),
            completed: 0,
            outcome: ExecutionOutcome::default(),
        }
    }

    pub fn with_unchanged(mut self, no_changes: usize) -> Self {
        self.outcome.no_changes = no_changes;
        self
    }

    /// Runs the remaining units and returns the frozen totals.
    pub fn finish(mut self) -> ExecutionOutcome {
        for _ in self.by_ref() {}
        self.outcome
    }

    fn apply(&mut self, unit: &ExecutionUnit) -> UnitStatus {
        match unit {
            ExecutionUnit::Create(row) => self.apply_create(row),
            ExecutionUnit::Update(set) => self.apply_update(set),
        }
    }

    fn apply_create(&mut self, row: &ValidatedRow) -> UnitStatus {
        let mut fields = Fields::new();
        for spec in self.schema.field_columns() {
            if let Some(raw) = row.non_blank(spec.name) {
                let resolved = row.resolved.get(spec.name).map(String::as_str);
                fields.insert(spec.column.to_string(), stored_value(spec, raw, resolved));
            }
        }
        match self.store.create(self.schema.table, &fields) {
            Ok(id) => {
                self.outcome.created += 1;
                self.create_links(row, &id);
                UnitStatus::Created
            }
            Err(e) => self.unit_error(row.line, &row.key, e),
        }
    }

    fn create_links(&mut self, row: &ValidatedRow, owner_id: &str) {
        let Some(link) = self.schema.link else {
            return;
        };
        let Some(raw) = row.non_blank(link.column) else {
            return;
        };
        let targets = self
            .lookups
            .resolve_list(link.lookup, raw, self.options.link_separator);
        self.skip_unresolved(&row.key, &link, &targets.unresolved);
        self.write_links(&row.key, &link, owner_id, &targets.ids);
    }

    fn skip_unresolved(&mut self, key: &str, link: &LinkSpec, labels: &[String]) {
        for label in labels {
            warn!(key, label = %label, kind = link.lookup.as_str(), "link label did not resolve; skipped");
        }
        self.outcome.links_skipped += labels.len();
    }

    fn write_links(&mut self, key: &str, link: &LinkSpec, owner_id: &str, targets: &[String]) {
        for target in targets {
            let mut fields = Fields::new();
            fields.insert(link.owner_field.to_string(), Value::String(owner_id.to_string()));
            fields.insert(link.target_field.to_string(), Value::String(target.clone()));
            match self.store.create(link.table, &fields) {
                Ok(_) => self.outcome.links_created += 1,
                Err(e) => {
                    warn!(key, target = %target, error = %e, "link create failed");
                    self.outcome.links_skipped += 1;
                }
            }
        }
    }

    fn apply_update(&mut self, set: &ChangeSet) -> UnitStatus {
        let key_column = self.schema.key_spec().column;
        let mut filter = Fields::new();
        filter.insert(key_column.to_string(), Value::String(set.key.clone()));

        let id = match self.store.query(self.schema.table, &filter) {
            Ok(found) => match found.into_iter().next() {
                Some(r) => r.id,
                None => {
                    debug!(key = %set.key, "key no longer resolves; skipped");
                    self.outcome.skipped += 1;
                    return UnitStatus::Skipped;
                }
            },
            Err(e) => return self.unit_error(set.row, &set.key, e),
        };

        let link = self.schema.link;
        let is_link = |c: &&ChangeRecord| link.map(|l| l.column == c.column).unwrap_or(false);
        let fields = set
            .changes
            .iter()
            .filter(|c| !is_link(c))
            .map(|c| (c.column.to_string(), c.applied.clone()))
            .collect::<Fields>();
        if !fields.is_empty() {
            if let Err(e) = self.store.update(self.schema.table, &id, &fields) {
                return self.unit_error(set.row, &set.key, e);
            }
        }

        if let Some(link) = link {
            for change in set.changes.iter().filter(is_link) {
                let unresolved = self
                    .lookups
                    .resolve_list(link.lookup, &change.new_value, self.options.link_separator)
                    .unresolved;
                self.skip_unresolved(&set.key, &link, &unresolved);
                let targets = change
                    .applied
                    .as_array()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                self.write_links(&set.key, &link, &id, &targets);
            }
        }
        self.outcome.updated += 1;
        UnitStatus::Updated
    }

    fn unit_error(&mut self, row: usize, key: &str, e: StoreError) -> UnitStatus {
        if e.is_stale() {
            debug!(row, key, error = %e, "stale reference; skipped");
            self.outcome.skipped += 1;
            return UnitStatus::Skipped;
        }
        warn!(row, key, error = %e, "unit failed");
        self.outcome.failed += 1;
        if self.outcome.failures.len() < self.options.max_reported_failures {
            self.outcome.failures.push(UnitFailure {
                row,
                key: key.to_string(),
                message: e.to_string(),
            });
        }
        UnitStatus::Failed
    }
}

impl<S: RecordStore + ?Sized> Iterator for Execution<'_, S> {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        let unit = self.units.next()?;
        let status = self.apply(&unit);
        self.completed += 1;
        debug!(key = unit.key(), row = unit.row(), ?status, "unit applied");
        Some(ProgressEvent {
            completed: self.completed,
            total: self.total,
            percent: progress_percent(self.completed, self.total),
            key: unit.key().to_string(),
            status,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.units.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::lookup::{ReferenceSnapshot, SubjectRef};
    use crate::import::schema::EntityKind;
    use crate::store::Record;
    use serde_json::json;
    use std::collections::BTreeMap;

    /// In-memory store whose n-th create or update (1-based) fails.
    #[derive(Default)]
    struct ScriptedStore {
        records: Vec<(String, Record)>,
        creates: usize,
        fail_create: Option<usize>,
        fail_table: Option<&'static str>,
        stale_updates: bool,
        update_calls: usize,
        fail_update: Option<usize>,
        updates: Vec<(String, Fields)>,
    }

    impl RecordStore for ScriptedStore {
        fn create(&mut self, entity: &str, fields: &Fields) -> Result<String, StoreError> {
            if self.fail_table == Some(entity) {
                return Err(StoreError::Constraint("link rejected".into()));
            }
            self.creates += 1;
            if self.fail_create == Some(self.creates) {
                return Err(StoreError::Constraint("disk full".into()));
            }
            let id = format!("{}-{}", entity, self.creates);
            self.records.push((
                entity.to_string(),
                Record {
                    id: id.clone(),
                    fields: fields.clone(),
                },
            ));
            Ok(id)
        }

        fn update(&mut self, entity: &str, id: &str, fields: &Fields) -> Result<(), StoreError> {
            if self.stale_updates {
                return Err(StoreError::NotFound {
                    entity: entity.to_string(),
                    id: id.to_string(),
                });
            }
            self.update_calls += 1;
            if self.fail_update == Some(self.update_calls) {
                return Err(StoreError::Constraint("CHECK constraint failed: staff".into()));
            }
            self.updates.push((id.to_string(), fields.clone()));
            Ok(())
        }

        fn query(&self, entity: &str, filter: &Fields) -> Result<Vec<Record>, StoreError> {
            Ok(self
                .records
                .iter()
                .filter(|(e, r)| {
                    e == entity && filter.iter().all(|(k, v)| r.fields.get(k) == Some(v))
                })
                .map(|(_, r)| r.clone())
                .collect())
        }
    }

    fn staff_row(line: usize, key: &str, subjects: &str) -> ExecutionUnit {
        let mut values = BTreeMap::new();
        values.insert("employee_no", key.to_string());
        values.insert("first_name", "Jane".to_string());
        values.insert("last_name", "Doe".to_string());
        values.insert("role", "Teacher".to_string());
        values.insert("subjects", subjects.to_string());
        ExecutionUnit::Create(ValidatedRow {
            line,
            key: key.to_string(),
            values,
            resolved: BTreeMap::new(),
            existing: None,
            linked: Vec::new(),
        })
    }

    fn lookups() -> LookupIndex {
        LookupIndex::build(&ReferenceSnapshot {
            classes: vec![],
            subjects: vec![
                SubjectRef {
                    id: "s-math".into(),
                    name: "Mathematics".into(),
                    code: Some("MATH".into()),
                },
                SubjectRef {
                    id: "s-eng".into(),
                    name: "English".into(),
                    code: Some("ENG".into()),
                },
            ],
        })
    }

    fn change(row: usize, key: &str, column: &'static str, value: &str) -> ChangeRecord {
        ChangeRecord {
            row,
            business_key: key.to_string(),
            field: column,
            old_value: None,
            new_value: value.to_string(),
            column,
            applied: json!(value),
        }
    }

    #[test]
    fn one_failing_unit_does_not_stop_the_batch() {
        let mut store = ScriptedStore {
            fail_create: Some(3),
            ..Default::default()
        };
        let idx = lookups();
        let units = (0..10)
            .map(|i| staff_row(i + 2, &format!("EMP{:03}", i + 1), ""))
            .collect();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            units,
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!(outcome.created, 9);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.failures[0].key, "EMP003");
        assert_eq!(outcome.failures[0].row, 4);
        assert_eq!(store.records.len(), 9);
        assert_eq!(store.records[0].1.fields.get("role"), Some(&json!("teacher")));
        assert!(store.records[0].1.fields.get("subjects").is_none());
    }

    #[test]
    fn progress_reaches_one_hundred_exactly_once() {
        let mut store = ScriptedStore::default();
        let idx = lookups();
        let units = (0..3).map(|i| staff_row(i + 2, &format!("E{}", i), "")).collect();
        let events = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            units,
            ExecutorOptions::default(),
        )
        .collect::<Vec<_>>();
        let pcts = events.iter().map(|e| e.percent).collect::<Vec<_>>();
        assert_eq!(pcts, vec![33, 67, 100]);
        assert_eq!(events[2].completed, 3);
        assert_eq!(progress_percent(199, 200), 99);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn links_are_created_per_resolved_label_and_failures_are_swallowed() {
        let mut store = ScriptedStore::default();
        let idx = lookups();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            vec![staff_row(2, "EMP001", "MATH; eng ;HISTORY;math")],
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.links_created, 2);
        assert_eq!(outcome.links_skipped, 1);
        let links = store
            .records
            .iter()
            .filter(|(e, _)| e == "staff_subjects")
            .map(|(_, r)| r.fields.get("subject_id").cloned())
            .collect::<Vec<_>>();
        assert_eq!(links, vec![Some(json!("s-math")), Some(json!("s-eng"))]);

        let mut failing = ScriptedStore {
            fail_table: Some("staff_subjects"),
            ..Default::default()
        };
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut failing,
            &idx,
            vec![staff_row(2, "EMP001", "MATH")],
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!((outcome.created, outcome.failed, outcome.links_created), (1, 0, 0));
        assert_eq!(outcome.links_skipped, 1);
    }

    #[test]
    fn update_groups_changes_and_skips_vanished_keys() {
        let mut store = ScriptedStore::default();
        store
            .create("staff", &json!({ "employee_no": "EMP001" }).as_object().cloned().unwrap_or_default())
            .expect("seed");
        let changes = vec![
            change(2, "EMP001", "first_name", "Jonathan"),
            change(3, "EMP404", "first_name", "Ghost"),
            change(2, "EMP001", "last_name", "Smith"),
        ];
        let sets = group_changes(&changes);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].changes.len(), 2);

        let idx = lookups();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            sets.into_iter().map(ExecutionUnit::Update).collect(),
            ExecutorOptions::default(),
        )
        .with_unchanged(4)
        .finish();
        assert_eq!((outcome.updated, outcome.skipped, outcome.no_changes), (1, 1, 4));
        assert_eq!(store.updates.len(), 1);
        assert_eq!(store.updates[0].1.len(), 2);
    }

    #[test]
    fn stale_store_errors_count_as_skipped() {
        let mut store = ScriptedStore {
            stale_updates: true,
            ..Default::default()
        };
        store
            .create("staff", &json!({ "employee_no": "EMP001" }).as_object().cloned().unwrap_or_default())
            .expect("seed");
        let idx = lookups();
        let sets = group_changes(&[change(2, "EMP001", "first_name", "X")]);
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            sets.into_iter().map(ExecutionUnit::Update).collect(),
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!((outcome.updated, outcome.skipped, outcome.failed), (0, 1, 0));
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn failure_details_are_capped() {
        let mut store = ScriptedStore {
            fail_table: Some("staff"),
            ..Default::default()
        };
        let idx = lookups();
        let units = (0..5).map(|i| staff_row(i + 2, &format!("E{}", i), "")).collect();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            units,
            ExecutorOptions {
                max_reported_failures: 2,
                ..Default::default()
            },
        )
        .finish();
        assert_eq!(outcome.failed, 5);
        assert_eq!(outcome.failures.len(), 2);
    }

    fn seed_staff(store: &mut ScriptedStore, keys: &[String]) {
        for key in keys {
            store
                .create("staff", &json!({ "employee_no": key }).as_object().cloned().unwrap_or_default())
                .expect("seed");
        }
    }

    #[test]
    fn one_failing_update_does_not_stop_the_batch() {
        let mut store = ScriptedStore {
            fail_update: Some(3),
            ..Default::default()
        };
        let keys = (1..=10).map(|i| format!("EMP{:03}", i)).collect::<Vec<_>>();
        seed_staff(&mut store, &keys);
        let changes = keys
            .iter()
            .enumerate()
            .map(|(i, k)| change(i + 2, k, "phone", "0700"))
            .collect::<Vec<_>>();
        let idx = lookups();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            group_changes(&changes).into_iter().map(ExecutionUnit::Update).collect(),
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!((outcome.updated, outcome.failed, outcome.skipped), (9, 1, 0));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, "EMP003");
        assert_eq!(outcome.failures[0].row, 4);
        assert_eq!(store.updates.len(), 9);
    }

    #[test]
    fn link_only_update_adds_links_without_touching_fields() {
        let mut store = ScriptedStore::default();
        seed_staff(&mut store, &["EMP001".to_string()]);
        let link_change = ChangeRecord {
            row: 2,
            business_key: "EMP001".to_string(),
            field: "subject",
            old_value: Some("Mathematics".to_string()),
            new_value: "MATH;ENG;Drama".to_string(),
            column: "subjects",
            applied: json!(["s-eng"]),
        };
        let idx = lookups();
        let outcome = Execution::new(
            EntityKind::Staff.schema(),
            &mut store,
            &idx,
            group_changes(&[link_change]).into_iter().map(ExecutionUnit::Update).collect(),
            ExecutorOptions::default(),
        )
        .finish();
        assert_eq!((outcome.updated, outcome.links_created, outcome.links_skipped), (1, 1, 1));
        assert!(store.updates.is_empty());
        let linked = store
            .records
            .iter()
            .filter(|(e, _)| e == "staff_subjects")
            .map(|(_, r)| (r.fields.get("staff_id").cloned(), r.fields.get("subject_id").cloned()))
            .collect::<Vec<_>>();
        assert_eq!(linked, vec![(Some(json!("staff-1")), Some(json!("s-eng")))]);
    }
}
