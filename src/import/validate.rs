use crate::import::lookup::{LookupIndex, Resolution};
use crate::import::parser::{ParsedTable, RawRow};
use crate::import::schema::{ColumnKind, ColumnSpec, ImportSchema, LinkSpec};
use crate::import::{normalize_key, ImportMode};
use crate::store::{Fields, Record, RecordStore, StoreError};
use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Invalid email regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub row: usize,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(row: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            row,
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whole-file failure, reported on row 0.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(0, "file", message)
    }
}

/// Owner id -> linked target ids, in stored order.
pub type LinkMap = HashMap<String, Vec<String>>;

pub fn load_links<S: RecordStore + ?Sized>(
    link: &LinkSpec,
    store: &S,
) -> Result<LinkMap, StoreError> {
    let mut links = LinkMap::new();
    for row in store.query(link.table, &Fields::new())? {
        if let (Some(owner), Some(target)) = (row.text(link.owner_field), row.text(link.target_field)) {
            links.entry(owner).or_default().push(target);
        }
    }
    Ok(links)
}

/// Persisted entities of one type, indexed by normalized business key.
#[derive(Debug, Clone, Default)]
pub struct EntitySnapshot {
    records: Vec<Record>,
    by_key: HashMap<String, usize>,
    by_unique: HashMap<String, usize>,
    links: LinkMap,
}

impl EntitySnapshot {
    pub fn build(schema: &ImportSchema, records: Vec<Record>) -> Self {
        let key_field = schema.key_spec().column;
        let unique_field = schema.unique_spec().map(|c| c.column);
        let mut by_key = HashMap::new();
        let mut by_unique = HashMap::new();
        for (i, r) in records.iter().enumerate() {
            if let Some(k) = r.text(key_field) {
                by_key.entry(normalize_key(&k)).or_insert(i);
            }
            if let Some(u) = unique_field.and_then(|f| r.text(f)) {
                if !u.trim().is_empty() {
                    by_unique.entry(normalize_key(&u)).or_insert(i);
                }
            }
        }
        Self {
            records,
            by_key,
            by_unique,
            links: LinkMap::new(),
        }
    }

    pub fn with_links(mut self, links: LinkMap) -> Self {
        self.links = links;
        self
    }

    pub fn load<S: RecordStore + ?Sized>(
        schema: &ImportSchema,
        store: &S,
    ) -> Result<Self, StoreError> {
        let records = store.query(schema.table, &Fields::new())?;
        let links = match schema.link {
            Some(link) => load_links(&link, store)?,
            None => LinkMap::new(),
        };
        Ok(Self::build(schema, records).with_links(links))
    }

    pub fn links_of(&self, owner_id: &str) -> &[String] {
        self.links.get(owner_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn find(&self, key: &str) -> Option<&Record> {
        self.by_key
            .get(&normalize_key(key))
            .map(|&i| &self.records[i])
    }

    fn unique_owner(&self, value: &str) -> Option<&Record> {
        self.by_unique
            .get(&normalize_key(value))
            .map(|&i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// A row with zero errors, projected onto the schema's columns.
#[derive(Debug, Clone)]
pub struct ValidatedRow {
    pub line: usize,
    pub key: String,
    /// Trimmed values for every schema column present in the file.
    pub values: BTreeMap<&'static str, String>,
    /// Resolved identifiers for non-blank lookup columns.
    pub resolved: BTreeMap<&'static str, String>,
    /// Persisted counterpart (update mode).
    pub existing: Option<Record>,
    /// Link targets already stored for `existing`.
    pub linked: Vec<String>,
}

impl ValidatedRow {
    pub fn non_blank(&self, column: &str) -> Option<&str> {
        self.values
            .get(column)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub rows: Vec<ValidatedRow>,
    pub errors: Vec<ValidationError>,
    pub rows_total: usize,
    /// Header columns the schema does not declare.
    pub ignored_columns: Vec<String>,
}

impl ValidationReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub(crate) fn parse_date(formats: &[&str], raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    formats
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
}

pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

pub(crate) fn is_valid_email(raw: &str) -> bool {
    EMAIL_RE.is_match(raw.trim())
}

fn describe_formats(formats: &[&str]) -> String {
    formats
        .iter()
        .map(|f| f.replace("%Y", "YYYY").replace("%m", "MM").replace("%d", "DD"))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Kind-specific check of one non-blank value. On success returns the
/// resolved identifier for lookup columns.
fn check_value(
    spec: &ColumnSpec,
    value: &str,
    lookups: &LookupIndex,
) -> Result<Option<String>, String> {
    match spec.kind {
        ColumnKind::Text => Ok(None),
        ColumnKind::Email => {
            if is_valid_email(value) {
                Ok(None)
            } else {
                Err("Invalid email format".to_string())
            }
        }
        ColumnKind::Number => match parse_number(value) {
            Some(_) => Ok(None),
            None => Err(format!("{} must be a number, got '{}'", spec.label, value)),
        },
        ColumnKind::Date => match parse_date(spec.date_formats, value) {
            Some(_) => Ok(None),
            None => Err(format!(
                "Invalid date '{}' (expected {})",
                value,
                describe_formats(spec.date_formats)
            )),
        },
        ColumnKind::Enumerated => {
            let v = normalize_key(value);
            if spec.allowed_values.iter().any(|a| *a == v) {
                Ok(None)
            } else {
                Err(format!(
                    "Invalid {} '{}' (expected one of: {})",
                    spec.label.to_lowercase(),
                    value,
                    spec.allowed_values.join(", ")
                ))
            }
        }
        ColumnKind::Lookup => {
            let Some(kind) = spec.lookup else {
                return Err(format!("{} has no lookup kind", spec.label));
            };
            match lookups.resolve(kind, value) {
                Resolution::Found(id) => Ok(Some(id.to_string())),
                Resolution::Missing => Err(format!("Unknown {} '{}'", kind.as_str(), value)),
                Resolution::Ambiguous => Err(format!(
                    "{} '{}' matches more than one {}",
                    spec.label,
                    value,
                    kind.as_str()
                )),
            }
        }
    }
}

/// Validates every row of `table` in file order, collecting all errors.
pub fn validate_table(
    schema: &ImportSchema,
    table: &ParsedTable,
    mode: ImportMode,
    lookups: &LookupIndex,
    existing: &EntitySnapshot,
) -> ValidationReport {
    if table.is_structural_failure() {
        return ValidationReport {
            errors: table.errors.clone(),
            ..Default::default()
        };
    }

    let ignored_columns = table
        .headers
        .iter()
        .filter(|h| schema.column(h).is_none())
        .cloned()
        .collect::<Vec<_>>();

    let key_spec = schema.key_spec();
    let unique_spec = schema.unique_spec();
    let mut seen_keys: HashMap<String, usize> = HashMap::new();
    let mut seen_unique: HashMap<String, usize> = HashMap::new();
    let mut errors = Vec::new();
    let mut rows = Vec::new();

    for raw in &table.rows {
        let mut row_errors = Vec::new();
        let key = raw.non_blank(key_spec.name).map(str::to_string);

        if mode == ImportMode::Update {
            if let Some(k) = key.as_deref() {
                if existing.find(k).is_none() {
                    seen_keys.entry(normalize_key(k)).or_insert(raw.line);
                    errors.push(ValidationError::new(
                        raw.line,
                        key_spec.name,
                        format!("{} '{}' not found", key_spec.label, k),
                    ));
                    continue;
                }
            }
        }

        let mut values = BTreeMap::new();
        let mut resolved = BTreeMap::new();
        for spec in schema.columns {
            let value = raw.get(spec.name).map(str::trim);
            if let Some(v) = value {
                values.insert(spec.name, v.to_string());
            }
            let blank = value.map(str::is_empty).unwrap_or(true);
            if blank {
                if requires_value(spec, key_spec, mode, value.is_some()) {
                    row_errors.push(ValidationError::new(
                        raw.line,
                        spec.name,
                        format!("{} is required", spec.label),
                    ));
                }
                continue;
            }
            let v = value.unwrap_or_default();
            if schema.is_link(spec.name) {
                continue;
            }
            match check_value(spec, v, lookups) {
                Ok(Some(id)) => {
                    resolved.insert(spec.name, id);
                }
                Ok(None) => {}
                Err(message) => row_errors.push(ValidationError::new(raw.line, spec.name, message)),
            }
        }

        if let Some(k) = key.as_deref() {
            let nk = normalize_key(k);
            if let Some(first) = seen_keys.get(&nk) {
                row_errors.push(ValidationError::new(
                    raw.line,
                    key_spec.name,
                    format!(
                        "Duplicate in file: {} '{}' already appears on row {}",
                        key_spec.label, k, first
                    ),
                ));
            } else {
                seen_keys.insert(nk, raw.line);
            }
            if mode == ImportMode::Create && existing.find(k).is_some() {
                row_errors.push(ValidationError::new(
                    raw.line,
                    key_spec.name,
                    format!("{} '{}' already exists", key_spec.label, k),
                ));
            }
        }

        if let Some(spec) = unique_spec {
            check_unique(
                raw,
                spec,
                key_spec,
                key.as_deref(),
                existing,
                &mut seen_unique,
                &mut row_errors,
            );
        }

        if row_errors.is_empty() {
            let existing_record = match (mode, key.as_deref()) {
                (ImportMode::Update, Some(k)) => existing.find(k).cloned(),
                _ => None,
            };
            let linked = existing_record
                .as_ref()
                .map(|r| existing.links_of(&r.id).to_vec())
                .unwrap_or_default();
            rows.push(ValidatedRow {
                line: raw.line,
                key: key.unwrap_or_default(),
                values,
                resolved,
                existing: existing_record,
                linked,
            });
        } else {
            errors.extend(row_errors);
        }
    }

    ValidationReport {
        rows,
        errors,
        rows_total: table.rows.len(),
        ignored_columns,
    }
}

fn requires_value(
    spec: &ColumnSpec,
    key_spec: &ColumnSpec,
    mode: ImportMode,
    present: bool,
) -> bool {
    if spec.name == key_spec.name {
        return true;
    }
    if !spec.required {
        return false;
    }
    match mode {
        ImportMode::Create => true,
        // Update files may omit columns; a present but blank required cell
        // would otherwise read as "no opinion" and hide the mistake.
        ImportMode::Update => present,
    }
}

fn check_unique(
    raw: &RawRow,
    spec: &ColumnSpec,
    key_spec: &ColumnSpec,
    key: Option<&str>,
    existing: &EntitySnapshot,
    seen: &mut HashMap<String, usize>,
    row_errors: &mut Vec<ValidationError>,
) {
    let Some(v) = raw.non_blank(spec.name) else {
        return;
    };
    let nv = normalize_key(v);
    if let Some(first) = seen.get(&nv) {
        row_errors.push(ValidationError::new(
            raw.line,
            spec.name,
            format!(
                "Duplicate in file: {} '{}' already appears on row {}",
                spec.label, v, first
            ),
        ));
    } else {
        seen.insert(nv, raw.line);
    }

    if let Some(owner) = existing.unique_owner(v) {
        let owner_key = owner.text(key_spec.column).unwrap_or_default();
        let same_entity = key
            .map(|k| normalize_key(k) == normalize_key(&owner_key))
            .unwrap_or(false);
        if !same_entity {
            row_errors.push(ValidationError::new(
                raw.line,
                spec.name,
                format!("{} '{}' is already used by {}", spec.label, v, owner_key),
            ));
        }
    }
}

/// Distinct lines that carry at least one error.
pub fn rows_with_errors(errors: &[ValidationError]) -> usize {
    errors
        .iter()
        .filter(|e| e.row > 0)
        .map(|e| e.row)
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::lookup::{ClassRef, ReferenceSnapshot, SubjectRef};
    use crate::import::parser::parse_table;
    use crate::import::schema::EntityKind;
    use serde_json::json;

    fn lookups() -> LookupIndex {
        LookupIndex::build(&ReferenceSnapshot {
            classes: vec![ClassRef {
                id: "c1".into(),
                name: "G2A".into(),
                code: None,
                level: Some("Grade 2".into()),
                stream: Some("A".into()),
            }],
            subjects: vec![SubjectRef {
                id: "s1".into(),
                name: "Mathematics".into(),
                code: Some("MATH".into()),
            }],
        })
    }

    fn record(id: &str, fields: serde_json::Value) -> Record {
        Record {
            id: id.to_string(),
            fields: fields.as_object().cloned().expect("object"),
        }
    }

    fn run(kind: EntityKind, mode: ImportMode, text: &str, existing: Vec<Record>) -> ValidationReport {
        let schema = kind.schema();
        let snapshot = EntitySnapshot::build(schema, existing);
        validate_table(schema, &parse_table(text), mode, &lookups(), &snapshot)
    }

    const STAFF_HEADER: &str = "employee_no,first_name,last_name,email,role\n";

    #[test]
    fn invalid_email_blocks_only_its_row() {
        let text = format!(
            "{}EMP001,Bad,Email,bad-email,teacher\nEMP002,Ok,Row,ok@school.edu,teacher\nEMP003,Also,Ok,also@school.edu,support\n",
            STAFF_HEADER
        );
        let report = run(EntityKind::Staff, ImportMode::Create, &text, vec![]);
        assert_eq!(
            report.errors,
            vec![ValidationError::new(2, "email", "Invalid email format")]
        );
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows_total, 3);
    }

    #[test]
    fn duplicate_key_is_reported_on_the_repeat_only() {
        let text = format!(
            "{}EMP001,A,One,,teacher\nemp001,B,Two,,teacher\n",
            STAFF_HEADER
        );
        let report = run(EntityKind::Staff, ImportMode::Create, &text, vec![]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, 3);
        assert_eq!(report.errors[0].field, "employee_no");
        assert!(report.errors[0].message.starts_with("Duplicate in file"));
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].line, 2);
    }

    #[test]
    fn duplicate_email_is_a_second_uniqueness_dimension() {
        let text = format!(
            "{}EMP001,A,One,same@school.edu,teacher\nEMP002,B,Two,SAME@school.edu,teacher\n",
            STAFF_HEADER
        );
        let report = run(EntityKind::Staff, ImportMode::Create, &text, vec![]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!((report.errors[0].row, report.errors[0].field.as_str()), (3, "email"));
    }

    #[test]
    fn all_errors_of_a_row_are_collected() {
        let text = "employee_no,first_name,last_name,role,date_joined,gender\nEMP001,,Doe,wizard,31/31/2020,robot\n";
        let report = run(EntityKind::Staff, ImportMode::Create, text, vec![]);
        let fields = report.errors.iter().map(|e| e.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["first_name", "gender", "role", "date_joined"]);
        assert!(report.rows.is_empty());
    }

    #[test]
    fn dates_accept_only_declared_formats() {
        let base = "employee_no,first_name,last_name,role,date_joined\n";
        let ok = run(
            EntityKind::Staff,
            ImportMode::Create,
            &format!("{}E1,A,B,teacher,2024-02-29\nE2,A,B,teacher,09/01/2023\n", base),
            vec![],
        );
        assert!(ok.errors.is_empty(), "{:?}", ok.errors);
        let bad = run(
            EntityKind::Staff,
            ImportMode::Create,
            &format!("{}E1,A,B,teacher,Jan 9 2023\n", base),
            vec![],
        );
        assert_eq!(bad.errors.len(), 1);
        assert!(bad.errors[0].message.contains("YYYY-MM-DD or DD/MM/YYYY"));
    }

    #[test]
    fn unresolved_lookup_excludes_only_that_row() {
        let text = "admission_no,first_name,last_name,gender,class_name\nSTU001,A,B,male,Grade 2 A\nSTU002,C,D,female,Grade 9 Z\nSTU003,E,F,female,g2a\n";
        let report = run(EntityKind::Students, ImportMode::Create, text, vec![]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, 3);
        assert_eq!(report.errors[0].field, "class_name");
        assert_eq!(report.errors[0].message, "Unknown class 'Grade 9 Z'");
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0].resolved.get("class_name").map(String::as_str), Some("c1"));
    }

    #[test]
    fn create_mode_requires_missing_required_columns() {
        let text = "employee_no,first_name\nEMP001,Jane\n";
        let report = run(EntityKind::Staff, ImportMode::Create, text, vec![]);
        let fields = report.errors.iter().map(|e| e.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["last_name", "role"]);
    }

    #[test]
    fn create_mode_rejects_existing_keys() {
        let existing = vec![record("id1", json!({ "employee_no": "EMP001", "email": "x@y.org" }))];
        let text = format!("{}emp001,A,B,,teacher\nEMP009,C,D,X@y.org,teacher\n", STAFF_HEADER);
        let report = run(EntityKind::Staff, ImportMode::Create, &text, existing);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].message.contains("already exists"));
        assert!(report.errors[1].message.contains("already used by EMP001"));
    }

    #[test]
    fn update_mode_not_found_supersedes_field_checks() {
        let existing = vec![record("id1", json!({ "employee_no": "EMP001" }))];
        let text = "employee_no,email,role\nEMP404,not-an-email,wizard\nEMP001,,\n";
        let report = run(EntityKind::Staff, ImportMode::Update, text, existing);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].row, 2);
        assert_eq!(report.errors[0].message, "Employee No. 'EMP404' not found");
        // present but blank required column
        assert_eq!((report.errors[1].row, report.errors[1].field.as_str()), (3, "role"));
    }

    #[test]
    fn update_mode_allows_omitted_columns_and_attaches_snapshot() {
        let existing = vec![record("id1", json!({ "employee_no": "EMP001", "first_name": "Jon" }))];
        let text = "Employee No,First Name\nEMP001,Jonathan\n";
        let report = run(EntityKind::Staff, ImportMode::Update, text, existing);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        let row = &report.rows[0];
        assert_eq!(row.existing.as_ref().map(|r| r.id.as_str()), Some("id1"));
        assert_eq!(row.non_blank("first_name"), Some("Jonathan"));
        assert!(row.values.get("last_name").is_none());
    }

    #[test]
    fn unknown_columns_are_ignored_and_structural_errors_pass_through() {
        let report = run(
            EntityKind::Staff,
            ImportMode::Create,
            "employee_no,first_name,last_name,role,shoe_size\nE1,A,B,teacher,42\n",
            vec![],
        );
        assert_eq!(report.ignored_columns, vec!["shoe_size"]);
        assert!(report.errors.is_empty());

        let broken = run(EntityKind::Staff, ImportMode::Create, "", vec![]);
        assert_eq!(broken.errors.len(), 1);
        assert_eq!(broken.errors[0].row, 0);
        assert_eq!(rows_with_errors(&broken.errors), 0);
    }

    #[test]
    fn numbers_must_be_finite() {
        let text = "question_code,subject,question_type,marks,question_text\nQ1,MATH,essay,two,Explain\nQ2,math,essay,2.5,Explain\n";
        let report = run(EntityKind::ExamQuestions, ImportMode::Create, text, vec![]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "marks");
        assert_eq!(report.rows[0].resolved.get("subject").map(String::as_str), Some("s1"));
    }
}
