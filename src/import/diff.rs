//! Field-level comparison of validated rows against their persisted records.

use crate::import::lookup::LookupIndex;
use crate::import::schema::{ColumnKind, ColumnSpec, ImportSchema};
use crate::import::normalize_key;
use crate::import::validate::{parse_date, parse_number, ValidatedRow};
use serde::Serialize;
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub row: usize,
    pub business_key: String,
    pub field: &'static str,
    pub old_value: Option<String>,
    pub new_value: String,
    /// Persisted column the change writes.
    #[serde(skip)]
    pub column: &'static str,
    /// Value handed to the store (the identifier for lookups).
    #[serde(skip)]
    pub applied: Value,
}

#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    pub changes: Vec<ChangeRecord>,
    /// Business keys of rows that matched their record exactly.
    pub unchanged: Vec<String>,
}

fn canonical_date(spec: &ColumnSpec, raw: &str) -> Option<String> {
    let date = parse_date(spec.date_formats, raw)?;
    spec.date_formats
        .first()
        .map(|f| date.format(f).to_string())
}

/// Value written to the store for one non-blank, validated cell.
pub fn stored_value(spec: &ColumnSpec, raw: &str, resolved: Option<&str>) -> Value {
    let raw = raw.trim();
    match spec.kind {
        ColumnKind::Text => Value::String(raw.to_string()),
        ColumnKind::Email | ColumnKind::Enumerated => Value::String(normalize_key(raw)),
        ColumnKind::Date => Value::String(canonical_date(spec, raw).unwrap_or_else(|| raw.to_string())),
        ColumnKind::Number => match parse_number(raw) {
            Some(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Value::from(n as i64),
            Some(n) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            None => Value::String(raw.to_string()),
        },
        ColumnKind::Lookup => resolved
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
    }
}

/// Comparable form of a cell. Lookups compare identifiers, so callers pass
/// the resolved id (file side) or the stored id (record side).
fn comparable(spec: &ColumnSpec, value: &str) -> String {
    let value = value.trim();
    match spec.kind {
        ColumnKind::Text | ColumnKind::Lookup => value.to_string(),
        ColumnKind::Email | ColumnKind::Enumerated => normalize_key(value),
        ColumnKind::Date => canonical_date(spec, value).unwrap_or_else(|| value.to_string()),
        ColumnKind::Number => parse_number(value)
            .map(|n| format!("{}", n))
            .unwrap_or_else(|| value.to_string()),
    }
}

/// Changes for one validated update row. Rows without a matched record
/// produce nothing. `separator` splits the link column.
pub fn diff_row(
    schema: &ImportSchema,
    row: &ValidatedRow,
    lookups: &LookupIndex,
    separator: char,
) -> Vec<ChangeRecord> {
    let Some(existing) = row.existing.as_ref() else {
        return Vec::new();
    };
    let key_spec = schema.key_spec();
    let business_key = existing
        .text(key_spec.column)
        .unwrap_or_else(|| row.key.clone());

    let mut changes = Vec::new();
    for spec in schema.field_columns() {
        if spec.name == key_spec.name {
            continue;
        }
        let Some(new_raw) = row.non_blank(spec.name) else {
            continue;
        };
        let resolved = row.resolved.get(spec.name).map(String::as_str);
        let new_cmp = match spec.kind {
            ColumnKind::Lookup => match resolved {
                Some(id) => id.to_string(),
                None => continue,
            },
            _ => comparable(spec, new_raw),
        };
        let old_raw = existing.text(spec.column);
        let old_cmp = old_raw.as_deref().map(|v| comparable(spec, v));
        if old_cmp.as_deref() == Some(new_cmp.as_str()) {
            continue;
        }
        changes.push(ChangeRecord {
            row: row.line,
            business_key: business_key.clone(),
            field: spec.change_field(),
            old_value: display_old(spec, old_raw, lookups),
            new_value: new_raw.to_string(),
            column: spec.column,
            applied: stored_value(spec, new_raw, resolved),
        });
    }
    if let Some(change) = diff_links(schema, row, &business_key, lookups, separator) {
        changes.push(change);
    }
    changes
}

/// Links are additive: the change lists targets named in the cell that the
/// record is not linked to yet. Existing links are never removed.
fn diff_links(
    schema: &ImportSchema,
    row: &ValidatedRow,
    business_key: &str,
    lookups: &LookupIndex,
    separator: char,
) -> Option<ChangeRecord> {
    let link = schema.link?;
    let raw = row.non_blank(link.column)?;
    let missing = lookups
        .resolve_list(link.lookup, raw, separator)
        .ids
        .into_iter()
        .filter(|id| !row.linked.contains(id))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return None;
    }
    let sep = separator.to_string();
    let current = row
        .linked
        .iter()
        .map(|id| lookups.display_label(link.lookup, id).unwrap_or(id))
        .collect::<Vec<_>>();
    Some(ChangeRecord {
        row: row.line,
        business_key: business_key.to_string(),
        field: link.lookup.as_str(),
        old_value: (!current.is_empty()).then(|| current.join(sep.as_str())),
        new_value: raw.to_string(),
        column: link.column,
        applied: Value::from(missing),
    })
}

fn display_old(spec: &ColumnSpec, old: Option<String>, lookups: &LookupIndex) -> Option<String> {
    let old = old?;
    match spec.lookup {
        Some(kind) => Some(
            lookups
                .display_label(kind, &old)
                .map(str::to_string)
                .unwrap_or(old),
        ),
        None => Some(old),
    }
}

pub fn diff_rows(
    schema: &ImportSchema,
    rows: &[ValidatedRow],
    lookups: &LookupIndex,
    separator: char,
) -> DiffReport {
    let mut report = DiffReport::default();
    for row in rows {
        let changes = diff_row(schema, row, lookups, separator);
        if changes.is_empty() {
            report.unchanged.push(row.key.clone());
        } else {
            report.changes.extend(changes);
        }
    }
    report
}
