//! Blank templates and pre-filled exports in schema column order.

use crate::import::error::ImportError;
use crate::import::lookup::{LookupIndex, ReferenceSnapshot};
use crate::import::schema::{ColumnKind, ColumnSpec, ImportSchema};
use crate::import::validate::{load_links, parse_date, LinkMap};
use crate::store::{Fields, Record, RecordStore};

fn write_csv(header: &[&str], rows: &[Vec<String>]) -> Result<String, ImportError> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(header)?;
    for row in rows {
        w.write_record(row)?;
    }
    let bytes = w
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Header row plus one example row.
pub fn template_csv(schema: &ImportSchema) -> Result<String, ImportError> {
    let example = schema
        .columns
        .iter()
        .map(|c| c.example.to_string())
        .collect::<Vec<_>>();
    write_csv(&schema.header(), &[example])
}

fn export_cell(spec: &ColumnSpec, record: &Record, lookups: &LookupIndex) -> String {
    let Some(value) = record.text(spec.column) else {
        return String::new();
    };
    match (spec.kind, spec.lookup) {
        (ColumnKind::Lookup, Some(kind)) => lookups
            .display_label(kind, &value)
            .map(str::to_string)
            .unwrap_or(value),
        (ColumnKind::Date, _) => parse_date(spec.date_formats, &value)
            .zip(spec.date_formats.first())
            .map(|(d, f)| d.format(f).to_string())
            .unwrap_or(value),
        _ => value,
    }
}

/// Renders `records` so that re-importing the unedited file in update mode
/// detects no changes. `links` maps owner id to linked target ids.
pub fn export_csv(
    schema: &ImportSchema,
    records: &[Record],
    lookups: &LookupIndex,
    links: &LinkMap,
    separator: char,
) -> Result<String, ImportError> {
    let sep = separator.to_string();
    let rows = records
        .iter()
        .map(|record| {
            schema
                .columns
                .iter()
                .map(|spec| match schema.link.filter(|l| l.column == spec.name) {
                    Some(link) => links
                        .get(&record.id)
                        .map(|targets| {
                            targets
                                .iter()
                                .map(|t| lookups.display_label(link.lookup, t).unwrap_or(t))
                                .collect::<Vec<_>>()
                                .join(sep.as_str())
                        })
                        .unwrap_or_default(),
                    None => export_cell(spec, record, lookups),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    write_csv(&schema.header(), &rows)
}

/// Loads every entity of `schema`'s type (and its links) and exports it.
pub fn export_entities<S: RecordStore + ?Sized>(
    schema: &ImportSchema,
    store: &S,
    separator: char,
) -> Result<String, ImportError> {
    let lookups = LookupIndex::build(&ReferenceSnapshot::load(store)?);
    let records = store.query(schema.table, &Fields::new())?;

    let links = match schema.link {
        Some(link) => load_links(&link, store)?,
        None => LinkMap::new(),
    };
    export_csv(schema, &records, &lookups, &links, separator)
}
