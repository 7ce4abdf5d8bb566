//! Label -> identifier indices for reference entities (classes, subjects).
//!
//! A [`LookupIndex`] is a plain value built from a [`ReferenceSnapshot`]; it is
//! rebuilt whenever a session opens and passed explicitly to the validator,
//! the diff engine and the executor.

use crate::import::normalize_key;
use crate::store::{Fields, Record, RecordStore, StoreError};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Class,
    Subject,
}

impl LookupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Subject => "subject",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Class => "classes",
            Self::Subject => "subjects",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRef {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub level: Option<String>,
    pub stream: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRef {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceSnapshot {
    pub classes: Vec<ClassRef>,
    pub subjects: Vec<SubjectRef>,
}

fn non_blank(r: &Record, field: &str) -> Option<String> {
    r.text(field)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl ReferenceSnapshot {
    pub fn load<S: RecordStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let classes = store
            .query(LookupKind::Class.table(), &Fields::new())?
            .into_iter()
            .map(|r| ClassRef {
                name: non_blank(&r, "name").unwrap_or_default(),
                code: non_blank(&r, "code"),
                level: non_blank(&r, "level"),
                stream: non_blank(&r, "stream"),
                id: r.id,
            })
            .collect();
        let subjects = store
            .query(LookupKind::Subject.table(), &Fields::new())?
            .into_iter()
            .map(|r| SubjectRef {
                name: non_blank(&r, "name").unwrap_or_default(),
                code: non_blank(&r, "code"),
                id: r.id,
            })
            .collect();
        Ok(Self { classes, subjects })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    Found(&'a str),
    Missing,
    /// The label belongs to more than one reference entity.
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Unique(String),
    Ambiguous,
}

#[derive(Debug, Clone, Default)]
struct KindIndex {
    by_label: HashMap<String, Slot>,
    /// Label variants per id, in registration order (name, code, composite).
    labels_by_id: HashMap<String, Vec<String>>,
}

impl KindIndex {
    fn register(&mut self, id: &str, label: &str) {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return;
        }
        let key = normalize_key(trimmed);
        match self.by_label.get(&key) {
            Some(Slot::Unique(existing)) if existing != id => {
                self.by_label.insert(key, Slot::Ambiguous);
            }
            Some(_) => {}
            None => {
                self.by_label.insert(key, Slot::Unique(id.to_string()));
            }
        }
        let labels = self.labels_by_id.entry(id.to_string()).or_default();
        if !labels.iter().any(|l| l == trimmed) {
            labels.push(trimmed.to_string());
        }
    }
}

/// Resolved labels of one link cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkTargets {
    /// Deduplicated, in cell order.
    pub ids: Vec<String>,
    /// Labels matching no record or more than one.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LookupIndex {
    kinds: HashMap<LookupKind, KindIndex>,
}

impl LookupIndex {
    pub fn build(snapshot: &ReferenceSnapshot) -> Self {
        let mut classes = KindIndex::default();
        for c in &snapshot.classes {
            classes.register(&c.id, &c.name);
            if let Some(code) = &c.code {
                classes.register(&c.id, code);
            }
            if let (Some(level), Some(stream)) = (&c.level, &c.stream) {
                classes.register(&c.id, &format!("{} {}", level.trim(), stream.trim()));
            }
        }

        let mut subjects = KindIndex::default();
        for s in &snapshot.subjects {
            subjects.register(&s.id, &s.name);
            if let Some(code) = &s.code {
                subjects.register(&s.id, code);
            }
        }

        let mut kinds = HashMap::new();
        kinds.insert(LookupKind::Class, classes);
        kinds.insert(LookupKind::Subject, subjects);
        Self { kinds }
    }

    /// Exact, case-insensitive label lookup. No partial or fuzzy matching.
    pub fn resolve(&self, kind: LookupKind, label: &str) -> Resolution<'_> {
        let Some(index) = self.kinds.get(&kind) else {
            return Resolution::Missing;
        };
        match index.by_label.get(&normalize_key(label)) {
            Some(Slot::Unique(id)) => Resolution::Found(id.as_str()),
            Some(Slot::Ambiguous) => Resolution::Ambiguous,
            None => Resolution::Missing,
        }
    }

    /// Splits a multi-valued cell on `separator` and resolves every label.
    pub fn resolve_list(&self, kind: LookupKind, raw: &str, separator: char) -> LinkTargets {
        let mut targets = LinkTargets::default();
        for label in raw.split(separator).map(str::trim).filter(|l| !l.is_empty()) {
            match self.resolve(kind, label) {
                Resolution::Found(id) => {
                    if !targets.ids.iter().any(|t| t == id) {
                        targets.ids.push(id.to_string());
                    }
                }
                Resolution::Missing | Resolution::Ambiguous => {
                    targets.unresolved.push(label.to_string());
                }
            }
        }
        targets
    }

    /// First registered label that resolves back to `id` on its own.
    pub fn display_label(&self, kind: LookupKind, id: &str) -> Option<&str> {
        let index = self.kinds.get(&kind)?;
        let labels = index.labels_by_id.get(id)?;
        labels
            .iter()
            .find(|l| {
                matches!(
                    index.by_label.get(&normalize_key(l)),
                    Some(Slot::Unique(owner)) if owner == id
                )
            })
            .or_else(|| labels.first())
            .map(String::as_str)
    }
}
