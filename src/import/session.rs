//! One operator-driven import: `upload -> preview -> executing -> complete`.
//!
//! `preview -> upload` (via [`ImportSession::discard`]) is the only backward
//! step. `complete` is terminal; a new session starts from scratch.

use crate::import::diff::{diff_rows, ChangeRecord, DiffReport};
use crate::import::execute::{
    group_changes, Execution, ExecutionOutcome, ExecutionUnit, ExecutorOptions, ProgressEvent,
};
use crate::import::lookup::{LookupIndex, ReferenceSnapshot};
use crate::import::parser::parse_bytes;
use crate::import::schema::{schema_for, ImportSchema};
use crate::import::validate::{
    rows_with_errors, validate_table, EntitySnapshot, ValidationError, ValidationReport,
};
use crate::import::{ImportError, ImportMode};
use crate::store::RecordStore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Upload,
    Preview,
    Executing,
    Complete,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Preview => "preview",
            Self::Executing => "executing",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub name: Option<String>,
    pub sha256: String,
    pub bytes: usize,
}

/// Outward progress/result surface of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub entity_type: &'static str,
    pub mode: ImportMode,
    pub step: Step,
    pub progress_percent: u8,
    pub source: Option<SourceFile>,
    pub rows_total: usize,
    pub valid_rows: usize,
    pub error_rows: usize,
    pub error_count: usize,
    pub errors: Vec<ValidationError>,
    /// Ignored columns (row 0) and link labels that will not be linked.
    /// Never blocks execution.
    pub notices: Vec<ValidationError>,
    pub changes: Vec<ChangeRecord>,
    pub unchanged: Vec<String>,
    pub pending_units: usize,
    pub can_execute: bool,
    pub outcome: Option<ExecutionOutcome>,
}

pub struct ImportSession {
    schema: &'static ImportSchema,
    mode: ImportMode,
    options: ExecutorOptions,
    lookups: LookupIndex,
    existing: EntitySnapshot,
    step: Step,
    source: Option<SourceFile>,
    report: ValidationReport,
    diff: DiffReport,
    progress_percent: u8,
    outcome: Option<ExecutionOutcome>,
}

impl ImportSession {
    /// Snapshots reference data and the persisted entity set.
    pub fn open<S: RecordStore + ?Sized>(
        entity_type: &str,
        mode: ImportMode,
        options: ExecutorOptions,
        store: &S,
    ) -> Result<Self, ImportError> {
        let schema = schema_for(entity_type)
            .ok_or_else(|| ImportError::UnknownEntity(entity_type.to_string()))?;
        let references = ReferenceSnapshot::load(store)?;
        let lookups = LookupIndex::build(&references);
        let existing = EntitySnapshot::load(schema, store)?;
        info!(
            entity = schema.entity.as_str(),
            mode = mode.as_str(),
            existing = existing.len(),
            classes = references.classes.len(),
            subjects = references.subjects.len(),
            "import session opened"
        );
        Ok(Self {
            schema,
            mode,
            options,
            lookups,
            existing,
            step: Step::Upload,
            source: None,
            report: ValidationReport::default(),
            diff: DiffReport::default(),
            progress_percent: 0,
            outcome: None,
        })
    }

    pub fn schema(&self) -> &'static ImportSchema {
        self.schema
    }

    pub fn mode(&self) -> ImportMode {
        self.mode
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn source(&self) -> Option<&SourceFile> {
        self.source.as_ref()
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.outcome.as_ref()
    }

    /// Parses, validates and (update mode) diffs `bytes`. A structural
    /// failure leaves the session in `upload` with the row-0 error visible.
    pub fn load(&mut self, name: Option<&str>, bytes: &[u8]) -> Result<(), ImportError> {
        if self.step != Step::Upload {
            return Err(ImportError::InvalidTransition {
                from: self.step,
                action: "load a file",
            });
        }
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        self.source = Some(SourceFile {
            name: name.map(str::to_string),
            sha256: format!("{:x}", hasher.finalize()),
            bytes: bytes.len(),
        });

        let table = parse_bytes(bytes);
        self.report = validate_table(self.schema, &table, self.mode, &self.lookups, &self.existing);
        self.diff = match self.mode {
            ImportMode::Update => diff_rows(
                self.schema,
                &self.report.rows,
                &self.lookups,
                self.options.link_separator,
            ),
            ImportMode::Create => DiffReport::default(),
        };

        if table.is_structural_failure() {
            warn!(
                entity = self.schema.entity.as_str(),
                error = %self.report.errors.first().map(|e| e.message.as_str()).unwrap_or(""),
                "file rejected before preview"
            );
            return Ok(());
        }
        self.step = Step::Preview;
        info!(
            entity = self.schema.entity.as_str(),
            rows = self.report.rows_total,
            valid = self.report.rows.len(),
            errors = self.report.error_count(),
            changes = self.diff.changes.len(),
            "file loaded"
        );
        Ok(())
    }

    /// Drops the loaded file and returns to `upload`.
    pub fn discard(&mut self) -> Result<(), ImportError> {
        match self.step {
            Step::Upload | Step::Preview => {
                self.step = Step::Upload;
                self.source = None;
                self.report = ValidationReport::default();
                self.diff = DiffReport::default();
                Ok(())
            }
            from => Err(ImportError::InvalidTransition {
                from,
                action: "discard the file",
            }),
        }
    }

    pub fn pending_units(&self) -> usize {
        match self.mode {
            ImportMode::Create => self.report.rows.len(),
            ImportMode::Update => self
                .diff
                .changes
                .iter()
                .map(|c| c.business_key.as_str())
                .collect::<HashSet<_>>()
                .len(),
        }
    }

    pub fn can_execute(&self) -> bool {
        self.step == Step::Preview && !self.report.has_errors() && self.pending_units() > 0
    }

    fn units(&self) -> Vec<ExecutionUnit> {
        match self.mode {
            ImportMode::Create => self
                .report
                .rows
                .iter()
                .cloned()
                .map(ExecutionUnit::Create)
                .collect(),
            ImportMode::Update => group_changes(&self.diff.changes)
                .into_iter()
                .map(ExecutionUnit::Update)
                .collect(),
        }
    }

    /// Applies every pending unit, reporting each [`ProgressEvent`] to
    /// `on_progress`. Cannot be cancelled once started.
    pub fn execute<S, F>(
        &mut self,
        store: &mut S,
        mut on_progress: F,
    ) -> Result<&ExecutionOutcome, ImportError>
    where
        S: RecordStore + ?Sized,
        F: FnMut(&ProgressEvent),
    {
        if self.step != Step::Preview {
            return Err(ImportError::InvalidTransition {
                from: self.step,
                action: "execute",
            });
        }
        if self.report.has_errors() {
            return Err(ImportError::ValidationBlocked {
                errors: self.report.error_count(),
            });
        }
        let units = self.units();
        if units.is_empty() {
            return Err(ImportError::NothingToApply);
        }

        self.step = Step::Executing;
        self.progress_percent = 0;
        info!(
            entity = self.schema.entity.as_str(),
            mode = self.mode.as_str(),
            units = units.len(),
            "batch started"
        );
        let mut run = Execution::new(self.schema, store, &self.lookups, units, self.options)
            .with_unchanged(self.diff.unchanged.len());
        for event in run.by_ref() {
            self.progress_percent = event.percent;
            on_progress(&event);
        }
        let outcome = run.finish();
        info!(
            entity = self.schema.entity.as_str(),
            created = outcome.created,
            updated = outcome.updated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            links = outcome.links_created,
            links_skipped = outcome.links_skipped,
            "batch complete"
        );
        self.step = Step::Complete;
        Ok(&*self.outcome.insert(outcome))
    }

    fn link_notices(&self) -> Vec<ValidationError> {
        let Some(link) = self.schema.link else {
            return Vec::new();
        };
        let mut notices = Vec::new();
        for row in &self.report.rows {
            let Some(raw) = row.non_blank(link.column) else {
                continue;
            };
            let targets = self
                .lookups
                .resolve_list(link.lookup, raw, self.options.link_separator);
            for label in targets.unresolved {
                notices.push(ValidationError::new(
                    row.line,
                    link.column,
                    format!(
                        "{} '{}' does not match exactly one {} and will not be linked",
                        link.lookup.as_str(),
                        label,
                        link.lookup.as_str()
                    ),
                ));
            }
        }
        notices
    }

    pub fn view(&self) -> SessionView {
        let mut notices = Vec::new();
        if !self.report.ignored_columns.is_empty() {
            notices.push(ValidationError::new(
                0,
                "header",
                format!(
                    "Ignored columns not in the {} schema: {}",
                    self.schema.entity.as_str(),
                    self.report.ignored_columns.join(", ")
                ),
            ));
        }
        notices.extend(self.link_notices());
        SessionView {
            entity_type: self.schema.entity.as_str(),
            mode: self.mode,
            step: self.step,
            progress_percent: self.progress_percent,
            source: self.source.clone(),
            rows_total: self.report.rows_total,
            valid_rows: self.report.rows.len(),
            error_rows: rows_with_errors(&self.report.errors),
            error_count: self.report.error_count(),
            errors: self.report.errors.clone(),
            notices,
            changes: self.diff.changes.clone(),
            unchanged: self.diff.unchanged.clone(),
            pending_units: self.pending_units(),
            can_execute: self.can_execute(),
            outcome: self.outcome.clone(),
        }
    }
}
