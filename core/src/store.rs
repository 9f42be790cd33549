//! The record store: one CSV blob holding the day-indexed table.
//!
//! Every operation is a full load → mutate → save cycle. Saves are
//! conditioned on the version observed at load; a concurrent writer turns
//! the save into [`StoreError::Conflict`] and the caller decides whether to
//! retry (see [`retry_on_conflict`]).

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, VersionToken};
use crate::error::{Result, StoreError};
use crate::models::{Field, Measurements, PartialRecord, Record, validate_measurements};
use crate::table::{LoadReport, Table};

/// A freshly loaded table and the version it was read at.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub table: Table,
    /// `None` when the blob does not exist yet.
    pub version: Option<VersionToken>,
    pub report: LoadReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub date: NaiveDate,
    pub inserted: bool,
    pub version: VersionToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub rows_in: usize,
    pub dates_added: usize,
    pub dates_updated: usize,
    pub fields_written: usize,
    /// Version after the write; `None` when nothing changed and nothing was written.
    pub version: Option<VersionToken>,
}

pub struct RecordStore<B> {
    backend: B,
    path: String,
}

impl<B: BlobStore> RecordStore<B> {
    pub fn new(backend: B, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Load the table. A missing blob yields an empty table.
    pub fn load(&self) -> Result<Loaded> {
        let blob = match self.backend.get(&self.path) {
            Ok(blob) => blob,
            Err(StoreError::NotFound(_)) => {
                debug!(path = %self.path, "blob missing, starting with an empty table");
                return Ok(Loaded {
                    table: Table::new(),
                    version: None,
                    report: LoadReport::default(),
                });
            }
            Err(e) => return Err(e),
        };

        let (table, report) = Table::from_csv(blob.content.as_bytes())?;
        if !report.dropped_rows.is_empty() {
            warn!(
                path = %self.path,
                dropped = report.dropped_rows.len(),
                "rows with unparseable dates were dropped"
            );
        }
        debug!(
            path = %self.path,
            records = table.len(),
            version = %blob.version,
            "table loaded"
        );
        Ok(Loaded {
            table,
            version: Some(blob.version),
            report,
        })
    }

    /// Write the full record for `date`, replacing every field of an
    /// existing record. Fields left `None` are stored as not recorded.
    pub fn upsert(&self, date: NaiveDate, values: Measurements) -> Result<UpsertOutcome> {
        validate_measurements(&values).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;

        let Loaded {
            mut table, version, ..
        } = self.load()?;
        let inserted = table.upsert(Record::new(date, values));
        let message = if inserted {
            format!("Add health record for {}", date.format("%Y-%m-%d"))
        } else {
            format!("Update health record for {}", date.format("%Y-%m-%d"))
        };
        let version = self.save(&table, version.as_ref(), &message)?;
        Ok(UpsertOutcome {
            date,
            inserted,
            version,
        })
    }

    /// Overwrite the whole table, checked against the version current right now.
    pub fn replace_all(&self, table: Table) -> Result<VersionToken> {
        let current = self.load()?.version;
        self.replace_all_at(table, current.as_ref())
    }

    /// Overwrite the whole table, checked against a version the caller loaded
    /// earlier. Use this when the new table was derived from that load.
    pub fn replace_all_at(
        &self,
        table: Table,
        expected: Option<&VersionToken>,
    ) -> Result<VersionToken> {
        let table = Table::from_records(table.into_records());
        let message = format!("Replace health table ({} records)", table.len());
        self.save(&table, expected, &message)
    }

    /// Remove the record for `date`. Returns `false` (and writes nothing)
    /// when there is no such record.
    pub fn delete(&self, date: NaiveDate) -> Result<bool> {
        let Loaded {
            mut table, version, ..
        } = self.load()?;
        if !table.remove(date) {
            return Ok(false);
        }
        let message = format!("Delete health record for {}", date.format("%Y-%m-%d"));
        self.save(&table, version.as_ref(), &message)?;
        Ok(true)
    }

    /// Merge externally sourced values field by field: a value the import
    /// records overwrites, a value it lacks leaves the stored one alone.
    pub fn merge_external(&self, rows: &[PartialRecord]) -> Result<MergeSummary> {
        let Loaded {
            mut table, version, ..
        } = self.load()?;
        let mut summary = merge_rows(&mut table, rows);
        if summary.dates_added + summary.fields_written == 0 {
            info!(path = %self.path, rows = rows.len(), "import brought nothing new");
            return Ok(summary);
        }
        let message = format!(
            "Merge wearable import ({} new, {} updated dates)",
            summary.dates_added, summary.dates_updated
        );
        summary.version = Some(self.save(&table, version.as_ref(), &message)?);
        Ok(summary)
    }

    fn save(
        &self,
        table: &Table,
        expected: Option<&VersionToken>,
        message: &str,
    ) -> Result<VersionToken> {
        let content = table.to_csv()?;
        let result = match expected {
            Some(token) => self.backend.put(&self.path, &content, message, token),
            None => self.backend.create(&self.path, &content, message),
        };
        match result {
            Ok(version) => {
                info!(path = %self.path, %version, records = table.len(), message, "table saved");
                Ok(version)
            }
            // Deleted underneath us: as stale as a newer version.
            Err(StoreError::NotFound(_)) => Err(StoreError::conflict(&self.path)),
            Err(e) => {
                if e.is_conflict() {
                    warn!(path = %self.path, "save rejected: table changed since it was loaded");
                }
                Err(e)
            }
        }
    }
}

/// Apply `rows` to `table` with last-non-zero-wins per field.
pub fn merge_rows(table: &mut Table, rows: &[PartialRecord]) -> MergeSummary {
    let mut summary = MergeSummary {
        rows_in: rows.len(),
        ..MergeSummary::default()
    };
    let mut touched: Vec<NaiveDate> = Vec::new();

    for row in rows {
        let incoming = row.values.normalized();
        if incoming.is_empty() {
            continue;
        }
        if let Some(existing) = table.get_mut(row.date) {
            let changed = existing.values.overlay(&incoming);
            if changed > 0 {
                summary.fields_written += changed;
                if !touched.contains(&row.date) {
                    touched.push(row.date);
                    summary.dates_updated += 1;
                }
            }
        } else {
            let record = Record::new(row.date, incoming);
            summary.fields_written += Field::ALL
                .into_iter()
                .filter(|f| record.get(*f).is_some())
                .count();
            table.upsert(record);
            touched.push(row.date);
            summary.dates_added += 1;
        }
    }
    summary
}

/// Dry run of [`RecordStore::merge_external`] against an already loaded table.
#[must_use]
pub fn preview_merge(table: &Table, rows: &[PartialRecord]) -> MergeSummary {
    let mut scratch = table.clone();
    merge_rows(&mut scratch, rows)
}

/// Run a load → mutate → save operation, re-running it after a
/// [`StoreError::Conflict`] up to `attempts` times in total.
///
/// Any other error is returned immediately.
pub fn retry_on_conflict<T>(attempts: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_conflict() && attempt < attempts => {
                warn!(attempt, attempts, "conflicting write detected, reloading and retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}
