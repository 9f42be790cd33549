use std::collections::BTreeMap;
use std::io::Read;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::models::{Field, Record};

/// Header name of the key column.
pub const DATE_COLUMN: &str = "date";

/// The day-indexed table: at most one record per date, sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    records: Vec<Record>,
    /// Unknown columns seen in the blob, in first-seen order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_columns: Vec<String>,
}

/// A row that was dropped while reading the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRow {
    /// 1-based line number in the blob (the header is line 1).
    pub line: u64,
    pub raw_date: String,
}

/// What happened while reading a blob into a [`Table`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub rows_read: usize,
    pub dropped_rows: Vec<DroppedRow>,
    pub invalid_cells: usize,
    pub duplicate_dates: usize,
    /// Known columns that were missing from the header and read as absent.
    pub backfilled_columns: Vec<&'static str>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from records in any order. When a date occurs more than
    /// once the last occurrence wins.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self::from_records_counted(records).0
    }

    fn from_records_counted(records: impl IntoIterator<Item = Record>) -> (Self, usize) {
        let mut by_date: BTreeMap<NaiveDate, Record> = BTreeMap::new();
        let mut extra_columns: Vec<String> = Vec::new();
        let mut duplicates = 0;
        for mut record in records {
            record.values = record.values.normalized();
            for key in record.extra.keys() {
                if !extra_columns.contains(key) {
                    extra_columns.push(key.clone());
                }
            }
            if by_date.insert(record.date, record).is_some() {
                duplicates += 1;
            }
        }
        let table = Self {
            records: by_date.into_values().collect(),
            extra_columns,
        };
        (table, duplicates)
    }

    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    #[must_use]
    pub fn get(&self, date: NaiveDate) -> Option<&Record> {
        self.records
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn get_mut(&mut self, date: NaiveDate) -> Option<&mut Record> {
        self.records
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|i| &mut self.records[i])
    }

    /// The most recent `n` records (fewer if the table is shorter).
    #[must_use]
    pub fn latest(&self, n: usize) -> &[Record] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    #[must_use]
    pub fn last(&self) -> Option<&Record> {
        self.records.last()
    }

    /// Insert or fully replace the record for `record.date`.
    ///
    /// Returns `true` when the date was not present before. Unknown columns
    /// of a replaced record are kept unless the new record carries its own.
    pub fn upsert(&mut self, mut record: Record) -> bool {
        record.values = record.values.normalized();
        for key in record.extra.keys() {
            if !self.extra_columns.contains(key) {
                self.extra_columns.push(key.clone());
            }
        }
        match self.records.binary_search_by_key(&record.date, |r| r.date) {
            Ok(i) => {
                if record.extra.is_empty() {
                    record.extra = std::mem::take(&mut self.records[i].extra);
                }
                self.records[i] = record;
                false
            }
            Err(i) => {
                self.records.insert(i, record);
                true
            }
        }
    }

    /// Remove the record for `date`, returning whether one existed.
    pub fn remove(&mut self, date: NaiveDate) -> bool {
        match self.records.binary_search_by_key(&date, |r| r.date) {
            Ok(i) => {
                self.records.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Parse a CSV blob.
    ///
    /// Known columns missing from the header read as absent; unknown columns
    /// are carried through. Rows whose date cannot be parsed are dropped and
    /// reported. Duplicate dates keep the last row.
    pub fn from_csv<R: Read>(reader: R) -> Result<(Table, LoadReport)> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let mut report = LoadReport::default();

        if headers.iter().all(str::is_empty) {
            report.backfilled_columns = Field::ALL.iter().map(|f| f.column()).collect();
            return Ok((Table::new(), report));
        }

        let idx_date = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(DATE_COLUMN))
            .ok_or_else(|| StoreError::malformed("missing 'date' column"))?;

        let mut known: Vec<(usize, Field)> = Vec::new();
        let mut extra: Vec<(usize, String)> = Vec::new();
        for (i, name) in headers.iter().enumerate() {
            if i == idx_date || name.is_empty() {
                continue;
            }
            match Field::from_column(name) {
                Some(field) if !known.iter().any(|(_, f)| *f == field) => known.push((i, field)),
                Some(_) => {}
                None => extra.push((i, name.to_string())),
            }
        }
        for field in Field::ALL {
            if !known.iter().any(|(_, f)| *f == field) {
                report.backfilled_columns.push(field.column());
            }
        }
        if !report.backfilled_columns.is_empty() {
            debug!(
                columns = ?report.backfilled_columns,
                "backfilling columns missing from table header"
            );
        }

        let mut records = Vec::new();
        for (row_num, result) in rdr.records().enumerate() {
            let row = result?;
            let line = row
                .position()
                .map_or(row_num as u64 + 2, csv::Position::line);

            if row.iter().all(str::is_empty) {
                continue;
            }
            report.rows_read += 1;

            let raw_date = row.get(idx_date).unwrap_or("");
            let Some(date) = parse_date_lenient(raw_date) else {
                warn!(line, raw_date, "dropping row with unparseable date");
                report.dropped_rows.push(DroppedRow {
                    line,
                    raw_date: raw_date.to_string(),
                });
                continue;
            };

            let mut record = Record::new(date, crate::models::Measurements::default());
            for (i, field) in &known {
                let cell = row.get(*i).unwrap_or("");
                match parse_cell(cell) {
                    Ok(value) => record.values.set(*field, value),
                    Err(()) => {
                        warn!(line, column = field.column(), cell, "ignoring invalid numeric cell");
                        report.invalid_cells += 1;
                    }
                }
            }
            for (i, name) in &extra {
                if let Some(cell) = row.get(*i) {
                    record.extra.insert(name.clone(), cell.to_string());
                }
            }
            records.push(record);
        }

        let (mut table, duplicates) = Table::from_records_counted(records);
        report.duplicate_dates = duplicates;
        // Keep the blob's column order for unknown columns.
        table.extra_columns = extra.into_iter().map(|(_, name)| name).collect();
        Ok((table, report))
    }

    /// Render the table as CSV with the full current schema.
    pub fn to_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(Vec::new());

        let mut header: Vec<&str> = vec![DATE_COLUMN];
        header.extend(Field::ALL.iter().map(|f| f.column()));
        header.extend(self.extra_columns.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for record in &self.records {
            let mut row: Vec<String> = Vec::with_capacity(header.len());
            row.push(record.date.format("%Y-%m-%d").to_string());
            for field in Field::ALL {
                row.push(format_cell(field, record.get(field)));
            }
            for name in &self.extra_columns {
                row.push(record.extra.get(name).cloned().unwrap_or_default());
            }
            wtr.write_record(&row)?;
        }

        let bytes = wtr
            .into_inner()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Parse a date the way spreadsheet exports write them.
///
/// Tries ISO first, then ISO timestamps (keeping the date part), then
/// `M/D/YYYY`, `D/M/YYYY` and `D.M.YYYY`.
#[must_use]
pub fn parse_date_lenient(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    // "2024-01-15T08:30:00.123" and similar: the date part is all we need
    if s.len() > 10 && s.is_char_boundary(10) && matches!(s.as_bytes()[10], b'T' | b' ') {
        if let Ok(d) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            return Some(d);
        }
    }
    for fmt in ["%m/%d/%Y", "%d/%m/%Y", "%d.%m.%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

/// Empty and zero cells mean "not recorded".
fn parse_cell(cell: &str) -> std::result::Result<Option<f64>, ()> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    // Zero survives here; `Measurements::set` clears it.
    cell.parse::<f64>().map(Some).map_err(|_| ())
}

fn format_cell(field: Field, value: Option<f64>) -> String {
    match value {
        None => "0".to_string(),
        Some(v) if field.is_integer() => format!("{v:.0}"),
        Some(v) => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Measurements;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    const LEGACY_CSV: &str = "\
date,weight_kg,height_m,calories_kcal,protein_g,steps,sleep_hours
2024-01-02,79.8,1.80,2100,150,8000,7.5
2024-01-01,80.0,1.80,2000,140,0,7
";

    #[test]
    fn test_from_csv_sorts_and_backfills() {
        let (table, report) = Table::from_csv(LEGACY_CSV.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[0].date, d("2024-01-01"));
        assert_eq!(table.records()[1].date, d("2024-01-02"));

        let first = &table.records()[0];
        assert_eq!(first.values.weight_kg, Some(80.0));
        assert!(first.values.steps.is_none(), "zero reads as absent");
        assert!(first.values.resting_heart_rate.is_none());

        assert!(report.backfilled_columns.contains(&"resting_heart_rate"));
        assert!(report.backfilled_columns.contains(&"active_kcal"));
        assert!(!report.backfilled_columns.contains(&"weight_kg"));
        assert!(report.dropped_rows.is_empty());
    }

    #[test]
    fn test_from_csv_drops_unparseable_dates() {
        let csv = "\
date,weight_kg
2024-01-01,80
not-a-date,81
,82
2024-01-03,79
";
        let (table, report) = Table::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.dropped_rows.len(), 2);
        assert_eq!(report.dropped_rows[0].raw_date, "not-a-date");
        assert_eq!(report.dropped_rows[0].line, 3);
    }

    #[test]
    fn test_from_csv_dedup_keeps_last() {
        let csv = "\
date,weight_kg,steps
2024-01-01,80,1000
2024-01-02,79.9,2000
2024-01-01,81,3000
";
        let (table, report) = Table::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(report.duplicate_dates, 1);
        let rec = table.get(d("2024-01-01")).unwrap();
        assert_eq!(rec.values.weight_kg, Some(81.0));
        assert_eq!(rec.values.steps, Some(3000));
    }

    #[test]
    fn test_from_csv_invalid_cell_reads_absent() {
        let csv = "date,weight_kg,steps\n2024-01-01,eighty,4000\n";
        let (table, report) = Table::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(report.invalid_cells, 1);
        let rec = &table.records()[0];
        assert!(rec.values.weight_kg.is_none());
        assert_eq!(rec.values.steps, Some(4000));
    }

    #[test]
    fn test_from_csv_missing_date_column() {
        let csv = "day,weight_kg\n2024-01-01,80\n";
        let err = Table::from_csv(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
        assert!(err.to_string().contains("date"));
    }

    #[test]
    fn test_from_csv_empty_blob() {
        let (table, report) = Table::from_csv("".as_bytes()).unwrap();
        assert!(table.is_empty());
        assert_eq!(report.backfilled_columns.len(), Field::ALL.len());
    }

    #[test]
    fn test_unknown_columns_survive_roundtrip() {
        let csv = "\
date,weight_kg,mood,hydration_l
2024-01-01,80,good,2.5
2024-01-02,79.5,,3
";
        let (table, _) = Table::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(table.extra_columns(), ["mood", "hydration_l"]);

        let written = table.to_csv().unwrap();
        let header = written.lines().next().unwrap();
        assert!(header.starts_with("date,weight_kg,height_m"));
        assert!(header.ends_with("active_kcal,mood,hydration_l"));

        let (reread, _) = Table::from_csv(written.as_bytes()).unwrap();
        assert_eq!(reread, table);
        assert_eq!(reread.records()[0].extra["mood"], "good");
        assert_eq!(reread.records()[1].extra["hydration_l"], "3");
    }

    #[test]
    fn test_to_csv_writes_sentinels_and_iso_dates() {
        let table = Table::from_records([Record::new(
            d("2024-03-05"),
            Measurements {
                weight_kg: Some(72.25),
                steps: Some(9000),
                ..Measurements::default()
            },
        )]);
        let csv = table.to_csv().unwrap();
        let row = csv.lines().nth(1).unwrap();
        assert_eq!(row, "2024-03-05,72.25,0,0,0,0,9000,0,0,0,0,0,0,0");
    }

    #[test]
    fn test_roundtrip_equals_deduped_sorted_input() {
        let records = vec![
            Record::new(
                d("2024-01-03"),
                Measurements {
                    weight_kg: Some(79.7),
                    sleep_hours: Some(6.75),
                    ..Measurements::default()
                },
            ),
            Record::new(
                d("2024-01-01"),
                Measurements {
                    weight_kg: Some(80.1),
                    energy_level: Some(6),
                    ..Measurements::default()
                },
            ),
            Record::new(
                d("2024-01-03"),
                Measurements {
                    weight_kg: Some(79.6),
                    ..Measurements::default()
                },
            ),
        ];
        let table = Table::from_records(records);
        assert_eq!(table.len(), 2);

        let (reread, _) = Table::from_csv(table.to_csv().unwrap().as_bytes()).unwrap();
        assert_eq!(reread, table);
        assert_eq!(reread.get(d("2024-01-03")).unwrap().values.weight_kg, Some(79.6));
    }

    #[test]
    fn test_upsert_and_remove() {
        let mut table = Table::new();
        let date = d("2024-01-01");
        assert!(table.upsert(Record::new(date, Measurements::default())));
        assert!(!table.upsert(Record::new(
            date,
            Measurements {
                steps: Some(10),
                ..Measurements::default()
            }
        )));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(date).unwrap().values.steps, Some(10));
        assert!(table.remove(date));
        assert!(!table.remove(date));
        assert!(table.is_empty());
    }

    #[test]
    fn test_upsert_replacement_registers_new_columns() {
        let mut table = Table::new();
        let date = d("2024-01-01");
        table.upsert(Record::new(date, Measurements::default()));

        let mut replacement = Record::new(
            date,
            Measurements {
                steps: Some(10),
                ..Measurements::default()
            },
        );
        replacement.extra.insert("mood".to_string(), "good".to_string());
        assert!(!table.upsert(replacement));

        assert_eq!(table.extra_columns(), ["mood"]);
        let csv = table.to_csv().unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().ends_with(",mood"));
        assert!(lines.next().unwrap().ends_with(",good"));
    }

    #[test]
    fn test_latest_window() {
        let table = Table::from_records(
            (1..=10).map(|day| Record::new(d(&format!("2024-01-{day:02}")), Measurements::default())),
        );
        assert_eq!(table.latest(3).len(), 3);
        assert_eq!(table.latest(3)[0].date, d("2024-01-08"));
        assert_eq!(table.latest(50).len(), 10);
    }

    #[test]
    fn test_parse_date_lenient() {
        assert_eq!(parse_date_lenient("2024-01-15"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("2024/01/15"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("2024-01-15 08:30:00"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("2024-01-15T08:30:00.250"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("2024-01-15T08:30:00+02:00"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("1/15/2024"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("15/01/2024"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("15.01.2024"), Some(d("2024-01-15")));
        assert_eq!(parse_date_lenient("yesterday"), None);
        assert_eq!(parse_date_lenient(""), None);
    }
}
