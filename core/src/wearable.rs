//! Wearable export bundles.
//!
//! A bundle is a ZIP archive of per-topic CSV files, as produced by the
//! Zepp / Mi Fit "export data" feature. Members are recognised by file-name
//! prefix and folded into one [`PartialRecord`] per date.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{Field, Measurements, PartialRecord};
use crate::table::parse_date_lenient;

/// Which part of the bundle a member holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberKind {
    Activity,
    Vitals,
    Sleep,
}

impl MemberKind {
    /// Classify a member by its file name, ignoring directories and case.
    fn from_name(name: &str) -> Option<MemberKind> {
        let path = Path::new(name);
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if !is_csv {
            return None;
        }
        let stem = path.file_stem()?.to_str()?.to_ascii_uppercase();
        // Per-minute and per-stage tables are not daily summaries.
        if stem.contains("MINUTE") || stem.contains("STAGE") {
            return None;
        }
        if stem.starts_with("ACTIVITY") {
            Some(MemberKind::Activity)
        } else if ["HEALTH", "VITALS", "HEARTRATE"]
            .iter()
            .any(|p| stem.starts_with(p))
        {
            Some(MemberKind::Vitals)
        } else if stem.starts_with("SLEEP") {
            Some(MemberKind::Sleep)
        } else {
            None
        }
    }
}

/// Everything usable from one bundle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WearableBundle {
    /// One row per date, ascending.
    pub rows: Vec<PartialRecord>,
    pub members_used: Vec<String>,
    pub members_skipped: Vec<String>,
}

/// Largest decompressed member accepted. Daily summary files of a multi-year
/// export stay in the low megabytes.
pub const MAX_MEMBER_BYTES: u64 = 64 * 1024 * 1024;

/// Read a wearable export archive.
///
/// Unrecognised and non-CSV members are skipped. Within the bundle, when a
/// date occurs more than once for a field, the last non-zero value wins.
/// A recognised member that decompresses to more than [`MAX_MEMBER_BYTES`]
/// fails the whole bundle.
pub fn parse_bundle<R: Read + Seek>(reader: R) -> Result<WearableBundle> {
    parse_bundle_limited(reader, MAX_MEMBER_BYTES)
}

fn parse_bundle_limited<R: Read + Seek>(
    reader: R,
    max_member_bytes: u64,
) -> Result<WearableBundle> {
    let mut archive = zip::ZipArchive::new(reader).context("Not a valid ZIP archive")?;
    let mut by_date: BTreeMap<NaiveDate, Measurements> = BTreeMap::new();
    let mut bundle = WearableBundle::default();

    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .with_context(|| format!("Failed to read archive member #{i}"))?;
        if member.is_dir() {
            continue;
        }
        let name = member.name().to_string();
        let Some(kind) = MemberKind::from_name(&name) else {
            debug!(member = %name, "skipping unrecognised member");
            bundle.members_skipped.push(name);
            continue;
        };

        if member.size() > max_member_bytes {
            bail!(
                "'{name}' is too large ({} bytes, limit {max_member_bytes})",
                member.size()
            );
        }
        // The declared size is not trusted; stop one byte past the limit.
        let mut content = String::new();
        (&mut member)
            .take(max_member_bytes + 1)
            .read_to_string(&mut content)
            .with_context(|| format!("Failed to read '{name}' from archive"))?;
        if content.len() as u64 > max_member_bytes {
            bail!("'{name}' is too large (limit {max_member_bytes} bytes)");
        }
        let rows = parse_member(kind, &content).with_context(|| format!("Failed to parse '{name}'"))?;
        debug!(member = %name, rows = rows.len(), "parsed member");

        for (date, values) in rows {
            by_date.entry(date).or_default().overlay(&values);
        }
        bundle.members_used.push(name);
    }

    bundle.rows = by_date
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(date, values)| PartialRecord { date, values })
        .collect();
    Ok(bundle)
}

/// Column lookup by lower-cased header name.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        Columns(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.trim().to_lowercase(), i))
                .collect(),
        )
    }

    /// First of `names` present in the header.
    fn find(&self, names: &[&str]) -> Option<usize> {
        names
            .iter()
            .find_map(|n| self.0.get(&n.to_lowercase()).copied())
    }
}

fn number(row: &csv::StringRecord, col: Option<usize>) -> Option<f64> {
    let raw = row.get(col?)?.trim();
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0)
}

fn parse_member(kind: MemberKind, content: &str) -> Result<Vec<(NaiveDate, Measurements)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let cols = Columns::new(rdr.headers()?);
    let Some(date_col) = cols.find(&["date"]) else {
        warn!(?kind, "member has no date column, ignoring it");
        return Ok(Vec::new());
    };

    let mapping: Vec<(Field, Option<usize>)> = match kind {
        MemberKind::Activity => vec![
            (Field::Steps, cols.find(&["steps"])),
            (Field::ActiveKcal, cols.find(&["calories", "active_kcal"])),
        ],
        MemberKind::Vitals => vec![
            (
                Field::RestingHeartRate,
                cols.find(&["resting_heart_rate", "restingHeartRate", "heartRate"]),
            ),
            (Field::Spo2Pct, cols.find(&["spo2", "spo2_pct"])),
            (Field::Systolic, cols.find(&["systolic"])),
            (Field::Diastolic, cols.find(&["diastolic"])),
        ],
        MemberKind::Sleep => Vec::new(),
    };
    let sleep_parts = [
        cols.find(&["deepSleepTime"]),
        cols.find(&["shallowSleepTime"]),
        cols.find(&["remTime"]),
    ];
    let sleep_total = cols.find(&["sleep_minutes"]);

    let mut out = Vec::new();
    for (i, row) in rdr.records().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!(?kind, row = i + 2, error = %e, "skipping unreadable row");
                continue;
            }
        };
        let raw_date = row.get(date_col).unwrap_or("");
        let Some(date) = parse_date_lenient(raw_date) else {
            warn!(?kind, row = i + 2, raw_date, "skipping row with unparseable date");
            continue;
        };

        let mut values = Measurements::default();
        for (field, col) in &mapping {
            values.set(*field, number(&row, *col));
        }
        if kind == MemberKind::Sleep {
            let parts: Vec<f64> = sleep_parts.iter().filter_map(|c| number(&row, *c)).collect();
            let minutes = if parts.is_empty() {
                number(&row, sleep_total)
            } else {
                Some(parts.iter().sum())
            };
            values.set(Field::SleepHours, minutes.map(|m| (m / 60.0 * 100.0).round() / 100.0));
        }
        out.push((date, values));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;
    use zip::write::SimpleFileOptions;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn bundle(members: &[(&str, &str)]) -> Cursor<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    fn row(bundle: &WearableBundle, date: &str) -> Measurements {
        bundle
            .rows
            .iter()
            .find(|r| r.date == d(date))
            .map(|r| r.values.clone())
            .unwrap()
    }

    #[test]
    fn test_member_kinds() {
        assert_eq!(
            MemberKind::from_name("ACTIVITY/ACTIVITY_1700000000.csv"),
            Some(MemberKind::Activity)
        );
        assert_eq!(MemberKind::from_name("heartrate_auto.CSV"), Some(MemberKind::Vitals));
        assert_eq!(MemberKind::from_name("HEALTH_DATA.csv"), Some(MemberKind::Vitals));
        assert_eq!(MemberKind::from_name("SLEEP/SLEEP_1.csv"), Some(MemberKind::Sleep));
        assert_eq!(MemberKind::from_name("ACTIVITY_MINUTE/x.csv"), None);
        assert_eq!(MemberKind::from_name("ACTIVITY_MINUTE_1.csv"), None);
        assert_eq!(MemberKind::from_name("SPORT_1.csv"), None);
        assert_eq!(MemberKind::from_name("ACTIVITY.json"), None);
    }

    #[test]
    fn test_parse_full_bundle() {
        let data = bundle(&[
            (
                "ACTIVITY/ACTIVITY_1.csv",
                "date,steps,distance,runDistance,calories\n\
                 2024-03-01,8500,6100,0,310\n\
                 2024-03-02,0,0,0,0\n",
            ),
            (
                "HEARTRATE_AUTO/HEARTRATE_1.csv",
                "date,time,heartRate\n2024-03-01,07:00,58\n",
            ),
            (
                "HEALTH_1.csv",
                "date,spo2,systolic,diastolic\n2024-03-02,97,121,79\n",
            ),
            (
                "SLEEP/SLEEP_1.csv",
                "date,deepSleepTime,shallowSleepTime,wakeTime,start,stop,REMTime\n\
                 2024-03-01,90,240,10,x,y,75\n",
            ),
            ("USER/USER_1.csv", "userId,gender\n1,0\n"),
            ("readme.txt", "hello"),
        ]);

        let parsed = parse_bundle(data).unwrap();
        assert_eq!(parsed.members_used.len(), 4);
        assert_eq!(parsed.members_skipped.len(), 2);
        assert_eq!(parsed.rows.len(), 2);
        assert!(parsed.rows[0].date < parsed.rows[1].date);

        let day1 = row(&parsed, "2024-03-01");
        assert_eq!(day1.steps, Some(8500));
        assert_eq!(day1.active_kcal, Some(310));
        assert_eq!(day1.resting_heart_rate, Some(58));
        assert_eq!(day1.sleep_hours, Some(6.75));

        let day2 = row(&parsed, "2024-03-02");
        assert!(day2.steps.is_none(), "zero steps mean not recorded");
        assert_eq!(day2.spo2_pct, Some(97));
        assert_eq!(day2.systolic, Some(121));
        assert_eq!(day2.diastolic, Some(79));
    }

    #[test]
    fn test_sleep_minutes_column() {
        let data = bundle(&[("sleep.csv", "date,sleep_minutes\n2024-03-01,450\n")]);
        let parsed = parse_bundle(data).unwrap();
        assert_eq!(row(&parsed, "2024-03-01").sleep_hours, Some(7.5));
    }

    #[test]
    fn test_last_non_zero_wins_within_bundle() {
        let data = bundle(&[(
            "ACTIVITY_1.csv",
            "date,steps,calories\n\
             2024-03-01,1000,50\n\
             2024-03-01,4000,0\n\
             2024-03-01,0,0\n",
        )]);
        let parsed = parse_bundle(data).unwrap();
        let day = row(&parsed, "2024-03-01");
        assert_eq!(day.steps, Some(4000));
        assert_eq!(day.active_kcal, Some(50));
    }

    #[test]
    fn test_missing_members_and_bad_rows() {
        let data = bundle(&[(
            "ACTIVITY_1.csv",
            "date,steps\nnot-a-date,100\n2024-03-05,abc\n2024-03-06,700\n",
        )]);
        let parsed = parse_bundle(data).unwrap();
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(row(&parsed, "2024-03-06").steps, Some(700));
        assert!(row(&parsed, "2024-03-06").sleep_hours.is_none());
    }

    #[test]
    fn test_member_without_date_column_is_ignored() {
        let data = bundle(&[("ACTIVITY_1.csv", "day,steps\n1,100\n")]);
        let parsed = parse_bundle(data).unwrap();
        assert!(parsed.rows.is_empty());
    }

    #[test]
    fn test_not_a_zip() {
        let err = parse_bundle(Cursor::new(b"date,steps\n".to_vec())).unwrap_err();
        assert!(err.to_string().contains("ZIP"));
    }

    #[test]
    fn test_oversized_member_is_rejected() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("ACTIVITY/ACTIVITY_1.csv", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"date,steps\n").unwrap();
        for _ in 0..200 {
            writer.write_all(b"2024-01-01,8000\n").unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let err = parse_bundle_limited(Cursor::new(bytes.clone()), 1024).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");

        let bundle = parse_bundle_limited(Cursor::new(bytes), 64 * 1024).unwrap();
        assert_eq!(bundle.rows.len(), 1);
    }

    #[test]
    fn test_skipped_members_are_never_read() {
        // A large member that is not a daily summary costs nothing
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("HEARTRATE_MINUTE/HR_MINUTE.csv", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&vec![b'0'; 8 * 1024]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let bundle = parse_bundle_limited(Cursor::new(bytes), 1024).unwrap();
        assert!(bundle.rows.is_empty());
        assert_eq!(bundle.members_skipped.len(), 1);
    }
}
