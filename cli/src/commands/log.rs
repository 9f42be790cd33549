use anyhow::{Result, bail};
use clap::Args;

use vitals_core::metrics::latest_non_sentinel;
use vitals_core::models::{Field, Measurements, validate_measurements};
use vitals_core::store::retry_on_conflict;

use super::helpers::{json_error, parse_date, print_records_table};
use super::{LOG_ATTEMPTS, Store};

/// Measurements for one day. Anything left out is stored as not recorded.
#[derive(Args, Debug, Default)]
pub(crate) struct MeasurementArgs {
    /// Body weight in kg
    #[arg(long)]
    pub weight: Option<f64>,
    /// Height in metres (default: last recorded height)
    #[arg(long)]
    pub height: Option<f64>,
    /// Waist circumference in cm
    #[arg(long)]
    pub waist: Option<f64>,
    /// Calories eaten (kcal)
    #[arg(long)]
    pub calories: Option<u32>,
    /// Protein eaten (g)
    #[arg(long)]
    pub protein: Option<u32>,
    /// Step count
    #[arg(long)]
    pub steps: Option<u32>,
    /// Hours slept
    #[arg(long)]
    pub sleep: Option<f64>,
    /// Resting heart rate (bpm)
    #[arg(long = "resting-hr")]
    pub resting_hr: Option<u32>,
    /// Blood oxygen saturation (%)
    #[arg(long)]
    pub spo2: Option<u32>,
    /// Systolic blood pressure (mmHg)
    #[arg(long)]
    pub systolic: Option<u32>,
    /// Diastolic blood pressure (mmHg)
    #[arg(long)]
    pub diastolic: Option<u32>,
    /// Energy level, 1-10
    #[arg(long)]
    pub energy: Option<u32>,
    /// Active energy burned (kcal)
    #[arg(long)]
    pub active_kcal: Option<u32>,
}

impl MeasurementArgs {
    pub(crate) fn into_measurements(self) -> Measurements {
        Measurements {
            weight_kg: self.weight,
            height_m: self.height,
            waist_cm: self.waist,
            calories_kcal: self.calories,
            protein_g: self.protein,
            steps: self.steps,
            sleep_hours: self.sleep,
            resting_heart_rate: self.resting_hr,
            spo2_pct: self.spo2,
            systolic: self.systolic,
            diastolic: self.diastolic,
            energy_level: self.energy,
            active_kcal: self.active_kcal,
        }
        .normalized()
    }
}

pub(crate) fn cmd_log(
    store: &Store,
    date: Option<String>,
    args: MeasurementArgs,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let mut values = args.into_measurements();
    if values.is_empty() {
        bail!("Nothing to log. Pass at least one measurement, e.g. --weight 80.5");
    }
    validate_measurements(&values)?;

    if values.height_m.is_none() {
        let loaded = store.load()?;
        values.height_m = latest_non_sentinel(&loaded.table, Field::HeightM);
    }

    let outcome = retry_on_conflict(LOG_ATTEMPTS, || store.upsert(date, values.clone()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "date": date,
                "inserted": outcome.inserted,
                "version": outcome.version,
                "values": values,
            })
        );
    } else {
        let verb = if outcome.inserted { "Logged" } else { "Replaced" };
        let fields: Vec<String> = Field::ALL
            .into_iter()
            .filter_map(|f| values.get(f).map(|v| format!("{f}={v}")))
            .collect();
        println!(
            "{verb} record for {}: {}",
            date.format("%Y-%m-%d"),
            fields.join(", ")
        );
    }

    Ok(())
}

pub(crate) fn cmd_show(store: &Store, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let loaded = store.load()?;

    if let Some(record) = loaded.table.get(date) {
        if json {
            println!("{}", serde_json::to_string_pretty(record)?);
        } else {
            print_records_table(std::slice::from_ref(record));
            for (column, value) in &record.extra {
                println!("  {column}: {value}");
            }
        }
    } else {
        let date_str = date.format("%Y-%m-%d");
        if json {
            println!("{}", json_error(&format!("No record for {date_str}")));
        } else {
            eprintln!("No record for {date_str}");
        }
    }

    Ok(())
}

pub(crate) fn cmd_delete(store: &Store, date: &str, json: bool) -> Result<()> {
    let date = parse_date(Some(date.to_string()))?;
    let deleted = retry_on_conflict(LOG_ATTEMPTS, || store.delete(date))?;
    if !deleted {
        bail!("No record for {}", date.format("%Y-%m-%d"));
    }

    if json {
        println!("{}", serde_json::json!({ "deleted": date }));
    } else {
        println!("Deleted record for {}", date.format("%Y-%m-%d"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_store;
    use chrono::NaiveDate;

    #[test]
    fn test_into_measurements_drops_zeros() {
        let args = MeasurementArgs {
            weight: Some(80.5),
            steps: Some(0),
            ..MeasurementArgs::default()
        };
        let m = args.into_measurements();
        assert_eq!(m.weight_kg, Some(80.5));
        assert!(m.steps.is_none());
    }

    #[test]
    fn test_log_prefills_height() {
        let store = test_store();
        cmd_log(
            &store,
            Some("2024-01-01".into()),
            MeasurementArgs {
                weight: Some(80.0),
                height: Some(1.8),
                ..MeasurementArgs::default()
            },
            true,
        )
        .unwrap();
        cmd_log(
            &store,
            Some("2024-01-02".into()),
            MeasurementArgs {
                weight: Some(79.8),
                ..MeasurementArgs::default()
            },
            true,
        )
        .unwrap();

        let table = store.load().unwrap().table;
        let rec = table
            .get(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
            .unwrap();
        assert_eq!(rec.values.height_m, Some(1.8));
    }

    #[test]
    fn test_log_rejects_empty_and_invalid() {
        let store = test_store();
        assert!(cmd_log(&store, None, MeasurementArgs::default(), true).is_err());
        let err = cmd_log(
            &store,
            None,
            MeasurementArgs {
                energy: Some(11),
                ..MeasurementArgs::default()
            },
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Energy level"));
    }

    #[test]
    fn test_delete_missing_record_errors() {
        let store = test_store();
        assert!(cmd_delete(&store, "2024-01-01", true).is_err());
    }
}
