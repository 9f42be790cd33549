use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use vitals_core::models::Record;

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Format an optional reading, `-` when not recorded.
pub(crate) fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.decimals$}"))
}

pub(crate) fn print_records_table(records: &[Record]) {
    #[derive(Tabled)]
    struct RecordRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Weight")]
        weight: String,
        #[tabled(rename = "Waist")]
        waist: String,
        #[tabled(rename = "Kcal")]
        calories: String,
        #[tabled(rename = "Protein")]
        protein: String,
        #[tabled(rename = "Steps")]
        steps: String,
        #[tabled(rename = "Sleep")]
        sleep: String,
        #[tabled(rename = "RHR")]
        rhr: String,
        #[tabled(rename = "SpO2")]
        spo2: String,
        #[tabled(rename = "BP")]
        bp: String,
        #[tabled(rename = "Energy")]
        energy: String,
    }

    let rows: Vec<RecordRow> = records
        .iter()
        .map(|r| {
            let v = &r.values;
            RecordRow {
                date: r.date.format("%Y-%m-%d").to_string(),
                weight: fmt_opt(v.weight_kg, 1),
                waist: fmt_opt(v.waist_cm, 1),
                calories: fmt_opt(v.calories_kcal.map(f64::from), 0),
                protein: fmt_opt(v.protein_g.map(f64::from), 0),
                steps: fmt_opt(v.steps.map(f64::from), 0),
                sleep: fmt_opt(v.sleep_hours, 1),
                rhr: fmt_opt(v.resting_heart_rate.map(f64::from), 0),
                spo2: fmt_opt(v.spo2_pct.map(f64::from), 0),
                bp: match (v.systolic, v.diastolic) {
                    (Some(s), Some(d)) => format!("{s}/{d}"),
                    (Some(s), None) => format!("{s}/-"),
                    (None, Some(d)) => format!("-/{d}"),
                    (None, None) => "-".to_string(),
                },
                energy: fmt_opt(v.energy_level.map(f64::from), 0),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}
