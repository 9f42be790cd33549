use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use vitals_core::metrics::moving_average;
use vitals_core::models::Field;
use vitals_core::table::LoadReport;

use super::Store;
use super::helpers::{fmt_opt, print_records_table};

pub(crate) fn report_load_problems(report: &LoadReport) {
    for row in &report.dropped_rows {
        eprintln!(
            "Warning: skipped line {} with unreadable date '{}'",
            row.line, row.raw_date
        );
    }
    if report.invalid_cells > 0 {
        eprintln!(
            "Warning: {} unreadable value(s) were treated as not recorded",
            report.invalid_cells
        );
    }
}

pub(crate) fn cmd_history(store: &Store, days: Option<usize>, json: bool) -> Result<()> {
    let loaded = store.load()?;
    let records = match days {
        Some(n) => loaded.table.latest(n),
        None => loaded.table.records(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
    } else if records.is_empty() {
        eprintln!("No records yet. Use `vitals log --weight <kg>` to add one.");
    } else {
        report_load_problems(&loaded.report);
        print_records_table(records);
    }

    Ok(())
}

pub(crate) fn cmd_trend(
    store: &Store,
    field: &str,
    window: usize,
    days: Option<usize>,
    json: bool,
) -> Result<()> {
    let Some(field) = Field::from_column(field) else {
        let known: Vec<&str> = Field::ALL.iter().map(|f| f.column()).collect();
        bail!("Unknown field '{field}'. Use one of: {}", known.join(", "));
    };
    if window == 0 {
        bail!("Window must be at least 1");
    }

    let loaded = store.load()?;
    let averages = moving_average(&loaded.table, field, window);
    let skip = days.map_or(0, |n| averages.len().saturating_sub(n));
    let points = &averages[skip..];
    let raw = &loaded.table.records()[skip..];

    if json {
        println!("{}", serde_json::to_string_pretty(points)?);
        return Ok(());
    }
    if points.is_empty() {
        eprintln!("No records yet.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct TrendRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Value")]
        value: String,
        #[tabled(rename = "Average")]
        average: String,
    }

    let decimals = if field.is_integer() { 0 } else { 2 };
    let rows: Vec<TrendRow> = points
        .iter()
        .zip(raw)
        .map(|(p, r)| TrendRow {
            date: p.date.format("%Y-%m-%d").to_string(),
            value: fmt_opt(r.get(field), decimals),
            average: fmt_opt(p.value, decimals),
        })
        .collect();

    println!("{field}, {window}-row moving average");
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}
