use anyhow::{Result, bail};

use vitals_core::metrics::{Dashboard, TdeeOutcome};

use super::Store;
use super::helpers::fmt_opt;
use super::history::report_load_problems;

pub(crate) fn cmd_dashboard(store: &Store, window: usize, json: bool) -> Result<()> {
    if window == 0 {
        bail!("Window must be at least 1");
    }
    let loaded = store.load()?;
    let dash = Dashboard::compute(&loaded.table, window);

    if json {
        println!("{}", serde_json::to_string_pretty(&dash)?);
        return Ok(());
    }

    if dash.record_count == 0 {
        eprintln!("No records yet. Use `vitals log --weight <kg>` to add one.");
        return Ok(());
    }
    report_load_problems(&loaded.report);

    if let (Some(first), Some(last)) = (dash.first_date, dash.last_date) {
        println!(
            "{} records, {} to {} (window: last {window} rows)\n",
            dash.record_count,
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d"),
        );
    }

    println!("Body");
    println!("  Weight:       {} kg", fmt_opt(dash.latest_weight_kg, 1));
    let ma7 = dash.weight_ma7.last().and_then(|p| p.value);
    let ma14 = dash.weight_ma14.last().and_then(|p| p.value);
    println!("  7/14 avg:     {} / {} kg", fmt_opt(ma7, 2), fmt_opt(ma14, 2));
    match &dash.bmi {
        Some(b) => println!("  BMI:          {:.1} ({})", b.bmi, b.class),
        None => println!("  BMI:          - (needs height and a recent weight)"),
    }
    if let Some(band) = &dash.ideal_weight {
        println!("  Healthy band: {:.1} - {:.1} kg", band.min_kg, band.max_kg);
    }

    println!("\nEnergy");
    match &dash.tdee {
        TdeeOutcome::Estimate(est) => {
            print!("  TDEE:         {:.0} kcal/day", est.tdee_kcal);
            if est.clamped {
                print!(" (clamped from {:.0})", est.raw_tdee_kcal);
            }
            println!();
            println!(
                "  Trend:        {:+.2} kg/week, {}",
                est.slope_kg_per_day * 7.0,
                est.label
            );
            println!("  Avg intake:   {:.0} kcal", est.mean_intake_kcal);
        }
        TdeeOutcome::Insufficient { reason } => {
            println!("  TDEE:         not enough data ({reason})");
        }
    }
    match &dash.protein {
        Some(p) => println!(
            "  Protein:      {:.2} g/kg ({}, {:.0} g/day)",
            p.grams_per_kg, p.class, p.mean_protein_g
        ),
        None => println!("  Protein:      -"),
    }

    let v = &dash.vitals;
    println!("\nVitals (mean of last {window} rows)");
    println!("  Sleep:        {} h", fmt_opt(v.sleep_hours, 1));
    println!("  Resting HR:   {} bpm", fmt_opt(v.resting_heart_rate, 0));
    println!("  SpO2:         {} %", fmt_opt(v.spo2_pct, 0));
    println!(
        "  BP:           {}/{} mmHg",
        fmt_opt(v.systolic, 0),
        fmt_opt(v.diastolic, 0)
    );
    println!("  Steps:        {}", fmt_opt(v.steps, 0));
    println!("  Active:       {} kcal", fmt_opt(v.active_kcal, 0));
    println!("  Energy:       {} / 10", fmt_opt(v.energy_level, 1));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_store;
    use chrono::NaiveDate;
    use vitals_core::models::Measurements;

    #[test]
    fn test_dashboard_renders_sparse_table() {
        let store = test_store();
        store
            .upsert(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                Measurements {
                    weight_kg: Some(80.0),
                    ..Measurements::default()
                },
            )
            .unwrap();
        cmd_dashboard(&store, 7, false).unwrap();
        cmd_dashboard(&store, 7, true).unwrap();
        assert!(cmd_dashboard(&store, 0, false).is_err());
    }
}
