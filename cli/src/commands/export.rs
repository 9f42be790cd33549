use std::path::Path;

use anyhow::{Context, Result};

use vitals_core::table::Table;

use super::Store;
use super::history::report_load_problems;

pub(crate) fn cmd_export(store: &Store, output: Option<&Path>, json: bool) -> Result<()> {
    let loaded = store.load()?;
    report_load_problems(&loaded.report);

    let content = if json {
        serde_json::to_string_pretty(loaded.table.records())? + "\n"
    } else {
        loaded.table.to_csv()?
    };

    match output {
        Some(path) => {
            std::fs::write(path, &content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "Exported {} records to {}",
                loaded.table.len(),
                path.display()
            );
        }
        None => print!("{content}"),
    }

    Ok(())
}

/// Replace the whole table with the contents of a CSV file.
pub(crate) fn cmd_restore(store: &Store, path: &Path, json: bool) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    let (table, report) = Table::from_csv(file)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    report_load_problems(&report);

    let count = table.len();
    let version = store.replace_all(table)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "records": count,
                "dropped_rows": report.dropped_rows.len(),
                "duplicate_dates": report.duplicate_dates,
                "version": version,
            })
        );
    } else {
        println!("Restored {count} records from {}", path.display());
        if report.duplicate_dates > 0 {
            println!(
                "  {} duplicate date(s) collapsed (last row kept)",
                report.duplicate_dates
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_store;

    #[test]
    fn test_export_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        std::fs::write(
            &input,
            "date,weight_kg,steps\n2024-01-02,80.1,9000\n2024-01-01,80.4,0\n2024-01-02,80.0,9100\n",
        )
        .unwrap();

        let store = test_store();
        cmd_restore(&store, &input, true).unwrap();
        let table = store.load().unwrap().table;
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[1].values.steps, Some(9100));

        let output = dir.path().join("out.csv");
        cmd_export(&store, Some(&output), false).unwrap();
        let exported = std::fs::read_to_string(&output).unwrap();
        assert!(exported.starts_with("date,weight_kg,height_m"));
        assert!(exported.contains("2024-01-01,80.4"));
    }
}
