use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};

use vitals_core::store::{preview_merge, retry_on_conflict};
use vitals_core::wearable::parse_bundle;

use super::{LOG_ATTEMPTS, Store};

pub(crate) fn cmd_import(store: &Store, path: &Path, dry_run: bool, json: bool) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let bundle = parse_bundle(BufReader::new(file))
        .with_context(|| format!("Failed to read wearable export {}", path.display()))?;

    if bundle.rows.is_empty() {
        if json {
            println!(
                "{}",
                serde_json::json!({ "error": "No usable rows found in export", "members_skipped": bundle.members_skipped })
            );
        } else {
            eprintln!("No usable rows found in export.");
        }
        return Ok(());
    }

    let summary = if dry_run {
        let loaded = store.load()?;
        preview_merge(&loaded.table, &bundle.rows)
    } else {
        retry_on_conflict(LOG_ATTEMPTS, || store.merge_external(&bundle.rows))?
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "dry_run": dry_run,
                "members_used": bundle.members_used,
                "rows_in": summary.rows_in,
                "dates_added": summary.dates_added,
                "dates_updated": summary.dates_updated,
                "fields_written": summary.fields_written,
                "version": summary.version,
            })
        );
    } else {
        if dry_run {
            println!("Dry run, no changes made.\n");
        } else {
            println!("Import complete.\n");
        }
        println!("  Files used:     {}", bundle.members_used.len());
        println!("  Days in export: {}", summary.rows_in);
        println!("  Days added:     {}", summary.dates_added);
        println!("  Days updated:   {}", summary.dates_updated);
        println!("  Values written: {}", summary.fields_written);
    }

    Ok(())
}
