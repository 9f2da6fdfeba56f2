//! Database maintenance commands

use anyhow::Result;

use crate::store::Store;

pub fn info(store: &Store) -> Result<()> {
    let info = store.db_info()?;

    println!("Database: {}", info.path.display());
    println!("Schema version: {}", info.schema_version);
    println!("Size: {}", human_bytes(info.size_bytes));
    match info.wal_bytes {
        Some(bytes) => println!("Write-ahead log: {}", human_bytes(bytes)),
        None => println!("Write-ahead log: absent"),
    }
    println!();
    println!("{:<14} {:>10}", "Table", "Rows");
    println!("{}", "-".repeat(26));
    println!("{:<14} {:>10}", "projects", info.project_count);
    println!("{:<14} {:>10}", "sessions", info.session_count);
    println!("{:<14} {:>10}", "messages", info.message_count);
    println!("{:<14} {:>10}", "file_states", info.file_state_count);
    Ok(())
}

pub fn clean(store: &mut Store, dry_run: bool) -> Result<()> {
    let report = store.db_clean(dry_run)?;
    if report.dry_run {
        println!(
            "Reclaimable: {} (dry run, nothing removed)",
            human_bytes(report.reclaimable_bytes)
        );
    } else {
        println!("Reclaimed: {}", human_bytes(report.reclaimable_bytes));
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
