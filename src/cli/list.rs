//! Listing commands: sources, projects, sessions

use anyhow::Result;

use crate::parser::Source;
use crate::store::{SessionFilter, Store};

pub fn sources(store: &Store) -> Result<()> {
    let infos = store.list_sources()?;

    println!("{:<14} {:>10} {:>10}", "Source", "Projects", "Sessions");
    println!("{}", "-".repeat(38));
    for info in infos {
        println!(
            "{:<14} {:>10} {:>10}",
            info.source.name(),
            info.project_count,
            info.session_count
        );
    }
    Ok(())
}

pub fn projects(store: &Store, source: Option<Source>) -> Result<()> {
    let rows = store.list_projects(source)?;

    if rows.is_empty() {
        println!("No projects found. Run 'memoir sync' first.");
        return Ok(());
    }

    println!("{:<12} {:<24} {:>9}  {}", "Source", "Name", "Sessions", "Key");
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:<12} {:<24} {:>9}  {}",
            row.source.name(),
            truncate(&row.display_name, 24),
            row.session_count,
            row.project_key
        );
    }
    Ok(())
}

pub fn sessions(store: &Store, filter: &SessionFilter) -> Result<()> {
    let rows = store.list_sessions(filter)?;

    if rows.is_empty() {
        println!("No sessions found. Run 'memoir sync' first.");
        return Ok(());
    }

    println!(
        "{:<12} {:<16} {:<12} {:<18} {:>5}  {}",
        "Updated", "Key", "Source", "Project", "Msgs", "Title"
    );
    println!("{}", "-".repeat(100));

    for row in rows {
        let updated = row
            .updated_at
            .as_deref()
            .map(short_timestamp)
            .unwrap_or_else(|| "-".to_string());
        let star = if row.starred { "*" } else { " " };
        let project = row.project_name.as_deref().unwrap_or(&row.project_key);

        println!(
            "{:<12} {:<16} {:<12} {:<18} {:>5} {}{}",
            updated,
            row.session_key,
            row.source.name(),
            truncate(project, 18),
            row.message_count,
            star,
            row.title.as_deref().map(|t| truncate(t, 38)).unwrap_or_default(),
        );
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.chars().count() > max {
        let cut: String = first_line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        first_line.to_string()
    }
}

/// "2024-03-01T10:00:00Z" -> "03-01 10:00"
fn short_timestamp(ts: &str) -> String {
    if ts.len() >= 16 {
        format!("{} {}", &ts[5..10], &ts[11..16])
    } else {
        ts.to_string()
    }
}
