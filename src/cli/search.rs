//! Search command: ranked full-text matches

use anyhow::Result;

use crate::store::{SessionFilter, Store};

pub fn run(store: &Store, query: &str, filter: &SessionFilter) -> Result<()> {
    let hits = store.search(query, filter)?;

    if hits.is_empty() {
        println!("No matches for '{}'.", query);
        return Ok(());
    }

    for hit in hits {
        let title = hit.session_title.as_deref().unwrap_or("(untitled)");
        println!(
            "{} [{}] {} #{}",
            hit.record.session_key,
            hit.source.name(),
            title,
            hit.record.ordinal
        );
        println!("  [{}] {}", hit.record.role, snippet(&hit.record.content, 160));
        println!();
    }
    Ok(())
}

fn snippet(content: &str, max: usize) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() > max {
        let cut: String = flattened.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        flattened
    }
}
