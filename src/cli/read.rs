//! Read command: print a session transcript

use anyhow::Result;

use crate::store::Store;

pub fn run(store: &Store, session_id: &str) -> Result<()> {
    let session = match store.get_session(session_id)? {
        Some(s) => s,
        None => {
            println!("Session '{}' not found.", session_id);
            return Ok(());
        }
    };

    println!("\n{}", "=".repeat(80));
    println!(
        "Session: {} ({})",
        session.session_key,
        session.external_id.as_deref().unwrap_or("?")
    );
    println!("Source: {} | Project: {}", session.source.name(), session.project_key);
    if let Some(title) = &session.title {
        println!("Title: {}", title);
    }
    if let Some(parent) = &session.forked_from {
        println!("Forked from: {}", parent);
    }
    if session.starred {
        println!("Starred");
    }
    println!("{}", "=".repeat(80));

    let transcript = store.transcript(&session.session_key)?;
    if transcript.is_empty() {
        println!("\nNo messages found (this may be an empty session).");
        return Ok(());
    }

    for record in transcript {
        println!(
            "\n[{}] ({})",
            record.role.to_uppercase(),
            record.timestamp.as_deref().unwrap_or("?")
        );
        println!("{}", record.content);
        println!("{}", "-".repeat(40));
    }

    Ok(())
}
