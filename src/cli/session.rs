//! Session management commands: star, unstar, fork

use anyhow::Result;

use crate::fork::ForkEngine;
use crate::store::Store;

pub fn set_starred(store: &mut Store, session_id: &str, starred: bool) -> Result<()> {
    let session = match store.get_session(session_id)? {
        Some(s) => s,
        None => {
            println!("Session '{}' not found.", session_id);
            return Ok(());
        }
    };

    store.set_starred(&session.session_key, starred)?;
    println!(
        "{} {}",
        if starred { "Starred" } else { "Unstarred" },
        session.session_key
    );
    Ok(())
}

pub fn fork(store: &mut Store, session_id: &str) -> Result<()> {
    let session = match store.get_session(session_id)? {
        Some(s) => s,
        None => {
            println!("Session '{}' not found.", session_id);
            return Ok(());
        }
    };

    let result = ForkEngine::new(store).fork(&session.session_key)?;
    println!("Forked {} -> {}", session.session_key, result.session_key);
    println!("Continuation artifact: {}", result.path.display());
    println!("The next sync will index it like any other log.");
    Ok(())
}
