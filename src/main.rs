//! shmclean: recover shared memory left behind by crashed sessions.
//!
//! With session ids as arguments, removes exactly those arenas. Without
//! arguments, removes every session recorded in the registry.

use anyhow::Context;

use parvis::core::shm::Arena;
use parvis::util;

fn main() -> anyhow::Result<()> {
    parvis::init();

    let sessions: Vec<String> = std::env::args().skip(1).collect();
    if sessions.iter().any(|s| s == "-h" || s == "--help") {
        eprintln!("usage: shmclean [session-id ...]");
        eprintln!("  no arguments: remove all registered sessions");
        return Ok(());
    }

    if sessions.is_empty() {
        let known = util::list_sessions().context("reading the session registry")?;
        if known.is_empty() {
            tracing::info!("no sessions registered, nothing to clean");
            return Ok(());
        }
        tracing::info!("removing {} registered session(s)", known.len());
        Arena::clean_all().context("cleaning registered sessions")?;
        return Ok(());
    }

    for session in &sessions {
        Arena::remove(session).with_context(|| format!("removing session '{session}'"))?;
    }
    Ok(())
}
