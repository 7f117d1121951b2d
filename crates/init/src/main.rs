//! Binary entry point. Picks a personality from argv0/environment and runs
//! it to completion; grounded on the teacher's `agent` crate's thin
//! `#[tokio::main]` shell, generalized to dispatch between the two
//! personalities spec.md §2 names instead of running a single fixed loop.

mod boot;
mod dispatcher;
mod handlers;
mod lifecycle;
mod mount;
mod network;
mod personality;
mod reclaim;
mod relay;
mod retry;
mod session;
mod util;

use personality::Personality;

#[tokio::main]
async fn main() {
    let argv0 = std::env::args().next().unwrap_or_default();

    // No tracing subscriber may be installed yet if either personality dies
    // before reaching its own logging setup, so failures also go to stderr.
    let result = match personality::detect(&argv0) {
        Personality::Full => boot::run().await.map_err(|e| e.to_string()),
        Personality::SessionLeader => {
            personality::run_session_leader().await.map_err(|e| e.to_string())
        }
    };

    if let Err(e) = result {
        eprintln!("init exiting: {e}");
        std::process::exit(1);
    }
}
