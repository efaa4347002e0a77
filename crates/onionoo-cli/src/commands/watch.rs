//! Watch command - keep the index current.

use crate::app::App;
use onionoo_core::Config;
use std::thread;
use std::time::Duration;
use tracing::info;

/// Run the watch command.
pub fn run(config: Config, ticks: Option<u64>) -> anyhow::Result<()> {
    let app = App::new(config)?;
    let interval = app.config.indexer_settings().refresh_interval;

    println!(
        "Watching {} every {}s...",
        app.source.path().display(),
        interval.as_secs()
    );
    match ticks {
        Some(n) => println!("Stopping after {} intervals.", n),
        None => println!("Press Ctrl+C to stop."),
    }
    println!();

    app.indexer.start()?;

    let mut last_seen = None;
    let mut elapsed = 0u64;
    loop {
        if let Some(index) = app.indexer.latest_index(Duration::ZERO) {
            let generation = index.generation();
            if last_seen != Some(generation) {
                info!(
                    generation = %generation,
                    relays = index.stats().relays,
                    bridges = index.stats().bridges,
                    "New index published"
                );
                last_seen = Some(generation);
            }
        }

        if ticks.is_some_and(|n| elapsed >= n) {
            break;
        }
        thread::sleep(interval);
        elapsed += 1;
    }

    app.indexer.stop();

    println!("Monitoring stopped.");
    Ok(())
}
