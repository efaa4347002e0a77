//! Status command - show index statistics.

use crate::app::App;
use onionoo_core::Config;
use std::time::Duration;

/// Run the status command.
pub fn run(config: Config) -> anyhow::Result<()> {
    let app = App::new(config)?;

    println!("Onionoo Index Status");
    println!("====================");
    println!();

    if !app.index_now()? {
        println!(
            "No summary document at {}.",
            app.source.path().display()
        );
        return Ok(());
    }

    let Some(index) = app.indexer.latest_index(Duration::ZERO) else {
        println!("Index is empty.");
        return Ok(());
    };
    let stats = index.stats();

    println!("Summary:");
    println!("  Relays:              {}", stats.relays);
    println!("  Bridges:             {}", stats.bridges);
    println!("  Skipped (invalid):   {}", stats.skipped_invalid);
    println!("  Skipped (stale):     {}", stats.skipped_stale);
    println!("  Countries:           {}", stats.countries);
    println!("  Autonomous systems:  {}", stats.autonomous_systems);
    println!("  Flags:               {}", stats.flags);
    println!("  Relays with family:  {}", stats.relays_with_family);
    println!(
        "  Generation:          {}",
        index.generation().format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(published) = index.relays_published_string() {
        println!("  Relays published:    {}", published);
    }
    if let Some(published) = index.bridges_published_string() {
        println!("  Bridges published:   {}", published);
    }

    println!();
    println!("Summary document: {}", app.source.path().display());

    Ok(())
}
