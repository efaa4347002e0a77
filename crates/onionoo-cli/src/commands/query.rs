//! Query command - run one request against a freshly built index.

use crate::app::App;
use crate::OutputFormat;
use onionoo_core::{Config, QueryResponse, SummaryRecord};
use std::sync::Arc;
use std::time::Instant;

/// Run the query command.
pub fn run(config: Config, resource: &str, query: &str, output: OutputFormat) -> anyhow::Result<()> {
    let app = App::new(config)?;

    if !app.index_now()? {
        eprintln!(
            "No summary document at {}.",
            app.source.path().display()
        );
        return Ok(());
    }

    let start = Instant::now();
    let response = match app.service().query_string(resource, query) {
        Ok(response) => response,
        Err(e) if e.is_invalid_input() => anyhow::bail!("Bad request: {}", e),
        Err(e) if e.is_not_ready() => anyhow::bail!("Service unavailable: {}", e),
        Err(e) => return Err(e.into()),
    };
    let elapsed = start.elapsed();

    match output {
        OutputFormat::Text => print_text(&response),
        OutputFormat::Json => print_json(&response)?,
    }

    eprintln!();
    eprintln!(
        "Found {} relays and {} bridges in {:.3}ms",
        response.result.relays.len(),
        response.result.bridges.len(),
        elapsed.as_secs_f64() * 1000.0
    );

    Ok(())
}

fn print_text(response: &QueryResponse) {
    let meta = &response.meta;
    if let Some(published) = &meta.relays_published {
        println!("relays_published:  {}", published);
    }
    if let Some(published) = &meta.bridges_published {
        println!("bridges_published: {}", published);
    }

    for record in &response.result.relays {
        println!(
            "r {} {:<19} cw={} {}",
            record.fingerprint,
            record.nickname(),
            record.consensus_weight,
            if record.running { "running" } else { "-" }
        );
    }
    for record in &response.result.bridges {
        println!(
            "b {} {:<19} {}",
            record.fingerprint,
            record.nickname(),
            if record.running { "running" } else { "-" }
        );
    }

    if meta.relays_skipped + meta.bridges_skipped > 0 {
        println!(
            "skipped: {} relays, {} bridges",
            meta.relays_skipped, meta.bridges_skipped
        );
    }
    if meta.relays_truncated + meta.bridges_truncated > 0 {
        println!(
            "truncated: {} relays, {} bridges",
            meta.relays_truncated, meta.bridges_truncated
        );
    }
}

fn print_json(response: &QueryResponse) -> anyhow::Result<()> {
    let records = |list: &[Arc<SummaryRecord>]| -> Vec<serde_json::Value> {
        list.iter()
            .map(|r| {
                serde_json::json!({
                    "fingerprint": r.fingerprint,
                    "nickname": r.nickname(),
                    "addresses": r.addresses,
                    "running": r.running,
                    "consensus_weight": r.consensus_weight,
                    "first_seen": r.first_seen.to_rfc3339(),
                    "last_seen": r.last_seen.to_rfc3339(),
                })
            })
            .collect()
    };

    let document = serde_json::json!({
        "meta": response.meta,
        "relays": records(&response.result.relays),
        "bridges": records(&response.result.bridges),
    });

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
