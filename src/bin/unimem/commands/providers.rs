//! `unimem providers` command
//!
//! List the backends registered after initialization, in priority order.

use anyhow::Result;
use serde::Serialize;

use crate::cli::ProvidersArgs;
use unimem::core::registry::global_registry;
use unimem::Config;

#[derive(Serialize)]
struct ProviderEntry {
    tag: String,
    name: String,
    version: String,
}

pub fn execute(config: &Config, args: ProvidersArgs) -> Result<()> {
    unimem::init(config)?;
    let registry = global_registry()
        .ok_or_else(|| anyhow::anyhow!("provider registry was not initialized"))?;

    let entries: Vec<ProviderEntry> = registry
        .descriptors()
        .iter()
        .map(|d| ProviderEntry {
            tag: d.tag().to_string(),
            name: d.name().to_string(),
            version: d.version().to_string(),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("Providers:");
        println!();
        for (priority, entry) in entries.iter().enumerate() {
            println!("  {}. {} ({})", priority + 1, entry.name, entry.tag);
            println!("     Contract: {}", entry.version);
        }
    }

    unimem::shutdown();
    Ok(())
}
