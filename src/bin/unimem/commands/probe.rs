//! `unimem probe` command
//!
//! Create a provider for a tag, allocate and free once, and report what
//! the backend says about page sizes.

use anyhow::{Context, Result};

use crate::cli::ProbeArgs;
use unimem::{create_provider, take_last_failed_provider, CapabilityTag, Config, ProviderConfig};

pub fn execute(config: &Config, args: ProbeArgs) -> Result<()> {
    let tag: CapabilityTag = args
        .tag
        .parse()
        .with_context(|| format!("invalid tag `{}`", args.tag))?;

    // Start from a configured entry for this tag, if any
    let mut provider_config = config
        .providers
        .iter()
        .find(|p| p.tag == tag)
        .cloned()
        .unwrap_or_else(|| ProviderConfig::new(tag));
    if let Some(device) = args.device {
        provider_config.device = Some(device);
    }

    unimem::init(config)?;
    let result = probe(&provider_config, args.size, args.align);
    unimem::shutdown();
    result
}

fn probe(config: &ProviderConfig, size: usize, align: usize) -> Result<()> {
    let provider = create_provider(config)?;
    println!("Provider: {} ({})", provider.name(), provider.id());

    let run = || -> Result<()> {
        println!(
            "  Recommended page size: {}",
            provider.recommended_page_size(size)?
        );
        println!("  Minimum page size:     {}", provider.min_page_size(None)?);

        let ptr = provider.alloc(size, align)?;
        println!("  Allocated {} bytes at {:p}", size, ptr);
        provider.free(ptr, size)?;
        println!("  Freed");
        Ok(())
    };

    if let Err(e) = run() {
        if let Some(failed) = take_last_failed_provider() {
            if let Ok(native) = failed.last_native_error() {
                eprintln!("native error from {}: {}", failed.name(), native);
            }
        }
        return Err(e);
    }

    provider.destroy();
    Ok(())
}
