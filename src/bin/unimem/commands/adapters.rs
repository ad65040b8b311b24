//! `unimem adapters` command
//!
//! Run adapter discovery and report which families loaded and whether
//! interception is on.

use anyhow::Result;

use unimem::Config;

pub fn execute(config: &Config) -> Result<()> {
    let context = unimem::init(config)?;

    println!("Adapters:");
    println!();

    if config.loader.adapters.is_empty() {
        println!("  (no adapter families configured)");
    }
    for family in &config.loader.adapters {
        match context.adapters().iter().find(|a| a.family == family.name) {
            Some(adapter) => {
                println!("  {} - loaded", family.name);
                println!("    Library:  {}", adapter.path.display());
                println!("    Backend:  {}", adapter.name);
                println!("    Tag:      {}", adapter.tag);
            }
            None => {
                println!("  {} - not found", family.name);
                for path in &family.paths {
                    println!("    Tried:    {}", path);
                }
            }
        }
    }

    println!();
    let mode = if context.intercept_enabled() {
        "enabled"
    } else {
        "disabled"
    };
    println!("Interception: {}", mode);
    if context.force_intercept() {
        println!("  (forced)");
    }

    unimem::shutdown();
    Ok(())
}
