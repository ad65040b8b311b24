//! `unimem ipc-open` command
//!
//! Import a handle another process exported, print the mapped bytes up to
//! the first NUL and optionally write a reply into the mapping.

use std::fs;

use anyhow::{bail, Context, Result};

use crate::cli::IpcOpenArgs;
use unimem::{create_provider, ipc, CapabilityTag, Config, IpcHandle, ProviderConfig};

pub fn execute(config: &Config, args: IpcOpenArgs) -> Result<()> {
    let bytes = fs::read(&args.handle)
        .with_context(|| format!("failed to read {}", args.handle.display()))?;
    let handle = IpcHandle::from_bytes(&bytes)?;

    let tag: CapabilityTag = args
        .tag
        .parse()
        .with_context(|| format!("invalid tag `{}`", args.tag))?;
    let provider_config = config
        .providers
        .iter()
        .find(|p| p.tag == tag)
        .cloned()
        .unwrap_or_else(|| ProviderConfig::new(tag));

    unimem::init(config)?;
    let result = open(&provider_config, &handle, args.write.as_deref());
    unimem::shutdown();
    result
}

fn open(config: &ProviderConfig, handle: &IpcHandle, reply: Option<&str>) -> Result<()> {
    let provider = create_provider(config)?;
    let local = ipc::import(&provider, handle)?;
    tracing::debug!(
        "opened handle {} from process {}",
        handle.id(),
        handle.producer_pid()
    );

    let len = handle.size().saturating_sub(handle.offset());
    let written = {
        // SAFETY: the import is valid for size - offset bytes until unimport.
        let view = unsafe { std::slice::from_raw_parts_mut(local.as_ptr(), len) };
        let end = view.iter().position(|&b| b == 0).unwrap_or(len);
        println!("{}", String::from_utf8_lossy(&view[..end]));

        match reply {
            Some(reply) if reply.len() > len => Err(reply.len()),
            Some(reply) => {
                view[..reply.len()].copy_from_slice(reply.as_bytes());
                Ok(())
            }
            None => Ok(()),
        }
    };

    ipc::unimport(local)?;
    provider.destroy();
    if let Err(needed) = written {
        bail!("reply of {} bytes does not fit a {} byte mapping", needed, len);
    }
    Ok(())
}
