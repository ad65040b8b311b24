//! Adapter discovery.
//!
//! Adapter families are tried in priority order. Within a family the
//! candidate libraries are tried in order and the first one that loads wins;
//! the rest of that family is skipped. Every loaded adapter is registered
//! with the provider registry under `adapter:<family>`.
//!
//! Interception (dispatching across all active backends) is enabled when
//! more than one adapter loaded, or when forced by configuration or by
//! [`INTERCEPT_ENV`](crate::util::env::INTERCEPT_ENV).

pub mod ffi;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::core::capability::CapabilityTag;
use crate::core::contract::{check_version, ProviderOps};
use crate::core::error::{ProviderError, Result};
use crate::core::registry::ProviderRegistry;
use crate::loader::ffi::{ForeignProviderOps, RawProviderOpsFn, PROVIDER_OPS_SYMBOL};
use crate::util::config::{AdapterFamily, LoaderConfig};
use crate::util::env::{env_to_bool, INTERCEPT_ENV};

/// Opens adapter libraries.
pub trait LibraryLoader {
    /// Load the library at `path` and return its backend descriptor.
    fn load(&self, path: &Path) -> Result<Arc<dyn ProviderOps>>;
}

/// Loads adapters as shared libraries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DylibLoader;

impl LibraryLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn ProviderOps>> {
        // SAFETY: loading a library runs its initializers; adapter search
        // paths come from trusted configuration.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            ProviderError::backend("loader", format!("cannot load {}: {}", path.display(), e))
        })?;
        let library = Arc::new(library);

        // SAFETY: the symbol has the documented adapter signature.
        let table = unsafe {
            let entry = library
                .get::<RawProviderOpsFn>(PROVIDER_OPS_SYMBOL)
                .map_err(|e| {
                    ProviderError::backend(
                        "loader",
                        format!("{} is not an adapter: {}", path.display(), e),
                    )
                })?;
            entry()
        };

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // SAFETY: the table came from this library, which the descriptor keeps loaded.
        let ops = unsafe { ForeignProviderOps::from_library(Arc::clone(&library), table, name)? };
        Ok(Arc::new(ops))
    }
}

/// Discovery options.
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Adapter families in priority order
    pub families: Vec<AdapterFamily>,

    /// Force interception regardless of how many adapters load
    pub force_intercept: bool,
}

impl LoaderOptions {
    /// Build options from configuration; the environment override wins.
    pub fn from_config(config: &LoaderConfig) -> Self {
        let force_intercept = env_to_bool(INTERCEPT_ENV)
            .or(config.force_intercept)
            .unwrap_or(false);
        LoaderOptions {
            families: config.adapters.clone(),
            force_intercept,
        }
    }
}

/// An adapter that loaded successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAdapter {
    /// Family it was loaded for
    pub family: String,

    /// Library that was loaded
    pub path: PathBuf,

    /// Backend name reported by the adapter
    pub name: String,

    /// Capability tag it was registered under
    pub tag: CapabilityTag,
}

/// Outcome of adapter discovery.
#[derive(Debug, Clone, Default)]
pub struct LoaderContext {
    adapters: Vec<LoadedAdapter>,
    force_intercept: bool,
    intercept_enabled: bool,
}

impl LoaderContext {
    /// Loaded adapters in family priority order.
    pub fn adapters(&self) -> &[LoadedAdapter] {
        &self.adapters
    }

    /// Whether interception was explicitly forced.
    pub fn force_intercept(&self) -> bool {
        self.force_intercept
    }

    /// Whether calls are dispatched across multiple active backends.
    pub fn intercept_enabled(&self) -> bool {
        self.intercept_enabled
    }

    /// Whether a family loaded.
    pub fn is_loaded(&self, family: &str) -> bool {
        self.adapters.iter().any(|a| a.family == family)
    }
}

/// Interception is needed with more than one active adapter, or when forced.
pub fn should_intercept(loaded: usize, force: bool) -> bool {
    force || loaded > 1
}

/// Expand a family's candidate list into concrete paths, in order.
///
/// Glob patterns expand to their sorted matches (possibly none); plain
/// entries are kept as written so bare library names reach the system
/// loader's own search.
pub fn resolve_candidates(paths: &[String]) -> Vec<PathBuf> {
    let mut resolved = Vec::new();
    for entry in paths {
        if !is_pattern(entry) {
            resolved.push(PathBuf::from(entry));
            continue;
        }
        match glob::glob(entry) {
            Ok(matches) => {
                let mut found: Vec<PathBuf> = matches.filter_map(|m| m.ok()).collect();
                found.sort();
                resolved.extend(found);
            }
            Err(e) => tracing::warn!("invalid adapter path pattern `{}`: {}", entry, e),
        }
    }
    resolved
}

fn is_pattern(entry: &str) -> bool {
    entry.contains(['*', '?', '['])
}

/// Load the first working candidate of a family.
fn load_family(
    family: &AdapterFamily,
    loader: &dyn LibraryLoader,
) -> Option<(PathBuf, Arc<dyn ProviderOps>)> {
    for path in resolve_candidates(&family.paths) {
        let ops = match loader.load(&path) {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!("adapter `{}`: skipping {}: {}", family.name, path.display(), e);
                continue;
            }
        };
        if let Err(e) = check_version(ops.as_ref()) {
            tracing::warn!("adapter `{}`: skipping {}: {}", family.name, path.display(), e);
            continue;
        }
        return Some((path, ops));
    }
    None
}

/// Discover adapters and register each loaded one with `registry`.
pub fn discover_and_register(
    options: &LoaderOptions,
    loader: &dyn LibraryLoader,
    registry: &ProviderRegistry,
) -> Result<LoaderContext> {
    let mut adapters = Vec::new();

    for family in &options.families {
        let Some((path, ops)) = load_family(family, loader) else {
            tracing::debug!("adapter `{}`: no candidate loaded", family.name);
            continue;
        };

        let tag = CapabilityTag::adapter(&family.name);
        let name = ops.name().to_string();
        registry.register(tag.clone(), ops)?;
        tracing::info!("loaded adapter `{}` from {}", family.name, path.display());

        adapters.push(LoadedAdapter {
            family: family.name.clone(),
            path,
            name,
            tag,
        });
    }

    let intercept_enabled = should_intercept(adapters.len(), options.force_intercept);
    if intercept_enabled {
        tracing::debug!(
            "loader interception enabled ({} adapters, forced: {})",
            adapters.len(),
            options.force_intercept
        );
    }

    Ok(LoaderContext {
        adapters,
        force_intercept: options.force_intercept,
        intercept_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::ProviderConfig;
    use crate::core::error::ResultCode;
    use crate::test_support::{MockLoader, ScriptedOps};
    use tempfile::TempDir;

    fn options(families: Vec<AdapterFamily>) -> LoaderOptions {
        LoaderOptions {
            families,
            force_intercept: false,
        }
    }

    #[test]
    fn test_should_intercept() {
        assert!(!should_intercept(0, false));
        assert!(!should_intercept(1, false));
        assert!(should_intercept(2, false));
        assert!(should_intercept(0, true));
        assert!(should_intercept(1, true));
    }

    #[test]
    fn test_first_loadable_candidate_wins() {
        let mut loader = MockLoader::new();
        loader.add("/b/libl0.so", ScriptedOps::new("l0-b"));
        loader.add("/c/libl0.so", ScriptedOps::new("l0-c"));

        let family = AdapterFamily::new("level_zero")
            .with_path("/a/libl0.so")
            .with_path("/b/libl0.so")
            .with_path("/c/libl0.so");

        let registry = ProviderRegistry::new();
        let ctx = discover_and_register(&options(vec![family]), &loader, &registry).unwrap();

        assert_eq!(ctx.adapters().len(), 1);
        assert_eq!(ctx.adapters()[0].path, PathBuf::from("/b/libl0.so"));
        assert_eq!(ctx.adapters()[0].name, "l0-b");
        // The rest of the family is never tried
        assert_eq!(
            loader.attempts(),
            vec![PathBuf::from("/a/libl0.so"), PathBuf::from("/b/libl0.so")]
        );
        assert!(!ctx.intercept_enabled());

        let provider = registry
            .create_from_config(&ProviderConfig::new(CapabilityTag::adapter("level_zero")))
            .unwrap();
        assert_eq!(provider.name(), "l0-b");
    }

    #[test]
    fn test_version_mismatch_tries_next_candidate() {
        let mut loader = MockLoader::new();
        loader.add(
            "/old/libcuda.so",
            ScriptedOps::new("old").with_version(semver::Version::new(0, 0, 1)),
        );
        loader.add("/new/libcuda.so", ScriptedOps::new("new"));

        let family = AdapterFamily::new("cuda")
            .with_path("/old/libcuda.so")
            .with_path("/new/libcuda.so");

        let registry = ProviderRegistry::new();
        let ctx = discover_and_register(&options(vec![family]), &loader, &registry).unwrap();
        assert_eq!(ctx.adapters()[0].name, "new");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_two_families_enable_interception() {
        let mut loader = MockLoader::new();
        loader.add("libl0.so", ScriptedOps::new("l0"));
        loader.add("libcuda.so", ScriptedOps::new("cuda"));

        let families = vec![
            AdapterFamily::new("level_zero").with_path("libl0.so"),
            AdapterFamily::new("cuda").with_path("libcuda.so"),
            AdapterFamily::new("hip").with_path("libhip.so"),
        ];

        let registry = ProviderRegistry::new();
        let ctx = discover_and_register(&options(families), &loader, &registry).unwrap();

        assert!(ctx.intercept_enabled());
        assert!(!ctx.force_intercept());
        assert!(ctx.is_loaded("level_zero"));
        assert!(ctx.is_loaded("cuda"));
        assert!(!ctx.is_loaded("hip"));
        let tags: Vec<_> = registry.descriptors().iter().map(|d| d.tag().clone()).collect();
        assert_eq!(
            tags,
            vec![CapabilityTag::adapter("level_zero"), CapabilityTag::adapter("cuda")]
        );
    }

    #[test]
    fn test_forced_interception() {
        let loader = MockLoader::new();
        let opts = LoaderOptions {
            families: vec![AdapterFamily::new("none").with_path("libnone.so")],
            force_intercept: true,
        };

        let registry = ProviderRegistry::new();
        let ctx = discover_and_register(&opts, &loader, &registry).unwrap();
        assert!(ctx.adapters().is_empty());
        assert!(ctx.intercept_enabled());
        assert!(ctx.force_intercept());
    }

    #[test]
    fn test_resolve_candidates_expands_globs() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("libadapter_b.so"), b"").unwrap();
        std::fs::write(tmp.path().join("libadapter_a.so"), b"").unwrap();
        std::fs::write(tmp.path().join("README"), b"").unwrap();

        let pattern = format!("{}/libadapter_*.so", tmp.path().display());
        let paths = resolve_candidates(&[pattern, "libfallback.so".to_string()]);

        assert_eq!(
            paths,
            vec![
                tmp.path().join("libadapter_a.so"),
                tmp.path().join("libadapter_b.so"),
                PathBuf::from("libfallback.so"),
            ]
        );
    }

    #[test]
    fn test_dylib_loader_missing_library() {
        let tmp = TempDir::new().unwrap();
        let err = DylibLoader
            .load(&tmp.path().join("libmissing.so"))
            .err()
            .unwrap();
        assert_eq!(err.code(), ResultCode::BackendSpecific);
        assert!(err.to_string().contains("cannot load"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dylib_loader_rejects_non_adapter() {
        // Loads fine, but exports no ops table
        let err = DylibLoader.load(Path::new("libc.so.6")).err().unwrap();
        assert_eq!(err.code(), ResultCode::BackendSpecific);
        assert!(err.to_string().contains("is not an adapter"));
    }

    #[test]
    fn test_options_from_config() {
        let config = LoaderConfig {
            force_intercept: Some(true),
            adapters: vec![AdapterFamily::new("cuda")],
        };
        let opts = LoaderOptions::from_config(&config);
        assert_eq!(opts.families.len(), 1);
        // The env override is unset in the test environment
        if std::env::var_os(INTERCEPT_ENV).is_none() {
            assert!(opts.force_intercept);
        }
    }
}
