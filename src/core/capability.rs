//! Capability tags and provider configuration blobs.
//!
//! The registry only ever compares a request's [`CapabilityTag`]; everything
//! else in a [`ProviderConfig`] is opaque to the framework and interpreted by
//! the matching backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Class of memory a backend serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CapabilityTag {
    /// Process-private host RAM
    Host,
    /// Host RAM that can be exported to other processes
    Shared,
    /// Generic accelerator/device memory
    Accelerator,
    /// Memory served by a dynamically loaded adapter family
    Adapter(String),
}

impl CapabilityTag {
    pub fn adapter(family: impl Into<String>) -> Self {
        CapabilityTag::Adapter(family.into())
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityTag::Host => write!(f, "host"),
            CapabilityTag::Shared => write!(f, "shared"),
            CapabilityTag::Accelerator => write!(f, "accelerator"),
            CapabilityTag::Adapter(family) => write!(f, "adapter:{}", family),
        }
    }
}

impl FromStr for CapabilityTag {
    type Err = CapabilityTagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "host" => Ok(CapabilityTag::Host),
            "shared" => Ok(CapabilityTag::Shared),
            "accelerator" | "device" => Ok(CapabilityTag::Accelerator),
            _ => match lower.strip_prefix("adapter:") {
                Some(family) if !family.is_empty() => Ok(CapabilityTag::Adapter(family.to_string())),
                _ => Err(CapabilityTagParseError(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for CapabilityTag {
    type Error = CapabilityTagParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CapabilityTag> for String {
    fn from(tag: CapabilityTag) -> Self {
        tag.to_string()
    }
}

/// Error returned when parsing an invalid capability tag.
#[derive(Debug, Clone)]
pub struct CapabilityTagParseError(pub String);

impl fmt::Display for CapabilityTagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid capability tag '{}', valid values: host, shared, accelerator, adapter:<family>",
            self.0
        )
    }
}

impl std::error::Error for CapabilityTagParseError {}

/// Configuration blob passed to `create_from_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Capability tag compared by the registry
    pub tag: CapabilityTag,

    /// Device model name, for backends that match by name
    #[serde(default)]
    pub device: Option<String>,

    /// Device PCI address, for backends that match by address
    #[serde(default)]
    pub pci: Option<String>,

    /// Backend-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

impl ProviderConfig {
    /// Create a configuration that only carries a tag.
    pub fn new(tag: CapabilityTag) -> Self {
        ProviderConfig {
            tag,
            device: None,
            pci: None,
            params: toml::Table::new(),
        }
    }

    /// Set the device name.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Set the PCI address.
    pub fn with_pci(mut self, pci: impl Into<String>) -> Self {
        self.pci = Some(pci.into());
        self
    }

    /// Add a backend-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Read a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Read an integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok())
    }
}
