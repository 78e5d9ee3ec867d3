//! Device configuration.

use crate::channel::BackendSelection;
use crate::error::{NpuError, Result};
use crate::handle::MAX_HANDLE;
use bytes::Bytes;
use std::time::Duration;
use tnpu_chip::page::NPU_PAGE_SIZE;
use tnpu_chip::status::IRQ_TIMEOUT_MS;

/// Completion timeout override, in milliseconds.
pub const ENV_IRQ_TIMEOUT_MS: &str = "TNPU_IRQ_TIMEOUT_MS";
/// Handle table bound override.
pub const ENV_MAX_HANDLES: &str = "TNPU_MAX_HANDLES";
/// Secure channel backend override.
pub const ENV_BACKEND: &str = "TNPU_BACKEND";

/// Settings fixed at device attach.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Completion wait per run, doubled for profiling networks
    pub irq_timeout: Duration,
    /// Largest handle any table hands out
    pub max_handles: u32,
    /// Size of each driver buffer handed to the peer at session open
    pub driver_buffer_size: u64,
    /// Secure channel backend
    pub backend: BackendSelection,
    /// Trusted Application image registered before the session opens
    pub ta_image: Bytes,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            irq_timeout: Duration::from_millis(IRQ_TIMEOUT_MS),
            max_handles: MAX_HANDLE,
            driver_buffer_size: 16 * NPU_PAGE_SIZE,
            backend: BackendSelection::default(),
            ta_image: Bytes::from_static(b"tnpu-ta"),
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden from `TNPU_IRQ_TIMEOUT_MS`, `TNPU_MAX_HANDLES`
    /// and `TNPU_BACKEND`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_IRQ_TIMEOUT_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                NpuError::invalid_argument(format!("{ENV_IRQ_TIMEOUT_MS}={ms} is not a number"))
            })?;
            config.irq_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = lookup(ENV_MAX_HANDLES) {
            config.max_handles = max.trim().parse().map_err(|_| {
                NpuError::invalid_argument(format!("{ENV_MAX_HANDLES}={max} is not a number"))
            })?;
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            config.backend = backend.trim().parse()?;
        }
        tracing::debug!(
            "device config: timeout {:?}, max handles {}, backend {:?}",
            config.irq_timeout,
            config.max_handles,
            config.backend
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.irq_timeout, Duration::from_secs(40));
        assert_eq!(config.backend, BackendSelection::Generic);
    }

    #[test]
    fn overrides_from_lookup() {
        let config = DeviceConfig::from_lookup(|name| match name {
            ENV_IRQ_TIMEOUT_MS => Some("250".into()),
            ENV_BACKEND => Some("vendor".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.irq_timeout, Duration::from_millis(250));
        assert_eq!(config.backend, BackendSelection::Vendor);
        assert_eq!(config.max_handles, MAX_HANDLE);

        assert!(DeviceConfig::from_lookup(|name| {
            (name == ENV_MAX_HANDLES).then(|| "many".to_string())
        })
        .is_err());
    }
}
