//! Runtime construction options.
//!
//! [`ComputeOptions`] is plain data: it can be built in code, deserialized
//! from TOML, or loaded through [`ComputeOptions::load_or_default`], which
//! honours the `BRINY_COMPUTE_CONFIG` environment variable.
//!
//! ```toml
//! mode = "Hybrid"
//! strategy = "Selective"
//! enable_fallback = true
//! max_buffers = 32
//! default_buffer_size = 1048576
//! ```

use std::path::Path;
use std::time::Duration;

use briny::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ComputeMode, OffloadStrategy};
use crate::error::{ComputeError, Result};

/// Environment variable naming a TOML options file.
pub const CONFIG_ENV_VAR: &str = "BRINY_COMPUTE_CONFIG";

/// Options accepted by [`crate::runtime::TensorRuntime`] and its parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeOptions {
    /// Initial compute mode.
    pub mode: ComputeMode,
    /// Initial offload strategy.
    pub strategy: OffloadStrategy,
    /// Whether `Gpu` mode may degrade to the CPU when no device exists.
    pub enable_fallback: bool,
    /// Target device ordinal.
    pub device_id: u32,
    /// Fraction of device memory the pool may claim, in `(0, 1]`.
    pub memory_fraction: f32,
    /// Maximum number of pooled buffers.
    pub max_buffers: usize,
    /// Default pooled buffer size in bytes.
    pub default_buffer_size: usize,
    /// How long `rent` waits for a returned buffer before giving up.
    #[serde(with = "millis")]
    pub rent_timeout: Duration,
    /// Batch size hint for batching layers built on top of the runtime.
    pub batch_size: usize,
    /// Batch timeout hint for batching layers built on top of the runtime.
    #[serde(with = "millis")]
    pub batch_timeout: Duration,
    /// Cross-check device results against the CPU path in debug builds.
    pub verify_device_results: bool,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            mode: ComputeMode::Gpu,
            strategy: OffloadStrategy::Full,
            enable_fallback: true,
            device_id: 0,
            memory_fraction: 0.9,
            max_buffers: 16,
            default_buffer_size: 1024 * 1024,
            rent_timeout: Duration::from_secs(5),
            batch_size: 32,
            batch_timeout: Duration::from_millis(10),
            verify_device_results: false,
        }
    }
}

impl Validate for ComputeOptions {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.max_buffers == 0 || self.default_buffer_size == 0 || self.batch_size == 0 {
            return Err(ValidationError);
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

impl ComputeOptions {
    /// Checks the options, naming the first offending field.
    pub fn check(&self) -> Result<()> {
        if self.validate().is_ok() {
            return Ok(());
        }
        let field = if self.max_buffers == 0 {
            "max_buffers must be at least 1"
        } else if self.default_buffer_size == 0 {
            "default_buffer_size must be at least 1 byte"
        } else if self.batch_size == 0 {
            "batch_size must be at least 1"
        } else {
            "memory_fraction must lie in (0, 1]"
        };
        Err(ComputeError::Config(field.to_string()))
    }

    /// Parses and validates options from a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(src).map_err(|e| ComputeError::Config(e.to_string()))?;
        options.check()?;
        Ok(options)
    }

    /// Loads and validates options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ComputeError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let options = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded compute options");
        Ok(options)
    }

    /// Loads options from `BRINY_COMPUTE_CONFIG` if set and readable,
    /// otherwise returns the defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(options) => return options,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV_VAR} set but options could not be loaded, using defaults"
                    );
                }
            }
        }
        debug!("using default compute options");
        Self::default()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ComputeOptions::default().check().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let options = ComputeOptions::from_toml_str(
            r#"
            mode = "Hybrid"
            strategy = "Selective"
            max_buffers = 4
            rent_timeout = 250
            "#,
        )
        .unwrap();

        assert_eq!(options.mode, ComputeMode::Hybrid);
        assert_eq!(options.strategy, OffloadStrategy::Selective);
        assert_eq!(options.max_buffers, 4);
        assert_eq!(options.rent_timeout, Duration::from_millis(250));
        assert_eq!(options.default_buffer_size, 1024 * 1024);
        assert!(options.enable_fallback);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ComputeOptions::from_toml_str("max_buffers = 0").unwrap_err();
        assert!(matches!(err, ComputeError::Config(msg) if msg.contains("max_buffers")));
    }

    #[test]
    fn memory_fraction_out_of_range_is_rejected() {
        let options = ComputeOptions {
            memory_fraction: 1.5,
            ..ComputeOptions::default()
        };
        assert!(options.check().is_err());
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        assert!(ComputeOptions::from_toml_str(r#"mode = "Quantum""#).is_err());
    }
}
