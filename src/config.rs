//! Instrumentation options, and the device features that gate them.

use crate::interface;
use std::env;

/// Environment variable read by [`Options::from_env`].
pub const CONFIG_ENV_VAR: &str = "VK_LAYER_GPUAV_CONFIG";

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Check descriptor indexing against the bound descriptor sets.
    pub descriptors: bool,

    /// Check dynamic array/vector/matrix indices against their bounds.
    pub indexing: bool,

    /// Check loads/stores through buffer device addresses.
    pub buffer_device_address: bool,

    /// Check `OpRayQueryInitializeKHR` parameters.
    pub ray_query: bool,

    /// Descriptor set holding the instrumentation buffers.
    pub reserved_set: u32,

    /// Number of error records the output buffer has room for.
    pub max_records: u32,

    /// Log per-pass timings, and every instrumented site.
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            descriptors: true,
            indexing: true,
            buffer_device_address: true,
            ray_query: true,
            reserved_set: interface::DEFAULT_RESERVED_SET,
            max_records: 1024,
            verbose: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown option `{0}` in `{CONFIG_ENV_VAR}`")]
    UnknownPart(String),

    #[error("invalid value in `{part}`: {source}")]
    BadValue {
        part: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("reserved set {0} is not below {}", interface::MAX_SETS)]
    ReservedSetTooHigh(u32),

    #[error("invalid JSON options: {0}")]
    Json(#[from] serde_json::Error),
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Self>(json)?.validated()
    }

    /// Parse `+`-separated options, e.g. `indexing+bda+reserved-set=6`.
    ///
    /// Naming any pass enables only the named passes, while an empty string
    /// (or one only naming non-pass options) enables all of them.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut options = Options::default();
        let mut passes = None;
        for part in s.split('+').map(str::trim).filter(|part| !part.is_empty()) {
            let int_value = |value: &str| {
                value.parse::<u32>().map_err(|source| ConfigError::BadValue {
                    part: part.to_string(),
                    source,
                })
            };

            let pass = match part {
                "descriptors" => 0,
                "indexing" => 1,
                "bda" => 2,
                "ray-query" => 3,
                "verbose" => {
                    options.verbose = true;
                    continue;
                }
                _ => {
                    if let Some(value) = part.strip_prefix("reserved-set=") {
                        options.reserved_set = int_value(value)?;
                    } else if let Some(value) = part.strip_prefix("max-records=") {
                        options.max_records = int_value(value)?;
                    } else {
                        return Err(ConfigError::UnknownPart(part.to_string()));
                    }
                    continue;
                }
            };
            passes.get_or_insert([false; 4])[pass] = true;
        }
        if let Some([descriptors, indexing, bda, ray_query]) = passes {
            options.descriptors = descriptors;
            options.indexing = indexing;
            options.buffer_device_address = bda;
            options.ray_query = ray_query;
        }
        options.validated()
    }

    /// Read [`CONFIG_ENV_VAR`] (all passes are enabled if it's missing).
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(CONFIG_ENV_VAR) {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self::default()),
        }
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.reserved_set >= interface::MAX_SETS {
            return Err(ConfigError::ReservedSetTooHigh(self.reserved_set));
        }
        Ok(self)
    }

    pub fn any_pass_enabled(&self) -> bool {
        self.descriptors || self.indexing || self.buffer_device_address || self.ray_query
    }
}

/// Device features (as enabled at device creation) relevant to instrumentation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct DeviceFeatures {
    /// `bufferDeviceAddress`, required by the validation functions to read
    /// snapshots (and so by all descriptor and device address checks).
    pub buffer_device_address: bool,

    /// `rayQuery`, without which no shader can initialize ray queries.
    pub ray_query: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_enables_everything() {
        assert_eq!(Options::parse("").unwrap(), Options::default());
        assert!(Options::parse("verbose").unwrap().any_pass_enabled());
    }

    #[test]
    fn naming_passes_selects_them() {
        let options = Options::parse("indexing+ray-query+reserved-set=5+max-records=8").unwrap();
        assert!(!options.descriptors && !options.buffer_device_address);
        assert!(options.indexing && options.ray_query);
        assert_eq!((options.reserved_set, options.max_records), (5, 8));
    }

    #[test]
    fn bad_parts_are_errors() {
        assert!(matches!(Options::parse("bounds"), Err(ConfigError::UnknownPart(_))));
        assert!(matches!(Options::parse("reserved-set=x"), Err(ConfigError::BadValue { .. })));
        assert!(matches!(
            Options::parse("reserved-set=32"),
            Err(ConfigError::ReservedSetTooHigh(32))
        ));
    }

    #[test]
    fn json_fills_in_defaults() {
        let options = Options::from_json(r#"{ "ray_query": false, "verbose": true }"#).unwrap();
        assert!(!options.ray_query && options.verbose && options.descriptors);
        assert!(Options::from_json(r#"{ "raytracing": true }"#).is_err());
    }
}
