//! Device table configuration

use serde::Deserialize;

use crate::channel::check_capacity;
use crate::error::{DeviceError, Result};
use crate::sparse::check_dimensions;

pub const DEFAULT_STORE_COUNT: usize = 4;
pub const DEFAULT_CHANNEL_COUNT: usize = 4;
pub const DEFAULT_QUANTUM: usize = 4096;
pub const DEFAULT_QSET: usize = 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Instance counts and initial parameters
///
/// Missing JSON keys take the defaults; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub store_count: usize,
    pub channel_count: usize,
    pub quantum: usize,
    pub qset: usize,
    pub channel_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            store_count: DEFAULT_STORE_COUNT,
            channel_count: DEFAULT_CHANNEL_COUNT,
            quantum: DEFAULT_QUANTUM,
            qset: DEFAULT_QSET,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl DeviceConfig {
    /// Parse and validate a JSON document
    ///
    /// # Errors
    /// `InvalidArgument` if the JSON is malformed or the values are invalid.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| DeviceError::invalid(format!("failed to parse device config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON document to the end, then parse and validate it
    ///
    /// # Errors
    /// `InvalidArgument` on read errors, malformed JSON or invalid values.
    pub async fn from_reader(mut reader: impl embedded_io_async::Read) -> Result<Self> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    return Err(DeviceError::invalid(format!(
                        "failed to read device config: {e:?}"
                    )))
                }
            }
        }
        Self::from_json_slice(&buffer)
    }

    /// # Errors
    /// `InvalidArgument` for zero dimensions, an overflowing
    /// `quantum * qset` or a capacity below 2.
    pub fn validate(&self) -> Result<()> {
        check_dimensions(self.quantum, self.qset)?;
        check_capacity(self.channel_capacity)?;
        Ok(())
    }
}
