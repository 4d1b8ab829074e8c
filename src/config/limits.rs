use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Request-shape limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum decoded image size accepted by the image path. Larger
    /// payloads are rejected (and, image analysis being fail-closed,
    /// blocked).
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Maximum items per `filter/batch` request.
    #[serde(default = "default_batch_max_items")]
    pub batch_max_items: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            batch_max_items: default_batch_max_items(),
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_max_items == 0 {
            return Err(ConfigError::Validation(
                "limits.batch_max_items must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_image_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_batch_max_items() -> usize {
    10
}
