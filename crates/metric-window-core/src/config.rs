use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{WindowError, DEFAULT_INF_REPLACEMENT, DEFAULT_NAN_REPLACEMENT, DEFAULT_TRIM_SLACK};

/// Buffer size is this multiple of the window size unless overridden.
pub const DEFAULT_BUFFER_FACTOR: usize = 10;

const DEFAULT_WINDOW_SIZE: usize = 12;

/// Window shape for one metric.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricConfig {
    pub window_size: usize,
    pub composite_keys: Vec<String>,
}

impl MetricConfig {
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            composite_keys: vec!["namespace".to_string(), "name".to_string()],
        }
    }

    /// # Errors
    /// Returns [`WindowError::Configuration`] for an empty window or key list.
    pub fn validate(&self) -> Result<(), WindowError> {
        if self.window_size == 0 {
            return Err(WindowError::Configuration(
                "window_size MUST be >= 1".to_string(),
            ));
        }

        if self.composite_keys.is_empty() {
            return Err(WindowError::Configuration(
                "composite_keys MUST name at least one field".to_string(),
            ));
        }

        if self.composite_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(WindowError::Configuration(
                "composite_keys MUST NOT contain blank fields".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetricConfigEntry {
    pub name: String,
    pub namespace: String,
    #[serde(flatten)]
    pub config: MetricConfig,
}

/// Resolves the window shape of a metric.
pub trait MetricConfigSource: Send + Sync {
    fn metric_config(&self, name: &str, namespace: &str) -> Option<MetricConfig>;
}

/// Metric configs loaded once at startup, with an optional catch-all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StaticMetricConfigs {
    #[serde(default)]
    pub metrics: Vec<MetricConfigEntry>,
    #[serde(default)]
    pub default: Option<MetricConfig>,
}

impl StaticMetricConfigs {
    /// Configs used when no file is supplied: every metric gets
    /// [`MetricConfig::fallback`].
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            metrics: Vec::new(),
            default: Some(MetricConfig::fallback()),
        }
    }

    /// # Errors
    /// Returns [`WindowError::Configuration`] when an entry is invalid or a
    /// `(name, namespace)` pair is configured twice.
    pub fn validate(&self) -> Result<(), WindowError> {
        for (index, entry) in self.metrics.iter().enumerate() {
            entry.config.validate().map_err(|err| {
                WindowError::Configuration(format!(
                    "metric {}/{}: {err}",
                    entry.namespace, entry.name
                ))
            })?;

            if self.metrics[..index]
                .iter()
                .any(|other| other.name == entry.name && other.namespace == entry.namespace)
            {
                return Err(WindowError::Configuration(format!(
                    "metric {}/{} is configured more than once",
                    entry.namespace, entry.name
                )));
            }
        }

        if let Some(default) = &self.default {
            default.validate()?;
        }

        Ok(())
    }

    /// Decodes and validates metric configs from JSON.
    ///
    /// # Errors
    /// Returns [`WindowError::Configuration`] when decoding or validation
    /// fails.
    pub fn from_json(value: &Value) -> Result<Self, WindowError> {
        let configs: Self = serde_json::from_value(value.clone()).map_err(|err| {
            WindowError::Configuration(format!("invalid metric config JSON payload: {err}"))
        })?;
        configs.validate()?;
        Ok(configs)
    }
}

impl MetricConfigSource for StaticMetricConfigs {
    fn metric_config(&self, name: &str, namespace: &str) -> Option<MetricConfig> {
        self.metrics
            .iter()
            .find(|entry| entry.name == name && entry.namespace == namespace)
            .map(|entry| entry.config.clone())
            .or_else(|| self.default.clone())
    }
}

/// Process-wide knobs, resolved once at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowSettings {
    /// Replaces `DEFAULT_BUFFER_FACTOR * window_size` when set.
    pub buffer_size_override: Option<usize>,
    pub trim_slack: usize,
    pub replace_nan: f64,
    pub replace_inf: f64,
    pub max_store_retries: u32,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            buffer_size_override: None,
            trim_slack: DEFAULT_TRIM_SLACK,
            replace_nan: DEFAULT_NAN_REPLACEMENT,
            replace_inf: DEFAULT_INF_REPLACEMENT,
            max_store_retries: 1,
        }
    }
}

impl WindowSettings {
    /// # Errors
    /// Returns [`WindowError::Configuration`] when the slack is zero or a
    /// replacement value is not finite.
    pub fn validate(&self) -> Result<(), WindowError> {
        if self.trim_slack == 0 {
            return Err(WindowError::Configuration(
                "trim_slack MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("replace_nan", self.replace_nan),
            ("replace_inf", self.replace_inf),
        ] {
            if !value.is_finite() {
                return Err(WindowError::Configuration(format!(
                    "{name} MUST be finite"
                )));
            }
        }

        Ok(())
    }

    /// Effective buffer size for a window.
    ///
    /// # Errors
    /// Returns [`WindowError::Configuration`] when the buffer would be
    /// smaller than the window.
    pub fn buffer_size(&self, window_size: usize) -> Result<usize, WindowError> {
        let buffer_size = self
            .buffer_size_override
            .unwrap_or_else(|| window_size.saturating_mul(DEFAULT_BUFFER_FACTOR));

        if buffer_size < window_size {
            return Err(WindowError::Configuration(format!(
                "buffer size {buffer_size} is less than window size {window_size}"
            )));
        }

        Ok(buffer_size)
    }
}
