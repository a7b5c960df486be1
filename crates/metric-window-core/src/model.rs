use std::fmt::{Display, Formatter};

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::WindowError;

/// Joins composite key values into the store key.
pub const KEY_SEPARATOR: &str = ":";

/// Routing header attached to every payload flowing through the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Header {
    #[serde(rename = "static_threshold")]
    StaticInference,
    #[serde(rename = "request_preprocess")]
    Preprocess,
    #[serde(rename = "request_training")]
    ModelTraining,
    #[serde(rename = "model_inference")]
    ModelInference,
}

impl Header {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticInference => "static_threshold",
            Self::Preprocess => "request_preprocess",
            Self::ModelTraining => "request_training",
            Self::ModelInference => "model_inference",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "static_threshold" => Some(Self::StaticInference),
            "request_preprocess" => Some(Self::Preprocess),
            "request_training" => Some(Self::ModelTraining),
            "model_inference" => Some(Self::ModelInference),
            _ => None,
        }
    }
}

/// Processing stage a payload has reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Raw,
    Extracted,
    PreProcessed,
    Inferred,
    #[serde(rename = "threshold_complete")]
    Thresholded,
    PostProcessed,
    ArtifactNotFound,
    #[serde(rename = "artifact_is_stale")]
    ArtifactStale,
    RuntimeError,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Extracted => "extracted",
            Self::PreProcessed => "pre_processed",
            Self::Inferred => "inferred",
            Self::Thresholded => "threshold_complete",
            Self::PostProcessed => "post_processed",
            Self::ArtifactNotFound => "artifact_not_found",
            Self::ArtifactStale => "artifact_is_stale",
            Self::RuntimeError => "runtime_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw" => Some(Self::Raw),
            "extracted" => Some(Self::Extracted),
            "pre_processed" => Some(Self::PreProcessed),
            "inferred" => Some(Self::Inferred),
            "threshold_complete" => Some(Self::Thresholded),
            "post_processed" => Some(Self::PostProcessed),
            "artifact_not_found" => Some(Self::ArtifactNotFound),
            "artifact_is_stale" => Some(Self::ArtifactStale),
            "runtime_error" => Some(Self::RuntimeError),
            _ => None,
        }
    }
}

/// Ordered composite identifier of one time series.
///
/// Field order is the order of the configured key list and is significant:
/// it decides both the store key and the serialized map order.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct EntityKey {
    fields: Vec<(String, String)>,
}

impl EntityKey {
    #[must_use]
    pub fn from_fields(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    /// Resolves each configured field against a record.
    ///
    /// `name` resolves to the record name, every other field to the label of
    /// the same name.
    ///
    /// # Errors
    /// Returns [`WindowError::InvalidRecord`] when a configured field is
    /// absent from the record.
    pub fn from_record(record: &InputRecord, key_fields: &[String]) -> Result<Self, WindowError> {
        let mut fields = Vec::with_capacity(key_fields.len());
        for field in key_fields {
            let value = if field == "name" {
                Some(record.name.clone())
            } else {
                record.label(field)
            };
            let Some(value) = value else {
                return Err(WindowError::InvalidRecord(format!(
                    "record for metric {} is missing key field {field}",
                    record.name
                )));
            };
            fields.push((field.clone(), value));
        }
        Ok(Self { fields })
    }

    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    #[must_use]
    pub fn store_key(&self) -> String {
        self.fields
            .iter()
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.store_key())
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in &self.fields {
            map.serialize_entry(field, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        let fields = map
            .into_iter()
            .map(|(field, value)| match value {
                Value::String(text) => (field, text),
                other => (field, other.to_string()),
            })
            .collect();
        Ok(Self { fields })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimestampedValue {
    pub value: f64,
    pub timestamp: i64,
}

/// Outcome of one atomic append against a window buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowResult {
    /// The `(value, timestamp)` pair was already buffered; nothing was added.
    Duplicate,
    /// Most recent entries, oldest first, at most `window_size` long.
    Window(Vec<TimestampedValue>),
}

impl WindowResult {
    #[must_use]
    pub fn entries(&self) -> Option<&[TimestampedValue]> {
        match self {
            Self::Duplicate => None,
            Self::Window(entries) => Some(entries),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawTimestamp {
    Integer(i64),
    Text(String),
}

impl RawTimestamp {
    /// # Errors
    /// Returns [`WindowError::InvalidRecord`] when a textual timestamp is not
    /// an integer.
    pub fn parse(&self) -> Result<i64, WindowError> {
        match self {
            Self::Integer(value) => Ok(*value),
            Self::Text(text) => text.trim().parse::<i64>().map_err(|err| {
                WindowError::InvalidRecord(format!("invalid timestamp {text:?}: {err}"))
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Textual values accept the float grammar, including `nan` and `inf`.
    ///
    /// # Errors
    /// Returns [`WindowError::InvalidRecord`] when a textual value is not a
    /// float.
    pub fn parse(&self) -> Result<f64, WindowError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(text) => text.trim().parse::<f64>().map_err(|err| {
                WindowError::InvalidRecord(format!("invalid value {text:?}: {err}"))
            }),
        }
    }
}

/// One metric sample as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputRecord {
    pub name: String,
    #[serde(default)]
    pub labels: Map<String, Value>,
    pub timestamp: RawTimestamp,
    pub value: RawValue,
}

impl InputRecord {
    /// Returns a label rendered as text. Non-string scalars are stringified.
    #[must_use]
    pub fn label(&self, field: &str) -> Option<String> {
        match self.labels.get(field)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }
}

/// Window payload handed to the inference stage.
///
/// Window arrays are column-shaped: one inner vector per timestamp, one
/// element per feature. Non-finite raw values serialize as `null` and decode
/// back as NaN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRecord {
    pub uuid: String,
    pub header: Header,
    pub composite_keys: EntityKey,
    pub status: Status,
    #[serde(deserialize_with = "nullable_columns")]
    pub win_raw_arr: Vec<Vec<f64>>,
    pub win_arr: Vec<Vec<f64>>,
    pub win_ts_arr: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl OutputRecord {
    /// First feature column of the cleaned window.
    #[must_use]
    pub fn cleaned_values(&self) -> Vec<f64> {
        first_column(&self.win_arr)
    }

    /// First feature column of the raw window.
    #[must_use]
    pub fn raw_values(&self) -> Vec<f64> {
        first_column(&self.win_raw_arr)
    }
}

fn nullable_columns<'de, D>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let rows = Vec::<Vec<Option<f64>>>::deserialize(deserializer)?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|value| value.unwrap_or(f64::NAN)).collect())
        .collect())
}

fn first_column(rows: &[Vec<f64>]) -> Vec<f64> {
    rows.iter().filter_map(|row| row.first().copied()).collect()
}
