use serde_json::{Map, Value};
use ulid::Ulid;

use crate::{EntityKey, Header, OutputRecord, Status};

#[must_use]
pub fn new_record_id() -> String {
    Ulid::new().to_string()
}

/// Assembles the inference-ready payload for one completed window.
///
/// Values are shaped as a single feature column and timestamps are rendered
/// as strings in the order given.
#[must_use]
pub fn build_payload(
    key: EntityKey,
    raw_values: &[f64],
    cleaned_values: &[f64],
    timestamps: &[i64],
    source_metadata: Map<String, Value>,
) -> OutputRecord {
    OutputRecord {
        uuid: new_record_id(),
        header: Header::ModelInference,
        composite_keys: key,
        status: Status::Extracted,
        win_raw_arr: as_column(raw_values),
        win_arr: as_column(cleaned_values),
        win_ts_arr: timestamps.iter().map(ToString::to_string).collect(),
        metadata: source_metadata,
    }
}

fn as_column(values: &[f64]) -> Vec<Vec<f64>> {
    values.iter().map(|&value| vec![value]).collect()
}
