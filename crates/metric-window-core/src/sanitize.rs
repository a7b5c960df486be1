use crate::EntityKey;

pub const DEFAULT_NAN_REPLACEMENT: f64 = 0.0;
pub const DEFAULT_INF_REPLACEMENT: f64 = 1e10;

/// Returns a copy of `values` with every non-finite entry replaced.
///
/// NaN becomes `replace_nan`, positive infinity `replace_inf` and negative
/// infinity `-replace_inf`. A warning carrying `context_id` and the entity key
/// is logged whenever a replacement happens.
#[must_use]
pub fn clean_values(
    context_id: &str,
    key: &EntityKey,
    values: &[f64],
    replace_nan: f64,
    replace_inf: f64,
) -> Vec<f64> {
    if values.iter().any(|value| !value.is_finite()) {
        tracing::warn!(
            context_id,
            key = %key,
            values = ?values,
            "non finite values encountered in window"
        );
    }

    values
        .iter()
        .map(|&value| {
            if value.is_nan() {
                replace_nan
            } else if value.is_infinite() {
                if value.is_sign_positive() {
                    replace_inf
                } else {
                    -replace_inf
                }
            } else {
                value
            }
        })
        .collect()
}
