//! Canonical JSON text for stored payloads, content-derived ids, and the
//! timestamp encodings shared by every table.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{FeedbackCall, TruError};

const CALLS_KEY: &str = "calls";

/// Returns `value` with every object's keys sorted, recursively.
#[must_use]
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical_json(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Compact canonical JSON text of any serializable object.
///
/// # Errors
/// Returns an error when `obj` cannot be represented as JSON.
pub fn json_str_of_obj<T: Serialize + ?Sized>(obj: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(obj)?;
    serde_json::to_string(&canonical_json(&value))
}

/// Content-derived identifier: `<prefix>_hash_<sha256 of canonical JSON>`.
///
/// # Errors
/// Returns an error when `obj` cannot be represented as JSON.
pub fn obj_id_of_obj<T: Serialize + ?Sized>(
    obj: &T,
    prefix: &str,
) -> Result<String, serde_json::Error> {
    let canonical = json_str_of_obj(obj)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{prefix}_hash_{}", hex::encode(digest)))
}

/// Encodes a call sequence for the `calls_json` column. The column holds an
/// object rather than a bare array, so the sequence sits under `calls`.
///
/// # Errors
/// Returns an error when a call cannot be represented as JSON.
pub fn wrap_calls(calls: &[FeedbackCall]) -> Result<String, serde_json::Error> {
    let mut wrapper = Map::new();
    wrapper.insert(CALLS_KEY.to_string(), serde_json::to_value(calls)?);
    json_str_of_obj(&Value::Object(wrapper))
}

/// Decodes the call sequence written by [`wrap_calls`] into JSON values.
///
/// # Errors
/// Returns [`TruError::Decode`] when the text is not JSON or the `calls`
/// key is absent.
pub fn unwrap_calls_value(raw: &str) -> Result<Value, TruError> {
    let mut parsed: Value = serde_json::from_str(raw).map_err(|err| TruError::Decode {
        column: "calls_json",
        message: err.to_string(),
    })?;
    parsed
        .get_mut(CALLS_KEY)
        .map(Value::take)
        .ok_or_else(|| TruError::Decode {
            column: "calls_json",
            message: "missing `calls` key".to_string(),
        })
}

/// Decodes the call sequence written by [`wrap_calls`].
///
/// # Errors
/// Returns [`TruError::Decode`] when the payload is malformed.
pub fn unwrap_calls(raw: &str) -> Result<Vec<FeedbackCall>, TruError> {
    let calls = unwrap_calls_value(raw)?;
    serde_json::from_value(calls).map_err(|err| TruError::Decode {
        column: "calls_json",
        message: err.to_string(),
    })
}

/// Parses a stored JSON payload, naming the column on failure.
///
/// # Errors
/// Returns [`TruError::Decode`] when `raw` does not decode into `T`.
pub fn decode_json<T: DeserializeOwned>(column: &'static str, raw: &str) -> Result<T, TruError> {
    serde_json::from_str(raw).map_err(|err| TruError::Decode {
        column,
        message: err.to_string(),
    })
}

/// Reads a float that may have been written as `null`. `serde_json` writes
/// non-finite floats as `null`, so `null` reads back as NaN.
pub(crate) fn nan_from_null<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Seconds since the Unix epoch, as stored in the REAL timestamp columns.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn unix_seconds(value: OffsetDateTime) -> f64 {
    value.unix_timestamp_nanos() as f64 / 1_000_000_000.0
}

/// Inverse of [`unix_seconds`], accurate to the microsecond.
///
/// # Errors
/// Returns [`TruError::Validation`] for non-finite or out-of-range values.
#[allow(clippy::cast_possible_truncation)]
pub fn from_unix_seconds(seconds: f64) -> Result<OffsetDateTime, TruError> {
    if !seconds.is_finite() {
        return Err(TruError::Validation(format!(
            "timestamp is not finite: {seconds}"
        )));
    }
    let micros = (seconds * 1_000_000.0).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(micros * 1_000)
        .map_err(|err| TruError::Validation(format!("timestamp out of range: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn canonical_text_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [ {"d": 1, "c": 2} ]}});
        let text = match json_str_of_obj(&value) {
            Ok(text) => text,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(text, r#"{"a":{"y":[{"c":2,"d":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn calls_are_wrapped_under_calls_key() {
        let mut args = BTreeMap::new();
        args.insert("question".to_string(), json!("how?"));
        let calls = vec![FeedbackCall { args, ret: 0.5 }];

        let text = match wrap_calls(&calls) {
            Ok(text) => text,
            Err(err) => panic!("test failure: {err}"),
        };
        assert!(text.starts_with(r#"{"calls":["#));

        let decoded = match unwrap_calls(&text) {
            Ok(decoded) => decoded,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(decoded, calls);
    }

    #[test]
    fn non_finite_call_return_survives_the_calls_column() {
        let calls = vec![FeedbackCall {
            args: BTreeMap::new(),
            ret: f64::NAN,
        }];
        let text = match wrap_calls(&calls) {
            Ok(text) => text,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(text, r#"{"calls":[{"args":{},"ret":null}]}"#);

        let decoded = match unwrap_calls(&text) {
            Ok(decoded) => decoded,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].ret.is_nan());
    }

    #[test]
    fn null_cost_and_latency_read_back_as_nan() {
        let cost: crate::Cost = match decode_json("cost_json", r#"{"n_tokens":3,"cost":null}"#) {
            Ok(cost) => cost,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(cost.n_tokens, 3);
        assert!(cost.cost.is_nan());

        let perf: crate::Perf = match decode_json("perf_json", r#"{"latency":null}"#) {
            Ok(perf) => perf,
            Err(err) => panic!("test failure: {err}"),
        };
        assert!(perf.latency.is_nan());

        let defaulted: crate::Perf = match decode_json("perf_json", "{}") {
            Ok(perf) => perf,
            Err(err) => panic!("test failure: {err}"),
        };
        assert!(defaulted.latency.abs() < f64::EPSILON);
    }

    #[test]
    fn bare_array_is_rejected_as_calls_payload() {
        let err = match unwrap_calls("[]") {
            Ok(_) => panic!("expected decode failure"),
            Err(err) => err,
        };
        assert!(matches!(err, TruError::Decode { column: "calls_json", .. }));
    }

    #[test]
    fn non_finite_timestamp_is_rejected() {
        assert!(from_unix_seconds(f64::NAN).is_err());
        assert!(from_unix_seconds(f64::INFINITY).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_content_id_ignores_key_insertion_order(
            entries in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 1..12)
        ) {
            let mut forward = serde_json::Map::new();
            for (key, value) in &entries {
                forward.insert(key.clone(), json!(value));
            }
            let mut backward = serde_json::Map::new();
            for (key, value) in entries.iter().rev() {
                backward.insert(key.clone(), json!(value));
            }

            let lhs = obj_id_of_obj(&Value::Object(forward), "feedback_definition");
            let rhs = obj_id_of_obj(&Value::Object(backward), "feedback_definition");
            prop_assert!(lhs.is_ok());
            prop_assert_eq!(lhs.ok(), rhs.ok());
        }

        #[test]
        fn prop_unix_seconds_survive_the_real_column(micros in -1_000_000_000_000_000i64..2_000_000_000_000_000i64) {
            let original = OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000);
            prop_assert!(original.is_ok());
            let original = original.unwrap_or_else(|_| unreachable!());
            let restored = from_unix_seconds(unix_seconds(original));
            prop_assert!(restored.is_ok());
            let restored = restored.unwrap_or_else(|_| unreachable!());
            let drift = (restored - original).abs();
            prop_assert!(drift <= time::Duration::microseconds(2));
        }
    }
}
