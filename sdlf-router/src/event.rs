//! Storage change events, in the two shapes the event bus delivers them.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use sdlf_core::PipelineError;

pub const TRAIL_DETAIL_TYPE: &str = "AWS API Call via CloudTrail";
pub const OBJECT_CREATED: &str = "Object Created";
pub const OBJECT_DELETED: &str = "Object Deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Deleted,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Created => "created",
            Operation::Deleted => "deleted",
        }
    }
}

/// A storage change with the event shape stripped away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub bucket: String,
    pub key: String,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TrailDetail {
    #[serde(rename = "eventName")]
    event_name: String,
    #[serde(rename = "eventTime")]
    event_time: Option<DateTime<Utc>>,
    #[serde(rename = "requestParameters")]
    request_parameters: TrailRequestParameters,
}

#[derive(Deserialize)]
struct TrailRequestParameters {
    #[serde(rename = "bucketName")]
    bucket_name: String,
    key: String,
}

#[derive(Deserialize)]
struct NativeDetail {
    bucket: NativeBucket,
    object: NativeObject,
}

#[derive(Deserialize)]
struct NativeBucket {
    name: String,
}

#[derive(Deserialize)]
struct NativeObject {
    key: String,
}

fn invalid(reason: impl Into<String>) -> PipelineError {
    PipelineError::Validation(reason.into())
}

fn detail<T: for<'de> Deserialize<'de>>(raw: &Value, shape: &str) -> Result<T, PipelineError> {
    let detail = raw
        .get("detail")
        .cloned()
        .ok_or_else(|| invalid(format!("{shape} event without detail")))?;
    serde_json::from_value(detail).map_err(|e| invalid(format!("malformed {shape} detail: {e}")))
}

/// Normalizes a raw event. Events without a time are stamped with `now`.
pub fn normalize(raw: &Value, now: DateTime<Utc>) -> Result<NormalizedEvent, PipelineError> {
    let detail_type = raw
        .get("detail-type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing detail-type"))?;

    match detail_type {
        TRAIL_DETAIL_TYPE => {
            let detail: TrailDetail = detail(raw, "trail")?;
            let operation = if detail.event_name.starts_with("Delete") {
                Operation::Deleted
            } else {
                Operation::Created
            };
            let timestamp = detail.event_time.unwrap_or(now);
            Ok(NormalizedEvent {
                bucket: detail.request_parameters.bucket_name,
                key: detail.request_parameters.key,
                operation,
                timestamp,
                last_modified: timestamp,
            })
        }
        OBJECT_CREATED | OBJECT_DELETED => {
            let detail: NativeDetail = detail(raw, "native")?;
            let operation = if detail_type == OBJECT_DELETED {
                Operation::Deleted
            } else {
                Operation::Created
            };
            let timestamp = match raw.get("time") {
                Some(time) => serde_json::from_value(time.clone())
                    .map_err(|e| invalid(format!("malformed time: {e}")))?,
                None => now,
            };
            Ok(NormalizedEvent {
                bucket: detail.bucket.name,
                key: detail.object.key,
                operation,
                timestamp,
                last_modified: timestamp,
            })
        }
        other => Err(invalid(format!("unknown detail-type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn shapes_normalize_identically() {
        let trail = json!({
            "detail-type": "AWS API Call via CloudTrail",
            "detail": {
                "eventName": "PutObject",
                "eventTime": "2024-06-01T10:00:00Z",
                "requestParameters": {"bucketName": "prefix-raw-bucket", "key": "adtech/datasetA/f.json"}
            }
        });
        let native = json!({
            "detail-type": "Object Created",
            "time": "2024-06-01T10:00:00Z",
            "detail": {
                "bucket": {"name": "prefix-raw-bucket"},
                "object": {"key": "adtech/datasetA/f.json"}
            }
        });

        let from_trail = normalize(&trail, now()).unwrap();
        assert_eq!(from_trail, normalize(&native, now()).unwrap());
        assert_eq!(from_trail.operation, Operation::Created);
        assert_eq!(from_trail.timestamp, "2024-06-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn deletions() {
        let trail = json!({
            "detail-type": "AWS API Call via CloudTrail",
            "detail": {
                "eventName": "DeleteObject",
                "requestParameters": {"bucketName": "b", "key": "k"}
            }
        });
        let native = json!({
            "detail-type": "Object Deleted",
            "detail": {"bucket": {"name": "b"}, "object": {"key": "k"}}
        });
        assert_eq!(normalize(&trail, now()).unwrap().operation, Operation::Deleted);
        assert_eq!(normalize(&native, now()).unwrap().operation, Operation::Deleted);
        assert_eq!(normalize(&native, now()).unwrap().timestamp, now());
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        for raw in [
            json!({}),
            json!({"detail-type": "Object Restore Completed", "detail": {}}),
            json!({"detail-type": "Object Created", "detail": {"bucket": {"name": "b"}}}),
            json!({"detail-type": "AWS API Call via CloudTrail", "detail": {"eventName": "PutObject"}}),
        ] {
            assert!(matches!(
                normalize(&raw, now()),
                Err(PipelineError::Validation(_))
            ));
        }
    }
}
