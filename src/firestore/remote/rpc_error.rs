use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// `{ "code": 14, "message": "..." }` status payload carried by watch target
/// changes and stream close frames. `code` may also be the status name.
#[derive(Debug, Deserialize)]
struct StatusPayload {
    code: JsonValue,
    #[serde(default)]
    message: Option<String>,
}

/// Maps a numeric gRPC status code to the error taxonomy. `0` (OK) and
/// unknown codes map to `Unknown`.
pub fn map_code_from_rpc_code(code: i64) -> FirestoreErrorCode {
    match code {
        1 => FirestoreErrorCode::Cancelled,
        3 => FirestoreErrorCode::InvalidArgument,
        4 => FirestoreErrorCode::DeadlineExceeded,
        5 => FirestoreErrorCode::NotFound,
        6 => FirestoreErrorCode::AlreadyExists,
        7 => FirestoreErrorCode::PermissionDenied,
        8 => FirestoreErrorCode::ResourceExhausted,
        9 => FirestoreErrorCode::FailedPrecondition,
        10 => FirestoreErrorCode::Aborted,
        11 => FirestoreErrorCode::OutOfRange,
        12 => FirestoreErrorCode::Unimplemented,
        13 => FirestoreErrorCode::Internal,
        14 => FirestoreErrorCode::Unavailable,
        15 => FirestoreErrorCode::DataLoss,
        16 => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}

pub fn map_rpc_code_from_code(code: FirestoreErrorCode) -> i64 {
    match code {
        FirestoreErrorCode::Cancelled => 1,
        FirestoreErrorCode::Unknown => 2,
        FirestoreErrorCode::InvalidArgument => 3,
        FirestoreErrorCode::DeadlineExceeded => 4,
        FirestoreErrorCode::NotFound => 5,
        FirestoreErrorCode::AlreadyExists => 6,
        FirestoreErrorCode::PermissionDenied => 7,
        FirestoreErrorCode::ResourceExhausted => 8,
        FirestoreErrorCode::FailedPrecondition => 9,
        FirestoreErrorCode::Aborted => 10,
        FirestoreErrorCode::OutOfRange => 11,
        FirestoreErrorCode::Unimplemented => 12,
        FirestoreErrorCode::Internal => 13,
        FirestoreErrorCode::Unavailable => 14,
        FirestoreErrorCode::DataLoss => 15,
        FirestoreErrorCode::Unauthenticated => 16,
    }
}

/// Maps a status name such as `"FAILED_PRECONDITION"`.
pub fn map_code_from_status_name(status: &str) -> FirestoreErrorCode {
    match status {
        "CANCELLED" => FirestoreErrorCode::Cancelled,
        "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
        "NOT_FOUND" => FirestoreErrorCode::NotFound,
        "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
        "ABORTED" => FirestoreErrorCode::Aborted,
        "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
        "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
        "INTERNAL" => FirestoreErrorCode::Internal,
        "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
        "DATA_LOSS" => FirestoreErrorCode::DataLoss,
        "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}

/// Decodes a status payload. Returns `None` for a missing payload or an OK status.
pub fn decode_status(value: &JsonValue) -> Option<FirestoreError> {
    let payload: StatusPayload = serde_json::from_value(value.clone()).ok()?;
    let code = match &payload.code {
        JsonValue::Number(number) => {
            let numeric = number.as_i64()?;
            if numeric == 0 {
                return None;
            }
            map_code_from_rpc_code(numeric)
        }
        JsonValue::String(name) if name == "OK" => return None,
        JsonValue::String(name) => map_code_from_status_name(name),
        _ => FirestoreErrorCode::Unknown,
    };
    let message = payload
        .message
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| "RPC failed".to_string());
    Some(FirestoreError::new(code, message))
}

pub fn encode_status(error: &FirestoreError) -> JsonValue {
    serde_json::json!({
        "code": map_rpc_code_from_code(error.code),
        "message": error.message(),
    })
}

/// Whether an RPC failing with `code` must not be retried.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Writes retry `Aborted`: it signals a contention conflict, not a bad request.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}
