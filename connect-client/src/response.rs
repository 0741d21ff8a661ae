//! Response checking and error body mapping

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConnectError, Result, ValidationErrorData};
use crate::middleware::EndpointResponse;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    validation_error_data: Option<Vec<ValidationErrorData>>,
}

/// Map a non-2xx response to the matching error.
///
/// - body with `validationErrorData` → `Validation`
/// - body `{message, type?, detail?}` → `Endpoint`
/// - any other non-empty body → `Response` with the raw text
/// - empty body → `Response` naming the status line
pub fn assert_response_is_ok(response: &EndpointResponse) -> Result<()> {
    let status = response.status;
    if status.is_success() {
        return Ok(());
    }

    let text = response.text();
    if text.trim().is_empty() {
        return Err(ConnectError::Response {
            status: status.as_u16(),
            body: format!(
                "expected \"200 OK\" response, but got {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string(),
        });
    }

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            message,
            error_type,
            validation_error_data: Some(validation_error_data),
            ..
        }) => Err(ConnectError::Validation {
            message,
            error_type,
            validation_error_data,
        }),
        Ok(ErrorBody {
            message,
            error_type,
            detail,
            ..
        }) => Err(ConnectError::Endpoint {
            message,
            error_type,
            detail,
        }),
        Err(_) => Err(ConnectError::Response {
            status: status.as_u16(),
            body: text,
        }),
    }
}

/// Decode a successful body. An empty body is `Value::Null`.
pub fn parse_json(response: &EndpointResponse) -> Result<Value> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&response.body)?)
}
