use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("Must config token or aksk or username password to be authorized")]
    MissingCredentials,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error(
        "expected HTTP response code {expected:?} when accessing [{method} {url}], but got {status} instead: {body}"
    )]
    UnexpectedStatus {
        status: u16,
        method: String,
        url: String,
        expected: Vec<u16>,
        error_code: Option<String>,
        error_msg: Option<String>,
        body: String,
    },

    #[error("failed to parse response from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("timeout while waiting for state to become '{target}' (last state: '{last_state}', timeout: {timeout:?})")]
    Timeout {
        target: String,
        last_state: String,
        timeout: Duration,
    },

    #[error("unexpected state '{state}', wanted target '{target}'")]
    UnexpectedState { state: String, target: String },

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("order {order_id} failed: {reason}")]
    OrderFailed { order_id: String, reason: String },

    #[error("missing field '{field}' in response")]
    MissingField { field: String },

    #[error("failed to read shared config {path}: {message}")]
    SharedConfig { path: String, message: String },
}

impl SdkError {
    /// HTTP status of an API error response
    pub fn status(&self) -> Option<u16> {
        match self {
            SdkError::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The resource being addressed does not exist
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// `error_code` reported by the service, e.g. `VPC.0202`
    pub fn error_code(&self) -> Option<&str> {
        match self {
            SdkError::UnexpectedStatus { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn missing(field: impl Into<String>) -> Self {
        SdkError::MissingField {
            field: field.into(),
        }
    }
}

pub type SdkResult<T> = Result<T, SdkError>;

/// Pull `error_code`/`error_msg` out of the various error envelopes
/// HuaweiCloud services return.
pub(crate) fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };

    let str_at = |v: &serde_json::Value, keys: &[&str]| {
        keys.iter()
            .find_map(|k| v.get(*k).and_then(|x| x.as_str()).map(str::to_string))
    };

    let code_keys = ["error_code", "errorCode", "code"];
    let msg_keys = ["error_msg", "errorMsg", "message"];

    // {"error": {"code": ..., "message": ...}} and {"NeutronError": {...}}
    for wrapper in ["error", "NeutronError", "badRequest", "itemNotFound"] {
        if let Some(inner) = value.get(wrapper).filter(|v| v.is_object()) {
            let code = str_at(inner, &code_keys).or_else(|| str_at(inner, &["type"]));
            let msg = str_at(inner, &msg_keys);
            if code.is_some() || msg.is_some() {
                return (code, msg);
            }
        }
    }

    (str_at(&value, &code_keys), str_at(&value, &msg_keys))
}
