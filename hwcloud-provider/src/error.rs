use hwcloud_sdk::SdkError;
use thiserror::Error;

/// Failure inside a resource or data-source handler
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Sdk(#[from] SdkError),

    #[error("{0}")]
    Invalid(String),

    #[error("missing '{0}' in API response")]
    MissingField(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HandlerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HandlerError::Invalid(message.into())
    }

    pub fn missing(field: impl Into<String>) -> Self {
        HandlerError::MissingField(field.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HandlerError::Sdk(e) if e.is_not_found())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_only_for_sdk_404() {
        let err: HandlerError = SdkError::UnexpectedStatus {
            status: 404,
            method: "GET".into(),
            url: "https://vpc.example.com/v1/p1/vpcs/x".into(),
            expected: vec![200],
            error_code: Some("VPC.0202".into()),
            error_msg: None,
            body: String::new(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!HandlerError::invalid("nope").is_not_found());
        assert!(!HandlerError::missing("vpc.id").is_not_found());
    }
}
