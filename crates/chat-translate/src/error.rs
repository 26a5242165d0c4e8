//! Request validation errors

/// Why an inbound chat request was rejected. Always maps to HTTP 400.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed request body: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("`{field}` out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("invalid value {value:?} for `{field}`, expected one of: {expected}")]
    InvalidEnum {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("model `{0}` is not supported")]
    UnsupportedModel(String),

    /// Structural problem inside messages, tools or tool_choice.
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ValidationError {
    /// The offending request parameter, for the `param` field of error bodies.
    pub fn param(&self) -> Option<String> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::MissingField(field) => Some((*field).to_owned()),
            ValidationError::UnknownField(field) => Some(field.clone()),
            ValidationError::OutOfRange { field, .. } => Some((*field).to_owned()),
            ValidationError::InvalidEnum { field, .. } => Some((*field).to_owned()),
            ValidationError::UnsupportedModel(_) => Some("model".to_owned()),
            ValidationError::Invalid { field, .. } => Some(field.clone()),
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for request translation.
pub type Result<T> = std::result::Result<T, ValidationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names_the_offending_field() {
        let err = ValidationError::InvalidEnum {
            field: "reasoning_effort",
            value: "extreme".into(),
            expected: "none, minimal, low, medium, high",
        };
        assert_eq!(err.param().as_deref(), Some("reasoning_effort"));
        assert_eq!(
            err.to_string(),
            "invalid value \"extreme\" for `reasoning_effort`, expected one of: none, minimal, low, medium, high"
        );
        assert_eq!(ValidationError::Malformed("eof".into()).param(), None);
    }
}
