use serde::de::{
    self,
    Error as _
};
use serde::Deserialize;
use thiserror::Error;

use crate::learner::learnererror::LearnerError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),

    #[error("key '{0}' not found")]
    NameNotFoundError(String),

    #[error("invalid settings '{name}': {source}")]
    InvalidSettingsError {
        name: String,
        #[source]
        source: LearnerError,
    },
}

impl ManagerError {
    pub fn from_json_or_json_parse_error<T>(json_value: serde_json::Value) -> Result<T, Self>
    where
        T: for<'a> Deserialize<'a>,
    {
        serde_json::from_value(json_value).map_err(ManagerError::JsonParseError)
    }

    pub fn json_missing_field(field: &'static str) -> ManagerError {
        ManagerError::JsonParseError(serde_json::Error::missing_field(field))
    }

    pub fn json_invalid_type(unexp: de::Unexpected, exp: &dyn de::Expected) -> ManagerError {
        ManagerError::JsonParseError(serde_json::Error::invalid_type(unexp, exp))
    }

    pub fn map_elem_not_found(name: &str) -> ManagerError {
        ManagerError::NameNotFoundError(name.to_owned())
    }

    pub fn invalid_settings(name: &str, source: LearnerError) -> ManagerError {
        ManagerError::InvalidSettingsError {
            name: name.to_owned(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_entry() {
        assert_eq!(ManagerError::map_elem_not_found("fine").to_string(), "key 'fine' not found");

        let error = ManagerError::invalid_settings("coarse", LearnerError::InvalidTolerance(-1.0));
        assert!(error.to_string().starts_with("invalid settings 'coarse'"));
    }

    #[test]
    fn json_helpers_wrap_serde_errors() {
        let error = ManagerError::json_missing_field("bounds");
        assert!(matches!(error, ManagerError::JsonParseError(_)));
        assert!(error.to_string().contains("bounds"));
    }
}
