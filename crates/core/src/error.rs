use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classes the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamUnavailable,
    UpstreamDataMissing,
    StorageWriteFailure,
    ConfigurationMissing,
    DateAttributionError,
    RecordExists,
    InvalidRequest,
}

#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Network or HTTP failure talking to the upstream API.
    UpstreamUnavailable { item_id: String, detail: String },
    /// Well-formed response without a usable price.
    UpstreamDataMissing { item_id: String, detail: String },
    /// Object store, cache or database write rejected.
    StorageWriteFailure { target: String, detail: String },
    /// Required credential absent at startup. The only fatal class.
    ConfigurationMissing(&'static str),
    DateAttributionError { item_id: String, detail: String },
    RecordExists { item_id: String, date: chrono::NaiveDate },
    InvalidRequest(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::UpstreamDataMissing { .. } => ErrorKind::UpstreamDataMissing,
            Self::StorageWriteFailure { .. } => ErrorKind::StorageWriteFailure,
            Self::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            Self::DateAttributionError { .. } => ErrorKind::DateAttributionError,
            Self::RecordExists { .. } => ErrorKind::RecordExists,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn item_id(&self) -> Option<&str> {
        match self {
            Self::UpstreamUnavailable { item_id, .. }
            | Self::UpstreamDataMissing { item_id, .. }
            | Self::DateAttributionError { item_id, .. }
            | Self::RecordExists { item_id, .. } => Some(item_id),
            _ => None,
        }
    }

    pub fn storage(target: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::StorageWriteFailure {
            target: target.into(),
            detail: format!("{err:#}"),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamUnavailable { item_id, detail } => {
                write!(f, "upstream unavailable (item={item_id}): {detail}")
            }
            Self::UpstreamDataMissing { item_id, detail } => {
                write!(f, "upstream data missing (item={item_id}): {detail}")
            }
            Self::StorageWriteFailure { target, detail } => {
                write!(f, "storage write failed (target={target}): {detail}")
            }
            Self::ConfigurationMissing(name) => write!(f, "{name} is required"),
            Self::DateAttributionError { item_id, detail } => {
                write!(f, "date attribution error (item={item_id}): {detail}")
            }
            Self::RecordExists { item_id, date } => write!(
                f,
                "record already exists for item={item_id} date={date}; confirm to overwrite"
            ),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_missing_names_the_variable() {
        let err = PipelineError::ConfigurationMissing("UPSTREAM_API_KEY");
        assert_eq!(err.to_string(), "UPSTREAM_API_KEY is required");
        assert_eq!(err.kind(), ErrorKind::ConfigurationMissing);
        assert!(err.item_id().is_none());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::UpstreamDataMissing).unwrap();
        assert_eq!(v, serde_json::json!("upstream_data_missing"));
    }
}
