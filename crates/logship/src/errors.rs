// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::transport::TransportError;

/// Invalid or missing configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parameter '{0}' must be set in writer configuration")]
    Missing(&'static str),
    #[error("invalid value '{value}' for parameter '{key}'")]
    Invalid { key: &'static str, value: String },
}

/// Failures while bringing a shipper up. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("log group '{0}' does not exist")]
    GroupNotFound(String),
    #[error("log stream '{stream}' could not be created in group '{group}': {source}")]
    StreamCreation {
        group: String,
        stream: String,
        #[source]
        source: TransportError,
    },
    #[error("log stream '{stream}' not found in group '{group}' after creation")]
    StreamNotFound { group: String, stream: String },
    #[error("failed to describe log destination: {0}")]
    Describe(#[source] TransportError),
    #[error("failed to create transport: {0}")]
    Transport(#[source] TransportError),
    #[error("no tokio runtime available to drive the shipper")]
    NoRuntime,
}

/// Failures on the read path.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown writer '{0}'")]
    UnknownWriter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Missing("logGroupName");
        assert_eq!(
            error.to_string(),
            "parameter 'logGroupName' must be set in writer configuration"
        );
    }

    #[test]
    fn test_config_error_converts_into_creation_error() {
        let error: CreationError = ConfigError::Missing("streamName").into();
        assert!(matches!(error, CreationError::Config(_)));
        assert_eq!(
            error.to_string(),
            "parameter 'streamName' must be set in writer configuration"
        );
    }

    #[test]
    fn test_stream_creation_error_keeps_source() {
        use std::error::Error;

        let error = CreationError::StreamCreation {
            group: "g".to_string(),
            stream: "s".to_string(),
            source: TransportError::Throttled("slow down".to_string()),
        };
        assert!(error.source().is_some());
        assert!(error.to_string().contains("'s'"));
    }
}
