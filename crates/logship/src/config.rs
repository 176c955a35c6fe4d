// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Writer configuration.
//!
//! A [`Config`] is built from a flat property map (`logGroupName`,
//! `streamName`, `format`, `field.<name>`, ...) or from `LOGSHIP_*`
//! environment variables, which are mapped onto the same keys.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::Codec;
use crate::constants::{
    CONTEXT_KEY_PART, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_STAGE1_CONCURRENCY, JSON_CONTEXT_ATTRIBUTE,
};
use crate::cursor::Destination;
use crate::errors::ConfigError;
use crate::pattern::Pattern;
use crate::renderer::{JsonLayout, JsonRenderer, MessageRenderer, PlainRenderer};

const FIELD_PREFIX: &str = "field.";
const ENV_FIELD_PREFIX: &str = "LOGSHIP_FIELD_";

pub const DEFAULT_PLAIN_PATTERN: &str = "{date} [{thread}] {level}: {message}";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4566";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable -> property key.
const ENV_PROPERTIES: &[(&str, &str)] = &[
    ("LOGSHIP_LOG_GROUP", "logGroupName"),
    ("LOGSHIP_STREAM", "streamName"),
    ("LOGSHIP_FORMAT", "format"),
    ("LOGSHIP_PATTERN", "pattern"),
    ("LOGSHIP_MAX_MESSAGE_SIZE", "maxMessageSize"),
    ("LOGSHIP_SPLIT", "split"),
    ("LOGSHIP_TAG", "tag"),
    ("LOGSHIP_CONCURRENCY", "concurrency"),
    ("LOGSHIP_ENDPOINT", "endpoint"),
    ("LOGSHIP_TIMEOUT_MS", "timeout"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line JSON object.
    #[default]
    Json,
    /// One JSON object per line.
    LdJson,
    Plain,
}

impl OutputFormat {
    /// Parses a format name. Unknown names fall back to [`OutputFormat::Json`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "ldjson" => OutputFormat::LdJson,
            "plain" => OutputFormat::Plain,
            _ => {
                warn!("LOGSHIP | Illegal format '{value}', falling back to json");
                OutputFormat::Json
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub group: String,
    pub stream: String,
    pub format: OutputFormat,
    /// JSON attribute name -> format pattern, in output order.
    pub fields: Vec<(String, String)>,
    /// Format pattern of the plain output.
    pub pattern: String,
    pub max_message_size: usize,
    /// Split oversized records instead of truncating them.
    pub split: bool,
    pub tag: Option<String>,
    pub concurrency: usize,
    pub endpoint: String,
    pub timeout: Duration,
}

impl Config {
    /// Configuration with every optional value at its default.
    #[must_use]
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Config {
            group: group.into(),
            stream: stream.into(),
            format: OutputFormat::default(),
            fields: default_fields(),
            pattern: DEFAULT_PLAIN_PATTERN.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            split: true,
            tag: None,
            concurrency: DEFAULT_STAGE1_CONCURRENCY,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let group = required(properties, "logGroupName")?;
        let stream = required(properties, "streamName")?;
        let mut config = Config::new(group, stream);

        if let Some(format) = non_empty(properties, "format") {
            config.format = OutputFormat::parse(format);
        }

        let fields: BTreeMap<&str, &String> = properties
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(FIELD_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name, value))
            })
            .collect();
        if !fields.is_empty() {
            config.fields = fields
                .into_iter()
                .map(|(name, pattern)| (name.to_string(), pattern.clone()))
                .collect();
        }

        if let Some(pattern) = non_empty(properties, "pattern") {
            config.pattern = pattern.to_string();
        }
        if let Some(size) = parsed::<usize>(properties, "maxMessageSize")? {
            config.max_message_size = size;
        }
        if let Some(split) = non_empty(properties, "split") {
            config.split = parse_bool("split", split)?;
        }
        config.tag = non_empty(properties, "tag").map(str::to_string);
        if let Some(concurrency) = parsed::<usize>(properties, "concurrency")? {
            if concurrency == 0 {
                return Err(ConfigError::Invalid {
                    key: "concurrency",
                    value: concurrency.to_string(),
                });
            }
            config.concurrency = concurrency;
        }
        if let Some(endpoint) = non_empty(properties, "endpoint") {
            config.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(timeout) = parsed::<u64>(properties, "timeout")? {
            config.timeout = Duration::from_millis(timeout);
        }

        if config.split && !config.renders_marker() {
            warn!(
                "LOGSHIP | Splitting is enabled but no field renders the '{CONTEXT_KEY_PART}' context entry, split records cannot be reassembled"
            );
        }

        debug!("LOGSHIP | Loaded writer configuration for {}", config.destination());
        Ok(config)
    }

    /// Reads `LOGSHIP_*` variables. `LOGSHIP_FIELD_<NAME>` defines the JSON
    /// field `<name>` (lowercased).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut properties: HashMap<String, String> = ENV_PROPERTIES
            .iter()
            .filter_map(|(var, key)| env::var(var).ok().map(|value| (key.to_string(), value)))
            .collect();

        for (var, value) in env::vars() {
            if let Some(name) = var.strip_prefix(ENV_FIELD_PREFIX) {
                properties.insert(
                    format!("{FIELD_PREFIX}{}", name.to_ascii_lowercase()),
                    value,
                );
            }
        }

        Config::from_properties(&properties)
    }

    #[must_use]
    pub fn destination(&self) -> Destination {
        Destination {
            group: self.group.clone(),
            stream: self.stream.clone(),
        }
    }

    #[must_use]
    pub fn build_renderer(&self) -> Arc<dyn MessageRenderer> {
        match self.format {
            OutputFormat::Plain => Arc::new(PlainRenderer::new(Pattern::parse(&self.pattern))),
            OutputFormat::Json | OutputFormat::LdJson => {
                let layout = if self.format == OutputFormat::Json {
                    JsonLayout::Pretty
                } else {
                    JsonLayout::Compact
                };
                let fields = self
                    .fields
                    .iter()
                    .map(|(name, pattern)| (name.clone(), Pattern::parse(pattern)))
                    .collect();
                Arc::new(JsonRenderer::new(fields, layout))
            }
        }
    }

    #[must_use]
    pub fn build_codec(&self) -> Codec {
        Codec::new(self.build_renderer(), self.max_message_size, self.split)
    }

    /// Whether split fragments will carry their marker in the output.
    fn renders_marker(&self) -> bool {
        match self.format {
            OutputFormat::Plain => Pattern::parse(&self.pattern).renders_context_key(CONTEXT_KEY_PART),
            OutputFormat::Json | OutputFormat::LdJson => self.fields.iter().any(|(name, pattern)| {
                name == JSON_CONTEXT_ATTRIBUTE
                    && Pattern::parse(pattern).renders_context_key(CONTEXT_KEY_PART)
            }),
        }
    }
}

fn default_fields() -> Vec<(String, String)> {
    [
        ("date", "{date}"),
        ("level", "{level}"),
        ("message", "{message}"),
        ("context", "{context}"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
    .collect()
}

fn non_empty<'a>(properties: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn required(
    properties: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    non_empty(properties, key)
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(
    properties: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    non_empty(properties, key)
        .map(|value| {
            value.parse::<T>().map_err(|_| ConfigError::Invalid {
                key,
                value: value.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, Record};
    use duplicate::duplicate_item;
    use serial_test::serial;
    use tracing_test::traced_test;

    fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_group_is_an_error() {
        let error = Config::from_properties(&properties(&[("streamName", "s")])).unwrap_err();
        assert_eq!(
            error.to_string(),
            "parameter 'logGroupName' must be set in writer configuration"
        );
    }

    #[test]
    fn test_empty_stream_is_an_error() {
        let error = Config::from_properties(&properties(&[
            ("logGroupName", "g"),
            ("streamName", "  "),
        ]))
        .unwrap_err();
        assert!(matches!(error, ConfigError::Missing("streamName")));
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_properties(&properties(&[("logGroupName", "g"), ("streamName", "s")]))
                .unwrap();
        assert_eq!(config, Config::new("g", "s"));
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.split);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.fields.len(), 4);
    }

    #[duplicate_item(
        test_name                   value       expected;
        [test_format_json]          ["json"]    [OutputFormat::Json];
        [test_format_upper_json]    ["JSON"]    [OutputFormat::Json];
        [test_format_ldjson]        ["LdJson"]  [OutputFormat::LdJson];
        [test_format_plain]         ["plain"]   [OutputFormat::Plain];
    )]
    #[test]
    fn test_name() {
        assert_eq!(OutputFormat::parse(value), expected);
    }

    #[test]
    #[traced_test]
    fn test_unknown_format_warns_and_falls_back() {
        let config = Config::from_properties(&properties(&[
            ("logGroupName", "g"),
            ("streamName", "s"),
            ("format", "yaml"),
        ]))
        .unwrap();
        assert_eq!(config.format, OutputFormat::Json);
        assert!(logs_contain("Illegal format 'yaml'"));
    }

    #[test]
    fn test_fields_and_options() {
        let config = Config::from_properties(&properties(&[
            ("logGroupName", "g"),
            ("streamName", "s"),
            ("format", "ldjson"),
            ("field.msg", "{message}"),
            ("field.context", "{context: part}"),
            ("maxMessageSize", "1000"),
            ("split", "false"),
            ("tag", "audit"),
            ("concurrency", "2"),
            ("endpoint", "http://localhost:9000/"),
            ("timeout", "250"),
        ]))
        .unwrap();

        assert_eq!(
            config.fields,
            vec![
                ("context".to_string(), "{context: part}".to_string()),
                ("msg".to_string(), "{message}".to_string()),
            ]
        );
        assert_eq!(config.max_message_size, 1000);
        assert!(!config.split);
        assert_eq!(config.tag.as_deref(), Some("audit"));
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.endpoint, "http://localhost:9000");
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        for (key, value) in [
            ("maxMessageSize", "big"),
            ("split", "maybe"),
            ("concurrency", "0"),
        ] {
            let error = Config::from_properties(&properties(&[
                ("logGroupName", "g"),
                ("streamName", "s"),
                (key, value),
            ]))
            .unwrap_err();
            assert!(
                matches!(error, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}"
            );
        }
    }

    #[test]
    #[traced_test]
    fn test_split_without_marker_field_warns() {
        Config::from_properties(&properties(&[
            ("logGroupName", "g"),
            ("streamName", "s"),
            ("field.message", "{message}"),
        ]))
        .unwrap();
        assert!(logs_contain("cannot be reassembled"));
    }

    #[test]
    fn test_build_renderer_follows_format() {
        let record = Record::new(Level::Warn, "hi").with_timestamp(0);

        let mut config = Config::new("g", "s");
        config.fields = vec![("message".to_string(), "{message}".to_string())];
        config.format = OutputFormat::LdJson;
        assert_eq!(
            config.build_renderer().render(&record).trim_end(),
            r#"{"message": "hi"}"#
        );

        config.format = OutputFormat::Plain;
        config.pattern = "{level} {message}".to_string();
        assert_eq!(config.build_renderer().render(&record), "WARN hi");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("LOGSHIP_LOG_GROUP", "env-group");
        env::set_var("LOGSHIP_STREAM", "env-stream");
        env::set_var("LOGSHIP_FORMAT", "plain");
        env::set_var("LOGSHIP_FIELD_HOST", "{context: host}");
        env::set_var("LOGSHIP_SPLIT", "no");

        let config = Config::from_env().unwrap();
        assert_eq!(config.group, "env-group");
        assert_eq!(config.stream, "env-stream");
        assert_eq!(config.format, OutputFormat::Plain);
        assert_eq!(
            config.fields,
            vec![("host".to_string(), "{context: host}".to_string())]
        );
        assert!(!config.split);

        env::remove_var("LOGSHIP_LOG_GROUP");
        env::remove_var("LOGSHIP_STREAM");
        env::remove_var("LOGSHIP_FORMAT");
        env::remove_var("LOGSHIP_FIELD_HOST");
        env::remove_var("LOGSHIP_SPLIT");
    }

    #[test]
    #[serial]
    fn test_from_env_requires_group() {
        env::remove_var("LOGSHIP_LOG_GROUP");
        env::set_var("LOGSHIP_STREAM", "env-stream");

        let error = Config::from_env().unwrap_err();
        assert!(matches!(error, ConfigError::Missing("logGroupName")));

        env::remove_var("LOGSHIP_STREAM");
    }
}
