// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Format patterns such as `{date} {level}: {message}`.
//!
//! A pattern is parsed once into a list of tokens and rendered against every
//! record. Supported placeholders:
//!
//! | placeholder | renders |
//! |-------------|---------|
//! | `{date}` / `{date: <strftime>}` | record timestamp in local time |
//! | `{timestamp}` | record timestamp in epoch milliseconds |
//! | `{level}` | `INFO`, `WARN`, ... |
//! | `{message}` | record payload |
//! | `{thread}` | thread name |
//! | `{class}` `{method}` `{file}` `{line}` | source location |
//! | `{tag}` | record tag |
//! | `{context}` | every context entry as `key=value`, comma separated |
//! | `{context: key}` | a single context value |
//!
//! Anything else is copied literally.

use std::fmt::Write;

use chrono::{Local, TimeZone};
use tracing::warn;

use crate::record::Record;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Date(String),
    Timestamp,
    Level,
    Message,
    Thread,
    Class,
    Method,
    File,
    Line,
    Tag,
    Context(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                // unterminated placeholder, keep the remainder verbatim
                literal.push_str(&rest[open..]);
                rest = "";
                break;
            };
            let placeholder = &after[..close];
            match parse_placeholder(placeholder) {
                Some(token) => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(token);
                }
                None => {
                    warn!("LOGSHIP | Unknown placeholder '{{{placeholder}}}' in format pattern");
                    literal.push('{');
                    literal.push_str(placeholder);
                    literal.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Pattern { tokens }
    }

    /// Appends the rendering of `record` to `out`.
    pub fn render_into(&self, record: &Record, out: &mut String) {
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Date(format) => {
                    if let Some(date) = Local.timestamp_millis_opt(record.timestamp).single() {
                        let _ = write!(out, "{}", date.format(format));
                    }
                }
                Token::Timestamp => {
                    let _ = write!(out, "{}", record.timestamp);
                }
                Token::Level => out.push_str(record.level.as_str()),
                Token::Message => out.push_str(&record.message),
                Token::Thread => push_opt(out, record.thread.as_deref()),
                Token::Class => push_opt(out, record.location.class.as_deref()),
                Token::Method => push_opt(out, record.location.method.as_deref()),
                Token::File => push_opt(out, record.location.file.as_deref()),
                Token::Line => {
                    if let Some(line) = record.location.line {
                        let _ = write!(out, "{line}");
                    }
                }
                Token::Tag => push_opt(out, record.tag.as_deref()),
                Token::Context(Some(key)) => {
                    push_opt(out, record.context.get(key).map(String::as_str));
                }
                Token::Context(None) => {
                    let mut first = true;
                    for (key, value) in &record.context {
                        if !first {
                            out.push_str(", ");
                        }
                        first = false;
                        let _ = write!(out, "{key}={value}");
                    }
                }
            }
        }
    }

    /// Whether rendering this pattern outputs the context entry `key`.
    #[must_use]
    pub fn renders_context_key(&self, key: &str) -> bool {
        self.tokens.iter().any(|token| match token {
            Token::Context(None) => true,
            Token::Context(Some(name)) => name == key,
            _ => false,
        })
    }

    /// How many times the record's message appears in a rendering.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|token| matches!(token, Token::Message))
            .count()
    }

    #[must_use]
    pub fn render(&self, record: &Record) -> String {
        let mut out = String::new();
        self.render_into(record, &mut out);
        out
    }
}

fn push_opt(out: &mut String, value: Option<&str>) {
    if let Some(value) = value {
        out.push_str(value);
    }
}

fn parse_placeholder(placeholder: &str) -> Option<Token> {
    let (name, argument) = match placeholder.split_once(':') {
        Some((name, argument)) => (name.trim(), Some(argument.trim())),
        None => (placeholder.trim(), None),
    };
    let token = match (name, argument) {
        ("date", None) => Token::Date(DEFAULT_DATE_FORMAT.to_string()),
        ("date", Some(format)) => Token::Date(format.to_string()),
        ("timestamp", None) => Token::Timestamp,
        ("level", None) => Token::Level,
        ("message", None) => Token::Message,
        ("thread", None) => Token::Thread,
        ("class", None) => Token::Class,
        ("method", None) => Token::Method,
        ("file", None) => Token::File,
        ("line", None) => Token::Line,
        ("tag", None) => Token::Tag,
        ("context", None) => Token::Context(None),
        ("context", Some(key)) if !key.is_empty() => Token::Context(Some(key.to_string())),
        _ => return None,
    };
    Some(token)
}
