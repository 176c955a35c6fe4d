// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turning a [`Record`] into the text that is shipped.

use std::fmt::Write;

use crate::pattern::Pattern;
use crate::record::Record;

#[cfg(windows)]
const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
const LINE_SEPARATOR: &str = "\n";

/// Renders a record into its shipped text. Implementations must not depend
/// on anything but the record, so a fragment renders the same way wherever
/// it is encoded.
pub trait MessageRenderer: Send + Sync {
    fn render(&self, record: &Record) -> String;

    /// Upper bound on the bytes `c` adds to a rendering when it is part of
    /// the message.
    fn payload_width(&self, c: char) -> usize {
        c.len_utf8()
    }
}

/// Renders a single format pattern.
#[derive(Debug, Clone)]
pub struct PlainRenderer {
    pattern: Pattern,
}

impl PlainRenderer {
    #[must_use]
    pub fn new(pattern: Pattern) -> Self {
        PlainRenderer { pattern }
    }
}

impl MessageRenderer for PlainRenderer {
    fn render(&self, record: &Record) -> String {
        self.pattern.render(record)
    }

    fn payload_width(&self, c: char) -> usize {
        c.len_utf8() * self.pattern.message_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonLayout {
    /// Indented object, one field per line.
    Pretty,
    /// Single line object terminated by a newline.
    Compact,
}

/// Renders a JSON object with one string attribute per configured field.
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    fields: Vec<(String, Pattern)>,
    layout: JsonLayout,
}

impl JsonRenderer {
    #[must_use]
    pub fn new(fields: Vec<(String, Pattern)>, layout: JsonLayout) -> Self {
        JsonRenderer { fields, layout }
    }

    #[must_use]
    pub fn layout(&self) -> JsonLayout {
        self.layout
    }
}

impl MessageRenderer for JsonRenderer {
    fn render(&self, record: &Record) -> String {
        let pretty = self.layout == JsonLayout::Pretty;
        let mut builder = String::new();

        if pretty {
            builder.push_str(LINE_SEPARATOR);
            builder.push('\t');
        }
        builder.push('{');
        if pretty {
            builder.push_str(LINE_SEPARATOR);
        }

        for (i, (name, pattern)) in self.fields.iter().enumerate() {
            if pretty {
                builder.push_str("\t\t");
            }
            builder.push('"');
            let start = builder.len();
            builder.push_str(name);
            escape_from(&mut builder, start);
            builder.push_str("\": \"");

            let start = builder.len();
            pattern.render_into(record, &mut builder);
            escape_from(&mut builder, start);
            builder.push('"');

            if i + 1 < self.fields.len() {
                builder.push(',');
                if pretty {
                    builder.push_str(LINE_SEPARATOR);
                } else {
                    builder.push(' ');
                }
            }
        }

        if pretty {
            builder.push_str(LINE_SEPARATOR);
            builder.push('\t');
        }
        builder.push('}');
        if !pretty {
            builder.push_str(LINE_SEPARATOR);
        }
        builder
    }

    fn payload_width(&self, c: char) -> usize {
        let count: usize = self
            .fields
            .iter()
            .map(|(_, pattern)| pattern.message_count())
            .sum();
        escaped_width(c) * count
    }
}

/// Bytes `c` takes once escaped by [`escape_from`].
fn escaped_width(c: char) -> usize {
    match c {
        '\\' | '"' | '\t' | '\u{8}' | '\u{c}' | '\n' | '\r' => 2,
        c if c < '\u{20}' => 6,
        c => c.len_utf8(),
    }
}

/// Escapes everything in `builder` from byte offset `start` on, leaving the
/// earlier content alone.
///
/// The result equals applying these replacements one after the other:
/// backslash, double quote, platform line separator, tab, backspace, form
/// feed, `\n`, `\r`. Other control characters become `\u00XX`.
pub fn escape_from(builder: &mut String, start: usize) {
    let tail = builder.split_off(start);
    builder.reserve(tail.len());

    let mut chars = tail.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => builder.push_str("\\\\"),
            '"' => builder.push_str("\\\""),
            '\r' if LINE_SEPARATOR == "\r\n" && chars.peek() == Some(&'\n') => {
                chars.next();
                builder.push_str("\\n");
            }
            '\t' => builder.push_str("\\t"),
            '\u{8}' => builder.push_str("\\b"),
            '\u{c}' => builder.push_str("\\f"),
            '\n' => builder.push_str("\\n"),
            '\r' => builder.push_str("\\r"),
            c if c < '\u{20}' => {
                let _ = write!(builder, "\\u{:04x}", c as u32);
            }
            c => builder.push(c),
        }
    }
}
