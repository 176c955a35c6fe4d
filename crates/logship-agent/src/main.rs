// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logship::{
    clock::MonotonicClock,
    config::Config,
    reader::{format_event_line, read_events, QueryFilter},
    record::{Level, Record},
    shipper::LogShipper,
    transport::{HttpTransport, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Ship stdin lines until EOF or ctrl-c.
    Ship,
    /// Print the reassembled content of the stream.
    View,
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let mode = match env::args().nth(1).as_deref() {
        None | Some("ship") => Mode::Ship,
        Some("view") => Mode::View,
        Some(other) => {
            error!("Unknown mode '{other}', expected 'ship' or 'view'");
            std::process::exit(2);
        }
    };

    let result = match mode {
        Mode::Ship => ship().await,
        Mode::View => view().await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn load_config() -> Result<(Config, Arc<dyn Transport>)> {
    let config = Config::from_env().context("invalid writer configuration")?;
    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(&config.endpoint, config.timeout)
            .context("failed to build HTTP client")?,
    );
    Ok((config, transport))
}

async fn ship() -> Result<()> {
    let (config, transport) = load_config()?;
    let shipper = LogShipper::start(&config, transport, Arc::new(MonotonicClock::new()))
        .await
        .context("failed to start shipper")?;
    info!("Shipping stdin to {}", shipper.destination());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let outcome = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(record) = parse_line(&line, config.tag.as_deref()) {
                        shipper.submit(record);
                    }
                }
                Ok(None) => {
                    debug!("End of input");
                    break Ok(());
                }
                Err(e) => break Err(anyhow!(e).context("failed to read stdin")),
            },
            _ = &mut interrupted => {
                info!("Interrupted, shutting down");
                break Ok(());
            }
        }
    };

    shipper.shutdown().await;
    info!(
        "Delivered {} events, dropped {}",
        shipper.stats().delivered(),
        shipper.stats().dropped()
    );
    outcome
}

async fn view() -> Result<()> {
    let (config, transport) = load_config()?;
    let filter = view_filter(|name| env::var(name).ok())?;

    let events = read_events(transport.as_ref(), &config.destination(), &filter)
        .await
        .with_context(|| format!("failed to read {}", config.destination()))?;
    for event in &events {
        println!("{}", format_event_line(event));
    }
    transport.close().await;
    Ok(())
}

/// A stdin line as a record. A leading level name (`WARN ...`,
/// `error: ...`) sets the level, anything else is logged at INFO.
fn parse_line(line: &str, tag: Option<&str>) -> Option<Record> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let (level, message) = line
        .split_once(|c: char| c == ' ' || c == ':')
        .and_then(|(first, rest)| Level::parse(first).map(|level| (level, rest.trim_start())))
        .unwrap_or((Level::Info, line));

    let record = Record::new(level, message).with_context("source", "stdin");
    Some(match tag {
        Some(tag) => record.with_tag(tag),
        None => record,
    })
}

fn view_filter(var: impl Fn(&str) -> Option<String>) -> Result<QueryFilter> {
    fn number<T: std::str::FromStr>(
        var: &impl Fn(&str) -> Option<String>,
        name: &str,
    ) -> Result<Option<T>> {
        var(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<T>()
                    .map_err(|_| anyhow!("{name} must be a number, got '{value}'"))
            })
            .transpose()
    }

    Ok(QueryFilter {
        start: number(&var, "LOGSHIP_VIEW_START")?,
        end: number(&var, "LOGSHIP_VIEW_END")?,
        limit: number(&var, "LOGSHIP_VIEW_LIMIT")?,
        search: var("LOGSHIP_VIEW_SEARCH").filter(|s| !s.is_empty()),
        regex: var("LOGSHIP_VIEW_REGEX")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false),
    })
}
