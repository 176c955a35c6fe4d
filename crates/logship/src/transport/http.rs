// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON-over-HTTP client for a CloudWatch Logs style ingestion endpoint.
//!
//! Every call is a `POST /` whose action is named by the `X-Amz-Target`
//! header. Requests are not signed: point the endpoint at a local service or
//! a signing proxy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use super::{
    AppendRequest, AppendResponse, OutputRecord, QueryPage, QueryRequest, StreamDescription,
    Transport, TransportError,
};

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    closed: AtomicBool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsResponse {
    #[serde(default)]
    log_groups: Vec<LogGroup>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogGroup {
    log_group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<StreamDescription>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    next_sequence_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEventsResponse {
    #[serde(default)]
    events: Vec<OutputRecord>,
    next_forward_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    start_from_head: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default, alias = "Message")]
    message: String,
    #[serde(default)]
    expected_sequence_token: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(HttpTransport {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            closed: AtomicBool::new(false),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        trace!("LOGSHIP | {action} request: {body}");
        let response = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{action}"))
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            let text = if text.trim().is_empty() { "{}" } else { &text };
            return Ok(serde_json::from_str(text)?);
        }

        debug!("LOGSHIP | {action} failed with {status}: {text}");
        Err(error_from_body(status.as_u16(), &text))
    }
}

/// The token of the page after `current`, unless the listing is exhausted.
fn next_page(current: Option<&str>, next: Option<String>) -> Option<String> {
    next.filter(|next| current != Some(next.as_str()))
}

fn error_from_body(status: u16, text: &str) -> TransportError {
    let body: ErrorBody = serde_json::from_str(text).unwrap_or_default();
    // the type may come namespaced, e.g. "com.amazonaws.logs#ThrottlingException"
    let kind = body.kind.rsplit('#').next().unwrap_or_default();
    let message = if body.message.is_empty() {
        text.to_string()
    } else {
        body.message
    };
    match kind {
        "ResourceNotFoundException" => TransportError::ResourceNotFound(message),
        "ResourceAlreadyExistsException" => TransportError::AlreadyExists(message),
        "InvalidSequenceTokenException" => TransportError::InvalidSequenceToken {
            expected: body.expected_sequence_token,
            message,
        },
        "DataAlreadyAcceptedException" => TransportError::DataAlreadyAccepted {
            expected: body.expected_sequence_token,
            message,
        },
        "ThrottlingException" | "LimitExceededException" | "ServiceUnavailableException" => {
            TransportError::Throttled(message)
        }
        _ => TransportError::Status { status, message },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn describe_group(&self, group: &str) -> Result<bool, TransportError> {
        let mut token: Option<String> = None;
        loop {
            let mut body = json!({ "logGroupNamePrefix": group });
            if let Some(token) = &token {
                body["nextToken"] = json!(token);
            }
            let response: DescribeLogGroupsResponse = self.call("DescribeLogGroups", body).await?;
            if response.log_groups.iter().any(|g| g.log_group_name == group) {
                return Ok(true);
            }
            match next_page(token.as_deref(), response.next_token) {
                Some(next) => token = Some(next),
                None => return Ok(false),
            }
        }
    }

    async fn describe_stream(
        &self,
        group: &str,
        stream: &str,
    ) -> Result<Option<StreamDescription>, TransportError> {
        let mut token: Option<String> = None;
        loop {
            let mut body = json!({ "logGroupName": group, "logStreamNamePrefix": stream });
            if let Some(token) = &token {
                body["nextToken"] = json!(token);
            }
            let response: DescribeLogStreamsResponse =
                self.call("DescribeLogStreams", body).await?;
            if let Some(found) = response
                .log_streams
                .into_iter()
                .find(|s| s.log_stream_name == stream)
            {
                return Ok(Some(found));
            }
            match next_page(token.as_deref(), response.next_token) {
                Some(next) => token = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "CreateLogStream",
                json!({ "logGroupName": group, "logStreamName": stream }),
            )
            .await?;
        Ok(())
    }

    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, TransportError> {
        let mut body = json!({
            "logGroupName": request.group,
            "logStreamName": request.stream,
            "logEvents": [{ "timestamp": request.timestamp, "message": request.message }],
        });
        if let Some(cursor) = request.cursor {
            body["sequenceToken"] = json!(cursor);
        }
        let response: PutLogEventsResponse = self.call("PutLogEvents", body).await?;
        Ok(AppendResponse {
            next_cursor: response.next_sequence_token,
        })
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, TransportError> {
        let body = serde_json::to_value(GetLogEventsRequest {
            log_group_name: &request.group,
            log_stream_name: &request.stream,
            start_from_head: true,
            start_time: request.start_time,
            end_time: request.end_time,
            limit: request.limit,
            next_token: request.next_token.as_deref(),
        })?;
        let response: GetLogEventsResponse = self.call("GetLogEvents", body).await?;
        Ok(QueryPage {
            events: response.events,
            next_token: response.next_forward_token,
        })
    }

    async fn close(&self) {
        debug!("LOGSHIP | Closing HTTP transport for {}", self.endpoint);
        self.closed.store(true, Ordering::Release);
    }
}
