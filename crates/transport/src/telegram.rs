//! Telegram Bot API transport.
//!
//! Chunks are sent as documents to a single chat; the returned message id
//! and file id form the locator address (`<message_id>:<file_id>`).
//! Fetching resolves the file id to a download path with `getFile`, then
//! downloads it from the file endpoint.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use televault_types::{Digest, RemoteLocator};
use tracing::{debug, warn};

use crate::rate::RateWindow;
use crate::{RemoteTransport, TransportError, TransportFuture};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Connection settings for the Bot API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,

    /// Chat (channel, group or private chat) the bot stores documents in.
    #[serde(default)]
    pub chat_id: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Requests allowed per `window_secs`.
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: usize,

    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Largest payload the bot can both upload and download again.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.into()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_requests_per_window() -> usize {
    20
}

fn default_window() -> u64 {
    60
}

fn default_max_payload() -> usize {
    // getFile refuses files above 20 MB.
    20 * 1024 * 1024
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
            requests_per_window: default_requests_per_window(),
            window_secs: default_window(),
            max_payload: default_max_payload(),
        }
    }
}

impl TelegramConfig {
    /// Both the token and the chat id are set.
    pub fn is_configured(&self) -> bool {
        !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }
}

/// Result of a successful connection test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub username: String,
    /// Id of the test message posted to the chat.
    pub test_message_id: i64,
}

// ---------------------------------------------------------------------------
// API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    document: Option<DocumentInfo>,
}

#[derive(Debug, Deserialize)]
struct DocumentInfo {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    username: Option<String>,
    first_name: String,
}

// ---------------------------------------------------------------------------
// Locator addresses
// ---------------------------------------------------------------------------

/// Formats a locator address from its message and file ids.
fn format_address(message_id: i64, file_id: &str) -> String {
    format!("{message_id}:{file_id}")
}

/// Splits a locator address into message id and file id.
fn parse_address(address: &str) -> Result<(i64, &str), TransportError> {
    let (message_id, file_id) = address
        .split_once(':')
        .ok_or_else(|| TransportError::NotFound(format!("malformed locator: {address}")))?;
    let message_id = message_id
        .parse::<i64>()
        .map_err(|_| TransportError::NotFound(format!("malformed locator: {address}")))?;
    if file_id.is_empty() {
        return Err(TransportError::NotFound(format!(
            "malformed locator: {address}"
        )));
    }
    Ok((message_id, file_id))
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Maps a Bot API error response onto the transport error taxonomy.
fn classify(status: u16, description: &str, retry_after: Option<u64>) -> TransportError {
    let desc = description.to_ascii_lowercase();
    match status {
        429 => TransportError::Transient {
            reason: format!("rate limited: {description}"),
            retry_after: Some(Duration::from_secs(retry_after.unwrap_or(1))),
        },
        413 => TransportError::PayloadTooLarge { size: 0, limit: 0 },
        401 | 403 | 404 => TransportError::Unauthorized(description.to_string()),
        400 if desc.contains("file is too big") || desc.contains("too large") => {
            TransportError::PayloadTooLarge { size: 0, limit: 0 }
        }
        400 if desc.contains("wrong file_id")
            || desc.contains("invalid file_id")
            || desc.contains("file not found")
            || desc.contains("message to delete not found")
            || desc.contains("message can't be deleted") =>
        {
            TransportError::NotFound(description.to_string())
        }
        500..=599 => TransportError::transient(format!("server error {status}: {description}")),
        // Remaining 4xx (chat not found, bad chat id, ...) will not fix
        // themselves on retry.
        _ => TransportError::Unauthorized(format!("rejected ({status}): {description}")),
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Stores chunks as documents in a Telegram chat.
pub struct TelegramTransport {
    http: reqwest::Client,
    config: TelegramConfig,
    rate: RateWindow,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self, TransportError> {
        if !config.is_configured() {
            return Err(TransportError::Unauthorized(
                "bot token and chat id must be set".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let rate = RateWindow::new(
            config.requests_per_window,
            Duration::from_secs(config.window_secs),
        );
        Ok(Self {
            http,
            config: TelegramConfig {
                bot_token: config.bot_token.trim().to_string(),
                chat_id: config.chat_id.trim().to_string(),
                ..config
            },
            rate,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// Sends a Bot API request and unwraps the `result` field.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        self.rate.record();
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        match serde_json::from_slice::<ApiResponse<T>>(&body) {
            Ok(api) if api.ok => api
                .result
                .ok_or_else(|| TransportError::transient(format!("{method}: missing result"))),
            Ok(api) => {
                let code = api.error_code.unwrap_or(status.as_u16());
                let retry_after = api.parameters.and_then(|p| p.retry_after);
                Err(self.rejected(
                    method,
                    code,
                    api.description.as_deref().unwrap_or_default(),
                    retry_after,
                ))
            }
            Err(e) if status.is_success() => Err(TransportError::transient(format!(
                "{method}: malformed response: {e}"
            ))),
            Err(_) => Err(self.rejected(
                method,
                status.as_u16(),
                &String::from_utf8_lossy(&body),
                None,
            )),
        }
    }

    fn rejected(
        &self,
        method: &str,
        status: u16,
        description: &str,
        retry_after: Option<u64>,
    ) -> TransportError {
        let err = classify(status, description, retry_after);
        if let Some(delay) = err.retry_after() {
            self.rate.penalize(delay);
        }
        warn!(method, status, error = %err, "bot API request failed");
        err
    }

    /// Checks the bot token (`getMe`), then the chat id by posting a test
    /// message.
    pub async fn verify(&self) -> Result<BotIdentity, TransportError> {
        let me: BotUser = self
            .call("getMe", self.http.get(self.method_url("getMe")))
            .await?;
        let username = me.username.unwrap_or(me.first_name);

        let text = format!("TeleVault connection successful! Bot: @{username}");
        let sent: SentMessage = self
            .call(
                "sendMessage",
                self.http.post(self.method_url("sendMessage")).form(&[
                    ("chat_id", self.config.chat_id.as_str()),
                    ("text", text.as_str()),
                ]),
            )
            .await?;

        debug!(bot = %username, message_id = sent.message_id, "connection verified");
        Ok(BotIdentity {
            username,
            test_message_id: sent.message_id,
        })
    }

    async fn put_inner(
        &self,
        digest: &Digest,
        payload: &[u8],
    ) -> Result<RemoteLocator, TransportError> {
        if payload.len() > self.config.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload,
            });
        }

        let part = Part::bytes(payload.to_vec())
            .file_name(format!("{}.chunk", digest.to_hex()))
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("disable_notification", "true")
            .part("document", part);

        let sent: SentMessage = self
            .call(
                "sendDocument",
                self.http.post(self.method_url("sendDocument")).multipart(form),
            )
            .await
            .map_err(|e| match e {
                TransportError::PayloadTooLarge { .. } => TransportError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.config.max_payload,
                },
                other => other,
            })?;

        let document = sent.document.ok_or_else(|| {
            TransportError::transient("sendDocument: response has no document")
        })?;
        debug!(
            digest = %digest.short(),
            message_id = sent.message_id,
            bytes = payload.len(),
            "chunk stored"
        );
        Ok(RemoteLocator::new(
            *digest,
            format_address(sent.message_id, &document.file_id),
        ))
    }

    async fn get_inner(&self, locator: &RemoteLocator) -> Result<Vec<u8>, TransportError> {
        let (_, file_id) = parse_address(&locator.address)?;

        let info: FileInfo = self
            .call(
                "getFile",
                self.http
                    .get(self.method_url("getFile"))
                    .query(&[("file_id", file_id)]),
            )
            .await?;
        let file_path = info
            .file_path
            .ok_or_else(|| TransportError::NotFound(format!("no file path for {file_id}")))?;
        let limit = self.config.max_payload;
        self.check_download_size(info.file_size, limit)?;

        self.rate.record();
        let mut resp = self.http.get(self.file_url(&file_path)).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(TransportError::NotFound(format!("file {file_id} expired")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.rejected("download", status.as_u16(), &body, None));
        }
        self.check_download_size(resp.content_length(), limit)?;

        // The length header may be absent, so the body is capped as it streams.
        let mut data = Vec::new();
        while let Some(part) = resp.chunk().await? {
            if data.len() + part.len() > limit {
                return Err(TransportError::PayloadTooLarge {
                    size: data.len() + part.len(),
                    limit,
                });
            }
            data.extend_from_slice(&part);
        }
        Ok(data)
    }

    fn check_download_size(&self, size: Option<u64>, limit: usize) -> Result<(), TransportError> {
        match size {
            Some(size) if size > limit as u64 => {
                warn!(size, limit, "refusing oversized download");
                Err(TransportError::PayloadTooLarge {
                    size: usize::try_from(size).unwrap_or(usize::MAX),
                    limit,
                })
            }
            _ => Ok(()),
        }
    }

    async fn delete_inner(&self, locator: &RemoteLocator) -> Result<(), TransportError> {
        let (message_id, _) = parse_address(&locator.address)?;
        let message_id = message_id.to_string();
        let _: bool = self
            .call(
                "deleteMessage",
                self.http.post(self.method_url("deleteMessage")).form(&[
                    ("chat_id", self.config.chat_id.as_str()),
                    ("message_id", message_id.as_str()),
                ]),
            )
            .await?;
        Ok(())
    }
}

impl RemoteTransport for TelegramTransport {
    fn put<'a>(
        &'a self,
        digest: &'a Digest,
        payload: &'a [u8],
    ) -> TransportFuture<'a, RemoteLocator> {
        Box::pin(self.put_inner(digest, payload))
    }

    fn get<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, Vec<u8>> {
        Box::pin(self.get_inner(locator))
    }

    fn delete<'a>(&'a self, locator: &'a RemoteLocator) -> TransportFuture<'a, ()> {
        Box::pin(self.delete_inner(locator))
    }

    fn next_available_slot(&self) -> Duration {
        self.rate.next_available_slot()
    }

    fn max_payload_size(&self) -> usize {
        self.config.max_payload
    }
}
