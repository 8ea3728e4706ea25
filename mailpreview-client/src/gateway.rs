use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mailpreview_core::{
    CoreError, EventBus, FileId, FileRecord, FileUpdate, KEEPALIVE_TOKEN,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("unsupported page scheme {0}")]
    UnsupportedScheme(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("push channel connect failed: {0}")]
    Connect(String),
    #[error("push channel connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Request and push-channel addresses, derived once from the page origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    http_base: Url,
    push: Url,
}

impl Endpoints {
    /// Same host as the page. The port is kept only when it is not 80 or 443,
    /// and the push channel uses the ws/wss counterpart of the page scheme.
    pub fn from_origin(origin: &Url) -> Result<Self, GatewayError> {
        let push_scheme = match origin.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(GatewayError::UnsupportedScheme(other.to_owned())),
        };
        let host = origin
            .host_str()
            .ok_or_else(|| GatewayError::InvalidBaseUrl(format!("{origin} has no host")))?;
        let authority = match origin.port_or_known_default() {
            Some(80) | Some(443) | None => host.to_owned(),
            Some(port) => format!("{host}:{port}"),
        };

        let http_base = Url::parse(&format!("{}://{authority}", origin.scheme()))
            .map_err(|err| GatewayError::InvalidBaseUrl(err.to_string()))?;
        let push = Url::parse(&format!("{push_scheme}://{authority}/connect"))
            .map_err(|err| GatewayError::InvalidBaseUrl(err.to_string()))?;
        Ok(Self { http_base, push })
    }

    pub fn http_base(&self) -> &Url {
        &self.http_base
    }

    pub fn push_url(&self) -> &Url {
        &self.push
    }

    pub fn api(&self, path: &str) -> Result<Url, GatewayError> {
        self.http_base
            .join(path)
            .map_err(|err| GatewayError::InvalidBaseUrl(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub email: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOption {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub current: String,
    #[serde(default)]
    pub available: Vec<ProviderOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    NoChange,
    Added,
    Updated,
}

/// Stateless request/response calls against the preview backend.
///
/// Failures come back as errors; nothing here retries.
#[derive(Debug, Clone)]
pub struct Gateway {
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl Gateway {
    pub fn new(origin: &Url, user_agent: &str) -> Result<Self, GatewayError> {
        let endpoints = Endpoints::from_origin(origin)?;
        let http = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { endpoints, http })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub async fn list_files(&self) -> Result<Vec<FileUpdate>, GatewayError> {
        let url = self.endpoints.api("/api/files")?;
        let response = expect_success(self.http.get(url).send().await?).await?;
        Ok(response.json::<Vec<FileUpdate>>().await?)
    }

    pub async fn send_test_email(
        &self,
        id: &FileId,
        recipients: &[String],
    ) -> Result<Vec<SendResult>, GatewayError> {
        let url = self.endpoints.api(&format!("/api/files/{id}/sendtest"))?;
        let query = recipients
            .iter()
            .map(|email| ("email", email.as_str()))
            .collect::<Vec<_>>();
        let response = expect_success(self.http.put(url).query(&query).send().await?).await?;
        Ok(response.json::<Vec<SendResult>>().await?)
    }

    pub async fn email_provider_config(&self) -> Result<ProviderConfig, GatewayError> {
        let url = self.endpoints.api("/api/config/email/providers")?;
        let response = expect_success(self.http.get(url).send().await?).await?;
        Ok(response.json::<ProviderConfig>().await?)
    }

    /// Whether the inlined template differs from what is published under `prefix`.
    pub async fn is_changed(&self, id: &FileId, prefix: &str) -> Result<bool, GatewayError> {
        let url = self.endpoints.api(&format!("/api/files/{id}/changed"))?;
        let response =
            expect_success(self.http.get(url).query(&[("prefix", prefix)]).send().await?).await?;
        Ok(response.json::<bool>().await?)
    }

    pub async fn publish(&self, id: &FileId, prefix: &str) -> Result<PublishStatus, GatewayError> {
        let url = self.endpoints.api(&format!("/api/files/{id}/changed"))?;
        let response =
            expect_success(self.http.put(url).query(&[("prefix", prefix)]).send().await?).await?;
        Ok(response.json::<PublishStatus>().await?)
    }

    /// Where the rendered preview of `record` lives.
    pub fn preview_url(&self, record: &FileRecord) -> Result<Url, GatewayError> {
        match record.view_path.as_deref() {
            Some(path) if !path.trim().is_empty() => self.endpoints.api(path),
            _ => self.endpoints.api(&format!("/api/files/{}", record.id)),
        }
    }

    pub async fn fetch_preview(&self, src: &Url) -> Result<String, GatewayError> {
        let response = expect_success(self.http.get(src.clone()).send().await?).await?;
        Ok(response.text().await?)
    }
}

async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    FileChanged(FileUpdate),
    Closed { reason: String },
    /// Every connect attempt failed; the supervisor has stopped.
    GaveUp { error: String },
}

pub async fn connect_push_channel(url: &Url) -> Result<WsStream, GatewayError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            url = %url,
            "connecting push channel"
        );

        let err = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => return Ok(stream),
            Ok(Err(err)) => GatewayError::Connect(err.to_string()),
            Err(_) => GatewayError::ConnectTimeout(CONNECT_TIMEOUT),
        };
        error!(attempt, url = %url, "{err}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(err);
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

/// One live push connection: a reader that fans decoded changes out to the
/// bus and a writer that only ever sends the keep-alive token.
#[derive(Debug)]
pub struct PushChannel {
    writer: JoinHandle<()>,
    reader: JoinHandle<EventBus<ChannelEvent>>,
}

impl PushChannel {
    pub fn spawn(stream: WsStream, keepalive: Duration, bus: EventBus<ChannelEvent>) -> Self {
        let (write_half, read_half) = stream.split();
        Self {
            writer: tokio::spawn(keepalive_task(write_half, keepalive)),
            reader: tokio::spawn(receive_task(read_half, bus)),
        }
    }

    /// Waits for the connection to end and hands the bus back.
    pub async fn closed(mut self) -> Option<EventBus<ChannelEvent>> {
        let bus = (&mut self.reader).await.ok();
        self.writer.abort();
        bus
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Keeps a push channel up for as long as anyone listens.
///
/// A dropped connection triggers a fresh round of bounded connect attempts;
/// when a round fails the supervisor publishes `GaveUp` and returns.
pub async fn supervise_push_channel(url: Url, keepalive: Duration, mut bus: EventBus<ChannelEvent>) {
    loop {
        let stream = match connect_push_channel(&url).await {
            Ok(stream) => stream,
            Err(err) => {
                bus.publish(ChannelEvent::GaveUp {
                    error: err.to_string(),
                });
                return;
            }
        };

        info!(url = %url, "push channel connected");
        bus.publish(ChannelEvent::Connected);

        bus = match PushChannel::spawn(stream, keepalive, bus).closed().await {
            Some(bus) => bus,
            None => return,
        };
        if bus.subscriber_count() == 0 {
            debug!("no push subscribers left");
            return;
        }
    }
}

async fn keepalive_task(mut write: WsWrite, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        if let Err(err) = write.send(Message::text(KEEPALIVE_TOKEN)).await {
            warn!("keep-alive send failed: {}", err);
            break;
        }
        debug!("keep-alive sent");
    }
}

async fn receive_task(mut read: WsRead, mut bus: EventBus<ChannelEvent>) -> EventBus<ChannelEvent> {
    let reason = loop {
        let Some(next) = read.next().await else {
            break "stream ended".to_owned();
        };
        let message = match next {
            Ok(message) => message,
            Err(err) => break format!("read failed: {err}"),
        };

        let decoded = match message {
            Message::Text(text) => FileUpdate::from_json(text.as_str()),
            Message::Binary(data) => FileUpdate::from_slice(&data),
            Message::Close(_) => break "closed by server".to_owned(),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        match decoded {
            Ok(update) => {
                debug!(id = %update.id, "file change received");
                bus.publish(ChannelEvent::FileChanged(update));
            }
            Err(err) => warn!("dropping undecodable push message: {}", err),
        }
    };

    info!(reason = %reason, "push channel closed");
    bus.publish(ChannelEvent::Closed { reason });
    bus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(origin: &str) -> Endpoints {
        Endpoints::from_origin(&Url::parse(origin).unwrap()).unwrap()
    }

    #[test]
    fn default_ports_are_omitted() {
        let http = endpoints("http://preview.local:80/index.html");
        assert_eq!(http.http_base().as_str(), "http://preview.local/");
        assert_eq!(http.push_url().as_str(), "ws://preview.local/connect");

        let https = endpoints("https://preview.local/");
        assert_eq!(https.http_base().as_str(), "https://preview.local/");
        assert_eq!(https.push_url().as_str(), "wss://preview.local/connect");
    }

    #[test]
    fn custom_port_is_kept_on_both_urls() {
        let e = endpoints("http://127.0.0.1:8080/");
        assert_eq!(e.http_base().as_str(), "http://127.0.0.1:8080/");
        assert_eq!(e.push_url().as_str(), "ws://127.0.0.1:8080/connect");
    }

    #[test]
    fn non_http_origin_is_rejected() {
        let err = Endpoints::from_origin(&Url::parse("file:///tmp/index.html").unwrap())
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedScheme(scheme) if scheme == "file"));
    }

    #[test]
    fn preview_url_prefers_view_path() {
        let gateway = Gateway::new(&Url::parse("http://localhost:9000").unwrap(), "test").unwrap();
        let mut record = FileRecord::from_update(FileUpdate {
            modified: Some(mailpreview_core::Timestamp::from_millis(1)),
            ..FileUpdate::new("abc")
        })
        .unwrap();
        assert_eq!(
            gateway.preview_url(&record).unwrap().as_str(),
            "http://localhost:9000/api/files/abc"
        );

        record.view_path = Some("/api/files/abc?merged=1".to_owned());
        assert_eq!(
            gateway.preview_url(&record).unwrap().as_str(),
            "http://localhost:9000/api/files/abc?merged=1"
        );
    }

    #[test]
    fn publish_status_uses_backend_names() {
        let status: PublishStatus = serde_json::from_str("\"NO_CHANGE\"").unwrap();
        assert_eq!(status, PublishStatus::NoChange);
    }
}
