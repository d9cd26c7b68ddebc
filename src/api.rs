// API client module: wire types for the storage service, the two seams the
// coordinators talk through (`AuthApi`, `UploadApi`), and `HttpApi`, the
// reqwest + WebSocket implementation used by the CLI. Tests swap in fakes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{ApiError, ClientError};
use crate::retry::{classify_status, Disposition};
use crate::session::{Session, SessionProbe};

/// Nominal lifetime of a QR challenge.
pub const QR_LIFETIME: Duration = Duration::from_secs(60);

/// Nominal access-token lifetime when the server omits `expiresIn`.
pub const ACCESS_TOKEN_LIFETIME_SECS: i64 = 1800;

// ---------------------------------------------------------------------------
// Authentication wire types
// ---------------------------------------------------------------------------

/// QR challenge as returned by the issuing endpoint.
#[derive(Deserialize, Debug)]
struct ChallengeResponse {
    uuid: String,
    sig: String,
    ts: i64,
}

/// Short-lived identifier/signature pair the user scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrChallenge {
    pub uuid: String,
    pub signature: String,
    /// Server timestamp the signature was computed over.
    pub ts: i64,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl QrChallenge {
    pub fn new(uuid: impl Into<String>, signature: impl Into<String>, ts: i64) -> Self {
        let issued_at = Instant::now();
        QrChallenge {
            uuid: uuid.into(),
            signature: signature.into(),
            ts,
            issued_at,
            expires_at: issued_at + QR_LIFETIME,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.uuid.trim().is_empty() && !self.signature.trim().is_empty()
    }
}

/// Event delivered on the QR event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    Scanned,
    /// The user approved the login; carries the authorization code.
    Confirmed { code: String },
    Expired,
}

pub type QrEventStream = BoxStream<'static, Result<QrEvent, ClientError>>;

#[derive(Deserialize, Debug)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<WirePayload>,
}

#[derive(Deserialize, Debug, Default)]
struct WirePayload {
    #[serde(default)]
    code: Option<String>,
}

/// Decode one text frame. Unknown event types yield `None`.
pub fn parse_event(text: &str) -> Option<Result<QrEvent, ClientError>> {
    let event: WireEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            return Some(Err(ClientError::Api(ApiError::protocol_mismatch(format!(
                "undecodable event frame: {}",
                e
            )))))
        }
    };
    match event.kind.to_ascii_uppercase().as_str() {
        "SCANNED" => Some(Ok(QrEvent::Scanned)),
        "EXPIRED" => Some(Ok(QrEvent::Expired)),
        "LOGIN" => match event.payload.and_then(|p| p.code).filter(|c| !c.is_empty()) {
            Some(code) => Some(Ok(QrEvent::Confirmed { code })),
            None => Some(Err(ClientError::Api(ApiError::protocol_mismatch(
                "LOGIN event without authorization code",
            )))),
        },
        other => {
            trace!(kind = other, "ignoring unknown event");
            None
        }
    }
}

/// Result of exchanging an authorization code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub user_token: String,
    #[serde(default)]
    pub username: String,
}

/// Personal space and the access token scoped to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub library_id: String,
    pub space_id: String,
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

fn default_expires_in() -> i64 {
    ACCESS_TOKEN_LIFETIME_SECS
}

// ---------------------------------------------------------------------------
// Upload wire types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PartHeaders {
    pub headers: HashMap<String, String>,
}

/// Server side of one multipart upload, as returned by initiate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub confirm_key: String,
    pub domain: String,
    pub path: String,
    pub upload_id: String,
    /// Part number → signed headers to send verbatim.
    #[serde(default)]
    pub parts: BTreeMap<u32, PartHeaders>,
    #[serde(rename = "expiration", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Metadata of the confirmed file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub crc64: Option<String>,
    #[serde(default)]
    pub modification_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest {
    part_number_range: Vec<u32>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Calls the authentication handshake needs.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn issue_challenge(&self) -> Result<QrChallenge, ClientError>;

    /// Open the event stream bound to `challenge`.
    async fn subscribe(&self, challenge: &QrChallenge) -> Result<QrEventStream, ClientError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ClientError>;

    async fn personal_space(&self, user_token: &str) -> Result<SpaceInfo, ClientError>;

    /// URL encoded into the QR code shown to the user.
    fn qr_url(&self, challenge: &QrChallenge) -> String;

    /// Cookie collected during the handshake, if any.
    fn auth_cookie(&self) -> Option<String>;
}

/// Calls the multipart upload pipeline needs.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn initiate(
        &self,
        session: &Session,
        remote_path: &str,
        part_count: u32,
    ) -> Result<UploadSession, ClientError>;

    /// PUT one part using exactly the server-issued headers.
    async fn put_part(
        &self,
        upload: &UploadSession,
        part_number: u32,
        headers: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<(), ClientError>;

    async fn confirm(&self, session: &Session, confirm_key: &str) -> Result<FileMetadata, ClientError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest client plus the cookie jar that collects the handshake cookie.
#[derive(Clone)]
pub struct HttpApi {
    client: Client,
    jar: Arc<Jar>,
    config: Arc<Config>,
}

impl HttpApi {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpApi {
            client,
            jar,
            config: Arc::new(config.clone()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }

    fn file_url(&self, session: &Session, tail: &str) -> String {
        self.api(&format!(
            "/api/v1/file/{}/{}/{}",
            urlencoding::encode(&session.library_id),
            urlencoding::encode(&session.space_id),
            tail
        ))
    }

    /// Turn a non-success response into an `ApiError` built from its body.
    async fn check(res: Response) -> Result<Response, ClientError> {
        let status = res.status();
        if classify_status(status.as_u16()) == Disposition::Success {
            return Ok(res);
        }
        let header_id = res
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = res.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        Err(ClientError::Api(ApiError {
            status: Some(status.as_u16()),
            code: body
                .code
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("HttpError").to_string()),
            message: body.message.unwrap_or(text),
            request_id: body.request_id.or(header_id),
        }))
    }

    async fn json<T: serde::de::DeserializeOwned>(res: Response) -> Result<T, ClientError> {
        let res = Self::check(res).await?;
        let text = res.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ClientError::Api(ApiError::protocol_mismatch(format!(
                "unexpected response body: {}",
                e
            )))
        })
    }
}

/// Percent-encode each segment of a remote path, dropping the leading `/`.
pub fn encode_remote_path(remote_path: &str) -> String {
    remote_path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn to_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, ClientError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ClientError::Api(ApiError::protocol_mismatch(format!("bad header name {:?}", name)))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            ClientError::Api(ApiError::protocol_mismatch(format!(
                "bad value for header {}",
                name
            )))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn issue_challenge(&self) -> Result<QrChallenge, ClientError> {
        let url = format!("{}/qrcode/issue", self.config.auth_url);
        let res = self.client.get(&url).send().await?;
        let body: ChallengeResponse = Self::json(res).await?;
        debug!(uuid = %body.uuid, "QR challenge issued");
        Ok(QrChallenge::new(body.uuid, body.sig, body.ts))
    }

    async fn subscribe(&self, challenge: &QrChallenge) -> Result<QrEventStream, ClientError> {
        let url = format!(
            "{}/{}",
            self.config.ws_url,
            urlencoding::encode(&challenge.uuid)
        );
        let (ws, _response) = connect_async(url.as_str()).await?;
        debug!(uuid = %challenge.uuid, "event stream connected");

        let events = ws.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => parse_event(&text),
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::from(e))),
            }
        });
        Ok(events.boxed())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ClientError> {
        let url = self.api("/user/v1/sign-in/verify-account-login/jaccount");
        let res = self.client.post(&url).query(&[("code", code)]).send().await?;
        Self::json(res).await
    }

    async fn personal_space(&self, user_token: &str) -> Result<SpaceInfo, ClientError> {
        let url = self.api("/user/v1/space/1/personal");
        let res = self
            .client
            .post(&url)
            .query(&[("user_token", user_token)])
            .send()
            .await?;
        Self::json(res).await
    }

    fn qr_url(&self, challenge: &QrChallenge) -> String {
        format!(
            "{}/confirmscancode?uuid={}&ts={}&sig={}",
            self.config.auth_url,
            urlencoding::encode(&challenge.uuid),
            challenge.ts,
            urlencoding::encode(&challenge.signature)
        )
    }

    fn auth_cookie(&self) -> Option<String> {
        let url = Url::parse(&self.config.auth_url).ok()?;
        let value = self.jar.cookies(&url)?;
        value.to_str().ok().map(str::to_string)
    }
}

#[async_trait]
impl UploadApi for HttpApi {
    async fn initiate(
        &self,
        session: &Session,
        remote_path: &str,
        part_count: u32,
    ) -> Result<UploadSession, ClientError> {
        let url = self.file_url(session, &encode_remote_path(remote_path));
        let body = InitiateRequest {
            part_number_range: (1..=part_count).collect(),
        };
        let res = self
            .client
            .post(&url)
            .query(&[
                ("multipart", "null"),
                ("conflict_resolution_strategy", "rename"),
                ("access_token", session.access_token.as_str()),
            ])
            .json(&body)
            .send()
            .await?;
        Self::json(res).await
    }

    async fn put_part(
        &self,
        upload: &UploadSession,
        part_number: u32,
        headers: &HashMap<String, String>,
        body: Bytes,
    ) -> Result<(), ClientError> {
        let url = format!("{}://{}{}", self.config.part_scheme, upload.domain, upload.path);
        let part = part_number.to_string();
        let res = self
            .client
            .put(&url)
            .query(&[("uploadId", upload.upload_id.as_str()), ("partNumber", part.as_str())])
            .headers(to_header_map(headers)?)
            .body(body)
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    async fn confirm(&self, session: &Session, confirm_key: &str) -> Result<FileMetadata, ClientError> {
        let url = self.file_url(session, &urlencoding::encode(confirm_key));
        let res = self
            .client
            .post(&url)
            .query(&[
                ("confirm", "null"),
                ("conflict_resolution_strategy", "rename"),
                ("access_token", session.access_token.as_str()),
            ])
            .send()
            .await?;
        Self::json(res).await
    }
}

#[async_trait]
impl SessionProbe for HttpApi {
    async fn probe(&self, session: &Session) -> Result<(), ClientError> {
        let url = self.api(&format!(
            "/api/v1/directory/{}/{}/",
            urlencoding::encode(&session.library_id),
            urlencoding::encode(&session.space_id)
        ));
        let res = self
            .client
            .get(&url)
            .query(&[
                ("access_token", session.access_token.as_str()),
                ("page", "1"),
                ("page_size", "1"),
            ])
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }
}
