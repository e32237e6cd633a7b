//! HTTP RPC transport.
//!
//! Every RPC is an HTTPS POST carrying one encoded call message. The reply
//! struct has a success slot (field 0) and an error slot (field 1). The
//! transport raises the error slot as a typed [`ServiceError`], rotates the
//! access token when the server hands out a new one, and performs exactly
//! one token refresh plus retry when the server says the token must be
//! refreshed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{Envelope, ProtocolKind, StructValue, WireValue};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::TransportConfig;
use crate::device::Device;
use crate::error::{ClientError, Result, ServiceError, ServiceErrorKind};
use crate::services::auth;
use crate::session::Session;

/// Error code meaning "refresh the access token".
pub const MUST_REFRESH_CODE: i32 = 119;

/// Error code text meaning "refresh the access token".
pub const MUST_REFRESH_TEXT: &str = "MUST_REFRESH_V3_TOKEN";

/// Response header carrying a rotated access token.
pub const NEXT_ACCESS_HEADER: &str = "x-line-next-access";

/// Request header carrying the access token.
pub const ACCESS_HEADER: &str = "x-line-access";

const THRIFT_CONTENT_TYPE: &str = "application/x-thrift";

/// One RPC call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub method: String,
    pub path: String,
    pub envelope: Envelope,
    pub protocol: ProtocolKind,
    /// Extra headers; these override the defaults.
    pub headers: Vec<(String, String)>,
    /// Per-call timeout; the transport default applies when unset.
    pub timeout: Option<Duration>,
}

impl RpcRequest {
    /// A Compact-protocol call with no extra headers.
    pub fn new(method: impl Into<String>, path: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            envelope,
            protocol: ProtocolKind::Compact,
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Something that can perform RPC calls.
///
/// The service wrappers, E2EE engine and listeners are written against this
/// trait so they can run over the HTTP transport or a test double.
pub trait RpcCaller: Send + Sync {
    /// Performs the call and returns the success slot, or the whole reply
    /// struct when there is no success slot.
    fn call(&self, request: RpcRequest) -> BoxFuture<'_, Result<WireValue>>;
}

/// Splits a decoded reply into its success value or service error.
pub fn interpret_reply(path: &str, mut fields: StructValue) -> Result<WireValue> {
    if let Some(error) = fields.remove(1) {
        let detail = match error {
            WireValue::Struct(detail) => detail,
            other => [(1, other)].into_iter().collect(),
        };
        return Err(ClientError::Service(ServiceError::from_struct(
            ServiceErrorKind::from_path(path),
            detail,
        )));
    }
    match fields.remove(0) {
        Some(value) => Ok(value),
        None => Ok(WireValue::Struct(fields)),
    }
}

/// RPC transport over HTTP(S).
pub struct HttpTransport {
    http: Mutex<Option<reqwest::Client>>,
    base_url: String,
    host: String,
    default_timeout: Duration,
    application: String,
    user_agent: String,
    session: Arc<Session>,
}

impl HttpTransport {
    pub fn new(
        config: &TransportConfig,
        device: Device,
        app_version: Option<&str>,
        session: Arc<Session>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| ClientError::TransportConnection(format!("failed to build HTTP client: {}", e)))?;
        let app_version = app_version.unwrap_or(device.details().app_version);

        Ok(Self {
            http: Mutex::new(Some(http)),
            base_url: format!("{}://{}", config.scheme, config.endpoint),
            host: config.endpoint.clone(),
            default_timeout: config.timeout(),
            application: device.application_header(app_version),
            user_agent: device.user_agent(app_version),
            session,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Drops the HTTP client. Later calls fail with `Cancelled`.
    pub fn close(&self) {
        if let Ok(mut http) = self.http.lock() {
            if http.take().is_some() {
                tracing::debug!("HTTP client closed");
            }
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.http
            .lock()
            .ok()
            .and_then(|http| http.clone())
            .ok_or(ClientError::Cancelled)
    }

    /// Standard request headers plus the caller's overrides.
    pub fn build_headers(&self, extra: &[(String, String)]) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut put = |name: &str, value: &str| -> Result<()> {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::MalformedResponse(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::MalformedResponse(format!("invalid header value for {}: {}", name, e)))?;
            headers.insert(name, value);
            Ok(())
        };

        put("host", &self.host)?;
        put("accept", THRIFT_CONTENT_TYPE)?;
        put("user-agent", &self.user_agent)?;
        put("x-line-application", &self.application)?;
        put("content-type", THRIFT_CONTENT_TYPE)?;
        put("x-lal", "ja_JP")?;
        put("x-lpv", "1")?;
        put("x-lhm", "POST")?;
        put("accept-encoding", "gzip")?;
        if let Some(token) = self.session.auth_token() {
            put(ACCESS_HEADER, &token)?;
        }
        for (name, value) in extra {
            put(name, value)?;
        }
        Ok(headers)
    }

    /// Performs one HTTP exchange without any refresh handling.
    async fn send(&self, request: &RpcRequest) -> Result<WireValue> {
        let body = protocol::encode(&request.envelope, &request.method, request.protocol)?;
        let headers = self.build_headers(&request.headers)?;
        let url = format!("{}{}", self.base_url, request.path);
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        tracing::debug!("RPC {} -> {} ({} bytes)", request.method, request.path, body.len());

        let response = self
            .client()?
            .post(&url)
            .headers(headers)
            .timeout(timeout)
            .body(body)
            .send()
            .await?;

        if let Some(next) = response
            .headers()
            .get(NEXT_ACCESS_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            tracing::info!("Access token rotated by server");
            self.session.set_auth_token(Some(next.to_string()));
        }

        let status = response.status();
        let bytes = response.bytes().await?;

        if bytes.is_empty() {
            if !status.is_success() {
                return Err(ClientError::HttpStatus {
                    status: status.as_u16(),
                    body: String::new(),
                });
            }
            return Ok(WireValue::Struct(StructValue::new()));
        }

        let parsed = match protocol::decode(&bytes, request.protocol) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(ClientError::HttpStatus {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).chars().take(256).collect(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        interpret_reply(&request.path, parsed.fields)
    }

    /// Performs the call, refreshing the token and retrying once if the
    /// server demands it.
    pub async fn call_with_refresh(&self, request: RpcRequest) -> Result<WireValue> {
        match self.send(&request).await {
            Err(err) if err.is_refresh_required() => {
                tracing::info!("Access token expired during {}, refreshing", request.method);
                match auth::refresh_access_token(&NoRefresh(self), &self.session).await {
                    Ok(_) => self.send(&request).await,
                    Err(refresh_err) => {
                        tracing::warn!("Token refresh failed: {}", refresh_err);
                        Err(err)
                    }
                }
            }
            other => other,
        }
    }
}

impl RpcCaller for HttpTransport {
    fn call(&self, request: RpcRequest) -> BoxFuture<'_, Result<WireValue>> {
        Box::pin(self.call_with_refresh(request))
    }
}

/// Transport view that never refreshes, used for the refresh call itself.
struct NoRefresh<'a>(&'a HttpTransport);

impl RpcCaller for NoRefresh<'_> {
    fn call(&self, request: RpcRequest) -> BoxFuture<'_, Result<WireValue>> {
        Box::pin(async move { self.0.send(&request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use protocol::Field;

    fn transport() -> HttpTransport {
        let session = Arc::new(Session::new(Arc::new(MemoryStore::new())));
        HttpTransport::new(&TransportConfig::default(), Device::DesktopWin, None, session).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = RpcRequest::new("sync", "/SYNC4", Envelope::new().with(Field::i32(1, 1)))
            .protocol(ProtocolKind::Binary)
            .header("x-extra", "1")
            .timeout(Duration::from_secs(5));
        assert_eq!(request.protocol, ProtocolKind::Binary);
        assert_eq!(request.headers, vec![("x-extra".to_string(), "1".to_string())]);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_default_headers() {
        let transport = transport();
        let headers = transport.build_headers(&[]).unwrap();
        assert_eq!(headers["host"], "legy.line-apps.com");
        assert_eq!(headers["accept"], "application/x-thrift");
        assert_eq!(headers["content-type"], "application/x-thrift");
        assert_eq!(headers["user-agent"], "Line/9.2.0.3403");
        assert_eq!(
            headers["x-line-application"],
            "DESKTOPWIN\t9.2.0.3403\tWINDOWS\t10.0.0-NT-x64"
        );
        assert_eq!(headers["x-lal"], "ja_JP");
        assert_eq!(headers["x-lpv"], "1");
        assert_eq!(headers["x-lhm"], "POST");
        assert_eq!(headers["accept-encoding"], "gzip");
        assert!(headers.get(ACCESS_HEADER).is_none());
    }

    #[test]
    fn test_headers_with_token_and_override() {
        let transport = transport();
        transport.session().set_auth_token(Some("tok".into()));
        let headers = transport
            .build_headers(&[("x-lal".to_string(), "en_US".to_string())])
            .unwrap();
        assert_eq!(headers[ACCESS_HEADER], "tok");
        assert_eq!(headers["x-lal"], "en_US");
    }

    #[test]
    fn test_interpret_success_slot() {
        let fields: StructValue = [(0, WireValue::I32(7))].into_iter().collect();
        assert_eq!(interpret_reply("/S4", fields).unwrap(), WireValue::I32(7));
    }

    #[test]
    fn test_interpret_without_slots_returns_struct() {
        let fields: StructValue = [(3, WireValue::I32(7))].into_iter().collect();
        let value = interpret_reply("/S4", fields.clone()).unwrap();
        assert_eq!(value, WireValue::Struct(fields));
    }

    #[test]
    fn test_interpret_error_slot() {
        let detail: StructValue = [
            (1, WireValue::I32(5)),
            (2, WireValue::String("nope".into())),
        ]
        .into_iter()
        .collect();
        let fields: StructValue = [(1, WireValue::Struct(detail))].into_iter().collect();

        let err = interpret_reply("/SQ1", fields).unwrap_err();
        let service = err.as_service().unwrap();
        assert_eq!(service.kind, ServiceErrorKind::Square);
        assert_eq!(service.code, Some(5));
        assert_eq!(service.message, "nope");
    }

    #[tokio::test]
    async fn test_closed_transport_is_cancelled() {
        let transport = transport();
        transport.close();
        let err = transport
            .call(RpcRequest::new("getProfile", "/S4", Envelope::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
