//! QR code login.
//!
//! A login session is created on the secondary-device endpoint, shown to the
//! user as a QR code, and then long-polled until the primary device scans it
//! (and, without a stored certificate, confirms a PIN). The final call hands
//! out the tokens and, for E2EE logins, our encrypted key chain.

use std::sync::Arc;
use std::time::Duration;

use protocol::{Envelope, Field, StructValue, WireValue};

use crate::e2ee::E2eeLoginKeyChain;
use crate::error::{ClientError, Result};
use crate::transport::{RpcCaller, RpcRequest, ACCESS_HEADER};

pub const LOGIN_PATH: &str = "/acct/lgn/sq/v1";
pub const LOGIN_POLL_PATH: &str = "/acct/lp/lgn/sq/v1";

/// Server-side hold time of the verification long polls, in milliseconds.
const LONG_POLL_HOLD_MS: &str = "180000";

/// Tokens returned by a completed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch second after which the access token should be refreshed.
    pub expire: Option<i64>,
}

impl LoginTokens {
    fn from_struct(fields: &StructValue) -> Result<Self> {
        let access_token = fields
            .str(1)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::MalformedResponse("no access token in login response".into()))?
            .to_string();
        let expire = match (fields.i64(3), fields.i64(6)) {
            (Some(duration), Some(issued)) => Some(duration + issued),
            _ => None,
        };
        Ok(Self {
            access_token,
            refresh_token: fields.str(2).map(str::to_string),
            expire,
        })
    }
}

/// Reply of `qrCodeLoginV2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrLoginResult {
    /// Certificate that lets the next login skip the PIN step.
    pub certificate: Option<String>,
    pub tokens: LoginTokens,
    pub key_chain: Option<E2eeLoginKeyChain>,
}

impl QrLoginResult {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = value
            .as_struct()
            .ok_or_else(|| ClientError::MalformedResponse("login response is not a struct".into()))?;
        let tokens = fields
            .structure(3)
            .ok_or_else(|| ClientError::MalformedResponse("no token info in login response".into()))
            .and_then(LoginTokens::from_struct)?;
        Ok(Self {
            certificate: fields.str(1).filter(|c| !c.is_empty()).map(str::to_string),
            tokens,
            key_chain: E2eeLoginKeyChain::from_metadata(&fields.string_map(10)),
        })
    }
}

/// Device identity reported by `qrCodeLoginV2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginDevice {
    pub system_name: String,
    pub model_name: String,
    pub auto_login: bool,
}

pub struct LoginService {
    caller: Arc<dyn RpcCaller>,
    long_timeout: Duration,
}

impl LoginService {
    pub fn new(caller: Arc<dyn RpcCaller>, long_timeout: Duration) -> Self {
        Self { caller, long_timeout }
    }

    async fn call(&self, method: &str, envelope: Envelope) -> Result<WireValue> {
        self.caller.call(RpcRequest::new(method, LOGIN_PATH, envelope)).await
    }

    /// Long poll authenticated by the login session id itself.
    async fn poll(&self, method: &str, session_id: &str) -> Result<WireValue> {
        let request = RpcRequest::new(method, LOGIN_POLL_PATH, session_arg(session_id))
            .header("x-lst", LONG_POLL_HOLD_MS)
            .header(ACCESS_HEADER, session_id)
            .timeout(self.long_timeout);
        self.caller.call(request).await
    }

    /// Opens a login session; returns its id.
    pub async fn create_session(&self) -> Result<String> {
        let value = self.call("createSession", Envelope::new()).await?;
        required_str(&value, 1, "session id")
    }

    /// Returns the URL to show as a QR code.
    pub async fn create_qr_code(&self, session_id: &str) -> Result<String> {
        let value = self.call("createQrCode", session_arg(session_id)).await?;
        required_str(&value, 1, "QR code URL")
    }

    /// Waits until the QR code has been scanned.
    pub async fn check_qr_code_verified(&self, session_id: &str) -> Result<()> {
        self.poll("checkQrCodeVerified", session_id).await.map(drop)
    }

    /// Presents a certificate from an earlier login. Fails if the server
    /// wants a PIN instead.
    pub async fn verify_certificate(&self, session_id: &str, certificate: Option<&str>) -> Result<()> {
        let mut request = Envelope::new().with(Field::string(1, session_id));
        if let Some(certificate) = certificate {
            request.push(Field::string(2, certificate));
        }
        self.call("verifyCertificate", Envelope::new().with(Field::structure(1, request)))
            .await
            .map(drop)
    }

    /// Returns the PIN the user must enter on the primary device.
    pub async fn create_pin_code(&self, session_id: &str) -> Result<String> {
        let value = self.call("createPinCode", session_arg(session_id)).await?;
        required_str(&value, 1, "PIN code")
    }

    /// Waits until the PIN has been entered.
    pub async fn check_pin_code_verified(&self, session_id: &str) -> Result<()> {
        self.poll("checkPinCodeVerified", session_id).await.map(drop)
    }

    /// Completes the login.
    pub async fn qr_code_login_v2(&self, session_id: &str, device: &LoginDevice) -> Result<QrLoginResult> {
        let request = Envelope::new()
            .with(Field::string(1, session_id))
            .with(Field::string(2, device.system_name.as_str()))
            .with(Field::string(3, device.model_name.as_str()))
            .with(Field::bool(4, device.auto_login));
        let value = self
            .call("qrCodeLoginV2", Envelope::new().with(Field::structure(1, request)))
            .await?;
        QrLoginResult::from_wire(&value)
    }
}

fn session_arg(session_id: &str) -> Envelope {
    Envelope::new().with(Field::structure(1, Envelope::new().with(Field::string(1, session_id))))
}

fn required_str(value: &WireValue, id: i16, what: &str) -> Result<String> {
    value
        .as_struct()
        .and_then(|s| s.str(id))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ClientError::MalformedResponse(format!("no {} in login response", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_tokens_expire_is_sum() {
        let fields: StructValue = [
            (1, WireValue::String("access".into())),
            (2, WireValue::String("refresh".into())),
            (3, WireValue::I64(3_600)),
            (6, WireValue::I64(1_000)),
        ]
        .into_iter()
        .collect();
        let tokens = LoginTokens::from_struct(&fields).unwrap();
        assert_eq!(tokens.access_token, "access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(tokens.expire, Some(4_600));
    }

    #[test]
    fn test_login_result_requires_token_info() {
        let fields: StructValue = [(1, WireValue::String("cert".into()))].into_iter().collect();
        assert!(QrLoginResult::from_wire(&WireValue::Struct(fields)).is_err());

        let tokens: StructValue = [(2, WireValue::String("refresh".into()))].into_iter().collect();
        let fields: StructValue = [(3, WireValue::Struct(tokens))].into_iter().collect();
        assert!(QrLoginResult::from_wire(&WireValue::Struct(fields)).is_err());
    }
}
