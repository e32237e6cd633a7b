//! Access token refresh.

use std::sync::Arc;

use protocol::{Envelope, Field, WireValue};

use crate::error::{ClientError, Result};
use crate::session::Session;
use crate::transport::{RpcCaller, RpcRequest};

pub const REFRESH_PATH: &str = "/EXT/auth/tokenrefresh/v1";

/// A refreshed access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_issue_time: Option<i64>,
    pub duration_until_refresh: Option<i64>,
}

impl RefreshedToken {
    pub fn from_wire(value: &WireValue) -> Result<Self> {
        let fields = value
            .as_struct()
            .ok_or_else(|| ClientError::MalformedResponse("refresh response is not a struct".into()))?;
        let access_token = fields
            .str(1)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::MalformedResponse("no access token in refresh response".into()))?
            .to_string();
        Ok(Self {
            access_token,
            token_issue_time: fields.i64(4),
            duration_until_refresh: fields.i64(5),
        })
    }

    /// Epoch second after which the token should be refreshed.
    pub fn expire(&self) -> Option<i64> {
        Some(self.token_issue_time? + self.duration_until_refresh?)
    }
}

/// Builds the `refresh` call.
pub fn refresh_request(refresh_token: &str) -> RpcRequest {
    let envelope = Envelope::new().with(Field::structure(
        1,
        Envelope::new().with(Field::string(1, refresh_token)),
    ));
    RpcRequest::new("refresh", REFRESH_PATH, envelope)
}

/// Exchanges the stored refresh token for a new access token and installs it.
pub async fn refresh_access_token(caller: &dyn RpcCaller, session: &Session) -> Result<RefreshedToken> {
    let refresh_token = session
        .refresh_token()
        .await?
        .filter(|t| !t.is_empty())
        .ok_or(ClientError::RefreshTokenMissing)?;

    let response = caller.call(refresh_request(&refresh_token)).await?;
    let refreshed = RefreshedToken::from_wire(&response)?;

    session.set_auth_token(Some(refreshed.access_token.clone()));
    if let Some(expire) = refreshed.expire() {
        session.set_expire(expire).await?;
    }
    tracing::info!("Access token refreshed");
    Ok(refreshed)
}

/// Auth service wrapper.
pub struct AuthService {
    caller: Arc<dyn RpcCaller>,
    session: Arc<Session>,
}

impl AuthService {
    pub fn new(caller: Arc<dyn RpcCaller>, session: Arc<Session>) -> Self {
        Self { caller, session }
    }

    pub async fn try_refresh_token(&self) -> Result<RefreshedToken> {
        refresh_access_token(self.caller.as_ref(), &self.session).await
    }

    /// True if there is an access token, or a refresh token to get one.
    pub async fn has_valid_token(&self) -> Result<bool> {
        if self.session.is_logged_in() {
            return Ok(true);
        }
        Ok(self.session.refresh_token().await?.is_some())
    }
}
