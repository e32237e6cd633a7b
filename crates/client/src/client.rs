//! The client composition root.
//!
//! [`LineClient`] wires the transport, the service wrappers, the E2EE engine
//! and the listeners together at build time and owns their lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use protocol::WireValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::device::Device;
use crate::e2ee::{create_sqr_secret, e2ee_metadata, is_direct_chat, E2eeEngine, E2eePayload};
use crate::error::{ClientError, Result};
use crate::listener::watchdog::run_watchdog;
use crate::listener::{BackoffPolicy, ClientEvent, ListenerKind, ListenerTasks, Supervisor};
use crate::models::{OutgoingMessage, Profile, SquareMessage, TalkMessage, CONTENT_TYPE_LOCATION};
use crate::services::login::LoginDevice;
use crate::services::{AuthService, LoginService, SquareService, TalkService};
use crate::session::Session;
use crate::storage::{keys, CredentialStore, FileStore};
use crate::transport::{HttpTransport, RpcCaller, RpcRequest};

/// Service codes answered by retrying the send encrypted.
const E2EE_RETRY_CODES: [i32; 4] = [81, 82, 83, 84];

/// Service code answered by registering a new group key and retrying.
const RECREATE_GROUP_KEY_CODE: i32 = 99;

/// How long `close` waits for background tasks.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// System name reported by QR logins.
const LOGIN_SYSTEM_NAME: &str = "LineWire";

/// Something the user has to act on during a QR login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginPrompt {
    /// Show this URL as a QR code and scan it with the primary device.
    QrCode(String),
    /// Enter this PIN on the primary device.
    PinCode(String),
}

/// Builder for [`LineClient`].
pub struct LineClientBuilder {
    config: Config,
    store: Option<Arc<dyn CredentialStore>>,
    caller: Option<Arc<dyn RpcCaller>>,
}

impl LineClientBuilder {
    /// Uses `store` instead of the file store at `client.storage_path`.
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Routes every RPC through `caller` instead of HTTP.
    pub fn caller(mut self, caller: Arc<dyn RpcCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub async fn build(self) -> anyhow::Result<LineClient> {
        let config = self.config;
        config.validate().context("Invalid configuration")?;

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(
                FileStore::open(&config.client.storage_path)
                    .await
                    .with_context(|| format!("Failed to open {}", config.client.storage_path.display()))?,
            ),
        };
        let session = Arc::new(Session::new(store));

        let (transport, caller) = match self.caller {
            Some(caller) => (None, caller),
            None => {
                let device: Device = config.client.device.parse().map_err(anyhow::Error::msg)?;
                let transport = Arc::new(
                    HttpTransport::new(
                        &config.transport,
                        device,
                        config.client.app_version.as_deref(),
                        Arc::clone(&session),
                    )
                    .context("Failed to create transport")?,
                );
                let caller: Arc<dyn RpcCaller> = transport.clone();
                (Some(transport), caller)
            }
        };

        let long_timeout = config.transport.long_timeout();
        let talk = Arc::new(TalkService::new(Arc::clone(&caller), Arc::clone(&session), long_timeout));
        let square = Arc::new(SquareService::new(Arc::clone(&caller), Arc::clone(&session), long_timeout));
        let auth = AuthService::new(Arc::clone(&caller), Arc::clone(&session));
        let login = LoginService::new(Arc::clone(&caller), long_timeout);
        let e2ee = Arc::new(E2eeEngine::new(Arc::clone(&talk), Arc::clone(&session)));

        let (events_tx, events_rx) = mpsc::channel(config.listener.event_channel_capacity);
        let shutdown = CancellationToken::new();
        let tasks = ListenerTasks {
            talk: Arc::clone(&talk),
            square: Arc::clone(&square),
            e2ee: Arc::clone(&e2ee),
            session: Arc::clone(&session),
            events: events_tx,
            policy: BackoffPolicy::from_config(&config.listener),
            sync_limit: config.listener.sync_limit,
            fetch_limit: config.listener.fetch_limit,
        };
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(tasks),
            shutdown.clone(),
            config.listener.max_restarts,
        ));

        Ok(LineClient {
            config,
            session,
            transport,
            caller,
            talk,
            square,
            auth,
            login,
            e2ee,
            supervisor,
            shutdown,
            events: Mutex::new(Some(events_rx)),
            watchdog: tokio::sync::Mutex::new(None),
        })
    }
}

/// A logged-in (or logging-in) client.
pub struct LineClient {
    config: Config,
    session: Arc<Session>,
    transport: Option<Arc<HttpTransport>>,
    caller: Arc<dyn RpcCaller>,
    talk: Arc<TalkService>,
    square: Arc<SquareService>,
    auth: AuthService,
    login: LoginService,
    e2ee: Arc<E2eeEngine>,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
    events: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    watchdog: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LineClient {
    pub fn builder(config: Config) -> LineClientBuilder {
        LineClientBuilder {
            config,
            store: None,
            caller: None,
        }
    }

    /// Builds a client over HTTP with the given credential store.
    pub async fn new(config: Config, store: Arc<dyn CredentialStore>) -> anyhow::Result<Self> {
        Self::builder(config).store(store).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn talk(&self) -> &Arc<TalkService> {
        &self.talk
    }

    pub fn square(&self) -> &Arc<SquareService> {
        &self.square
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn e2ee(&self) -> &Arc<E2eeEngine> {
        &self.e2ee
    }

    /// Takes the event receiver. Only the first call gets it.
    pub fn events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Logs in with an existing access token and makes sure our E2EE key is
    /// registered.
    pub async fn login_with_token(&self, access_token: &str) -> Result<Profile> {
        self.session.set_auth_token(Some(access_token.to_string()));
        let profile = match self.talk.get_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                self.session.set_auth_token(None);
                return Err(e);
            }
        };
        self.session.set_mid(Some(profile.mid.clone()));
        tracing::info!("Logged in as {}", profile.display_name);

        if let Err(e) = self.e2ee.verify_and_sync().await {
            tracing::warn!("E2EE key check failed: {}", e);
        }
        Ok(profile)
    }

    /// Logs in by QR code.
    ///
    /// `prompt` is called with the QR code URL, and with a PIN when no stored
    /// certificate is accepted. On success the refresh token, expiry and
    /// certificate are stored, the E2EE key chain (if any) is unwrapped into
    /// the key store, and the client is logged in as by
    /// [`login_with_token`](Self::login_with_token).
    pub async fn login_with_qr<F>(&self, mut prompt: F) -> Result<Profile>
    where
        F: FnMut(LoginPrompt) + Send,
    {
        let session_id = self.login.create_session().await?;
        let url = self.login.create_qr_code(&session_id).await?;
        let (login_key, secret_query) = create_sqr_secret();
        prompt(LoginPrompt::QrCode(format!("{}{}", url, secret_query)));

        self.login.check_qr_code_verified(&session_id).await?;
        tracing::debug!("QR code scanned");

        let certificate = self.session.store().get(keys::QR_CERT).await?;
        if let Err(e) = self
            .login
            .verify_certificate(&session_id, certificate.as_deref())
            .await
        {
            tracing::debug!("Certificate not accepted, falling back to PIN: {}", e);
            let pin = self.login.create_pin_code(&session_id).await?;
            prompt(LoginPrompt::PinCode(pin));
            self.login.check_pin_code_verified(&session_id).await?;
        }

        let device = LoginDevice {
            system_name: LOGIN_SYSTEM_NAME.to_string(),
            model_name: self.config.client.device.clone(),
            auto_login: true,
        };
        let result = self.login.qr_code_login_v2(&session_id, &device).await?;

        let store = self.session.store();
        if let Some(certificate) = &result.certificate {
            store.set(keys::QR_CERT, certificate.clone()).await?;
        }
        if let Some(chain) = &result.key_chain {
            let record = self.e2ee.decode_key_chain(&login_key, chain).await?;
            tracing::info!("Stored E2EE key {} from login", record.key_id);
        }
        if let Some(refresh_token) = &result.tokens.refresh_token {
            self.session.set_refresh_token(refresh_token).await?;
        }
        if let Some(expire) = result.tokens.expire {
            self.session.set_expire(expire).await?;
        }

        self.login_with_token(&result.tokens.access_token).await
    }

    /// Logs back in with stored credentials: the current access token, or
    /// one obtained with the stored refresh token.
    pub async fn resume(&self) -> Result<Profile> {
        if !self.auth.has_valid_token().await? {
            return Err(ClientError::NotLoggedIn);
        }
        let access_token = match self.session.auth_token() {
            Some(token) => token,
            None => self.auth.try_refresh_token().await?.access_token,
        };
        self.login_with_token(&access_token).await
    }

    /// Performs an arbitrary RPC.
    pub async fn call(&self, request: RpcRequest) -> Result<WireValue> {
        self.caller.call(request).await
    }

    /// Sends a talk message, encrypting it when asked to or when the server
    /// insists.
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<TalkMessage> {
        let err = match self.send_once(&message).await {
            Ok(sent) => return Ok(sent),
            Err(err) => err,
        };

        match err.service_code() {
            Some(code) if E2EE_RETRY_CODES.contains(&code) && !message.e2ee => {
                tracing::debug!("Send to {} rejected with {}, retrying encrypted", message.to, code);
                self.send_once(&message.e2ee(true)).await
            }
            Some(RECREATE_GROUP_KEY_CODE) if !is_direct_chat(&message.to) => {
                tracing::debug!("Group key of {} rejected, registering a new one", message.to);
                self.e2ee.keys().delete_group_key(&message.to).await?;
                if let Err(register_err) = self.e2ee.register_group_key(&message.to).await {
                    tracing::warn!("Group key registration for {} failed: {}", message.to, register_err);
                    return Err(err);
                }
                self.send_once(&message.e2ee(true)).await
            }
            _ => Err(err),
        }
    }

    async fn send_once(&self, message: &OutgoingMessage) -> Result<TalkMessage> {
        if !message.e2ee {
            return self.talk.send_message(message, None).await;
        }

        let (payload, content_type) = match &message.location {
            Some(location) => (E2eePayload::Location(location.clone()), CONTENT_TYPE_LOCATION),
            None => (
                E2eePayload::Text(message.text.clone().unwrap_or_default()),
                message.content_type,
            ),
        };
        let chunks = self.e2ee.encrypt(&message.to, &payload, content_type).await?;

        let mut encrypted = message.clone();
        encrypted.content_type = content_type;
        encrypted.content_metadata.extend(e2ee_metadata(content_type));
        self.talk.send_message(&encrypted, Some(&chunks)).await
    }

    /// Sends a message to a square chat.
    pub async fn send_square_message(&self, message: OutgoingMessage) -> Result<SquareMessage> {
        self.square.send_message(&message).await
    }

    /// Starts the given listeners and the watchdog.
    pub async fn start_listening(&self, kinds: &[ListenerKind]) -> Result<()> {
        if !self.session.is_logged_in() {
            return Err(ClientError::NotLoggedIn);
        }
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        for kind in kinds {
            self.supervisor.start(*kind).await;
        }

        let mut watchdog = self.watchdog.lock().await;
        if watchdog.as_ref().is_none_or(JoinHandle::is_finished) {
            *watchdog = Some(tokio::spawn(run_watchdog(
                Arc::clone(&self.supervisor),
                Arc::clone(&self.session),
                Duration::from_millis(self.config.listener.watchdog_interval_ms),
                self.shutdown.clone(),
            )));
        }
        Ok(())
    }

    /// Starts the listeners enabled in the configuration.
    pub async fn start_configured_listeners(&self) -> Result<()> {
        let kinds: Vec<ListenerKind> = ListenerKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ListenerKind::Talk => self.config.listener.talk,
                ListenerKind::Square => self.config.listener.square,
            })
            .collect();
        self.start_listening(&kinds).await
    }

    /// Stops one listener and waits for it to finish.
    pub async fn stop_listening(&self, kind: ListenerKind) {
        if let Some(handle) = self.supervisor.stop(kind).await {
            if tokio::time::timeout(CLOSE_GRACE_PERIOD, handle).await.is_err() {
                tracing::warn!("{} listener did not stop within {:?}", kind, CLOSE_GRACE_PERIOD);
            }
        }
    }

    pub async fn is_listening(&self, kind: ListenerKind) -> bool {
        self.supervisor.is_running(kind).await
    }

    /// Stops every background task, logs out and closes the HTTP client.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let mut handles = self.supervisor.stop_all().await;
        if let Some(watchdog) = self.watchdog.lock().await.take() {
            handles.push(watchdog);
        }
        let count = handles.len();
        if tokio::time::timeout(CLOSE_GRACE_PERIOD, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Background tasks did not stop within {:?}", CLOSE_GRACE_PERIOD);
        } else {
            tracing::debug!("Stopped {} background tasks", count);
        }

        self.session.set_auth_token(None);
        if let Some(transport) = &self.transport {
            transport.close();
        }
        tracing::info!("Client closed");
    }
}
