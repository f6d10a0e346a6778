//! The message router: validates and authorizes every inbound frame,
//! applies it to the owning component, and broadcasts the results.
//!
//! Session-scoped frames are funneled through one worker task per session,
//! so apply-then-broadcast is serialized per session (including the await
//! on TTS resolution) while distinct sessions run in parallel. Workers
//! never hold a lock across I/O; they snapshot, release, then persist.

use crate::config::Config;
use crate::cost::{BillableService, CostTracker, CostWarningEvent};
use crate::error::ServerError;
use crate::fanout::FanoutIndex;
use crate::identity::IdentityValidator;
use crate::identity_store::AdminIdentityStore;
use crate::registry::{Session, SessionRegistry};
use crate::token_cache::TokenCache;
use crate::tts::{TtsOutcome, TtsPipeline};
use chrono::Utc;
use dashmap::DashMap;
use shared::{
    AudioCapabilities, AuthMethod, ClientMessage, LanguageCode, ServerMessage, SessionConfig,
    SessionStatus,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{ConnectionId, ConnectionTable};

/// How often a translation-only activity bump is flushed to disk.
const ACTIVITY_PERSIST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

const SHUTDOWN_RECONNECT_DELAY_MS: u64 = 5000;

enum SessionJob {
    Translation {
        conn: ConnectionId,
        admin_id: String,
        language: LanguageCode,
        text: String,
        timestamp: i64,
    },
    UpdateConfig {
        conn: ConnectionId,
        admin_id: String,
        config: SessionConfig,
    },
    Pause {
        conn: ConnectionId,
        admin_id: String,
    },
    Resume {
        conn: ConnectionId,
        admin_id: String,
    },
    End {
        conn: ConnectionId,
        admin_id: String,
    },
    Join {
        conn: ConnectionId,
        language: LanguageCode,
        capabilities: AudioCapabilities,
    },
    ChangeLanguage {
        conn: ConnectionId,
        new_language: LanguageCode,
    },
    Leave {
        conn: ConnectionId,
    },
    AdminAttached {
        conn: ConnectionId,
    },
    AdminDisconnected {
        conn: ConnectionId,
    },
    ListenerDisconnected {
        conn: ConnectionId,
    },
}

pub struct RouterInner {
    config: Arc<Config>,
    validator: Arc<dyn IdentityValidator>,
    identities: Arc<AdminIdentityStore>,
    tokens: Arc<TokenCache>,
    registry: Arc<SessionRegistry>,
    fanout: Arc<FanoutIndex>,
    tts: Arc<TtsPipeline>,
    connections: Arc<ConnectionTable>,
    workers: DashMap<String, mpsc::UnboundedSender<SessionJob>>,
}

impl RouterInner {
    fn send_err(&self, conn: &ConnectionId, err: &ServerError) {
        self.connections.send(conn, &err.to_frame());
    }
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        validator: Arc<dyn IdentityValidator>,
        identities: Arc<AdminIdentityStore>,
        tokens: Arc<TokenCache>,
        registry: Arc<SessionRegistry>,
        fanout: Arc<FanoutIndex>,
        tts: Arc<TtsPipeline>,
        connections: Arc<ConnectionTable>,
    ) -> Self {
        let router = Self {
            inner: Arc::new(RouterInner {
                config,
                validator,
                identities,
                tokens,
                registry,
                fanout,
                tts,
                connections,
                workers: DashMap::new(),
            }),
        };
        router.spawn_rehydrated_workers();
        router
    }

    /// Sessions recovered from disk need their workers back before clients
    /// rejoin.
    fn spawn_rehydrated_workers(&self) {
        for session_id in self.inner.registry.session_ids() {
            if let Some(session) = self.inner.registry.get(&session_id) {
                self.spawn_worker(session_id, session);
            }
        }
    }

    fn spawn_worker(&self, session_id: String, session: Arc<Mutex<Session>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.workers.insert(session_id.clone(), tx);
        self.inner.fanout.ensure_session(&session_id);
        let worker = SessionWorker {
            ctx: self.inner.clone(),
            session_id,
            session,
            cost: CostTracker::new(
                self.inner.config.prices,
                self.inner.config.cost_alarm_threshold,
                self.inner.config.cost_alarm_cooldown,
            ),
            last_activity_persist: Instant::now(),
        };
        tokio::spawn(worker.run(rx));
    }

    /// Handles an `admin-auth` frame. Returns true when the connection is
    /// authenticated afterwards; on false the caller closes the socket.
    pub async fn authenticate_admin(&self, conn: ConnectionId, frame: ClientMessage) -> bool {
        let ClientMessage::AdminAuth {
            method,
            username,
            password,
            access_token,
            refresh_token,
        } = frame
        else {
            self.inner.send_err(
                &conn,
                &ServerError::MalformedFrame("expected admin-auth".to_string()),
            );
            return false;
        };

        let result = match method {
            AuthMethod::Credentials => match (username, password) {
                (Some(username), Some(password)) => {
                    self.inner
                        .validator
                        .authenticate_credentials(&username, &password)
                        .await
                }
                (None, _) => Err(ServerError::MissingField("username")),
                (_, None) => Err(ServerError::MissingField("password")),
            },
            AuthMethod::Token => match access_token {
                Some(token) => match self.inner.validator.authenticate_token(&token).await {
                    // Expired access token with a refresh token in hand:
                    // exchange it instead of failing the connection.
                    Err(ServerError::TokenExpired) if refresh_token.is_some() => {
                        self.inner
                            .validator
                            .refresh(refresh_token.as_deref().unwrap_or_default())
                            .await
                    }
                    other => other,
                },
                None => match refresh_token {
                    Some(token) => self.inner.validator.refresh(&token).await,
                    None => Err(ServerError::MissingField("accessToken")),
                },
            },
        };

        let identity = match result {
            Ok(identity) => identity,
            Err(err) => {
                warn!("admin auth failed on {}: {}", conn, err);
                // Provider outage during token validation closes the
                // connection with a session-expired notice.
                if matches!(err, ServerError::IdentityProviderUnavailable(_))
                    && method == AuthMethod::Token
                {
                    self.inner.connections.send(
                        &conn,
                        &ServerMessage::SessionExpired {
                            reason: "identity provider unavailable".to_string(),
                        },
                    );
                } else {
                    self.inner.connections.send(
                        &conn,
                        &ServerMessage::AdminAuthResponse {
                            success: false,
                            admin_id: None,
                            display_name: None,
                            access_token: None,
                            refresh_token: None,
                            expires_in: None,
                            owned_sessions: Vec::new(),
                            error: Some(err.code()),
                        },
                    );
                }
                return false;
            }
        };

        let record = match self
            .inner
            .identities
            .upsert_authenticated(&identity.admin_id, &identity.display_name, &identity.email)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                error!("failed to persist admin identity: {}", err);
                self.inner.connections.send(
                    &conn,
                    &ServerMessage::AdminAuthResponse {
                        success: false,
                        admin_id: None,
                        display_name: None,
                        access_token: None,
                        refresh_token: None,
                        expires_in: None,
                        owned_sessions: Vec::new(),
                        error: Some(err.code()),
                    },
                );
                return false;
            }
        };

        self.inner.tokens.insert(
            conn,
            identity.access_token.clone(),
            identity.admin_id.clone(),
            identity.expires_at,
        );
        self.inner.connections.bind_admin(&conn, &identity.admin_id);

        let owned_sessions: Vec<String> = record.owned_sessions.iter().cloned().collect();
        info!(
            "admin {} authenticated on {} ({} owned sessions)",
            identity.admin_id,
            conn,
            owned_sessions.len()
        );
        // The response goes onto the queue before any reattach status
        // updates so the client always sees it first.
        self.inner.connections.send(
            &conn,
            &ServerMessage::AdminAuthResponse {
                success: true,
                admin_id: Some(identity.admin_id),
                display_name: Some(identity.display_name),
                access_token: Some(identity.access_token),
                refresh_token: identity.refresh_token,
                expires_in: Some((identity.expires_at - Utc::now()).num_seconds()),
                owned_sessions: owned_sessions.clone(),
                error: None,
            },
        );

        // Reconnection reconciliation: the newest connection becomes the
        // current admin connection of every owned live session.
        for session_id in &owned_sessions {
            if let Some(worker) = self.inner.workers.get(session_id) {
                let _ = worker.send(SessionJob::AdminAttached { conn });
            }
        }
        true
    }

    pub async fn handle_admin_frame(&self, conn: ConnectionId, frame: ClientMessage) {
        match frame {
            auth @ ClientMessage::AdminAuth { .. } => {
                // Re-authentication (token refresh) over a live connection.
                self.authenticate_admin(conn, auth).await;
            }
            ClientMessage::StartSession { session_id, config } => {
                self.start_session(conn, session_id, config).await;
            }
            ClientMessage::PauseSession { session_id } => {
                self.dispatch_admin(conn, &session_id, |admin_id| SessionJob::Pause {
                    conn,
                    admin_id,
                });
            }
            ClientMessage::ResumeSession { session_id } => {
                self.dispatch_admin(conn, &session_id, |admin_id| SessionJob::Resume {
                    conn,
                    admin_id,
                });
            }
            ClientMessage::EndSession { session_id } => {
                self.dispatch_admin(conn, &session_id, |admin_id| SessionJob::End {
                    conn,
                    admin_id,
                });
            }
            ClientMessage::UpdateSessionConfig { session_id, config } => {
                self.dispatch_admin(conn, &session_id, |admin_id| SessionJob::UpdateConfig {
                    conn,
                    admin_id,
                    config,
                });
            }
            ClientMessage::Translation {
                session_id,
                language,
                text,
                timestamp,
                sequence_number: _,
            } => {
                if text.is_empty() {
                    self.inner.send_err(&conn, &ServerError::MissingField("text"));
                    return;
                }
                self.dispatch_admin(conn, &session_id, |admin_id| SessionJob::Translation {
                    conn,
                    admin_id,
                    language,
                    text,
                    timestamp,
                });
            }
            ClientMessage::JoinSession { .. }
            | ClientMessage::ChangeLanguage { .. }
            | ClientMessage::LeaveSession { .. } => {
                self.inner.send_err(
                    &conn,
                    &ServerError::InsufficientPermission(
                        "listener frame on an admin connection".to_string(),
                    ),
                );
            }
        }
    }

    fn dispatch_admin(
        &self,
        conn: ConnectionId,
        session_id: &str,
        job: impl FnOnce(String) -> SessionJob,
    ) {
        let Some(admin_id) = self.inner.connections.admin_id_of(&conn) else {
            self.inner.send_err(&conn, &ServerError::TokenInvalid("not authenticated".into()));
            return;
        };
        let Some(worker) = self.inner.workers.get(session_id) else {
            self.inner
                .send_err(&conn, &ServerError::SessionNotFound(session_id.to_string()));
            return;
        };
        let _ = worker.send(job(admin_id));
    }

    async fn start_session(
        &self,
        conn: ConnectionId,
        proposed_id: Option<String>,
        config: SessionConfig,
    ) {
        let Some(admin_id) = self.inner.connections.admin_id_of(&conn) else {
            self.inner.send_err(&conn, &ServerError::TokenInvalid("not authenticated".into()));
            return;
        };

        let session = match self
            .inner
            .registry
            .create(
                proposed_id,
                &admin_id,
                config,
                &self.inner.config.session_prefix,
            )
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.inner.send_err(&conn, &err);
                return;
            }
        };

        let session_id = {
            let mut guard = session.lock().await;
            guard.current_admin_conn = Some(conn);
            guard.id.clone()
        };

        if let Err(err) = self
            .inner
            .identities
            .add_owned_session(&admin_id, &session_id)
            .await
        {
            error!("failed to record owned session {}: {}", session_id, err);
        }

        self.spawn_worker(session_id.clone(), session);
        self.inner.connections.send_to_admin(
            &admin_id,
            &ServerMessage::SessionStatusUpdate {
                session_id,
                status: SessionStatus::Started,
                client_count: 0,
            },
        );
    }

    pub async fn handle_listener_frame(&self, conn: ConnectionId, frame: ClientMessage) {
        match frame {
            ClientMessage::JoinSession {
                session_id,
                preferred_language,
                audio_capabilities,
            } => {
                if self.inner.connections.session_of(&conn).is_some() {
                    self.inner.send_err(
                        &conn,
                        &ServerError::MalformedFrame(
                            "already joined a session; leave it first".to_string(),
                        ),
                    );
                    return;
                }
                let Some(worker) = self.inner.workers.get(&session_id) else {
                    self.inner
                        .send_err(&conn, &ServerError::SessionNotFound(session_id));
                    return;
                };
                let _ = worker.send(SessionJob::Join {
                    conn,
                    language: preferred_language,
                    capabilities: audio_capabilities,
                });
            }
            ClientMessage::ChangeLanguage {
                session_id,
                new_language,
            } => {
                if !self.listener_member_of(&conn, &session_id) {
                    return;
                }
                if let Some(worker) = self.inner.workers.get(&session_id) {
                    let _ = worker.send(SessionJob::ChangeLanguage { conn, new_language });
                }
            }
            ClientMessage::LeaveSession { session_id } => {
                if !self.listener_member_of(&conn, &session_id) {
                    return;
                }
                if let Some(worker) = self.inner.workers.get(&session_id) {
                    let _ = worker.send(SessionJob::Leave { conn });
                }
            }
            _ => {
                self.inner.send_err(
                    &conn,
                    &ServerError::InsufficientPermission(
                        "admin frame on a listener connection".to_string(),
                    ),
                );
            }
        }
    }

    /// Listener frames are authorized by session membership.
    fn listener_member_of(&self, conn: &ConnectionId, session_id: &str) -> bool {
        if self.inner.connections.session_of(conn).as_deref() == Some(session_id) {
            return true;
        }
        self.inner.send_err(
            conn,
            &ServerError::InsufficientPermission("not a member of this session".to_string()),
        );
        false
    }

    /// Connection closed: release subscriptions, owned-session links, and
    /// token cache entries.
    pub async fn handle_disconnect(&self, conn: ConnectionId) {
        self.inner.tokens.remove(&conn);
        let Some((role, admin_id, session_id)) = self.inner.connections.remove(&conn) else {
            return;
        };

        match role {
            super::Role::Admin => {
                if let Some(admin_id) = admin_id {
                    let owned = self
                        .inner
                        .identities
                        .get(&admin_id)
                        .map(|r| r.owned_sessions)
                        .unwrap_or_default();
                    for session_id in owned {
                        if let Some(worker) = self.inner.workers.get(&session_id) {
                            let _ = worker.send(SessionJob::AdminDisconnected { conn });
                        }
                    }
                    debug!("admin connection {} ({}) closed", conn, admin_id);
                }
            }
            super::Role::Listener => {
                if let Some(session_id) = session_id {
                    match self.inner.workers.get(&session_id) {
                        Some(worker) => {
                            let _ = worker.send(SessionJob::ListenerDisconnected { conn });
                        }
                        None => {
                            self.inner.fanout.unsubscribe(&session_id, conn);
                        }
                    }
                }
            }
        }
    }

    /// Periodic token lifecycle sweep: warn connections whose access token
    /// is about to expire, then expire and close the rest.
    pub fn sweep_tokens(&self) {
        for (conn, token) in self
            .inner
            .tokens
            .take_expiring_within(self.inner.config.token_warn_window)
        {
            let remaining = (token.expires_at - Utc::now()).num_seconds().max(0);
            self.inner.connections.send(
                &conn,
                &ServerMessage::TokenExpiryWarning {
                    expires_at: token.expires_at.timestamp(),
                    time_remaining: remaining,
                },
            );
        }
        for (conn, token) in self.inner.tokens.take_expired() {
            info!("access token expired for {} on {}", token.admin_id, conn);
            self.inner.connections.send(
                &conn,
                &ServerMessage::SessionExpired {
                    reason: "access token expired".to_string(),
                },
            );
            self.inner.connections.close(&conn);
        }
    }

    /// Graceful shutdown: broadcast, drain, close.
    pub async fn shutdown(&self, reason: &str) {
        self.inner.connections.broadcast_all(&ServerMessage::ServerShutdown {
            reason: reason.to_string(),
            reconnect_delay_ms: SHUTDOWN_RECONNECT_DELAY_MS,
        });
        tokio::time::sleep(self.inner.config.shutdown_drain).await;
        self.inner.connections.close_all();
    }
}

struct SessionWorker {
    ctx: Arc<RouterInner>,
    session_id: String,
    session: Arc<Mutex<Session>>,
    cost: CostTracker,
    last_activity_persist: Instant,
}

impl SessionWorker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<SessionJob>) {
        while let Some(job) = jobs.recv().await {
            let stop = match job {
                SessionJob::Translation {
                    conn,
                    admin_id,
                    language,
                    text,
                    timestamp,
                } => {
                    self.handle_translation(conn, &admin_id, language, &text, timestamp)
                        .await;
                    false
                }
                SessionJob::UpdateConfig {
                    conn,
                    admin_id,
                    config,
                } => {
                    self.handle_update_config(conn, &admin_id, config).await;
                    false
                }
                SessionJob::Pause { conn, admin_id } => {
                    self.handle_pause_resume(conn, &admin_id, SessionStatus::Paused)
                        .await;
                    false
                }
                SessionJob::Resume { conn, admin_id } => {
                    self.handle_pause_resume(conn, &admin_id, SessionStatus::Active)
                        .await;
                    false
                }
                SessionJob::End { conn, admin_id } => self.handle_end(conn, &admin_id).await,
                SessionJob::Join {
                    conn,
                    language,
                    capabilities,
                } => {
                    self.handle_join(conn, language, capabilities).await;
                    false
                }
                SessionJob::ChangeLanguage { conn, new_language } => {
                    self.handle_change_language(conn, new_language).await;
                    false
                }
                SessionJob::Leave { conn } => {
                    self.handle_leave(conn, true).await;
                    false
                }
                SessionJob::AdminAttached { conn } => {
                    self.handle_admin_attached(conn).await;
                    false
                }
                SessionJob::AdminDisconnected { conn } => {
                    let mut session = self.session.lock().await;
                    if session.current_admin_conn == Some(conn) {
                        session.current_admin_conn = None;
                        info!("admin connection for {} dropped, awaiting reconnect", session.id);
                    }
                    false
                }
                SessionJob::ListenerDisconnected { conn } => {
                    self.handle_leave(conn, false).await;
                    false
                }
            };
            if stop {
                break;
            }
        }
        debug!("session worker {} exited", self.session_id);
    }

    /// Ownership check shared by all admin jobs; the most recent admin
    /// connection becomes the session's current one.
    async fn owner_guard(&self, conn: ConnectionId, admin_id: &str) -> bool {
        let mut session = self.session.lock().await;
        if session.owner_admin_id != admin_id {
            drop(session);
            self.ctx.send_err(&conn, &ServerError::NotOwner);
            return false;
        }
        session.current_admin_conn = Some(conn);
        true
    }

    async fn snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    async fn persist(&self) {
        let snapshot = self.snapshot().await;
        if let Err(e) = self.ctx.registry.persist_snapshot(&snapshot).await {
            error!("failed to persist session {}: {}", self.session_id, e);
        }
    }

    async fn broadcast_status(&self) {
        let (owner, status, count) = {
            let session = self.session.lock().await;
            (
                session.owner_admin_id.clone(),
                session.status,
                session.listeners.len(),
            )
        };
        self.ctx.connections.send_to_admin(
            &owner,
            &ServerMessage::SessionStatusUpdate {
                session_id: self.session_id.clone(),
                status,
                client_count: count,
            },
        );
    }

    fn forward_cost_warning(&self, owner: &str, warning: Option<CostWarningEvent>) {
        if let Some(warning) = warning {
            warn!(
                "session {} projected spend ${:.2}/h over ${:.2}/h threshold",
                self.session_id, warning.projected_hourly_usd, warning.threshold_usd
            );
            self.ctx.connections.send_to_admin(
                owner,
                &ServerMessage::CostWarning {
                    session_id: self.session_id.clone(),
                    projected_hourly_usd: warning.projected_hourly_usd,
                    threshold_usd: warning.threshold_usd,
                },
            );
        }
    }

    async fn handle_translation(
        &mut self,
        conn: ConnectionId,
        admin_id: &str,
        language: LanguageCode,
        text: &str,
        timestamp: i64,
    ) {
        if !self.owner_guard(conn, admin_id).await {
            return;
        }

        let (owner, config, status_changed) = {
            let mut session = self.session.lock().await;
            if !session.config.has_language(language) {
                let err = ServerError::UnsupportedLanguage(language.to_string());
                drop(session);
                self.ctx.send_err(&conn, &err);
                return;
            }
            // First delivery from the admin pipeline activates the session.
            let status_changed = if session.status == SessionStatus::Started {
                session.transition(SessionStatus::Active).is_ok()
            } else {
                session.touch();
                false
            };
            (
                session.owner_admin_id.clone(),
                session.config.clone(),
                status_changed,
            )
        };

        if status_changed {
            self.persist().await;
            self.broadcast_status().await;
        } else if self.last_activity_persist.elapsed() > ACTIVITY_PERSIST_INTERVAL {
            self.persist().await;
            self.last_activity_persist = Instant::now();
        }

        let warning = self
            .cost
            .record(BillableService::Translation, text.chars().count() as f64);
        self.forward_cost_warning(&owner, warning);

        let (outcome, warning) = self
            .ctx
            .tts
            .resolve(
                text,
                language,
                config.tts_mode,
                config.audio_quality,
                &self.cost,
            )
            .await;
        self.forward_cost_warning(&owner, warning);

        for listener in self.ctx.fanout.subscribers(&self.session_id, language) {
            let (audio_url, use_local_tts) = match &outcome {
                TtsOutcome::Audio { url } => (Some(url.clone()), None),
                TtsOutcome::LocalSynthesis => {
                    // A device with no local voice for this language falls
                    // back to text-only.
                    let caps = self.ctx.connections.capabilities_of(&listener);
                    if caps.local_synthesis_languages.contains(&language) {
                        (None, Some(true))
                    } else {
                        (None, None)
                    }
                }
                TtsOutcome::TextOnly => (None, None),
            };
            self.ctx.connections.send(
                &listener,
                &ServerMessage::Translation {
                    session_id: self.session_id.clone(),
                    language,
                    text: text.to_string(),
                    timestamp,
                    audio_url,
                    use_local_tts,
                },
            );
        }
    }

    async fn handle_update_config(
        &mut self,
        conn: ConnectionId,
        admin_id: &str,
        config: SessionConfig,
    ) {
        if !self.owner_guard(conn, admin_id).await {
            return;
        }
        if let Err(msg) = config.validate() {
            self.ctx
                .send_err(&conn, &ServerError::InvalidConfiguration(msg));
            return;
        }

        let (removed, metadata) = {
            let mut session = self.session.lock().await;
            let removed: Vec<LanguageCode> = session
                .config
                .target_languages
                .iter()
                .filter(|lang| !config.target_languages.contains(lang))
                .copied()
                .collect();
            session.config = config.clone();
            session.touch();
            let metadata = ServerMessage::SessionMetadata {
                session_id: session.id.clone(),
                config: config.clone(),
                available_languages: config.target_languages.clone(),
                tts_available: config.tts_mode != shared::TtsMode::Disabled,
            };
            (removed, metadata)
        };
        self.persist().await;

        // Everyone still subscribed sees the new configuration first.
        let subscribers = self.ctx.fanout.all_subscribers(&self.session_id);

        // Subscribers of a removed language are notified and unsubscribed,
        // never dropped; they pick another language via change-language.
        for language in removed {
            for listener in self.ctx.fanout.drain_language(&self.session_id, language) {
                self.ctx.connections.set_language(&listener, None);
                self.ctx.connections.send(
                    &listener,
                    &ServerMessage::LanguageUnavailable {
                        session_id: self.session_id.clone(),
                        removed_language: language,
                        available_languages: config.target_languages.clone(),
                    },
                );
            }
        }

        for listener in subscribers {
            self.ctx.connections.send(&listener, &metadata);
        }
        self.broadcast_status().await;
    }

    async fn handle_pause_resume(
        &mut self,
        conn: ConnectionId,
        admin_id: &str,
        target: SessionStatus,
    ) {
        if !self.owner_guard(conn, admin_id).await {
            return;
        }
        let result = {
            let mut session = self.session.lock().await;
            if session.status == target {
                // Repeated pause/resume is a no-op, not a protocol error.
                return;
            }
            session.transition(target)
        };
        match result {
            Ok(()) => {
                self.persist().await;
                self.broadcast_status().await;
            }
            Err(err) => self.ctx.send_err(&conn, &err),
        }
    }

    async fn handle_end(&mut self, conn: ConnectionId, admin_id: &str) -> bool {
        if !self.owner_guard(conn, admin_id).await {
            return false;
        }

        let owner = {
            let mut session = self.session.lock().await;
            if let Err(err) = session.transition(SessionStatus::Ending) {
                drop(session);
                self.ctx.send_err(&conn, &err);
                return false;
            }
            session.owner_admin_id.clone()
        };
        self.persist().await;
        self.broadcast_status().await;

        let (services, total_usd) = self.cost.summary();
        self.ctx.connections.send_to_admin(
            &owner,
            &ServerMessage::CostSummary {
                session_id: self.session_id.clone(),
                services,
                total_usd,
            },
        );

        // Notify and unbind every listener; their connections stay open.
        let listeners: Vec<ConnectionId> = {
            let session = self.session.lock().await;
            session.listeners.iter().copied().collect()
        };
        for listener in listeners {
            self.ctx.connections.send(
                &listener,
                &ServerMessage::SessionStatusUpdate {
                    session_id: self.session_id.clone(),
                    status: SessionStatus::Ended,
                    client_count: 0,
                },
            );
            self.ctx.connections.bind_session(&listener, None);
            self.ctx.connections.set_language(&listener, None);
        }
        self.ctx.fanout.drop_session(&self.session_id);

        {
            let mut session = self.session.lock().await;
            if let Err(err) = session.transition(SessionStatus::Ended) {
                error!("failed to finalize {}: {}", self.session_id, err);
            }
        }
        if let Err(err) = self
            .ctx
            .identities
            .remove_owned_session(&owner, &self.session_id)
            .await
        {
            warn!("failed to release owned session link: {}", err);
        }
        self.ctx.registry.remove(&self.session_id).await;
        self.ctx.workers.remove(&self.session_id);
        info!("session {} ended", self.session_id);
        true
    }

    async fn handle_join(
        &mut self,
        conn: ConnectionId,
        language: LanguageCode,
        capabilities: AudioCapabilities,
    ) {
        let metadata = {
            let mut session = self.session.lock().await;
            if !matches!(
                session.status,
                SessionStatus::Started | SessionStatus::Active | SessionStatus::Paused
            ) {
                let err = ServerError::SessionNotFound(self.session_id.clone());
                drop(session);
                self.ctx.send_err(&conn, &err);
                return;
            }
            if session.listeners.len() >= self.ctx.config.max_listeners_per_session {
                let err =
                    ServerError::ClientLimitExceeded(self.ctx.config.max_listeners_per_session);
                drop(session);
                self.ctx.send_err(&conn, &err);
                return;
            }
            if !session.config.has_language(language) {
                let err = ServerError::UnsupportedLanguage(language.to_string());
                drop(session);
                self.ctx.send_err(&conn, &err);
                return;
            }
            session.listeners.insert(conn);
            session.touch();
            ServerMessage::SessionMetadata {
                session_id: session.id.clone(),
                config: session.config.clone(),
                available_languages: session.config.target_languages.clone(),
                tts_available: session.config.tts_mode != shared::TtsMode::Disabled,
            }
        };

        self.ctx.fanout.subscribe(&self.session_id, language, conn);
        self.ctx
            .connections
            .bind_session(&conn, Some(self.session_id.clone()));
        self.ctx.connections.set_language(&conn, Some(language));
        self.ctx.connections.set_capabilities(&conn, capabilities);

        self.ctx.connections.send(&conn, &metadata);
        self.broadcast_status().await;
    }

    async fn handle_change_language(&mut self, conn: ConnectionId, new_language: LanguageCode) {
        let allowed = {
            let session = self.session.lock().await;
            session.config.has_language(new_language)
        };
        if !allowed {
            self.ctx
                .send_err(&conn, &ServerError::UnsupportedLanguage(new_language.to_string()));
            return;
        }
        self.ctx
            .fanout
            .change_language(&self.session_id, conn, new_language);
        self.ctx.connections.set_language(&conn, Some(new_language));
    }

    /// Shared by explicit leave-session and abrupt disconnect; only the
    /// former leaves the connection registered.
    async fn handle_leave(&mut self, conn: ConnectionId, still_connected: bool) {
        self.ctx.fanout.unsubscribe(&self.session_id, conn);
        {
            let mut session = self.session.lock().await;
            session.listeners.remove(&conn);
            session.touch();
        }
        if still_connected {
            self.ctx.connections.bind_session(&conn, None);
            self.ctx.connections.set_language(&conn, None);
        }
        self.broadcast_status().await;
    }

    async fn handle_admin_attached(&mut self, conn: ConnectionId) {
        let status = {
            let mut session = self.session.lock().await;
            session.current_admin_conn = Some(conn);
            session.status
        };
        let count = {
            let session = self.session.lock().await;
            session.listeners.len()
        };
        self.ctx.connections.send(
            &conn,
            &ServerMessage::SessionStatusUpdate {
                session_id: self.session_id.clone(),
                status,
                client_count: count,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_cache::AudioCache;
    use crate::identity::{DevValidator, TokenMinter};
    use crate::tts::{
        SynthesisClient, SynthesisRequest, SynthesizedAudio, TtsPipeline, VoiceTable,
    };
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use shared::{AudioEncoding, AudioQuality, ErrorCode, TtsMode};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FlakyClient {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl SynthesisClient for FlakyClient {
        async fn synthesize(
            &self,
            request: &SynthesisRequest,
        ) -> Result<SynthesizedAudio, ServerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ServerError::SynthesisFailed("quota".to_string()));
            }
            Ok(SynthesizedAudio {
                bytes: format!("audio:{}", request.text).into_bytes(),
                mime: "audio/mpeg".to_string(),
            })
        }
    }

    struct Harness {
        router: Router,
        connections: Arc<ConnectionTable>,
        registry: Arc<SessionRegistry>,
        _dir: tempfile::TempDir,
    }

    struct TestConn {
        id: ConnectionId,
        rx: mpsc::Receiver<Message>,
        close: CancellationToken,
    }

    impl Harness {
        async fn new(fail_first_synth: usize, cost_threshold: f64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = crate::config::Config::from_env(true).unwrap();
            config.admin_state_dir = dir.path().join("admins");
            config.session_state_dir = dir.path().join("sessions");
            config.audio_cache_dir = dir.path().join("audio");
            config.cost_alarm_threshold = cost_threshold;
            config.max_listeners_per_session = 4;
            let config = Arc::new(config);

            let minter = TokenMinter::new(
                &config.token_secret,
                config.access_token_ttl,
                config.refresh_token_ttl,
            );
            let validator = Arc::new(DevValidator::new(minter));
            let identities =
                Arc::new(AdminIdentityStore::open(&config.admin_state_dir).await.unwrap());
            let registry = Arc::new(
                SessionRegistry::open(&config.session_state_dir, config.session_retention)
                    .await
                    .unwrap(),
            );
            let cache = Arc::new(
                AudioCache::open(
                    &config.audio_cache_dir,
                    config.audio_cache_max_bytes,
                    &config.token_secret,
                    config.audio_url_ttl,
                    &config.public_base_url,
                )
                .await
                .unwrap(),
            );
            let tts = Arc::new(TtsPipeline::new(
                cache,
                Some(Arc::new(FlakyClient {
                    calls: AtomicUsize::new(0),
                    fail_first: fail_first_synth,
                }) as Arc<dyn SynthesisClient>),
                VoiceTable::with_overrides(&HashMap::new()),
                config.tts_timeout,
            ));
            let connections = Arc::new(ConnectionTable::new());
            let router = Router::new(
                config.clone(),
                validator,
                identities,
                Arc::new(TokenCache::new()),
                registry.clone(),
                Arc::new(FanoutIndex::new()),
                tts,
                connections.clone(),
            );
            Self {
                router,
                connections,
                registry,
                _dir: dir,
            }
        }

        fn connect(&self, role: super::super::Role) -> TestConn {
            let id = ConnectionId::new_v4();
            let (tx, rx) = mpsc::channel(64);
            let close = CancellationToken::new();
            self.connections.register(id, role, tx, close.clone());
            TestConn { id, rx, close }
        }

        async fn admin(&self, username: &str) -> (TestConn, ServerMessage) {
            let conn = self.connect(super::super::Role::Admin);
            assert!(
                self.router
                    .authenticate_admin(
                        conn.id,
                        ClientMessage::AdminAuth {
                            method: AuthMethod::Credentials,
                            username: Some(username.to_string()),
                            password: Some("secret".to_string()),
                            access_token: None,
                            refresh_token: None,
                        },
                    )
                    .await
            );
            let mut conn = conn;
            let response = recv_frame(&mut conn).await;
            (conn, response)
        }
    }

    async fn recv_frame(conn: &mut TestConn) -> ServerMessage {
        let msg = tokio::time::timeout(Duration::from_secs(2), conn.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection channel closed");
        match msg {
            Message::Text(json) => serde_json::from_str(&json).expect("unparseable frame"),
            other => panic!("unexpected ws message: {:?}", other),
        }
    }

    /// Receives frames until one matches, failing after a few non-matches.
    async fn recv_until(conn: &mut TestConn, matcher: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        for _ in 0..16 {
            let frame = recv_frame(conn).await;
            if matcher(&frame) {
                return frame;
            }
        }
        panic!("expected frame never arrived");
    }

    fn no_frame(conn: &mut TestConn) {
        assert!(
            conn.rx.try_recv().is_err(),
            "expected no pending frame for this connection"
        );
    }

    fn config(targets: Vec<LanguageCode>, tts_mode: TtsMode) -> SessionConfig {
        SessionConfig {
            source_language: "en-US".to_string(),
            target_languages: targets,
            tts_mode,
            audio_quality: AudioQuality::Medium,
            audio_encoding: AudioEncoding::default(),
        }
    }

    fn translation(session_id: &str, language: LanguageCode, text: &str) -> ClientMessage {
        ClientMessage::Translation {
            session_id: session_id.to_string(),
            language,
            text: text.to_string(),
            timestamp: 1700000000,
            sequence_number: 1,
        }
    }

    async fn join(
        harness: &Harness,
        session_id: &str,
        language: LanguageCode,
        local_langs: Vec<LanguageCode>,
    ) -> TestConn {
        let mut conn = harness.connect(super::super::Role::Listener);
        harness
            .router
            .handle_listener_frame(
                conn.id,
                ClientMessage::JoinSession {
                    session_id: session_id.to_string(),
                    preferred_language: language,
                    audio_capabilities: AudioCapabilities {
                        supports_playback: true,
                        local_synthesis_languages: local_langs,
                    },
                },
            )
            .await;
        match recv_frame(&mut conn).await {
            ServerMessage::SessionMetadata { .. } => conn,
            other => panic!("expected session-metadata, got {:?}", other),
        }
    }

    const SID: &str = "CHURCH-2025-001";

    async fn start(harness: &Harness, admin: &mut TestConn, cfg: SessionConfig) {
        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::StartSession {
                    session_id: Some(SID.to_string()),
                    config: cfg,
                },
            )
            .await;
        recv_until(admin, |f| {
            matches!(
                f,
                ServerMessage::SessionStatusUpdate {
                    status: SessionStatus::Started,
                    ..
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_scenario_a_basic_broadcast() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, response) = harness.admin("alice").await;
        match response {
            ServerMessage::AdminAuthResponse { success, .. } => assert!(success),
            other => panic!("expected auth response, got {:?}", other),
        }

        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En, LanguageCode::Es], TtsMode::Disabled),
        )
        .await;

        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;
        let mut l2 = join(&harness, SID, LanguageCode::Es, vec![]).await;

        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Hello"))
            .await;

        match recv_frame(&mut l1).await {
            ServerMessage::Translation {
                text,
                language,
                audio_url,
                use_local_tts,
                ..
            } => {
                assert_eq!(text, "Hello");
                assert_eq!(language, LanguageCode::En);
                assert!(audio_url.is_none());
                assert!(use_local_tts.is_none());
            }
            other => panic!("expected translation, got {:?}", other),
        }
        no_frame(&mut l2);
    }

    #[tokio::test]
    async fn test_scenario_b_language_change() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En, LanguageCode::Es], TtsMode::Disabled),
        )
        .await;

        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;
        let mut l2 = join(&harness, SID, LanguageCode::Es, vec![]).await;

        harness
            .router
            .handle_listener_frame(
                l2.id,
                ClientMessage::ChangeLanguage {
                    session_id: SID.to_string(),
                    new_language: LanguageCode::En,
                },
            )
            .await;
        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "World"))
            .await;

        for listener in [&mut l1, &mut l2] {
            match recv_frame(listener).await {
                ServerMessage::Translation { text, .. } => assert_eq!(text, "World"),
                other => panic!("expected translation, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_scenario_c_language_removed() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En, LanguageCode::Es], TtsMode::Disabled),
        )
        .await;

        let _l1 = join(&harness, SID, LanguageCode::En, vec![]).await;
        let mut l2 = join(&harness, SID, LanguageCode::Es, vec![]).await;

        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::UpdateSessionConfig {
                    session_id: SID.to_string(),
                    config: config(vec![LanguageCode::En], TtsMode::Disabled),
                },
            )
            .await;

        // The affected listener is told to pick another language and sees
        // the new metadata; the connection stays open.
        match recv_frame(&mut l2).await {
            ServerMessage::LanguageUnavailable {
                removed_language,
                available_languages,
                ..
            } => {
                assert_eq!(removed_language, LanguageCode::Es);
                assert_eq!(available_languages, vec![LanguageCode::En]);
            }
            other => panic!("expected language-unavailable, got {:?}", other),
        }
        assert!(!l2.close.is_cancelled());

        // A translation in the removed language is rejected as validation.
        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::Es, "Hola"))
            .await;
        let frame = recv_until(&mut admin, |f| matches!(f, ServerMessage::Error { .. })).await;
        match frame {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::UnsupportedLanguage);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scenario_d_tts_fallback() {
        // First upstream call fails; mode stays neural.
        let harness = Harness::new(1, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Neural),
        )
        .await;

        let mut l1 = join(&harness, SID, LanguageCode::En, vec![LanguageCode::En]).await;

        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Grace"))
            .await;

        match recv_frame(&mut l1).await {
            ServerMessage::Translation {
                audio_url,
                use_local_tts,
                ..
            } => {
                assert!(audio_url.is_none());
                assert_eq!(use_local_tts, Some(true));
            }
            other => panic!("expected translation, got {:?}", other),
        }

        // The retry succeeds upstream, so the next line carries a URL.
        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Peace"))
            .await;
        match recv_frame(&mut l1).await {
            ServerMessage::Translation { audio_url, .. } => assert!(audio_url.is_some()),
            other => panic!("expected translation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_without_local_voice_gets_text_only() {
        let harness = Harness::new(usize::MAX, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Neural),
        )
        .await;

        // Device reports Spanish-only local synthesis.
        let mut l1 = join(&harness, SID, LanguageCode::En, vec![LanguageCode::Es]).await;

        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Grace"))
            .await;
        match recv_frame(&mut l1).await {
            ServerMessage::Translation {
                audio_url,
                use_local_tts,
                text,
                ..
            } => {
                assert_eq!(text, "Grace");
                assert!(audio_url.is_none());
                assert!(use_local_tts.is_none());
            }
            other => panic!("expected translation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scenario_e_admin_reconnect() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, response) = harness.admin("alice").await;
        let access_token = match response {
            ServerMessage::AdminAuthResponse { access_token, .. } => access_token.unwrap(),
            other => panic!("expected auth response, got {:?}", other),
        };
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;
        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;

        // Abrupt admin disconnect: session stays, admin slot clears.
        harness.router.handle_disconnect(admin.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let session = harness.registry.get(SID).unwrap();
            let session = session.lock().await;
            assert!(session.current_admin_conn.is_none());
            assert_eq!(session.listeners.len(), 1);
        }

        // Reconnect by stored token; owned sessions come back.
        let mut reconnected = harness.connect(super::super::Role::Admin);
        assert!(
            harness
                .router
                .authenticate_admin(
                    reconnected.id,
                    ClientMessage::AdminAuth {
                        method: AuthMethod::Token,
                        username: None,
                        password: None,
                        access_token: Some(access_token),
                        refresh_token: None,
                    },
                )
                .await
        );
        match recv_frame(&mut reconnected).await {
            ServerMessage::AdminAuthResponse {
                success,
                owned_sessions,
                ..
            } => {
                assert!(success);
                assert_eq!(owned_sessions, vec![SID.to_string()]);
            }
            other => panic!("expected auth response, got {:?}", other),
        }
        // The reattach job restores the current admin connection.
        recv_until(&mut reconnected, |f| {
            matches!(f, ServerMessage::SessionStatusUpdate { .. })
        })
        .await;
        {
            let session = harness.registry.get(SID).unwrap();
            let session = session.lock().await;
            assert_eq!(session.current_admin_conn, Some(reconnected.id));
        }

        // Listeners were never disturbed.
        harness
            .router
            .handle_admin_frame(reconnected.id, translation(SID, LanguageCode::En, "Back"))
            .await;
        match recv_frame(&mut l1).await {
            ServerMessage::Translation { text, .. } => assert_eq!(text, "Back"),
            other => panic!("expected translation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scenario_f_cost_alarm_throttled() {
        // Threshold so low the first billable line crosses it.
        let harness = Harness::new(0, 1e-9).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Neural),
        )
        .await;
        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;

        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Line one"))
            .await;
        recv_until(&mut admin, |f| matches!(f, ServerMessage::CostWarning { .. })).await;
        recv_frame(&mut l1).await;

        // Sustained spend inside the cooldown stays silent.
        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Line two"))
            .await;
        recv_frame(&mut l1).await;
        while let Ok(msg) = admin.rx.try_recv() {
            if let Message::Text(json) = msg {
                let frame: ServerMessage = serde_json::from_str(&json).unwrap();
                assert!(
                    !matches!(frame, ServerMessage::CostWarning { .. }),
                    "warning not throttled"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_owner_exclusivity() {
        let harness = Harness::new(0, 100.0).await;
        let (mut alice, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut alice,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;

        let (mut mallory, _) = harness.admin("mallory").await;
        harness
            .router
            .handle_admin_frame(
                mallory.id,
                ClientMessage::EndSession {
                    session_id: SID.to_string(),
                },
            )
            .await;
        match recv_until(&mut mallory, |f| matches!(f, ServerMessage::Error { .. })).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotOwner),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(harness.registry.get(SID).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_start_session_is_error() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;

        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::StartSession {
                    session_id: Some(SID.to_string()),
                    config: config(vec![LanguageCode::En], TtsMode::Disabled),
                },
            )
            .await;
        match recv_until(&mut admin, |f| matches!(f, ServerMessage::Error { .. })).await {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::SessionAlreadyExists)
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_with_disabled_language_rejected() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;

        let mut listener = harness.connect(super::super::Role::Listener);
        harness
            .router
            .handle_listener_frame(
                listener.id,
                ClientMessage::JoinSession {
                    session_id: SID.to_string(),
                    preferred_language: LanguageCode::Fr,
                    audio_capabilities: AudioCapabilities::default(),
                },
            )
            .await;
        match recv_frame(&mut listener).await {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::UnsupportedLanguage)
            }
            other => panic!("expected error, got {:?}", other),
        }

        // No subscription was made: a translation reaches nobody.
        harness
            .router
            .handle_admin_frame(admin.id, translation(SID, LanguageCode::En, "Hello"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        no_frame(&mut listener);
    }

    #[tokio::test]
    async fn test_listener_limit() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;

        // Config in the harness caps listeners at 4.
        for _ in 0..4 {
            join(&harness, SID, LanguageCode::En, vec![]).await;
        }
        let mut fifth = harness.connect(super::super::Role::Listener);
        harness
            .router
            .handle_listener_frame(
                fifth.id,
                ClientMessage::JoinSession {
                    session_id: SID.to_string(),
                    preferred_language: LanguageCode::En,
                    audio_capabilities: AudioCapabilities::default(),
                },
            )
            .await;
        match recv_frame(&mut fifth).await {
            ServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::ClientLimitExceeded)
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_preserved_per_listener() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;
        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;

        for i in 0..10 {
            harness
                .router
                .handle_admin_frame(
                    admin.id,
                    translation(SID, LanguageCode::En, &format!("line-{}", i)),
                )
                .await;
        }
        for i in 0..10 {
            match recv_frame(&mut l1).await {
                ServerMessage::Translation { text, .. } => {
                    assert_eq!(text, format!("line-{}", i))
                }
                other => panic!("expected translation, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_end_session_notifies_and_releases() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;
        let mut l1 = join(&harness, SID, LanguageCode::En, vec![]).await;

        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::EndSession {
                    session_id: SID.to_string(),
                },
            )
            .await;

        recv_until(&mut admin, |f| matches!(f, ServerMessage::CostSummary { .. })).await;
        match recv_until(&mut l1, |f| {
            matches!(f, ServerMessage::SessionStatusUpdate { .. })
        })
        .await
        {
            ServerMessage::SessionStatusUpdate { status, .. } => {
                assert_eq!(status, SessionStatus::Ended)
            }
            other => panic!("expected status update, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.registry.get(SID).is_none());
        // The listener connection survives the end of the session.
        assert!(!l1.close.is_cancelled());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let harness = Harness::new(0, 100.0).await;
        let (mut admin, _) = harness.admin("alice").await;
        start(
            &harness,
            &mut admin,
            config(vec![LanguageCode::En], TtsMode::Disabled),
        )
        .await;

        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::PauseSession {
                    session_id: SID.to_string(),
                },
            )
            .await;
        match recv_until(&mut admin, |f| {
            matches!(
                f,
                ServerMessage::SessionStatusUpdate {
                    status: SessionStatus::Paused,
                    ..
                }
            )
        })
        .await
        {
            ServerMessage::SessionStatusUpdate { status, .. } => {
                assert_eq!(status, SessionStatus::Paused)
            }
            other => panic!("unexpected frame {:?}", other),
        }

        harness
            .router
            .handle_admin_frame(
                admin.id,
                ClientMessage::ResumeSession {
                    session_id: SID.to_string(),
                },
            )
            .await;
        recv_until(&mut admin, |f| {
            matches!(
                f,
                ServerMessage::SessionStatusUpdate {
                    status: SessionStatus::Active,
                    ..
                }
            )
        })
        .await;
    }
}
