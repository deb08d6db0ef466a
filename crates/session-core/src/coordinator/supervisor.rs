//! Session Supervisor
//!
//! Composes the signal channel, negotiation machine and media controller for
//! each session, runs the session as a tracked task and owns its teardown.
//! All process-wide collaborators (relay, transport engine, capture source,
//! configuration) are injected through [`SessionSupervisorBuilder`].

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use uuid::Uuid;

use peerlink_infra_common::logging::with_context;
use peerlink_infra_common::{LogContext, TaskManager};

use super::events::{SessionEvent, SessionEventBus};
use super::registry::{SessionOutcome, SessionRegistry, SupervisorStats};
use super::session_task::{SessionTask, SessionTaskParts};
use crate::config::SessionConfig;
use crate::errors::{Result, SessionError};
use crate::media::{CaptureSource, MediaSessionController, TransportEngine};
use crate::signaling::{RelayStore, SignalChannel};
use crate::types::{NegotiationState, PeerId, Role, SessionId, SessionStatus};

/// Caller-side handle of one session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    role: Role,
    status: watch::Receiver<SessionStatus>,
    negotiation: watch::Receiver<NegotiationState>,
    control: Arc<SessionControl>,
}

struct SessionControl {
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
    instance: Uuid,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    negotiation_tx: Arc<watch::Sender<NegotiationState>>,
}

impl SessionControl {
    fn is_finished(&self) -> bool {
        self.join.lock().as_ref().map_or(true, |join| join.is_finished())
    }

    /// Finish the bookkeeping of a task that was aborted mid-teardown
    fn finish_aborted(
        &self,
        session_id: &SessionId,
        role: Role,
        registry: &SessionRegistry,
        events: &SessionEventBus,
    ) {
        if registry.complete(session_id, self.instance, SessionOutcome::Closed) {
            debug!("Session {} unregistered after abort", session_id);
        }
        if !self.negotiation_tx.borrow().is_terminal() {
            self.negotiation_tx.send_replace(NegotiationState::Closed);
            events.negotiation_changed(session_id, NegotiationState::Closed);
        }
        if !self.status_tx.borrow().is_terminal() {
            self.status_tx.send_replace(SessionStatus::Closed);
            events.status_changed(session_id, role, SessionStatus::Closed);
        }
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Latest UI-facing status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.borrow()
    }

    /// Receiver for status changes
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Receiver for negotiation state changes
    pub fn watch_negotiation(&self) -> watch::Receiver<NegotiationState> {
        self.negotiation.clone()
    }

    /// Whether the session task has exited
    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Builder for [`SessionSupervisor`]
#[derive(Default)]
pub struct SessionSupervisorBuilder {
    local_id: Option<PeerId>,
    relay: Option<Arc<dyn RelayStore>>,
    engine: Option<Arc<dyn TransportEngine>>,
    capture: Option<Arc<dyn CaptureSource>>,
    config: SessionConfig,
}

impl SessionSupervisorBuilder {
    /// Identifier of the local party, from the identity provider
    pub fn local_id(mut self, local_id: impl Into<PeerId>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn relay(mut self, relay: Arc<dyn RelayStore>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn TransportEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn CaptureSource>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SessionSupervisor> {
        let local_id = self
            .local_id
            .ok_or_else(|| SessionError::configuration("local id is required"))?;
        if local_id.as_str().trim().is_empty() {
            return Err(SessionError::invalid_peer("local id must not be empty"));
        }
        let relay = self
            .relay
            .ok_or_else(|| SessionError::configuration("relay store is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| SessionError::configuration("transport engine is required"))?;
        let capture = self
            .capture
            .ok_or_else(|| SessionError::configuration("capture source is required"))?;
        self.config.validate()?;

        let config = Arc::new(self.config);
        info!("Session supervisor for {} ready (relay root '{}')", local_id, config.relay_root);
        Ok(SessionSupervisor {
            channel: SignalChannel::new(relay, config.relay_root.clone()),
            events: SessionEventBus::new(config.event_capacity),
            tasks: TaskManager::with_config(
                format!("sessions:{}", local_id),
                1000,
                config.teardown_timeout(),
            ),
            registry: Arc::new(SessionRegistry::new()),
            controls: DashMap::new(),
            local_id,
            engine,
            capture,
            config,
        })
    }
}

/// Starts, tracks and tears down the sessions of one local party
pub struct SessionSupervisor {
    local_id: PeerId,
    config: Arc<SessionConfig>,
    channel: SignalChannel,
    engine: Arc<dyn TransportEngine>,
    capture: Arc<dyn CaptureSource>,
    registry: Arc<SessionRegistry>,
    /// Control side of every launched session, for shutdown
    controls: DashMap<SessionId, (Role, Arc<SessionControl>)>,
    events: SessionEventBus,
    tasks: TaskManager,
}

impl SessionSupervisor {
    pub fn builder() -> SessionSupervisorBuilder {
        SessionSupervisorBuilder::default()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start an offering session with `remote`
    pub fn start(&self, remote: impl Into<PeerId>) -> Result<SessionHandle> {
        self.launch(remote.into(), Role::Offerer)
    }

    /// Start an answering session for `remote`'s offer
    pub fn accept(&self, remote: impl Into<PeerId>) -> Result<SessionHandle> {
        self.launch(remote.into(), Role::Answerer)
    }

    fn launch(&self, remote: PeerId, role: Role) -> Result<SessionHandle> {
        let context = LogContext::with_operation("supervisor", role.to_string())
            .with_field("local", self.local_id.to_string())
            .with_field("remote", remote.to_string());
        with_context(&context, Level::DEBUG, || self.register_and_spawn(remote, role))
    }

    fn register_and_spawn(&self, remote: PeerId, role: Role) -> Result<SessionHandle> {
        let session_id = SessionId::new(self.local_id.clone(), remote)?;
        if self.tasks.is_shutting_down() {
            return Err(SessionError::internal("supervisor is shut down"));
        }

        let instance = Uuid::new_v4();
        self.registry.try_register(&session_id, role, instance)?;
        self.controls.retain(|_, (_, control)| !control.is_finished());

        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (negotiation_tx, negotiation_rx) = watch::channel(NegotiationState::Idle);
        let status_tx = Arc::new(status_tx);
        let negotiation_tx = Arc::new(negotiation_tx);
        let token = self.tasks.child_token();

        let media = MediaSessionController::new(
            session_id.clone(),
            self.engine.clone(),
            self.capture.clone(),
            self.config.capture,
            self.config.connection.clone(),
        );
        let task = SessionTask::new(SessionTaskParts {
            session_id: session_id.clone(),
            role,
            instance,
            config: self.config.clone(),
            channel: self.channel.clone(),
            media,
            registry: self.registry.clone(),
            events: self.events.clone(),
            status_tx: status_tx.clone(),
            negotiation_tx: negotiation_tx.clone(),
            token: token.clone(),
        });

        let join = match self.tasks.spawn_tracked(format!("session {}", session_id), task.run()) {
            Ok(join) => join,
            Err(err) => {
                self.registry.discard(&session_id, instance);
                return Err(err.into());
            }
        };

        let control = Arc::new(SessionControl {
            token,
            join: Mutex::new(Some(join)),
            instance,
            status_tx,
            negotiation_tx,
        });
        self.controls.insert(session_id.clone(), (role, control.clone()));

        info!("Started {} session {}", role, session_id);
        Ok(SessionHandle {
            session_id,
            role,
            status: status_rx,
            negotiation: negotiation_rx,
            control,
        })
    }

    /// Tear the session down and wait for it to finish. Idempotent.
    pub async fn cancel(&self, handle: &SessionHandle) {
        handle.control.token.cancel();
        let join = handle.control.join.lock().take();
        let Some(mut join) = join else {
            debug!("Session {} already torn down", handle.session_id);
            return;
        };

        match tokio::time::timeout(self.config.teardown_timeout(), &mut join).await {
            Ok(Ok(())) => debug!("Session {} torn down", handle.session_id),
            Ok(Err(err)) => warn!("Session {} task ended abnormally: {}", handle.session_id, err),
            Err(_) => {
                warn!(
                    "Session {} teardown exceeded {:?}, aborting",
                    handle.session_id,
                    self.config.teardown_timeout()
                );
                join.abort();
                let _ = join.await;
                handle
                    .control
                    .finish_aborted(&handle.session_id, handle.role, &self.registry, &self.events);
            }
        }
    }

    /// Cancel every session and wait for their teardown
    pub async fn shutdown(&self) {
        info!(
            "Shutting down supervisor for {} ({} active session(s))",
            self.local_id,
            self.registry.active_count()
        );
        let aborted = self.tasks.shutdown_all().await;

        let controls: Vec<_> = self
            .controls
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.controls.clear();
        if aborted == 0 {
            return;
        }
        warn!("{} session(s) of {} aborted during shutdown", aborted, self.local_id);
        for (session_id, (role, control)) in controls {
            control.finish_aborted(&session_id, role, &self.registry, &self.events);
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.registry.stats()
    }

    /// Whether a session with `remote` is live
    pub fn is_active(&self, remote: &PeerId) -> bool {
        SessionId::new(self.local_id.clone(), remote.clone())
            .map(|session_id| self.registry.contains(&session_id))
            .unwrap_or(false)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.registry.active_sessions()
    }
}
