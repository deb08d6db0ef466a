//! The per-session actor.
//!
//! One task owns every component of a session and handles local media
//! events, transport events and inbound signals on a single loop, so all
//! state mutations for the session are serialized. Teardown always runs on
//! the way out and releases capture, connection and subscription in that
//! order before the pair is unregistered. Each release step is bounded, so a
//! stuck collaborator cannot keep the pair registered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Level};
use uuid::Uuid;

use peerlink_infra_common::LogContext;

use super::events::SessionEventBus;
use super::registry::{SessionOutcome, SessionRegistry};
use crate::config::SessionConfig;
use crate::errors::{ChannelError, MediaError, SessionError};
use crate::media::{MediaSessionController, PeerConnectionState, TransportEvent};
use crate::negotiation::{NegotiationStateMachine, Reaction};
use crate::signaling::{ReceivedSignal, SignalChannel, SignalSubscription};
use crate::types::{NegotiationState, Role, SessionId, SessionStatus};

/// Why the session loop stopped
#[derive(Debug)]
enum Exit {
    /// Local cancel or supervisor shutdown
    Cancelled,
    /// The transport engine closed the connection
    Disconnected,
    Failed(SessionError),
}

impl From<SessionError> for Exit {
    fn from(err: SessionError) -> Self {
        Exit::Failed(err)
    }
}

enum Step {
    Transport(Option<TransportEvent>),
    Signal(Option<ReceivedSignal>),
}

pub(crate) struct SessionTask {
    session_id: SessionId,
    role: Role,
    instance: Uuid,
    config: Arc<SessionConfig>,
    channel: SignalChannel,
    media: MediaSessionController,
    registry: Arc<SessionRegistry>,
    events: SessionEventBus,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    negotiation_tx: Arc<watch::Sender<NegotiationState>>,
    token: CancellationToken,
    subscription: Option<SignalSubscription>,
    machine: Option<NegotiationStateMachine>,
}

/// Everything a session task needs from its supervisor
pub(crate) struct SessionTaskParts {
    pub session_id: SessionId,
    pub role: Role,
    pub instance: Uuid,
    pub config: Arc<SessionConfig>,
    pub channel: SignalChannel,
    pub media: MediaSessionController,
    pub registry: Arc<SessionRegistry>,
    pub events: SessionEventBus,
    pub status_tx: Arc<watch::Sender<SessionStatus>>,
    pub negotiation_tx: Arc<watch::Sender<NegotiationState>>,
    pub token: CancellationToken,
}

impl SessionTask {
    pub(crate) fn new(parts: SessionTaskParts) -> Self {
        Self {
            session_id: parts.session_id,
            role: parts.role,
            instance: parts.instance,
            config: parts.config,
            channel: parts.channel,
            media: parts.media,
            registry: parts.registry,
            events: parts.events,
            status_tx: parts.status_tx,
            negotiation_tx: parts.negotiation_tx,
            token: parts.token,
            subscription: None,
            machine: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let span = LogContext::with_operation("session", self.role.to_string())
            .with_field("session_id", self.session_id.to_string())
            .span(Level::INFO);

        async move {
            self.events
                .status_changed(&self.session_id, self.role, SessionStatus::Connecting);
            let exit = self.drive().await;
            self.teardown(exit).await;
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Exit {
        let subscribed = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Exit::Cancelled,
            result = self.open_inbox() => result,
        };
        match subscribed {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(err) => return Exit::Failed(err.into()),
        }

        let prepared = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Exit::Cancelled,
            result = self.media.prepare_local_media() => result,
        };
        if let Err(err) = prepared {
            return Exit::Failed(err.into());
        }

        let (connection, transport_events) =
            match (self.media.connection_handle(), self.media.take_transport_events()) {
                (Ok(connection), Some(events)) => (connection, events),
                (Err(err), _) => return Exit::Failed(err.into()),
                (Ok(_), None) => {
                    return Exit::Failed(SessionError::internal("transport events already taken"))
                }
            };

        self.machine = Some(
            NegotiationStateMachine::new(self.session_id.clone(), self.role, connection, self.channel.clone())
                .with_candidate_publish_retries(self.config.candidate_publish_retries),
        );

        if let Err(exit) = self.begin_negotiation().await {
            return exit;
        }

        self.event_loop(transport_events).await
    }

    /// Subscribe to the local inbox, skipping what earlier sessions left.
    ///
    /// The offerer has published nothing yet, so every stored entry is
    /// stale. The answerer still needs an offer stored before it started,
    /// so it only skips up to where the pair's previous session stopped.
    async fn open_inbox(&self) -> Result<SignalSubscription, ChannelError> {
        let local = self.session_id.local();
        match self.role {
            Role::Offerer => self.channel.subscribe_from_tail(local).await,
            Role::Answerer => {
                let resume_after = self.registry.resume_point(&self.session_id);
                self.channel.resubscribe(local, resume_after).await
            }
        }
    }

    /// Offerer: create and publish the offer. Answerer: wait for one.
    async fn begin_negotiation(&mut self) -> Result<(), Exit> {
        let Some(machine) = self.machine.as_mut() else {
            return Err(SessionError::internal("negotiation not initialized").into());
        };

        match self.role {
            Role::Offerer => {
                machine.start_negotiation()?;
                self.sync_negotiation();
                self.set_status(SessionStatus::Negotiating);

                let offer = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Err(Exit::Cancelled),
                    result = self.media.create_local_offer() => result.map_err(SessionError::from)?,
                };

                let Some(machine) = self.machine.as_mut() else {
                    return Err(SessionError::internal("negotiation not initialized").into());
                };
                let published = tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Err(Exit::Cancelled),
                    result = machine.on_local_offer(offer) => result,
                };
                self.sync_negotiation();
                published?;
            }
            Role::Answerer => {
                machine.await_remote_offer()?;
                self.sync_negotiation();
                self.set_status(SessionStatus::Negotiating);
            }
        }
        Ok(())
    }

    async fn event_loop(&mut self, mut transport_events: mpsc::UnboundedReceiver<TransportEvent>) -> Exit {
        let mut transport_open = true;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Exit::Cancelled,
                event = transport_events.recv(), if transport_open => Step::Transport(event),
                signal = next_signal(&mut self.subscription) => Step::Signal(signal),
            };

            let handled = match step {
                Step::Transport(Some(event)) => self.on_transport_event(event).await,
                Step::Transport(None) => {
                    debug!("Session {} transport event stream ended", self.session_id);
                    transport_open = false;
                    Ok(())
                }
                Step::Signal(Some(received)) => self.on_signal(received).await,
                Step::Signal(None) => self.on_subscription_ended().await,
            };
            self.sync_negotiation();

            if let Err(exit) = handled {
                return exit;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), Exit> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let machine = self.machine_mut()?;
                machine.on_local_candidate(candidate).await?;
            }
            TransportEvent::ConnectionStateChanged(PeerConnectionState::Connected) => {
                if *self.status_tx.borrow() != SessionStatus::Connected {
                    self.registry.record_connected();
                    self.set_status(SessionStatus::Connected);
                }
            }
            TransportEvent::ConnectionStateChanged(PeerConnectionState::Failed) => {
                return Err(Exit::Failed(
                    MediaError::TransportFailed {
                        message: "peer connection failed".to_string(),
                    }
                    .into(),
                ));
            }
            TransportEvent::ConnectionStateChanged(PeerConnectionState::Closed) => {
                info!("Session {} connection closed by transport", self.session_id);
                return Err(Exit::Disconnected);
            }
            TransportEvent::ConnectionStateChanged(PeerConnectionState::Disconnected) => {
                warn!("Session {} transport disconnected", self.session_id);
            }
            TransportEvent::ConnectionStateChanged(state) => {
                debug!("Session {} transport state {:?}", self.session_id, state);
            }
        }
        Ok(())
    }

    async fn on_signal(&mut self, received: ReceivedSignal) -> Result<(), Exit> {
        debug!(
            "Session {} received {} (order {})",
            self.session_id,
            received.message.kind(),
            received.order
        );
        let reaction = self.machine_mut()?.on_remote_message(received.message).await?;

        if reaction == Reaction::CreateLocalAnswer {
            self.sync_negotiation();
            let answer = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(Exit::Cancelled),
                result = self.media.create_local_answer() => result.map_err(SessionError::from)?,
            };
            self.machine_mut()?.on_local_answer(answer).await?;
        }
        Ok(())
    }

    /// The store ended the subscription. Mid-handshake that is fatal;
    /// afterwards the subscription is re-established where it left off.
    async fn on_subscription_ended(&mut self) -> Result<(), Exit> {
        let Some(mut ended) = self.subscription.take() else {
            return Err(SessionError::internal("subscription missing").into());
        };
        let termination = ended.take_termination().unwrap_or_else(|| ChannelError::ListenerCancelled {
            address: ended.address().to_string(),
            reason: "subscription ended".to_string(),
        });
        let resume_after = ended.last_order();
        ended.release();

        let negotiated = self
            .machine
            .as_ref()
            .is_some_and(|machine| machine.state().is_negotiated());
        if !negotiated || !termination.is_retryable() {
            return Err(Exit::Failed(termination.into()));
        }

        warn!("Session {} subscription lost: {}", self.session_id, termination);
        let mut last_error = termination;
        for attempt in 1..=self.config.resubscribe_attempts {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(Exit::Cancelled),
                _ = tokio::time::sleep(self.config.resubscribe_backoff()) => {}
            }

            match self.channel.resubscribe(self.session_id.local(), resume_after).await {
                Ok(subscription) => {
                    info!(
                        "Session {} resubscribed on attempt {} (after {:?})",
                        self.session_id, attempt, resume_after
                    );
                    self.subscription = Some(subscription);
                    return Ok(());
                }
                Err(err) => {
                    warn!("Session {} resubscribe attempt {} failed: {}", self.session_id, attempt, err);
                    last_error = err;
                }
            }
        }

        Err(Exit::Failed(last_error.into()))
    }

    async fn teardown(&mut self, exit: Exit) {
        let outcome = match &exit {
            Exit::Failed(err) => {
                error!("Session {} failed: {}", self.session_id, err);
                if let Some(machine) = self.machine.as_mut() {
                    machine.fail(err);
                }
                SessionOutcome::Failed
            }
            Exit::Cancelled | Exit::Disconnected => {
                info!("Session {} closing ({:?})", self.session_id, exit);
                if let Some(machine) = self.machine.as_mut() {
                    machine.close();
                }
                SessionOutcome::Closed
            }
        };

        if self.machine.is_some() {
            self.sync_negotiation();
        } else {
            let terminal = match outcome {
                SessionOutcome::Failed => NegotiationState::Failed,
                SessionOutcome::Closed => NegotiationState::Closed,
            };
            self.publish_negotiation(terminal);
        }

        let limit = self.config.release_step_timeout();
        let capture = release_within(limit, &self.session_id, "capture", self.media.release_capture()).await;
        let connection =
            release_within(limit, &self.session_id, "connection", self.media.release_connection()).await;
        let consumed = self.subscription.as_ref().and_then(SignalSubscription::last_order);
        let subscription = self.subscription.as_mut().is_some_and(|s| s.release());
        self.subscription = None;
        debug!(
            "Session {} released capture={} connection={} subscription={}",
            self.session_id, capture, connection, subscription
        );

        let tail = match tokio::time::timeout(limit, self.channel.tail(self.session_id.local())).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(err)) => {
                warn!("Session {} could not read inbox tail: {}", self.session_id, err);
                None
            }
            Err(_) => None,
        };
        if let Some(mark) = consumed.max(tail) {
            self.registry.record_resume_point(&self.session_id, mark);
        }

        self.registry.complete(&self.session_id, self.instance, outcome);

        let status = match exit {
            Exit::Failed(err) => SessionStatus::Failed(err.failure_reason()),
            Exit::Cancelled | Exit::Disconnected => SessionStatus::Closed,
        };
        self.set_status(status);
    }

    fn machine_mut(&mut self) -> Result<&mut NegotiationStateMachine, Exit> {
        self.machine
            .as_mut()
            .ok_or_else(|| Exit::Failed(SessionError::internal("negotiation not initialized")))
    }

    fn set_status(&self, status: SessionStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        info!("Session {} status {:?}", self.session_id, status);
        self.status_tx.send_replace(status.clone());
        self.events.status_changed(&self.session_id, self.role, status);
    }

    fn sync_negotiation(&self) {
        if let Some(machine) = self.machine.as_ref() {
            self.publish_negotiation(machine.state());
        }
    }

    fn publish_negotiation(&self, state: NegotiationState) {
        if *self.negotiation_tx.borrow() == state {
            return;
        }
        self.negotiation_tx.send_replace(state);
        self.events.negotiation_changed(&self.session_id, state);
    }
}

/// Run one release step, giving up on it after `limit`
async fn release_within<F>(limit: Duration, session_id: &SessionId, resource: &str, release: F) -> bool
where
    F: Future<Output = bool>,
{
    match tokio::time::timeout(limit, release).await {
        Ok(released) => released,
        Err(_) => {
            warn!("Session {} {} release exceeded {:?}, abandoning it", session_id, resource, limit);
            false
        }
    }
}

async fn next_signal(subscription: &mut Option<SignalSubscription>) -> Option<ReceivedSignal> {
    match subscription.as_mut() {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
