//! Offer/answer transition logic for one session.
//!
//! The machine is driven by a single owner (the session task), so every
//! transition happens on one logical timeline. It directs the peer
//! connection through a weak reference; the media controller owns it.

use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{NegotiationError, PendingCandidateQueue};
use crate::errors::{Result, SessionError};
use crate::media::PeerConnection;
use crate::signaling::{SignalChannel, SignalMessage};
use crate::types::{IceCandidate, NegotiationState, Role, SdpKind, SessionDescription, SessionId};

/// What a handled event asks of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Duplicate, stale or post-terminal input; nothing changed
    Ignored,
    /// The input was applied
    Applied,
    /// A candidate was buffered until the remote description is set
    Queued,
    /// The remote offer is applied; create and publish the local answer
    CreateLocalAnswer,
}

/// Counters kept by the machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationStats {
    pub offers_sent: u32,
    pub offers_received: u32,
    pub answers_sent: u32,
    pub answers_received: u32,
    pub candidates_applied: u64,
    pub candidates_queued: u64,
    pub candidates_published: u64,
}

pub struct NegotiationStateMachine {
    session_id: SessionId,
    role: Role,
    state: NegotiationState,
    pending: PendingCandidateQueue,
    connection: Weak<dyn PeerConnection>,
    channel: SignalChannel,
    remote_description_set: bool,
    candidate_publish_retries: u32,
    stats: NegotiationStats,
}

impl NegotiationStateMachine {
    pub fn new(
        session_id: SessionId,
        role: Role,
        connection: Weak<dyn PeerConnection>,
        channel: SignalChannel,
    ) -> Self {
        Self {
            session_id,
            role,
            state: NegotiationState::Idle,
            pending: PendingCandidateQueue::new(),
            connection,
            channel,
            remote_description_set: false,
            candidate_publish_retries: 0,
            stats: NegotiationStats::default(),
        }
    }

    /// Extra attempts for publishing a local candidate
    pub fn with_candidate_publish_retries(mut self, retries: u32) -> Self {
        self.candidate_publish_retries = retries;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> &PendingCandidateQueue {
        &self.pending
    }

    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// Offerer: `Idle -> AwaitingLocalOffer`
    pub fn start_negotiation(&mut self) -> Result<()> {
        if self.role != Role::Offerer || self.state != NegotiationState::Idle {
            let err = NegotiationError::out_of_sequence("start_negotiation", self.state);
            return self.settle(Err(err.into()));
        }
        self.transition(NegotiationState::AwaitingLocalOffer);
        Ok(())
    }

    /// Answerer: `Idle -> AwaitingRemoteOffer`
    pub fn await_remote_offer(&mut self) -> Result<()> {
        if self.role != Role::Answerer || self.state != NegotiationState::Idle {
            let err = NegotiationError::out_of_sequence("await_remote_offer", self.state);
            return self.settle(Err(err.into()));
        }
        self.transition(NegotiationState::AwaitingRemoteOffer);
        Ok(())
    }

    /// Apply the locally created offer and publish it: `AwaitingLocalOffer -> OfferSent`
    pub async fn on_local_offer(&mut self, offer: SessionDescription) -> Result<()> {
        let result = self.apply_local_offer(offer).await;
        self.settle(result)
    }

    async fn apply_local_offer(&mut self, offer: SessionDescription) -> Result<()> {
        match self.state {
            NegotiationState::AwaitingLocalOffer => {}
            NegotiationState::OfferSent | NegotiationState::AnswerReceived => {
                return Err(NegotiationError::DuplicateLocalOffer.into())
            }
            state => return Err(NegotiationError::out_of_sequence("local offer", state).into()),
        }
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::out_of_sequence("local answer", self.state).into());
        }

        self.connection()?
            .set_local_description(&offer)
            .await
            .map_err(NegotiationError::from)?;
        self.channel
            .send(self.session_id.remote(), &SignalMessage::Offer { sdp: offer.sdp })
            .await?;
        self.stats.offers_sent += 1;

        self.transition(NegotiationState::OfferSent);
        Ok(())
    }

    /// Apply the locally created answer and publish it: `OfferReceived -> AnswerSent`
    pub async fn on_local_answer(&mut self, answer: SessionDescription) -> Result<()> {
        let result = self.apply_local_answer(answer).await;
        self.settle(result)
    }

    async fn apply_local_answer(&mut self, answer: SessionDescription) -> Result<()> {
        match self.state {
            NegotiationState::OfferReceived => {}
            NegotiationState::AnswerSent => return Err(NegotiationError::DuplicateLocalAnswer.into()),
            state => return Err(NegotiationError::out_of_sequence("local answer", state).into()),
        }
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::out_of_sequence("local offer", self.state).into());
        }

        self.connection()?
            .set_local_description(&answer)
            .await
            .map_err(NegotiationError::from)?;
        self.channel
            .send(self.session_id.remote(), &SignalMessage::Answer { sdp: answer.sdp })
            .await?;
        self.stats.answers_sent += 1;

        self.transition(NegotiationState::AnswerSent);
        Ok(())
    }

    /// Handle one message from the local inbox
    pub async fn on_remote_message(&mut self, message: SignalMessage) -> Result<Reaction> {
        if self.state.is_terminal() {
            debug!(
                "Session {} ignoring {} in terminal state {}",
                self.session_id,
                message.kind(),
                self.state
            );
            return Ok(Reaction::Ignored);
        }

        let result = match message {
            SignalMessage::Offer { sdp } => self.handle_remote_offer(sdp).await,
            SignalMessage::Answer { sdp } => self.handle_remote_answer(sdp).await,
            SignalMessage::IceCandidate(candidate) => self.handle_remote_candidate(candidate).await,
        };
        self.settle(result)
    }

    async fn handle_remote_answer(&mut self, sdp: String) -> Result<Reaction> {
        match (self.role, self.state) {
            (Role::Offerer, NegotiationState::OfferSent) => {}
            (Role::Offerer, NegotiationState::AnswerReceived) => {
                debug!("Session {} ignoring duplicate answer", self.session_id);
                return Ok(Reaction::Ignored);
            }
            (_, state) => return Err(NegotiationError::out_of_sequence("remote answer", state).into()),
        }

        let answer = SessionDescription::parse(SdpKind::Answer, sdp)?;
        self.apply_remote_description(&answer).await?;
        self.stats.answers_received += 1;

        self.transition(NegotiationState::AnswerReceived);
        Ok(Reaction::Applied)
    }

    async fn handle_remote_offer(&mut self, sdp: String) -> Result<Reaction> {
        match (self.role, self.state) {
            (Role::Answerer, NegotiationState::AwaitingRemoteOffer) => {}
            (Role::Answerer, NegotiationState::OfferReceived | NegotiationState::AnswerSent) => {
                debug!("Session {} ignoring duplicate offer", self.session_id);
                return Ok(Reaction::Ignored);
            }
            (_, state) => return Err(NegotiationError::out_of_sequence("remote offer", state).into()),
        }

        let offer = SessionDescription::parse(SdpKind::Offer, sdp)?;
        self.apply_remote_description(&offer).await?;
        self.stats.offers_received += 1;

        self.transition(NegotiationState::OfferReceived);
        Ok(Reaction::CreateLocalAnswer)
    }

    /// Set the remote description, then drain buffered candidates in arrival
    /// order. Callers transition only after this returns.
    async fn apply_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        let connection = self.connection()?;
        connection
            .set_remote_description(description)
            .await
            .map_err(NegotiationError::from)?;
        self.remote_description_set = true;

        let buffered = self.pending.drain();
        if !buffered.is_empty() {
            debug!(
                "Session {} applying {} buffered candidate(s)",
                self.session_id,
                buffered.len()
            );
        }
        for candidate in buffered {
            connection
                .add_ice_candidate(&candidate)
                .await
                .map_err(NegotiationError::from)?;
            self.stats.candidates_applied += 1;
        }
        Ok(())
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> Result<Reaction> {
        if !self.remote_description_set {
            debug!(
                "Session {} buffering candidate {} until remote description is set",
                self.session_id, candidate
            );
            self.pending.push(candidate);
            self.stats.candidates_queued += 1;
            return Ok(Reaction::Queued);
        }

        self.connection()?
            .add_ice_candidate(&candidate)
            .await
            .map_err(NegotiationError::from)?;
        self.stats.candidates_applied += 1;
        Ok(Reaction::Applied)
    }

    /// Publish a locally gathered candidate to the remote party.
    ///
    /// Returns `false` when nothing was published. Exhausted retries fail the
    /// session until the exchange has completed; afterwards they are logged.
    pub async fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<bool> {
        if self.state.is_terminal() {
            return Ok(false);
        }

        let message = SignalMessage::IceCandidate(candidate);
        let mut attempt = 0;
        loop {
            match self.channel.send(self.session_id.remote(), &message).await {
                Ok(()) => {
                    self.stats.candidates_published += 1;
                    return Ok(true);
                }
                Err(err) if err.is_retryable() && attempt < self.candidate_publish_retries => {
                    attempt += 1;
                    debug!(
                        "Session {} retrying candidate publish ({}/{}): {}",
                        self.session_id, attempt, self.candidate_publish_retries, err
                    );
                }
                Err(err) if self.state.is_negotiated() => {
                    warn!("Session {} dropped local candidate: {}", self.session_id, err);
                    return Ok(false);
                }
                Err(err) => return self.settle(Err(err.into())),
            }
        }
    }

    /// Move to `Failed`. No-op once terminal.
    pub fn fail(&mut self, reason: &SessionError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("Session {} negotiation failed: {}", self.session_id, reason);
        self.pending.clear();
        self.transition(NegotiationState::Failed);
    }

    /// Move to `Closed`. Returns `false` if already terminal.
    pub fn close(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let dropped = self.pending.clear();
        if dropped > 0 {
            debug!("Session {} closed with {} buffered candidate(s)", self.session_id, dropped);
        }
        self.transition(NegotiationState::Closed);
        true
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    fn connection(&self) -> std::result::Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.connection.upgrade().ok_or(NegotiationError::ConnectionReleased)
    }

    fn transition(&mut self, next: NegotiationState) {
        info!("Session {} negotiation {} -> {}", self.session_id, self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::{LoopbackEngine, LoopbackFailure};
    use crate::media::{ConnectionConfig, PeerConnection, TransportEngine};
    use crate::signaling::MemoryRelay;
    use crate::types::PeerId;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        relay: MemoryRelay,
        engine: LoopbackEngine,
        connection: Arc<dyn PeerConnection>,
        machine: NegotiationStateMachine,
    }

    async fn fixture(role: Role) -> Fixture {
        let relay = MemoryRelay::new();
        let engine = LoopbackEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = engine
            .create_connection(&ConnectionConfig::default(), tx)
            .await
            .unwrap();
        let session_id = SessionId::new(PeerId::from("alice"), PeerId::from("bob")).unwrap();
        let channel = SignalChannel::new(Arc::new(relay.clone()), "signals");
        let machine = NegotiationStateMachine::new(session_id, role, Arc::downgrade(&connection), channel);
        Fixture {
            relay,
            engine,
            connection,
            machine,
        }
    }

    fn offer(sdp: &str) -> SessionDescription {
        SessionDescription::parse(SdpKind::Offer, sdp).unwrap()
    }

    fn candidate(n: u32) -> SignalMessage {
        SignalMessage::IceCandidate(IceCandidate::new("0", 0, format!("candidate:{} ...", n)))
    }

    async fn offer_sent(role: Role) -> Fixture {
        let mut f = fixture(role).await;
        f.machine.start_negotiation().unwrap();
        f.machine.on_local_offer(offer("v=0...A")).await.unwrap();
        f
    }

    #[tokio::test]
    async fn test_offer_published_to_remote_inbox() {
        let f = offer_sent(Role::Offerer).await;
        assert_eq!(f.machine.state(), NegotiationState::OfferSent);
        let entries = f.relay.entries("signals/bob");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, json!({"type": "offer", "sdp": "v=0...A"}));
        assert_eq!(f.machine.stats().offers_sent, 1);
    }

    #[tokio::test]
    async fn test_answer_then_candidate() {
        let mut f = offer_sent(Role::Offerer).await;
        let reaction = f
            .machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...B".to_string() })
            .await
            .unwrap();
        assert_eq!(reaction, Reaction::Applied);
        assert_eq!(f.machine.on_remote_message(candidate(1)).await.unwrap(), Reaction::Applied);

        assert_eq!(f.machine.state(), NegotiationState::AnswerReceived);
        let record = f.engine.connections()[0].record();
        assert_eq!(record.applied_candidates.len(), 1);
        assert_eq!(record.early_candidates, 0);
    }

    #[tokio::test]
    async fn test_candidate_before_answer_is_buffered() {
        let mut f = offer_sent(Role::Offerer).await;
        assert_eq!(f.machine.on_remote_message(candidate(1)).await.unwrap(), Reaction::Queued);
        assert_eq!(f.machine.state(), NegotiationState::OfferSent);
        assert_eq!(f.machine.pending_candidates().len(), 1);
        assert!(f.engine.connections()[0].record().applied_candidates.is_empty());

        f.machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...B".to_string() })
            .await
            .unwrap();
        assert_eq!(f.machine.state(), NegotiationState::AnswerReceived);
        assert!(f.machine.pending_candidates().is_empty());
        assert_eq!(f.engine.connections()[0].record().applied_candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let mut f = offer_sent(Role::Offerer).await;
        let answer = SignalMessage::Answer { sdp: "v=0...B".to_string() };
        f.machine.on_remote_message(answer.clone()).await.unwrap();
        assert_eq!(f.machine.on_remote_message(answer).await.unwrap(), Reaction::Ignored);
        assert_eq!(f.machine.state(), NegotiationState::AnswerReceived);
        assert_eq!(f.machine.stats().answers_received, 1);
        assert_eq!(f.engine.connections()[0].record().remote_descriptions_set, 1);
    }

    #[tokio::test]
    async fn test_malformed_answer_fails() {
        let mut f = offer_sent(Role::Offerer).await;
        let err = f
            .machine
            .on_remote_message(SignalMessage::Answer { sdp: "garbage".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::MalformedSdp { .. })));
        assert_eq!(f.machine.state(), NegotiationState::Failed);

        let after = f
            .machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...B".to_string() })
            .await
            .unwrap();
        assert_eq!(after, Reaction::Ignored);
        assert_eq!(f.machine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_local_offer_fails() {
        let mut f = offer_sent(Role::Offerer).await;
        let err = f.machine.on_local_offer(offer("v=0...C")).await.unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::DuplicateLocalOffer)));
        assert_eq!(f.machine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_offer() {
        let mut f = fixture(Role::Offerer).await;
        f.machine.start_negotiation().unwrap();
        f.relay.fail_next_appends(1);
        let err = f.machine.on_local_offer(offer("v=0...A")).await.unwrap_err();
        assert!(matches!(err, SessionError::Channel(_)));
        assert_eq!(f.machine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_set_remote_failure_fails() {
        let mut f = offer_sent(Role::Offerer).await;
        f.engine.fail(LoopbackFailure::SetRemoteDescription);
        let err = f
            .machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...B".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::Engine { .. })));
        assert_eq!(f.machine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_offer_to_offerer_is_out_of_sequence() {
        let mut f = offer_sent(Role::Offerer).await;
        let err = f
            .machine
            .on_remote_message(SignalMessage::Offer { sdp: "v=0...X".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::OutOfSequence { .. })));
    }

    #[tokio::test]
    async fn test_answerer_flow() {
        let mut f = fixture(Role::Answerer).await;
        f.machine.await_remote_offer().unwrap();
        assert_eq!(f.machine.on_remote_message(candidate(7)).await.unwrap(), Reaction::Queued);

        let reaction = f
            .machine
            .on_remote_message(SignalMessage::Offer { sdp: "v=0...A".to_string() })
            .await
            .unwrap();
        assert_eq!(reaction, Reaction::CreateLocalAnswer);
        assert_eq!(f.machine.state(), NegotiationState::OfferReceived);
        assert_eq!(f.engine.connections()[0].record().applied_candidates.len(), 1);

        let answer = SessionDescription::parse(SdpKind::Answer, "v=0...B").unwrap();
        f.machine.on_local_answer(answer).await.unwrap();
        assert_eq!(f.machine.state(), NegotiationState::AnswerSent);
        assert_eq!(
            f.relay.entries("signals/bob")[0].value,
            json!({"type": "answer", "sdp": "v=0...B"})
        );

        let duplicate = f
            .machine
            .on_remote_message(SignalMessage::Offer { sdp: "v=0...A".to_string() })
            .await
            .unwrap();
        assert_eq!(duplicate, Reaction::Ignored);

        let err = f
            .machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...Z".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::OutOfSequence { .. })));
    }

    #[tokio::test]
    async fn test_local_candidate_retries_then_fails_before_answer() {
        let mut f = fixture(Role::Offerer).await;
        f.machine = f.machine.with_candidate_publish_retries(1);
        f.machine.start_negotiation().unwrap();
        f.machine.on_local_offer(offer("v=0...A")).await.unwrap();

        f.relay.fail_next_appends(1);
        assert!(f.machine.on_local_candidate(IceCandidate::new("0", 0, "c1")).await.unwrap());

        f.relay.fail_next_appends(2);
        assert!(f.machine.on_local_candidate(IceCandidate::new("0", 0, "c2")).await.is_err());
        assert_eq!(f.machine.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_local_candidate_failure_after_answer_is_logged() {
        let mut f = offer_sent(Role::Offerer).await;
        f.machine
            .on_remote_message(SignalMessage::Answer { sdp: "v=0...B".to_string() })
            .await
            .unwrap();
        f.relay.fail_next_appends(1);
        assert!(!f.machine.on_local_candidate(IceCandidate::new("0", 0, "c1")).await.unwrap());
        assert_eq!(f.machine.state(), NegotiationState::AnswerReceived);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut f = offer_sent(Role::Offerer).await;
        f.machine.on_remote_message(candidate(1)).await.unwrap();
        assert!(f.machine.close());
        assert!(!f.machine.close());
        assert_eq!(f.machine.state(), NegotiationState::Closed);
        assert!(f.machine.pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_released_connection() {
        let mut f = fixture(Role::Offerer).await;
        f.machine.start_negotiation().unwrap();
        drop(f.connection);
        f.engine.forget_connections();
        let err = f.machine.on_local_offer(offer("v=0...A")).await.unwrap_err();
        assert!(matches!(err, SessionError::Negotiation(NegotiationError::ConnectionReleased)));
    }
}
