//! Candidates received before the remote description was applied.

use std::collections::VecDeque;

use crate::types::IceCandidate;

/// Arrival-ordered buffer of remote candidates.
///
/// Entries leave only through [`drain`](Self::drain) or [`clear`](Self::clear)
/// on teardown.
#[derive(Debug, Default, Clone)]
pub struct PendingCandidateQueue {
    candidates: VecDeque<IceCandidate>,
    total_queued: u64,
}

impl PendingCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.candidates.push_back(candidate);
        self.total_queued += 1;
    }

    /// Remove every buffered candidate, oldest first
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.candidates.drain(..).collect()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.candidates.len();
        self.candidates.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates ever buffered
    pub fn total_queued(&self) -> u64 {
        self.total_queued
    }

    pub fn iter(&self) -> impl Iterator<Item = &IceCandidate> {
        self.candidates.iter()
    }
}
