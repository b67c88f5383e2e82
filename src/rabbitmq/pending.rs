use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use uuid::Uuid;

use super::envelope::Envelope;
use super::errors::{BrokerError, Result};

pub type ReplySlot = oneshot::Sender<Result<Envelope>>;
pub type ReplyReceiver = oneshot::Receiver<Result<Envelope>>;

/// In-flight RPC calls keyed by correlation id.
///
/// Every way a call can end (reply, timeout, cancel, lost connection) goes through
/// `claim`, which removes the entry under the lock. Only the first claimant gets
/// the slot, so a call is resolved exactly once.
#[derive(Default)]
pub struct PendingCalls {
    slots: Mutex<HashMap<String, ReplySlot>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, ReplySlot>> {
        // The map stays consistent even if a holder panicked; every operation is a
        // single insert or remove.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call under a fresh random correlation id.
    pub fn register(&self) -> (String, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots();
        let correlation_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        slots.insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    /// Remove the entry for `correlation_id`, returning its slot if nobody else
    /// claimed it first.
    pub fn claim(&self, correlation_id: &str) -> Option<ReplySlot> {
        self.slots().remove(correlation_id)
    }

    /// Deliver a reply. Returns false when the call already ended.
    pub fn complete(&self, correlation_id: &str, reply: Envelope) -> bool {
        self.resolve(correlation_id, Ok(reply))
    }

    /// Fail a call. Returns false when the call already ended.
    pub fn fail(&self, correlation_id: &str, error: BrokerError) -> bool {
        self.resolve(correlation_id, Err(error))
    }

    fn resolve(&self, correlation_id: &str, outcome: Result<Envelope>) -> bool {
        match self.claim(correlation_id) {
            // The receiver may be gone if the caller was dropped; the claim still counts.
            Some(slot) => {
                let _ = slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// End a call from the waiting side with `error`, unless a reply already won the
    /// claim, in which case that reply is returned.
    pub fn settle(&self, correlation_id: &str, receiver: &mut ReplyReceiver, error: BrokerError) -> Result<Envelope> {
        if self.claim(correlation_id).is_some() {
            return Err(error);
        }
        match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(error),
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.slots().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}
