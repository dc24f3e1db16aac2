use std::sync::Arc;

use tokio::sync::mpsc::{error::TrySendError, Sender};
use zbus::{names::OwnedUniqueName, Message};

use crate::policy::PolicySnapshot;

/// Outbound-queue capacity per peer. Exceeding this is a quota violation (spec §5).
pub const PEER_QUEUE_CAPACITY: usize = 256;
/// Maximum match rules a single peer may register (spec §3 "quota-counted").
pub const MAX_MATCH_RULES_PER_PEER: usize = 256;
/// Maximum messages an activation may buffer on behalf of one blocked sender (spec §3).
pub const MAX_QUEUED_ACTIVATION_MESSAGES: usize = 64;

/// A connected peer's lifecycle state (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Unregistered,
    Registered,
    Monitor,
}

/// Authenticated identity of a connection, established at accept time.
#[derive(Clone, Debug)]
pub struct Identity {
    pub uid: u32,
    pub pid: Option<u32>,
    pub security_label: Option<Vec<u8>>,
}

/// A frozen view of a peer's names/policy/uid, captured when a message is parked in an
/// activation queue (spec §3 "ActivationMessage" — delivered with the snapshot taken at
/// capture time, not the sender's current state).
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub unique_name: OwnedUniqueName,
    pub identity: Identity,
    pub policy: PolicySnapshot,
}

/// A connected client, as tracked by the router.
#[derive(Debug)]
pub struct Peer {
    pub id: usize,
    pub unique_name: OwnedUniqueName,
    pub identity: Identity,
    pub policy: PolicySnapshot,
    pub state: PeerState,
    sender: Sender<Arc<Message>>,
}

impl Peer {
    pub fn new(
        id: usize,
        unique_name: OwnedUniqueName,
        identity: Identity,
        policy: PolicySnapshot,
        sender: Sender<Arc<Message>>,
    ) -> Self {
        Self {
            id,
            unique_name,
            identity,
            policy,
            state: PeerState::Unregistered,
            sender,
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            unique_name: self.unique_name.clone(),
            identity: self.identity.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Enqueue a message for delivery, non-blocking (spec §5: handlers never await on peer I/O).
    pub fn enqueue(&self, msg: Arc<Message>) -> Result<(), EnqueueError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Quota,
            TrySendError::Closed(_) => EnqueueError::Disconnected,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.state == PeerState::Registered
    }

    pub fn is_monitor(&self) -> bool {
        self.state == PeerState::Monitor
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    Quota,
    Disconnected,
}
