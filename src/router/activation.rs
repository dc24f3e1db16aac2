use std::{collections::VecDeque, sync::Arc};

use zbus::Message;

use super::peer::PeerSnapshot;

/// An explicit `StartServiceByName` call awaiting the name's activation to complete. Keeps the
/// original call so the eventual reply can be built from its real header.
#[derive(Clone, Debug)]
pub struct ActivationRequest {
    pub call: Arc<Message>,
}

/// A message captured because its destination name has no current owner but is activatable.
#[derive(Clone, Debug)]
pub struct ActivationMessage {
    pub message: Arc<Message>,
    pub sender_snapshot: PeerSnapshot,
}

/// On-demand-activation state associated with a well-known name (spec §3 "Activation").
#[derive(Debug, Default)]
pub struct Activation {
    /// Whether the controller has already been asked to start this service.
    pub requested: bool,
    pub requests: VecDeque<ActivationRequest>,
    pub messages: VecDeque<ActivationMessage>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> (VecDeque<ActivationRequest>, VecDeque<ActivationMessage>) {
        self.requested = false;
        (
            std::mem::take(&mut self.requests),
            std::mem::take(&mut self.messages),
        )
    }
}
