//! The router: the single task that owns all bus state and dispatches every inbound message
//! (spec §4.F, §5). No part of this module ever awaits while holding state — peer I/O happens
//! on separate per-connection tasks that only move already-built [`zbus::Message`]s across
//! channels.

pub mod activation;
pub mod driver;
mod error;
mod goodbye;
pub mod match_registry;
mod monitor;
pub mod name_registry;
mod notifier;
pub mod peer;
pub mod reply_registry;
mod wire;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, trace, warn};
use zbus::{
    names::{BusName, OwnedUniqueName},
    Guid, Message, MessageType,
};

use crate::controller::{ControllerEvent, ControllerHandle};

pub use self::error::ErrorKind;
use self::{
    match_registry::MatchRegistry, name_registry::NameRegistry, peer::Peer,
    reply_registry::ReplyRegistry,
};

/// Everything that crosses from a peer's I/O task into the router.
#[derive(Debug)]
pub enum RouterEvent {
    Connected(Box<Peer>),
    Inbound {
        from: OwnedUniqueName,
        message: Arc<Message>,
    },
    Disconnected(OwnedUniqueName),
}

pub struct Router {
    pub(crate) guid: Arc<Guid>,
    pub(crate) peers: HashMap<OwnedUniqueName, Peer>,
    pub(crate) names: NameRegistry,
    pub(crate) matches: MatchRegistry,
    pub(crate) replies: ReplyRegistry,
    pub(crate) controller: ControllerHandle,
    events: Receiver<RouterEvent>,
}

impl Router {
    pub fn new(guid: Arc<Guid>, events: Receiver<RouterEvent>, controller: ControllerHandle) -> Self {
        Self {
            guid,
            peers: HashMap::new(),
            names: NameRegistry::new(),
            matches: MatchRegistry::new(),
            replies: ReplyRegistry::new(),
            controller,
            events,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("router event channel closed, shutting down");
                        break;
                    }
                },
                event = self.controller.events.recv() => match event {
                    Some(event) => self.handle_controller_event(event).await,
                    None => trace!("controller channel closed"),
                },
            }
        }
    }

    async fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected(peer) => {
                debug!("peer {} connected", peer.unique_name);
                self.peers.insert(peer.unique_name.clone(), *peer);
            }
            RouterEvent::Inbound { from, message } => {
                if let Err(kind) = self.dispatch(&from, message.clone()).await {
                    self.handle_dispatch_error(&from, &message, kind);
                }
            }
            RouterEvent::Disconnected(unique_name) => {
                debug!("peer {} disconnected", unique_name);
                self.goodbye(&unique_name, false).await;
            }
        }
    }

    /// Map a dispatch failure onto either a transport drop or a DBus error reply (spec §4.F
    /// closing paragraph, §7 tier 1/2).
    fn handle_dispatch_error(&mut self, from: &OwnedUniqueName, message: &Arc<Message>, kind: ErrorKind) {
        if kind.is_fatal() {
            warn!("protocol violation from {}: {}", from, kind);
            self.peers.remove(from);
            return;
        }

        let header = message.header();
        if message
            .primary_header()
            .flags()
            .contains(zbus::MessageFlags::NoReplyExpected)
        {
            // NO_REPLY_EXPECTED shortcut (spec §4.A): never synthesize an error either.
            return;
        }

        warn!("rejecting message from {}: {}", from, kind);
        if let Some(reply) = wire::error_reply(&header, &kind.dbus_error()) {
            self.send_to(from, reply);
        }
    }

    async fn handle_controller_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::ReloadConfigCompleted { call } => {
                self.reply_empty(&call);
            }
            ControllerEvent::ReloadConfigInvalid { call, message } => {
                self.reply_error(&call, &zbus::fdo::Error::Failed(message));
            }
            ControllerEvent::EnvironmentUpdated { call } => {
                self.reply_empty(&call);
            }
            ControllerEvent::ActivationSucceeded { name } => {
                self.activation_succeeded(name).await;
            }
            ControllerEvent::ActivationFailed { name, message } => {
                self.activation_failed(name, message);
            }
        }
    }

    /// Enqueue `message` for `destination`, disconnecting it on quota per spec §5.
    pub(crate) fn send_to(&mut self, destination: &OwnedUniqueName, message: Arc<Message>) {
        let Some(peer) = self.peers.get(destination) else {
            return;
        };

        if peer.enqueue(message).is_err() {
            warn!("{} exceeded its outbound quota, disconnecting", destination);
            self.peers.remove(destination);
        }
    }

    fn reply_to(&mut self, call: &Arc<Message>, body: &(impl serde::Serialize + zbus::zvariant::DynamicType)) {
        let header = call.header();
        let Some(destination) = wire::sender_of(call) else { return };
        if let Some(msg) = wire::method_return(&header, body) {
            self.send_to(&destination, msg);
        }
    }

    fn reply_empty(&mut self, call: &Arc<Message>) {
        self.reply_to(call, &());
    }

    fn reply_error(&mut self, call: &Arc<Message>, err: &zbus::fdo::Error) {
        let header = call.header();
        let Some(destination) = wire::sender_of(call) else { return };
        if let Some(msg) = wire::error_reply(&header, err) {
            self.send_to(&destination, msg);
        }
    }
}

/// Whether a message type participates in broadcast fan-out vs. unicast forwarding (spec §4.F).
pub(crate) fn is_broadcastable(message_type: MessageType) -> bool {
    matches!(message_type, MessageType::Signal)
}

pub(crate) fn bus_name_eq(a: &BusName<'_>, b: &str) -> bool {
    a.as_str() == b
}
