//! Mirrors routed messages to subscribed monitor peers (spec §4.E).

use std::sync::Arc;

use tracing::warn;
use zbus::{names::OwnedUniqueName, Message};

use super::Router;

impl Router {
    /// Invariant: called before any real delivery of `message`, including messages addressed to
    /// the driver itself. A monitor over its quota is disconnected; routing continues regardless.
    pub(crate) fn mirror_to_monitors(&mut self, from: &OwnedUniqueName, message: &Arc<Message>) {
        self.mirror_to_monitors_except(message, Some(from));
    }

    /// Same mirroring, for signals the driver itself emits (spec §4.D), which have no peer
    /// sender to exclude.
    pub(crate) fn mirror_driver_signal(&mut self, message: &Arc<Message>) {
        self.mirror_to_monitors_except(message, None);
    }

    fn mirror_to_monitors_except(&mut self, message: &Arc<Message>, from: Option<&OwnedUniqueName>) {
        let candidates = self.matches.matching_peers(message, &self.names);
        for candidate in candidates {
            if !self.peers.get(&candidate).is_some_and(super::peer::Peer::is_monitor) {
                continue;
            }
            if Some(&candidate) == from {
                continue;
            }

            self.deliver_to_monitor(&candidate, message);
        }
    }

    pub(crate) fn deliver_to_monitor(&mut self, monitor: &OwnedUniqueName, message: &Arc<Message>) {
        let Some(peer) = self.peers.get(monitor) else {
            return;
        };
        if peer.enqueue(message.clone()).is_err() {
            warn!("monitor {} exceeded its quota, disconnecting", monitor);
            self.peers.remove(monitor);
        }
    }
}
