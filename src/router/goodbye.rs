//! Tears down a disconnecting (or monitor-transitioning) peer (spec §4.H).

use zbus::{fdo, names::OwnedUniqueName};

use super::{peer::PeerState, Router};

impl Router {
    /// `silent` suppresses every `NameOwnerChanged`/`NameLost`/`NameAcquired` emission; used for
    /// the `BecomeMonitor` transition, where the peer stays connected under a new identity.
    pub(crate) async fn goodbye(&mut self, unique_name: &OwnedUniqueName, silent: bool) {
        self.matches.remove_all(unique_name);
        self.replies.free_for_sender(unique_name);

        let owner: zbus::names::UniqueName<'_> = unique_name.as_ref().into();
        let changes = self.names.release_all(&owner);
        for change in changes {
            if silent {
                continue;
            }
            self.apply_name_change(change).await;
        }

        let was_registered = self
            .peers
            .get(unique_name)
            .is_some_and(|p| p.state != PeerState::Unregistered);
        if was_registered && !silent {
            self.emit_unique_name_lost(unique_name);
        }
        if let Some(peer) = self.peers.get_mut(unique_name) {
            peer.state = PeerState::Unregistered;
        }

        for (sender, call) in self.replies.take_all_for_responder(unique_name) {
            if silent {
                continue;
            }
            let header = call.header();
            if let Some(msg) = super::wire::error_reply(
                &header,
                &fdo::Error::NoReply("Remote peer disconnected".into()),
            ) {
                self.send_to(&sender, msg);
            }
        }
    }
}
