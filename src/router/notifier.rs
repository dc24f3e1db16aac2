//! Emits `NameOwnerChanged`/`NameAcquired`/`NameLost` and drains completed activations (spec
//! §4.D).

use zbus::{
    fdo,
    names::{OwnedUniqueName, OwnedWellKnownName},
};

use super::{
    activation::{ActivationMessage, ActivationRequest},
    name_registry::{NameChange, DRIVER_NAME},
    wire, Router,
};

const DBUS_IFACE: &str = "org.freedesktop.DBus";
const DRIVER_PATH: &str = "/org/freedesktop/DBus";

impl Router {
    /// Applies one name-ownership transition: `NameLost` to the old owner, broadcast
    /// `NameOwnerChanged`, `NameAcquired` to the new owner, then any activation drain the
    /// transition completes.
    pub(crate) async fn apply_name_change(&mut self, change: NameChange) {
        if let Some(old) = &change.old_owner {
            self.unicast_driver_signal(old, "NameLost", &change.name.as_str());
        }

        self.broadcast_name_owner_changed(
            change.name.as_str(),
            change.old_owner.as_ref().map(|o| o.as_str()).unwrap_or(""),
            change.new_owner.as_ref().map(|o| o.as_str()).unwrap_or(""),
        );

        if let Some(new) = &change.new_owner {
            self.unicast_driver_signal(new, "NameAcquired", &change.name.as_str());
            self.drain_activation(&change.name).await;
        }
    }

    /// `Hello`'s special case: a unique name is never owned through [`NameChange`], but still
    /// gets the same broadcast/`NameAcquired` pair the moment it's assigned.
    pub(crate) async fn emit_unique_name_acquired(&mut self, unique: &OwnedUniqueName) {
        self.broadcast_name_owner_changed(unique.as_str(), "", unique.as_str());
        self.unicast_driver_signal(unique, "NameAcquired", unique.as_str());
    }

    /// The mirror image, on disconnect: broadcast `NameOwnerChanged(unique, unique, "")`. No
    /// `NameLost` unicast — the peer is already gone.
    pub(crate) fn emit_unique_name_lost(&mut self, unique: &OwnedUniqueName) {
        self.broadcast_name_owner_changed(unique.as_str(), unique.as_str(), "");
    }

    fn broadcast_name_owner_changed(&mut self, name: &str, old_owner: &str, new_owner: &str) {
        let Some(msg) = wire::signal(
            DRIVER_PATH,
            DBUS_IFACE,
            "NameOwnerChanged",
            None,
            &(name, old_owner, new_owner),
        ) else {
            return;
        };

        self.mirror_driver_signal(&msg);

        let candidates = self.matches.matching_peers(&msg, &self.names);
        for candidate in candidates {
            let Some(peer) = self.peers.get(&candidate) else {
                continue;
            };
            let query = crate::policy::ReceiveQuery {
                sender: Some(DRIVER_NAME),
                interface: Some(DBUS_IFACE),
                member: Some("NameOwnerChanged"),
                path: Some(DRIVER_PATH),
                message_type: Some(crate::policy::MessageKind::Signal),
            };
            if !peer.policy.allows_receive(&query) {
                continue;
            }

            self.send_to(&candidate, msg.clone());
        }
    }

    fn unicast_driver_signal(&mut self, destination: &OwnedUniqueName, member: &str, name: &str) {
        let dest: zbus::names::UniqueName<'_> = destination.as_ref().into();
        let Some(msg) = wire::signal(DRIVER_PATH, DBUS_IFACE, member, Some(&dest), &(name,)) else {
            return;
        };

        self.mirror_driver_signal(&msg);
        self.send_to(destination, msg);
    }

    /// Drains a name's activation queue once it gains an owner (spec §4.D).
    async fn drain_activation(&mut self, name: &OwnedWellKnownName) {
        let wk: zbus::names::WellKnownName<'_> = name.as_ref().into();
        let Some(activation) = self.names.activation_mut(&wk) else {
            return;
        };
        let (requests, messages) = activation.drain();

        for ActivationRequest { call } in requests {
            self.reply_activation_request(call);
        }

        for ActivationMessage { message, sender_snapshot } in messages {
            self.deliver_activation_message(message, sender_snapshot).await;
        }
    }

    /// `u = START_REPLY_SUCCESS` (1), per the `StartServiceByName` reply codes (spec §4.C).
    fn reply_activation_request(&mut self, call: std::sync::Arc<zbus::Message>) {
        let header = call.header();
        let Some(destination) = wire::sender_of(&call) else {
            return;
        };
        if let Some(msg) = wire::method_return(&header, &1u32) {
            self.send_to(&destination, msg);
        }
    }

    async fn deliver_activation_message(
        &mut self,
        message: std::sync::Arc<zbus::Message>,
        sender_snapshot: super::peer::PeerSnapshot,
    ) {
        if let Err(kind) = self.unicast_with_snapshot(&sender_snapshot, message.clone()) {
            let dbus_error = match kind {
                super::error::ErrorKind::Quota => fdo::Error::LimitsExceeded("Peer exceeded its message quota.".into()),
                super::error::ErrorKind::ExpectedReplyExists => {
                    fdo::Error::AccessDenied("A reply to this serial is already expected from this peer.".into())
                }
                super::error::ErrorKind::SendDenied | super::error::ErrorKind::ReceiveDenied => {
                    fdo::Error::AccessDenied("Rejected message.".into())
                }
                other => other.dbus_error(),
            };
            let header = message.header();
            if let Some(reply) = wire::error_reply(&header, &dbus_error) {
                self.send_to(&sender_snapshot.unique_name, reply);
            }
        }
    }

    /// Activation failed on the controller's side (spec §4.D last paragraph): every queued
    /// request/message's sender learns the name will never appear.
    pub(crate) fn activation_failed(&mut self, name: OwnedWellKnownName, _message: String) {
        let wk: zbus::names::WellKnownName<'_> = name.as_ref().into();
        let Some(activation) = self.names.activation_mut(&wk) else {
            return;
        };
        let (requests, messages) = activation.drain();

        for ActivationRequest { call } in requests {
            let header = call.header();
            let Some(destination) = wire::sender_of(&call) else {
                continue;
            };
            let error = fdo::Error::ServiceUnknown(format!(
                "The name {name} was not provided by any .service files"
            ));
            if let Some(msg) = wire::error_reply(&header, &error) {
                self.send_to(&destination, msg);
            }
        }

        for ActivationMessage { message, sender_snapshot } in messages {
            let header = message.header();
            if let Some(reply) = wire::error_reply(
                &header,
                &fdo::Error::NameHasNoOwner(format!("Name {name} has no owner and could not be activated.")),
            ) {
                self.send_to(&sender_snapshot.unique_name, reply);
            }
        }
    }

    /// Activation succeeded: nothing to do here directly, the new owner taking `RequestName`
    /// will trigger [`Router::apply_name_change`], which drains the queue.
    pub(crate) async fn activation_succeeded(&mut self, _name: OwnedWellKnownName) {}
}
