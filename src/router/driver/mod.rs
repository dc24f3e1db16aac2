//! The `org.freedesktop.DBus` driver: the static method table (spec §4.B) and the top-level
//! message dispatcher (spec §4.F). The two live together because the dispatcher is what decides
//! whether a message is destined for the driver at all.

mod introspect;
mod methods;

use std::sync::Arc;

use tracing::warn;
use zbus::{
    message::{Header, Type as MessageType},
    names::{BusName, OwnedUniqueName},
    Message, MessageFlags,
};

use super::{
    activation::ActivationMessage,
    error::ErrorKind,
    name_registry::DRIVER_NAME,
    peer::{Peer, MAX_QUEUED_ACTIVATION_MESSAGES},
    Router,
};
use crate::{
    controller::ControllerRequest,
    policy::{MessageKind, ReceiveQuery, SendQuery},
};

pub(crate) const DRIVER_PATH: &str = "/org/freedesktop/DBus";

/// One entry of the driver's method table (spec §4.B).
#[derive(Clone, Copy, Debug)]
pub(crate) struct MethodEntry {
    pub interface: &'static str,
    pub member: &'static str,
    pub needs_registration: bool,
    pub required_path: Option<&'static str>,
}

macro_rules! entry {
    ($interface:expr, $member:expr, $needs_registration:expr) => {
        MethodEntry {
            interface: $interface,
            member: $member,
            needs_registration: $needs_registration,
            required_path: None,
        }
    };
    ($interface:expr, $member:expr, $needs_registration:expr, $path:expr) => {
        MethodEntry {
            interface: $interface,
            member: $member,
            needs_registration: $needs_registration,
            required_path: Some($path),
        }
    };
}

const DBUS_IFACE: &str = "org.freedesktop.DBus";
const MONITORING_IFACE: &str = "org.freedesktop.DBus.Monitoring";
const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

static METHOD_TABLE: &[MethodEntry] = &[
    entry!(DBUS_IFACE, "Hello", false, DRIVER_PATH),
    entry!(DBUS_IFACE, "RequestName", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "ReleaseName", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "ListQueuedOwners", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "ListNames", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "ListActivatableNames", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "NameHasOwner", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "StartServiceByName", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "UpdateActivationEnvironment", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetNameOwner", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetConnectionUnixUser", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetConnectionUnixProcessID", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetConnectionCredentials", true, DRIVER_PATH),
    entry!(
        DBUS_IFACE,
        "GetConnectionSELinuxSecurityContext",
        true,
        DRIVER_PATH
    ),
    entry!(DBUS_IFACE, "GetAdtAuditSessionData", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "AddMatch", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "RemoveMatch", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "ReloadConfig", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetId", true, DRIVER_PATH),
    entry!(DBUS_IFACE, "GetMachineId", true, DRIVER_PATH),
    entry!(MONITORING_IFACE, "BecomeMonitor", true, DRIVER_PATH),
    entry!(INTROSPECTABLE_IFACE, "Introspect", false),
    entry!(PEER_IFACE, "Ping", false),
    entry!(PEER_IFACE, "GetMachineId", false),
    entry!(PROPERTIES_IFACE, "Get", true, DRIVER_PATH),
    entry!(PROPERTIES_IFACE, "Set", true, DRIVER_PATH),
    entry!(PROPERTIES_IFACE, "GetAll", true, DRIVER_PATH),
];

/// Linear scan by name (spec §4.B): if an interface was supplied, only entries for that
/// interface are considered; otherwise every interface is scanned and the first match wins.
fn lookup(interface: Option<&str>, member: &str) -> Option<&'static MethodEntry> {
    match interface {
        Some(iface) => METHOD_TABLE
            .iter()
            .find(|e| e.interface == iface && e.member == member),
        None => METHOD_TABLE.iter().find(|e| e.member == member),
    }
}

impl Router {
    /// Entry point `dispatch(peer, message)` (spec §4.F).
    pub(crate) async fn dispatch(
        &mut self,
        from: &OwnedUniqueName,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        if self.peers.get(from).is_some_and(Peer::is_monitor) {
            return Err(ErrorKind::ProtocolViolation(
                "a monitor peer sent a message".into(),
            ));
        }

        let header = message.header();
        let message_type = message.message_type();

        // Mirror to monitors before any real delivery (spec §4.E).
        self.mirror_to_monitors(from, &message);

        let destination = header.destination().cloned();

        if destination.is_none() && message_type == MessageType::MethodCall {
            return self.dispatch_peer_interface(from, &header, &message).await;
        }

        if matches!(&destination, Some(d) if bus_name_is_driver(d)) {
            let query = SendQuery {
                destination: Some(DRIVER_NAME),
                interface: header.interface().map(|i| i.as_str()),
                member: header.member().map(|m| m.as_str()),
                path: header.path().map(|p| p.as_str()),
                message_type: Some(message_kind_of(message_type)),
                broadcast: false,
            };
            if !self.policy_for(from).allows_send(&query) {
                warn!("{} denied sending to the driver", from);
                return Err(ErrorKind::SendDenied);
            }

            return match self.dispatch_to_driver(from, &header, &message).await {
                Err(ErrorKind::UnexpectedInterface(_) | ErrorKind::UnexpectedMethod(_))
                    if !self.peers.get(from).is_some_and(Peer::is_registered) =>
                {
                    Err(ErrorKind::PeerNotYetRegistered)
                }
                other => other,
            };
        }

        if !self.peers.get(from).is_some_and(Peer::is_registered) {
            return Err(ErrorKind::PeerNotRegistered);
        }

        match (destination, message_type) {
            (None, MessageType::Signal) => self.broadcast(from, &header, message.clone()),
            (None, _) => Err(ErrorKind::UnexpectedMessageType),
            (Some(_), MessageType::Signal | MessageType::MethodCall) => {
                self.unicast(from, &header, message.clone()).await
            }
            (Some(_), MessageType::MethodReturn | MessageType::Error) => {
                self.route_reply(from, &header, message.clone())
            }
            _ => Err(ErrorKind::UnexpectedMessageType),
        }
    }

    async fn dispatch_peer_interface(
        &mut self,
        from: &OwnedUniqueName,
        header: &Header<'_>,
        message: &Arc<Message>,
    ) -> Result<(), ErrorKind> {
        if header.interface().map(|i| i.as_str()) != Some(PEER_IFACE) {
            return Err(ErrorKind::UnexpectedMethod(
                header.member().map(|m| m.to_string()).unwrap_or_default(),
            ));
        }

        self.dispatch_to_driver(from, header, message).await
    }

    /// Dispatch within the driver's own interfaces (spec §4.B/§4.C).
    async fn dispatch_to_driver(
        &mut self,
        from: &OwnedUniqueName,
        header: &Header<'_>,
        message: &Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let member = header
            .member()
            .ok_or_else(|| ErrorKind::ProtocolViolation("method call without a member".into()))?
            .as_str();
        let interface = header.interface().map(|i| i.as_str());

        let entry = *lookup(interface, member).ok_or_else(|| match interface {
            Some(iface) if !METHOD_TABLE.iter().any(|e| e.interface == iface) => {
                ErrorKind::UnexpectedInterface(iface.to_string())
            }
            _ => ErrorKind::UnexpectedMethod(member.to_string()),
        })?;

        if entry.needs_registration && !self.peers.get(from).is_some_and(Peer::is_registered) {
            return Err(ErrorKind::PeerNotYetRegistered);
        }

        if let Some(required) = entry.required_path {
            if header.path().map(|p| p.as_str()) != Some(required) {
                return Err(ErrorKind::UnexpectedPath);
            }
        }

        methods::call(self, from, &entry, header, message).await
    }

    fn policy_for(&self, from: &OwnedUniqueName) -> crate::policy::PolicySnapshot {
        self.peers
            .get(from)
            .map(|p| p.policy.clone())
            .unwrap_or_else(crate::policy::PolicySnapshot::unrestricted)
    }

    fn broadcast(
        &mut self,
        from: &OwnedUniqueName,
        header: &Header<'_>,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let interface = header.interface().map(|i| i.as_str());
        let member = header.member().map(|m| m.as_str());
        let path = header.path().map(|p| p.as_str());

        let send_query = SendQuery {
            destination: None,
            interface,
            member,
            path,
            message_type: Some(MessageKind::Signal),
            broadcast: true,
        };
        if !self.policy_for(from).allows_send(&send_query) {
            return Err(ErrorKind::SendDenied);
        }

        let candidates = self.matches.matching_peers(&message, &self.names);
        for candidate in candidates {
            if candidate == *from {
                continue;
            }
            let Some(peer) = self.peers.get(&candidate) else {
                continue;
            };

            let recv_query = ReceiveQuery {
                sender: Some(from.as_str()),
                interface,
                member,
                path,
                message_type: Some(MessageKind::Signal),
            };
            if !peer.policy.allows_receive(&recv_query) {
                continue;
            }

            if peer.enqueue(message.clone()).is_err() {
                warn!("{} exceeded its quota receiving a broadcast, disconnecting", candidate);
                self.peers.remove(&candidate);
            }
        }

        Ok(())
    }

    async fn unicast(
        &mut self,
        from: &OwnedUniqueName,
        header: &Header<'_>,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let destination = header
            .destination()
            .cloned()
            .ok_or_else(|| ErrorKind::ProtocolViolation("missing destination".into()))?;
        let flags = message.primary_header().flags();

        let send_query = send_query_for(header, &destination, message.message_type());
        if !self.policy_for(from).allows_send(&send_query) {
            return Err(ErrorKind::SendDenied);
        }

        if let Some(unique) = self.resolve_destination(&destination) {
            return self.unicast_to_live_peer(from, &send_query, &unique, message);
        }

        let BusName::WellKnown(well_known) = &destination else {
            return Err(ErrorKind::DestinationNotFound(destination.to_string()));
        };
        if !self.names.is_activatable(well_known) {
            return Err(ErrorKind::DestinationNotFound(destination.to_string()));
        }
        if flags.contains(MessageFlags::NoAutoStart) {
            return Err(ErrorKind::DestinationNotFound(destination.to_string()));
        }

        let snapshot = self
            .peers
            .get(from)
            .map(Peer::snapshot)
            .ok_or(ErrorKind::PeerNotRegistered)?;
        let activation = self
            .names
            .activation_mut(well_known)
            .expect("is_activatable implies an activation record exists");
        if activation.messages.len() >= MAX_QUEUED_ACTIVATION_MESSAGES {
            return Err(ErrorKind::Quota);
        }
        let needs_request = !activation.requested;
        activation.requested = true;
        activation.messages.push_back(ActivationMessage {
            message,
            sender_snapshot: snapshot,
        });

        if needs_request {
            let _ = self
                .controller
                .requests
                .try_send(ControllerRequest::StartService {
                    name: well_known.to_owned().into(),
                });
        }

        Ok(())
    }

    /// Shared by live unicast delivery and activation-drain delivery (spec §4.D): the sender's
    /// identity for the receive-policy check and reply-slot bookkeeping is passed in explicitly
    /// so a drained activation message can use its captured snapshot instead of a live peer.
    fn unicast_to_live_peer(
        &mut self,
        from: &OwnedUniqueName,
        send_query: &SendQuery<'_>,
        unique: &OwnedUniqueName,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let recv_query = ReceiveQuery {
            sender: Some(from.as_str()),
            interface: send_query.interface,
            member: send_query.member,
            path: send_query.path,
            message_type: send_query.message_type,
        };
        let Some(peer) = self.peers.get(unique) else {
            return Err(ErrorKind::DestinationNotFound(unique.to_string()));
        };
        if !peer.policy.allows_receive(&recv_query) {
            return Err(ErrorKind::ReceiveDenied);
        }

        let message_type = message.message_type();
        let flags = message.primary_header().flags();
        if message_type == MessageType::MethodCall && !flags.contains(MessageFlags::NoReplyExpected) {
            let serial = message.primary_header().serial_num();
            self.replies
                .register(from.clone(), unique.clone(), serial, message.clone())
                .map_err(|_| ErrorKind::ExpectedReplyExists)?;
        }

        self.send_to(unique, message);

        Ok(())
    }

    /// Delivers an activation-queued message using its captured sender snapshot rather than the
    /// sender's (possibly since-changed) live policy (spec §4.D).
    pub(crate) fn unicast_with_snapshot(
        &mut self,
        sender: &super::peer::PeerSnapshot,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let header = message.header();
        let destination = header
            .destination()
            .cloned()
            .ok_or_else(|| ErrorKind::ProtocolViolation("missing destination".into()))?;

        let send_query = send_query_for(&header, &destination, message.message_type());
        if !sender.policy.allows_send(&send_query) {
            return Err(ErrorKind::SendDenied);
        }

        let unique = self
            .resolve_destination(&destination)
            .ok_or_else(|| ErrorKind::DestinationNotFound(destination.to_string()))?;
        let to_send = message.clone();
        drop(header);

        self.unicast_to_live_peer(&sender.unique_name, &send_query, &unique, to_send)
    }

    fn route_reply(
        &mut self,
        from: &OwnedUniqueName,
        header: &Header<'_>,
        message: Arc<Message>,
    ) -> Result<(), ErrorKind> {
        let destination = header
            .destination()
            .cloned()
            .ok_or_else(|| ErrorKind::ProtocolViolation("missing destination".into()))?;
        let reply_serial = header
            .reply_serial()
            .ok_or_else(|| ErrorKind::ProtocolViolation("reply without a reply serial".into()))?;

        let Some(unique) = self.resolve_destination(&destination) else {
            return Err(ErrorKind::UnexpectedReply);
        };
        let Some(waiter) = self.replies.consume(from, reply_serial) else {
            return Err(ErrorKind::UnexpectedReply);
        };
        if waiter != unique {
            return Err(ErrorKind::UnexpectedReply);
        }

        self.send_to(&waiter, message);

        Ok(())
    }

    fn resolve_destination(&self, destination: &BusName<'_>) -> Option<OwnedUniqueName> {
        match destination {
            BusName::Unique(u) => {
                let owned: OwnedUniqueName = u.to_owned().into();
                self.peers.contains_key(&owned).then_some(owned)
            }
            BusName::WellKnown(w) => self.names.lookup(w),
        }
    }
}

fn bus_name_is_driver(name: &BusName<'_>) -> bool {
    super::bus_name_eq(name, DRIVER_NAME)
}

fn message_kind_of(message_type: MessageType) -> MessageKind {
    match message_type {
        MessageType::MethodCall => MessageKind::MethodCall,
        MessageType::MethodReturn => MessageKind::MethodReturn,
        MessageType::Signal => MessageKind::Signal,
        MessageType::Error | MessageType::Invalid => MessageKind::Error,
    }
}

/// Builds the [`SendQuery`] for a unicast addressed to `destination`, borrowing straight from
/// `header` so it stays valid exactly as long as the header does.
fn send_query_for<'h, 'd>(
    header: &'h Header<'h>,
    destination: &'d BusName<'d>,
    message_type: MessageType,
) -> SendQuery<'d>
where
    'h: 'd,
{
    SendQuery {
        destination: Some(destination.as_str()),
        interface: header.interface().map(|i| i.as_str()),
        member: header.member().map(|m| m.as_str()),
        path: header.path().map(|p| p.as_str()),
        message_type: Some(message_kind_of(message_type)),
        broadcast: false,
    }
}
