use std::fmt;

use zbus::fdo;

/// Internal error kinds produced while routing a single message.
///
/// Each variant maps to exactly one DBus error name and a fixed message via
/// [`ErrorKind::dbus_error`]. A handful of kinds (see [`ErrorKind::is_protocol_violation`])
/// never reach the wire at all; they tell the caller to drop the peer's transport instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    PeerAlreadyRegistered,
    PeerNotYetRegistered,
    PeerNotRegistered,
    PeerNotFound(String),
    UnexpectedPath,
    UnexpectedMessageType,
    UnexpectedReply,
    UnexpectedEnvironmentUpdate,
    UnexpectedInterface(String),
    UnexpectedMethod(String),
    UnexpectedProperty(String),
    UnexpectedSignature,
    UnexpectedFlags,
    ReadonlyProperty(String),
    ExpectedReplyExists,
    SendDenied,
    ReceiveDenied,
    PeerNotPrivileged,
    NameReserved,
    NameUnique,
    NameInvalid(String),
    NameRefused(String),
    NameNotFound(String),
    NameOwnerNotFound(String),
    NameNotActivatable(String),
    DestinationNotFound(String),
    ForwardFailed,
    Quota,
    MatchInvalid(String),
    MatchNotFound,
    AdtNotSupported,
    SelinuxNotSupported,
    ProtocolViolation(String),
}

impl ErrorKind {
    /// Whether this kind is a protocol violation: the caller drops the peer's transport instead
    /// of replying over DBus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ProtocolViolation(_) | ErrorKind::PeerNotRegistered
        )
    }

    /// Translate to the wire-level DBus error this kind always produces.
    pub fn dbus_error(&self) -> fdo::Error {
        use ErrorKind::*;

        match self {
            PeerAlreadyRegistered => {
                fdo::Error::Failed("Can only call `Hello` method once.".into())
            }
            PeerNotYetRegistered => fdo::Error::AccessDenied(
                "Client tried to send a message other than `Hello` without being registered."
                    .into(),
            ),
            UnexpectedPath => fdo::Error::AccessDenied("Unexpected object path.".into()),
            UnexpectedMessageType => {
                fdo::Error::AccessDenied("Unexpected message type for this destination.".into())
            }
            UnexpectedReply => {
                fdo::Error::AccessDenied("Reply does not match any outstanding call.".into())
            }
            UnexpectedEnvironmentUpdate => {
                fdo::Error::AccessDenied("Environment update not accepted.".into())
            }
            ExpectedReplyExists => fdo::Error::AccessDenied(
                "A reply to this serial is already expected from this peer.".into(),
            ),
            SendDenied => fdo::Error::AccessDenied("Rejected send message, disconnecting.".into()),
            ReceiveDenied => fdo::Error::AccessDenied("Rejected receive message.".into()),
            PeerNotPrivileged => {
                fdo::Error::AccessDenied("This operation requires a privileged peer.".into())
            }
            NameRefused(name) => {
                fdo::Error::AccessDenied(format!("Policy does not allow owning `{name}`."))
            }
            UnexpectedInterface(iface) => {
                fdo::Error::UnknownInterface(format!("Unknown interface `{iface}`."))
            }
            UnexpectedMethod(member) => {
                fdo::Error::UnknownMethod(format!("Unknown method `{member}`."))
            }
            UnexpectedProperty(name) => {
                fdo::Error::UnknownProperty(format!("Unknown property `{name}`."))
            }
            ReadonlyProperty(name) => {
                fdo::Error::PropertyReadOnly(format!("Property `{name}` is read-only."))
            }
            UnexpectedSignature => {
                fdo::Error::InvalidArgs("Unexpected signature for this method.".into())
            }
            UnexpectedFlags => fdo::Error::InvalidArgs("Unexpected flags value.".into()),
            NameReserved => {
                fdo::Error::InvalidArgs("Name is reserved for the message bus itself.".into())
            }
            NameUnique => fdo::Error::InvalidArgs("Cannot request a unique name.".into()),
            NameInvalid(name) => {
                fdo::Error::InvalidArgs(format!("`{name}` is not a valid bus name."))
            }
            ForwardFailed | Quota => {
                fdo::Error::LimitsExceeded("Peer exceeded its message quota.".into())
            }
            PeerNotFound(name) => fdo::Error::NameHasNoOwner(format!("No such peer: {name}.")),
            NameNotFound(name) => {
                fdo::Error::NameHasNoOwner(format!("Name `{name}` has no owner."))
            }
            NameOwnerNotFound(name) => {
                fdo::Error::NameHasNoOwner(format!("Name `{name}` has no owner."))
            }
            DestinationNotFound(name) => {
                fdo::Error::NameHasNoOwner(format!("Destination `{name}` not found."))
            }
            NameNotActivatable(name) => {
                fdo::Error::ServiceUnknown(format!("Service `{name}` is not activatable."))
            }
            MatchInvalid(reason) => fdo::Error::MatchRuleInvalid(reason.clone()),
            MatchNotFound => fdo::Error::MatchRuleNotFound("No such match rule.".into()),
            AdtNotSupported => {
                fdo::Error::AdtAuditDataUnknown("ADT audit sessions are not supported.".into())
            }
            SelinuxNotSupported => fdo::Error::SELinuxSecurityContextUnknown(
                "This bus was not built with SELinux support.".into(),
            ),
            PeerNotRegistered | ProtocolViolation(_) => {
                fdo::Error::Failed("Protocol violation.".into())
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dbus_error())
    }
}

impl std::error::Error for ErrorKind {}
