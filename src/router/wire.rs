//! Builds the three message shapes the driver ever emits (spec §4.A): method returns, error
//! replies, and signals. All three go through `zbus::Message`'s builder; nothing here packs
//! bytes by hand.

use std::sync::Arc;

use serde::Serialize;
use zbus::{
    fdo,
    message::Header,
    names::{InterfaceName, OwnedUniqueName, UniqueName},
    zvariant::DynamicType,
    Message,
};

use super::name_registry::DRIVER_NAME;

pub(crate) fn method_return(
    header: &Header<'_>,
    body: &(impl Serialize + DynamicType),
) -> Option<Arc<Message>> {
    Message::method_return(header)
        .and_then(|b| b.sender(DRIVER_NAME))
        .and_then(|b| b.build(body))
        .map(Arc::new)
        .ok()
}

/// Uses `fdo::Error`'s own [`zbus::DBusError`] impl to build the reply, so the error name and
/// body line up with how `zbus`'s own `#[dbus_interface]` machinery would reply.
pub(crate) fn error_reply(header: &Header<'_>, error: &fdo::Error) -> Option<Arc<Message>> {
    use zbus::DBusError;

    error.create_reply(header).ok().map(Arc::new)
}

pub(crate) fn signal(
    path: &str,
    interface: &str,
    member: &str,
    destination: Option<&UniqueName<'_>>,
    body: &(impl Serialize + DynamicType),
) -> Option<Arc<Message>> {
    let iface = InterfaceName::try_from(interface).ok()?;
    let mut builder = Message::signal(path, &iface, member)
        .ok()?
        .sender(DRIVER_NAME)
        .ok()?;
    if let Some(destination) = destination {
        builder = builder.destination(destination).ok()?;
    }

    builder.build(body).ok().map(Arc::new)
}

pub(crate) fn sender_of(message: &Message) -> Option<OwnedUniqueName> {
    message.header().sender().map(|s| s.to_owned())
}
