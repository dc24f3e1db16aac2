use std::{collections::HashMap, sync::Arc};

use zbus::{names::OwnedUniqueName, Message};

type Key = (OwnedUniqueName, u32);

struct Slot {
    sender: OwnedUniqueName,
    call: Arc<Message>,
}

/// At-most-one-per-(responder, serial) index of outstanding method calls (spec §3 "ReplySlot",
/// §8 invariant 1). Reachable from both sides: [`ReplyRegistry::consume`] by the responder's
/// identity+serial, [`ReplyRegistry::take_all_for_responder`] when the responder disconnects.
/// Keeps the original call around so a synthetic `NoReply` can still be built from its header
/// after the responder is long gone.
#[derive(Default)]
pub struct ReplyRegistry {
    slots: HashMap<Key, Slot>,
    by_responder: HashMap<OwnedUniqueName, Vec<u32>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotExists;

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `sender` expects a reply with `serial` from `responder`, keyed off `call`
    /// (the original method call, whose header may be needed later for a synthetic error reply).
    pub fn register(
        &mut self,
        sender: OwnedUniqueName,
        responder: OwnedUniqueName,
        serial: u32,
        call: Arc<Message>,
    ) -> Result<(), SlotExists> {
        let key = (responder.clone(), serial);
        if self.slots.contains_key(&key) {
            return Err(SlotExists);
        }
        self.slots.insert(key, Slot { sender, call });
        self.by_responder.entry(responder).or_default().push(serial);

        Ok(())
    }

    /// Consume the slot for a reply arriving from `responder` with `reply_serial`, returning the
    /// waiting sender if one exists.
    pub fn consume(&mut self, responder: &OwnedUniqueName, reply_serial: u32) -> Option<OwnedUniqueName> {
        let key = (responder.clone(), reply_serial);
        let slot = self.slots.remove(&key)?;
        if let Some(serials) = self.by_responder.get_mut(responder) {
            serials.retain(|s| *s != reply_serial);
        }

        Some(slot.sender)
    }

    /// Free every slot `sender` was waiting on, as part of goodbye (spec §4.H step 2). The
    /// responder is never notified; it simply finds no slot when its reply eventually arrives.
    pub fn free_for_sender(&mut self, sender: &OwnedUniqueName) {
        self.slots.retain(|(responder, serial), slot| {
            if slot.sender != *sender {
                return true;
            }
            if let Some(serials) = self.by_responder.get_mut(responder) {
                serials.retain(|s| s != serial);
            }

            false
        });
    }

    /// Free every slot responder `unique_name` was expected to fill, as part of goodbye (spec
    /// §4.H step 6). Returns (sender, call) pairs so the caller can reply with a synthetic
    /// `NoReply` built from the original call's header.
    pub fn take_all_for_responder(&mut self, unique_name: &OwnedUniqueName) -> Vec<(OwnedUniqueName, Arc<Message>)> {
        let Some(serials) = self.by_responder.remove(unique_name) else {
            return Vec::new();
        };
        serials
            .into_iter()
            .filter_map(|serial| {
                self.slots
                    .remove(&(unique_name.clone(), serial))
                    .map(|slot| (slot.sender, slot.call))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::names::UniqueName;

    fn n(s: &str) -> OwnedUniqueName {
        UniqueName::try_from(s).unwrap().into()
    }

    fn call() -> Arc<Message> {
        use zbus::names::InterfaceName;

        let iface = InterfaceName::try_from("org.freedesktop.DBus.Peer").unwrap();
        Arc::new(
            Message::signal("/org/freedesktop/DBus", &iface, "Ping")
                .unwrap()
                .build(&())
                .unwrap(),
        )
    }

    #[test]
    fn duplicate_slot_is_rejected() {
        let mut reg = ReplyRegistry::new();
        reg.register(n(":1.1"), n(":1.2"), 5, call()).unwrap();

        assert_eq!(reg.register(n(":1.3"), n(":1.2"), 5, call()), Err(SlotExists));
    }

    #[test]
    fn consume_returns_the_waiting_sender_once() {
        let mut reg = ReplyRegistry::new();
        reg.register(n(":1.1"), n(":1.2"), 5, call()).unwrap();

        assert_eq!(reg.consume(&n(":1.2"), 5), Some(n(":1.1")));
        assert_eq!(reg.consume(&n(":1.2"), 5), None);
    }

    #[test]
    fn disconnect_frees_all_slots_for_responder() {
        let mut reg = ReplyRegistry::new();
        reg.register(n(":1.1"), n(":1.9"), 1, call()).unwrap();
        reg.register(n(":1.2"), n(":1.9"), 2, call()).unwrap();

        let mut freed = reg.take_all_for_responder(&n(":1.9"));
        freed.sort_by_key(|(sender, _)| sender.to_string());
        assert_eq!(freed[0].0, n(":1.1"));
        assert_eq!(freed[1].0, n(":1.2"));
        assert_eq!(reg.consume(&n(":1.9"), 1), None);
    }

    #[test]
    fn disconnecting_sender_frees_its_own_waiting_slots() {
        let mut reg = ReplyRegistry::new();
        reg.register(n(":1.1"), n(":1.9"), 1, call()).unwrap();

        reg.free_for_sender(&n(":1.1"));

        assert_eq!(reg.consume(&n(":1.9"), 1), None);
    }
}
