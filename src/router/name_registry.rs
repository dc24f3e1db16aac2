use std::collections::{HashMap, VecDeque};

use enumflags2::BitFlags;
use zbus::{
    fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply},
    names::{OwnedUniqueName, OwnedWellKnownName, UniqueName, WellKnownName},
};

use super::activation::Activation;

pub const DRIVER_NAME: &str = "org.freedesktop.DBus";

#[derive(Clone, Debug)]
pub struct NameOwner {
    pub unique_name: OwnedUniqueName,
    pub allow_replacement: bool,
}

#[derive(Debug, Default)]
struct NameEntry {
    owner: Option<NameOwner>,
    waiting_list: VecDeque<NameOwner>,
    activation: Option<Activation>,
}

impl NameEntry {
    fn is_empty(&self) -> bool {
        self.owner.is_none() && self.waiting_list.is_empty() && self.activation.is_none()
    }
}

/// A name-ownership change, to be turned into NameOwnerChanged/NameLost/NameAcquired by the
/// notifier (spec §4.D).
#[derive(Clone, Debug)]
pub struct NameChange {
    pub name: OwnedWellKnownName,
    pub old_owner: Option<OwnedUniqueName>,
    pub new_owner: Option<OwnedUniqueName>,
}

/// Ownership and activation state for every well-known name (spec §3 "Name"/"NameOwnership").
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<OwnedWellKnownName, NameEntry>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `RequestName` semantics (spec §3). Returns the reply code and, if ownership
    /// actually changed, the resulting [`NameChange`].
    pub fn request_name(
        &mut self,
        name: OwnedWellKnownName,
        unique_name: OwnedUniqueName,
        flags: BitFlags<RequestNameFlags>,
    ) -> (RequestNameReply, Option<NameChange>) {
        let candidate = NameOwner {
            unique_name: unique_name.clone(),
            allow_replacement: flags.contains(RequestNameFlags::AllowReplacement),
        };
        let entry = self.names.entry(name.clone()).or_default();

        match &entry.owner {
            Some(owner) if owner.unique_name == unique_name => {
                (RequestNameReply::AlreadyOwner, None)
            }
            Some(owner) => {
                if flags.contains(RequestNameFlags::ReplaceExisting) && owner.allow_replacement {
                    let old_owner = entry.owner.replace(candidate).map(|o| o.unique_name);
                    // The displaced owner keeps its place at the head of the queue unless it
                    // asked not to be queued.
                    if let Some(old) = old_owner.clone() {
                        if !flags.contains(RequestNameFlags::DoNotQueue) {
                            // We don't have the displaced owner's own flags any more once
                            // replaced; conservatively allow it to be requeued without
                            // replacement rights until it calls RequestName again.
                            entry.waiting_list.push_front(NameOwner {
                                unique_name: old,
                                allow_replacement: false,
                            });
                        }
                    }

                    (
                        RequestNameReply::PrimaryOwner,
                        Some(NameChange {
                            name,
                            old_owner,
                            new_owner: Some(unique_name),
                        }),
                    )
                } else if flags.contains(RequestNameFlags::DoNotQueue) {
                    (RequestNameReply::Exists, None)
                } else {
                    entry.waiting_list.push_back(candidate);
                    (RequestNameReply::InQueue, None)
                }
            }
            None => {
                entry.owner = Some(candidate);

                (
                    RequestNameReply::PrimaryOwner,
                    Some(NameChange {
                        name,
                        old_owner: None,
                        new_owner: Some(unique_name),
                    }),
                )
            }
        }
    }

    /// Apply `ReleaseName` semantics (spec §3).
    pub fn release_name(
        &mut self,
        name: &WellKnownName<'_>,
        owner: &UniqueName<'_>,
    ) -> (ReleaseNameReply, Option<NameChange>) {
        let Some(entry) = self.names.get_mut(name.as_str()) else {
            return (ReleaseNameReply::NonExistent, None);
        };

        match &entry.owner {
            Some(current) if current.unique_name.as_ref() == *owner => {
                let old_owner = entry.owner.take().map(|o| o.unique_name);
                entry.owner = entry.waiting_list.pop_front();
                let new_owner = entry.owner.as_ref().map(|o| o.unique_name.clone());
                let changed = old_owner != new_owner;
                self.drop_if_empty(name);

                (
                    ReleaseNameReply::Released,
                    changed.then_some(NameChange {
                        name: name.to_owned().into(),
                        old_owner,
                        new_owner,
                    }),
                )
            }
            Some(_) => {
                if let Some(pos) = entry
                    .waiting_list
                    .iter()
                    .position(|w| w.unique_name.as_ref() == *owner)
                {
                    entry.waiting_list.remove(pos);
                    (ReleaseNameReply::Released, None)
                } else {
                    (ReleaseNameReply::NotOwner, None)
                }
            }
            None => (ReleaseNameReply::NonExistent, None),
        }
    }

    /// Release every name (owned or queued) held by `unique_name`, as part of goodbye (spec
    /// §4.H). Returns one [`NameChange`] per name whose primary owner actually changed.
    pub fn release_all(&mut self, unique_name: &UniqueName<'_>) -> Vec<NameChange> {
        let mut changes = Vec::new();
        let names: Vec<OwnedWellKnownName> = self.names.keys().cloned().collect();

        for name in names {
            let wk: WellKnownName<'_> = name.as_ref().into();
            let (reply, change) = self.release_name(&wk, unique_name);
            if reply == ReleaseNameReply::Released {
                if let Some(change) = change {
                    changes.push(change);
                }
            }
        }

        changes
    }

    pub fn lookup(&self, name: &WellKnownName<'_>) -> Option<OwnedUniqueName> {
        self.names
            .get(name.as_str())
            .and_then(|e| e.owner.as_ref())
            .map(|o| o.unique_name.clone())
    }

    pub fn waiting_list(&self, name: &WellKnownName<'_>) -> Option<Vec<OwnedUniqueName>> {
        self.names.get(name.as_str()).map(|e| {
            e.owner
                .iter()
                .chain(e.waiting_list.iter())
                .map(|o| o.unique_name.clone())
                .collect()
        })
    }

    pub fn all_owned_names(&self) -> impl Iterator<Item = &OwnedWellKnownName> {
        self.names
            .iter()
            .filter(|(_, e)| e.owner.is_some())
            .map(|(n, _)| n)
    }

    pub fn activatable_names(&self) -> impl Iterator<Item = &OwnedWellKnownName> {
        self.names
            .iter()
            .filter(|(_, e)| e.activation.is_some())
            .map(|(n, _)| n)
    }

    pub fn is_activatable(&self, name: &WellKnownName<'_>) -> bool {
        self.names
            .get(name.as_str())
            .is_some_and(|e| e.activation.is_some())
    }

    /// Register `name` as activatable, creating an empty entry if needed.
    pub fn declare_activatable(&mut self, name: OwnedWellKnownName) {
        self.names
            .entry(name)
            .or_default()
            .activation
            .get_or_insert_with(Activation::new);
    }

    pub fn activation_mut(&mut self, name: &WellKnownName<'_>) -> Option<&mut Activation> {
        self.names.get_mut(name.as_str()).and_then(|e| e.activation.as_mut())
    }

    fn drop_if_empty(&mut self, name: &WellKnownName<'_>) {
        if self.names.get(name.as_str()).is_some_and(NameEntry::is_empty) {
            self.names.remove(name.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::names::WellKnownName;

    fn name(s: &str) -> OwnedWellKnownName {
        WellKnownName::try_from(s).unwrap().into()
    }

    fn unique(s: &str) -> OwnedUniqueName {
        zbus::names::UniqueName::try_from(s).unwrap().into()
    }

    #[test]
    fn first_requester_becomes_primary_owner() {
        let mut reg = NameRegistry::new();
        let (reply, change) =
            reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());

        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        let change = change.unwrap();
        assert_eq!(change.old_owner, None);
        assert_eq!(change.new_owner.unwrap().as_str(), ":1.1");
    }

    #[test]
    fn second_requester_without_queue_flags_is_queued() {
        let mut reg = NameRegistry::new();
        reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());
        let (reply, change) =
            reg.request_name(name("com.example.Svc"), unique(":1.2"), BitFlags::empty());

        assert_eq!(reply, RequestNameReply::InQueue);
        assert!(change.is_none());
    }

    #[test]
    fn do_not_queue_without_replacement_gets_exists() {
        let mut reg = NameRegistry::new();
        reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());
        let (reply, _) = reg.request_name(
            name("com.example.Svc"),
            unique(":1.2"),
            RequestNameFlags::DoNotQueue.into(),
        );

        assert_eq!(reply, RequestNameReply::Exists);
    }

    #[test]
    fn replace_existing_displaces_allowing_owner() {
        let mut reg = NameRegistry::new();
        reg.request_name(
            name("com.example.Svc"),
            unique(":1.1"),
            RequestNameFlags::AllowReplacement.into(),
        );
        let (reply, change) = reg.request_name(
            name("com.example.Svc"),
            unique(":1.2"),
            RequestNameFlags::ReplaceExisting.into(),
        );

        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        let change = change.unwrap();
        assert_eq!(change.old_owner.unwrap().as_str(), ":1.1");
        assert_eq!(change.new_owner.unwrap().as_str(), ":1.2");
    }

    #[test]
    fn release_name_promotes_next_in_queue() {
        let mut reg = NameRegistry::new();
        reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());
        reg.request_name(name("com.example.Svc"), unique(":1.2"), BitFlags::empty());

        let wk = WellKnownName::try_from("com.example.Svc").unwrap();
        let owner = UniqueName::try_from(":1.1").unwrap();
        let (reply, change) = reg.release_name(&wk, &owner);

        assert_eq!(reply, ReleaseNameReply::Released);
        let change = change.unwrap();
        assert_eq!(change.old_owner.unwrap().as_str(), ":1.1");
        assert_eq!(change.new_owner.unwrap().as_str(), ":1.2");
        assert_eq!(reg.lookup(&wk).unwrap().as_str(), ":1.2");
    }

    #[test]
    fn releasing_last_owner_removes_the_entry() {
        let mut reg = NameRegistry::new();
        reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());
        let wk = WellKnownName::try_from("com.example.Svc").unwrap();
        let owner = UniqueName::try_from(":1.1").unwrap();
        reg.release_name(&wk, &owner);

        assert!(reg.lookup(&wk).is_none());
        assert!(reg.all_owned_names().next().is_none());
    }

    #[test]
    fn round_trip_request_then_release_restores_state() {
        let mut reg = NameRegistry::new();
        let wk = WellKnownName::try_from("com.example.Svc").unwrap();
        let owner = UniqueName::try_from(":1.1").unwrap();

        reg.request_name(name("com.example.Svc"), unique(":1.1"), BitFlags::empty());
        reg.release_name(&wk, &owner);

        assert!(reg.lookup(&wk).is_none());
    }
}
