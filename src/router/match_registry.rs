use std::collections::HashMap;

use tracing::warn;
use zbus::{names::BusName, Message, OwnedMatchRule};

use super::{name_registry::{NameRegistry, DRIVER_NAME}, peer::MAX_MATCH_RULES_PER_PEER};

/// Grouping of match rules by the peer that registered them (spec §3 "MatchOwner").
#[derive(Debug, Default)]
pub struct MatchRegistry {
    by_peer: HashMap<zbus::names::OwnedUniqueName, Vec<OwnedMatchRule>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchError {
    Quota,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        peer: &zbus::names::OwnedUniqueName,
        rule: OwnedMatchRule,
    ) -> Result<(), MatchError> {
        let rules = self.by_peer.entry(peer.clone()).or_default();
        if rules.contains(&rule) {
            return Ok(());
        }
        if rules.len() >= MAX_MATCH_RULES_PER_PEER {
            return Err(MatchError::Quota);
        }
        rules.push(rule);

        Ok(())
    }

    pub fn remove(&mut self, peer: &zbus::names::OwnedUniqueName, rule: &OwnedMatchRule) -> bool {
        let Some(rules) = self.by_peer.get_mut(peer) else {
            return false;
        };
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return false;
        };
        rules.remove(pos);

        true
    }

    pub fn remove_all(&mut self, peer: &zbus::names::OwnedUniqueName) {
        self.by_peer.remove(peer);
    }

    pub fn is_empty_for(&self, peer: &zbus::names::OwnedUniqueName) -> bool {
        self.by_peer.get(peer).is_none_or(Vec::is_empty)
    }

    /// Peers subscribed to `msg`: both zbus's own rule evaluation and the well-known-name
    /// resolution a bare `OwnedMatchRule` can't do on its own (spec §3 "MatchRule/MatchRegistry").
    pub fn matching_peers(
        &self,
        msg: &Message,
        names: &NameRegistry,
    ) -> Vec<zbus::names::OwnedUniqueName> {
        self.by_peer
            .iter()
            .filter(|(_, rules)| rules.iter().any(|r| rule_matches(r, msg, names)))
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}

fn rule_matches(rule: &OwnedMatchRule, msg: &Message, names: &NameRegistry) -> bool {
    match rule.matches(msg) {
        Ok(false) => return false,
        Ok(true) => {}
        Err(e) => {
            warn!("error matching rule: {}", e);
            return false;
        }
    }

    let hdr = msg.header();

    if let Some(BusName::WellKnown(name)) = rule.sender().cloned() {
        let sender = hdr.sender().map(|s| s.as_str());
        if name.as_str() == DRIVER_NAME {
            if sender != Some(DRIVER_NAME) {
                return false;
            }
        } else {
            let resolved = names.lookup(&name);
            if resolved.as_ref().map(|r| r.as_str()) != sender {
                return false;
            }
        }
    }

    if let Some(destination) = rule.destination() {
        if let Some(BusName::WellKnown(name)) = hdr.destination() {
            match names.lookup(name) {
                Some(owner) if owner.as_ref() == *destination => {}
                _ => return false,
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::names::UniqueName;

    fn peer(s: &str) -> zbus::names::OwnedUniqueName {
        UniqueName::try_from(s).unwrap().into()
    }

    #[test]
    fn add_is_idempotent_like_a_set() {
        let mut reg = MatchRegistry::new();
        let p = peer(":1.1");
        let rule: OwnedMatchRule = "type='signal'".parse::<zbus::MatchRule>().unwrap().into();

        reg.add(&p, rule.clone()).unwrap();
        reg.add(&p, rule.clone()).unwrap();

        assert!(reg.remove(&p, &rule));
        assert!(!reg.remove(&p, &rule));
    }

    #[test]
    fn remove_unknown_rule_returns_false() {
        let mut reg = MatchRegistry::new();
        let p = peer(":1.1");
        let rule: OwnedMatchRule = "type='signal'".parse::<zbus::MatchRule>().unwrap().into();

        assert!(!reg.remove(&p, &rule));
    }

    #[test]
    fn quota_rejects_excess_rules() {
        let mut reg = MatchRegistry::new();
        let p = peer(":1.1");
        for i in 0..MAX_MATCH_RULES_PER_PEER {
            let rule: OwnedMatchRule = format!("member='M{i}'")
                .parse::<zbus::MatchRule>()
                .unwrap()
                .into();
            reg.add(&p, rule).unwrap();
        }

        let rule: OwnedMatchRule = "member='Overflow'".parse::<zbus::MatchRule>().unwrap().into();
        assert_eq!(reg.add(&p, rule), Err(MatchError::Quota));
    }
}
