//! Send/receive/own/connect policy evaluation (spec §10.3.1), compiled from [`crate::config::Config`].

use std::sync::Arc;

use zbus::names::BusName;

use crate::config::{Access, Config, Name, NameOwnership, Operation, Policy, ReceiveOperation, SendOperation};

/// A peer's resolved, ordered rule set plus the `privileged` bit the driver consults for
/// `UpdateActivationEnvironment`/`BecomeMonitor` (spec §9 Open Questions).
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    rules: Arc<Vec<(Access, Operation)>>,
    pub privileged: bool,
}

/// What kind of message is being checked, mirroring `<allow send_type="..."/>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Signal,
    Error,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SendQuery<'a> {
    pub destination: Option<&'a str>,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub message_type: Option<MessageKind>,
    pub broadcast: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReceiveQuery<'a> {
    pub sender: Option<&'a str>,
    pub interface: Option<&'a str>,
    pub member: Option<&'a str>,
    pub path: Option<&'a str>,
    pub message_type: Option<MessageKind>,
}

impl PolicySnapshot {
    /// Compile [`Config`]'s policies into the snapshot for one connecting peer, identified by
    /// `username`/`groups` (resolved by the caller at accept time via `nix::unistd`).
    ///
    /// Merge order is DefaultContext, then Group, then User, then MandatoryContext
    /// (spec §10.3.1); within a context the last matching rule wins.
    pub fn compile(config: &Config, username: Option<&str>, groups: &[String]) -> Self {
        let mut default_ctx = Vec::new();
        let mut group_ctx = Vec::new();
        let mut user_ctx = Vec::new();
        let mut mandatory_ctx = Vec::new();
        let mut privileged = false;

        for policy in &config.policies {
            match policy {
                Policy::DefaultContext(rules) => default_ctx.extend(rules.iter().cloned()),
                Policy::Group(rules, group) if groups.iter().any(|g| g == group) => {
                    group_ctx.extend(rules.iter().cloned());
                }
                Policy::User(rules, user) if Some(user.as_str()) == username => {
                    user_ctx.extend(rules.iter().cloned());
                    privileged = true;
                }
                Policy::MandatoryContext(rules) => mandatory_ctx.extend(rules.iter().cloned()),
                _ => {}
            }
        }

        let mut rules = default_ctx;
        rules.extend(group_ctx);
        rules.extend(user_ctx);
        rules.extend(mandatory_ctx);

        Self {
            rules: Arc::new(rules),
            privileged,
        }
    }

    /// A snapshot with no rules at all: everything is allowed. Used for the driver's own
    /// synthetic peer and in tests.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn allows_own(&self, name: &str) -> bool {
        self.evaluate(|op| match op {
            Operation::Own(NameOwnership { own: Some(pat) }) => name_matches(pat, name),
            _ => false,
        })
    }

    pub fn allows_send(&self, query: &SendQuery<'_>) -> bool {
        self.evaluate(|op| match op {
            Operation::Send(send) => send_matches(send, query),
            _ => false,
        })
    }

    pub fn allows_receive(&self, query: &ReceiveQuery<'_>) -> bool {
        self.evaluate(|op| match op {
            Operation::Receive(recv) => receive_matches(recv, query),
            _ => false,
        })
    }

    /// Last-matching-rule-wins; default allow when nothing matches.
    fn evaluate(&self, matches: impl Fn(&Operation) -> bool) -> bool {
        let mut allowed = true;
        for (access, op) in self.rules.iter() {
            if matches(op) {
                allowed = *access == Access::Allow;
            }
        }

        allowed
    }
}

fn name_matches(pattern: &Name, candidate: &str) -> bool {
    match pattern {
        Name::Any => true,
        Name::Exact(s) => s == candidate,
        Name::Prefix(prefix) => candidate.starts_with(prefix.as_str()),
    }
}

fn send_matches(rule: &SendOperation, query: &SendQuery<'_>) -> bool {
    if let Some(dest_pat) = &rule.destination {
        match query.destination {
            Some(dest) if name_matches(dest_pat, dest) => {}
            None if matches!(dest_pat, Name::Any) => {}
            _ => return false,
        }
    }
    if let Some(broadcast) = rule.broadcast {
        if broadcast != query.broadcast {
            return false;
        }
    }
    if let Some(iface) = &rule.interface {
        if query.interface != Some(iface.as_str()) {
            return false;
        }
    }
    if let Some(member) = &rule.member {
        if query.member != Some(member.as_str()) {
            return false;
        }
    }
    if let Some(path) = &rule.path {
        if query.path != Some(path.as_str()) {
            return false;
        }
    }
    if let Some(kind) = &rule.r#type {
        if !message_kind_matches(kind, query.message_type) {
            return false;
        }
    }

    true
}

fn receive_matches(rule: &ReceiveOperation, query: &ReceiveQuery<'_>) -> bool {
    if let Some(sender) = &rule.sender {
        if query.sender != Some(sender.as_str()) {
            return false;
        }
    }
    if let Some(iface) = &rule.interface {
        if query.interface != Some(iface.as_str()) {
            return false;
        }
    }
    if let Some(member) = &rule.member {
        if query.member != Some(member.as_str()) {
            return false;
        }
    }
    if let Some(path) = &rule.path {
        if query.path != Some(path.as_str()) {
            return false;
        }
    }
    if let Some(kind) = &rule.r#type {
        if !message_kind_matches(kind, query.message_type) {
            return false;
        }
    }

    true
}

fn message_kind_matches(pattern: &crate::config::MessageType, actual: Option<MessageKind>) -> bool {
    use crate::config::MessageType as Cfg;

    match (pattern, actual) {
        (Cfg::Any, _) => true,
        (Cfg::MethodCall, Some(MessageKind::MethodCall)) => true,
        (Cfg::MethodReturn, Some(MessageKind::MethodReturn)) => true,
        (Cfg::Signal, Some(MessageKind::Signal)) => true,
        (Cfg::Error, Some(MessageKind::Error)) => true,
        _ => false,
    }
}

/// Resolve the unique name a `BusName` refers to, for policy queries that want a unique name
/// even when the caller addressed a well-known one.
pub fn bus_name_str(name: &BusName<'_>) -> &str {
    name.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn default_policy_allows_everything() {
        let snapshot = PolicySnapshot::compile(&Config::default(), None, &[]);
        assert!(snapshot.allows_own("com.example.Svc"));
        assert!(snapshot.allows_send(&SendQuery::default()));
    }

    #[test]
    fn deny_after_allow_in_same_context_wins() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy context="default">
                <allow own="*"/>
                <deny own="net.blocked.Svc"/>
            </policy>
        </busconfig>
        "#;
        let config = Config::parse(input).unwrap();
        let snapshot = PolicySnapshot::compile(&config, None, &[]);

        assert!(snapshot.allows_own("com.example.Svc"));
        assert!(!snapshot.allows_own("net.blocked.Svc"));
    }

    #[test]
    fn mandatory_context_overrides_user_context() {
        let input = r#"<!DOCTYPE busconfig PUBLIC "-//freedesktop//DTD D-Bus Bus Configuration 1.0//EN"
        "http://www.freedesktop.org/standards/dbus/1.0/busconfig.dtd">
        <busconfig>
            <policy user="alice">
                <allow send_destination="net.connman.iwd"/>
            </policy>
            <policy context="mandatory">
                <deny send_destination="net.connman.iwd"/>
            </policy>
        </busconfig>
        "#;
        let config = Config::parse(input).unwrap();
        let snapshot = PolicySnapshot::compile(&config, Some("alice"), &[]);

        assert!(snapshot.privileged);
        assert!(!snapshot.allows_send(&SendQuery {
            destination: Some("net.connman.iwd"),
            ..Default::default()
        }));
    }
}
