//! Bodies of the `org.freedesktop.DBus*` methods (spec §4.C).

use std::{collections::HashMap, fs, sync::Arc};

use enumflags2::BitFlags;
use zbus::{
    fdo::{ConnectionCredentials, RequestNameFlags},
    message::Header,
    names::{BusName, OwnedWellKnownName, UniqueName, WellKnownName},
    zvariant::Value,
    Message, MatchRule, OwnedMatchRule,
};

use super::{introspect, MethodEntry, DBUS_IFACE, MONITORING_IFACE, PEER_IFACE, PROPERTIES_IFACE};
use crate::router::{error::ErrorKind, name_registry::DRIVER_NAME, peer::PeerState, Router};

pub(super) async fn call(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    entry: &MethodEntry,
    header: &Header<'_>,
    message: &Arc<Message>,
) -> Result<(), ErrorKind> {
    let body = message.body();

    match (entry.interface, entry.member) {
        (DBUS_IFACE, "Hello") => hello(router, from, header).await,
        (DBUS_IFACE, "RequestName") => {
            let (name, flags): (OwnedWellKnownName, u32) =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            request_name(router, from, header, name, flags).await
        }
        (DBUS_IFACE, "ReleaseName") => {
            let name: OwnedWellKnownName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            release_name(router, from, header, name).await
        }
        (DBUS_IFACE, "ListQueuedOwners") => {
            let name: String = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            list_queued_owners(router, header, name)
        }
        (DBUS_IFACE, "ListNames") => list_names(router, header),
        (DBUS_IFACE, "ListActivatableNames") => list_activatable_names(router, header),
        (DBUS_IFACE, "NameHasOwner") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            name_has_owner(router, header, name)
        }
        (DBUS_IFACE, "StartServiceByName") => {
            let (name, _flags): (OwnedWellKnownName, u32) =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            start_service_by_name(router, header, message, name)
        }
        (DBUS_IFACE, "UpdateActivationEnvironment") => {
            let env: HashMap<String, String> =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            update_activation_environment(router, from, message, env)
        }
        (DBUS_IFACE, "GetNameOwner") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_name_owner(router, header, name)
        }
        (DBUS_IFACE, "GetConnectionUnixUser") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_connection_unix_user(router, header, name)
        }
        (DBUS_IFACE, "GetConnectionUnixProcessID") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_connection_unix_process_id(router, header, name)
        }
        (DBUS_IFACE, "GetConnectionCredentials") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_connection_credentials(router, header, name)
        }
        (DBUS_IFACE, "GetConnectionSELinuxSecurityContext") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_connection_selinux_security_context(router, header, name)
        }
        (DBUS_IFACE, "GetAdtAuditSessionData") => {
            let name: BusName = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_adt_audit_session_data(router, header, name)
        }
        (DBUS_IFACE, "AddMatch") => {
            let rule: String = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            add_match(router, from, header, rule)
        }
        (DBUS_IFACE, "RemoveMatch") => {
            let rule: String = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            remove_match(router, from, header, rule)
        }
        (DBUS_IFACE, "ReloadConfig") => reload_config(router, message),
        (DBUS_IFACE, "GetId") => get_id(router, header),
        (DBUS_IFACE, "GetMachineId") | (PEER_IFACE, "GetMachineId") => get_machine_id(router, header),
        (MONITORING_IFACE, "BecomeMonitor") => {
            let (rules, flags): (Vec<String>, u32) =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            become_monitor(router, from, header, rules, flags).await
        }
        ("org.freedesktop.DBus.Introspectable", "Introspect") => {
            introspect_path(router, header)
        }
        (PEER_IFACE, "Ping") => ping(router, header),
        (PROPERTIES_IFACE, "Get") => {
            let (iface, name): (String, String) =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_property(router, header, iface, name)
        }
        (PROPERTIES_IFACE, "Set") => {
            let (iface, name, _value): (String, String, Value) =
                body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            set_property(router, iface, name)
        }
        (PROPERTIES_IFACE, "GetAll") => {
            let iface: String = body.deserialize().map_err(|_| ErrorKind::UnexpectedSignature)?;
            get_all_properties(router, header, iface)
        }
        (iface, member) => Err(ErrorKind::UnexpectedMethod(format!("{iface}.{member}"))),
    }
}

fn reply(router: &mut Router, header: &Header<'_>, body: &(impl serde::Serialize + zbus::zvariant::DynamicType)) -> Result<(), ErrorKind> {
    let Some(destination) = header.sender().map(|s| s.to_owned()) else {
        return Ok(());
    };
    if let Some(msg) = crate::router::wire::method_return(header, body) {
        router.send_to(&destination, msg);
    }
    Ok(())
}

async fn hello(router: &mut Router, from: &zbus::names::OwnedUniqueName, header: &Header<'_>) -> Result<(), ErrorKind> {
    let peer = router.peers.get_mut(from).ok_or(ErrorKind::PeerNotRegistered)?;
    if peer.is_registered() {
        return Err(ErrorKind::PeerAlreadyRegistered);
    }
    peer.state = PeerState::Registered;

    reply(router, header, &from.as_str())?;
    router.emit_unique_name_acquired(from).await;

    Ok(())
}

async fn request_name(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    header: &Header<'_>,
    name: OwnedWellKnownName,
    flags: u32,
) -> Result<(), ErrorKind> {
    if name.as_str() == DRIVER_NAME {
        return Err(ErrorKind::NameReserved);
    }
    if !router
        .peers
        .get(from)
        .is_some_and(|p| p.policy.allows_own(name.as_str()))
    {
        return Err(ErrorKind::NameRefused(name.to_string()));
    }

    let flags = BitFlags::<RequestNameFlags>::from_bits_truncate(flags as u8);
    let (reply_code, change) = router.names.request_name(name, from.clone(), flags);

    reply(router, header, &reply_code)?;
    if let Some(change) = change {
        router.apply_name_change(change).await;
    }

    Ok(())
}

async fn release_name(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    header: &Header<'_>,
    name: OwnedWellKnownName,
) -> Result<(), ErrorKind> {
    let wk: WellKnownName<'_> = name.as_ref().into();
    let owner: UniqueName<'_> = from.as_ref().into();
    let (reply_code, change) = router.names.release_name(&wk, &owner);

    reply(router, header, &reply_code)?;
    if let Some(change) = change {
        router.apply_name_change(change).await;
    }

    Ok(())
}

fn list_queued_owners(router: &mut Router, header: &Header<'_>, name: String) -> Result<(), ErrorKind> {
    if name == DRIVER_NAME {
        return reply(router, header, &vec![DRIVER_NAME.to_string()]);
    }

    let wk = WellKnownName::try_from(name.clone()).map_err(|_| ErrorKind::NameInvalid(name.clone()))?;
    let owners = router
        .names
        .waiting_list(&wk)
        .ok_or_else(|| ErrorKind::NameNotFound(name))?;
    let owners: Vec<String> = owners.iter().map(|o| o.to_string()).collect();

    reply(router, header, &owners)
}

fn list_names(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    let mut names = vec![DRIVER_NAME.to_string()];
    names.extend(router.peers.keys().map(|u| u.to_string()));
    names.extend(router.names.all_owned_names().map(|n| n.to_string()));

    reply(router, header, &names)
}

fn list_activatable_names(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    let mut names = vec![DRIVER_NAME.to_string()];
    names.extend(router.names.activatable_names().map(|n| n.to_string()));

    reply(router, header, &names)
}

fn name_has_owner(router: &mut Router, header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    let has_owner = match &name {
        BusName::Unique(u) => router.peers.contains_key(u.as_ref()),
        BusName::WellKnown(w) if w.as_str() == DRIVER_NAME => true,
        BusName::WellKnown(w) => router.names.lookup(w).is_some(),
    };

    reply(router, header, &has_owner)
}

fn start_service_by_name(
    router: &mut Router,
    header: &Header<'_>,
    message: &Arc<Message>,
    name: OwnedWellKnownName,
) -> Result<(), ErrorKind> {
    let wk: WellKnownName<'_> = name.as_ref().into();
    if !router.names.is_activatable(&wk) {
        return Err(ErrorKind::NameNotActivatable(name.to_string()));
    }
    if router.names.lookup(&wk).is_some() {
        // START_REPLY_ALREADY_RUNNING
        return reply(router, header, &2u32);
    }

    let needs_request = {
        let activation = router
            .names
            .activation_mut(&wk)
            .expect("is_activatable implies an activation record");
        let needs_request = !activation.requested;
        activation.requested = true;
        activation.requests.push_back(crate::router::activation::ActivationRequest {
            call: message.clone(),
        });

        needs_request
    };

    if needs_request {
        let _ = router
            .controller
            .requests
            .try_send(crate::controller::ControllerRequest::StartService { name });
    }

    Ok(())
}

fn update_activation_environment(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    message: &Arc<Message>,
    env: HashMap<String, String>,
) -> Result<(), ErrorKind> {
    if !router.peers.get(from).is_some_and(|p| p.policy.privileged) {
        return Err(ErrorKind::PeerNotPrivileged);
    }

    let _ = router
        .controller
        .requests
        .try_send(crate::controller::ControllerRequest::UpdateActivationEnvironment {
            call: message.clone(),
            env: env.into_iter().collect(),
        });

    Ok(())
}

fn get_name_owner(router: &mut Router, header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    match &name {
        BusName::WellKnown(w) if w.as_str() == DRIVER_NAME => reply(router, header, &DRIVER_NAME.to_string()),
        BusName::WellKnown(w) => {
            let owner = router
                .names
                .lookup(w)
                .ok_or_else(|| ErrorKind::NameOwnerNotFound(name.to_string()))?;
            reply(router, header, &owner.to_string())
        }
        BusName::Unique(u) => {
            if router.peers.contains_key(u.as_ref()) {
                reply(router, header, &u.to_string())
            } else {
                Err(ErrorKind::NameOwnerNotFound(name.to_string()))
            }
        }
    }
}

fn resolve_peer<'r>(router: &'r Router, name: &BusName<'_>) -> Option<&'r crate::router::peer::Peer> {
    match name {
        BusName::Unique(u) => router.peers.get(u.as_ref()),
        BusName::WellKnown(w) if w.as_str() == DRIVER_NAME => None,
        BusName::WellKnown(w) => router.names.lookup(w).and_then(|u| router.peers.get(&u)),
    }
}

fn get_connection_unix_user(router: &mut Router, header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    if matches!(&name, BusName::WellKnown(w) if w.as_str() == DRIVER_NAME) {
        return reply(router, header, &0u32);
    }
    let uid = resolve_peer(router, &name)
        .map(|p| p.identity.uid)
        .ok_or_else(|| ErrorKind::PeerNotFound(name.to_string()))?;

    reply(router, header, &uid)
}

fn get_connection_unix_process_id(router: &mut Router, header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    let pid = resolve_peer(router, &name)
        .and_then(|p| p.identity.pid)
        .ok_or_else(|| ErrorKind::PeerNotFound(name.to_string()))?;

    reply(router, header, &pid)
}

fn get_connection_credentials(router: &mut Router, header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    let peer = resolve_peer(router, &name).ok_or_else(|| ErrorKind::PeerNotFound(name.to_string()))?;

    let mut credentials = ConnectionCredentials::default().set_unix_user_id(peer.identity.uid);
    if let Some(pid) = peer.identity.pid {
        credentials = credentials.set_process_id(pid);
    }
    if let Some(label) = &peer.identity.security_label {
        let mut bytes = label.clone();
        bytes.push(0);
        credentials = credentials.set_linux_security_label(bytes);
    }

    reply(router, header, &credentials)
}

fn get_connection_selinux_security_context(
    router: &mut Router,
    header: &Header<'_>,
    name: BusName<'_>,
) -> Result<(), ErrorKind> {
    let peer = resolve_peer(router, &name).ok_or_else(|| ErrorKind::PeerNotFound(name.to_string()))?;
    let label = peer
        .identity
        .security_label
        .clone()
        .ok_or(ErrorKind::SelinuxNotSupported)?;

    reply(router, header, &label)
}

fn get_adt_audit_session_data(router: &mut Router, _header: &Header<'_>, name: BusName<'_>) -> Result<(), ErrorKind> {
    resolve_peer(router, &name).ok_or_else(|| ErrorKind::PeerNotFound(name.to_string()))?;

    Err(ErrorKind::AdtNotSupported)
}

fn add_match(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    header: &Header<'_>,
    rule: String,
) -> Result<(), ErrorKind> {
    let parsed: OwnedMatchRule = rule
        .parse::<MatchRule>()
        .map_err(|e| ErrorKind::MatchInvalid(e.to_string()))?
        .into();
    router
        .matches
        .add(from, parsed)
        .map_err(|_| ErrorKind::Quota)?;

    reply(router, header, &())
}

fn remove_match(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    header: &Header<'_>,
    rule: String,
) -> Result<(), ErrorKind> {
    let parsed: OwnedMatchRule = rule
        .parse::<MatchRule>()
        .map_err(|e| ErrorKind::MatchInvalid(e.to_string()))?
        .into();
    if !router.matches.remove(from, &parsed) {
        return Err(ErrorKind::MatchNotFound);
    }

    reply(router, header, &())
}

fn reload_config(router: &mut Router, message: &Arc<Message>) -> Result<(), ErrorKind> {
    let _ = router
        .controller
        .requests
        .try_send(crate::controller::ControllerRequest::ReloadConfig {
            call: message.clone(),
        });

    Ok(())
}

fn get_id(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    let id = router.guid.to_string();
    reply(router, header, &id)
}

fn get_machine_id(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    let id = machine_id(router);
    reply(router, header, &id)
}

fn machine_id(router: &Router) -> String {
    fs::read_to_string("/etc/machine-id")
        .or_else(|_| fs::read_to_string("/var/lib/dbus/machine-id"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| router.guid.to_string())
}

async fn become_monitor(
    router: &mut Router,
    from: &zbus::names::OwnedUniqueName,
    header: &Header<'_>,
    rules: Vec<String>,
    flags: u32,
) -> Result<(), ErrorKind> {
    if !router.peers.get(from).is_some_and(|p| p.policy.privileged) {
        return Err(ErrorKind::PeerNotPrivileged);
    }
    if flags != 0 {
        return Err(ErrorKind::UnexpectedFlags);
    }

    let rules = if rules.is_empty() {
        vec![String::new()]
    } else {
        rules
    };
    let mut parsed = Vec::with_capacity(rules.len());
    for rule in rules {
        let owned: OwnedMatchRule = rule
            .parse::<MatchRule>()
            .map_err(|e| ErrorKind::MatchInvalid(e.to_string()))?
            .into();
        parsed.push(owned);
    }

    reply(router, header, &())?;

    router.goodbye(from, true).await;

    router.matches.remove_all(from);
    for rule in parsed {
        // Quota failures here are fatal to the transition, per spec §4.C: "all errors after the
        // reply is sent are fatal to the peer".
        if router.matches.add(from, rule).is_err() {
            router.peers.remove(from);
            return Ok(());
        }
    }

    if let Some(peer) = router.peers.get_mut(from) {
        peer.state = PeerState::Monitor;
    }

    Ok(())
}

fn introspect_path(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    let path = header.path().map(|p| p.as_str()).unwrap_or("/");
    let xml = introspect::for_path(path);

    reply(router, header, &xml)
}

fn ping(router: &mut Router, header: &Header<'_>) -> Result<(), ErrorKind> {
    reply(router, header, &())
}

fn get_property(router: &mut Router, header: &Header<'_>, iface: String, name: String) -> Result<(), ErrorKind> {
    if iface != DBUS_IFACE && !iface.is_empty() {
        return Err(ErrorKind::UnexpectedInterface(iface));
    }

    match name.as_str() {
        "Features" => reply(router, header, &Value::from(Vec::<String>::new())),
        "Interfaces" => reply(
            router,
            header,
            &Value::from(vec![MONITORING_IFACE.to_string()]),
        ),
        _ => Err(ErrorKind::UnexpectedProperty(name)),
    }
}

fn set_property(_router: &mut Router, _iface: String, name: String) -> Result<(), ErrorKind> {
    Err(ErrorKind::ReadonlyProperty(name))
}

fn get_all_properties(router: &mut Router, header: &Header<'_>, iface: String) -> Result<(), ErrorKind> {
    if iface != DBUS_IFACE && !iface.is_empty() {
        return Err(ErrorKind::UnexpectedInterface(iface));
    }

    let mut dict: HashMap<&str, Value> = HashMap::new();
    dict.insert("Features", Value::from(Vec::<String>::new()));
    dict.insert("Interfaces", Value::from(vec![MONITORING_IFACE.to_string()]));

    reply(router, header, &dict)
}

