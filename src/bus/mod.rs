//! Binds a listener, performs the D-Bus auth handshake per connection, and spawns the per-peer
//! I/O task that feeds the [`Router`] (spec §5, §6). The router, match/name registries and
//! driver logic live entirely off this accept loop; this module's only job is turning sockets
//! into [`RouterEvent`]s.

mod cookies;

#[cfg(unix)]
use std::env;
#[cfg(unix)]
use std::path::Path;
use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use tokio::{
    fs::remove_file,
    spawn,
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use zbus::{
    names::OwnedUniqueName, Address, AuthMechanism, Connection, ConnectionBuilder, Guid, Message,
    MessageStream, Socket, TcpAddress,
};

use crate::{
    config::Config,
    controller::{self, Controller},
    policy::PolicySnapshot,
    router::{
        peer::{Identity, Peer, PEER_QUEUE_CAPACITY},
        Router, RouterEvent,
    },
};

/// Owns the listening socket; the router and controller run as independently-spawned tasks.
pub struct Bus {
    listener: Listener,
    guid: Arc<Guid>,
    next_id: usize,
    auth_mechanism: AuthMechanism,
    config: Arc<RwLock<Config>>,
    events: mpsc::Sender<RouterEvent>,
    address: Address,
}

enum Listener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        socket_path: PathBuf,
    },
    Tcp {
        listener: tokio::net::TcpListener,
    },
}

impl Bus {
    /// Binds the listener and spawns the router and controller tasks. Returns the accept loop
    /// plus join handles for both background tasks, so the caller can await them on shutdown.
    pub async fn for_address(
        address: Option<&str>,
        auth_mechanism: AuthMechanism,
        config: Config,
        config_path: Option<PathBuf>,
    ) -> Result<(Self, JoinHandle<()>, JoinHandle<()>)> {
        let address_str = match address {
            Some(address) => address.to_string(),
            None => default_address(),
        };
        let address = Address::from_str(&address_str)?;

        let listener = match &address {
            #[cfg(unix)]
            Address::Unix(path) => {
                let path = Path::new(&path).to_path_buf();
                info!("Listening on {}.", path.display());
                Listener::Unix {
                    listener: tokio::net::UnixListener::bind(&path)?,
                    socket_path: path,
                }
            }
            #[cfg(not(unix))]
            Address::Unix(_) => {
                return Err(anyhow!("`unix` transport on non-UNIX OS is not supported."))
            }
            Address::Tcp(tcp) => {
                info!("Listening on `{}:{}`.", tcp.host(), tcp.port());
                Listener::Tcp {
                    listener: tokio::net::TcpListener::bind((tcp.host(), tcp.port())).await?,
                }
            }
            Address::NonceTcp { .. } => {
                return Err(anyhow!("`nonce-tcp` transport is not supported (yet)."))
            }
            Address::Autolaunch(_) => {
                return Err(anyhow!("`autolaunch` transport is not supported (yet)."))
            }
            _ => return Err(anyhow!("Unsupported address `{}`.", address)),
        };

        let guid = Arc::new(Guid::generate());
        let config = Arc::new(RwLock::new(config));

        let (events_tx, events_rx) = mpsc::channel(256);

        let (controller_handle, controller_events, controller_requests) =
            controller::channel_pair(32);
        let router = Router::new(guid.clone(), events_rx, controller_handle);
        let router_task = spawn(router.run());

        let controller = Controller::new(config.clone(), config_path, controller_events, controller_requests);
        let controller_task = spawn(controller.run());

        Ok((
            Self {
                listener,
                guid,
                next_id: 0,
                auth_mechanism,
                config,
                events: events_tx,
                address,
            },
            router_task,
            controller_task,
        ))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn run(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.accept_and_register().await {
                warn!("Failed to establish connection: {}", e);
            }
        }
    }

    pub async fn cleanup(self) -> Result<()> {
        match self.listener {
            #[cfg(unix)]
            Listener::Unix { socket_path, .. } => {
                remove_file(socket_path).await.map_err(Into::into)
            }
            Listener::Tcp { .. } => Ok(()),
        }
    }

    async fn accept_and_register(&mut self) -> Result<()> {
        let socket = self.accept().await?;
        if self.auth_mechanism == AuthMechanism::Cookie {
            cookies::sync().await?;
        }

        let id = self.next_id;
        self.next_id += 1;
        let unique_name =
            OwnedUniqueName::try_from(format!(":1.{id}")).expect("well-formed unique name");

        // The `bus-impl` feature makes the built connection stamp inbound messages' SENDER
        // field with this unique name, exactly as a real bus daemon must (clients never set it
        // themselves).
        let conn = ConnectionBuilder::socket(socket)
            .server(&self.guid)
            .p2p()
            .unique_name(unique_name.as_str())?
            .auth_mechanisms(&[self.auth_mechanism])
            .build()
            .await?;

        let identity = peer_identity(&conn).await;
        let policy = {
            let config = self.config.read().await;
            let (username, groups) = resolve_identity(identity.uid);
            PolicySnapshot::compile(&config, username.as_deref(), &groups)
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let peer = Peer::new(id, unique_name.clone(), identity, policy, outbound_tx);

        self.events
            .send(RouterEvent::Connected(Box::new(peer)))
            .await
            .map_err(|_| anyhow!("router task is gone"))?;

        spawn(peer_io(conn, unique_name, self.events.clone(), outbound_rx));

        Ok(())
    }

    async fn accept(&mut self) -> Result<Box<dyn Socket + 'static>> {
        match &mut self.listener {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                debug!("accepted connection from {:?}", addr);
                Ok(Box::new(stream))
            }
            Listener::Tcp { listener } => {
                let (stream, addr) = listener.accept().await?;
                debug!("accepted connection from {:?}", addr);
                Ok(Box::new(stream))
            }
        }
    }
}

/// Reads inbound messages off `conn` into the router, and writes whatever the router enqueues
/// for this peer back out. Neither direction ever blocks the other's progress (spec §5).
async fn peer_io(
    conn: Connection,
    unique_name: OwnedUniqueName,
    events: mpsc::Sender<RouterEvent>,
    mut outbound: mpsc::Receiver<Arc<Message>>,
) {
    let mut stream = MessageStream::from(&conn);

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(message)) => {
                        let event = RouterEvent::Inbound {
                            from: unique_name.clone(),
                            message: Arc::new(message),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("{} read error, disconnecting: {}", unique_name, e);
                        break;
                    }
                    None => break,
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(message) => {
                        if let Err(e) = conn.send(&message).await {
                            debug!("{} write error, disconnecting: {}", unique_name, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = events.send(RouterEvent::Disconnected(unique_name)).await;
}

async fn peer_identity(conn: &Connection) -> Identity {
    match conn.peer_credentials().await {
        Ok(creds) => Identity {
            uid: creds.unix_user_id().unwrap_or(u32::MAX),
            pid: creds.process_id(),
            security_label: creds.linux_security_label().cloned(),
        },
        Err(e) => {
            warn!("failed to read peer credentials: {}", e);
            Identity {
                uid: u32::MAX,
                pid: None,
                security_label: None,
            }
        }
    }
}

/// Resolves a username and primary group name for policy compilation (spec §10.3.1). Only the
/// primary group is consulted; full supplementary-group resolution isn't wired up.
fn resolve_identity(uid: u32) -> (Option<String>, Vec<String>) {
    use nix::unistd::{Group, Uid, User};

    let Ok(Some(user)) = User::from_uid(Uid::from_raw(uid)) else {
        return (None, Vec::new());
    };
    let groups = Group::from_gid(user.gid)
        .ok()
        .flatten()
        .map(|group| vec![group.name])
        .unwrap_or_default();

    (Some(user.name), groups)
}

#[cfg(unix)]
fn default_address() -> String {
    let runtime_dir = env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            Path::new("/run")
                .join("user")
                .join(format!("{}", nix::unistd::Uid::current()))
        });
    let path = runtime_dir.join("busd-session");

    format!("unix:path={}", path.display())
}

#[cfg(not(unix))]
fn default_address() -> String {
    "tcp:host=127.0.0.1,port=4242".to_string()
}
