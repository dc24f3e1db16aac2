//! In-process channel to the "controller" collaborator (spec §6): the part of the broker
//! responsible for config reload and on-demand service activation. Modeled as a dedicated
//! mpsc pair, kept off the router's own event loop.

use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::{
    process::Command,
    sync::{
        mpsc::{self, Receiver, Sender},
        RwLock,
    },
};
use tracing::{debug, warn};
use zbus::{names::OwnedWellKnownName, Message};

use crate::config::Config;

/// A request the router sends to the controller. `ReloadConfig` and
/// `UpdateActivationEnvironment` carry the original call so the eventual completion can be
/// replied to with a real header (spec §4.A) instead of a synthesized one.
#[derive(Debug)]
pub enum ControllerRequest {
    ReloadConfig {
        call: Arc<Message>,
    },
    UpdateActivationEnvironment {
        call: Arc<Message>,
        env: Vec<(String, String)>,
    },
    StartService {
        name: OwnedWellKnownName,
    },
}

/// A completion notification the controller sends back to the router.
#[derive(Debug)]
pub enum ControllerEvent {
    ReloadConfigCompleted {
        call: Arc<Message>,
    },
    ReloadConfigInvalid {
        call: Arc<Message>,
        message: String,
    },
    EnvironmentUpdated {
        call: Arc<Message>,
    },
    ActivationSucceeded {
        name: OwnedWellKnownName,
    },
    ActivationFailed {
        name: OwnedWellKnownName,
        message: String,
    },
}

/// The router's handle to the controller: send requests, and a channel the router polls
/// alongside peer messages for asynchronous completions.
#[derive(Debug)]
pub struct ControllerHandle {
    pub requests: Sender<ControllerRequest>,
    pub events: Receiver<ControllerEvent>,
}

pub fn channel_pair(capacity: usize) -> (ControllerHandle, Sender<ControllerEvent>, Receiver<ControllerRequest>) {
    let (req_tx, req_rx) = mpsc::channel(capacity);
    let (evt_tx, evt_rx) = mpsc::channel(capacity);

    (
        ControllerHandle {
            requests: req_tx,
            events: evt_rx,
        },
        evt_tx,
        req_rx,
    )
}

/// One `.service` file: the minimal subset of the freedesktop service-activation format (spec
/// §3 "Activation") this broker understands.
#[derive(Clone, Debug)]
struct ServiceFile {
    exec: String,
    args: Vec<String>,
}

/// Parses `[D-BUS Service]\nName=...\nExec=...` style files. Not a general desktop-entry
/// parser: only the two keys activation needs are recognized, everything else is ignored.
fn parse_service_file(contents: &str) -> Option<(String, ServiceFile)> {
    let mut name = None;
    let mut exec = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "Name" => name = Some(value.trim().to_string()),
            "Exec" => exec = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let name = name?;
    let mut parts = exec?.split_whitespace().map(str::to_string);
    let exec = parts.next()?;
    let args = parts.collect();

    Some((name, ServiceFile { exec, args }))
}

async fn find_service(servicedirs: &[std::path::PathBuf], name: &OwnedWellKnownName) -> Option<ServiceFile> {
    for dir in servicedirs {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_service_file = entry.path().extension().map(|ext| ext == "service").unwrap_or(false);
            if !is_service_file {
                continue;
            }
            let Ok(contents) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            if let Some((found_name, service)) = parse_service_file(&contents) {
                if found_name == name.as_str() {
                    return Some(service);
                }
            }
        }
    }

    None
}

/// Runs config reload and on-demand activation on the controller side of the channel pair
/// (spec §6). A single task, serialized the same way the router serializes peer messages.
pub struct Controller {
    config: Arc<RwLock<Config>>,
    config_path: Option<std::path::PathBuf>,
    events: Sender<ControllerEvent>,
    requests: Receiver<ControllerRequest>,
    activation_env: HashMap<String, String>,
}

impl Controller {
    pub fn new(
        config: Arc<RwLock<Config>>,
        config_path: Option<std::path::PathBuf>,
        events: Sender<ControllerEvent>,
        requests: Receiver<ControllerRequest>,
    ) -> Self {
        Self {
            config,
            config_path,
            events,
            requests,
            activation_env: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request).await;
        }
    }

    async fn handle(&mut self, request: ControllerRequest) {
        match request {
            ControllerRequest::ReloadConfig { call } => self.reload_config(call).await,
            ControllerRequest::UpdateActivationEnvironment { call, env } => {
                self.activation_env.extend(env);
                let _ = self.events.send(ControllerEvent::EnvironmentUpdated { call }).await;
            }
            ControllerRequest::StartService { name } => self.start_service(name).await,
        }
    }

    async fn reload_config(&mut self, call: Arc<Message>) {
        // Reload re-reads the file the process was started with. Without one (the default
        // config was used), there's nothing to reload from and the request is a no-op.
        let Some(path) = &self.config_path else {
            let _ = self.events.send(ControllerEvent::ReloadConfigCompleted { call }).await;
            return;
        };

        match Config::read_file(path) {
            Ok(new_config) => {
                *self.config.write().await = new_config;
                let _ = self.events.send(ControllerEvent::ReloadConfigCompleted { call }).await;
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(ControllerEvent::ReloadConfigInvalid {
                        call,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn start_service(&mut self, name: OwnedWellKnownName) {
        let servicedirs = {
            let config = self.config.read().await;
            config.servicedirs.clone()
        };

        let Some(service) = find_service(&servicedirs, &name).await else {
            let _ = self
                .events
                .send(ControllerEvent::ActivationFailed {
                    name,
                    message: "no .service file provides this name".into(),
                })
                .await;
            return;
        };

        let mut command = Command::new(&service.exec);
        command.args(&service.args).envs(&self.activation_env);

        match command.spawn() {
            Ok(mut child) => {
                debug!("activated {} via {}", name, service.exec);
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                let _ = self.events.send(ControllerEvent::ActivationSucceeded { name }).await;
            }
            Err(e) => {
                warn!("failed to spawn activation helper for {}: {}", name, e);
                let _ = self
                    .events
                    .send(ControllerEvent::ActivationFailed {
                        name,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}
