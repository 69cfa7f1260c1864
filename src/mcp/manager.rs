#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;

use eyre::{Context, Result, bail};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{
    config::{McpConfig, ServerConfig, TransportKind, constants::REQUEST_TIMEOUT_SECS},
    models::ServerInfo,
    tools::ToolRegistry,
};

use super::{
    McpError, McpToolAdapter,
    client::Client,
    transport::{self, ArcTransport},
};

/// Turns a server config into a live transport.
pub trait Connector: Send + Sync {
    fn open(&self, kind: TransportKind, config: &ServerConfig) -> Result<ArcTransport, McpError>;
}

/// Spawns processes and opens HTTP endpoints for real.
pub struct TransportConnector;

impl Connector for TransportConnector {
    fn open(&self, kind: TransportKind, config: &ServerConfig) -> Result<ArcTransport, McpError> {
        transport::open(kind, config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Configured,
    Connecting,
    Connected,
    Disconnected,
}

impl Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ServerState::Configured => "configured",
            ServerState::Connecting => "connecting",
            ServerState::Connected => "connected",
            ServerState::Disconnected => "disconnected",
        };
        write!(f, "{}", state)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub connected: bool,
    /// Qualified names of the tools this server currently contributes
    pub tools: Vec<String>,
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug)]
pub struct ConnectFailure {
    pub server: String,
    pub reason: eyre::Report,
}

/// Every server that failed during [`Manager::connect_all`].
#[derive(Error, Debug)]
#[error("failed to connect {} server(s): {}", .failures.len(), summarize(.failures))]
pub struct ConnectError {
    pub failures: Vec<ConnectFailure>,
}

fn summarize(failures: &[ConnectFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {:#}", f.server, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Default)]
struct State {
    clients: HashMap<String, Arc<Client>>,
    tools: BTreeMap<String, Arc<McpToolAdapter>>,
    phases: HashMap<String, ServerState>,
}

impl State {
    /// Drops the server's client and every tool it contributed.
    fn detach(&mut self, server: &str) -> Option<Arc<Client>> {
        self.tools.retain(|_, tool| tool.server() != server);
        self.clients.remove(server)
    }
}

/// Owns the configured servers and their clients, and republishes every
/// discovered tool as `<server>:<tool>`.
///
/// Connecting happens outside the lock. Swapping a client and its tools in or
/// out happens under a single write lock so readers never see tools whose
/// client is gone. Detached clients are closed after the lock is released.
pub struct Manager {
    configs: BTreeMap<String, ServerConfig>,
    connector: Arc<dyn Connector>,
    timeout: Duration,
    state: RwLock<State>,
}

impl Manager {
    pub fn new(servers: Vec<ServerConfig>) -> Result<Self> {
        let mut configs = BTreeMap::new();
        let mut phases = HashMap::new();
        for server in servers {
            let name = server.name().to_string();
            if name.is_empty() {
                bail!("server name must not be empty");
            }
            if configs.contains_key(&name) {
                bail!("server {} configured more than once", name);
            }
            phases.insert(name.clone(), ServerState::Configured);
            configs.insert(name, server);
        }

        Ok(Self {
            configs,
            connector: Arc::new(TransportConnector),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            state: RwLock::new(State {
                phases,
                ..Default::default()
            }),
        })
    }

    pub fn from_config(config: &McpConfig) -> Result<Self> {
        Ok(Self::new(config.servers.clone())?.with_timeout(config.timeout()))
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Request timeout for servers that do not set their own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.configs.values()
    }

    /// Connects every auto-connect server concurrently. One server failing
    /// does not stop the others; all failures are reported together.
    pub async fn connect_all(&self) -> Result<(), ConnectError> {
        let targets = self
            .configs
            .values()
            .filter(|c| c.auto_connect())
            .map(|c| c.name())
            .collect::<Vec<_>>();

        let outcomes =
            futures::future::join_all(targets.iter().map(|name| self.connect(name))).await;

        let failures = targets
            .into_iter()
            .zip(outcomes)
            .filter_map(|(name, outcome)| {
                outcome.err().map(|reason| ConnectFailure {
                    server: name.to_string(),
                    reason,
                })
            })
            .collect::<Vec<_>>();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectError { failures })
        }
    }

    /// (Re)connects one server and indexes its tools, replacing whatever the
    /// server contributed before. On failure the previous connection, if
    /// any, is left untouched.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;

        self.set_phase(name, ServerState::Connecting).await;
        match self.open(config).await {
            Ok((client, tools)) => {
                let previous = {
                    let mut state = self.state.write().await;
                    let previous = state.detach(name);
                    for tool in tools {
                        state.tools.insert(tool.qualified_name().to_string(), tool);
                    }
                    state.clients.insert(name.to_string(), client);
                    state.phases.insert(name.to_string(), ServerState::Connected);
                    previous
                };
                if let Some(previous) = previous {
                    if let Err(err) = previous.close().await {
                        log::warn!("[{}] closing replaced connection: {}", name, err);
                    }
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.write().await;
                let phase = if state.clients.contains_key(name) {
                    ServerState::Connected
                } else {
                    ServerState::Configured
                };
                state.phases.insert(name.to_string(), phase);
                Err(err)
            }
        }
    }

    /// Removes the server's tools and client, then closes the client.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        if !self.configs.contains_key(name) {
            return Err(McpError::UnknownServer(name.to_string()).into());
        }

        let client = {
            let mut state = self.state.write().await;
            let Some(client) = state.detach(name) else {
                return Err(McpError::NotConnected(name.to_string()).into());
            };
            state
                .phases
                .insert(name.to_string(), ServerState::Disconnected);
            client
        };

        client
            .close()
            .await
            .wrap_err_with(|| format!("closing {}", name))?;
        log::info!("[{}] disconnected", name);
        Ok(())
    }

    /// Hands every indexed tool to `registry`, stopping at the first one it
    /// refuses.
    pub async fn register_tools(&self, registry: &dyn ToolRegistry) -> Result<()> {
        let state = self.state.write().await;
        for (name, tool) in state.tools.iter() {
            registry
                .register(tool.clone())
                .wrap_err_with(|| format!("registering tool {}", name))?;
        }
        Ok(())
    }

    /// Snapshot of every configured server, ordered by name.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let state = self.state.read().await;
        self.configs
            .keys()
            .map(|name| {
                let client = state.clients.get(name);
                ServerStatus {
                    name: name.clone(),
                    state: state
                        .phases
                        .get(name)
                        .copied()
                        .unwrap_or(ServerState::Configured),
                    connected: client.is_some(),
                    tools: state
                        .tools
                        .iter()
                        .filter(|(_, tool)| tool.server() == name)
                        .map(|(qualified, _)| qualified.clone())
                        .collect(),
                    server_info: client.and_then(|c| c.server_info().cloned()),
                }
            })
            .collect()
    }

    pub async fn tools(&self) -> Vec<Arc<McpToolAdapter>> {
        self.state.read().await.tools.values().cloned().collect()
    }

    /// Looks up a tool by its qualified name.
    pub async fn tool(&self, name: &str) -> Option<Arc<McpToolAdapter>> {
        self.state.read().await.tools.get(name).cloned()
    }

    /// Closes every client and forgets every tool. All clients are closed
    /// even if some fail; the last failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let clients = {
            let mut state = self.state.write().await;
            state.tools.clear();
            let clients = state.clients.drain().collect::<Vec<_>>();
            for (name, _) in clients.iter() {
                state
                    .phases
                    .insert(name.clone(), ServerState::Disconnected);
            }
            clients
        };

        let mut last = None;
        for (name, client) in clients {
            if let Err(err) = client.close().await {
                log::error!("[{}] closing client: {}", name, err);
                last = Some(eyre::Report::new(err).wrap_err(format!("closing {}", name)));
            }
        }
        match last {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn set_phase(&self, name: &str, phase: ServerState) {
        self.state
            .write()
            .await
            .phases
            .insert(name.to_string(), phase);
    }

    /// Builds a client, runs the handshake and lists the tools. The client
    /// is closed again if any step fails.
    async fn open(&self, config: &ServerConfig) -> Result<(Arc<Client>, Vec<Arc<McpToolAdapter>>)> {
        let name = config.name();
        let kind = config.transport_kind()?;
        let transport = self
            .connector
            .open(kind, config)
            .wrap_err_with(|| format!("opening {} transport", kind))?;

        let timeout = config.timeout().unwrap_or(self.timeout);
        let client = Arc::new(Client::new(name, transport).with_timeout(timeout));

        let tools = async {
            client.initialize().await?;
            client.list_tools().await
        }
        .await;

        let tools = match tools {
            Ok(tools) => tools,
            Err(err) => {
                if let Err(close_err) = client.close().await {
                    log::debug!("[{}] closing failed connection: {}", name, close_err);
                }
                return Err(err.into());
            }
        };

        log::info!("[{}] discovered {} tools", name, tools.len());
        let adapters = tools
            .into_iter()
            .map(|tool| Arc::new(McpToolAdapter::new(name, tool, client.clone())))
            .collect();
        Ok((client, adapters))
    }
}
