use crate::client::Client;
use crate::config::EgtpConfig;
use crate::connection::{bind, derived_port};
use crate::errors::ClientError;
use crate::event_loop::EventLoop;
use crate::identity::{NodeIdentity, PeerId};
use crate::lookup::{Directory, Lookup, RelayDiscovery};
use futures::channel::mpsc;
use log::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running node: the event loop in its own task, and a client to drive it.
pub struct Node {
    client: Client,
    listen_addr: Option<SocketAddr>,
    event_loop_handle: JoinHandle<()>,
}

impl Node {
    /// Bind the listening socket and spawn the event loop.
    ///
    /// The node listens on `listen_port`, or on a port derived from its id when none is configured. Unless
    /// `picky_port` is set, a busy port falls back to one the operating system picks.
    pub async fn start(
        config: EgtpConfig,
        identity: NodeIdentity,
        lookup: Arc<dyn Lookup>,
        discovery: Arc<dyn RelayDiscovery>,
    ) -> Result<Self, ClientError> {
        let peer_id = identity.peer_id();
        let port = config.listen_port.unwrap_or_else(|| derived_port(&peer_id));
        let listener = bind(&config.listen_host, port, config.picky_port)
            .await
            .map_err(|e| ClientError::Listen(format!("{}:{port}. {e}", config.listen_host)))?;
        let listen_addr = listener.local_addr().ok();
        let (command_sender, command_receiver) = mpsc::channel(0);
        let event_loop = EventLoop::new(config, identity, Some(listener), lookup, discovery, command_receiver);
        let event_loop_handle = tokio::spawn(event_loop.run());
        debug!("Started node {peer_id}");
        Ok(Node { client: Client::new(command_sender, peer_id), listen_addr, event_loop_handle })
    }

    /// Start a node that looks up addresses and relayers in `directory`.
    pub async fn with_directory(
        config: EgtpConfig,
        identity: NodeIdentity,
        directory: Directory,
    ) -> Result<Self, ClientError> {
        let directory = Arc::new(directory);
        Self::start(config, identity, directory.clone(), directory).await
    }

    /// Provides a cheap clone of the client. It is thread-safe.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn peer_id(&self) -> PeerId {
        self.client.peer_id()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub async fn shutdown(self) -> Result<(), ClientError> {
        let result = self.client.shutdown().await;
        if let Err(err) = self.event_loop_handle.await {
            error!("Error waiting on the event loop: {err}");
        }
        result
    }
}
