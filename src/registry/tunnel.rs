//! Port-forward tunnels into cluster pods
//!
//! A tunnel exposes a loopback TCP endpoint. Every connection accepted on it is
//! bridged to the target pod port through its own port-forward session brokered
//! by the API server, so any HTTP client can talk to the pod without a direct
//! network route.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, Config};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid pod port '{port}'")]
    InvalidPort { port: String },

    #[error("failed to create cluster client: {0}")]
    Client(#[source] kube::Error),

    #[error("failed to get pod {namespace}/{name}: {source}")]
    PodLookup {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("pod {namespace}/{name} is not running (phase: {phase})")]
    PodNotRunning {
        namespace: String,
        name: String,
        phase: String,
    },

    #[error("port-forward to {namespace}/{name}:{port} failed: {message}")]
    Handshake {
        namespace: String,
        name: String,
        port: u16,
        message: String,
    },

    #[error("failed to bind local tunnel endpoint: {0}")]
    Bind(#[source] std::io::Error),

    #[error("tunnel connection failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Pod port a tunnel should reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub name: String,
    pub port: String,
}

impl PodTarget {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port: port.into(),
        }
    }

    fn port_number(&self) -> Result<u16, TunnelError> {
        self.port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| TunnelError::InvalidPort {
                port: self.port.clone(),
            })
    }
}

/// An open tunnel
pub trait Tunnel: Send {
    /// Local stream endpoint bridged into the pod
    fn local_addr(&self) -> SocketAddr;

    /// First forwarding error seen while the tunnel was in use
    fn failure(&self) -> Option<String>;

    /// Stop accepting connections and tear down every forwarded stream
    fn close(&mut self);
}

/// Opens tunnels to pods
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, cluster: &Config, target: &PodTarget)
    -> Result<Box<dyn Tunnel>, TunnelError>;
}

/// Releases the wrapped tunnel exactly once, when dropped
pub struct TunnelGuard {
    tunnel: Box<dyn Tunnel>,
}

impl TunnelGuard {
    pub fn new(tunnel: Box<dyn Tunnel>) -> Self {
        Self { tunnel }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tunnel.local_addr()
    }

    pub fn failure(&self) -> Option<String> {
        self.tunnel.failure()
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.tunnel.close();
    }
}

/// First error recorded by any forwarded connection
#[derive(Debug, Clone, Default)]
struct FailureSlot(Arc<Mutex<Option<String>>>);

impl FailureSlot {
    fn record(&self, message: String) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    fn get(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Opens tunnels through the Kubernetes port-forward subresource
#[derive(Debug, Clone, Default)]
pub struct PortForwardOpener;

#[async_trait]
impl TunnelOpener for PortForwardOpener {
    async fn open(
        &self,
        cluster: &Config,
        target: &PodTarget,
    ) -> Result<Box<dyn Tunnel>, TunnelError> {
        let port = target.port_number()?;

        let client = Client::try_from(cluster.clone()).map_err(TunnelError::Client)?;
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);

        let pod = pods
            .get(&target.name)
            .await
            .map_err(|source| TunnelError::PodLookup {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                source,
            })?;

        let phase = pod
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Unknown".to_string());
        if phase != "Running" {
            return Err(TunnelError::PodNotRunning {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                phase,
            });
        }

        probe(&pods, target, port).await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(TunnelError::Bind)?;
        let local_addr = listener.local_addr().map_err(TunnelError::Bind)?;

        tracing::debug!(
            pod = %target.name,
            namespace = %target.namespace,
            port,
            local = %local_addr,
            "Tunnel open"
        );

        let failure = FailureSlot::default();
        let accept_task = tokio::spawn(serve(
            listener,
            pods,
            target.clone(),
            port,
            failure.clone(),
        ));

        Ok(Box::new(PortForwardTunnel {
            local_addr,
            failure,
            accept_task: Some(accept_task),
        }))
    }
}

/// Run one port-forward handshake so setup errors surface at open time
async fn probe(pods: &Api<Pod>, target: &PodTarget, port: u16) -> Result<(), TunnelError> {
    let handshake = |message: String| TunnelError::Handshake {
        namespace: target.namespace.clone(),
        name: target.name.clone(),
        port,
        message,
    };

    let mut forwarder = pods
        .portforward(&target.name, &[port])
        .await
        .map_err(|e| handshake(e.to_string()))?;

    let stream = forwarder
        .take_stream(port)
        .ok_or_else(|| handshake("no stream for port".to_string()))?;
    drop(stream);

    forwarder
        .join()
        .await
        .map_err(|e| handshake(e.to_string()))
}

struct PortForwardTunnel {
    local_addr: SocketAddr,
    failure: FailureSlot,
    accept_task: Option<JoinHandle<()>>,
}

impl Tunnel for PortForwardTunnel {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn failure(&self) -> Option<String> {
        self.failure.get()
    }

    fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            // connection tasks live in the accept task's JoinSet and are aborted with it
            task.abort();
            tracing::debug!(local = %self.local_addr, "Tunnel closed");
        }
    }
}

impl Drop for PortForwardTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve(
    listener: TcpListener,
    pods: Api<Pod>,
    target: PodTarget,
    port: u16,
    failure: FailureSlot,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(peer = %peer, "Forwarding tunnel connection");
                    connections.spawn(forward_connection(
                        pods.clone(),
                        target.clone(),
                        port,
                        stream,
                        failure.clone(),
                    ));
                }
                Err(e) => {
                    failure.record(format!("local tunnel listener failed: {}", e));
                    break;
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn forward_connection(
    pods: Api<Pod>,
    target: PodTarget,
    port: u16,
    mut local: TcpStream,
    failure: FailureSlot,
) {
    if let Err(e) = bridge(&pods, &target, port, &mut local).await {
        tracing::warn!(pod = %target.name, error = %e, "Tunnel connection broke");
        failure.record(e.to_string());
    }
}

async fn bridge(
    pods: &Api<Pod>,
    target: &PodTarget,
    port: u16,
    local: &mut TcpStream,
) -> Result<(), TunnelError> {
    let handshake = |message: String| TunnelError::Handshake {
        namespace: target.namespace.clone(),
        name: target.name.clone(),
        port,
        message,
    };

    let mut forwarder = pods
        .portforward(&target.name, &[port])
        .await
        .map_err(|e| handshake(e.to_string()))?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| handshake("no stream for port".to_string()))?;

    tokio::io::copy_bidirectional(local, &mut upstream)
        .await
        .map_err(TunnelError::Io)?;

    drop(upstream);
    forwarder.join().await.map_err(|e| handshake(e.to_string()))
}
