//! Import a local image into the in-cluster registry
//!
//! One call is one linear attempt:
//! parse the reference, open a tunnel to the registry pod, resolve credentials
//! for the pull host, push over the tunnel. The tunnel is released on every
//! exit path, including cancellation.

use crate::registry::auth::{AuthError, Authenticator};
use crate::registry::push::{
    DaemonImageSource, ImagePusher, OciPusher, PushError, PushRequest, PushResult,
};
use crate::registry::reference::{ImageReference, ReferenceError};
use crate::registry::tunnel::{PodTarget, PortForwardOpener, TunnelError, TunnelGuard, TunnelOpener};
use crate::utils::ContainerRuntime;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Prefix shared by every failure past reference parsing
///
/// Tooling matches on this text, keep it stable.
pub const PUSH_FAILED_PREFIX: &str = "failed to push image to the in-cluster registry: ";

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    InvalidReferenceFormat(#[from] ReferenceError),

    #[error("failed to push image to the in-cluster registry: {0}")]
    TunnelEstablishFailed(#[source] TunnelError),

    #[error("failed to push image to the in-cluster registry: {0}")]
    AuthorizationFailed(#[source] AuthError),

    #[error("failed to push image to the in-cluster registry: {cause}")]
    TunnelBroken {
        cause: String,
        #[source]
        source: PushError,
    },

    #[error("failed to push image to the in-cluster registry: {0}")]
    Push(#[source] PushError),

    #[error("failed to push image to the in-cluster registry: operation cancelled")]
    Cancelled { stage: ImportStage },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportErrorKind {
    InvalidReferenceFormat,
    TunnelEstablishFailed,
    AuthorizationFailed,
    TunnelBroken,
    Push,
    Cancelled,
}

/// How far an import got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportStage {
    NotStarted,
    ReferenceParsed,
    TunnelOpen,
    Authenticated,
    Pushed,
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportStage::NotStarted => "not started",
            ImportStage::ReferenceParsed => "reference parsed",
            ImportStage::TunnelOpen => "tunnel open",
            ImportStage::Authenticated => "authenticated",
            ImportStage::Pushed => "pushed",
        };
        f.write_str(name)
    }
}

impl ImportError {
    pub fn kind(&self) -> ImportErrorKind {
        match self {
            ImportError::InvalidReferenceFormat(_) => ImportErrorKind::InvalidReferenceFormat,
            ImportError::TunnelEstablishFailed(_) => ImportErrorKind::TunnelEstablishFailed,
            ImportError::AuthorizationFailed(_) => ImportErrorKind::AuthorizationFailed,
            ImportError::TunnelBroken { .. } => ImportErrorKind::TunnelBroken,
            ImportError::Push(_) => ImportErrorKind::Push,
            ImportError::Cancelled { .. } => ImportErrorKind::Cancelled,
        }
    }

    /// Last stage reached before the failure
    pub fn stage(&self) -> ImportStage {
        match self {
            ImportError::InvalidReferenceFormat(_) => ImportStage::NotStarted,
            ImportError::Cancelled { stage } => *stage,
            ImportError::TunnelEstablishFailed(_) => ImportStage::ReferenceParsed,
            ImportError::AuthorizationFailed(_) => ImportStage::TunnelOpen,
            ImportError::TunnelBroken { .. } | ImportError::Push(_) => ImportStage::Authenticated,
        }
    }

    /// Whether repeating the whole import may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ImportErrorKind::TunnelEstablishFailed | ImportErrorKind::TunnelBroken
        )
    }
}

/// Where and how to push one image
#[derive(Clone)]
pub struct ImportOptions {
    pub cluster: kube::Config,
    pub registry_auth: Arc<dyn Authenticator>,
    /// Registry host the cluster pulls from; credentials are resolved for it
    pub pull_host: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_port: String,
}

impl fmt::Debug for ImportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportOptions")
            .field("cluster", &self.cluster.cluster_url)
            .field("pull_host", &self.pull_host)
            .field("pod_name", &self.pod_name)
            .field("pod_namespace", &self.pod_namespace)
            .field("pod_port", &self.pod_port)
            .finish_non_exhaustive()
    }
}

/// Drives image imports
///
/// Holds only shared, immutable capabilities, so one importer can serve
/// concurrent calls.
#[derive(Clone)]
pub struct Importer {
    tunnels: Arc<dyn TunnelOpener>,
    pusher: Arc<dyn ImagePusher>,
}

impl Importer {
    pub fn new(tunnels: Arc<dyn TunnelOpener>, pusher: Arc<dyn ImagePusher>) -> Self {
        Self { tunnels, pusher }
    }

    /// Port-forward tunnels and images exported from the given runtime
    pub fn in_cluster(runtime: ContainerRuntime) -> Self {
        let source = Arc::new(DaemonImageSource::new(runtime));
        Self::new(
            Arc::new(PortForwardOpener),
            Arc::new(OciPusher::new(source)),
        )
    }

    pub async fn import(
        &self,
        cancel: &CancellationToken,
        image_name: &str,
        opts: &ImportOptions,
    ) -> Result<PushResult, ImportError> {
        // a malformed name is reported as is, even when already cancelled
        let reference = ImageReference::parse(image_name)?;
        let progress = StageTracker::new(&reference);
        progress.reached(ImportStage::ReferenceParsed);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let stage = progress.current();
                tracing::warn!(image = image_name, stage = %stage, "Import cancelled");
                Err(ImportError::Cancelled { stage })
            }
            result = self.run(&reference, opts, &progress) => result,
        }
    }

    async fn run(
        &self,
        reference: &ImageReference,
        opts: &ImportOptions,
        progress: &StageTracker<'_>,
    ) -> Result<PushResult, ImportError> {
        let target = PodTarget::new(&opts.pod_namespace, &opts.pod_name, &opts.pod_port);
        let tunnel = self
            .tunnels
            .open(&opts.cluster, &target)
            .await
            .map(TunnelGuard::new)
            .map_err(ImportError::TunnelEstablishFailed)?;
        progress.reached(ImportStage::TunnelOpen);

        let credentials = opts
            .registry_auth
            .resolve(&opts.pull_host)
            .await
            .map_err(ImportError::AuthorizationFailed)?;
        progress.reached(ImportStage::Authenticated);

        let request = PushRequest {
            reference,
            endpoint: tunnel.local_addr(),
            credentials: &credentials,
        };
        let result = self.pusher.push(request).await.map_err(|source| {
            match tunnel.failure() {
                Some(cause) => ImportError::TunnelBroken { cause, source },
                None => ImportError::Push(source),
            }
        })?;
        progress.reached(ImportStage::Pushed);

        tracing::info!(
            image = %reference,
            pull_host = %opts.pull_host,
            digest = %result.digest,
            size = result.size,
            "Image imported"
        );

        Ok(result)
    }
}

/// Last stage one import call reached, readable after its future is dropped
struct StageTracker<'a> {
    reference: &'a ImageReference,
    stage: Mutex<ImportStage>,
}

impl<'a> StageTracker<'a> {
    fn new(reference: &'a ImageReference) -> Self {
        Self {
            reference,
            stage: Mutex::new(ImportStage::NotStarted),
        }
    }

    fn reached(&self, stage: ImportStage) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
        tracing::debug!(image = %self.reference, stage = %stage, "Import progress");
    }

    fn current(&self) -> ImportStage {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::auth::{Credentials, StaticAuthenticator};
    use crate::registry::tunnel::Tunnel;
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingAuthenticator {
        calls: AtomicUsize,
    }

    impl FailingAuthenticator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Authenticator for FailingAuthenticator {
        async fn resolve(&self, _host: &str) -> Result<Credentials, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::new("authorization error"))
        }
    }

    #[derive(Default)]
    struct FakeTunnels {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        next_port: AtomicU16,
        fail_open: bool,
        broken: Option<String>,
        opened_targets: Mutex<Vec<PodTarget>>,
    }

    struct FakeTunnel {
        addr: SocketAddr,
        closes: Arc<AtomicUsize>,
        broken: Option<String>,
    }

    impl Tunnel for FakeTunnel {
        fn local_addr(&self) -> SocketAddr {
            self.addr
        }

        fn failure(&self) -> Option<String> {
            self.broken.clone()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TunnelOpener for FakeTunnels {
        async fn open(
            &self,
            _cluster: &kube::Config,
            target: &PodTarget,
        ) -> Result<Box<dyn Tunnel>, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(TunnelError::InvalidPort {
                    port: target.port.clone(),
                });
            }
            self.opened_targets.lock().unwrap().push(target.clone());
            let port = 40000 + self.next_port.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTunnel {
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                closes: self.closes.clone(),
                broken: self.broken.clone(),
            }))
        }
    }

    enum PushBehavior {
        Succeed,
        Fail(&'static str),
        Hang,
        Panic,
    }

    struct FakePusher {
        behavior: PushBehavior,
        requests: Mutex<Vec<(String, SocketAddr, Credentials)>>,
    }

    impl FakePusher {
        fn new(behavior: PushBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ImagePusher for FakePusher {
        async fn push(&self, request: PushRequest<'_>) -> Result<PushResult, PushError> {
            self.requests.lock().unwrap().push((
                request.reference.to_string(),
                request.endpoint,
                request.credentials.clone(),
            ));
            match self.behavior {
                PushBehavior::Succeed => Ok(PushResult {
                    digest: format!("sha256:{}", request.endpoint.port()),
                    size: 42,
                }),
                PushBehavior::Fail(message) => Err(PushError::Registry(message.to_string())),
                PushBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("push should have been cancelled")
                }
                PushBehavior::Panic => panic!("push panicked"),
            }
        }
    }

    fn options(auth: Arc<dyn Authenticator>) -> ImportOptions {
        ImportOptions {
            cluster: kube::Config::new("http://127.0.0.1:6443".parse().unwrap()),
            registry_auth: auth,
            pull_host: "registry".to_string(),
            pod_name: "pod".to_string(),
            pod_namespace: "namespace".to_string(),
            pod_port: "port".to_string(),
        }
    }

    fn working_auth() -> Arc<dyn Authenticator> {
        Arc::new(StaticAuthenticator::new(Credentials::basic("user", "pass")))
    }

    #[tokio::test]
    async fn test_import_happy_path() {
        let tunnels = Arc::new(FakeTunnels::default());
        let pusher = FakePusher::new(PushBehavior::Succeed);
        let importer = Importer::new(tunnels.clone(), pusher.clone());

        let result = importer
            .import(&CancellationToken::new(), "test:tag", &options(working_auth()))
            .await
            .unwrap();

        assert_eq!(result, PushResult { digest: "sha256:40000".to_string(), size: 42 });
        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 1);
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            tunnels.opened_targets.lock().unwrap()[0],
            PodTarget::new("namespace", "pod", "port")
        );

        let requests = pusher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "test:tag");
        assert_eq!(requests[0].1.port(), 40000);
        assert_eq!(requests[0].2, Credentials::basic("user", "pass"));
    }

    #[tokio::test]
    async fn test_import_authorization_error() {
        let tunnels = Arc::new(FakeTunnels::default());
        let pusher = FakePusher::new(PushBehavior::Succeed);
        let importer = Importer::new(tunnels.clone(), pusher.clone());

        let err = importer
            .import(&CancellationToken::new(), "test:tag", &options(FailingAuthenticator::new()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to push image to the in-cluster registry: authorization error"
        );
        assert_eq!(err.kind(), ImportErrorKind::AuthorizationFailed);
        assert_eq!(err.stage(), ImportStage::TunnelOpen);
        assert!(!err.is_retryable());
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
        assert!(pusher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_invalid_image_name() {
        let tunnels = Arc::new(FakeTunnels::default());
        let auth = FailingAuthenticator::new();
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Succeed));

        let err = importer
            .import(&CancellationToken::new(), "test", &options(auth.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "image 'test' not in expected format 'image:tag'");
        assert_eq!(err.kind(), ImportErrorKind::InvalidReferenceFormat);
        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 0);
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 0);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tunnel_failure_skips_authentication() {
        let tunnels = Arc::new(FakeTunnels {
            fail_open: true,
            ..Default::default()
        });
        let auth = FailingAuthenticator::new();
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Succeed));

        let err = importer
            .import(&CancellationToken::new(), "test:tag", &options(auth.clone()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to push image to the in-cluster registry: invalid pod port 'port'"
        );
        assert_eq!(err.kind(), ImportErrorKind::TunnelEstablishFailed);
        assert!(err.is_retryable());
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_failure_is_prefixed_and_releases_tunnel() {
        let tunnels = Arc::new(FakeTunnels::default());
        let importer = Importer::new(
            tunnels.clone(),
            FakePusher::new(PushBehavior::Fail("manifest invalid")),
        );

        let err = importer
            .import(&CancellationToken::new(), "test:tag", &options(working_auth()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to push image to the in-cluster registry: manifest invalid"
        );
        assert_eq!(err.kind(), ImportErrorKind::Push);
        assert!(err.to_string().starts_with(PUSH_FAILED_PREFIX));
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_tunnel_is_reported() {
        let tunnels = Arc::new(FakeTunnels {
            broken: Some("tunnel connection failed: connection reset by peer".to_string()),
            ..Default::default()
        });
        let importer = Importer::new(
            tunnels.clone(),
            FakePusher::new(PushBehavior::Fail("error sending request")),
        );

        let err = importer
            .import(&CancellationToken::new(), "test:tag", &options(working_auth()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to push image to the in-cluster registry: tunnel connection failed: connection reset by peer"
        );
        assert_eq!(err.kind(), ImportErrorKind::TunnelBroken);
        assert!(err.is_retryable());
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_tunnel() {
        let tunnels = Arc::new(FakeTunnels::default());
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Hang));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = importer
            .import(&cancel, "test:tag", &options(working_auth()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to push image to the in-cluster registry: operation cancelled"
        );
        assert_eq!(err.kind(), ImportErrorKind::Cancelled);
        assert_eq!(err.stage(), ImportStage::Authenticated);
        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 1);
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_image_name_wins_over_cancellation() {
        let tunnels = Arc::new(FakeTunnels::default());
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Succeed));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = importer
            .import(&cancel, "test", &options(working_auth()))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "image 'test' not in expected format 'image:tag'");
        assert_eq!(err.kind(), ImportErrorKind::InvalidReferenceFormat);
        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let tunnels = Arc::new(FakeTunnels::default());
        let auth = FailingAuthenticator::new();
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Succeed));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = importer
            .import(&cancel, "test:tag", &options(auth.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ImportErrorKind::Cancelled);
        assert_eq!(err.stage(), ImportStage::ReferenceParsed);
        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 0);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_push_releases_tunnel() {
        let tunnels = Arc::new(FakeTunnels::default());
        let importer = Importer::new(tunnels.clone(), FakePusher::new(PushBehavior::Panic));

        let handle = tokio::spawn(async move {
            importer
                .import(&CancellationToken::new(), "test:tag", &options(working_auth()))
                .await
        });

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_imports_are_isolated() {
        let tunnels = Arc::new(FakeTunnels::default());
        let pusher = FakePusher::new(PushBehavior::Succeed);
        let importer = Importer::new(tunnels.clone(), pusher.clone());

        let mut handles = Vec::new();
        for i in 0..8 {
            let importer = importer.clone();
            handles.push(tokio::spawn(async move {
                let auth: Arc<dyn Authenticator> = Arc::new(StaticAuthenticator::new(
                    Credentials::basic(format!("user-{i}"), "pass"),
                ));
                let mut opts = options(auth);
                opts.pod_name = format!("pod-{i}");
                importer
                    .import(&CancellationToken::new(), &format!("app-{i}:v1"), &opts)
                    .await
            }));
        }

        let mut digests = Vec::new();
        for handle in handles {
            digests.push(handle.await.unwrap().unwrap().digest);
        }
        digests.sort();
        digests.dedup();
        assert_eq!(digests.len(), 8, "every import must get its own tunnel");

        assert_eq!(tunnels.opens.load(Ordering::SeqCst), 8);
        assert_eq!(tunnels.closes.load(Ordering::SeqCst), 8);

        let requests = pusher.requests.lock().unwrap();
        for (image, _, credentials) in requests.iter() {
            let index = image
                .strip_prefix("app-")
                .and_then(|rest| rest.strip_suffix(":v1"))
                .unwrap();
            assert_eq!(*credentials, Credentials::basic(format!("user-{index}"), "pass"));
        }

        let mut pods: Vec<String> = tunnels
            .opened_targets
            .lock()
            .unwrap()
            .iter()
            .map(|target| target.name.clone())
            .collect();
        pods.sort();
        pods.dedup();
        assert_eq!(pods.len(), 8);
    }
}
