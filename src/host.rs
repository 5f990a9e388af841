//! Host state container.
//!
//! Owns everything a running proxy shares across sessions: the active
//! configuration, the cancellation token sessions observe and the tracker
//! they are spawned on. Reinitialization replaces all three as a unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::acceptor::ProxyAcceptor;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::transport::{CommandSpawner, WorkerSpawner};

/// Builds the worker spawner for a configuration.
pub type SpawnerFactory = Arc<dyn Fn(&ProxyConfig) -> Arc<dyn WorkerSpawner> + Send + Sync>;

struct HostState {
    config: ProxyConfig,
    token: CancellationToken,
    tracker: TaskTracker,
    acceptor: ProxyAcceptor,
}

impl HostState {
    fn new(config: ProxyConfig, factory: &SpawnerFactory) -> Self {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor = ProxyAcceptor::new(&config, factory(&config), token.clone(), tracker.clone());
        Self {
            config,
            token,
            tracker,
            acceptor,
        }
    }

    /// Cancel every session and wait until all of them are closed.
    async fn drain(&self) {
        self.token.cancel();
        self.tracker.close();
        tracing::info!(sessions = self.tracker.len(), "Waiting for sessions to close");
        self.tracker.wait().await;
    }
}

/// Proxy host: configuration, session cancellation and session tracking.
pub struct BridgeHost {
    current: RwLock<Arc<HostState>>,
    transition: Mutex<()>,
    generation: AtomicU64,
    factory: SpawnerFactory,
}

impl BridgeHost {
    /// Initialize with workers started from `config.worker`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if the configuration is invalid.
    pub fn init(config: ProxyConfig) -> Result<Self> {
        Self::init_with(
            config,
            Arc::new(|config: &ProxyConfig| {
                Arc::new(CommandSpawner::new(config.worker.clone())) as Arc<dyn WorkerSpawner>
            }),
        )
    }

    /// Initialize with a custom spawner factory.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if the configuration is invalid.
    pub fn init_with(config: ProxyConfig, factory: SpawnerFactory) -> Result<Self> {
        config.validate()?;
        tracing::info!(path = %config.proxy_path, worker = %config.worker.program, "Bridge host initialized");
        let state = HostState::new(config, &factory);
        Ok(Self {
            current: RwLock::new(Arc::new(state)),
            transition: Mutex::new(()),
            generation: AtomicU64::new(0),
            factory,
        })
    }

    fn current(&self) -> Arc<HostState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Router for the current configuration.
    ///
    /// A router built before [`reinitialize`](Self::reinitialize) keeps
    /// serving the old, cancelled state; build a new one afterwards.
    pub fn router(&self) -> Router {
        self.current().acceptor.router()
    }

    /// Acceptor for the current configuration.
    pub fn acceptor(&self) -> ProxyAcceptor {
        self.current().acceptor.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> ProxyConfig {
        self.current().config.clone()
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.current().tracker.len()
    }

    /// Number of completed reinitializations.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the configuration.
    ///
    /// Cancels the current sessions, waits for every one of them to close,
    /// swaps in the new state and only then bumps the generation.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if `config` is invalid; the current
    /// state is left untouched in that case.
    pub async fn reinitialize(&self, config: ProxyConfig) -> Result<()> {
        config.validate()?;
        let _guard = self.transition.lock().await;

        self.current().drain().await;

        let next = Arc::new(HostState::new(config, &self.factory));
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, "Bridge host reinitialized");
        Ok(())
    }

    /// Cancel every session and wait for them to close.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;
        let state = self.current();
        if state.token.is_cancelled() && state.tracker.is_empty() {
            return;
        }
        state.drain().await;
        tracing::info!("Bridge host shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.current().token.is_cancelled()
    }
}

impl std::fmt::Debug for BridgeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHost")
            .field("config", &self.current().config)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_init_rejects_invalid_config() {
        let result = BridgeHost::init(ProxyConfig::default().proxy_path("no-slash"));
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_init_rejects_route_patterns() {
        for path in ["/:id", "/{x", "/a/{*rest}/b"] {
            let result = BridgeHost::init(ProxyConfig::default().proxy_path(path));
            assert!(matches!(result, Err(BridgeError::Config(_))), "accepted {path}");
        }
    }

    #[tokio::test]
    async fn test_reinitialize_rejects_route_pattern() {
        let host = BridgeHost::init(ProxyConfig::default()).unwrap();
        let result = host
            .reinitialize(ProxyConfig::default().proxy_path("/lsp/{*rest}"))
            .await;

        assert!(matches!(result, Err(BridgeError::Config(_))));
        assert!(host.acceptor().claims("/api/copilot"));
        let _router = host.router();
    }

    #[test]
    fn test_init_uses_configured_path() {
        let host = BridgeHost::init(ProxyConfig::default()).unwrap();
        assert!(host.acceptor().claims("/api/copilot"));
        assert_eq!(host.generation(), 0);
        assert!(!host.is_shut_down());
    }

    #[tokio::test]
    async fn test_reinitialize_waits_for_sessions_before_bumping_generation() {
        let host = Arc::new(BridgeHost::init(ProxyConfig::default()).unwrap());
        let observed = Arc::new(StdMutex::new(Vec::new()));

        let state = host.current();
        for _ in 0..3 {
            let token = state.token.clone();
            let host = host.clone();
            let observed = observed.clone();
            state.tracker.spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                observed.lock().unwrap().push(host.generation());
            });
        }

        host.reinitialize(ProxyConfig::default().proxy_path("/lsp"))
            .await
            .unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![0, 0, 0]);
        assert_eq!(host.generation(), 1);
        assert!(state.token.is_cancelled());
        assert!(!host.is_shut_down());
        assert!(host.acceptor().claims("/lsp"));
        assert_eq!(host.config().proxy_path, "/lsp");
    }

    #[tokio::test]
    async fn test_invalid_reinitialize_keeps_state() {
        let host = BridgeHost::init(ProxyConfig::default()).unwrap();
        let result = host
            .reinitialize(ProxyConfig::default().framing(crate::config::FramingConfig {
                max_frames_per_tick: 0,
                ..Default::default()
            }))
            .await;

        assert!(matches!(result, Err(BridgeError::Config(_))));
        assert_eq!(host.generation(), 0);
        assert!(!host.is_shut_down());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let host = BridgeHost::init(ProxyConfig::default()).unwrap();
        let state = host.current();
        let token = state.token.clone();
        state.tracker.spawn(async move { token.cancelled().await });

        host.shutdown().await;
        assert!(host.is_shut_down());
        assert_eq!(host.active_sessions(), 0);

        host.shutdown().await;
        assert_eq!(host.generation(), 0);
    }
}
