use crate::cache::StateCache;
use crate::config::{Backoff, MatrixConfig};
use crate::connection::{AckAction, Connection};
use crate::error::{MatrixError, Result};
use crate::protocol::Request;
use crate::subscription::ChangeEvent;
use crate::types::{ConnectionState, Endpoint};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

/// Why a link stopped being used
enum LinkExit {
    Shutdown,
    Failed,
}

/// Owns the link to one amplifier and keeps it alive
///
/// A background supervisor syncs state after every (re)connect, probes the
/// link on an interval and reconnects with exponential backoff once the
/// probes keep failing. Every time a link is torn down the epoch advances,
/// which discards commands still queued for it.
pub(crate) struct Session {
    endpoint: Endpoint,
    config: MatrixConfig,
    cache: StateCache,
    state: watch::Sender<ConnectionState>,
    link: RwLock<Option<Arc<Connection>>>,
    epoch: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Held while a caller opens the first link
    starting: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(endpoint: Endpoint, config: MatrixConfig, cache: StateCache) -> Self {
        Self {
            endpoint,
            config,
            cache,
            state: watch::Sender::new(ConnectionState::Disconnected),
            link: RwLock::new(None),
            epoch: watch::Sender::new(0),
            shutdown: watch::Sender::new(false),
            supervisor: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the epoch; it changes whenever queued commands must be dropped
    pub fn epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// The live link, if any
    pub fn link(&self) -> Result<Arc<Connection>> {
        let link = self.link.read().unwrap_or_else(|e| e.into_inner()).clone();
        match link {
            Some(link) if !link.is_closed() => Ok(link),
            _ => Err(MatrixError::Connection(format!(
                "not connected to {} ({})",
                self.endpoint,
                self.connection_state()
            ))),
        }
    }

    /// Open the transport and hand it to the supervisor
    ///
    /// Calling it on a started session is a no-op, including while another
    /// caller is still opening the link.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _starting = self.starting.lock().await;
        if *self.shutdown.borrow() {
            return Err(MatrixError::Connection("session has been closed".to_string()));
        }
        if self.supervisor_running() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let url = self.endpoint.url();
        let link = match Connection::connect(&url, self.config.connect_timeout(), self.cache.clone()).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                tracing::error!("Could not connect to {}: {}", self.endpoint, e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.install(link);

        let handle = tokio::spawn(self.clone().supervise(self.shutdown.subscribe()));
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop reconnecting, close the link and cancel all pending commands
    pub async fn close(&self) {
        self.shutdown.send_replace(true);

        let handle = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            if timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        if let Some(link) = self.uninstall() {
            link.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Ask the supervisor to stop without waiting for it
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn supervisor_running(&self) -> bool {
        self.supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn install(&self, link: Arc<Connection>) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    fn uninstall(&self) -> Option<Arc<Connection>> {
        let link = self.link.write().unwrap_or_else(|e| e.into_inner()).take();
        self.epoch.send_modify(|epoch| *epoch += 1);
        link
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Matrix {} is {}", self.endpoint, state);
            self.cache.bus().publish(ChangeEvent::Connection(state));
        }
    }

    fn current_link(&self) -> Option<Arc<Connection>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            self.config.reconnect_initial_backoff(),
            self.config.reconnect_max_backoff(),
        );
        let url = self.endpoint.url();

        loop {
            let link = match self.current_link() {
                Some(link) => link,
                None => {
                    self.set_state(ConnectionState::Connecting);
                    let attempt = tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        attempt = Connection::connect(&url, self.config.connect_timeout(), self.cache.clone()) => attempt,
                    };
                    match attempt {
                        Ok(link) => {
                            let link = Arc::new(link);
                            self.install(link.clone());
                            link
                        }
                        Err(e) => {
                            tracing::warn!("Reconnect to {} failed: {}", self.endpoint, e);
                            self.set_state(ConnectionState::Failed);
                            let delay = backoff.next_delay();
                            tracing::info!("Reconnecting to {} in {:?}", self.endpoint, delay);
                            tokio::select! {
                                _ = shutdown.wait_for(|stop| *stop) => break,
                                _ = sleep(delay) => continue,
                            }
                        }
                    }
                }
            };

            let exit = self.run_link(&link, &mut backoff, &mut shutdown).await;
            if let Some(link) = self.uninstall() {
                link.close().await;
            }

            match exit {
                LinkExit::Shutdown => break,
                LinkExit::Failed => {
                    self.set_state(ConnectionState::Failed);
                    let delay = backoff.next_delay();
                    tracing::info!("Reconnecting to {} in {:?}", self.endpoint, delay);
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(link) = self.uninstall() {
            link.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Session for {} stopped", self.endpoint);
    }

    /// Sync, then probe until the link dies, probes keep failing, or shutdown
    async fn run_link(
        &self,
        link: &Connection,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkExit {
        let threshold = self.config.keepalive_failure_threshold;
        let mut synced = false;
        let mut failures = 0u32;
        let mut ticker = interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return LinkExit::Shutdown,
                _ = link.closed() => {
                    tracing::warn!("Link to {} dropped", self.endpoint);
                    return LinkExit::Failed;
                }
                _ = ticker.tick() => {}
            }

            let (request, on_ack) = if synced {
                (Request::ping(), AckAction::None)
            } else {
                (Request::state_sync(), AckAction::Snapshot)
            };
            let probe = link.send_request(request, on_ack, self.config.command_timeout());
            let result = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return LinkExit::Shutdown,
                result = probe => result,
            };

            match result {
                Ok(_) => {
                    failures = 0;
                    if !synced {
                        synced = true;
                        backoff.reset();
                        self.set_state(ConnectionState::Connected);
                    }
                }
                // The device answered, so the link is alive
                Err(MatrixError::ApiError { detail }) if synced => {
                    tracing::debug!("Keep-alive answered with error: {}", detail);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        "{} to {} failed ({}/{}): {}",
                        if synced { "Keep-alive probe" } else { "State sync" },
                        self.endpoint,
                        failures,
                        threshold,
                        e
                    );
                    if failures >= threshold {
                        return LinkExit::Failed;
                    }
                }
            }
        }
    }
}
