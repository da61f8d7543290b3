use crate::cache::{SourceDirectory, StateCache};
use crate::config::MatrixConfig;
use crate::connection::AckAction;
use crate::dispatcher::CommandDispatcher;
use crate::error::{MatrixError, Result};
use crate::protocol::Request;
use crate::session::Session;
use crate::subscription::{ChangeBus, ChangeEvent, NotifierHandle, Subscription};
use crate::types::{ConnectionState, Endpoint, InputIndex, OutputIndex, Source, Zone, ZoneSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Client for one AC-MAX-24 / Xantech audio matrix
///
/// The `Matrix` owns the session to the amplifier, the cached state of its
/// inputs and outputs, and the command queue. It lives as long as the
/// process needs the device; the link underneath may drop and come back
/// without changing input or output identities.
pub struct Matrix {
    session: Arc<Session>,
    cache: StateCache,
    dispatcher: CommandDispatcher,
}

impl Matrix {
    /// Create a handle for the amplifier at `endpoint` with default settings
    ///
    /// Nothing is opened until [`Matrix::start`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use acmax24::Matrix;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let matrix = Matrix::create("192.168.1.60")?;
    ///     matrix.start().await?;
    ///     if matrix.wait_for_initial_state(Duration::from_secs(5)).await {
    ///         for zone in matrix.get_enabled_outputs() {
    ///             println!("{}: {:?}", zone.label, zone.volume);
    ///         }
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn create(endpoint: &str) -> Result<Self> {
        Self::with_config(endpoint, MatrixConfig::default())
    }

    /// Create a handle with explicit session settings
    pub fn with_config(endpoint: &str, config: MatrixConfig) -> Result<Self> {
        config.validate()?;
        let endpoint: Endpoint = endpoint.parse()?;

        let bus = ChangeBus::new(config.notification_capacity);
        let cache = StateCache::new(bus);
        let session = Arc::new(Session::new(endpoint, config, cache.clone()));
        let dispatcher = CommandDispatcher::new(session.clone(), cache.clone());

        Ok(Self {
            session,
            cache,
            dispatcher,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.session.endpoint()
    }

    /// Open the link and begin syncing state
    ///
    /// Fails with [`MatrixError::Connection`] if the amplifier cannot be
    /// reached within the connect timeout. Once this returns the session keeps
    /// itself connected until [`Matrix::close`].
    pub async fn start(&self) -> Result<()> {
        self.session.start().await
    }

    /// Wait until the first full snapshot has arrived
    ///
    /// Returns `false` if it did not arrive within `wait`; a zero wait just
    /// reports the current readiness.
    pub async fn wait_for_initial_state(&self, wait: Duration) -> bool {
        let mut ready = self.cache.ready_receiver();
        let reached = matches!(timeout(wait, ready.wait_for(|ready| *ready)).await, Ok(Ok(_)));
        reached
    }

    /// Whether the first full snapshot has arrived
    pub fn is_ready(&self) -> bool {
        self.cache.is_ready()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    /// Refresh input and output labels from the amplifier
    pub async fn update(&self) -> Result<()> {
        let link = self.session.link()?;
        link.send_request(
            Request::labels(),
            AckAction::Labels,
            self.session.config().command_timeout(),
        )
        .await?;
        Ok(())
    }

    /// Tear down the session
    ///
    /// Commands in flight or queued resolve as [`MatrixError::Cancelled`].
    /// Cached state stays readable.
    pub async fn close(&self) {
        self.session.close().await;
    }

    // ========== State ==========

    pub fn get_enabled_inputs(&self) -> Vec<Source> {
        self.cache.enabled_inputs()
    }

    pub fn get_enabled_outputs(&self) -> Vec<Zone> {
        self.cache.enabled_outputs()
    }

    /// Get an input by index
    ///
    /// [`MatrixError::NotFound`] means the input is not currently known; treat
    /// it as unavailable rather than fatal.
    pub fn get_input(&self, index: InputIndex) -> Result<Source> {
        self.cache.get_input(index)
    }

    /// Get an output by index
    pub fn get_output(&self, index: OutputIndex) -> Result<Zone> {
        self.cache.get_output(index)
    }

    /// The input currently routed to an output, if any
    pub fn zone_source(&self, output: OutputIndex) -> Result<Option<Source>> {
        let zone = self.cache.get_output(output)?;
        Ok(zone
            .input_channel
            .and_then(|input| self.cache.get_input(input).ok()))
    }

    /// Label/index lookup over the enabled inputs
    pub fn sources(&self) -> SourceDirectory {
        self.cache.source_directory()
    }

    /// Enabled input labels ordered by input index
    pub fn source_list(&self) -> Vec<String> {
        self.cache.source_directory().labels()
    }

    pub fn source_index(&self, label: &str) -> Option<InputIndex> {
        self.cache.source_directory().index_of(label)
    }

    // ========== Commands ==========

    /// Route `input` to `output`
    ///
    /// Fails with [`MatrixError::InvalidSource`] when the input is unknown or
    /// disabled. Once this returns `Ok` the cached output reflects the new
    /// routing.
    pub async fn change_input_for_output(&self, output: OutputIndex, input: InputIndex) -> Result<()> {
        tracing::info!("Switching output {} to input {}", output, input);
        self.dispatcher.change_input_for_output(output, input).await
    }

    /// Route the input with the given label to `output`
    pub async fn select_source(&self, output: OutputIndex, label: &str) -> Result<()> {
        let input = self.source_index(label).ok_or_else(|| {
            MatrixError::InvalidSource(format!(
                "'{}' is not one of {:?}",
                label,
                self.source_list()
            ))
        })?;
        self.change_input_for_output(output, input).await
    }

    /// Route the input with the given label to every enabled output
    pub async fn select_source_for_all(&self, label: &str) -> Result<()> {
        let input = self.source_index(label).ok_or_else(|| {
            MatrixError::InvalidSource(format!(
                "'{}' is not one of {:?}",
                label,
                self.source_list()
            ))
        })?;

        let mut first_error = None;
        for zone in self.cache.enabled_outputs() {
            if let Err(e) = self.dispatcher.change_input_for_output(zone.index, input).await {
                tracing::warn!("Could not switch output {} to '{}': {}", zone.index, label, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn mute_output(&self, output: OutputIndex, muted: bool) -> Result<()> {
        tracing::debug!("Setting mute={} for output {}", muted, output);
        self.dispatcher.mute_output(output, muted).await
    }

    /// Set an absolute volume in 0..=100
    ///
    /// Out-of-range values fail with [`MatrixError::InvalidArgument`]; nothing
    /// is clamped.
    pub async fn set_output_volume(&self, output: OutputIndex, volume: i32) -> Result<()> {
        tracing::debug!("Setting output {} volume to {}", output, volume);
        self.dispatcher.set_output_volume(output, volume).await
    }

    /// Move the volume by `delta`, clamped to 0..=100
    ///
    /// Fails with [`MatrixError::Precondition`] while the volume is unknown.
    pub async fn step_output_volume(&self, output: OutputIndex, delta: i32) -> Result<()> {
        tracing::debug!("Stepping output {} volume by {}", output, delta);
        self.dispatcher.step_output_volume(output, delta).await
    }

    // ========== Grouping ==========

    /// Group `members` under `master`; commands to the master then apply to
    /// every member
    pub fn join(&self, master: OutputIndex, members: &[OutputIndex]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        tracing::info!("Grouping outputs {:?} under output {}", members, master);
        self.cache.join(master, members)
    }

    /// Remove outputs from their groups; a master takes its whole group apart
    pub fn unjoin(&self, outputs: &[OutputIndex]) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        tracing::info!("Ungrouping outputs {:?}", outputs);
        self.cache.unjoin(outputs)
    }

    // ========== Snapshot / restore ==========

    /// Remember an output's routing, volume and mute
    pub fn snapshot_zone(&self, output: OutputIndex) -> Result<ZoneSnapshot> {
        let snapshot = ZoneSnapshot::from(&self.cache.get_output(output)?);
        tracing::info!("Saved state snapshot for output {}", output);
        Ok(snapshot)
    }

    /// Re-apply a saved snapshot
    ///
    /// Goes through the normal command path, so if the output currently leads
    /// a group its members follow.
    pub async fn restore_zone(&self, snapshot: &ZoneSnapshot) -> Result<()> {
        let zone = self.cache.get_output(snapshot.index)?;

        if let Some(input) = snapshot.input_channel {
            if zone.input_channel != Some(input) {
                self.dispatcher.change_input_for_output(snapshot.index, input).await?;
            }
        }
        if let Some(volume) = snapshot.volume {
            if zone.volume != Some(volume) {
                self.dispatcher
                    .set_output_volume(snapshot.index, i32::from(volume))
                    .await?;
            }
        }
        self.dispatcher.mute_output(snapshot.index, snapshot.muted).await?;
        tracing::info!("Restored previous state for output {}", snapshot.index);
        Ok(())
    }

    // ========== Notifications ==========

    /// Receive change events through an explicit subscription
    pub fn subscribe(&self) -> Subscription {
        self.cache.bus().subscribe()
    }

    /// Invoke `callback` whenever an input, output or link attribute changes
    ///
    /// Callbacks run on a background task, never on the path that mutates
    /// state. Must be called from within a Tokio runtime.
    pub fn register_change_notifier<F>(&self, callback: F) -> NotifierHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.cache.bus().register(callback)
    }
}

impl Drop for Matrix {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}
