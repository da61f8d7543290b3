use crate::cache::StateCache;
use crate::connection::AckAction;
use crate::error::{MatrixError, Result};
use crate::protocol::Request;
use crate::session::Session;
use crate::types::{stepped_volume, InputIndex, OutputIndex, Zone, ZoneValue, MAX_VOLUME};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// A device command plus the cache updates it implies once acknowledged
struct Command {
    request: Request,
    updates: Vec<ZoneValue>,
}

struct ZoneGate {
    in_flight: Arc<Semaphore>,
    queued: AtomicUsize,
}

/// Holds a place in an output's queue until dropped
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The right to send to one output
pub(crate) struct Turn {
    _permit: OwnedSemaphorePermit,
    /// Whether the caller had to queue behind another command
    pub waited: bool,
}

/// One in-flight command per output, with a bounded FIFO behind it
#[derive(Default)]
pub(crate) struct ZoneGates {
    gates: Mutex<HashMap<OutputIndex, Arc<ZoneGate>>>,
}

impl ZoneGates {
    fn gate(&self, output: OutputIndex) -> Arc<ZoneGate> {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(output)
            .or_insert_with(|| {
                Arc::new(ZoneGate {
                    in_flight: Arc::new(Semaphore::new(1)),
                    queued: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Commands waiting behind the in-flight one
    #[cfg(test)]
    pub fn queued(&self, output: OutputIndex) -> usize {
        self.gate(output).queued.load(Ordering::SeqCst)
    }

    /// Wait for the right to send to `output`
    ///
    /// Fails with `Busy` when `depth` commands are already waiting, and with
    /// `Cancelled` if the epoch moves while queued.
    pub async fn acquire(
        &self,
        output: OutputIndex,
        depth: usize,
        mut epoch: watch::Receiver<u64>,
    ) -> Result<Turn> {
        let start = *epoch.borrow_and_update();
        let gate = self.gate(output);

        if let Ok(permit) = gate.in_flight.clone().try_acquire_owned() {
            return Ok(Turn {
                _permit: permit,
                waited: false,
            });
        }

        if gate.queued.fetch_add(1, Ordering::SeqCst) >= depth {
            gate.queued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Output {} queue is full, rejecting command", output);
            return Err(MatrixError::Busy(output));
        }
        let slot = QueueSlot(&gate.queued);
        tracing::debug!("Output {} has a command in flight, queueing", output);

        let permit = tokio::select! {
            permit = gate.in_flight.clone().acquire_owned() => {
                permit.map_err(|_| MatrixError::Cancelled)?
            }
            _ = epoch.changed() => return Err(MatrixError::Cancelled),
        };
        drop(slot);

        if *epoch.borrow() != start {
            return Err(MatrixError::Cancelled);
        }
        Ok(Turn {
            _permit: permit,
            waited: true,
        })
    }
}

/// Turns intents into acknowledged device commands
///
/// Validation happens here and is surfaced to the caller; nothing is sent for
/// an invalid request.
pub(crate) struct CommandDispatcher {
    session: Arc<Session>,
    cache: StateCache,
    gates: ZoneGates,
}

impl CommandDispatcher {
    pub fn new(session: Arc<Session>, cache: StateCache) -> Self {
        Self {
            session,
            cache,
            gates: ZoneGates::default(),
        }
    }

    pub async fn change_input_for_output(&self, output: OutputIndex, input: InputIndex) -> Result<()> {
        match self.cache.get_input(input) {
            Ok(source) if source.enabled => {}
            Ok(_) => {
                return Err(MatrixError::InvalidSource(format!("input {} is disabled", input)));
            }
            Err(_) => {
                return Err(MatrixError::InvalidSource(format!("input {} does not exist", input)));
            }
        }

        self.fan_out(output, |zone| {
            Ok(Some(Command {
                request: Request::route(zone.index, input),
                updates: vec![ZoneValue::InputChannel(Some(input))],
            }))
        })
        .await
    }

    pub async fn set_output_volume(&self, output: OutputIndex, volume: i32) -> Result<()> {
        if !(0..=i32::from(MAX_VOLUME)).contains(&volume) {
            return Err(MatrixError::InvalidArgument(format!(
                "volume {} is outside 0..={}",
                volume, MAX_VOLUME
            )));
        }
        let volume = volume as u8;

        self.fan_out(output, |zone| {
            Ok(Some(Command {
                request: Request::volume(zone.index, volume),
                updates: vec![ZoneValue::Volume(Some(volume))],
            }))
        })
        .await
    }

    /// Step from the last known volume of each affected output
    pub async fn step_output_volume(&self, output: OutputIndex, delta: i32) -> Result<()> {
        self.fan_out(output, |zone| {
            let current = zone.volume.ok_or_else(|| {
                MatrixError::Precondition(format!(
                    "output {} has no known volume; step requires a known baseline",
                    zone.index
                ))
            })?;
            let volume = stepped_volume(current, delta);
            if volume == current {
                return Ok(None);
            }
            Ok(Some(Command {
                request: Request::volume(zone.index, volume),
                updates: vec![ZoneValue::Volume(Some(volume))],
            }))
        })
        .await
    }

    pub async fn mute_output(&self, output: OutputIndex, muted: bool) -> Result<()> {
        self.fan_out(output, |zone| {
            if zone.muted == muted {
                tracing::debug!("Output {} already has mute={}", zone.index, muted);
                return Ok(None);
            }
            Ok(Some(Command {
                request: Request::mute(zone.index, muted),
                updates: vec![ZoneValue::Muted(muted)],
            }))
        })
        .await
    }

    /// Run `build` against `output`, then against each member if it leads a group
    ///
    /// A failure on the master aborts the fan-out; member failures are logged
    /// and the first one is returned after every member was attempted.
    async fn fan_out<F>(&self, output: OutputIndex, build: F) -> Result<()>
    where
        F: Fn(&Zone) -> Result<Option<Command>>,
    {
        let members = self.cache.get_output(output)?.group.members();
        self.execute(output, &build).await?;

        let mut first_error = None;
        for member in members {
            if let Err(e) = self.execute(member, &build).await {
                tracing::warn!("Group command for member {} of {} failed: {}", member, output, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Send one command to one output once it is this caller's turn
    ///
    /// The command is built after the turn arrives so it sees the state left
    /// by the command ahead of it.
    async fn execute<F>(&self, output: OutputIndex, build: &F) -> Result<()>
    where
        F: Fn(&Zone) -> Result<Option<Command>>,
    {
        let config = self.session.config();
        let epoch = self.session.epoch();
        let start = *epoch.borrow();
        let turn = self
            .gates
            .acquire(output, config.zone_queue_depth, epoch.clone())
            .await?;

        let zone = self.cache.get_output(output)?;
        let Some(command) = build(&zone)? else {
            return Ok(());
        };

        // A queued command never outlives the link it was queued on
        let link = match self.session.link() {
            Ok(link) => link,
            Err(_) if turn.waited => return Err(MatrixError::Cancelled),
            Err(e) => return Err(e),
        };
        if *epoch.borrow() != start {
            return Err(MatrixError::Cancelled);
        }
        link.send_request(
            command.request,
            AckAction::Output {
                output,
                updates: command.updates,
            },
            config.command_timeout(),
        )
        .await?;
        Ok(())
    }
}
