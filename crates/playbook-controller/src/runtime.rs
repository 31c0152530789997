//! Single-writer controller loop.
//!
//! One task owns the [`MetaController`]. Callers send commands through an
//! mpsc channel and read a published snapshot of the metrics; the snapshot
//! may lag the record by at most one command or tick.

use crate::controller::{ConsciousnessMetrics, MetaController};
use crate::novelty::NoveltyMeasurement;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum ControlCommand {
    Observe(NoveltyMeasurement),
    Pressure { entropy: f64, conflict: f64 },
    ResetFatigue,
    Checkpoint,
}

/// Cloneable handle to a running controller loop.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlCommand>,
    snapshot: Arc<RwLock<ConsciousnessMetrics>>,
    cancel: CancellationToken,
}

impl ControllerHandle {
    pub fn metrics(&self) -> ConsciousnessMetrics {
        match self.snapshot.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn tick_rate(&self) -> f64 {
        self.metrics().tick_rate
    }

    pub async fn send(&self, cmd: ControlCommand) -> bool {
        self.tx.send(cmd).await.is_ok()
    }

    /// Non-blocking send for synchronous callers. Drops the command when the
    /// buffer is full.
    pub fn try_send(&self, cmd: ControlCommand) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                warn!("Controller command dropped: {}", e);
                false
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

/// Owns the join handle; dropping it does not stop the loop.
pub struct ControllerTask {
    pub handle: ControllerHandle,
    join: JoinHandle<MetaController>,
}

impl ControllerTask {
    /// Cancel the loop and wait for the final checkpoint.
    pub async fn shutdown(self) -> Option<MetaController> {
        self.handle.cancel();
        match self.join.await {
            Ok(controller) => Some(controller),
            Err(e) => {
                warn!("Controller task failed: {}", e);
                None
            }
        }
    }
}

/// Spawn the loop on the current runtime. When `checkpoint` is set the record
/// is written there every `checkpoint_every` ticks and on shutdown.
pub fn spawn(controller: MetaController, checkpoint: Option<PathBuf>, checkpoint_every: u64) -> ControllerTask {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let snapshot = Arc::new(RwLock::new(controller.metrics()));
    let cancel = CancellationToken::new();
    let handle = ControllerHandle { tx, snapshot: snapshot.clone(), cancel: cancel.clone() };
    let runner = ControllerLoop { controller, rx, snapshot, cancel, checkpoint, checkpoint_every: checkpoint_every.max(1) };
    let join = tokio::spawn(runner.run());
    ControllerTask { handle, join }
}

struct ControllerLoop {
    controller: MetaController,
    rx: mpsc::Receiver<ControlCommand>,
    snapshot: Arc<RwLock<ConsciousnessMetrics>>,
    cancel: CancellationToken,
    checkpoint: Option<PathBuf>,
    checkpoint_every: u64,
}

impl ControllerLoop {
    async fn run(mut self) -> MetaController {
        info!("Controller loop started, interval {:.2}s", self.controller.interval_secs());
        let mut last_tick = Instant::now();
        let mut next_tick = last_tick + interval(&self.controller);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(next_tick) => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick).as_secs_f64();
                    last_tick = now;
                    let decision = self.controller.tick(elapsed);
                    debug!(decision = %decision.decision, "controller tick");
                    if decision.tick % self.checkpoint_every == 0 {
                        self.save();
                    }
                    next_tick = now + interval(&self.controller);
                }
            }
            self.publish();
        }

        self.save();
        info!("Controller loop stopped after {} ticks", self.controller.state().tick_count);
        self.controller
    }

    fn apply(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Observe(m) => {
                self.controller.observe(&m);
            }
            ControlCommand::Pressure { entropy, conflict } => self.controller.report_pressure(entropy, conflict),
            ControlCommand::ResetFatigue => self.controller.reset_fatigue(),
            ControlCommand::Checkpoint => self.save(),
        }
    }

    fn publish(&self) {
        let metrics = self.controller.metrics();
        match self.snapshot.write() {
            Ok(mut slot) => *slot = metrics,
            Err(poisoned) => *poisoned.into_inner() = metrics,
        }
    }

    fn save(&self) {
        if let Some(path) = &self.checkpoint {
            self.controller.checkpoint(path);
        }
    }
}

fn interval(controller: &MetaController) -> Duration {
    Duration::from_secs_f64(controller.interval_secs().max(0.001))
}
