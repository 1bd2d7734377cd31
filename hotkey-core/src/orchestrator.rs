// Update orchestrator: Discovery -> Fetch/Apply -> Restart
//
// Each run is a background task with its own state machine. Runs end
// either in a restart (never returns) or in a logged failure.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::OtaConfig;
use crate::control::UpdateTrigger;
use crate::discovery::{discover, Discovery};
use crate::error::{LaunchError, OtaError};
use crate::fetch::{fetch_and_apply, FirmwareSource, FirmwareUrl, UpdateSlot};
use crate::run_token::RunToken;
use crate::status::{StatusBoard, Trigger};
use crate::trust::TrustAnchor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Discovering,
    Fetching,
    Applying,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    /// Startup grace period elapsed
    Start,
    Resolved,
    /// Any discovery failure, timeouts included
    NotFound,
    Applied,
    FetchFailed,
    /// Applying always proceeds to success
    Activated,
}

impl RunState {
    /// Transition table. Events that make no sense in the current state
    /// leave it unchanged.
    pub fn next(self, event: RunEvent) -> RunState {
        use RunEvent as E;
        use RunState as S;

        match (self, event) {
            (S::Idle, E::Start) => S::Discovering,
            (S::Discovering, E::NotFound) => S::Failed,
            (S::Discovering, E::Resolved) => S::Fetching,
            (S::Fetching, E::FetchFailed) => S::Failed,
            (S::Fetching, E::Applied) => S::Applying,
            (S::Applying, E::Activated) => S::Succeeded,
            (state, _) => state,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Discovering => "discovering",
            RunState::Fetching => "fetching",
            RunState::Applying => "applying",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Device restart. Implementations never return.
pub trait Restart {
    fn restart(&self) -> !;
}

pub trait Delay {
    fn delay(&self, duration: Duration);
}

/// Blocks the calling thread; on ESP-IDF this is a FreeRTOS task delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Everything a run needs from the device.
pub trait Platform: Send + Sync + 'static {
    type Discovery: Discovery;
    type Source: FirmwareSource;
    type Slot: UpdateSlot;
    type Restart: Restart;
    type Delay: Delay;

    fn discovery(&self) -> &Self::Discovery;
    fn source(&self) -> &Self::Source;
    fn slot(&self) -> &Self::Slot;
    fn restarter(&self) -> &Self::Restart;
    fn delay(&self) -> &Self::Delay;
}

pub struct Orchestrator<P: Platform> {
    platform: P,
    config: OtaConfig,
    anchor: TrustAnchor,
    status: StatusBoard,
}

impl<P: Platform> Orchestrator<P> {
    pub fn new(platform: P, config: OtaConfig, anchor: TrustAnchor, status: StatusBoard) -> Self {
        Self { platform, config, anchor, status }
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Execute one run. Returns only on failure; success ends in a restart.
    pub fn run(&self, run_id: u32) -> Result<Infallible, OtaError> {
        let mut state = RunState::Idle;

        log::info!(
            "Run {}: waiting {} ms for the network to settle",
            run_id,
            self.config.startup_grace_ms
        );
        self.platform.delay().delay(self.config.startup_grace());
        state = self.advance(run_id, state, RunEvent::Start);

        let address = match discover(self.platform.discovery(), &self.config) {
            Ok(address) => address,
            Err(e) => return self.fail(run_id, state, RunEvent::NotFound, e.into()),
        };
        self.status.record_address(run_id, address);
        state = self.advance(run_id, state, RunEvent::Resolved);

        let url = FirmwareUrl::new(address, &self.config);
        let image = match fetch_and_apply(
            self.platform.source(),
            self.platform.slot(),
            &url,
            &self.anchor,
            self.config.chunk_size,
        ) {
            Ok(image) => image,
            Err(e) => return self.fail(run_id, state, RunEvent::FetchFailed, e.into()),
        };
        self.status.record_image(run_id, &image);
        state = self.advance(run_id, state, RunEvent::Applied);
        self.advance(run_id, state, RunEvent::Activated);

        log::info!(
            "Run {}: firmware upgrade success, rebooting in {} ms",
            run_id,
            self.config.restart_delay_ms
        );
        self.platform.delay().delay(self.config.restart_delay());
        self.platform.restarter().restart()
    }

    fn advance(&self, run_id: u32, from: RunState, event: RunEvent) -> RunState {
        let to = from.next(event);
        if to == from {
            log::warn!("Run {}: ignoring {:?} in state {}", run_id, event, from);
        } else {
            log::debug!("Run {}: {} -> {}", run_id, from, to);
            self.status.set_state(run_id, to);
        }
        to
    }

    fn fail(
        &self,
        run_id: u32,
        state: RunState,
        event: RunEvent,
        error: OtaError,
    ) -> Result<Infallible, OtaError> {
        self.advance(run_id, state, event);
        self.status.record_error(run_id, &error.to_string());
        Err(error)
    }
}

/// Starts orchestrator runs as background tasks, one at a time.
pub struct UpdateLauncher<P: Platform> {
    orchestrator: Arc<Orchestrator<P>>,
    token: RunToken,
    next_id: Arc<AtomicU32>,
}

impl<P: Platform> Clone for UpdateLauncher<P> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            token: self.token.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<P: Platform> UpdateLauncher<P> {
    pub fn new(orchestrator: Orchestrator<P>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            token: RunToken::new(),
            next_id: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn status(&self) -> &StatusBoard {
        self.orchestrator.status()
    }

    pub fn is_running(&self) -> bool {
        self.token.is_busy()
    }

    /// Spawn a run unless one is already active. Returns the run id.
    pub fn launch(&self, trigger: Trigger) -> Result<u32, LaunchError> {
        let Some(guard) = self.token.try_acquire() else {
            log::warn!("Update request ({}) rejected: a run is already in progress", trigger);
            self.status().record_rejection();
            return Err(LaunchError::Busy);
        };

        let run_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.status().begin(run_id, trigger);
        log::info!("Launching update run {} ({})", run_id, trigger);

        let orchestrator = Arc::clone(&self.orchestrator);
        let spawned = thread::Builder::new()
            .name("ota_task".into())
            .stack_size(orchestrator.config().task_stack_size)
            .spawn(move || {
                let _guard = guard;
                match orchestrator.run(run_id) {
                    Ok(never) => match never {},
                    Err(e) => log::error!("Run {}: firmware upgrade failed: {}", run_id, e),
                }
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn update task: {}", e);
            self.status().record_error(run_id, &e.to_string());
            return Err(LaunchError::Spawn(e.to_string()));
        }
        Ok(run_id)
    }
}

impl<P: Platform> UpdateTrigger for UpdateLauncher<P> {
    fn request_update(&self) -> Result<u32, LaunchError> {
        self.launch(Trigger::Control)
    }
}
