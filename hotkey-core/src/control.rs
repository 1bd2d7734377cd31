// Local control plane: toggle the actuation line, request an update, read status

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::LaunchError;
use crate::status::StatusBoard;

/// The one GPIO line the control plane drives. Direction is configured by
/// whoever builds the line.
pub trait OutputLine: Send {
    type Error: fmt::Debug;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error>;
}

/// Something that can start an update run on request.
pub trait UpdateTrigger: Send + Sync {
    fn request_update(&self) -> Result<u32, LaunchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Toggle,
    Update,
    Status,
}

impl Route {
    pub const ALL: [Route; 3] = [Route::Toggle, Route::Update, Route::Status];

    pub fn path(self) -> &'static str {
        match self {
            Route::Toggle => "/toggle",
            Route::Update => "/update",
            Route::Status => "/status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: "OK".to_string(),
        }
    }

    pub fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            _ => "",
        }
    }
}

/// Current level of the actuation line plus the line itself. Flip and
/// write happen under one lock, so writes follow toggle order.
struct ActuationState<L> {
    level: bool,
    line: L,
}

pub struct ControlPlane<L, U> {
    actuation: Mutex<ActuationState<L>>,
    updates: U,
    status: StatusBoard,
}

impl<L: OutputLine, U: UpdateTrigger> ControlPlane<L, U> {
    /// `line` is assumed to be driven low already.
    pub fn new(line: L, updates: U, status: StatusBoard) -> Self {
        Self {
            actuation: Mutex::new(ActuationState { level: false, line }),
            updates,
            status,
        }
    }

    pub fn level(&self) -> bool {
        self.actuation().level
    }

    /// Flip the level and mirror it onto the line. Returns the new level.
    pub fn toggle(&self) -> bool {
        let mut state = self.actuation();
        state.level = !state.level;
        let level = state.level;
        if let Err(e) = state.line.set_level(level) {
            log::error!("Failed to drive output line {}: {:?}", level_name(level), e);
        }
        level
    }

    /// Serve one request. The reply goes out first; the side effect runs
    /// after it, even if the reply could not be delivered.
    pub fn handle<F, E>(&self, route: Route, respond: F) -> Result<(), E>
    where
        F: FnOnce(Reply) -> Result<(), E>,
    {
        match route {
            Route::Toggle => {
                let replied = respond(Reply::ok());
                let level = self.toggle();
                log::info!("Output line toggled {}", level_name(level));
                replied
            }
            Route::Update => {
                let replied = respond(Reply::ok());
                match self.updates.request_update() {
                    Ok(run_id) => log::info!("Update run {} requested over HTTP", run_id),
                    Err(e) => log::warn!("Update request not started: {}", e),
                }
                replied
            }
            Route::Status => respond(Reply::json(self.status.to_json())),
        }
    }

    fn actuation(&self) -> MutexGuard<'_, ActuationState<L>> {
        self.actuation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn level_name(level: bool) -> &'static str {
    if level {
        "high"
    } else {
        "low"
    }
}
