//! Hotkey Core - Hardware-independent OTA orchestration and control-plane logic
//!
//! This crate contains everything the firmware does that can be expressed
//! without ESP-IDF: the discovery and fetch/apply contracts, the update
//! state machine, the single-run token and the control-plane semantics.
//! The firmware crate plugs ESP-IDF implementations into the traits here;
//! the tests plug in scripted fakes.

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod run_token;
pub mod status;
pub mod trust;

#[cfg(test)]
mod testing;

pub use config::{fingerprint, restore_settings, AccessPointConfig, OtaConfig, SettingsSource, StoredSettings};
pub use control::{ControlPlane, OutputLine, Reply, Route, UpdateTrigger};
pub use discovery::{discover, Discovery, ServiceAddress};
pub use error::{ConfigError, DiscoveryError, FetchError, LaunchError, OtaError};
pub use fetch::{fetch_and_apply, AppliedImage, FirmwareBody, FirmwareSource, FirmwareUrl, SlotWriter, UpdateSlot};
pub use orchestrator::{Delay, Orchestrator, Platform, Restart, RunEvent, RunState, ThreadDelay, UpdateLauncher};
pub use run_token::{RunGuard, RunToken};
pub use status::{RunReport, StatusBoard, Trigger};
pub use trust::TrustAnchor;
