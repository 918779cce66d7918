//! Liveness detection for sandboxes.
//!
//! The [`HealthMonitor`] talks to a sandbox's own bundler endpoint and never to the control
//! plane. A failing probe is data, not an error: it shows up in [`HealthState`] and is
//! escalated through [`HealthCallbacks::on_error`] once the failure threshold is reached.

mod classify;
mod monitor;
mod probe;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use classify::*;
pub use monitor::*;
pub use probe::*;
