//! `metrofleet` provisions, monitors and reclaims remote bundler sandboxes used to preview
//! mobile apps live on a device.
//!
//! # Overview
//!
//! Every preview task gets a sandbox: a container on a remote control plane running a Metro
//! bundler image behind a public URL. metrofleet takes care of the whole life of that sandbox:
//!
//! - Provisioning through a GraphQL control plane, with retries and exponential backoff
//! - Health monitoring over HTTP, with failure counting and automatic restarts
//! - Classification of bundler logs into actionable failures
//! - Reclaiming sandboxes that have been idle for too long
//! - Rendering the bundler URL as a QR code that a device can scan
//!
//! # Modules
//!
//! - [`remote`]: The control-plane seam and its GraphQL client
//! - [`lifecycle`]: Provisioning, recovery and inactivity sweeps
//! - [`health`]: HTTP probing, monitoring loops and log classification
//! - [`artifact`]: QR connection codes and their TTL cache
//! - [`store`]: Sandbox records in SQLite and injectable in-process maps
//! - [`config`]: The `metrofleet.toml` configuration and its defaults
//! - [`models`]: Records, statuses and lifecycle events
//! - [`cli`]: Command line arguments of the `metrofleet` binary
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use metrofleet::{
//!     config::FleetConfig,
//!     health::HealthMonitor,
//!     lifecycle::LifecycleService,
//!     remote::RemoteControlClient,
//!     store::SqliteSandboxStore,
//! };
//!
//! # async fn run() -> metrofleet::FleetResult<()> {
//! let config = FleetConfig::load("metrofleet.toml").await?;
//! let control = Arc::new(RemoteControlClient::new(config.get_control_plane())?);
//! let store = Arc::new(SqliteSandboxStore::open(config.get_store().get_database_path()).await?);
//! let monitor = HealthMonitor::new(config.get_health());
//!
//! let service = LifecycleService::with_monitor(
//!     control,
//!     store,
//!     monitor,
//!     config.get_lifecycle().clone(),
//! );
//!
//! let sandbox = service.provision_container("task-1", "user-1").await?;
//! println!("bundler is at {}", sandbox.metro_url);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod artifact;
pub mod cli;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod remote;
pub mod store;

pub use error::*;
