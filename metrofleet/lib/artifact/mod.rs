//! Connection artifacts.
//!
//! A device joins a sandbox by scanning a QR code of its bundler URL. Rendering is cheap but
//! not free, so [`ArtifactCache`] keeps generated codes around for a while, usually keyed by
//! the task the sandbox belongs to.

mod cache;
mod qr;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cache::*;
pub use qr::*;
