//! Dependency watch and cross-instance dedup core for template rendering.
//!
//! Templates name the external data they need as [`Dependency`] values. The
//! [`Watcher`] runs one blocking-query view per distinct dependency and
//! stores results in the shared [`Brain`]; the [`DedupManager`] lets a fleet
//! of instances elect one leader per template that watches and publishes the
//! values for everyone else. [`Manager`] wires both together.

mod brain;
mod client;
mod config;
mod constants;
mod dedup;
mod dependency;
mod errors;
mod manager;
mod template;
mod watch;
pub mod metrics;
pub mod utils;
pub mod version;

pub use brain::*;
pub use client::*;
pub use config::*;
pub use dedup::*;
pub use dependency::*;
pub use errors::*;
pub use manager::*;
pub use template::*;
pub use utils::*;
pub use watch::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
