//! tunnelwatch CLI library
//!
//! Settings storage and the host lifecycle runner behind the `tunnelwatch`
//! binary.

pub mod runner;
pub mod settings;

pub use runner::{run, RunOptions};
pub use settings::{Settings, SettingsStore, SETTINGS_VERSION};
