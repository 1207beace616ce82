//! # tether-settings
//!
//! Configuration for the Tether server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over the defaults
//! 3. **Environment variables**: `TETHER_*` overrides
//!
//! WebSocket endpoints read their tuning from a named class under
//! `websockets`, see [`TetherSettings::websocket`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
