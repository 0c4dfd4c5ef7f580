//! # overwatch-settings
//!
//! Layered configuration for the overwatch server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`OverwatchSettings::default()`]
//! 2. **User file**: `~/.overwatch/settings.json` or `--config` (deep-merged over defaults)
//! 3. **Environment variables**: `OVERWATCH_*` overrides (highest priority)
//!
//! ```no_run
//! use overwatch_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, resolve_path, settings_path};
pub use types::*;
