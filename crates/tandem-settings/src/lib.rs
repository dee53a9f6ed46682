//! # tandem-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TandemSettings::default()`]
//! 2. **Settings file**: `~/.tandem/settings.json` or `--config`, deep-merged over defaults
//! 3. **Environment**: `TANDEM_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, expand_home, load_settings, load_settings_from_path, settings_path};
pub use types::*;
