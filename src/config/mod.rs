// Configuration module
// Runtime configuration loading and backend profiles

pub mod backend;
mod loader;
mod settings;

pub use backend::{BackendKind, WireFamily};
pub use loader::{load_config, load_config_from};
pub use settings::{default_state_dir, Config};
