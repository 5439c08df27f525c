//! chatrelay core: configuration, the app registry model, and the shared
//! error taxonomy.

pub mod apps;
pub mod config;
pub mod error;

pub use apps::{load_app_seed, AppConfig, AppSummary, Platform};
pub use config::{DataPaths, RelayConfig, DEFAULT_SYSTEM_USER_ID};
pub use error::{Error, Result};
