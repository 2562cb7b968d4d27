pub mod config;
pub mod error;
pub mod paths;
pub mod schema;
pub mod store;

pub use config::{load_config, load_config_or_default, parse_config, to_toml};
pub use error::{Result, StoreError};
pub use paths::{DATA_DIR_ENV, config_path, database_path, default_base_dir};
pub use store::{ScopeEntry, Store};
