pub mod config;
pub mod error;
pub mod manager_client;
pub mod relay_client;

pub use config::{Config, ConfigFile};
pub use error::ClientError;
