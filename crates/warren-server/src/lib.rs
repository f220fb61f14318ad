pub mod broadcaster;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod server;

pub use config::{Config, ConfigFile};
pub use error::ServerError;
pub use server::Server;
