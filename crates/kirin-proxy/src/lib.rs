pub mod admission;
pub mod bootstrap;
pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod services;
pub mod state;

pub use config::{ConfigError, ProxyConfig};
pub use error::ProxyError;
pub use services::{Service, ServiceTable};
pub use state::AppState;
