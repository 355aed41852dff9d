pub mod auth;
pub mod checker;
pub mod config;
pub mod proxy;
pub mod rules;
pub mod static_srv;
pub mod stats;

pub use config::ProxyConfig;
pub use proxy::Proxy;
