//! Core of a Redis protocol proxy: in-order command dispatch, key routing
//! and sentinel-driven upstream discovery.

pub mod auth;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod info;
pub mod keys;
pub mod limit;
pub mod metrics;
pub mod plugin;
pub mod protocol;
pub mod proxy;
pub mod sentinel;
pub mod session;
pub mod task;
pub mod upstream;
pub mod utils;

pub use dispatch::{CommandDispatcher, CommandInvokeConfig};
pub use proxy::ProxyCore;
