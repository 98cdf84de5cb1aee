//! Upstream sessions backing the sentinel-fed template.

pub mod client;
pub mod connector;
pub mod pool;
