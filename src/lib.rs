//! Config-driven HTTP load balancer built on pingora.
//!
//! Requests are routed by Host header or exact path to a pool of backends,
//! filtered by per-host firewall rules and rewritten by per-host facet rules.

pub mod config;
pub mod logging;
pub mod proxy;
pub mod service;
pub(crate) mod utils;
