use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use http::Uri;
use log::{debug, info, warn};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use pingora_error::Error;
use pingora_http::ResponseHeader;
use pingora_load_balancing::{
    health_check::{HealthCheck as HealthCheckTrait, HttpHealthCheck, TcpHealthCheck},
    Backend as LbBackend,
};
use tokio::time::{timeout, MissedTickBehavior};

use crate::config;

use super::{backend::Registry, metrics};

/// Liveness check for one `host:port` endpoint. Failures of any kind are `false`.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn is_alive(&self, endpoint: &str) -> bool;
}

/// Resolves the endpoint, then runs a pingora TCP or HTTP health check
/// against each resolved address until one passes.
pub struct PingoraCheck {
    /// Shared check. `None` for HTTP checks without a configured Host, which
    /// are built per endpoint.
    check: Option<Box<dyn HealthCheckTrait + Send + Sync>>,
    config: config::HealthCheck,
    timeout: Duration,
}

impl From<&config::HealthCheck> for PingoraCheck {
    fn from(value: &config::HealthCheck) -> Self {
        let check: Option<Box<dyn HealthCheckTrait + Send + Sync>> = match value.r#type {
            config::CheckType::Tcp => Some(tcp_check(value)),
            config::CheckType::Http => value
                .host
                .as_deref()
                .map(|host| http_check(value, host) as Box<dyn HealthCheckTrait + Send + Sync>),
        };

        Self {
            check,
            config: value.clone(),
            timeout: Duration::from_secs(value.timeout),
        }
    }
}

fn tcp_check(value: &config::HealthCheck) -> Box<TcpHealthCheck> {
    let mut health_check = TcpHealthCheck::new();
    health_check.peer_template.options.total_connection_timeout =
        Some(Duration::from_secs(value.timeout));
    health_check
}

/// HTTP check sending `host` as the Host header.
fn http_check(value: &config::HealthCheck, host: &str) -> Box<HttpHealthCheck> {
    let mut health_check = HttpHealthCheck::new(host, false);

    let timeout = Some(Duration::from_secs(value.timeout));
    health_check.peer_template.options.total_connection_timeout = timeout;
    health_check.peer_template.options.read_timeout = timeout;

    match Uri::builder().path_and_query(value.http_path.as_str()).build() {
        Ok(uri) => health_check.req.set_uri(uri),
        Err(e) => warn!("Invalid health check path {}: {e}", value.http_path),
    }

    if !value.http_statuses.is_empty() {
        let http_statuses = value.http_statuses.clone();
        health_check.validator = Some(Box::new(move |header: &ResponseHeader| {
            if http_statuses.contains(&header.status.as_u16()) {
                Ok(())
            } else {
                Err(Error::new_str("Unexpected health check status"))
            }
        }));
    }

    Box::new(health_check)
}

impl PingoraCheck {
    async fn resolve(&self, endpoint: &str) -> Vec<SocketAddr> {
        match timeout(self.timeout, tokio::net::lookup_host(endpoint)).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                debug!("Failed to resolve {endpoint}: {e}");
                Vec::new()
            }
            Err(_) => {
                debug!("Timed out resolving {endpoint}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl LivenessCheck for PingoraCheck {
    async fn is_alive(&self, endpoint: &str) -> bool {
        let per_endpoint;
        let check: &(dyn HealthCheckTrait + Send + Sync) = match &self.check {
            Some(check) => check.as_ref(),
            None => {
                per_endpoint = http_check(&self.config, endpoint);
                &*per_endpoint
            }
        };

        for addr in self.resolve(endpoint).await {
            let backend = match LbBackend::new(&addr.to_string()) {
                Ok(backend) => backend,
                Err(e) => {
                    debug!("Unusable address {addr} for {endpoint}: {e}");
                    continue;
                }
            };

            match timeout(self.timeout, check.check(&backend)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => debug!("Health check of {endpoint} via {addr} failed: {e}"),
                Err(_) => debug!("Health check of {endpoint} via {addr} timed out"),
            }
        }

        false
    }
}

/// Refreshes the health flag of every backend in the registry.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    checker: Box<dyn LivenessCheck>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, checker: Box<dyn LivenessCheck>, interval: Duration) -> Self {
        Self {
            registry,
            checker,
            interval,
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &config::HealthCheck) -> Self {
        Self::new(
            registry,
            Box::new(PingoraCheck::from(config)),
            Duration::from_secs(config.interval),
        )
    }

    /// Checks each distinct endpoint once and applies the result to every
    /// backend sharing that endpoint.
    pub async fn refresh(&self) {
        let mut seen = HashSet::new();
        let endpoints: Vec<&str> = self
            .registry
            .backends()
            .map(|b| b.endpoint())
            .filter(|e| seen.insert(*e))
            .collect();

        let results: HashMap<&str, bool> = join_all(endpoints.into_iter().map(|endpoint| async move {
            (endpoint, self.checker.is_alive(endpoint).await)
        }))
        .await
        .into_iter()
        .collect();

        for (endpoint, healthy) in results.iter() {
            let result = if *healthy { "success" } else { "failure" };
            metrics::HEALTH_CHECKS.with_label_values(&[result]).inc();
            debug!("Health check {endpoint}: {result}");
        }

        for backend in self.registry.backends() {
            let healthy = results.get(backend.endpoint()).copied().unwrap_or(false);
            let was_healthy = backend.set_healthy(healthy);
            if was_healthy && !healthy {
                warn!("Backend {} is now unhealthy", backend.endpoint());
            } else if !was_healthy && healthy {
                info!("Backend {} is healthy again", backend.endpoint());
            }
        }
    }
}

#[async_trait]
impl BackgroundService for HealthMonitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!("Starting health checks every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("Shutdown signal received, stopping health checks");
                    break;
                }
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }
}
