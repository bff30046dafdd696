use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::{Algorithm, Config};

use super::{
    backend::{Backend, ConnectionGuard, Registry},
    lb::{self, FileCursorStore, RoundRobinState},
    metrics,
    policy::{Facet, Fields, HostPolicy},
};

/// The only request path whose forwarded path goes through the rewrite rules.
const REWRITE_PATH: &str = "/v1";

/// What the dispatcher needs to know about an inbound request.
#[derive(Debug, Default, Clone)]
pub struct RequestDescriptor {
    pub host: Option<String>,
    pub path: String,
    pub client_ip: String,
    pub headers: Fields,
    pub params: Fields,
    pub cookies: Fields,
}

/// Instruction to send the request to `backend`, with the facets to send.
/// The form body is streamed after routing, so its rules travel in `policy`.
#[derive(Debug)]
pub struct Forward {
    pub backend: Arc<Backend>,
    pub path: String,
    pub headers: Fields,
    pub params: Fields,
    pub cookies: Fields,
    /// Rules of the matched host, for facets only known after routing.
    pub policy: Option<Arc<HostPolicy>>,
    /// Held for the lifetime of a path-routed forward.
    pub guard: Option<ConnectionGuard>,
}

impl Forward {
    pub fn endpoint(&self) -> &str {
        self.backend.endpoint()
    }
}

#[derive(Debug)]
pub enum RouteDecision {
    Forbidden,
    Unavailable,
    NotFound,
    Forward(Box<Forward>),
}

impl RouteDecision {
    pub fn outcome(&self) -> &'static str {
        match self {
            RouteDecision::Forbidden => "forbidden",
            RouteDecision::Unavailable => "unavailable",
            RouteDecision::NotFound => "not_found",
            RouteDecision::Forward(_) => "forward",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RouteDecision::Forbidden => 403,
            RouteDecision::Unavailable => 503,
            RouteDecision::NotFound => 404,
            RouteDecision::Forward(_) => 200,
        }
    }

    /// Response body of a terminal decision.
    pub fn message(&self) -> &'static str {
        match self {
            RouteDecision::Forbidden => "Forbidden",
            RouteDecision::Unavailable => "No backend servers available.",
            RouteDecision::NotFound => "Not Found",
            RouteDecision::Forward(_) => "",
        }
    }
}

struct HostRoute {
    host: String,
    algo: Algorithm,
    weights: Vec<f64>,
    policy: Arc<HostPolicy>,
}

pub struct Dispatcher {
    hosts: Vec<HostRoute>,
    paths: Vec<String>,
    registry: Arc<Registry>,
    round_robin: RoundRobinState,
}

impl Dispatcher {
    pub fn new(config: &Config, registry: Arc<Registry>, round_robin: RoundRobinState) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|entry| {
                if entry.algo == Algorithm::Weight && entry.weights.is_empty() {
                    warn!(
                        "Host '{}' uses weighted selection without weights, it will never select a backend",
                        entry.host
                    );
                }
                HostRoute {
                    host: entry.host.clone(),
                    algo: entry.algo,
                    weights: entry.weights.clone(),
                    policy: Arc::new(HostPolicy::from(entry)),
                }
            })
            .collect();

        let paths = config.paths.iter().map(|entry| entry.path.clone()).collect();

        Self {
            hosts,
            paths,
            registry,
            round_robin,
        }
    }

    /// Builds the dispatcher, persisting the round-robin cursor when a state file is configured.
    pub fn from_config(config: &Config, registry: Arc<Registry>) -> Self {
        let round_robin = match &config.round_robin.state_file {
            Some(path) => {
                info!("Persisting round-robin cursor to {}", path.display());
                RoundRobinState::with_store(Box::new(FileCursorStore::new(path)))
            }
            None => RoundRobinState::new(),
        };
        Self::new(config, registry, round_robin)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn route(&self, req: RequestDescriptor) -> RouteDecision {
        let decision = self.dispatch(req);
        metrics::ROUTE_DECISIONS
            .with_label_values(&[decision.outcome()])
            .inc();
        decision
    }

    fn matched_host(&self, host: Option<&str>) -> Option<&HostRoute> {
        let host = host?;
        self.hosts.iter().find(|route| route.host == host)
    }

    fn dispatch(&self, req: RequestDescriptor) -> RouteDecision {
        let host = self.matched_host(req.host.as_deref());

        if let Some(route) = host {
            if !route.policy.allow(&req.client_ip, &req.path, &req.headers) {
                return RouteDecision::Forbidden;
            }
            return self.forward_to_host(route, req);
        }

        if let Some(key) = self.paths.iter().find(|path| **path == req.path) {
            return self.forward_to_path(key, req);
        }

        debug!(
            "No route for host {:?} path {}",
            req.host.as_deref().unwrap_or_default(),
            req.path
        );
        RouteDecision::NotFound
    }

    fn forward_to_host(&self, route: &HostRoute, req: RequestDescriptor) -> RouteDecision {
        let Some(backend) = lb::select_backend(
            &self.registry,
            &route.host,
            route.algo,
            &route.weights,
            &self.round_robin,
        ) else {
            warn!("No healthy backend for host '{}'", route.host);
            return RouteDecision::Unavailable;
        };

        let policy = &route.policy;
        let path = if req.path == REWRITE_PATH {
            format!("/{}", policy.rewrite_path(&REWRITE_PATH[1..]))
        } else {
            "/".to_string()
        };

        debug!("Host '{}' -> {}{path}", route.host, backend.endpoint());
        RouteDecision::Forward(Box::new(Forward {
            backend,
            path,
            headers: policy.apply(Facet::Header, req.headers),
            params: policy.apply(Facet::Param, req.params),
            cookies: policy.apply(Facet::Cookie, req.cookies),
            policy: Some(policy.clone()),
            guard: None,
        }))
    }

    fn forward_to_path(&self, key: &str, req: RequestDescriptor) -> RouteDecision {
        let Some(backend) = lb::select_backend(
            &self.registry,
            key,
            Algorithm::Random,
            &[],
            &self.round_robin,
        ) else {
            warn!("No healthy backend for path '{key}'");
            return RouteDecision::Unavailable;
        };

        debug!("Path '{key}' -> {}", backend.endpoint());
        let guard = ConnectionGuard::new(backend.clone());
        RouteDecision::Forward(Box::new(Forward {
            backend,
            path: "/".to_string(),
            headers: req.headers,
            params: req.params,
            cookies: req.cookies,
            policy: None,
            guard: Some(guard),
        }))
    }
}
