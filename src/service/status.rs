use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Status,
    proxy::backend::Registry,
    utils::response::ResponseBuilder,
};

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

/// Readiness and backend health endpoints on their own listener.
pub struct StatusHttpApp {
    registry: Arc<Registry>,
}

impl StatusHttpApp {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn status_http_service(cfg: &Status, registry: Arc<Registry>) -> Service<Self> {
        let mut service = Service::new("Status HTTP".to_string(), Self::new(registry));
        service.add_tcp(&cfg.address.to_string());
        service
    }

    fn route(&self, path: &str) -> Response<Vec<u8>> {
        match path {
            "/status/ready" => ResponseBuilder::success_json(&StatusResponse { status: "ok" }),
            "/status/backends" => ResponseBuilder::success_json(&self.registry.snapshot()),
            _ => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        let path = http_session.req_header().uri.path().to_string();
        self.route(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::backend::Backend;

    fn app() -> StatusHttpApp {
        let mut registry = Registry::default();
        registry.insert(
            "www.anthrax.com",
            ["localhost:8081", "localhost:8082"].map(Backend::new),
        );
        registry.get("www.anthrax.com").unwrap()[1].set_healthy(false);
        StatusHttpApp::new(Arc::new(registry))
    }

    #[test]
    fn test_ready() {
        let response = app().route("/status/ready");
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(br#"{"status":"ok"}"#, response.body().as_slice());
    }

    #[test]
    fn test_backends() {
        let response = app().route("/status/backends");
        assert_eq!(StatusCode::OK, response.status());

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let backends = body.as_array().unwrap();
        assert_eq!(2, backends.len());
        assert_eq!("www.anthrax.com", backends[0]["key"]);
        assert_eq!("localhost:8082", backends[1]["endpoint"]);
        assert_eq!(false, backends[1]["healthy"]);
        assert_eq!(0, backends[1]["open_connections"]);
    }

    #[test]
    fn test_not_found() {
        let response = app().route("/status/unknown");
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }
}
