use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderName, StatusCode};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::*, OkOrErr, OrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::config::{Config, HealthCheckMode};
use crate::proxy::{
    backend::Registry,
    health_check::HealthMonitor,
    policy::{Facet, HostPolicy},
    router::{Dispatcher, Forward, RouteDecision},
};
use crate::utils::{request, response::ResponseBuilder};

/// Per-request state.
pub struct BalancerContext {
    pub forward: Option<Box<Forward>>,
    rewrite_body: bool,
    body: BytesMut,
    request_start: Instant,
}

impl Default for BalancerContext {
    fn default() -> Self {
        Self {
            forward: None,
            rewrite_body: false,
            body: BytesMut::new(),
            request_start: Instant::now(),
        }
    }
}

pub struct BalancerService {
    dispatcher: Dispatcher,
    /// Refreshes backend health before each request when set.
    monitor: Option<HealthMonitor>,
    trusted_proxies: Vec<IpNetwork>,
}

#[async_trait]
impl ProxyHttp for BalancerService {
    type CTX = BalancerContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        if let Some(monitor) = &self.monitor {
            monitor.refresh().await;
        }

        let client_ip = request::get_client_ip(session, &self.trusted_proxies);
        let descriptor = request::describe(session.req_header(), client_ip);
        match self.dispatcher.route(descriptor) {
            RouteDecision::Forward(forward) => {
                ctx.rewrite_body = forward
                    .policy
                    .as_ref()
                    .is_some_and(|policy| policy.rules(Facet::PostData).is_some())
                    && request::is_form_body(session.req_header());
                ctx.forward = Some(forward);
                Ok(false)
            }
            decision => {
                let status = StatusCode::from_u16(decision.status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                ResponseBuilder::send_proxy_error(session, status, Some(decision.message()))
                    .await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let forward = ctx
            .forward
            .as_ref()
            .or_err(InternalError, "No backend selected for request")?;
        let endpoint = forward.endpoint();

        let addr = tokio::net::lookup_host(endpoint)
            .await
            .or_err_with(ConnectError, || format!("Failed to resolve {endpoint}"))?
            .next()
            .or_err_with(ConnectError, || format!("No address for {endpoint}"))?;

        debug!("Connecting to {endpoint} at {addr}");
        Ok(Box::new(HttpPeer::new(addr, false, String::new())))
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if !ctx.rewrite_body {
            return Ok(());
        }

        if let Some(chunk) = body.take() {
            ctx.body.extend_from_slice(&chunk);
        }

        if end_of_stream {
            let policy = ctx
                .forward
                .as_ref()
                .and_then(|forward| forward.policy.as_deref())
                .or_err(InternalError, "Form body rewrite without a host policy")?;
            *body = Some(transform_form(policy, &ctx.body));
        }

        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(forward) = ctx.forward.as_ref() else {
            return Ok(());
        };

        rebuild_upstream_request(upstream_request, forward)?;

        if ctx.rewrite_body {
            upstream_request.remove_header(&header::CONTENT_LENGTH);
            upstream_request.insert_header(header::TRANSFER_ENCODING, "chunked")?;
        }

        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let req = session.req_header();
        let upstream = ctx
            .forward
            .as_ref()
            .map_or("-", |forward| forward.endpoint());

        info!(
            "{} \"{} {}\" {status} upstream={upstream} {}ms",
            request::get_client_ip(session, &self.trusted_proxies),
            req.method,
            req.uri,
            ctx.request_start.elapsed().as_millis()
        );
        if let Some(e) = e {
            warn!("Request to {upstream} failed: {e}");
        }

        // releases the connection count of path-routed forwards
        ctx.forward.take();
    }
}

/// Re-encodes a form body with the host's post data rules applied.
fn transform_form(policy: &HostPolicy, raw: &[u8]) -> Bytes {
    let fields = policy.apply(Facet::PostData, request::form_fields(raw));
    Bytes::from(request::encode_fields(&fields))
}

fn is_framing(name: &HeaderName) -> bool {
    *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING
}

/// Points the upstream request at the forward's path and facets.
///
/// Headers and cookies are only rebuilt when the matched host has rules for
/// them, so untouched requests keep repeated headers as they arrived. Header
/// values the facet cannot carry (not visible ASCII) are left in place.
fn rebuild_upstream_request(upstream_request: &mut RequestHeader, forward: &Forward) -> Result<()> {
    upstream_request.set_uri(request::upstream_uri(&forward.path, &forward.params)?);

    let Some(policy) = forward.policy.as_deref() else {
        return Ok(());
    };

    if policy.rules(Facet::Header).is_some() {
        let removed: Vec<HeaderName> = upstream_request
            .headers
            .iter()
            .filter(|(name, value)| {
                !is_framing(name)
                    && value.to_str().is_ok()
                    && !forward
                        .headers
                        .keys()
                        .any(|key| key.eq_ignore_ascii_case(name.as_str()))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in removed {
            upstream_request.remove_header(&name);
        }

        for (name, value) in forward.headers.iter() {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .or_err_with(InternalError, || format!("Invalid header name {name}"))?;
            if is_framing(&header_name) {
                continue;
            }
            let current = upstream_request
                .headers
                .get(&header_name)
                .and_then(|v| v.to_str().ok());
            if current != Some(value.as_str()) {
                upstream_request.insert_header(name.clone(), value.as_str())?;
            }
        }

        if upstream_request.headers.get(header::HOST).is_none() {
            upstream_request.insert_header(header::HOST, forward.endpoint())?;
        }
    }

    if policy.rules(Facet::Cookie).is_some() {
        upstream_request.remove_header(&header::COOKIE);
        if !forward.cookies.is_empty() {
            upstream_request.insert_header(header::COOKIE, request::cookie_header(&forward.cookies))?;
        }
    }

    Ok(())
}

/// Builds the proxy logic; in `request` health check mode the service checks backends
/// before routing instead of relying on the background monitor.
pub fn build_http_service(config: &Config, registry: Arc<Registry>) -> BalancerService {
    let monitor = match config.health_check.mode {
        HealthCheckMode::Request => {
            info!("Health checks run before every request");
            Some(HealthMonitor::from_config(registry.clone(), &config.health_check))
        }
        HealthCheckMode::Background => None,
    };

    if !config.trusted_proxies.is_empty() {
        info!("Trusting forwarded client addresses from {:?}", config.trusted_proxies);
    }

    BalancerService {
        dispatcher: Dispatcher::from_config(config, registry),
        monitor,
        trusted_proxies: config.trusted_proxies.clone(),
    }
}
