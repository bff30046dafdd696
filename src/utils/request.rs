use std::net::IpAddr;

use http::{header, HeaderName, Uri};
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use pingora_error::{ErrorType::InternalError, OrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::Session;
use url::form_urlencoded;

use crate::proxy::{policy::Fields, router::RequestDescriptor};

static HTTP_HEADER_X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

static HTTP_HEADER_X_REAL_IP: Lazy<HeaderName> = Lazy::new(|| HeaderName::from_static("x-real-ip"));

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Builds the routing view of a request from its header.
pub fn describe(req_header: &RequestHeader, client_ip: String) -> RequestDescriptor {
    RequestDescriptor {
        host: get_request_host(req_header).map(str::to_string),
        path: req_header.uri.path().to_string(),
        client_ip,
        headers: header_fields(req_header),
        params: query_fields(req_header),
        cookies: cookie_fields(req_header),
    }
}

pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// The raw `Host` header, port included. HTTP/2 requests carry the
/// authority in the URI instead.
pub fn get_request_host(req_header: &RequestHeader) -> Option<&str> {
    get_req_header_value(req_header, header::HOST.as_str())
        .or_else(|| req_header.uri.authority().map(|a| a.as_str()))
}

fn first_forwarded(value: &str) -> Option<&str> {
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
}

/// Client address of the session. See [`client_ip`].
pub fn get_client_ip(session: &Session, trusted_proxies: &[IpNetwork]) -> String {
    let peer = session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .map(|inet| inet.ip());
    client_ip(peer, session.req_header(), trusted_proxies)
}

/// The socket peer, unless the peer is a trusted proxy: then the first
/// `X-Forwarded-For` hop, or `X-Real-IP`, is used when present. Empty when
/// the peer is unknown.
pub fn client_ip(
    peer: Option<IpAddr>,
    req_header: &RequestHeader,
    trusted_proxies: &[IpNetwork],
) -> String {
    let Some(peer) = peer else {
        log::debug!("Could not determine client IP address");
        return String::new();
    };

    if !trusted_proxies.iter().any(|net| net.contains(peer)) {
        return peer.to_string();
    }

    req_header
        .headers
        .get(&*HTTP_HEADER_X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(first_forwarded)
        .or_else(|| {
            req_header
                .headers
                .get(&*HTTP_HEADER_X_REAL_IP)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

/// Request headers by their on-the-wire name. Repeated headers keep the last
/// value; values that are not visible ASCII are skipped.
pub fn header_fields(req_header: &RequestHeader) -> Fields {
    let mut fields = Fields::new();
    for (name, value) in req_header.headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        fields.insert(name.to_string(), value.to_string());
    }
    fields
}

pub fn query_fields(req_header: &RequestHeader) -> Fields {
    req_header
        .uri
        .query()
        .map(|query| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

pub fn cookie_fields(req_header: &RequestHeader) -> Fields {
    req_header
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|item| {
            let (k, v) = item.trim().split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

pub fn is_form_body(req_header: &RequestHeader) -> bool {
    get_req_header_value(req_header, header::CONTENT_TYPE.as_str())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_URLENCODED))
}

pub fn form_fields(body: &[u8]) -> Fields {
    form_urlencoded::parse(body).into_owned().collect()
}

pub fn encode_fields(fields: &Fields) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter())
        .finish()
}

pub fn cookie_header(cookies: &Fields) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// `path` plus the url-encoded `params`, if any.
pub fn upstream_uri(path: &str, params: &Fields) -> Result<Uri> {
    let path_and_query = if params.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", encode_fields(params))
    };

    path_and_query
        .parse::<Uri>()
        .or_err_with(InternalError, || format!("Invalid upstream uri {path_and_query}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> RequestHeader {
        let mut req = RequestHeader::build("GET", uri.as_bytes(), None).unwrap();
        for (name, value) in headers {
            req.append_header(name.to_string(), *value).unwrap();
        }
        req
    }

    #[test]
    fn test_describe() {
        let req = request(
            "/v1?RemoveMe=Remove&name=a%20b",
            &[
                ("Host", "www.anthrax.com"),
                ("User-Agent", "Safe App"),
                ("Cookie", "RemoveCookie=Remove; other=1"),
            ],
        );

        let desc = describe(&req, "55.55.55.55".to_string());
        assert_eq!(Some("www.anthrax.com"), desc.host.as_deref());
        assert_eq!("/v1", desc.path);
        assert_eq!("55.55.55.55", desc.client_ip);
        assert_eq!(Some(&"Safe App".to_string()), desc.headers.get("user-agent"));
        assert_eq!(Some(&"a b".to_string()), desc.params.get("name"));
        assert_eq!(Some(&"Remove".to_string()), desc.params.get("RemoveMe"));
        assert_eq!(Some(&"1".to_string()), desc.cookies.get("other"));
    }

    #[test]
    fn test_client_ip_ignores_headers_from_untrusted_peer() {
        let req = request(
            "/",
            &[("X-Forwarded-For", "55.55.55.55"), ("X-Real-IP", "66.66.66.66")],
        );
        let peer = "10.192.0.1".parse().ok();
        assert_eq!("10.192.0.1", client_ip(peer, &req, &[]));

        let other_proxy: IpNetwork = "192.168.0.0/16".parse().unwrap();
        assert_eq!("10.192.0.1", client_ip(peer, &req, &[other_proxy]));
        assert_eq!("", client_ip(None, &req, &[]));
    }

    #[test]
    fn test_client_ip_from_trusted_proxy() {
        let trusted: Vec<IpNetwork> = vec!["127.0.0.1".parse().unwrap()];
        let peer = "127.0.0.1".parse().ok();

        let req = request("/", &[("X-Forwarded-For", "10.192.0.1, 127.0.0.1")]);
        assert_eq!("10.192.0.1", client_ip(peer, &req, &trusted));

        let req = request("/", &[("X-Real-IP", " 10.192.0.2 ")]);
        assert_eq!("10.192.0.2", client_ip(peer, &req, &trusted));

        let req = request("/", &[]);
        assert_eq!("127.0.0.1", client_ip(peer, &req, &trusted));
    }

    #[test]
    fn test_host_keeps_port() {
        let req = request("/", &[("Host", "localhost:8080")]);
        assert_eq!(Some("localhost:8080"), get_request_host(&req));

        let req = request("/", &[]);
        assert_eq!(None, get_request_host(&req));
    }

    #[test]
    fn test_repeated_headers_keep_last() {
        let req = request("/", &[("X-Tag", "one"), ("X-Tag", "two")]);
        let fields = header_fields(&req);
        assert_eq!(1, fields.len());
        assert_eq!(Some(&"two".to_string()), fields.values().next());
    }

    #[test]
    fn test_cookie_fields() {
        let req = request(
            "/",
            &[("Cookie", "a=1;  b = 2 ;broken; =x"), ("Cookie", "c=3")],
        );
        let cookies = cookie_fields(&req);
        assert_eq!(
            vec![("a", "1"), ("b", "2"), ("c", "3")],
            cookies
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect::<Vec<_>>()
        );
        assert_eq!("a=1; b=2; c=3", cookie_header(&cookies));
    }

    #[test]
    fn test_form_body() {
        let req = request(
            "/",
            &[("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")],
        );
        assert!(is_form_body(&req));
        assert!(!is_form_body(&request("/", &[("Content-Type", "application/json")])));
        assert!(!is_form_body(&request("/", &[])));

        let fields = form_fields(b"File+Placeholder=File&Token=x%26y");
        assert_eq!(Some(&"File".to_string()), fields.get("File Placeholder"));
        assert_eq!("File+Placeholder=File&Token=x%26y", encode_fields(&fields));
    }

    #[test]
    fn test_upstream_uri() {
        let mut params = Fields::new();
        assert_eq!("/v2", upstream_uri("/v2", &params).unwrap().to_string());

        params.insert("MyCustomParam".to_string(), "Test value".to_string());
        let uri = upstream_uri("/", &params).unwrap();
        assert_eq!("/", uri.path());
        assert_eq!(Some("MyCustomParam=Test+value"), uri.query());
    }
}
