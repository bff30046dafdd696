//! Response helpers shared by the proxy and the status service.

use bytes::Bytes;
use http::{header, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        let mut resp = Response::new(message.as_bytes().to_vec());
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(content_type::TEXT_PLAIN),
        );
        resp
    }

    pub fn success_json<T: Serialize>(data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(body) => {
                let mut resp = Response::new(body);
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static(content_type::APPLICATION_JSON),
                );
                resp
            }
            Err(e) => {
                log::error!("Failed to serialize JSON response: {e}");
                Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    /// A plain-text response header sized for `message`.
    pub fn build_proxy_response(status: StatusCode, message: Option<&str>) -> Result<ResponseHeader> {
        let mut resp = ResponseHeader::build(status, None)?;

        match message {
            Some(msg) => {
                resp.insert_header(header::CONTENT_LENGTH, msg.len().to_string())?;
                resp.insert_header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)?;
            }
            None => resp.insert_header(header::CONTENT_LENGTH, "0")?,
        }

        Ok(resp)
    }

    /// Answers the downstream directly, without contacting any backend.
    pub async fn send_proxy_error(
        session: &mut Session,
        status: StatusCode,
        message: Option<&str>,
    ) -> Result<()> {
        let resp = Self::build_proxy_response(status, message)?;
        session
            .write_response_header(Box::new(resp), message.is_none())
            .await?;

        if let Some(msg) = message {
            session
                .write_response_body(Some(Bytes::copy_from_slice(msg.as_bytes())), true)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let response = ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(StatusCode::NOT_FOUND, response.status());
        assert_eq!(b"Not Found", response.body().as_slice());
    }

    #[test]
    fn test_json_response() {
        let data = serde_json::json!({"status": "ok"});
        let response = ResponseBuilder::success_json(&data);
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(br#"{"status":"ok"}"#, response.body().as_slice());
        assert_eq!(
            content_type::APPLICATION_JSON,
            response.headers()[header::CONTENT_TYPE]
        );
    }

    #[test]
    fn test_build_proxy_response() {
        let resp = ResponseBuilder::build_proxy_response(
            StatusCode::SERVICE_UNAVAILABLE,
            Some("No backend servers available."),
        )
        .unwrap();
        assert_eq!(503, resp.status.as_u16());
        assert_eq!("29", resp.headers[header::CONTENT_LENGTH]);
        assert_eq!(content_type::TEXT_PLAIN, resp.headers[header::CONTENT_TYPE]);

        let resp = ResponseBuilder::build_proxy_response(StatusCode::FORBIDDEN, None).unwrap();
        assert_eq!("0", resp.headers[header::CONTENT_LENGTH]);
    }
}
