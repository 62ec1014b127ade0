//! Shared HTTP response helpers for blocked/challenged/error responses

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};

use crate::filter::challenge::challenge_header;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut resp = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// Create an empty response with the given status
pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut resp = Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed());
    *resp.status_mut() = status;
    resp
}

/// Create an HTTP 403 response for blocked requests
pub fn blocked_response(method: &str, url: &str) -> Response<ProxyBody> {
    let body = format!(
        "Request blocked by parental control\n\nMethod: {}\nURL: {}\n",
        method, url
    );

    let mut resp = text_response(StatusCode::FORBIDDEN, body);
    resp.headers_mut()
        .insert("X-Blocked-By", HeaderValue::from_static("pc-proxy"));
    resp
}

/// Create an HTTP 407 response asking for the bypass password
pub fn proxy_auth_required_response() -> Response<ProxyBody> {
    let mut resp = text_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy authentication required\n".to_string(),
    );
    if let Ok(value) = HeaderValue::from_str(&challenge_header()) {
        resp.headers_mut().insert(PROXY_AUTHENTICATE, value);
    }
    resp
}

/// Create an HTTP 400 response for requests the proxy cannot route
pub fn bad_request_response(message: &str) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_REQUEST, format!("Bad request: {}\n", message))
}

/// Create an HTTP 502 Bad Gateway error response
pub fn error_response(message: &str) -> Response<ProxyBody> {
    text_response(StatusCode::BAD_GATEWAY, format!("Proxy error: {}\n", message))
}
