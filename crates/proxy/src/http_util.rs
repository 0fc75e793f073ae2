//! Small HTTP helpers shared by the server, proxy engine, middlewares, and
//! the admin API.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use serde::Serialize;

/// Body type used on every internal handler boundary.
///
/// Inbound bodies are boxed straight off the connection; locally generated
/// responses are boxed `Full` bodies with the error type unified.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A complete in-memory body.
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// An empty body.
pub fn empty() -> ProxyBody {
    full(Bytes::new())
}

/// A plain-text response such as `502 bad gateway`.
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(format!("{message}\n")))
        .expect("static response parts are valid")
}

/// A JSON response for the admin API and /healthz.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full(body))
            .expect("static response parts are valid"),
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn text_response_has_trailing_newline() {
        let resp = text_response(StatusCode::BAD_GATEWAY, "bad gateway");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"bad gateway\n");
    }

    #[tokio::test]
    async fn json_response_sets_content_type() {
        let resp = json_response(StatusCode::OK, &serde_json::json!({"ok": true}));
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), br#"{"ok":true}"#);
    }
}
