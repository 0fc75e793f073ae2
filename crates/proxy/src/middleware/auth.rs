//! JWT Bearer-token authentication.
//!
//! Requests must carry `Authorization: Bearer <token>` with an HS256
//! signature under the shared secret. The validation pins the algorithm,
//! so tokens claiming `none`, RSA, or any other scheme are rejected
//! outright. Paths in the configured exclude set pass through untouched.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::{HeaderMap, Request, Response, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::warn;

use torii_config::AuthCfg;

use crate::http_util::{text_response, ProxyBody};
use crate::middleware::{ClientInfo, RequestHandler};

/// Claims the gateway cares about. Expiry is required and checked.
#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    exp: usize,
}

/// Bearer-token gate around an inner handler.
pub struct JwtAuth {
    key: DecodingKey,
    validation: Validation,
    exclude: HashSet<String>,
    inner: Arc<dyn RequestHandler>,
}

impl JwtAuth {
    pub fn new(cfg: &AuthCfg, inner: Arc<dyn RequestHandler>) -> Self {
        Self {
            key: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            exclude: cfg.exclude.iter().cloned().collect(),
            inner,
        }
    }

    /// Check the Authorization header; `Err` carries the refusal reason.
    fn authorize(&self, headers: &HeaderMap) -> Result<(), &'static str> {
        let header = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or("missing Authorization header")?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or("malformed Authorization header")?;

        decode::<Claims>(token, &self.key, &self.validation)
            .map(|_| ())
            .map_err(|_| "invalid token")
    }
}

#[async_trait]
impl RequestHandler for JwtAuth {
    async fn handle(&self, req: Request<ProxyBody>, client: ClientInfo) -> Response<ProxyBody> {
        if self.exclude.contains(req.uri().path()) {
            return self.inner.handle(req, client).await;
        }

        if let Err(reason) = self.authorize(req.headers()) {
            warn!(
                path = req.uri().path(),
                remote_addr = %client.remote_addr,
                reason,
                "request rejected"
            );
            return text_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        self.inner.handle(req, client).await
    }
}
