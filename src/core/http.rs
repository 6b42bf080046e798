// src/core/http.rs

//! Typed HTTP helper shared by every outbound surface. Wraps `reqwest`
//! with the controller's TLS material, per-call timeouts, and a retry
//! policy that only ever replays idempotent requests.

use crate::config::TlsSettings;
use crate::core::errors::ControlError;
use reqwest::{Client, Method};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// A single outbound request. `retries` only applies to transport errors
/// on idempotent verbs; an HTTP error status is returned to the caller.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
    pub retries: u32,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>, timeout: Duration, retries: u32) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            timeout,
            retries,
        }
    }

    pub fn post<B: Serialize>(
        path: impl Into<String>,
        body: &B,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: Some(serde_json::to_value(body)?),
            timeout,
            retries: 0,
        })
    }
}

/// Body and status of a completed exchange. Parsing is left to callers.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ControlError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// A client bound to one `host:port`, created per target from shared TLS
/// settings. TLS is client-side only: TLSv1.3 minimum, optional mTLS
/// identity, optional private CA root.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    host: String,
    port: u16,
    scheme: &'static str,
}

impl HttpClient {
    pub fn new(host: impl Into<String>, port: u16, tls: &TlsSettings) -> Result<Self, ControlError> {
        let mut builder = Client::builder().use_rustls_tls();
        let scheme = if tls.enabled {
            builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_3);
            if let Some(ca) = &tls.ca_path {
                let pem = std::fs::read(ca)?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| ControlError::Unauthenticated(format!("CA load: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            if let (Some(cert), Some(key)) = (&tls.cert_path, &tls.key_path) {
                let mut pem = std::fs::read(cert)?;
                pem.extend(std::fs::read(key)?);
                let identity = reqwest::Identity::from_pem(&pem)
                    .map_err(|e| ControlError::Unauthenticated(format!("identity load: {e}")))?;
                builder = builder.identity(identity);
            }
            "https"
        } else {
            "http"
        };
        Ok(Self {
            client: builder.build().map_err(ControlError::from)?,
            host: host.into(),
            port,
            scheme,
        })
    }

    pub fn set_host_and_port(&mut self, host: impl Into<String>, port: u16) {
        self.host = host.into();
        self.port = port;
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }

    /// Sends the request, replaying transport failures up to `retries`
    /// times for idempotent verbs. Non-idempotent verbs are never replayed.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ControlError> {
        let idempotent = request.method == Method::GET
            || request.method == Method::HEAD
            || request.method == Method::PUT;
        let attempts = if idempotent { request.retries + 1 } else { 1 };
        let url = self.url(&request.path);

        let mut last_err = ControlError::Unreachable(format!("no attempt made for {url}"));
        for attempt in 0..attempts {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .timeout(request.timeout);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    debug!(%url, status, "Request completed");
                    return Ok(HttpResponse { status, body });
                }
                Err(e) => {
                    warn!(%url, attempt, "Transport failure: {e}");
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }
}
