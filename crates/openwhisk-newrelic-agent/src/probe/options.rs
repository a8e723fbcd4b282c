//! Request options normalization.
//!
//! Callers reach the probe with URL strings, prebuilt `http::Request`s, or
//! anything in between; frameworks shape the URI and headers differently.
//! Everything collapses into one [`RequestOptions`] bag the record builder
//! and the connection setup work from.

use bytes::Bytes;
use http::header::HOST;
use http::Request;

use crate::error::HttpError;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

/// Normalized shape of one outgoing request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// `"http:"` or `"https:"`.
    pub protocol: String,
    /// Host name, defaulting to `localhost`.
    pub host: String,
    /// Explicit port, else the scheme default.
    pub port: u16,
    /// Path including the query string, default `/`.
    pub path: String,
    /// The URI as given by the caller.
    pub href: String,
    /// Upper-cased method, default `GET`.
    pub method: String,
}

impl RequestOptions {
    /// Builds the options bag from a prepared request.
    pub fn from_request(request: &Request<Bytes>) -> Result<Self, HttpError> {
        let uri = request.uri();
        let href = uri.to_string();

        let protocol = match uri.scheme_str() {
            Some("https") => "https:".to_string(),
            Some(_) | None => "http:".to_string(),
        };

        let host = uri
            .host()
            .map(str::to_string)
            .or_else(|| {
                request
                    .headers()
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.split(':').next().unwrap_or(value).to_string())
            })
            .unwrap_or_else(|| "localhost".to_string());

        let port = uri.port_u16().unwrap_or(if protocol == "https:" {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        });

        let path = uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

        Ok(RequestOptions {
            protocol,
            host,
            port,
            path,
            href,
            method: request.method().as_str().to_uppercase(),
        })
    }

    #[must_use]
    pub fn is_https(&self) -> bool {
        self.protocol == "https:"
    }

    fn default_port(&self) -> u16 {
        if self.is_https() {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// Full URL reconstructed from the normalized pieces; the port only
    /// appears when it differs from the scheme default.
    #[must_use]
    pub fn url(&self) -> String {
        if self.port == self.default_port() {
            format!("{}//{}{}", self.protocol, self.host, self.path)
        } else {
            format!("{}//{}:{}{}", self.protocol, self.host, self.port, self.path)
        }
    }

    /// Registrable domain, approximated as the last two labels of the
    /// host name. Public-suffix lookups are out of scope, so
    /// `sub.example.co.uk` yields `co.uk`.
    #[must_use]
    pub fn domain(&self) -> String {
        let labels: Vec<&str> = self.host.rsplit('.').take(2).collect();
        labels.into_iter().rev().collect::<Vec<_>>().join(".")
    }

    /// `Host` header value: the port is included only when non-default.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
