//! HTTP contract with the domain services.
//!
//! Every service exposes `GET <health_path>` and one query endpoint. The
//! query endpoint is either POSTed the JSON sub-request or called with GET
//! and `q`/`user_id`/`conversation_id` parameters. `query_path` may contain
//! `{user_id}` and `{query}` placeholders.

use std::time::Duration;

use async_trait::async_trait;
use config_rs::QueryMethod;
use error_handling_rs::{Error, ErrorKind};
use serde_json::Value;
use url::Url;

use crate::models::{ServiceDescriptor, SubRequest};

#[async_trait]
pub trait DomainClient: Send + Sync {
    /// Sends one sub-request. Deadlines are enforced by the caller.
    async fn query(&self, descriptor: &ServiceDescriptor, request: &SubRequest) -> Result<Value, Error>;

    /// One health probe bounded by `timeout`
    async fn health(&self, descriptor: &ServiceDescriptor, timeout: Duration) -> Result<(), Error>;
}

pub struct HttpDomainClient {
    client: reqwest::Client,
}

impl HttpDomainClient {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("query-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                Error::new(ErrorKind::Initialization, format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DomainClient for HttpDomainClient {
    async fn query(&self, descriptor: &ServiceDescriptor, request: &SubRequest) -> Result<Value, Error> {
        let mut url = query_url(descriptor, request)?;

        let builder = match descriptor.query_method {
            QueryMethod::Post => self.client.post(url).json(request),
            QueryMethod::Get => {
                url.query_pairs_mut()
                    .append_pair("q", &request.query)
                    .append_pair("user_id", &request.user_id)
                    .append_pair("conversation_id", &request.conversation_id);
                self.client.get(url)
            }
        };

        let response = builder
            .header("x-query-id", &request.query_id)
            .send()
            .await
            .map_err(|e| Error::from(e).service(&descriptor.name))?
            .error_for_status()
            .map_err(|e| Error::from(e).service(&descriptor.name))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| Error::from(e).service(&descriptor.name))
    }

    async fn health(&self, descriptor: &ServiceDescriptor, timeout: Duration) -> Result<(), Error> {
        self.client
            .get(descriptor.health_url())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::from(e).service(&descriptor.name))?
            .error_for_status()
            .map_err(|e| Error::from(e).service(&descriptor.name))?;
        Ok(())
    }
}

/// Resolves `query_path` against the base URL, substituting placeholders
/// segment by segment so substituted values are percent-encoded.
pub fn query_url(descriptor: &ServiceDescriptor, request: &SubRequest) -> Result<Url, Error> {
    let invalid = |reason: String| {
        Error::new(ErrorKind::Validation, reason).service(&descriptor.name)
    };

    let mut url = Url::parse(&descriptor.base_url)
        .map_err(|e| invalid(format!("invalid base_url `{}`: {}", descriptor.base_url, e)))?;

    let mut segments = Vec::new();
    for segment in descriptor.query_path.split('/').filter(|s| !s.is_empty()) {
        let substituted = segment
            .replace("{user_id}", &request.user_id)
            .replace("{query}", &request.query);
        // URL parsing drops or collapses these, which would address another endpoint
        if substituted != segment && matches!(substituted.as_str(), "." | "..") {
            return Err(invalid(format!(
                "`{}` cannot be substituted into path segment `{}`",
                substituted, segment
            )));
        }
        segments.push(substituted);
    }

    url.path_segments_mut()
        .map_err(|_| invalid(format!("base_url `{}` cannot carry a path", descriptor.base_url)))?
        .pop_if_empty()
        .extend(segments.iter().map(String::as_str));

    Ok(url)
}
