use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use strata_core::connection_manager::{ConnectionBackend, TransportError, INTERNAL_ERROR_CODE};
use strata_core::profiles::ConnectionProfile;
use strata_core::query_executor::{QueryTransport, StatementResult, Variables};
use url::Url;

pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(120);
const NAMESPACE_HEADER: &str = "NS";
const DATABASE_HEADER: &str = "DB";

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    probe_interval: Duration,
}

impl HttpBackend {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
            probe_interval: HEALTH_PROBE_INTERVAL,
        })
    }

    #[must_use]
    pub fn with_probe_interval(mut self, probe_interval: Duration) -> Self {
        self.probe_interval = probe_interval;
        self
    }
}

#[async_trait]
impl ConnectionBackend for HttpBackend {
    type Connection = HttpConnection;

    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Self::Connection, TransportError> {
        let endpoint = profile
            .validate()
            .map_err(|error| TransportError::new(INTERNAL_ERROR_CODE, error.to_string()))?;
        let connection = HttpConnection {
            client: self.client.clone(),
            base: http_base(endpoint)?,
            username: profile.username.clone(),
            password: profile.password.clone(),
            namespace: profile.namespace.clone(),
            database: profile.database.clone(),
        };
        connection.probe().await?;
        tracing::debug!(endpoint = %connection.base, "health probe succeeded");
        Ok(connection)
    }

    async fn monitor(&self, connection: &Self::Connection) -> TransportError {
        loop {
            tokio::time::sleep(self.probe_interval).await;
            if let Err(error) = connection.probe().await {
                tracing::debug!(%error, "health probe failed");
                return error;
            }
        }
    }

    async fn disconnect(&self, connection: Arc<Self::Connection>) -> Result<(), TransportError> {
        tracing::debug!(endpoint = %connection.base, "releasing http connection");
        Ok(())
    }
}

/// Stateless HTTP session against one endpoint. Every query carries the
/// credentials and scope.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: Client,
    base: Url,
    username: String,
    password: String,
    namespace: Option<String>,
    database: Option<String>,
}

impl HttpConnection {
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let url = endpoint_url(&self.base, "health", None)?;
        let response = self
            .client
            .get(url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(status_error(status, "health check failed"))
    }
}

#[async_trait]
impl QueryTransport for HttpConnection {
    async fn query(
        &self,
        statement: &str,
        variables: Option<&Variables>,
    ) -> Result<Vec<StatementResult>, TransportError> {
        let url = endpoint_url(&self.base, "sql", variables)?;
        let mut request = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .timeout(QUERY_TIMEOUT)
            .body(statement.to_string());
        if let Some(namespace) = &self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }
        if let Some(database) = &self.database {
            request = request.header(DATABASE_HEADER, database);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_detail(&body)));
        }

        response
            .json::<Vec<StatementResult>>()
            .await
            .map_err(|error| {
                TransportError::new(
                    INTERNAL_ERROR_CODE,
                    format!("unexpected query response: {error}"),
                )
            })
    }
}

/// The endpoint as an HTTP base URL with a trailing slash, so relative joins
/// append instead of replacing the last path segment.
fn http_base(mut endpoint: Url) -> Result<Url, TransportError> {
    let scheme = match endpoint.scheme() {
        "ws" => Some("http"),
        "wss" => Some("https"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        endpoint.set_scheme(scheme).map_err(|()| {
            TransportError::new(
                INTERNAL_ERROR_CODE,
                format!("cannot use `{endpoint}` over {scheme}"),
            )
        })?;
    }
    if !endpoint.path().ends_with('/') {
        let path = format!("{}/", endpoint.path());
        endpoint.set_path(&path);
    }
    endpoint.set_query(None);
    Ok(endpoint)
}

fn endpoint_url(
    base: &Url,
    path: &str,
    variables: Option<&Variables>,
) -> Result<Url, TransportError> {
    let mut url = base.join(path).map_err(|error| {
        TransportError::new(INTERNAL_ERROR_CODE, format!("invalid endpoint: {error}"))
    })?;
    if let Some(variables) = variables.filter(|variables| !variables.is_empty()) {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in variables {
            pairs.append_pair(name, &variable_value(value));
        }
    }
    Ok(url)
}

/// Strings go over the wire unquoted; anything else as JSON text.
fn variable_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn network_error(error: reqwest::Error) -> TransportError {
    request_failure(error.is_timeout(), error.to_string())
}

/// A timed out request leaves the endpoint reachable, so only other network
/// failures count as a lost connection.
fn request_failure(timed_out: bool, message: String) -> TransportError {
    if timed_out {
        TransportError::new(INTERNAL_ERROR_CODE, format!("request timed out: {message}"))
    } else {
        TransportError::abnormal(message)
    }
}

fn status_error(status: StatusCode, detail: &str) -> TransportError {
    let message = if detail.is_empty() {
        format!("server responded with {status}")
    } else {
        format!("{detail} ({status})")
    };
    TransportError::new(INTERNAL_ERROR_CODE, message)
}

fn error_detail(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    ["information", "description", "details"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(Value::as_str))
        .map_or_else(|| body.trim().to_string(), str::to_string)
}
