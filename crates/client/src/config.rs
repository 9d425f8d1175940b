//! Client options.
//!
//! Every option is checked in one validation pass when the client is built
//! ([`ClientOptions::validated`]). Options deserialize from TOML or JSON, so
//! the same structures back the `[client]` section of the application config
//! file.
//!
//! ```toml
//! [client]
//! id = "sensor_gateway_1"
//! service = ["amqps://broker-a.example.com", "amqps://broker-b.example.com:5671"]
//! user = "gateway"
//! password = "secret"
//! send_backpressure_threshold = 2
//!
//! [client.tls]
//! trust_certificate = "/etc/skylark/ca.pem"
//! verify_name = true
//!
//! [client.retry]
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! multiplier = 2.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::error::ClientError;

/// Longest client id the server accepts.
pub const MAX_CLIENT_ID_LEN: usize = 256;

/// Default number of undrained sends after which `send` reports backpressure.
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 2;

/// Top-level client options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_credentials"))]
pub struct ClientOptions {
    /// Client identifier. Generated as `AUTO_xxxxxxx` when absent.
    ///
    /// Two clients connected with the same id cause the server to disconnect
    /// the older one (reported as [`ClientError::Replaced`]).
    #[validate(custom(function = "validate_client_id"))]
    pub id: Option<String>,

    /// Candidate service URLs, tried in order.
    #[validate(
        length(min = 1, message = "At least one service URL is required"),
        custom(function = "validate_service_urls")
    )]
    pub service: Vec<String>,

    pub user: Option<String>,

    pub password: Option<String>,

    #[validate(nested)]
    pub tls: Option<TlsOptions>,

    #[validate(nested)]
    pub retry: RetryOptions,

    /// `send` returns `accepting = false` once this many sends are waiting
    /// for the transport.
    #[validate(range(min = 1, message = "Backpressure threshold must be at least 1"))]
    pub send_backpressure_threshold: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            id: None,
            service: vec!["amqp://localhost".to_string()],
            user: None,
            password: None,
            tls: None,
            retry: RetryOptions::default(),
            send_backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
        }
    }
}

impl ClientOptions {
    /// Options for a single service URL, everything else defaulted.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: vec![service.into()],
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Validates every option and fills in a generated client id if none was
    /// given.
    ///
    /// # Errors
    /// [`ClientError::Argument`] for a malformed client id,
    /// [`ClientError::Config`] for anything else.
    pub fn validated(mut self) -> Result<Self, ClientError> {
        if let Some(id) = &self.id {
            check_client_id(id)?;
        }
        self.validate()?;
        if self.id.is_none() {
            self.id = Some(generate_client_id());
        }
        Ok(self)
    }

    /// The client id, if one was set or generated.
    pub fn client_id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// TLS material for `amqps://` services.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_client_auth_pair"))]
pub struct TlsOptions {
    /// PEM file with the certificates used to verify the server.
    #[validate(custom(
        function = "validate_file_exists",
        message = "Trust certificate file does not exist"
    ))]
    pub trust_certificate: Option<String>,

    #[validate(custom(
        function = "validate_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_certificate: Option<String>,

    #[validate(custom(
        function = "validate_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key: Option<String>,

    /// Check that the server certificate names the host being connected to.
    pub verify_name: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            trust_certificate: None,
            client_certificate: None,
            client_key: None,
            verify_name: true,
        }
    }
}

impl TlsOptions {
    pub fn with_trust_certificate(path: impl Into<String>) -> Self {
        Self {
            trust_certificate: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_certificate.is_some() && self.client_key.is_some()
    }
}

/// Retry schedule used by the default endpoint service.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry_bounds"))]
pub struct RetryOptions {
    #[validate(range(min = 1, message = "Initial retry delay must be at least 1ms"))]
    pub initial_delay_ms: u64,

    #[validate(range(min = 1, message = "Maximum retry delay must be at least 1ms"))]
    pub max_delay_ms: u64,

    #[validate(range(min = 1.0, max = 10.0, message = "Multiplier must be between 1.0 and 10.0"))]
    pub multiplier: f64,

    /// Number of retry rounds before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Generates an id of the form `AUTO_` followed by seven hex digits.
pub fn generate_client_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("AUTO_{}", &uuid[..7])
}

/// Checks a client id: 1 to 256 characters from `[A-Za-z0-9%/._]`.
pub fn check_client_id(id: &str) -> Result<(), ClientError> {
    if id.is_empty() || id.len() > MAX_CLIENT_ID_LEN {
        return Err(ClientError::Argument(format!(
            "client id must be between 1 and {MAX_CLIENT_ID_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '%' | '/' | '.' | '_')))
    {
        return Err(ClientError::Argument(format!(
            "client id '{id}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Parses a service URL, accepting only `amqp` and `amqps` with a host.
pub(crate) fn parse_service_url(service: &str) -> Result<Url, String> {
    let url = Url::parse(service).map_err(|e| format!("invalid service URL '{service}': {e}"))?;
    match url.scheme() {
        "amqp" | "amqps" => {}
        other => {
            return Err(format!(
                "unsupported scheme '{other}' in '{service}', expected amqp or amqps"
            ))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("service URL '{service}' has no host"));
    }
    if !(url.path().is_empty() || url.path() == "/") {
        return Err(format!("service URL '{service}' must not have a path"));
    }
    Ok(url)
}

fn validate_client_id(id: &str) -> Result<(), ValidationError> {
    check_client_id(id).map_err(|e| {
        ValidationError::new("invalid_client_id").with_message(e.to_string().into())
    })
}

fn validate_service_urls(services: &[String]) -> Result<(), ValidationError> {
    for service in services {
        parse_service_url(service)
            .map_err(|e| ValidationError::new("invalid_service").with_message(e.into()))?;
    }
    Ok(())
}

fn validate_credentials(options: &ClientOptions) -> Result<(), ValidationError> {
    match (&options.user, &options.password) {
        (Some(_), None) | (None, Some(_)) => {
            return Err(ValidationError::new("incomplete_credentials")
                .with_message("Both user and password must be provided or neither".into()));
        }
        (Some(_), Some(_)) => {
            let embedded = options
                .service
                .iter()
                .filter_map(|s| Url::parse(s).ok())
                .any(|url| !url.username().is_empty());
            if embedded {
                return Err(ValidationError::new("conflicting_credentials").with_message(
                    "Credentials given both as options and inside a service URL".into(),
                ));
            }
        }
        (None, None) => {}
    }
    Ok(())
}

fn validate_client_auth_pair(tls: &TlsOptions) -> Result<(), ValidationError> {
    if tls.client_certificate.is_some() != tls.client_key.is_some() {
        return Err(ValidationError::new("incomplete_client_auth").with_message(
            "Both client certificate and key must be provided or neither".into(),
        ));
    }
    Ok(())
}

fn validate_retry_bounds(retry: &RetryOptions) -> Result<(), ValidationError> {
    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(ValidationError::new("retry_bounds")
            .with_message("Maximum retry delay must not be below the initial delay".into()));
    }
    Ok(())
}

fn validate_file_exists(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }
    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }
    Ok(())
}
