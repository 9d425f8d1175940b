//! Endpoint service over a fixed list of service URLs.
//!
//! Candidates are handed out round-robin. Once every candidate has been tried
//! without success the service answers "retry after N" with N taken from an
//! exponential [`Backoff`], then starts a new round. A successful connection
//! resets the backoff and pins the endpoint that worked, so the next round
//! (after a disconnect) starts with it.

use std::{fmt, sync::Mutex};

use tracing::{debug, warn};

use super::{EndpointLookup, EndpointService};
use crate::{
    backoff::Backoff,
    config::{parse_service_url, ClientOptions},
    error::ClientError,
    mailbox::lock,
    promise::{settle, Promise},
};

pub const AMQP_PORT: u16 = 5672;
pub const AMQPS_PORT: u16 = 5671;

/// A server the client can connect to, with the material needed to do so.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub trust_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub verify_name: bool,
}

impl Endpoint {
    /// Builds an endpoint from a service URL, taking credentials from the URL
    /// or, failing that, from the options.
    ///
    /// # Errors
    /// [`ClientError::Config`] if the URL is not a usable `amqp`/`amqps` URL.
    pub fn from_service(service: &str, options: &ClientOptions) -> Result<Self, ClientError> {
        let url = parse_service_url(service).map_err(ClientError::Config)?;
        let tls = url.scheme() == "amqps";
        let port = url
            .port()
            .unwrap_or(if tls { AMQPS_PORT } else { AMQP_PORT });
        let (user, password) = if url.username().is_empty() {
            (options.user.clone(), options.password.clone())
        } else {
            (
                Some(url.username().to_string()),
                url.password().map(str::to_string),
            )
        };
        let tls_options = options.tls.clone().unwrap_or_default();

        Ok(Self {
            host: url.host_str().unwrap_or_default().to_string(),
            port,
            tls,
            user,
            password,
            trust_certificate: tls_options.trust_certificate,
            client_certificate: tls_options.client_certificate,
            client_key: tls_options.client_key,
            verify_name: tls_options.verify_name,
        })
    }

    /// URL form without credentials, for logs.
    pub fn address(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<hidden>"))
            .field("trust_certificate", &self.trust_certificate)
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &self.client_key)
            .field("verify_name", &self.verify_name)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

#[derive(Debug)]
struct Rotation {
    /// Index the current round started from.
    start: usize,
    /// Candidates handed out in the current round.
    tried: usize,
    backoff: Backoff,
}

/// Round-robin endpoint service with exponential backoff between rounds.
#[derive(Debug)]
pub struct StaticEndpointService {
    endpoints: Vec<Endpoint>,
    rotation: Mutex<Rotation>,
}

impl StaticEndpointService {
    /// # Errors
    /// [`ClientError::Config`] if there are no service URLs or one is invalid.
    pub fn new(options: &ClientOptions) -> Result<Self, ClientError> {
        let endpoints = options
            .service
            .iter()
            .map(|s| Endpoint::from_service(s, options))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(ClientError::Config("no service URLs configured".into()));
        }
        Ok(Self {
            endpoints,
            rotation: Mutex::new(Rotation {
                start: 0,
                tried: 0,
                backoff: Backoff::from_options(&options.retry),
            }),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn next(&self) -> Result<EndpointLookup, ClientError> {
        let mut rotation = lock(&self.rotation);
        if rotation.tried < self.endpoints.len() {
            let index = (rotation.start + rotation.tried) % self.endpoints.len();
            rotation.tried += 1;
            return Ok(EndpointLookup::Found(self.endpoints[index].clone()));
        }

        rotation.tried = 0;
        match rotation.backoff.next_sleep() {
            Ok(delay) => {
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    round = rotation.backoff.attempt(),
                    "All endpoints tried, waiting before next round"
                );
                Ok(EndpointLookup::RetryAfter(delay))
            }
            Err(e) => {
                warn!(error = %e, "Endpoint retry limit reached");
                Err(e.into())
            }
        }
    }
}

impl EndpointService for StaticEndpointService {
    fn lookup(&self, promise: Promise<EndpointLookup>) {
        let result = self.next();
        settle(&promise, result);
    }

    fn on_success(&self, endpoint: &Endpoint) {
        let mut rotation = lock(&self.rotation);
        if let Some(index) = self.endpoints.iter().position(|e| e == endpoint) {
            rotation.start = index;
        }
        rotation.tried = 0;
        rotation.backoff.reset();
        debug!(endpoint = %endpoint, "Endpoint marked good");
    }
}
