//! Loads and checks a skylark configuration, then reports the client it
//! describes: id, endpoints in connection order and retry policy.

use std::{process, sync::OnceLock};

use skylark::{config::Config, logger::LoggerManager, print_error};
use skylark_client::services::StaticEndpointService;
use tracing::{debug, error, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn main() {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("skylark version {}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.directives());
    debug!("{:#?}", cfg.client);

    let endpoints = StaticEndpointService::new(&cfg.client).unwrap_or_else(|e| {
        error!("Invalid client configuration: {}", e);
        process::exit(1);
    });

    info!("Client id: {}", cfg.client.client_id().unwrap_or_default());
    for (index, endpoint) in endpoints.endpoints().iter().enumerate() {
        let auth = match (&endpoint.user, endpoint.tls) {
            (Some(user), true) => format!("user {user}, tls"),
            (Some(user), false) => format!("user {user}"),
            (None, true) => "anonymous, tls".to_string(),
            (None, false) => "anonymous".to_string(),
        };
        info!("Endpoint {}: {} ({})", index + 1, endpoint.address(), auth);
    }

    let retry = &cfg.client.retry;
    info!(
        "Retry: {}ms initial, {}ms max, x{} per round, {}",
        retry.initial_delay_ms,
        retry.max_delay_ms,
        retry.multiplier,
        retry
            .max_attempts
            .map(|n| format!("at most {n} rounds"))
            .unwrap_or_else(|| "no round limit".to_string())
    );
    info!(
        "Send backpressure threshold: {}",
        cfg.client.send_backpressure_threshold
    );
    info!("Configuration OK");
}
