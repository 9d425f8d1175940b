//! skylark, application bootstrap for the skylark pub/sub client
//!
//! The client itself lives in the `skylark-client` crate. This crate holds
//! what an application needs around it: a TOML configuration file carrying
//! logger settings and client options, and logging initialization.
//!
//! ## Modules
//!
//! * `config`: Configuration loading and validation via `validator`.
//!   Looks at `SKYLARK_CONFIG`, then `/etc/skylark/config.toml`.
//!
//! * `logger`: Global `tracing` subscriber setup: console output in
//!   compact, pretty or JSON form, and optional systemd journald output.

pub mod config;
pub mod logger;

pub use skylark_client as client;
