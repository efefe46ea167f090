use std::io;
use std::net::SocketAddr;

use stackdriver_exposition::RegistryError;
use thiserror::Error as ThisError;

use crate::client::auth::AuthError;
use crate::client::ClientError;
use crate::collector::CollectorInitError;
use crate::discovery::DiscoveryError;

/// Errors that could occur while starting the exporter.
#[derive(Debug, ThisError)]
pub enum StartupError {
    /// Creating the runtime or the token transport did not succeed.
    #[error("failed to set up the runtime: {0}")]
    Io(#[from] io::Error),

    /// No usable credentials were found.
    #[error("failed to obtain credentials: {0}")]
    Auth(#[from] AuthError),

    /// The API client could not be created.
    #[error("failed to create the API client: {0}")]
    Client(#[from] ClientError),

    /// The projects to collect could not be determined.
    #[error("failed to determine the projects to collect: {0}")]
    Projects(#[from] DiscoveryError),

    /// The collection settings are invalid.
    #[error("invalid collector configuration: {0}")]
    Collector(#[from] CollectorInitError),

    /// The exporter's own collectors could not be registered.
    #[error("failed to register the exporter's collectors: {0}")]
    Registration(#[from] RegistryError),

    /// Binding to the listen address did not succeed.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        /// The listen address.
        address: SocketAddr,
        /// The cause.
        source: io::Error,
    },
}
