pub mod cli;
pub mod memory;
pub mod traits;

pub use cli::CliConnection;
pub use memory::{MemoryConnection, Outbound};
pub use traits::{Connection, Destination, DestinationHandle, Event, Scope, ScopeError};

use crate::config::Config;
use std::sync::Arc;

/// Build the connection the runtime talks through.
pub fn connect(config: &Config) -> Arc<dyn Connection> {
    tracing::info!(
        server = %config.server,
        nick = %config.nick,
        charset = ?config.charset.map(|c| c.name()),
        "wire protocol is external; using console connection"
    );
    Arc::new(CliConnection::new(config.nick.clone()))
}
