//! framed-server: a length-prefixed request/response TCP server
//!
//! Each client connection gets its own worker thread that reads one framed
//! request and answers with one framed response.
//!
//! Features:
//! - Default reply payload, or echo of the request body
//! - Connection limit and request size cap
//! - Configuration via CLI arguments or TOML file

use framed_server::config::Config;
use framed_server::{signal, EchoBuilder, LifecycleHandler, Server};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remembers whether the listener failed to come up.
///
/// Inline mode delivers every notification once the server has stopped, so
/// the ready line is only logged when the accept loop has its own thread.
struct StartupWatch {
    failed: Rc<Cell<bool>>,
    announce: bool,
}

impl LifecycleHandler for StartupWatch {
    fn on_started(&self) {
        if self.announce {
            info!("Ready for connections");
        }
    }

    fn on_start_failed(&self) {
        self.failed.set(true);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        inline = config.inline,
        max_connections = config.max_connections,
        max_body_size = config.max_body_size,
        echo = config.echo,
        "Starting framed-server"
    );

    let failed = Rc::new(Cell::new(false));
    let mut server = Server::new(config.server_config()).with_lifecycle(StartupWatch {
        failed: Rc::clone(&failed),
        announce: !config.inline,
    });
    if config.echo {
        server = server.with_response_builder(Arc::new(EchoBuilder));
    }

    // First SIGINT/SIGTERM drains, a second one aborts in-flight connections
    signal::install(server.stop_handle())?;

    // Inline mode returns from start only after the server has stopped
    server.start()?;
    if !config.inline {
        server.run_until_stopped();
    }

    if failed.get() {
        error!("Server failed to start");
        return Err(format!("failed to listen on {}:{}", config.host, config.port).into());
    }
    Ok(())
}
