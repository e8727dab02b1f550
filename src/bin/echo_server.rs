//! Minimal demo: a TCP endpoint that echoes every received byte back to
//! its sender, exercising the accept/receive/close hooks and the fast-path
//! send.

use evio::config::Config;
use evio::reactor::ReactorGroup;
use evio::TcpEndpoint;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(config) {
        warn!(error = %e, "echo server exited with an error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(config: Config) -> std::io::Result<()> {
    let group = ReactorGroup::new(256)?;
    let endpoint = TcpEndpoint::init_server(
        config.port,
        config.endpoint_buf_size,
        config.conn_buf_size,
        group.clone(),
    )
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    endpoint.borrow_mut().set_accept_callback(|ep, conn| {
        info!(connections = ep.connection_count(), "accepted connection");
        let _ = conn;
        0
    });

    endpoint.borrow_mut().set_receive_callback(|ep, conn, data| {
        if let Err(e) = ep.send(conn, data) {
            warn!(error = %e, "echo send failed");
        }
    });

    endpoint.borrow_mut().set_close_callback(|_ep, _conn, code| {
        info!(code, "connection closed");
    });

    info!(port = config.port, "echo server listening");
    group.run_until(|| false)
}
