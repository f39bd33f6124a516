//! growgate entrypoint.
//!
//! Loads (or creates) the JSON config, binds the datagram sockets with
//! the documented fallback behavior, prepares the TLS material, wires
//! the transport pump into the relay loop, serves the HTTPS
//! interceptor, and shuts everything down on SIGINT/SIGTERM.

use std::net::UdpSocket;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::unbounded_channel;

use growgate_core::config::Config;
use growgate_gateway::relay::{LoopMsg, Relay};
use growgate_gateway::resolver::Resolver;
use growgate_gateway::tls;
use growgate_gateway::transport::Transport;
use growgate_gateway::web::{self, WebContext};

const CONFIG_PATH: &str = "config.json";

/// How far past the configured port the listener scan goes.
const PORT_SCAN_RANGE: u16 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load_or_create(Path::new(CONFIG_PATH))?);
    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .init();

    tracing::info!(
        "gateway.starting server_port={} web_port={} upstream={}",
        config.server.port,
        config.web.port,
        config.server.address
    );

    let (listen_socket, listen_port) = bind_listener(config.server.port)?;
    let local_socket = bind_local(config.client.local_port)?;
    let tls_config = tls::server_config(
        Path::new(&config.web.cert_path),
        Path::new(&config.web.key_path),
    )?;
    let resolver = Arc::new(Resolver::new(&config.dns_server())?);

    let (loop_tx, loop_rx) = unbounded_channel();
    let mut transport = Transport::spawn(listen_socket, local_socket, {
        let tx = loop_tx.clone();
        move |event| {
            let _ = tx.send(LoopMsg::Transport(event));
        }
    })?;

    let mut relay = Relay::with_channel(
        config.clone(),
        listen_port,
        transport.handle(),
        resolver.clone(),
        loop_tx,
        loop_rx,
    );
    if config.scripts.enabled {
        relay.install_builtin_plugins();
        tracing::info!("scripts.enabled path={}", config.scripts.path);
    } else {
        tracing::info!("scripts.disabled");
    }

    let web_ctx = WebContext {
        config: config.clone(),
        listen_port,
        endpoints: relay.endpoint_updates(),
        resolver,
    };
    let mut web_task = tokio::spawn(web::run(web_ctx, tls_config));

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let result: anyhow::Result<()> = tokio::select! {
        result = relay.run() => result,
        result = &mut web_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(err.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("gateway.signal name=SIGINT");
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!("gateway.signal name=SIGTERM");
            Ok(())
        }
    };

    relay.shutdown();
    web_task.abort();
    transport.join();
    tracing::info!("gateway.stopped");
    result
}

/// Binds the inbound datagram listener, scanning up the port range when
/// the configured port is taken.
fn bind_listener(port: u16) -> anyhow::Result<(UdpSocket, u16)> {
    match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(socket) => {
            let actual = socket.local_addr().map(|addr| addr.port()).unwrap_or(port);
            return Ok((socket, actual));
        }
        Err(err) => {
            tracing::warn!("gateway.listen_port_taken port={port} error={err}");
        }
    }
    let upper = port.saturating_add(PORT_SCAN_RANGE);
    for candidate in port.saturating_add(1)..=upper {
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", candidate)) {
            tracing::warn!("gateway.listen_port_replaced port={port} replacement={candidate}");
            return Ok((socket, candidate));
        }
    }
    anyhow::bail!(
        "no free datagram port in [{}..={upper}]",
        port.saturating_add(1)
    )
}

/// Binds the outbound socket's local port, falling back to ephemeral.
fn bind_local(port: u16) -> anyhow::Result<UdpSocket> {
    if port != 0 {
        match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => return Ok(socket),
            Err(err) => {
                tracing::warn!(
                    "gateway.local_port_taken port={port} error={err} fallback=ephemeral"
                );
            }
        }
    }
    UdpSocket::bind(("0.0.0.0", 0)).context("bind ephemeral local datagram port")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_scans_past_a_taken_port() {
        let taken = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let (socket, chosen) = bind_listener(port).unwrap();
        assert_ne!(chosen, port);
        assert!(chosen > port && chosen <= port.saturating_add(PORT_SCAN_RANGE));
        assert_eq!(socket.local_addr().unwrap().port(), chosen);
    }

    #[test]
    fn listener_keeps_a_free_port() {
        let probe = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let (_socket, chosen) = bind_listener(port).unwrap();
        assert_eq!(chosen, port);
    }

    #[test]
    fn local_port_falls_back_to_ephemeral() {
        let taken = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let socket = bind_local(port).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), port);
    }
}
