// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Minimal demo binary: connects to the first configured node, sends one
//! request body read from argv, and prints whatever comes back.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use multiplex_rpc::{
    auth::{Authenticator, Credentials, HmacAuthenticator, NoAuth},
    cfg::{
        config::{AuthConfig, TransportConfig},
        logger::init_logger,
    },
    connection::{Connection, ConnectionConfig, ConnState},
    dispatch::ConnectionSet,
    registry,
    request_set::RequestSet,
    roc::Payload,
};
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "echo_client.yaml".to_string());
    let message = args.next().unwrap_or_else(|| "hello".to_string());

    let cfg = TransportConfig::load_from_file(&config_path)
        .with_context(|| format!("failed to load config at {config_path}"))?;
    let log_config_path = cfg
        .runtime
        .log_config_path
        .to_str()
        .context("runtime.LogConfigPath is not valid UTF-8")?;
    let _logger_guard = init_logger(log_config_path)?;

    let addr = first_node_addr(&cfg)?;
    let authenticator = build_authenticator(&cfg).await?;

    let connections = Arc::new(ConnectionSet::new());
    let mut conn_cfg = ConnectionConfig::new(addr, authenticator);
    conn_cfg.max_body_len = cfg.connection.max_body_len;
    let conn = Connection::new(conn_cfg);
    connections.insert(conn.clone());
    conn.start()?;

    wait_until_connected(&conn).await?;
    info!(%addr, "connected");

    let request_set = RequestSet::new(Arc::clone(&connections), cfg.connection.max_in_flight_requests);
    let reply = send_echo(&request_set, conn, message).await?;
    println!("{}", String::from_utf8_lossy(&reply));

    Ok(())
}

fn first_node_addr(cfg: &TransportConfig) -> Result<std::net::SocketAddr> {
    if let Some(path) = &cfg.nodes.registry_path {
        if let Some(addr) = registry::load(path)?.into_iter().next() {
            return Ok(addr);
        }
    }
    for entry in &cfg.nodes.static_addrs {
        if let Ok(mut it) = std::net::ToSocketAddrs::to_socket_addrs(entry) {
            if let Some(addr) = it.next() {
                return Ok(addr);
            }
        }
    }
    bail!("no usable node address found in nodes.RegistryPath or nodes.StaticAddrs")
}

async fn build_authenticator(cfg: &TransportConfig) -> Result<Arc<dyn Authenticator>> {
    match &cfg.auth {
        AuthConfig::None => Ok(Arc::new(NoAuth)),
        AuthConfig::Hmac(hmac) => {
            let creds = Credentials::load(&hmac.credentials_path)
                .await
                .context("failed to load HMAC credentials")?;
            Ok(Arc::new(HmacAuthenticator::new(creds)))
        },
    }
}

async fn wait_until_connected(conn: &multiplex_rpc::connection::ConnectionHandle) -> Result<()> {
    let mut status = conn.watch_status();
    if *status.borrow() == ConnState::Connected {
        return Ok(());
    }
    timeout(Duration::from_secs(10), async {
        loop {
            status.changed().await.context("connection dropped")?;
            if *status.borrow() == ConnState::Connected {
                return Ok::<(), anyhow::Error>(());
            }
        }
    })
    .await
    .context("timed out waiting to connect")??;
    Ok(())
}

async fn send_echo(
    request_set: &RequestSet,
    conn: multiplex_rpc::connection::ConnectionHandle,
    message: String,
) -> Result<bytes::Bytes> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));

    let assignment = request_set.start_single_node(
        conn,
        Arc::new(()),
        Arc::new(|_id, _ctx: &Arc<dyn std::any::Any + Send + Sync>| {}),
        move |handle| async move {
            let mut payload = Payload::new();
            payload.add_bytes(message.as_bytes());
            match handle.send_and_receive(payload).await {
                Ok(body) => {
                    if let Some(sender) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = sender.send(Ok(body));
                    }
                },
                Err(e) => {
                    if let Some(sender) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = sender.send(Err(e));
                    }
                },
            }
        },
    )?;
    let _ = assignment;

    let body = timeout(Duration::from_secs(10), rx)
        .await
        .context("timed out waiting for echo reply")?
        .context("echo request task ended without a reply")??;
    Ok(body)
}
