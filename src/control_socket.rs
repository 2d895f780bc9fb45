// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Unix control socket (SPEC_FULL.md §6): a line-oriented protocol for the
//! node side of the core. The only command this crate interprets is
//! `update-credentials`; anything else is rejected with an error line so a
//! richer node-side dispatcher can be layered on top without this listener
//! needing to know about it.

use std::{path::Path, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};
use tracing::{info, warn};

use crate::auth::Credentials;

/// Re-reads the credentials file on `update-credentials`, replacing the
/// live `Credentials` only if the new file parses cleanly.
pub struct ControlSocket {
    credentials: Arc<tokio::sync::RwLock<Credentials>>,
    credentials_path: std::path::PathBuf,
}

impl ControlSocket {
    pub fn new(
        credentials: Arc<tokio::sync::RwLock<Credentials>>,
        credentials_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            credentials,
            credentials_path: credentials_path.into(),
        }
    }

    /// Binds `socket_path` (removing a stale socket file left by a previous
    /// run) and serves connections until the process exits.
    pub async fn serve(self: Arc<Self>, socket_path: impl AsRef<Path>) -> std::io::Result<()> {
        let socket_path = socket_path.as_ref();
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "control socket listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    warn!(error = %e, "control socket connection ended with an error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            let reply = self.dispatch(line.trim()).await;
            write_half.write_all(reply.as_bytes()).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, command: &str) -> String {
        match command {
            "update-credentials" => match self.update_credentials().await {
                Ok(()) => "Credentials updated.\n".to_string(),
                Err(e) => format!("Error updating credentials: {e}\n"),
            },
            other => format!("Error updating credentials: unknown command {other:?}\n"),
        }
    }

    async fn update_credentials(&self) -> anyhow::Result<()> {
        let mut guard = self.credentials.write().await;
        guard.update(&self.credentials_path).await
    }
}
