// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Node registry file parsing (SPEC_FULL.md §6): plain text, one
//! `host:port` per line; blank lines and `#`-prefixed lines are ignored.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
};

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::sync::Arc<std::io::Error>,
    },
    #[error("registry line {line}: {text:?} is not a valid host:port")]
    BadLine { line: usize, text: String },
}

/// Parses the text of a node registry file into the addresses it names, in
/// file order. Blank lines and lines whose first non-whitespace character
/// is `#` are skipped entirely.
pub fn parse(text: &str) -> Result<Vec<SocketAddr>, RegistryError> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let addr = line
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| RegistryError::BadLine {
                line: idx + 1,
                text: line.to_string(),
            })?;
        out.push(addr);
    }
    Ok(out)
}

/// Reads and parses a registry file from disk.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<SocketAddr>, RegistryError> {
    let path_ref = path.as_ref();
    let text = std::fs::read_to_string(path_ref).map_err(|e| RegistryError::Read {
        path: path_ref.display().to_string(),
        source: std::sync::Arc::new(e),
    })?;
    parse(&text)
}
