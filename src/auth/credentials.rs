// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Credentials file format (SPEC_FULL.md §6): two lines, `name` then a
//! hex-encoded 128-byte key.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};

pub const KEY_LENGTH: usize = 128;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub key: Vec<u8>,
}

impl Credentials {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let name = lines
            .next()
            .context("credentials file missing name line")?
            .trim()
            .to_string();
        let key_hex = lines
            .next()
            .context("credentials file missing key line")?
            .trim();

        let key = hex::decode(key_hex).context("credentials key is not valid hex")?;
        ensure!(
            key.len() == KEY_LENGTH,
            "credentials key must be {KEY_LENGTH} bytes, got {}",
            key.len()
        );
        ensure!(!name.is_empty(), "credentials name must not be empty");

        Ok(Self { name, key })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .context("failed to read credentials file")?;
        Self::parse(&text)
    }

    /// Re-reads `path` and replaces `self` only if the new file parses
    /// cleanly — either both fields change together or neither changes.
    pub async fn update<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let fresh = match Self::load(path).await {
            Ok(c) => c,
            Err(e) => bail!("update rejected, keeping previous credentials: {e}"),
        };
        *self = fresh;
        Ok(())
    }
}
