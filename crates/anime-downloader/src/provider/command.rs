//! Provider backed by an external scraper executable.
//!
//! Protocol, one invocation per call:
//!
//! ```text
//! <command> [args..] search <query> <sub|dub>      -> JSON array of search results
//! <command> [args..] get <provider_id>              -> JSON object
//! <command> [args..] streams <provider_id> <episode> <sub|dub>
//!                                                   -> one JSON server per line
//! ```

use super::{
    ContentProvider, EpisodeStreamsParams, ProviderAnime, ProviderSearchResult, SearchParams,
    Server,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use shared::config::ProviderConfig;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

pub struct CommandProvider {
    name: String,
    command: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn command(&self, sub_args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .args(sub_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_json<T: DeserializeOwned>(&self, sub_args: &[&str]) -> Result<T> {
        debug!(provider = %self.name, args = ?sub_args, "Running provider command");

        let output = self
            .command(sub_args)
            .output()
            .await
            .with_context(|| format!("Failed to run provider command '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Provider command '{}' failed ({}): {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Failed to parse output of provider '{}'", self.name))
    }
}

#[async_trait]
impl ContentProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, params: &SearchParams) -> Result<Vec<ProviderSearchResult>> {
        let translation = params.translation_type.to_string();
        self.run_json(&["search", &params.query, &translation]).await
    }

    async fn get(&self, provider_id: &str) -> Result<ProviderAnime> {
        self.run_json(&["get", provider_id]).await
    }

    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<BoxStream<'static, Server>> {
        let translation = params.translation_type.to_string();
        let mut child = self
            .command(&["streams", &params.anime_id, &params.episode, &translation])
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run provider command '{}'", self.command))?;

        let stdout = child
            .stdout
            .take()
            .context("Provider command has no stdout")?;
        let lines = BufReader::new(stdout).lines();
        let provider = self.name.clone();

        // The child stays in the state so dropping the stream kills it
        let servers = stream::unfold((lines, child, provider), |(mut lines, child, provider)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Server>(line) {
                            Ok(server) => return Some((server, (lines, child, provider))),
                            Err(e) => {
                                warn!(provider = %provider, error = %e, "Skipping malformed server line");
                            }
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "Failed to read provider output");
                        return None;
                    }
                }
            }
        });

        Ok(servers.boxed())
    }
}
