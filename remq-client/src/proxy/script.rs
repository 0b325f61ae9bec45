//! Server-side script execution.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use remq_core::{Command, FromResp, RemqError, Result};

use crate::dispatch::CommandDispatcher;

/// A script body, evaluated through its cached digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Script {
    body: Arc<str>,
}

impl Script {
    /// Wraps a script body.
    pub fn new(body: impl Into<Arc<str>>) -> Self {
        Self { body: body.into() }
    }

    /// Returns the script body.
    pub fn body(&self) -> &str {
        &self.body
    }
}

fn is_noscript(error: &RemqError) -> bool {
    matches!(error, RemqError::Remote(message) if message.starts_with("NOSCRIPT"))
}

/// Runs scripts atomically on the server.
///
/// Script errors come back as [`RemqError::Remote`] and are never retried, with
/// one exception: [`evaluate`](Self::evaluate) reloads a script the server has
/// forgotten and runs it again.
#[derive(Clone)]
pub struct ScriptService {
    dispatcher: CommandDispatcher,
    digests: Arc<DashMap<Arc<str>, String>>,
}

impl fmt::Debug for ScriptService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptService")
            .field("cached", &self.digests.len())
            .finish()
    }
}

impl ScriptService {
    pub(crate) fn new(dispatcher: CommandDispatcher) -> Self {
        Self {
            dispatcher,
            digests: Arc::new(DashMap::new()),
        }
    }

    /// Evaluates a script body.
    pub async fn eval<R: FromResp>(&self, script: &str, keys: &[&str], args: &[&str]) -> Result<R> {
        let command = Command::new("EVAL")
            .arg(script)
            .arg(keys.len())
            .args(keys.iter().copied())
            .args(args.iter().copied());
        self.dispatcher.execute(command).await
    }

    /// Evaluates a script previously loaded under `sha`.
    pub async fn eval_sha<R: FromResp>(&self, sha: &str, keys: &[&str], args: &[&str]) -> Result<R> {
        let command = Command::new("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .args(keys.iter().copied())
            .args(args.iter().copied());
        self.dispatcher.execute(command).await
    }

    /// Loads a script without running it and returns its digest.
    pub async fn script_load(&self, script: &str) -> Result<String> {
        self.dispatcher
            .execute(Command::new("SCRIPT").arg("LOAD").arg(script))
            .await
    }

    /// Reports which of the digests the server knows.
    pub async fn script_exists(&self, shas: &[&str]) -> Result<Vec<bool>> {
        if shas.is_empty() {
            return Ok(Vec::new());
        }
        self.dispatcher
            .execute(
                Command::new("SCRIPT")
                    .arg("EXISTS")
                    .args(shas.iter().copied()),
            )
            .await
    }

    /// Drops every script from the server cache and forgets local digests.
    pub async fn script_flush(&self) -> Result<()> {
        self.digests.clear();
        let _: String = self
            .dispatcher
            .execute(Command::new("SCRIPT").arg("FLUSH"))
            .await?;
        Ok(())
    }

    /// Runs a script through its digest, loading it on first use and again if
    /// the server no longer knows it.
    pub async fn evaluate<R: FromResp>(&self, script: &Script, keys: &[&str], args: &[&str]) -> Result<R> {
        let cached = self.digests.get(&script.body).map(|sha| sha.value().clone());
        let sha = match cached {
            Some(sha) => sha,
            None => self.load(script).await?,
        };

        match self.eval_sha(&sha, keys, args).await {
            Err(e) if is_noscript(&e) => {
                tracing::debug!(sha = %sha, "script missing on server, reloading");
                let sha = self.load(script).await?;
                self.eval_sha(&sha, keys, args).await
            }
            result => result,
        }
    }

    async fn load(&self, script: &Script) -> Result<String> {
        let sha = self.script_load(script.body()).await?;
        self.digests.insert(Arc::clone(&script.body), sha.clone());
        Ok(sha)
    }
}
