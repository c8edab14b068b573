//! Subsystem lifecycle.
//!
//! The binary drives every subsystem through the same four phases:
//! configure with the loaded configuration, start, serve until told to
//! stop, and answer state-dump requests (SIGUSR1) at any point in
//! between. Startup order is configuration order; shutdown is the
//! reverse.

use async_trait::async_trait;

use crate::config::Config;

#[async_trait]
pub trait Subsystem: Send {
    fn name(&self) -> &'static str;

    /// Validate and absorb configuration. No sockets yet.
    fn configure(&mut self, config: &Config) -> anyhow::Result<()>;

    /// Bind resources and begin serving.
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stop serving and release resources. Must be safe to call after a
    /// failed start.
    async fn stop(&mut self);

    /// Point-in-time internal state, for operator-triggered dumps.
    async fn dump_state(&self) -> serde_json::Value;
}
