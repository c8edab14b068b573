//! Relay engine subsystem.
//!
//! Owns the shared session context, the bound listener, and the accept
//! task. Configuration picks the original-destination resolver: the
//! netfilter lookup in normal operation, or a fixed destination for
//! environments without a packet filter (and for tests).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::relay::{RelayListener, SessionContext};
use crate::resolver::FixedResolver;
use crate::subsystem::Subsystem;

pub struct RelayEngine {
    ctx: Option<Arc<SessionContext>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl RelayEngine {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: None,
            accept_task: None,
            local_addr: None,
            shutdown,
        }
    }

    /// Address the listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn context(&self) -> Option<&Arc<SessionContext>> {
        self.ctx.as_ref()
    }

    fn build_resolver(config: &Config) -> anyhow::Result<Arc<dyn crate::resolver::OriginalDst>> {
        if let Some(destination) = config.fixed_destination {
            return Ok(Arc::new(FixedResolver::new(destination)));
        }
        #[cfg(target_os = "linux")]
        {
            Ok(Arc::new(crate::resolver::NetfilterResolver))
        }
        #[cfg(not(target_os = "linux"))]
        {
            anyhow::bail!(
                "Netfilter destination recovery is Linux-only; \
                 set SHUNT_FIXED_DESTINATION on this platform"
            )
        }
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subsystem for RelayEngine {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn configure(&mut self, config: &Config) -> anyhow::Result<()> {
        let resolver = Self::build_resolver(config)?;
        let ctx = SessionContext::new(config.clone(), resolver)
            .context("Unable to build relay context")?;
        info!(
            proxy = %config.proxy.addr,
            kind = config.proxy.kind.as_str(),
            autoproxy = config.autoproxy.enabled,
            "Relay engine configured"
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .context("Relay engine started before configure")?;
        let listener = Arc::new(RelayListener::bind(Arc::clone(ctx)).await?);
        self.local_addr = Some(listener.local_addr());

        let shutdown = self.shutdown.subscribe();
        self.accept_task = Some(tokio::spawn(listener.run(shutdown)));
        Ok(())
    }

    async fn stop(&mut self) {
        self.shutdown.send(true).ok();
        if let Some(task) = self.accept_task.take() {
            task.await.ok();
        }
        info!("Relay engine stopped");
    }

    async fn dump_state(&self) -> serde_json::Value {
        let Some(ctx) = &self.ctx else {
            return json!({ "configured": false });
        };
        json!({
            "configured": true,
            "listen_addr": self.local_addr.map(|a| a.to_string()),
            "stats": ctx.stats.snapshot(),
            "session_states": ctx.gauges.snapshot(),
            "decision_cache": ctx.cache.dump().await,
        })
    }
}
