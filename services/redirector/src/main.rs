//! shunt redirector binary.
//!
//! Loads configuration from the environment, runs the subsystems, and
//! translates signals: SIGTERM/SIGINT shut down, SIGUSR1 logs a state
//! dump from every subsystem.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shunt_redirector::config::Config;
use shunt_redirector::engine::RelayEngine;
use shunt_redirector::subsystem::Subsystem;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to SHUNT_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting shunt redirector");
    info!(
        listen = %config.listen_addr,
        proxy = %config.proxy.addr,
        kind = config.proxy.kind.as_str(),
        autoproxy = config.autoproxy.enabled,
        max_sessions = config.max_sessions,
        "Configuration loaded"
    );

    let mut subsystems: Vec<Box<dyn Subsystem>> = vec![Box::new(RelayEngine::new())];

    for subsystem in subsystems.iter_mut() {
        subsystem.configure(&config)?;
    }
    for subsystem in subsystems.iter_mut() {
        subsystem.start().await?;
        info!(subsystem = subsystem.name(), "Subsystem started");
    }

    wait_for_shutdown(&subsystems).await?;

    // Reverse of startup order.
    for subsystem in subsystems.iter_mut().rev() {
        subsystem.stop().await;
    }
    info!("Redirector goes down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(subsystems: &[Box<dyn Subsystem>]) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "Shutdown requested");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "Shutdown requested");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                for subsystem in subsystems {
                    let state = subsystem.dump_state().await;
                    info!(subsystem = subsystem.name(), state = %state, "State dump");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_subsystems: &[Box<dyn Subsystem>]) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "Shutdown requested");
    Ok(())
}
