//! Top-level assembly: configuration, databases, plugins and one driver
//! per configured network.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::task::JoinSet;

use crate::clock::Clock;
use crate::config::{NetworkSettings, Registry};
use crate::context::Context;
use crate::driver::{self, Shutdown};
use crate::plugin::{Catalog, PluginHost, SharedHost};
use crate::session::Session;

pub struct Bot {
    ctx: Context,
    host: SharedHost,
    networks: Vec<NetworkSettings>,
    shutdown: Shutdown,
}

impl Bot {
    /// Open the databases next to `registry`'s file, discover and load
    /// plugins, and read the network list.
    pub fn with_registry(registry: Arc<Registry>, mut catalog: Catalog, clock: Clock) -> Result<Self> {
        let ctx = Context::open(registry.clone(), clock).context("opening databases")?;

        for dir in plugin_dirs(&registry) {
            if !dir.is_dir() {
                tracing::warn!(dir = %dir.display(), "Plugin directory does not exist");
                continue;
            }
            match catalog.discover(&dir) {
                Ok(n) => tracing::info!(dir = %dir.display(), plugins = n, "Discovered plugins"),
                Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Could not scan plugin directory"),
            }
        }

        let host = PluginHost::new(catalog, registry.clone()).shared();
        let failed = host.lock().load_configured();
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "Some configured plugins did not load");
        }

        let mut networks = Vec::new();
        for name in registry.set_of("networks", None, None) {
            match NetworkSettings::from_registry(&registry, &name) {
                Ok(settings) => networks.push(settings),
                Err(e) => tracing::error!(network = %name, error = %e, "Skipping network"),
            }
        }

        Ok(Self { ctx, host, networks, shutdown: Shutdown::new() })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn host(&self) -> &SharedHost {
        &self.host
    }

    pub fn networks(&self) -> &[NetworkSettings] {
        &self.networks
    }

    /// A handle that stops [`Bot::run`] (for signal handlers).
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// A fresh session sharing this bot's context and plugins.
    pub fn session(&self, settings: NetworkSettings) -> Session {
        Session::new(settings, self.ctx.clone(), self.host.clone())
    }

    /// Run every network until shutdown, then save state.
    pub async fn run(self) -> Result<()> {
        if self.networks.is_empty() {
            tracing::warn!("No networks configured");
        }
        let mut drivers = JoinSet::new();
        for settings in &self.networks {
            let name = settings.name.clone();
            let session = self.session(settings.clone());
            let shutdown = self.shutdown.clone();
            drivers.spawn(async move { (name, driver::run(session, shutdown).await) });
        }

        let every = self.ctx.registry.int("databases.flushInterval", None, None).max(1) as u64;
        let mut housekeeping = tokio::time::interval(Duration::from_secs(every));
        housekeeping.tick().await;
        let mut shutdown_rx = self.shutdown.subscribe();

        while !drivers.is_empty() {
            tokio::select! {
                Some(done) = drivers.join_next() => match done {
                    Ok((network, Ok(()))) => tracing::info!(%network, "Network finished"),
                    Ok((network, Err(e))) => tracing::error!(%network, error = %format!("{e:#}"), "Network failed"),
                    Err(e) => tracing::error!(error = %e, "Driver task panicked"),
                },
                _ = housekeeping.tick() => self.housekeeping(),
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Shutting down");
        self.host.lock().shutdown();
        self.ctx.expire().context("expiring databases")?;
        self.ctx.flush().context("writing databases")?;
        self.ctx.save_config().context("writing configuration")?;
        Ok(())
    }

    fn housekeeping(&self) {
        if let Err(e) = self.ctx.expire() {
            tracing::error!(error = %e, "Expiring bans and ignores failed");
        }
        if let Err(e) = self.ctx.flush() {
            tracing::error!(error = %e, "Writing databases failed");
        }
    }
}

/// `directories.plugins`, relative entries resolved like other directories.
fn plugin_dirs(registry: &Registry) -> Vec<PathBuf> {
    let base = registry.path().and_then(|p| p.parent().map(Path::to_path_buf));
    registry
        .set_of("directories.plugins", None, None)
        .into_iter()
        .map(PathBuf::from)
        .map(|dir| match &base {
            Some(base) if dir.is_relative() => base.join(dir),
            _ => dir,
        })
        .collect()
}
