//! Daemon assembly.
//!
//! Wires configuration, shared state, the driver, the worker task and the RPC
//! server together, and tears them down in reverse order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ExposedConfig;
use crate::controller::{initial_state, Controller};
use crate::driver::{resolve_driver, CcdDriver, DriverContext, DriverResult};
use crate::error::AppResult;
use crate::peers::Peers;
use crate::rpc::{AllowList, RpcService};
use crate::server;
use crate::state::ExposureState;
use crate::worker::{Worker, WorkerHandle};

/// A running exposure daemon.
pub struct Daemon {
    controller: Controller,
    local_addr: SocketAddr,
    server_task: JoinHandle<()>,
    server_shutdown: Option<oneshot::Sender<()>>,
    worker: WorkerHandle,
}

impl Daemon {
    /// Start with no telescope or spectrograph connection.
    pub async fn start(config: ExposedConfig) -> AppResult<Self> {
        Self::start_with_peers(config, Peers::offline()).await
    }

    /// Start with explicit peer connections and the configured driver.
    pub async fn start_with_peers(config: ExposedConfig, peers: Peers) -> AppResult<Self> {
        let name = config.driver.name.clone();
        Self::start_with_driver(config, peers, |ctx| resolve_driver(&name, ctx)).await
    }

    /// Start with a driver built by `build` instead of the one named in the
    /// configuration.
    pub async fn start_with_driver<F>(
        config: ExposedConfig,
        peers: Peers,
        build: F,
    ) -> AppResult<Self>
    where
        F: FnOnce(DriverContext) -> DriverResult<Arc<dyn CcdDriver>>,
    {
        let config = Arc::new(config);
        let shared = initial_state(&config);

        let driver = build(DriverContext::new(shared.clone()))?;
        info!(driver = driver.name(), version = %driver.version(), "initialising CCD driver");
        driver.init().await?;

        let controller = Controller::new(shared.clone(), Arc::clone(&driver), Arc::clone(&config));
        let worker = Worker::new(shared, driver, peers, Arc::clone(&config)).spawn();

        let listener = TcpListener::bind(config.exposed.listen.as_str()).await?;
        let local_addr = listener.local_addr()?;
        let service = Arc::new(RpcService::new(
            controller.clone(),
            AllowList::new(config.exposed.allowed_ips.clone()),
        ));
        let (tx, rx) = oneshot::channel();
        let server_task = tokio::spawn(server::serve(listener, service, rx));

        info!(
            %local_addr,
            instrument = %config.exposed.instrument,
            "exposure daemon started"
        );

        Ok(Self {
            controller,
            local_addr,
            server_task,
            server_shutdown: Some(tx),
            worker,
        })
    }

    /// Address the RPC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Controller behind the RPC surface.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Stop accepting requests, abort any running batch, then release the
    /// camera.
    pub async fn shutdown(mut self) {
        info!("exposure daemon shutting down");
        if let Some(tx) = self.server_shutdown.take() {
            // The server may already have exited.
            let _ = tx.send(());
        }
        if let Err(e) = self.server_task.await {
            warn!(error = %e, "rpc server task ended abnormally");
        }
        if self.controller.shared().state() != ExposureState::Ready {
            info!("aborting the running batch");
            self.controller.request_abort();
        }

        self.worker.shutdown().await;

        if let Err(e) = self.controller.driver().uninit().await {
            warn!(error = %e, "driver uninit failed");
        }
        info!("exposure daemon stopped");
    }
}
