//! Background execution of the engine: the worker loop and its handle.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::task_store::TaskStore;

use super::backoff::IdleBackoff;
use super::engine::{EngineStats, TaskEngine};
use super::reaper::reaper_loop;
use super::service::TaskService;

/// Handle to a running engine.
pub struct EngineHandle<S: TaskStore + ?Sized + 'static> {
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    reaper: JoinHandle<()>,
    engine: Arc<TaskEngine<S>>,
}

impl<S> EngineHandle<S>
where
    S: TaskStore + ?Sized + 'static,
{
    /// Stop both loops and wait for them.
    ///
    /// A handler that is already running finishes and its outcome is stored
    /// before the worker exits.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "task worker did not stop cleanly");
        }
        if let Err(err) = self.reaper.await {
            warn!(error = %err, "task reaper did not stop cleanly");
        }
        info!("task engine stopped");
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn service(&self) -> TaskService<S> {
        self.engine.service()
    }

    pub fn engine(&self) -> &Arc<TaskEngine<S>> {
        &self.engine
    }
}

impl<S> TaskEngine<S>
where
    S: TaskStore + ?Sized + 'static,
{
    /// Start the worker loop and the reaper on the current Tokio runtime.
    pub fn spawn(self) -> EngineHandle<S> {
        let engine = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(worker_loop(engine.clone(), shutdown_rx.clone()));
        let reaper = tokio::spawn(reaper_loop(engine.clone(), shutdown_rx));

        EngineHandle {
            shutdown: shutdown_tx,
            worker,
            reaper,
            engine,
        }
    }
}

async fn worker_loop<S>(engine: Arc<TaskEngine<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: TaskStore + ?Sized + 'static,
{
    let config = engine.config;
    let mut backoff = IdleBackoff::new(config.idle_min, config.idle_max);
    info!(
        idle_min_ms = config.idle_min.as_millis() as u64,
        idle_max_ms = config.idle_max.as_millis() as u64,
        handlers = ?engine.handlers,
        "task worker started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match engine.run_once().await {
            Ok(Some(_)) => {
                backoff.reset();
                continue;
            }
            Ok(None) => backoff.on_idle(),
            Err(err) => {
                // Treated as an empty cycle; the loop keeps going.
                error!(error = %err, "task poll failed");
                engine.record(|s| s.store_errors += 1);
                backoff.reset();
                backoff.min()
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = engine.wake.notified() => backoff.reset(),
            _ = tokio::time::sleep(idle) => {}
        }
    }

    info!("task worker stopped");
}
