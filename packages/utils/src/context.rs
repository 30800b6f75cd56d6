use std::sync::{atomic::AtomicBool, Arc};

use tokio::runtime::Runtime;
use tracing::instrument;

/// Shared process context: the multi-thread runtime every subsystem spawns
/// onto, plus a broadcast kill switch for graceful shutdown.
#[derive(Clone)]
pub struct AppContext {
    pub rt: Arc<Runtime>,
    killed: Arc<AtomicBool>,
    kill_sender: tokio::sync::broadcast::Sender<()>,
    // held so a kill() with no live subscribers doesn't error
    _kill_receiver: Arc<tokio::sync::broadcast::Receiver<()>>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AppContext {
    pub fn new(worker_threads: Option<usize>) -> Self {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(n) = worker_threads {
            builder.worker_threads(n);
        }
        let rt = Arc::new(builder.enable_all().build().unwrap());

        let (kill_sender, kill_receiver) = tokio::sync::broadcast::channel(1);

        Self {
            rt,
            kill_sender,
            _kill_receiver: Arc::new(kill_receiver),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal; long-lived loops `select!` on
    /// this alongside their work.
    #[instrument(level = "debug", skip(self), fields(subsys = "AppContext"))]
    pub fn get_kill_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.kill_sender.subscribe()
    }

    /// Typically only called from main or tests - kills the system gracefully.
    #[instrument(level = "debug", skip(self), fields(subsys = "AppContext"))]
    pub fn kill(&self) {
        self.killed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.kill_sender.send(()).unwrap();
    }

    pub fn killed(&self) -> bool {
        self.killed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kill_reaches_subscribers() {
        let ctx = AppContext::new(Some(2));
        let mut rx = ctx.get_kill_receiver();

        ctx.kill();
        assert!(ctx.killed());

        ctx.rt.clone().block_on(async move {
            rx.recv().await.unwrap();
        });
    }
}
