use tokio::sync::broadcast;
use tracing::info;

/// Broadcasts the shutdown signal to every subscriber.
#[derive(Clone)]
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
}

impl ShutdownController {
    pub fn new() -> (Self, ShutdownReceiver) {
        let (tx, rx) = broadcast::channel(1);
        (Self { tx }, ShutdownReceiver { rx })
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

pub struct ShutdownReceiver {
    rx: broadcast::Receiver<()>,
}

impl ShutdownReceiver {
    pub async fn wait_for_shutdown(mut self) {
        let _ = self.rx.recv().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.rx.resubscribe()
    }
}

/// Listen for SIGINT and SIGTERM; the returned receiver resolves once either
/// arrives.
pub fn setup_signal_handlers() -> ShutdownReceiver {
    let (controller, receiver) = ShutdownController::new();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        controller.shutdown();
    });

    receiver
}
