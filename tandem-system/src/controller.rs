use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Determines how to shut down the services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Shut down gracefully, giving services the configured timeout to finish open work.
    Graceful,
    /// Shut down immediately without finishing open work.
    Immediate,
}

/// Shutdown request sent by the [`Controller`] to all [`ShutdownHandle`]s.
///
/// A service has to ensure that it doesn't take longer than `timeout` to finish. After the
/// timeout the process shuts down regardless of what the services do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle through [`Controller::shutdown_handle`] and poll
/// [`notified`](Self::notified) in the service's select loop.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits for the shutdown signal.
    ///
    /// Resolves once per shutdown request. If the controller is dropped without ever shutting
    /// down, this never resolves.
    pub async fn notified(&mut self) -> Shutdown {
        while self.0.changed().await.is_ok() {
            if let Some(shutdown) = &*self.0.borrow_and_update() {
                return shutdown.clone();
            }
        }

        std::future::pending().await
    }

    /// Returns `true` if a shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Service to start and gracefully stop the system's services.
///
/// The controller hands out [`ShutdownHandle`]s to services and broadcasts a [`Shutdown`] to
/// all of them, either on a process signal (see [`run_until_signal`](Self::run_until_signal))
/// or when [`shutdown`](Self::shutdown) is called manually.
#[derive(Clone)]
pub struct Controller {
    timeout: Duration,
    tx: Arc<watch::Sender<Option<Shutdown>>>,
}

impl Controller {
    /// Creates a new controller with the timeout given to services on graceful shutdown.
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            timeout: shutdown_timeout,
            tx: Arc::new(tx),
        }
    }

    /// Returns the configured shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a handle to receive shutdown notifications.
    ///
    /// Handles created after a shutdown has been requested are notified immediately.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        ShutdownHandle(rx)
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let timeout = match mode {
            ShutdownMode::Graceful => Some(self.timeout),
            ShutdownMode::Immediate => None,
        };

        self.tx.send_replace(Some(Shutdown { timeout }));
    }

    /// Waits for a termination signal and then shuts the system down.
    ///
    /// `SIGINT` and `SIGQUIT` shut down immediately, `SIGTERM` shuts down gracefully within the
    /// configured timeout. Returns the mode that was used.
    pub async fn run_until_signal(&self) -> ShutdownMode {
        let mode = wait_for_signal(self.timeout).await;
        self.shutdown(mode);
        mode
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("timeout", &self.timeout)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(unix)]
async fn wait_for_signal(timeout: Duration) -> ShutdownMode {
    use tokio::signal::unix::{SignalKind, signal};

    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );

    let (mut term, mut quit) = match signals {
        (Ok(term), Ok(quit)) => (term, quit),
        (Err(error), _) | (_, Err(error)) => {
            tandem_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to register signal handlers, listening for ctrl-c only"
            );
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        mode = wait_for_ctrl_c() => mode,
        _ = quit.recv() => {
            tandem_log::info!("SIGQUIT received, exiting");
            ShutdownMode::Immediate
        }
        _ = term.recv() => {
            tandem_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
            ShutdownMode::Graceful
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(_timeout: Duration) -> ShutdownMode {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> ShutdownMode {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tandem_log::info!("SIGINT received, exiting"),
        Err(error) => {
            tandem_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to listen for ctrl-c"
            );
            std::future::pending::<()>().await;
        }
    }

    ShutdownMode::Immediate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notified_once() {
        tokio::time::pause();

        let controller = Controller::new(Duration::from_secs(3));
        let mut handle = controller.shutdown_handle();
        assert!(!handle.is_shutdown());

        controller.shutdown(ShutdownMode::Graceful);
        let shutdown = handle.notified().await;
        assert_eq!(shutdown.timeout, Some(Duration::from_secs(3)));

        // A second poll must not resolve again for the same request.
        let again = tokio::time::timeout(Duration::from_secs(1), handle.notified()).await;
        assert!(again.is_err());
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_handle_is_notified() {
        let controller = Controller::new(Duration::from_secs(3));
        controller.shutdown(ShutdownMode::Immediate);

        let mut handle = controller.shutdown_handle();
        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }

    #[tokio::test]
    async fn test_dropped_controller_never_notifies() {
        tokio::time::pause();

        let controller = Controller::new(Duration::from_secs(3));
        let mut handle = controller.shutdown_handle();
        drop(controller);

        let result = tokio::time::timeout(Duration::from_secs(1), handle.notified()).await;
        assert!(result.is_err());
    }
}
