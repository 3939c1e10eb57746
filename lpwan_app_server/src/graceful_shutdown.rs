//! Graceful shutdown of the background tasks.
//!
//! Every long-running task owns a [`ShutdownAgent`]. It waits for the shutdown notification
//! and may report a fatal condition itself. The [`ShutdownController`] in `main` receives the
//! conditions, notifies all agents and waits until every agent is dropped or the timeout
//! elapsed.
//!
//! A [`ShutdownInitiator`] can only report conditions and is not waited for. The panic hook
//! holds one.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{error, trace};

/// Conditions leading to a shutdown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ShutdownConditions {
    /// A panic occurred.
    Panic,
    /// The MQTT event loop reported a connection error.
    MqttError,
    /// The REST API server could not be started or failed.
    AxumStartFailed,
}

/// Creates the agents, initiators and finally the controller sharing the same channels.
#[derive(Debug)]
pub struct ShutdownGenerator {
    /// Notifies the agents to shut down.
    notify_tx: watch::Sender<()>,
    /// Sender half handed to agents and initiators.
    condition_tx: mpsc::Sender<ShutdownConditions>,
    /// Receiver half handed to the controller.
    condition_rx: mpsc::Receiver<ShutdownConditions>,
    /// Cloned into every agent, closed once all agents are dropped.
    complete_indicator_tx: mpsc::Sender<()>,
    /// Receiver half handed to the controller.
    complete_indicator_rx: mpsc::Receiver<()>,
}

impl Default for ShutdownGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownGenerator {
    /// Creates a new [`ShutdownGenerator`].
    #[must_use]
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(());
        let (condition_tx, condition_rx) = mpsc::channel(1);
        let (complete_indicator_tx, complete_indicator_rx) = mpsc::channel(1);

        Self {
            notify_tx,
            condition_tx,
            condition_rx,
            complete_indicator_tx,
            complete_indicator_rx,
        }
    }

    /// Generate a new [`ShutdownInitiator`].
    #[must_use]
    pub fn generate_initiator(&self) -> ShutdownInitiator {
        ShutdownInitiator {
            condition_tx: self.condition_tx.clone(),
        }
    }

    /// Generate a new [`ShutdownAgent`].
    #[must_use]
    pub fn generate_agent(&self) -> ShutdownAgent {
        ShutdownAgent {
            shutdown: false,
            notify_rx: self.notify_tx.subscribe(),
            condition_tx: self.condition_tx.clone(),
            _complete_indicator_tx: self.complete_indicator_tx.clone(),
        }
    }

    /// Consume the generator and create the [`ShutdownController`].
    ///
    /// Agents created afterwards can only be cloned from existing ones.
    #[must_use]
    pub fn generate_control(self) -> ShutdownController {
        ShutdownController {
            notify_tx: self.notify_tx,
            condition_rx: self.condition_rx,
            complete_indicator_rx: self.complete_indicator_rx,
        }
    }
}

/// Reports [`ShutdownConditions`] without taking part in the shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownInitiator {
    /// Sender of conditions to the controller.
    condition_tx: mpsc::Sender<ShutdownConditions>,
}

impl ShutdownInitiator {
    /// Report `reason` to the controller.
    pub fn initiate_shutdown(&self, reason: ShutdownConditions) {
        trace!("Initiate shutdown: {reason:?}");
        if let Err(err) = self.condition_tx.try_send(reason) {
            error!(%err);
        }
    }
}

/// Receives shutdown conditions and drives the shutdown of all agents.
#[derive(Debug)]
pub struct ShutdownController {
    /// Notifies the agents to shut down.
    notify_tx: watch::Sender<()>,
    /// Reported conditions.
    condition_rx: mpsc::Receiver<ShutdownConditions>,
    /// Returns `None` once every agent is dropped.
    complete_indicator_rx: mpsc::Receiver<()>,
}

impl ShutdownController {
    /// Notifies every [`ShutdownAgent`] to shut down.
    pub fn start_shutdown(&self) {
        trace!("Start shutdown");
        if self.notify_tx.receiver_count() > 0 {
            if let Err(err) = self.notify_tx.send(()) {
                error!(%err);
            }
        } else {
            trace!("No shutdown notify subscribers");
        }
    }

    /// Waits until all agents are dropped, at most `timeout_secs` seconds.
    pub async fn await_complete_shutdown(&mut self, timeout_secs: u64) {
        tokio::select! {
            _ = time::sleep(Duration::from_secs(timeout_secs)) => {
                trace!("Timeout over, forcing shutdown");
            },
            _ = self.complete_indicator_rx.recv() => {}
        }
    }

    /// Waits for the first reported condition.
    pub async fn await_shutdown_initiation(&mut self) -> Option<ShutdownConditions> {
        self.condition_rx.recv().await
    }
}

/// Handle of a task taking part in the graceful shutdown.
///
/// The shutdown is complete once every agent and all of its clones are dropped, so a task must
/// drop its agent when it finished.
#[derive(Debug, Clone)]
pub struct ShutdownAgent {
    /// Whether the shutdown notification was seen or a condition was reported.
    shutdown: bool,
    /// Shutdown notification.
    notify_rx: watch::Receiver<()>,
    /// Sender of conditions to the controller.
    condition_tx: mpsc::Sender<ShutdownConditions>,
    /// Dropped together with the agent.
    _complete_indicator_tx: mpsc::Sender<()>,
}

impl ShutdownAgent {
    /// Report `reason` to the controller and consider this agent shut down.
    pub fn initiate_shutdown(&mut self, reason: ShutdownConditions) {
        trace!("Initiate shutdown: {reason:?}");
        if let Err(err) = self.condition_tx.try_send(reason) {
            error!(%err);
        }
        self.shutdown = true;
    }

    /// Waits for the shutdown notification, returns immediately once it was seen.
    pub async fn await_shutdown(&mut self) {
        if self.shutdown {
            return;
        }

        let _ = self.notify_rx.changed().await;

        self.shutdown = true;
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn condition_reaches_controller() {
        let generator = ShutdownGenerator::new();
        let initiator = generator.generate_initiator();
        let mut agent = generator.generate_agent();
        let mut control = generator.generate_control();

        initiator.initiate_shutdown(ShutdownConditions::Panic);
        assert_eq!(
            control.await_shutdown_initiation().await,
            Some(ShutdownConditions::Panic)
        );

        agent.initiate_shutdown(ShutdownConditions::MqttError);
        assert_eq!(
            control.await_shutdown_initiation().await,
            Some(ShutdownConditions::MqttError)
        );
        // a reporting agent does not wait for the notification
        agent.await_shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_completes_when_agents_dropped() {
        let generator = ShutdownGenerator::new();
        let mut agent = generator.generate_agent();
        let mut control = generator.generate_control();

        let task = tokio::spawn(async move {
            agent.await_shutdown().await;
        });
        control.start_shutdown();
        tokio::time::timeout(Duration::from_secs(5), control.await_complete_shutdown(60))
            .await
            .unwrap();
        task.await.unwrap();
    }
}
