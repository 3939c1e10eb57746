//! The event loop processing incoming MQTT messages.

use crate::runtime::callbacks::CallbackStorage;
use crate::topics::ParsedTopic;
use rumqttc::{EventLoop, Incoming};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Amount of connection errors within [`CONNECTION_ERROR_WINDOW`] that are reported.
const CONNECTION_ERROR_LIMIT: usize = 3;
/// Window in which connection errors are counted.
const CONNECTION_ERROR_WINDOW: Duration = Duration::from_secs(30);

/// Runs the event loop processing incoming MQTT messages. Needs to be spawned in an async task and
/// kept running until a stop signal is received.
///
/// The event loop reconnects on its own. If more than [`CONNECTION_ERROR_LIMIT`] errors occur
/// within [`CONNECTION_ERROR_WINDOW`], the last error is sent to `connection_error_sender`.
#[tracing::instrument(skip_all)]
pub(crate) async fn run_event_loop(
    mut event_loop: EventLoop,
    callbacks: CallbackStorage,
    connection_error_sender: Option<tokio::sync::broadcast::Sender<String>>,
    mut stop_signal_rx: tokio::sync::mpsc::Receiver<()>,
) {
    let mut recent_errors: VecDeque<Instant> = VecDeque::with_capacity(CONNECTION_ERROR_LIMIT + 1);
    loop {
        let notification = tokio::select! {
            notification = event_loop.poll() => notification,
            _ = stop_signal_rx.recv() => {
                trace!("Stop signal received");
                return;
            }
        };

        match notification {
            Ok(rumqttc::Event::Incoming(Incoming::Publish(pub_msg))) => {
                trace!("Incoming publish on {}", pub_msg.topic);
                let parsed_topic = match ParsedTopic::try_from(pub_msg.topic.as_str()) {
                    Ok(parsed_topic) => parsed_topic,
                    Err(e) => {
                        error!(%e);
                        continue;
                    }
                };

                if let Err(e) = callbacks
                    .read()
                    .await
                    .dispatch(parsed_topic, pub_msg.payload)
                    .await
                {
                    error!(%e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(%e);
                let now = Instant::now();
                recent_errors.push_back(now);
                while recent_errors
                    .front()
                    .map_or(false, |first| now.duration_since(*first) > CONNECTION_ERROR_WINDOW)
                {
                    recent_errors.pop_front();
                }
                if recent_errors.len() > CONNECTION_ERROR_LIMIT {
                    if let Some(sender) = &connection_error_sender {
                        if let Err(err) = sender.send(e.to_string()) {
                            error!(%err);
                        }
                    }
                    recent_errors.clear();
                }
                // Avoid a busy loop while the broker is unreachable.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
