//! Callback traits and callback storage implementations.

use crate::error::CallbackError;
use crate::topics::{ApplicationEventType, EventType, ParsedTopic, StateType, TopicType};
use async_trait::async_trait;
use core::fmt;
use prost::bytes::Bytes;
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

/// Implement this trait if you want to build a gateway uplink callback.
#[async_trait]
pub trait EventUpCallback: Send + Sync + fmt::Debug {
    /// The function is called with every uplink frame a gateway forwards.
    async fn dispatch_up_event(
        &self,
        gateway_id: String,
        up_event: chirpstack_api::gw::UplinkFrame,
    );
}

/// Implement this trait if you want to build a downlink tx acknowledgement callback.
#[async_trait]
pub trait EventAckCallback: Send + Sync + fmt::Debug {
    /// The function is called with every tx acknowledgement a gateway sends.
    async fn dispatch_ack_event(
        &self,
        gateway_id: String,
        ack_event: chirpstack_api::gw::DownlinkTxAck,
    );
}

/// Implement this trait if you want to build a conn state callback.
#[async_trait]
pub trait StateConnCallback: Send + Sync + fmt::Debug {
    /// The function is called with every connection state change of a gateway.
    async fn dispatch_conn_state(
        &self,
        gateway_id: String,
        conn_state: chirpstack_api::gw::ConnState,
    );
}

/// Implement this trait if you want to build an application uplink callback.
#[async_trait]
pub trait ApplicationUpCallback: Send + Sync + fmt::Debug {
    /// The function is called with every decoded device uplink of the application integration.
    async fn dispatch_application_up(&self, up_event: chirpstack_api::integration::UplinkEvent);
}

/// Contains all registered callbacks, shared between the [`Runtime`](crate::runtime::Runtime)
/// and the event loop.
#[derive(Debug, Default)]
pub struct CallbackDrawers {
    /// Gateway uplink callbacks.
    pub(crate) up: HashMap<Uuid, Arc<Box<dyn EventUpCallback>>>,
    /// Gateway tx acknowledgement callbacks.
    pub(crate) ack: HashMap<Uuid, Arc<Box<dyn EventAckCallback>>>,
    /// Gateway connection state callbacks.
    pub(crate) conn: HashMap<Uuid, Arc<Box<dyn StateConnCallback>>>,
    /// Application uplink callbacks.
    pub(crate) application_up: HashMap<Uuid, Arc<Box<dyn ApplicationUpCallback>>>,
}

impl CallbackDrawers {
    /// Create a new [`CallbackDrawers`] instance without callbacks.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Remove the callback with the specified `uuid`.
    /// # Error
    /// Returns an error if the callback was not found.
    pub(crate) fn remove(&mut self, uuid: &Uuid) -> Result<(), CallbackError> {
        if self.up.remove(uuid).is_some()
            | self.ack.remove(uuid).is_some()
            | self.conn.remove(uuid).is_some()
            | self.application_up.remove(uuid).is_some()
        {
            Ok(())
        } else {
            Err(CallbackError::NoSuchCallback { uuid: *uuid })
        }
    }

    /// Decodes the payload according to the topic and spawns a task per matching callback.
    ///
    /// Topics without callback type are ignored.
    #[tracing::instrument(skip(self, msg_payload))]
    pub(crate) async fn dispatch(
        &self,
        topic: ParsedTopic,
        msg_payload: Bytes,
    ) -> Result<(), CallbackError> {
        match topic {
            ParsedTopic::Gateway {
                gateway_id,
                topic_type: TopicType::Event(EventType::Up),
                ..
            } => {
                if self.up.is_empty() {
                    return Ok(());
                }
                let uplink_frame = chirpstack_api::gw::UplinkFrame::decode(msg_payload)?;
                for callback_fn in self.up.values() {
                    let uplink_frame_clone = uplink_frame.clone();
                    let gateway_id_clone = gateway_id.clone();
                    let callback_fn_clone = callback_fn.clone();
                    tokio::task::spawn(async move {
                        callback_fn_clone
                            .dispatch_up_event(gateway_id_clone, uplink_frame_clone)
                            .await;
                    });
                }
            }
            ParsedTopic::Gateway {
                gateway_id,
                topic_type: TopicType::Event(EventType::Ack),
                ..
            } => {
                if self.ack.is_empty() {
                    return Ok(());
                }
                let tx_ack = chirpstack_api::gw::DownlinkTxAck::decode(msg_payload)?;
                for callback_fn in self.ack.values() {
                    let tx_ack_clone = tx_ack.clone();
                    let gateway_id_clone = gateway_id.clone();
                    let callback_fn_clone = callback_fn.clone();
                    tokio::task::spawn(async move {
                        callback_fn_clone
                            .dispatch_ack_event(gateway_id_clone, tx_ack_clone)
                            .await;
                    });
                }
            }
            ParsedTopic::Gateway {
                gateway_id,
                topic_type: TopicType::State(StateType::Conn),
                ..
            } => {
                if self.conn.is_empty() {
                    return Ok(());
                }
                let conn_state = chirpstack_api::gw::ConnState::decode(msg_payload)?;
                for callback_fn in self.conn.values() {
                    let conn_state_clone = conn_state.clone();
                    let gateway_id_clone = gateway_id.clone();
                    let callback_fn_clone = callback_fn.clone();
                    tokio::task::spawn(async move {
                        callback_fn_clone
                            .dispatch_conn_state(gateway_id_clone, conn_state_clone)
                            .await;
                    });
                }
            }
            ParsedTopic::Application {
                event_type: ApplicationEventType::Up,
                ..
            } => {
                if self.application_up.is_empty() {
                    return Ok(());
                }
                let up_event = chirpstack_api::integration::UplinkEvent::decode(msg_payload)?;
                for callback_fn in self.application_up.values() {
                    let up_event_clone = up_event.clone();
                    let callback_fn_clone = callback_fn.clone();
                    tokio::task::spawn(async move {
                        callback_fn_clone
                            .dispatch_application_up(up_event_clone)
                            .await;
                    });
                }
            }
            other => trace!("No callback type for topic {other:?}"),
        }
        Ok(())
    }
}

/// Type alias for the callback storage.
pub(crate) type CallbackStorage = Arc<RwLock<CallbackDrawers>>;

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::LoRaWanRegion;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct ForwardUp(mpsc::Sender<(String, Vec<u8>)>);

    #[async_trait]
    impl EventUpCallback for ForwardUp {
        async fn dispatch_up_event(
            &self,
            gateway_id: String,
            up_event: chirpstack_api::gw::UplinkFrame,
        ) {
            self.0
                .send((gateway_id, up_event.phy_payload))
                .await
                .unwrap();
        }
    }

    #[derive(Debug)]
    struct ForwardApplicationUp(mpsc::Sender<(u32, Vec<u8>)>);

    #[async_trait]
    impl ApplicationUpCallback for ForwardApplicationUp {
        async fn dispatch_application_up(
            &self,
            up_event: chirpstack_api::integration::UplinkEvent,
        ) {
            self.0.send((up_event.f_port, up_event.data)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dispatch_gateway_uplink() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut drawers = CallbackDrawers::new();
        drawers
            .up
            .insert(Uuid::new_v4(), Arc::new(Box::new(ForwardUp(tx))));

        let frame = chirpstack_api::gw::UplinkFrame {
            phy_payload: vec![0xE0, 1, 2, 3, 4],
            ..Default::default()
        };
        let topic = ParsedTopic::Gateway {
            region: LoRaWanRegion::Eu868,
            gateway_id: "0102030405060708".to_owned(),
            topic_type: TopicType::Event(EventType::Up),
        };
        drawers
            .dispatch(topic, Bytes::from(frame.encode_to_vec()))
            .await
            .unwrap();

        let (gateway_id, payload) = rx.recv().await.unwrap();
        assert_eq!(gateway_id, "0102030405060708");
        assert_eq!(payload, vec![0xE0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn dispatch_application_uplink() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut drawers = CallbackDrawers::new();
        drawers.application_up.insert(
            Uuid::new_v4(),
            Arc::new(Box::new(ForwardApplicationUp(tx))),
        );

        let event = chirpstack_api::integration::UplinkEvent {
            f_port: 201,
            data: vec![0x02, 0x10],
            ..Default::default()
        };
        let topic = ParsedTopic::try_from("application/1/device/0102030405060708/event/up").unwrap();
        drawers
            .dispatch(topic, Bytes::from(event.encode_to_vec()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), (201, vec![0x02, 0x10]));
    }

    #[tokio::test]
    async fn undecodable_payload_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let mut drawers = CallbackDrawers::new();
        drawers
            .up
            .insert(Uuid::new_v4(), Arc::new(Box::new(ForwardUp(tx))));
        let topic = ParsedTopic::try_from("eu868/gateway/0102030405060708/event/up").unwrap();
        let result = drawers
            .dispatch(topic, Bytes::from_static(&[0xFF, 0xFF, 0xFF]))
            .await;
        assert!(matches!(result, Err(CallbackError::ProstDecode(_))));
    }

    #[test]
    fn remove_unknown_callback() {
        let mut drawers = CallbackDrawers::new();
        let uuid = Uuid::new_v4();
        assert_eq!(
            drawers.remove(&uuid),
            Err(CallbackError::NoSuchCallback { uuid })
        );
    }
}
