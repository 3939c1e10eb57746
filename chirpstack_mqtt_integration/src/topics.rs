//! ChirpStack MQTT topic parsing.
//!
//! Two topic families are understood:
//! - gateway bridge: `<region>/gateway/<gateway_id>/<event|state|command>/<type>`
//! - application integration: `application/<application_id>/device/<dev_eui>/event/<type>`

use crate::error::TopicParsingError;
use serde_derive::Deserialize;

/// LoRaWAN regions.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub enum LoRaWanRegion {
    As923,
    As923_2,
    As923_3,
    As923_4,
    Au915,
    Cn470,
    Eu433,
    Eu868,
    In865,
    Kr920,
    Ru864,
    Us915,
    Ism2400,
}

impl LoRaWanRegion {
    /// Topic prefix used by the gateway bridge for this region.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LoRaWanRegion::As923 => "as923",
            LoRaWanRegion::As923_2 => "as923-2",
            LoRaWanRegion::As923_3 => "as923-3",
            LoRaWanRegion::As923_4 => "as923-4",
            LoRaWanRegion::Au915 => "au915",
            LoRaWanRegion::Cn470 => "cn470",
            LoRaWanRegion::Eu433 => "eu433",
            LoRaWanRegion::Eu868 => "eu868",
            LoRaWanRegion::In865 => "in865",
            LoRaWanRegion::Kr920 => "kr920",
            LoRaWanRegion::Ru864 => "ru864",
            LoRaWanRegion::Us915 => "us915",
            LoRaWanRegion::Ism2400 => "ism2400",
        }
    }

    /// Topic the gateway bridge listens on for downlinks of `gateway_id`.
    #[must_use]
    pub fn downlink_topic(&self, gateway_id: &str) -> String {
        format!("{}/gateway/{gateway_id}/command/down", self.as_str())
    }
}

impl TryFrom<&str> for LoRaWanRegion {
    type Error = TopicParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "as923" => Ok(LoRaWanRegion::As923),
            "as923-2" => Ok(LoRaWanRegion::As923_2),
            "as923-3" => Ok(LoRaWanRegion::As923_3),
            "as923-4" => Ok(LoRaWanRegion::As923_4),
            "au915" => Ok(LoRaWanRegion::Au915),
            "cn470" => Ok(LoRaWanRegion::Cn470),
            "eu433" => Ok(LoRaWanRegion::Eu433),
            "eu868" => Ok(LoRaWanRegion::Eu868),
            "in865" => Ok(LoRaWanRegion::In865),
            "kr920" => Ok(LoRaWanRegion::Kr920),
            "ru864" => Ok(LoRaWanRegion::Ru864),
            "us915" => Ok(LoRaWanRegion::Us915),
            "ism2400" => Ok(LoRaWanRegion::Ism2400),
            _ => Err(TopicParsingError::LoRaWanRegion {
                was: value.to_owned(),
            }),
        }
    }
}

impl TryFrom<String> for LoRaWanRegion {
    type Error = TopicParsingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LoRaWanRegion::try_from(value.as_str())
    }
}

/// Gateway bridge topic types.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopicType {
    Event(EventType),
    State(StateType),
    Command(CommandType),
}

impl TryFrom<(&str, &str)> for TopicType {
    type Error = TopicParsingError;

    fn try_from(value: (&str, &str)) -> Result<Self, Self::Error> {
        let (topic_type, topic_sub_type) = value;
        match topic_type {
            "event" => Ok(TopicType::Event(topic_sub_type.try_into()?)),
            "state" => Ok(TopicType::State(topic_sub_type.try_into()?)),
            "command" => Ok(TopicType::Command(topic_sub_type.try_into()?)),
            _ => Err(TopicParsingError::TopicType {
                was: topic_type.to_owned(),
            }),
        }
    }
}

/// All possible event types.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventType {
    Stats,
    Up,
    Ack,
    Exec,
    Raw,
}

impl TryFrom<&str> for EventType {
    type Error = TopicParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "stats" => Ok(EventType::Stats),
            "up" => Ok(EventType::Up),
            "ack" => Ok(EventType::Ack),
            "exec" => Ok(EventType::Exec),
            "raw" => Ok(EventType::Raw),
            _ => Err(TopicParsingError::EventType {
                was: value.to_owned(),
            }),
        }
    }
}

/// All possible state types.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateType {
    Conn,
}

impl TryFrom<&str> for StateType {
    type Error = TopicParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "conn" => Ok(StateType::Conn),
            _ => Err(TopicParsingError::StateType {
                was: value.to_owned(),
            }),
        }
    }
}

/// All possible command types.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommandType {
    Down,
    Config,
    Exec,
    Raw,
}

impl TryFrom<&str> for CommandType {
    type Error = TopicParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "down" => Ok(CommandType::Down),
            "config" => Ok(CommandType::Config),
            "exec" => Ok(CommandType::Exec),
            "raw" => Ok(CommandType::Raw),
            _ => Err(TopicParsingError::CommandType {
                was: value.to_owned(),
            }),
        }
    }
}

/// Application integration event types.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ApplicationEventType {
    Up,
    /// Any other event (join, ack, txack, status, log, location, integration).
    Other(String),
}

impl From<&str> for ApplicationEventType {
    fn from(value: &str) -> Self {
        match value {
            "up" => ApplicationEventType::Up,
            other => ApplicationEventType::Other(other.to_owned()),
        }
    }
}

/// A parsed MQTT topic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParsedTopic {
    /// Gateway bridge topic.
    Gateway {
        /// The region.
        region: LoRaWanRegion,
        /// The gateway ID.
        gateway_id: String,
        /// The type of topic.
        topic_type: TopicType,
    },
    /// Application integration topic.
    Application {
        /// Application ID (UUID string).
        application_id: String,
        /// Device EUI (hex).
        dev_eui: String,
        /// The event type.
        event_type: ApplicationEventType,
    },
}

impl TryFrom<&str> for ParsedTopic {
    type Error = TopicParsingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let split_topic: Vec<&str> = value.split('/').collect();
        match split_topic.as_slice() {
            [region, "gateway", gateway_id, topic_type, topic_sub_type] => {
                Ok(ParsedTopic::Gateway {
                    region: LoRaWanRegion::try_from(*region)?,
                    gateway_id: (*gateway_id).to_owned(),
                    topic_type: TopicType::try_from((*topic_type, *topic_sub_type))?,
                })
            }
            ["application", application_id, "device", dev_eui, "event", event_type] => {
                Ok(ParsedTopic::Application {
                    application_id: (*application_id).to_owned(),
                    dev_eui: (*dev_eui).to_owned(),
                    event_type: ApplicationEventType::from(*event_type),
                })
            }
            [_, _, _, _, _] | [_, _, _, _, _, _] => Err(TopicParsingError::NoTopicMarker),
            _ => Err(TopicParsingError::WrongLength {
                length: split_topic.len(),
            }),
        }
    }
}
