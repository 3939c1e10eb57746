//! All errors for this crate.
use thiserror::Error;
use uuid::Uuid;

/// Errors occuring when handling callbacks.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Prost decode error: {0}")]
    ProstDecode(#[from] prost::DecodeError),
    #[error("No callback found for Uuid: {uuid}")]
    NoSuchCallback { uuid: Uuid },
}

/// Errors occurring while parsing MQTT topic strings.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicParsingError {
    #[error("Could not parse LoRaWanRegion: {was}")]
    LoRaWanRegion { was: String },
    #[error("Could not parse TopicType: \"{was}\"")]
    TopicType { was: String },
    #[error("Could not parse CommandType: \"{was}\"")]
    CommandType { was: String },
    #[error("Could not parse StateType: \"{was}\"")]
    StateType { was: String },
    #[error("Could not parse EventType: \"{was}\"")]
    EventType { was: String },
    #[error("Topic does not have 5 or 6 elements separated by \"/\": {length}")]
    WrongLength { length: usize },
    #[error("No \"gateway\" or \"application\" marker was found.")]
    NoTopicMarker,
}

/// Errors returned by the runtime.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("Uuid collision, this is extremely unlikely. Try again if you encounter this error.")]
    UuidCollision,
    #[error("Rumqttc client error: {0}")]
    RumqttcClient(#[from] rumqttc::ClientError),
    #[error("Runtime was stopped")]
    Stopped,
}

/// Errors occurring when creating downlinks.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownlinkError {
    #[error("Missing parameter: {missing}")]
    MissingParameter { missing: String },
    #[error("Payload is too big, over limit by: {over_limit}")]
    PayloadTooBig { over_limit: usize },
}

/// Errors occurring when converting to a data rate.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataRateConversionError {
    #[error("Parameters do not match any data rate, bandwidth: {bandwidth} spreading_factor: {spreading_factor}")]
    WrongParameters {
        bandwidth: u32,
        spreading_factor: u32,
    },
    #[error("No such data rate index: {index}")]
    NoSuchIndex { index: i64 },
}
