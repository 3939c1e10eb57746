//! Downlinks, downlink items and their builder.
//!
//! Only immediate timing is supported. Devices expecting a class A receive window are served by
//! the network server, frames sent from here are proprietary or class C.

pub mod data_rate;

use crate::downlinks::data_rate::DataRate;
use crate::error::DownlinkError;

/// A downlink to be sent. Multiple items may be specified, only one will be sent. Priority
/// is descending from first to last item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    gateway_id: String,
    downlink_id: u32,
    items: Vec<DownlinkItem>,
}

/// A single downlink to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkItem {
    phy_payload: Vec<u8>,
    frequency: u32,
    power: i32,
    data_rate: DataRate,
    polarization_inversion: bool,
    board: u32,
    antenna: u32,
}

impl Downlink {
    /// Creates a downlink from at least one item.
    ///
    /// # Errors
    ///
    /// Returns an error if `items` is empty.
    pub fn new(
        gateway_id: String,
        downlink_id: u32,
        items: Vec<DownlinkItem>,
    ) -> Result<Self, DownlinkError> {
        if items.is_empty() {
            return Err(DownlinkError::MissingParameter {
                missing: "items".to_owned(),
            });
        }
        Ok(Downlink {
            gateway_id,
            downlink_id,
            items,
        })
    }

    /// The gateway the downlink is sent from.
    #[must_use]
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }
}

/// Populate with data and build a [`DownlinkItem`].
#[derive(Debug, Clone, Default)]
pub struct DownlinkItemBuilder {
    phy_payload: Option<Vec<u8>>,
    frequency: Option<u32>,
    power: Option<i32>,
    data_rate: Option<DataRate>,
    polarization_inversion: bool,
    board: u32,
    antenna: u32,
}

impl DownlinkItemBuilder {
    /// Create a new [`DownlinkItemBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set payload.
    #[must_use]
    pub fn phy_payload(mut self, payload: Vec<u8>) -> Self {
        self.phy_payload = Some(payload);
        self
    }

    /// Set frequency in Hz.
    #[must_use]
    pub fn frequency(mut self, frequency: u32) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Set power in dBm.
    #[must_use]
    pub fn power(mut self, power: i32) -> Self {
        self.power = Some(power);
        self
    }

    /// Set data rate.
    #[must_use]
    pub fn data_rate(mut self, data_rate: DataRate) -> Self {
        self.data_rate = Some(data_rate);
        self
    }

    /// Set polarization inversion. Defaults to `false`.
    #[must_use]
    pub fn polarization_inversion(mut self, polarization_inversion: bool) -> Self {
        self.polarization_inversion = polarization_inversion;
        self
    }

    /// Set board. Defaults to `0`.
    #[must_use]
    pub fn board(mut self, board: u32) -> Self {
        self.board = board;
        self
    }

    /// Set antenna. Defaults to `0`.
    #[must_use]
    pub fn antenna(mut self, antenna: u32) -> Self {
        self.antenna = antenna;
        self
    }

    /// Builds the [`DownlinkItem`].
    ///
    /// # Errors
    ///
    /// Returns an error if payload, frequency, power or data rate is missing or if the payload
    /// exceeds the maximum size of the data rate.
    pub fn build(self) -> Result<DownlinkItem, DownlinkError> {
        let phy_payload = self.phy_payload.ok_or_else(|| missing("phy_payload"))?;
        let frequency = self.frequency.ok_or_else(|| missing("frequency"))?;
        let power = self.power.ok_or_else(|| missing("power"))?;
        let data_rate = self.data_rate.ok_or_else(|| missing("data_rate"))?;
        data_rate.check_payload_size(phy_payload.len())?;

        Ok(DownlinkItem {
            phy_payload,
            frequency,
            power,
            data_rate,
            polarization_inversion: self.polarization_inversion,
            board: self.board,
            antenna: self.antenna,
        })
    }
}

/// Shorthand for [`DownlinkError::MissingParameter`].
fn missing(parameter: &str) -> DownlinkError {
    DownlinkError::MissingParameter {
        missing: parameter.to_owned(),
    }
}

impl From<DownlinkItem> for chirpstack_api::gw::DownlinkFrameItem {
    fn from(item: DownlinkItem) -> Self {
        let (bandwidth, spreading_factor) = item.data_rate.into_raw_bandwidth_and_spreading_factor();
        let mut lora_modulation_info = chirpstack_api::gw::LoraModulationInfo {
            bandwidth,
            spreading_factor,
            polarization_inversion: item.polarization_inversion,
            ..Default::default()
        };
        lora_modulation_info.set_code_rate(chirpstack_api::gw::CodeRate::Cr45);

        let tx_info = chirpstack_api::gw::DownlinkTxInfo {
            frequency: item.frequency,
            power: item.power,
            modulation: Some(chirpstack_api::gw::Modulation {
                parameters: Some(chirpstack_api::gw::modulation::Parameters::Lora(
                    lora_modulation_info,
                )),
            }),
            board: item.board,
            antenna: item.antenna,
            timing: Some(chirpstack_api::gw::Timing {
                parameters: Some(chirpstack_api::gw::timing::Parameters::Immediately(
                    chirpstack_api::gw::ImmediatelyTimingInfo {},
                )),
            }),
            ..Default::default()
        };

        chirpstack_api::gw::DownlinkFrameItem {
            phy_payload: item.phy_payload,
            tx_info: Some(tx_info),
            tx_info_legacy: None,
        }
    }
}

impl From<Downlink> for chirpstack_api::gw::DownlinkFrame {
    fn from(downlink: Downlink) -> Self {
        chirpstack_api::gw::DownlinkFrame {
            downlink_id: downlink.downlink_id,
            gateway_id: downlink.gateway_id,
            items: downlink.items.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}
