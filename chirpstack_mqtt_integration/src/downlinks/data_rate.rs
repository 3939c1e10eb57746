//! EU868 data rates and their modulation parameters.

use crate::error::{DataRateConversionError, DownlinkError};
use serde_derive::{Deserialize, Serialize};

/// Data rates.
/// DR0-DR5 required by LoRa standard for end devices and gateways.
#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataRate {
    Eu863_870Dr0,
    Eu863_870Dr1,
    Eu863_870Dr2,
    Eu863_870Dr3,
    Eu863_870Dr4,
    Eu863_870Dr5,
    Eu863_870Dr6,
}

impl TryFrom<i64> for DataRate {
    type Error = DataRateConversionError;

    fn try_from(index: i64) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(DataRate::Eu863_870Dr0),
            1 => Ok(DataRate::Eu863_870Dr1),
            2 => Ok(DataRate::Eu863_870Dr2),
            3 => Ok(DataRate::Eu863_870Dr3),
            4 => Ok(DataRate::Eu863_870Dr4),
            5 => Ok(DataRate::Eu863_870Dr5),
            6 => Ok(DataRate::Eu863_870Dr6),
            _ => Err(DataRateConversionError::NoSuchIndex { index }),
        }
    }
}

impl DataRate {
    /// Returns the maximum payload (PHYPayload) size for a given [`DataRate`].
    ///
    /// Repeater compatability might reduce the maximum payload size.
    #[must_use]
    pub fn max_allowed_payload_size(&self, repeater_compatible: bool) -> usize {
        // MHDR + MACPayload + MIC
        match self {
            DataRate::Eu863_870Dr0 | DataRate::Eu863_870Dr1 | DataRate::Eu863_870Dr2 => 1 + 59 + 4,
            DataRate::Eu863_870Dr3 => 1 + 123 + 4,
            DataRate::Eu863_870Dr4 | DataRate::Eu863_870Dr5 | DataRate::Eu863_870Dr6 => {
                if repeater_compatible {
                    1 + 230 + 4
                } else {
                    1 + 250 + 4
                }
            }
        }
    }

    /// Checks whether the supplied payload is within the allowed payload size for the specified
    /// data rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too big for the data rate.
    pub fn check_payload_size(&self, payload_size: usize) -> Result<(), DownlinkError> {
        let max_payload_size = self.max_allowed_payload_size(false);
        if payload_size > max_payload_size {
            return Err(DownlinkError::PayloadTooBig {
                over_limit: payload_size - max_payload_size,
            });
        }
        Ok(())
    }

    /// Attempts to convert the provided bandwidth (Hz) and spreading factor into a data rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter combination is not valid.
    pub fn from_raw_bandwidth_and_spreading_factor(
        bandwidth: u32,
        spreading_factor: u32,
    ) -> Result<Self, DataRateConversionError> {
        match (bandwidth, spreading_factor) {
            (125_000, 12) => Ok(Self::Eu863_870Dr0),
            (125_000, 11) => Ok(Self::Eu863_870Dr1),
            (125_000, 10) => Ok(Self::Eu863_870Dr2),
            (125_000, 9) => Ok(Self::Eu863_870Dr3),
            (125_000, 8) => Ok(Self::Eu863_870Dr4),
            (125_000, 7) => Ok(Self::Eu863_870Dr5),
            (250_000, 7) => Ok(Self::Eu863_870Dr6),
            _ => Err(DataRateConversionError::WrongParameters {
                bandwidth,
                spreading_factor,
            }),
        }
    }

    /// Returns bandwidth and spreading factor corresponding to the data rate as [`u32`].
    ///
    /// Returns: (bandwidth, spreading_factor)
    #[must_use]
    pub fn into_raw_bandwidth_and_spreading_factor(self) -> (u32, u32) {
        match self {
            DataRate::Eu863_870Dr0 => (125_000, 12),
            DataRate::Eu863_870Dr1 => (125_000, 11),
            DataRate::Eu863_870Dr2 => (125_000, 10),
            DataRate::Eu863_870Dr3 => (125_000, 9),
            DataRate::Eu863_870Dr4 => (125_000, 8),
            DataRate::Eu863_870Dr5 => (125_000, 7),
            DataRate::Eu863_870Dr6 => (250_000, 7),
        }
    }
}
