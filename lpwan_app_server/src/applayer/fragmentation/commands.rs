//! Fragmented data block transport commands (LoRaWAN TS004).
//!
//! Requests are encoded for the downlink direction, answers are parsed from uplinks. Multi-byte
//! fields are little endian.

use crate::error::{CommandParserError, IResult};
use crate::lorawan::FragDescriptor;
use nom::combinator::map;
use nom::sequence::tuple;
use nom::Err::Failure;
use nom::Finish;
use tracing::trace;

/// FPort of the package.
pub const FPORT: u8 = 201;

/// CID of FragSessionStatusReq / FragSessionStatusAns.
const FRAG_SESSION_STATUS: u8 = 0x01;
/// CID of FragSessionSetupReq / FragSessionSetupAns.
const FRAG_SESSION_SETUP: u8 = 0x02;
/// CID of FragSessionDeleteReq / FragSessionDeleteAns.
const FRAG_SESSION_DELETE: u8 = 0x03;

/// Parameters of a FragSessionSetupReq.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSessionSetupReq {
    /// FragIndex slot (0-3).
    pub frag_index: u8,
    /// Multicast groups the session is bound to, indexed by McGroupID.
    pub mc_group_bit_mask: [bool; 4],
    /// Amount of fragments.
    pub nb_frag: u16,
    /// Fragment size in bytes.
    pub frag_size: u8,
    /// Fragmentation matrix (3 bits).
    pub fragmentation_matrix: u8,
    /// Block ack delay exponent (3 bits).
    pub block_ack_delay: u8,
    /// Padding bytes of the last fragment.
    pub padding: u8,
    /// Descriptor of the data.
    pub descriptor: FragDescriptor,
}

/// Requests sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentationRequest {
    /// Asks for the status of a session.
    FragSessionStatusReq {
        /// Whether all devices or only those missing fragments answer.
        participants: bool,
        /// FragIndex slot (0-3).
        frag_index: u8,
    },
    /// Creates a session.
    FragSessionSetupReq(FragSessionSetupReq),
    /// Deletes a session.
    FragSessionDeleteReq {
        /// FragIndex slot (0-3).
        frag_index: u8,
    },
}

impl FragmentationRequest {
    /// Command name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            FragmentationRequest::FragSessionStatusReq { .. } => "FragSessionStatusReq",
            FragmentationRequest::FragSessionSetupReq(_) => "FragSessionSetupReq",
            FragmentationRequest::FragSessionDeleteReq { .. } => "FragSessionDeleteReq",
        }
    }

    /// Encodes the command including its CID.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FragmentationRequest::FragSessionStatusReq {
                participants,
                frag_index,
            } => vec![
                FRAG_SESSION_STATUS,
                ((frag_index & 0x03) << 1) | u8::from(*participants),
            ],
            FragmentationRequest::FragSessionSetupReq(req) => {
                let mut frag_session = (req.frag_index & 0x03) << 4;
                for (id, set) in req.mc_group_bit_mask.iter().enumerate() {
                    if *set {
                        frag_session |= 1 << id;
                    }
                }
                let control = ((req.fragmentation_matrix & 0x07) << 3) | (req.block_ack_delay & 0x07);

                let mut bytes = Vec::with_capacity(11);
                bytes.push(FRAG_SESSION_SETUP);
                bytes.push(frag_session);
                bytes.extend_from_slice(&req.nb_frag.to_le_bytes());
                bytes.push(req.frag_size);
                bytes.push(control);
                bytes.push(req.padding);
                bytes.extend_from_slice(&req.descriptor.0);
                bytes
            }
            FragmentationRequest::FragSessionDeleteReq { frag_index } => {
                vec![FRAG_SESSION_DELETE, frag_index & 0x03]
            }
        }
    }
}

/// Answers received from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentationAnswer {
    /// Status of a session.
    FragSessionStatusAns {
        /// FragIndex slot.
        frag_index: u8,
        /// Fragments received so far (14 bits).
        nb_frag_received: u16,
        /// Fragments still missing.
        missing_frag: u8,
        /// The device ran out of memory for the decoding matrix.
        not_enough_matrix_memory: bool,
    },
    /// Result of a setup.
    FragSessionSetupAns {
        /// FragIndex slot.
        frag_index: u8,
        /// The descriptor is not accepted.
        wrong_descriptor: bool,
        /// The FragIndex is not supported.
        frag_session_index_not_supported: bool,
        /// Not enough memory for the session.
        not_enough_memory: bool,
        /// The fragmentation matrix is not supported.
        encoding_unsupported: bool,
    },
    /// Result of a deletion.
    FragSessionDeleteAns {
        /// FragIndex slot.
        frag_index: u8,
        /// There was no session in the slot.
        session_does_not_exist: bool,
    },
}

/// Parse the first bit in the input as bool.
fn parse_bit_flag(input: (&[u8], usize)) -> IResult<(&[u8], usize), bool> {
    map(nom::bits::complete::take(1_usize), |bit: u8| bit > 0)(input)
}

/// Takes two bits and parses them into an u8.
fn parse_2_bits_into_u8(input: (&[u8], usize)) -> IResult<(&[u8], usize), u8> {
    nom::bits::complete::take(2_usize)(input)
}

/// Parse the FragSessionStatusAns payload.
fn parse_frag_session_status_ans(input: &[u8]) -> IResult<&[u8], FragmentationAnswer> {
    trace!("Parsing FragSessionStatusAns");
    let (input, received_and_index) = nom::number::complete::le_u16(input)?;
    let (input, missing_frag) = nom::number::complete::u8(input)?;
    let (input, status) = nom::number::complete::u8(input)?;
    Ok((
        input,
        FragmentationAnswer::FragSessionStatusAns {
            frag_index: u8::try_from(received_and_index >> 14).unwrap_or_default(),
            nb_frag_received: received_and_index & 0x3fff,
            missing_frag,
            not_enough_matrix_memory: status & 0x01 != 0,
        },
    ))
}

/// Parse the FragSessionSetupAns payload.
///
/// Bits from most to least significant: FragIndex (2), RFU (2), WrongDescriptor,
/// FragSessionIndexNotSupported, NotEnoughMemory, EncodingUnsupported.
fn parse_frag_session_setup_ans(input: &[u8]) -> IResult<&[u8], FragmentationAnswer> {
    trace!("Parsing FragSessionSetupAns");
    nom::bits::bits(map(
        tuple((
            parse_2_bits_into_u8,
            parse_2_bits_into_u8,
            parse_bit_flag,
            parse_bit_flag,
            parse_bit_flag,
            parse_bit_flag,
        )),
        |(
            frag_index,
            _rfu,
            wrong_descriptor,
            frag_session_index_not_supported,
            not_enough_memory,
            encoding_unsupported,
        )| FragmentationAnswer::FragSessionSetupAns {
            frag_index,
            wrong_descriptor,
            frag_session_index_not_supported,
            not_enough_memory,
            encoding_unsupported,
        },
    ))(input)
}

/// Parse the FragSessionDeleteAns payload.
///
/// Bits from most to least significant: RFU (5), SessionDoesNotExist, FragIndex (2).
fn parse_frag_session_delete_ans(input: &[u8]) -> IResult<&[u8], FragmentationAnswer> {
    trace!("Parsing FragSessionDeleteAns");
    let rfu = nom::bits::complete::take::<_, u8, _, CommandParserError>(5_usize);
    nom::bits::bits(map(
        tuple((rfu, parse_bit_flag, parse_2_bits_into_u8)),
        |(_, session_does_not_exist, frag_index)| FragmentationAnswer::FragSessionDeleteAns {
            frag_index,
            session_does_not_exist,
        },
    ))(input)
}

/// Parse a CID and the answer it announces.
fn parse_answer_command(input: &[u8]) -> IResult<&[u8], FragmentationAnswer> {
    let (input, cid) = nom::number::complete::u8(input)?;
    match cid {
        FRAG_SESSION_STATUS => parse_frag_session_status_ans(input),
        FRAG_SESSION_SETUP => parse_frag_session_setup_ans(input),
        FRAG_SESSION_DELETE => parse_frag_session_delete_ans(input),
        cid => Err(Failure(CommandParserError::UnknownCid { cid })),
    }
}

/// Parses the answer contained in an uplink payload.
///
/// # Errors
///
/// Returns an error if the CID is unknown or the payload is truncated.
pub fn parse_answer(payload: &[u8]) -> Result<FragmentationAnswer, CommandParserError> {
    parse_answer_command(payload)
        .finish()
        .map(|(_, answer)| answer)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_setup_req() {
        let req = FragmentationRequest::FragSessionSetupReq(FragSessionSetupReq {
            frag_index: 1,
            mc_group_bit_mask: [true, false, true, false],
            nb_frag: 0x0102,
            frag_size: 50,
            fragmentation_matrix: 1,
            block_ack_delay: 2,
            padding: 7,
            descriptor: FragDescriptor([0xaa, 0xbb, 0xcc, 0xdd]),
        });
        assert_eq!(
            req.to_bytes(),
            vec![0x02, 0b0001_0101, 0x02, 0x01, 50, 0b0000_1010, 7, 0xaa, 0xbb, 0xcc, 0xdd]
        );
        assert_eq!(req.name(), "FragSessionSetupReq");
    }

    #[test]
    fn encode_status_and_delete_req() {
        assert_eq!(
            FragmentationRequest::FragSessionStatusReq {
                participants: true,
                frag_index: 3
            }
            .to_bytes(),
            vec![0x01, 0b0000_0111]
        );
        assert_eq!(
            FragmentationRequest::FragSessionDeleteReq { frag_index: 2 }.to_bytes(),
            vec![0x03, 0x02]
        );
    }

    #[test]
    fn parse_setup_ans() {
        assert_eq!(
            parse_answer(&[0x02, 0b1000_0000]).unwrap(),
            FragmentationAnswer::FragSessionSetupAns {
                frag_index: 2,
                wrong_descriptor: false,
                frag_session_index_not_supported: false,
                not_enough_memory: false,
                encoding_unsupported: false,
            }
        );
        assert_eq!(
            parse_answer(&[0x02, 0b0100_1010]).unwrap(),
            FragmentationAnswer::FragSessionSetupAns {
                frag_index: 1,
                wrong_descriptor: true,
                frag_session_index_not_supported: false,
                not_enough_memory: true,
                encoding_unsupported: false,
            }
        );
    }

    #[test]
    fn parse_delete_ans() {
        assert_eq!(
            parse_answer(&[0x03, 0b0000_0111]).unwrap(),
            FragmentationAnswer::FragSessionDeleteAns {
                frag_index: 3,
                session_does_not_exist: true,
            }
        );
    }

    #[test]
    fn parse_status_ans() {
        // FragIndex 1, 10 received, 2 missing, not enough matrix memory
        assert_eq!(
            parse_answer(&[0x01, 0x0a, 0x40, 0x02, 0x01]).unwrap(),
            FragmentationAnswer::FragSessionStatusAns {
                frag_index: 1,
                nb_frag_received: 10,
                missing_frag: 2,
                not_enough_matrix_memory: true,
            }
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            parse_answer(&[0x05, 0x00]),
            Err(CommandParserError::UnknownCid { cid: 0x05 })
        );
        assert_eq!(parse_answer(&[0x01, 0x0a]), Err(CommandParserError::Truncated));
        assert_eq!(parse_answer(&[]), Err(CommandParserError::Truncated));
    }
}
