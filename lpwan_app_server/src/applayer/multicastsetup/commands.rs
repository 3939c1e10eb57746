//! Remote multicast setup commands (LoRaWAN TS005).
//!
//! Requests are encoded for the downlink direction, answers are parsed from uplinks. Multi-byte
//! fields are little endian.

use crate::error::{CommandParserError, IResult};
use crate::lorawan::{Aes128Key, DevAddr};
use chrono::{DateTime, TimeZone, Utc};
use nom::combinator::map;
use nom::sequence::tuple;
use nom::Err::Failure;
use nom::Finish;
use tracing::trace;

/// FPort of the package.
pub const FPORT: u8 = 200;

/// CID of McGroupSetupReq / McGroupSetupAns.
const MC_GROUP_SETUP: u8 = 0x02;
/// CID of McGroupDeleteReq / McGroupDeleteAns.
const MC_GROUP_DELETE: u8 = 0x03;
/// CID of McClassCSessionReq / McClassCSessionAns.
const MC_CLASS_C_SESSION: u8 = 0x04;

/// Unix timestamp of the GPS epoch, 1980-01-06T00:00:00Z.
const GPS_EPOCH_UNIX_SECS: i64 = 315_964_800;
/// Leap seconds between UTC and GPS time since 2017-01-01.
const GPS_LEAP_SECONDS: i64 = 18;

/// Seconds since the GPS epoch modulo 2^32, as used for SessionTime.
#[must_use]
pub fn gps_epoch_seconds(time: DateTime<Utc>) -> u32 {
    let seconds = time.timestamp() - GPS_EPOCH_UNIX_SECS + GPS_LEAP_SECONDS;
    u32::try_from(seconds.rem_euclid(1 << 32)).unwrap_or_default()
}

/// Inverse of [`gps_epoch_seconds`] within the first 2^32 seconds after the GPS epoch.
#[must_use]
pub fn from_gps_epoch_seconds(seconds: u32) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::from(seconds) + GPS_EPOCH_UNIX_SECS - GPS_LEAP_SECONDS, 0)
        .single()
}

/// Requests sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastSetupRequest {
    /// Creates a multicast group.
    McGroupSetupReq {
        /// McGroupID slot (0-3).
        mc_group_id: u8,
        /// Multicast address.
        mc_addr: DevAddr,
        /// Multicast key encrypted with the McKEKey.
        mc_key_encrypted: Aes128Key,
        /// Lowest accepted frame counter.
        min_mc_f_cnt: u32,
        /// Highest accepted frame counter.
        max_mc_f_cnt: u32,
    },
    /// Deletes a multicast group.
    McGroupDeleteReq {
        /// McGroupID slot (0-3).
        mc_group_id: u8,
    },
    /// Schedules a class C session.
    McClassCSessionReq {
        /// McGroupID slot (0-3).
        mc_group_id: u8,
        /// Start of the session in seconds since the GPS epoch modulo 2^32.
        session_time: u32,
        /// The session lasts 2^time_out seconds (4 bits).
        session_time_out: u8,
        /// Downlink frequency in Hz, sent in steps of 100 Hz.
        dl_frequency: u32,
        /// Data rate.
        dr: u8,
    },
}

impl MulticastSetupRequest {
    /// Command name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MulticastSetupRequest::McGroupSetupReq { .. } => "McGroupSetupReq",
            MulticastSetupRequest::McGroupDeleteReq { .. } => "McGroupDeleteReq",
            MulticastSetupRequest::McClassCSessionReq { .. } => "McClassCSessionReq",
        }
    }

    /// Encodes the command including its CID.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MulticastSetupRequest::McGroupSetupReq {
                mc_group_id,
                mc_addr,
                mc_key_encrypted,
                min_mc_f_cnt,
                max_mc_f_cnt,
            } => {
                let mut bytes = Vec::with_capacity(30);
                bytes.push(MC_GROUP_SETUP);
                bytes.push(mc_group_id & 0x03);
                bytes.extend_from_slice(&mc_addr.to_le_bytes());
                bytes.extend_from_slice(&mc_key_encrypted.0);
                bytes.extend_from_slice(&min_mc_f_cnt.to_le_bytes());
                bytes.extend_from_slice(&max_mc_f_cnt.to_le_bytes());
                bytes
            }
            MulticastSetupRequest::McGroupDeleteReq { mc_group_id } => {
                vec![MC_GROUP_DELETE, mc_group_id & 0x03]
            }
            MulticastSetupRequest::McClassCSessionReq {
                mc_group_id,
                session_time,
                session_time_out,
                dl_frequency,
                dr,
            } => {
                let mut bytes = Vec::with_capacity(11);
                bytes.push(MC_CLASS_C_SESSION);
                bytes.push(mc_group_id & 0x03);
                bytes.extend_from_slice(&session_time.to_le_bytes());
                bytes.push(session_time_out & 0x0f);
                bytes.extend_from_slice(&(dl_frequency / 100).to_le_bytes()[..3]);
                bytes.push(*dr);
                bytes
            }
        }
    }
}

/// Answers received from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastSetupAnswer {
    /// Result of a group setup.
    McGroupSetupAns {
        /// McGroupID slot.
        mc_group_id: u8,
        /// The McGroupID is not supported.
        id_error: bool,
    },
    /// Result of a group deletion.
    McGroupDeleteAns {
        /// McGroupID slot.
        mc_group_id: u8,
        /// There was no group in the slot.
        mc_group_undefined: bool,
    },
    /// Result of a class C session request.
    McClassCSessionAns {
        /// McGroupID slot.
        mc_group_id: u8,
        /// The data rate is not supported.
        dr_error: bool,
        /// The frequency is not supported.
        freq_error: bool,
        /// There is no group in the slot.
        mc_group_undefined: bool,
        /// Seconds until the session starts, only present without errors.
        time_to_start: Option<u32>,
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

/// Parse a McGroupID header with one error flag in bit 2.
fn parse_id_header(input: &[u8]) -> IResult<&[u8], (u8, bool)> {
    let rfu = nom::bits::complete::take::<_, u8, _, CommandParserError>(5_usize);
    nom::bits::bits(map(
        tuple((rfu, parse_bit_flag, parse_2_bits_into_u8)),
        |(_, flag, mc_group_id)| (mc_group_id, flag),
    ))(input)
}

/// Parse the McClassCSessionAns payload.
///
/// Status bits from most to least significant: RFU (3), McGroupUndefined, FreqError, DRError,
/// McGroupID (2). TimeToStart (3 bytes) follows if no error flag is set.
fn parse_mc_class_c_session_ans(input: &[u8]) -> IResult<&[u8], MulticastSetupAnswer> {
    trace!("Parsing McClassCSessionAns");
    let rfu = nom::bits::complete::take::<_, u8, _, CommandParserError>(3_usize);
    let (input, (_, mc_group_undefined, freq_error, dr_error, mc_group_id)) =
        nom::bits::bits(tuple((
            rfu,
            parse_bit_flag,
            parse_bit_flag,
            parse_bit_flag,
            parse_2_bits_into_u8,
        )))(input)?;

    let (input, time_to_start) = if mc_group_undefined || freq_error || dr_error {
        (input, None)
    } else {
        let (input, bytes) = nom::bytes::complete::take(3_usize)(input)?;
        (
            input,
            Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])),
        )
    };

    Ok((
        input,
        MulticastSetupAnswer::McClassCSessionAns {
            mc_group_id,
            dr_error,
            freq_error,
            mc_group_undefined,
            time_to_start,
        },
    ))
}

/// Parse a CID and the answer it announces.
fn parse_answer_command(input: &[u8]) -> IResult<&[u8], MulticastSetupAnswer> {
    let (input, cid) = nom::number::complete::u8(input)?;
    match cid {
        MC_GROUP_SETUP => {
            trace!("Parsing McGroupSetupAns");
            map(parse_id_header, |(mc_group_id, id_error)| {
                MulticastSetupAnswer::McGroupSetupAns {
                    mc_group_id,
                    id_error,
                }
            })(input)
        }
        MC_GROUP_DELETE => {
            trace!("Parsing McGroupDeleteAns");
            map(parse_id_header, |(mc_group_id, mc_group_undefined)| {
                MulticastSetupAnswer::McGroupDeleteAns {
                    mc_group_id,
                    mc_group_undefined,
                }
            })(input)
        }
        MC_CLASS_C_SESSION => parse_mc_class_c_session_ans(input),
        cid => Err(Failure(CommandParserError::UnknownCid { cid })),
    }
}

/// Parses the answer contained in an uplink payload.
///
/// # Errors
///
/// Returns an error if the CID is unknown or the payload is truncated.
pub fn parse_answer(payload: &[u8]) -> Result<MulticastSetupAnswer, CommandParserError> {
    parse_answer_command(payload)
        .finish()
        .map(|(_, answer)| answer)
}
