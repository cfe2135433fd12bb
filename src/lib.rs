// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod device;
pub mod ext_sync_section;
pub mod global_section;
pub mod notification;
pub mod ownership;
pub mod resources;
pub mod stream;
pub mod stream_format;
pub mod transaction;

use {
    glib::{error::ErrorDomain, Error, Quark},
    tracing::{debug, error, info, warn},
};

pub use {
    device::{Dice, StreamParts},
    ext_sync_section::ExtendedSyncInfo,
    global_section::{ClockConfig, ClockRate, ClockSource, GlobalSettings},
    ownership::{OwnerInfo, RetryPolicy},
    resources::{IsoResourceManager, Reservation},
    stream::{PacketEngine, PacketLayout, PcmSubstream, StreamDirection, SyncMode},
    stream_format::{IsocChannelEntry, StreamConfig},
    transaction::{FwTransaction, RegisterTransaction},
};

/// Any error the engine raises on its own behalf. Transport failures keep the
/// domain of the transaction backend and are propagated untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The device exposes a value outside its declared limits.
    Protocol,
    /// Exclusive access is held by another owner and the attempt is rejected.
    Ownership,
    /// The operation conflicts with transport running at the moment.
    Busy,
    /// Reservation of isochronous bandwidth or channel failed.
    Resources,
    /// Packet streaming was not observed within the bounded wait.
    StreamStart,
    Invalid(i32),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            EngineError::Protocol => "protocol",
            EngineError::Ownership => "ownership",
            EngineError::Busy => "busy",
            EngineError::Resources => "resources",
            EngineError::StreamStart => "stream-start",
            EngineError::Invalid(_) => "invalid",
        };

        write!(f, "EngineError::{}", msg)
    }
}

impl ErrorDomain for EngineError {
    fn domain() -> Quark {
        Quark::from_str("dice-engine-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            EngineError::Protocol => 0,
            EngineError::Ownership => 1,
            EngineError::Busy => 2,
            EngineError::Resources => 3,
            EngineError::StreamStart => 4,
            EngineError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => EngineError::Protocol,
            1 => EngineError::Ownership,
            2 => EngineError::Busy,
            3 => EngineError::Resources,
            4 => EngineError::StreamStart,
            _ => EngineError::Invalid(code),
        };
        Some(enumeration)
    }
}

const QUADLET_SIZE: usize = 4;

fn serialize_u32(val: &u32, raw: &mut [u8]) {
    assert!(raw.len() >= 4);

    raw[..4].copy_from_slice(&val.to_be_bytes())
}

fn deserialize_u32(val: &mut u32, raw: &[u8]) {
    assert!(raw.len() >= 4);

    let mut quadlet = [0; 4];
    quadlet.copy_from_slice(&raw[..4]);
    *val = u32::from_be_bytes(quadlet);
}

fn serialize_u64(val: &u64, raw: &mut [u8]) {
    assert!(raw.len() >= 8);

    serialize_u32(&((*val >> 32) as u32), &mut raw[..4]);
    serialize_u32(&((*val & 0xffffffff) as u32), &mut raw[4..8]);
}

fn deserialize_u64(val: &mut u64, raw: &[u8]) {
    assert!(raw.len() >= 8);

    let mut quadlet = 0u32;
    deserialize_u32(&mut quadlet, &raw[..4]);
    *val = (quadlet as u64) << 32;
    deserialize_u32(&mut quadlet, &raw[4..8]);
    *val |= quadlet as u64;
}

/// Range of registers in the private address space of node.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Section {
    /// The offset of section, in bytes.
    pub offset: usize,
    /// The size of section, in bytes.
    pub size: usize,
}

impl Section {
    pub(crate) const SIZE: usize = 8;
}

pub(crate) fn deserialize_section(section: &mut Section, raw: &[u8]) -> Result<(), String> {
    assert!(raw.len() >= Section::SIZE);

    let mut val = 0u32;
    deserialize_u32(&mut val, &raw[..4]);
    section.offset = 4 * val as usize;

    deserialize_u32(&mut val, &raw[4..8]);
    section.size = 4 * val as usize;

    Ok(())
}

/// The set of sections in the private address space; the pointer table at the
/// head of the space locates them.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct GeneralSections {
    /// For global settings.
    pub global: Section,
    /// For the layout of streams transmitted by the node.
    pub tx: Section,
    /// For the layout of streams received by the node.
    pub rx: Section,
    /// For extended status of synchronization to the signal source of
    /// sampling clock.
    pub ext_sync: Section,
    pub reserved: Section,
}

impl GeneralSections {
    const SECTION_COUNT: usize = 5;
    pub(crate) const SIZE: usize = Section::SIZE * Self::SECTION_COUNT;
}

pub(crate) fn deserialize_general_sections(
    sections: &mut GeneralSections,
    raw: &[u8],
) -> Result<(), String> {
    assert!(raw.len() >= GeneralSections::SIZE);

    deserialize_section(&mut sections.global, &raw[..8])?;
    deserialize_section(&mut sections.tx, &raw[8..16])?;
    deserialize_section(&mut sections.rx, &raw[16..24])?;
    deserialize_section(&mut sections.ext_sync, &raw[24..32])?;
    deserialize_section(&mut sections.reserved, &raw[32..40])?;

    Ok(())
}

/// The list of nominal sampling rates expressed by index in registers.
pub const CLOCK_RATES: [u32; 7] = [32000, 44100, 48000, 88200, 96000, 176400, 192000];

/// Lookup the register index of nominal sampling rate.
pub fn clock_rate_to_index(rate: u32) -> Option<usize> {
    CLOCK_RATES.iter().position(|&r| r == rate)
}

/// The mode of rate; data channel counts are constant within one mode.
pub fn rate_index_to_mode(rate_index: usize) -> usize {
    (rate_index.max(1) - 1) / 2
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sections_deserialize() {
        let raw = [
            0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x5f, 0x00, 0x00, 0x00, 0x69, 0x00, 0x00,
            0x00, 0x8e, 0x00, 0x00, 0x00, 0xf7, 0x00, 0x00, 0x01, 0x1a, 0x00, 0x00, 0x02, 0x11,
            0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut sections = GeneralSections::default();
        deserialize_general_sections(&mut sections, &raw).unwrap();

        assert_eq!(sections.global.offset, 0x28);
        assert_eq!(sections.global.size, 0x17c);
        assert_eq!(sections.tx.offset, 0x1a4);
        assert_eq!(sections.tx.size, 0x238);
        assert_eq!(sections.rx.offset, 0x3dc);
        assert_eq!(sections.rx.size, 0x468);
        assert_eq!(sections.ext_sync.offset, 0x844);
        assert_eq!(sections.ext_sync.size, 0x10);
        assert_eq!(sections.reserved.offset, 0);
        assert_eq!(sections.reserved.size, 0);
    }

    #[test]
    fn rate_index_lookup() {
        assert_eq!(clock_rate_to_index(44100), Some(1));
        assert_eq!(clock_rate_to_index(192000), Some(6));
        assert_eq!(clock_rate_to_index(22050), None);
    }

    #[test]
    fn rate_mode_mapping() {
        assert_eq!(rate_index_to_mode(0), 0);
        assert_eq!(rate_index_to_mode(2), 0);
        assert_eq!(rate_index_to_mode(3), 1);
        assert_eq!(rate_index_to_mode(4), 1);
        assert_eq!(rate_index_to_mode(5), 2);
        assert_eq!(rate_index_to_mode(6), 2);
    }
}
