// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Extended synchronization section in the private register space of node.
//!
//! The module includes structure and functions for the section which exposes
//! the state of synchronization to the signal source of sampling clock. All
//! of the fields are read-only; the node reports any change of the lock state
//! by asynchronous notification.

use super::*;

/// Snapshot of the extended synchronization state.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedSyncInfo {
    /// Current signal source of sampling clock.
    pub clock_source: ClockSource,
    /// Whether the signal source is locked.
    pub locked: bool,
    /// Detected nominal rate of the signal source.
    pub rate: ClockRate,
    /// User data bits in ADAT stream, when the source carries them.
    pub adat_user_data: Option<u8>,
}

const CLOCK_SOURCE_OFFSET: usize = 0x00;
const LOCKED_OFFSET: usize = 0x04;
const RATE_OFFSET: usize = 0x08;
const ADAT_USER_DATA_OFFSET: usize = 0x0c;

const ADAT_USER_DATA_MASK: u32 = 0x0f;
const ADAT_USER_DATA_UNAVAIL: u32 = 0x10;

pub(crate) const EXT_SYNC_SIZE: usize = 0x10;

pub(crate) fn deserialize_ext_sync_info(info: &mut ExtendedSyncInfo, raw: &[u8]) {
    assert!(raw.len() >= EXT_SYNC_SIZE);

    let mut val = 0u32;
    deserialize_u32(&mut val, &raw[CLOCK_SOURCE_OFFSET..]);
    info.clock_source = ClockSource::from(val as u8);

    deserialize_u32(&mut val, &raw[LOCKED_OFFSET..]);
    info.locked = val > 0;

    deserialize_u32(&mut val, &raw[RATE_OFFSET..]);
    info.rate = ClockRate::from(val as u8);

    deserialize_u32(&mut val, &raw[ADAT_USER_DATA_OFFSET..]);
    info.adat_user_data = if val & ADAT_USER_DATA_UNAVAIL > 0 {
        None
    } else {
        Some((val & ADAT_USER_DATA_MASK) as u8)
    };
}

/// Read the whole section for the snapshot of synchronization state.
pub fn read_ext_sync_info(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    info: &mut ExtendedSyncInfo,
    timeout_ms: u32,
) -> Result<(), Error> {
    if sections.ext_sync.size < EXT_SYNC_SIZE {
        let msg = format!(
            "Extended sync section has {} bytes, while {} expected",
            sections.ext_sync.size, EXT_SYNC_SIZE
        );
        return Err(Error::new(EngineError::Protocol, &msg));
    }

    let mut raw = [0u8; EXT_SYNC_SIZE];
    io.read(sections.ext_sync.offset, &mut raw, timeout_ms)?;
    deserialize_ext_sync_info(info, &raw);
    Ok(())
}
