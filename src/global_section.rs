// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Global section in the private register space of node.
//!
//! The module includes structure, enumeration and functions for registers in
//! global section; ownership, transport enable, selection and status of
//! sampling clock, measured rate, protocol version, and capabilities.

use super::*;

/// Nominal sampling rate expressed by index in registers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClockRate {
    /// 32.0 kHz.
    R32000,
    /// 44.1 kHz.
    R44100,
    /// 48.0 kHz.
    R48000,
    /// 88.2 kHz.
    R88200,
    /// 96.0 kHz.
    R96000,
    /// 176.4 kHz.
    R176400,
    /// 192.0 kHz.
    R192000,
    /// Smaller than 48.0 kHz.
    AnyLow,
    /// Between 48.0 and 96.0 kHz.
    AnyMid,
    /// Larger than 96.0 kHz.
    AnyHigh,
    /// Not available.
    None,
    /// Unspecified.
    Reserved(u8),
}

impl ClockRate {
    const R32000_VAL: u8 = 0x00;
    const R44100_VAL: u8 = 0x01;
    const R48000_VAL: u8 = 0x02;
    const R88200_VAL: u8 = 0x03;
    const R96000_VAL: u8 = 0x04;
    const R176400_VAL: u8 = 0x05;
    const R192000_VAL: u8 = 0x06;
    const ANY_LOW_VAL: u8 = 0x07;
    const ANY_MID_VAL: u8 = 0x08;
    const ANY_HIGH_VAL: u8 = 0x09;
    const NONE_VAL: u8 = 0x0a;

    /// The nominal frequency in Hz when the rate is a discrete one.
    pub fn frequency(&self) -> Option<u32> {
        let idx = u8::from(*self) as usize;
        CLOCK_RATES.get(idx).copied()
    }
}

impl Default for ClockRate {
    fn default() -> Self {
        ClockRate::Reserved(0xff)
    }
}

impl From<u8> for ClockRate {
    fn from(val: u8) -> Self {
        match val {
            Self::R32000_VAL => Self::R32000,
            Self::R44100_VAL => Self::R44100,
            Self::R48000_VAL => Self::R48000,
            Self::R88200_VAL => Self::R88200,
            Self::R96000_VAL => Self::R96000,
            Self::R176400_VAL => Self::R176400,
            Self::R192000_VAL => Self::R192000,
            Self::ANY_LOW_VAL => Self::AnyLow,
            Self::ANY_MID_VAL => Self::AnyMid,
            Self::ANY_HIGH_VAL => Self::AnyHigh,
            Self::NONE_VAL => Self::None,
            _ => Self::Reserved(val),
        }
    }
}

impl From<ClockRate> for u8 {
    fn from(rate: ClockRate) -> u8 {
        match rate {
            ClockRate::R32000 => ClockRate::R32000_VAL,
            ClockRate::R44100 => ClockRate::R44100_VAL,
            ClockRate::R48000 => ClockRate::R48000_VAL,
            ClockRate::R88200 => ClockRate::R88200_VAL,
            ClockRate::R96000 => ClockRate::R96000_VAL,
            ClockRate::R176400 => ClockRate::R176400_VAL,
            ClockRate::R192000 => ClockRate::R192000_VAL,
            ClockRate::AnyLow => ClockRate::ANY_LOW_VAL,
            ClockRate::AnyMid => ClockRate::ANY_MID_VAL,
            ClockRate::AnyHigh => ClockRate::ANY_HIGH_VAL,
            ClockRate::None => ClockRate::NONE_VAL,
            ClockRate::Reserved(val) => val,
        }
    }
}

impl std::fmt::Display for ClockRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyLow => write!(f, "Any-low"),
            Self::AnyMid => write!(f, "Any-mid"),
            Self::AnyHigh => write!(f, "Any-high"),
            Self::None => write!(f, "None"),
            Self::Reserved(val) => write!(f, "Reserved({})", val),
            _ => write!(f, "{}", self.frequency().unwrap_or_default()),
        }
    }
}

/// Signal source of sampling clock.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClockSource {
    /// IEC 60958 receiver 0.
    Aes1,
    /// IEC 60958 receiver 1.
    Aes2,
    /// IEC 60958 receiver 2.
    Aes3,
    /// IEC 60958 receiver 3.
    Aes4,
    /// Any IEC 60958 receiver.
    AesAny,
    /// ADAT receiver.
    Adat,
    /// TDIF receiver.
    Tdif,
    /// Word clock.
    WordClock,
    /// Audio Video System Receiver 0.
    Arx1,
    /// Audio Video System Receiver 1.
    Arx2,
    /// Audio Video System Receiver 2.
    Arx3,
    /// Audio Video System Receiver 3.
    Arx4,
    /// Internal oscillator.
    Internal,
    /// Unspecified.
    Reserved(u8),
}

impl ClockSource {
    const AES1_VAL: u8 = 0x00;
    const AES2_VAL: u8 = 0x01;
    const AES3_VAL: u8 = 0x02;
    const AES4_VAL: u8 = 0x03;
    const AES_ANY_VAL: u8 = 0x04;
    const ADAT_VAL: u8 = 0x05;
    const TDIF_VAL: u8 = 0x06;
    const WORD_CLOCK_VAL: u8 = 0x07;
    const ARX1_VAL: u8 = 0x08;
    const ARX2_VAL: u8 = 0x09;
    const ARX3_VAL: u8 = 0x0a;
    const ARX4_VAL: u8 = 0x0b;
    const INTERNAL_VAL: u8 = 0x0c;

    /// Whether the source is one of streams received by the node; when it is,
    /// the node recovers its sampling clock from the stream the host sends.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Arx1 | Self::Arx2 | Self::Arx3 | Self::Arx4)
    }
}

impl Default for ClockSource {
    fn default() -> Self {
        ClockSource::Reserved(0xff)
    }
}

impl From<u8> for ClockSource {
    fn from(val: u8) -> Self {
        match val {
            Self::AES1_VAL => Self::Aes1,
            Self::AES2_VAL => Self::Aes2,
            Self::AES3_VAL => Self::Aes3,
            Self::AES4_VAL => Self::Aes4,
            Self::AES_ANY_VAL => Self::AesAny,
            Self::ADAT_VAL => Self::Adat,
            Self::TDIF_VAL => Self::Tdif,
            Self::WORD_CLOCK_VAL => Self::WordClock,
            Self::ARX1_VAL => Self::Arx1,
            Self::ARX2_VAL => Self::Arx2,
            Self::ARX3_VAL => Self::Arx3,
            Self::ARX4_VAL => Self::Arx4,
            Self::INTERNAL_VAL => Self::Internal,
            _ => Self::Reserved(val),
        }
    }
}

impl From<ClockSource> for u8 {
    fn from(src: ClockSource) -> u8 {
        match src {
            ClockSource::Aes1 => ClockSource::AES1_VAL,
            ClockSource::Aes2 => ClockSource::AES2_VAL,
            ClockSource::Aes3 => ClockSource::AES3_VAL,
            ClockSource::Aes4 => ClockSource::AES4_VAL,
            ClockSource::AesAny => ClockSource::AES_ANY_VAL,
            ClockSource::Adat => ClockSource::ADAT_VAL,
            ClockSource::Tdif => ClockSource::TDIF_VAL,
            ClockSource::WordClock => ClockSource::WORD_CLOCK_VAL,
            ClockSource::Arx1 => ClockSource::ARX1_VAL,
            ClockSource::Arx2 => ClockSource::ARX2_VAL,
            ClockSource::Arx3 => ClockSource::ARX3_VAL,
            ClockSource::Arx4 => ClockSource::ARX4_VAL,
            ClockSource::Internal => ClockSource::INTERNAL_VAL,
            ClockSource::Reserved(val) => val,
        }
    }
}

impl std::fmt::Display for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Aes1 => "AES1",
            Self::Aes2 => "AES2",
            Self::Aes3 => "AES3",
            Self::Aes4 => "AES4",
            Self::AesAny => "AES-ANY",
            Self::Adat => "ADAT",
            Self::Tdif => "TDIF",
            Self::WordClock => "Word-Clock",
            Self::Arx1 => "ARX1",
            Self::Arx2 => "ARX2",
            Self::Arx3 => "ARX3",
            Self::Arx4 => "ARX4",
            Self::Internal => "Internal",
            Self::Reserved(_) => "Reserved",
        };
        write!(f, "{}", label)
    }
}

/// Configuration of sampling clock, packed in the clock select register.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockConfig {
    /// For frequency of media clock.
    pub rate: ClockRate,
    /// For signal source of sampling clock.
    pub src: ClockSource,
}

impl ClockConfig {
    const SRC_MASK: u32 = 0x000000ff;
    const SRC_SHIFT: usize = 0;
    const RATE_MASK: u32 = 0x0000ff00;
    const RATE_SHIFT: usize = 8;
}

impl From<u32> for ClockConfig {
    fn from(val: u32) -> Self {
        let src_val = ((val & Self::SRC_MASK) >> Self::SRC_SHIFT) as u8;
        let rate_val = ((val & Self::RATE_MASK) >> Self::RATE_SHIFT) as u8;
        ClockConfig {
            rate: ClockRate::from(rate_val),
            src: ClockSource::from(src_val),
        }
    }
}

impl From<ClockConfig> for u32 {
    fn from(cfg: ClockConfig) -> u32 {
        let src_val = u8::from(cfg.src) as u32;
        let rate_val = u8::from(cfg.rate) as u32;
        ((rate_val << ClockConfig::RATE_SHIFT) & ClockConfig::RATE_MASK)
            | ((src_val << ClockConfig::SRC_SHIFT) & ClockConfig::SRC_MASK)
    }
}

/// Status of sampling clock in the status register.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockStatus {
    /// Whether the current signal source is locked.
    pub src_is_locked: bool,
    /// The detected nominal rate of media clock.
    pub rate: ClockRate,
}

impl ClockStatus {
    const SRC_LOCKED: u32 = 0x00000001;
    const RATE_MASK: u32 = 0x0000ff00;
    const RATE_SHIFT: usize = 8;
}

impl From<u32> for ClockStatus {
    fn from(val: u32) -> Self {
        ClockStatus {
            src_is_locked: (val & Self::SRC_LOCKED) > 0,
            rate: ClockRate::from(((val & Self::RATE_MASK) >> Self::RATE_SHIFT) as u8),
        }
    }
}

/// Capabilities for configuration of sampling clock.
#[derive(Default, Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClockCaps {
    pub rate_bits: u16,
    pub src_bits: u16,
}

impl ClockCaps {
    const RATE_MASK: u32 = 0x0000ffff;
    const SRC_MASK: u32 = 0xffff0000;
    const SRC_SHIFT: usize = 16;

    pub fn supports_rate_index(&self, rate_index: usize) -> bool {
        self.rate_bits & (1 << rate_index) > 0
    }

    pub fn supports_src(&self, src: ClockSource) -> bool {
        self.src_bits & (1 << u8::from(src) as u16) > 0
    }
}

impl From<u32> for ClockCaps {
    fn from(val: u32) -> Self {
        ClockCaps {
            rate_bits: (val & Self::RATE_MASK) as u16,
            src_bits: ((val & Self::SRC_MASK) >> Self::SRC_SHIFT) as u16,
        }
    }
}

/// Snapshot of global settings cached in device handle. Asynchronous
/// notification reports any change so that the cache can be refreshed.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Nickname of the node, available to distinguish units of the same model
    /// in the same bus.
    pub nickname: String,
    /// The configuration of sampling clock.
    pub clock_config: ClockConfig,
    /// Whether packet streaming is enabled in the node.
    pub enable: bool,
    /// The status of sampling clock.
    pub clock_status: ClockStatus,
    /// Extended status bits of external signal sources.
    pub extended_status: u32,
    /// Measured rate of sampling clock in Hz.
    pub measured_rate: u32,
    /// The version of protocol.
    pub version: u32,
    /// The capabilities for configuration of sampling clock.
    pub clock_caps: ClockCaps,
}

pub(crate) const OWNER_OFFSET: usize = 0x00;
const NICKNAME_OFFSET: usize = 0x0c;
pub(crate) const CLOCK_SELECT_OFFSET: usize = 0x4c;
pub(crate) const ENABLE_OFFSET: usize = 0x50;
const STATUS_OFFSET: usize = 0x54;
const EXTENDED_STATUS_OFFSET: usize = 0x58;
const MEASURED_RATE_OFFSET: usize = 0x5c;
const VERSION_OFFSET: usize = 0x60;
const CLOCK_CAPS_OFFSET: usize = 0x64;

const NICKNAME_SIZE: usize = 64;

/// The major version of protocol the engine implements.
const SUPPORTED_VERSION: u32 = 0x01000000;
const VERSION_MAJOR_MASK: u32 = 0xff000000;

// Devices predating the capability register support at least these.
const FALLBACK_CAPS: u32 = ((1 << ClockSource::ARX1_VAL as u32 | 1 << ClockSource::INTERNAL_VAL as u32)
    << 16)
    | (1 << ClockRate::R44100_VAL as u32 | 1 << ClockRate::R48000_VAL as u32);

// The node expresses text in quadlet-sized groups with bytes in reverse order
// within each group, independently of the wire order of quadlets.
fn parse_swapped_label(raw: &[u8]) -> Result<String, std::str::Utf8Error> {
    let mut data = raw.to_vec();
    let mut quadlet = [0; 4];
    (0..(data.len() / 4)).for_each(|i| {
        let pos = i * 4;
        quadlet.copy_from_slice(&data[pos..(pos + 4)]);
        quadlet.reverse();
        data[pos..(pos + 4)].copy_from_slice(&quadlet);
    });

    data.push(0x00);
    std::str::from_utf8(&data).map(|text| {
        if let Some(pos) = text.find('\0') {
            text[..pos].to_string()
        } else {
            String::new()
        }
    })
}

pub(crate) fn deserialize_global_settings(
    settings: &mut GlobalSettings,
    raw: &[u8],
) -> Result<(), String> {
    assert!(raw.len() >= MEASURED_RATE_OFFSET + 4);

    settings.nickname = parse_swapped_label(&raw[NICKNAME_OFFSET..(NICKNAME_OFFSET + NICKNAME_SIZE)])
        .map_err(|err| format!("Fail to parse nickname: {}", err))?;

    let mut val = 0u32;
    deserialize_u32(&mut val, &raw[CLOCK_SELECT_OFFSET..]);
    settings.clock_config = ClockConfig::from(val);

    deserialize_u32(&mut val, &raw[ENABLE_OFFSET..]);
    settings.enable = val > 0;

    deserialize_u32(&mut val, &raw[STATUS_OFFSET..]);
    settings.clock_status = ClockStatus::from(val);

    deserialize_u32(
        &mut settings.extended_status,
        &raw[EXTENDED_STATUS_OFFSET..],
    );

    deserialize_u32(&mut settings.measured_rate, &raw[MEASURED_RATE_OFFSET..]);

    if raw.len() >= CLOCK_CAPS_OFFSET + 4 {
        deserialize_u32(&mut settings.version, &raw[VERSION_OFFSET..]);
        deserialize_u32(&mut val, &raw[CLOCK_CAPS_OFFSET..]);
        settings.clock_caps = ClockCaps::from(val);
    } else {
        settings.version = 0;
        settings.clock_caps = ClockCaps::from(FALLBACK_CAPS);
    }

    Ok(())
}

/// Read the whole global section for the snapshot of settings.
pub fn read_global_settings(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    settings: &mut GlobalSettings,
    timeout_ms: u32,
) -> Result<(), Error> {
    let min_size = MEASURED_RATE_OFFSET + 4;
    if sections.global.size < min_size {
        let msg = format!(
            "Global section has {} bytes, while at least {} expected",
            sections.global.size, min_size
        );
        return Err(Error::new(EngineError::Protocol, &msg));
    }

    let size = std::cmp::min(sections.global.size, CLOCK_CAPS_OFFSET + 4);
    let mut raw = vec![0u8; size];
    io.read(sections.global.offset, &mut raw, timeout_ms)?;
    deserialize_global_settings(settings, &raw).map_err(|msg| Error::new(EngineError::Protocol, &msg))
}

/// Read the clock select register alone. The register is the authority for
/// stream roles while no stream runs.
pub fn read_clock_select(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    timeout_ms: u32,
) -> Result<ClockConfig, Error> {
    io.read_quadlet(sections.global.offset + CLOCK_SELECT_OFFSET, timeout_ms)
        .map(ClockConfig::from)
}

pub fn write_clock_select(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    config: ClockConfig,
    timeout_ms: u32,
) -> Result<(), Error> {
    io.write_quadlet(
        sections.global.offset + CLOCK_SELECT_OFFSET,
        u32::from(config),
        timeout_ms,
    )
}

/// Verify that the node implements the supported major version of protocol.
pub fn verify_protocol_version(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    timeout_ms: u32,
) -> Result<(), Error> {
    if sections.global.size < VERSION_OFFSET + 4 {
        return Ok(());
    }
    let version = io.read_quadlet(sections.global.offset + VERSION_OFFSET, timeout_ms)?;
    if version & VERSION_MAJOR_MASK != SUPPORTED_VERSION {
        let msg = format!("Unknown protocol version: 0x{:08x}", version);
        Err(Error::new(EngineError::Protocol, &msg))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_config_packing() {
        let cfg = ClockConfig {
            rate: ClockRate::R96000,
            src: ClockSource::Arx1,
        };
        let val = u32::from(cfg);
        assert_eq!(val, 0x00000408);
        assert_eq!(ClockConfig::from(val), cfg);
    }

    #[test]
    fn stream_sources() {
        assert!(ClockSource::Arx1.is_stream());
        assert!(ClockSource::Arx4.is_stream());
        assert!(!ClockSource::Internal.is_stream());
        assert!(!ClockSource::WordClock.is_stream());
    }

    #[test]
    fn swapped_label_parse() {
        let mut data = Vec::new();
        for chunk in b"DICE-01\0".chunks(4) {
            let mut quadlet = [0u8; 4];
            quadlet[..chunk.len()].copy_from_slice(chunk);
            quadlet.reverse();
            data.extend_from_slice(&quadlet);
        }
        assert_eq!(parse_swapped_label(&data).unwrap(), "DICE-01");
    }

    #[test]
    fn global_settings_deserialize() {
        let mut raw = vec![0u8; 0x68];
        let mut data = Vec::new();
        for chunk in b"Unit\0".chunks(4) {
            let mut quadlet = [0u8; 4];
            quadlet[..chunk.len()].copy_from_slice(chunk);
            quadlet.reverse();
            data.extend_from_slice(&quadlet);
        }
        raw[NICKNAME_OFFSET..(NICKNAME_OFFSET + data.len())].copy_from_slice(&data);
        serialize_u32(&0x00000205, &mut raw[CLOCK_SELECT_OFFSET..]);
        serialize_u32(&1, &mut raw[ENABLE_OFFSET..]);
        serialize_u32(&0x00000201, &mut raw[STATUS_OFFSET..]);
        serialize_u32(&48000, &mut raw[MEASURED_RATE_OFFSET..]);
        serialize_u32(&0x01000400, &mut raw[VERSION_OFFSET..]);
        serialize_u32(&0x10ff007f, &mut raw[CLOCK_CAPS_OFFSET..]);

        let mut settings = GlobalSettings::default();
        deserialize_global_settings(&mut settings, &raw).unwrap();

        assert_eq!(settings.nickname, "Unit");
        assert_eq!(settings.clock_config.rate, ClockRate::R48000);
        assert_eq!(settings.clock_config.src, ClockSource::Adat);
        assert!(settings.enable);
        assert!(settings.clock_status.src_is_locked);
        assert_eq!(settings.clock_status.rate, ClockRate::R48000);
        assert_eq!(settings.measured_rate, 48000);
        assert_eq!(settings.version, 0x01000400);
        assert!(settings.clock_caps.supports_rate_index(6));
        assert!(settings.clock_caps.supports_src(ClockSource::Internal));
    }

    #[test]
    fn caps_fallback_for_old_firmware() {
        let mut raw = vec![0u8; MEASURED_RATE_OFFSET + 4];
        serialize_u32(&0x00000008, &mut raw[CLOCK_SELECT_OFFSET..]);

        let mut settings = GlobalSettings::default();
        deserialize_global_settings(&mut settings, &raw).unwrap();

        assert!(settings.clock_caps.supports_rate_index(1));
        assert!(settings.clock_caps.supports_rate_index(2));
        assert!(!settings.clock_caps.supports_rate_index(6));
        assert!(settings.clock_caps.supports_src(ClockSource::Arx1));
        assert!(settings.clock_caps.supports_src(ClockSource::Internal));
    }
}
