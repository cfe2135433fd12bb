// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Layout of isochronous streams in the private register space of node.
//!
//! The rx and tx sections carry one record per isochronous stream with the
//! count of data channels for PCM frames and ports for MIDI messages. The
//! node rearranges the records whenever its internal router is reconfigured,
//! reported by asynchronous notification.

use super::*;

/// The maximum number of isochronous streams per direction.
pub const MAX_ISOC_STREAMS: usize = 4;

const STREAM_COUNT_OFFSET: usize = 0x00;
const STREAM_RECORD_SIZE_OFFSET: usize = 0x04;
const STREAM_RECORDS_OFFSET: usize = 0x08;

// Offsets in one rx record.
pub(crate) const RX_ISO_CHANNEL_OFFSET: usize = 0x00;
const RX_NUMBER_AUDIO_OFFSET: usize = 0x08;

// Offsets in one tx record.
pub(crate) const TX_ISO_CHANNEL_OFFSET: usize = 0x00;
const TX_NUMBER_AUDIO_OFFSET: usize = 0x04;

/// Data channel counts of one isochronous stream.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsocChannelEntry {
    /// The number of data channels for PCM frames.
    pub pcm_channels: u32,
    /// The number of ports for MIDI messages.
    pub midi_ports: u32,
}

/// Layout of isochronous streams for one direction. Invalid until a full
/// read of the corresponding section succeeded.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Whether the whole layout was read successfully.
    pub valid: bool,
    /// The number of isochronous streams.
    pub channel_count: usize,
    /// Total number of PCM data channels over all streams.
    pub pcm_channel_count: u32,
    /// The number of streams which multiplex at least one MIDI port.
    pub midi_port_count: u32,
    /// Per-stream data channel counts.
    pub entries: [IsocChannelEntry; MAX_ISOC_STREAMS],
}

/// Geometry of the per-stream records in one section.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamRecords {
    pub count: usize,
    pub record_size: usize,
    base: usize,
}

impl StreamRecords {
    pub fn record_offset(&self, index: usize) -> usize {
        self.base + STREAM_RECORDS_OFFSET + index * self.record_size
    }
}

pub(crate) fn section_of(sections: &GeneralSections, direction: StreamDirection) -> Section {
    match direction {
        StreamDirection::Playback => sections.rx,
        StreamDirection::Capture => sections.tx,
    }
}

pub(crate) fn iso_channel_offset(direction: StreamDirection) -> usize {
    match direction {
        StreamDirection::Playback => RX_ISO_CHANNEL_OFFSET,
        StreamDirection::Capture => TX_ISO_CHANNEL_OFFSET,
    }
}

fn audio_count_offset(direction: StreamDirection) -> usize {
    match direction {
        StreamDirection::Playback => RX_NUMBER_AUDIO_OFFSET,
        StreamDirection::Capture => TX_NUMBER_AUDIO_OFFSET,
    }
}

pub(crate) fn read_stream_records(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    timeout_ms: u32,
) -> Result<StreamRecords, Error> {
    let section = section_of(sections, direction);

    let count = io.read_quadlet(section.offset + STREAM_COUNT_OFFSET, timeout_ms)? as usize;
    let record_size = QUADLET_SIZE
        * io.read_quadlet(section.offset + STREAM_RECORD_SIZE_OFFSET, timeout_ms)? as usize;

    Ok(StreamRecords {
        count,
        record_size,
        base: section.offset,
    })
}

/// Read the layout of isochronous streams for the direction. The transport
/// for the direction has to be stopped; a concurrent read during active
/// streaming yields inconsistent counts.
pub fn update_config(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    config: &mut StreamConfig,
    timeout_ms: u32,
) -> Result<(), Error> {
    config.valid = false;

    let records = read_stream_records(io, sections, direction, timeout_ms)?;

    if records.count > MAX_ISOC_STREAMS {
        let msg = format!(
            "The number of isochronous streams should be less than {}, actually {}",
            MAX_ISOC_STREAMS, records.count
        );
        error!("{}", msg);
        return Err(Error::new(EngineError::Protocol, &msg));
    }

    let mut count = records.count;
    if direction == StreamDirection::Capture && count > 1 {
        // The transport engine merges captured streams into one context only.
        info!(
            "The number of isochronous capture streams is limited to 1, using the first of {}",
            count
        );
        count = 1;
    }

    let mut entries = [IsocChannelEntry::default(); MAX_ISOC_STREAMS];
    let mut pcm_channel_count = 0;
    let mut midi_port_count = 0;

    for i in 0..count {
        let mut raw = [0u8; 8];
        io.read(
            records.record_offset(i) + audio_count_offset(direction),
            &mut raw,
            timeout_ms,
        )?;

        let mut entry = IsocChannelEntry::default();
        deserialize_u32(&mut entry.pcm_channels, &raw[..4]);
        deserialize_u32(&mut entry.midi_ports, &raw[4..8]);

        pcm_channel_count += entry.pcm_channels;
        midi_port_count += (entry.midi_ports > 0) as u32;
        entries[i] = entry;
    }

    config.channel_count = count;
    config.pcm_channel_count = pcm_channel_count;
    config.midi_port_count = midi_port_count;
    config.entries = entries;
    config.valid = true;

    debug!(?direction, ?config);

    Ok(())
}

#[cfg(test)]
mod test {
    use {super::*, crate::transaction::test_util::FakeTransaction};

    fn sections() -> GeneralSections {
        let mut sections = GeneralSections::default();
        sections.tx.offset = 0x1a4;
        sections.tx.size = 0x238;
        sections.rx.offset = 0x3dc;
        sections.rx.size = 0x468;
        sections
    }

    fn populate_rx(io: &mut FakeTransaction, entries: &[(u32, u32)]) {
        let sections = sections();
        io.poke(sections.rx.offset, entries.len() as u32);
        io.poke(sections.rx.offset + 0x04, 0x46);
        for (i, &(pcm, midi)) in entries.iter().enumerate() {
            let record = sections.rx.offset + 0x08 + i * 0x46 * 4;
            io.poke(record + RX_NUMBER_AUDIO_OFFSET, pcm);
            io.poke(record + RX_NUMBER_AUDIO_OFFSET + 4, midi);
        }
    }

    #[test]
    fn totals_accumulate_over_streams() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        populate_rx(&mut io, &[(2, 1), (4, 0)]);

        let mut config = StreamConfig::default();
        update_config(&mut io, &sections, StreamDirection::Playback, &mut config, 100).unwrap();

        assert!(config.valid);
        assert_eq!(config.channel_count, 2);
        assert_eq!(config.pcm_channel_count, 6);
        assert_eq!(config.midi_port_count, 1);
        assert_eq!(config.entries[0], IsocChannelEntry { pcm_channels: 2, midi_ports: 1 });
        assert_eq!(config.entries[1], IsocChannelEntry { pcm_channels: 4, midi_ports: 0 });
    }

    #[test]
    fn excessive_stream_count_is_rejected() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke(sections.rx.offset, 5);
        io.poke(sections.rx.offset + 0x04, 0x46);

        let mut config = StreamConfig::default();
        config.valid = true;
        let err = update_config(&mut io, &sections, StreamDirection::Playback, &mut config, 100)
            .unwrap_err();

        assert_eq!(err.kind::<EngineError>(), Some(EngineError::Protocol));
        assert!(!config.valid);
    }

    #[test]
    fn capture_clamps_to_single_stream() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke(sections.tx.offset, 2);
        io.poke(sections.tx.offset + 0x04, 0x46);
        let record = sections.tx.offset + 0x08;
        io.poke(record + TX_NUMBER_AUDIO_OFFSET, 8);
        io.poke(record + TX_NUMBER_AUDIO_OFFSET + 4, 1);
        let record = sections.tx.offset + 0x08 + 0x46 * 4;
        io.poke(record + TX_NUMBER_AUDIO_OFFSET, 8);
        io.poke(record + TX_NUMBER_AUDIO_OFFSET + 4, 0);

        let mut config = StreamConfig::default();
        update_config(&mut io, &sections, StreamDirection::Capture, &mut config, 100).unwrap();

        assert!(config.valid);
        assert_eq!(config.channel_count, 1);
        assert_eq!(config.pcm_channel_count, 8);
        assert_eq!(config.midi_port_count, 1);
    }

    #[test]
    fn failed_read_leaves_config_invalid() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        populate_rx(&mut io, &[(2, 1), (4, 0)]);
        io.read_errors_at
            .push(sections.rx.offset + 0x08 + 0x46 * 4 + RX_NUMBER_AUDIO_OFFSET);

        let mut config = StreamConfig::default();
        config.valid = true;
        let result = update_config(&mut io, &sections, StreamDirection::Playback, &mut config, 100);

        assert!(result.is_err());
        assert!(!config.valid);
    }
}
