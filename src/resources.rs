// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Reservation of isochronous resources and device-side channel programming.
//!
//! The host reserves bandwidth and a channel at the isochronous resource
//! manager of the bus, then programs the channel number into the per-stream
//! records of the node. Playback streams are merged into a single channel by
//! the sequence start offsets in the records.

use super::*;

/// The pattern in a channel register which detaches the stream from any
/// isochronous channel.
pub const UNREGISTERED_CHANNEL: u32 = 0xffffffff;

/// Reservation of bandwidth and channel at the isochronous resource manager
/// of the bus. The hosting environment implements the actual arbitration.
pub trait IsoResourceManager {
    /// Reserve bandwidth for the payload at the speed, yielding the number of
    /// reserved channel.
    fn reserve(&mut self, max_payload: usize, speed: u32) -> Result<u32, Error>;

    /// Release the reservation.
    fn release(&mut self);

    /// Carry the reservation over to a new bus topology, yielding the number
    /// of the channel in the new topology.
    fn renew(&mut self) -> Result<u32, Error>;
}

/// State of reservation for one stream. A valid channel number accompanies
/// the reservation as long as it is allocated.
pub struct Reservation {
    manager: Box<dyn IsoResourceManager + Send>,
    allocated: bool,
    channel: u32,
}

impl Reservation {
    pub fn new(manager: Box<dyn IsoResourceManager + Send>) -> Self {
        Reservation {
            manager,
            allocated: false,
            channel: UNREGISTERED_CHANNEL,
        }
    }

    pub fn allocated(&self) -> bool {
        self.allocated
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }
}

fn samples_per_packet(rate: u32) -> usize {
    if rate < 88200 {
        8
    } else if rate < 176400 {
        16
    } else {
        32
    }
}

/// The maximum size of payload per isochronous packet for the layout at the
/// rate; two quadlets of packet header ahead of the data blocks. Each PCM
/// channel takes one quadlet per data block, two under dual-wire packing; a
/// stream with MIDI spans two quadlets.
pub fn max_payload(rate: u32, config: &StreamConfig, dual_wire: bool) -> usize {
    let data_quadlets = config.pcm_channel_count as usize * if dual_wire { 2 } else { 1 }
        + 2 * config.midi_port_count as usize;
    8 + QUADLET_SIZE * samples_per_packet(rate) * data_quadlets
}

fn deregister_channels(
    io: &mut impl RegisterTransaction,
    records: &stream_format::StreamRecords,
    direction: StreamDirection,
    count: usize,
    timeout_ms: u32,
) {
    for i in 0..count {
        let offset = records.record_offset(i) + stream_format::iso_channel_offset(direction);
        let _ = io
            .write_quadlet(offset, UNREGISTERED_CHANNEL, timeout_ms)
            .map_err(|e| debug!("Channel deregistration failed: {}", e));
    }
}

fn program_channels(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    config: &StreamConfig,
    channel: u32,
    dual_wire: bool,
    timeout_ms: u32,
) -> Result<(), Error> {
    let records = stream_format::read_stream_records(io, sections, direction, timeout_ms)?;

    let mut seq_start = 0u32;
    for i in 0..config.channel_count {
        let offset = records.record_offset(i) + stream_format::iso_channel_offset(direction);
        let result = match direction {
            StreamDirection::Playback => {
                let mut raw = [0u8; 8];
                serialize_u32(&channel, &mut raw[..4]);
                serialize_u32(&seq_start, &mut raw[4..8]);
                io.write(offset, &mut raw, timeout_ms)
            }
            StreamDirection::Capture => io.write_quadlet(offset, channel, timeout_ms),
        };
        if let Err(e) = result {
            deregister_channels(io, &records, direction, config.channel_count, timeout_ms);
            return Err(e);
        }

        let entry = &config.entries[i];
        seq_start += entry.pcm_channels * if dual_wire { 2 } else { 1 };
        seq_start += (entry.midi_ports > 0) as u32;
    }

    Ok(())
}

/// Reserve isochronous resources for the stream and program the channel into
/// the records of node. A failure on the way rolls the programming and the
/// reservation back.
pub(crate) fn allocate(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    config: &StreamConfig,
    reservation: &mut Reservation,
    rate: u32,
    dual_wire: bool,
    speed: u32,
    timeout_ms: u32,
) -> Result<(), Error> {
    if reservation.allocated {
        return Ok(());
    }

    if !config.valid {
        let msg = "Stream layout is unknown, resources can not be allocated";
        error!("{}", msg);
        return Err(Error::new(EngineError::Protocol, msg));
    }

    let payload = max_payload(rate, config, dual_wire);
    let channel = reservation.manager.reserve(payload, speed).map_err(|e| {
        error!("Isochronous resource reservation failed: {}", e);
        e
    })?;

    if let Err(e) = program_channels(io, sections, direction, config, channel, dual_wire, timeout_ms)
    {
        reservation.manager.release();
        return Err(e);
    }

    reservation.allocated = true;
    reservation.channel = channel;

    Ok(())
}

/// Detach the stream from its channel in the records of node, then release
/// the reservation.
pub(crate) fn free(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    config: &StreamConfig,
    reservation: &mut Reservation,
    timeout_ms: u32,
) {
    if !reservation.allocated {
        return;
    }

    if let Ok(records) = stream_format::read_stream_records(io, sections, direction, timeout_ms) {
        deregister_channels(io, &records, direction, config.channel_count, timeout_ms);
    }

    reservation.manager.release();
    reservation.allocated = false;
    reservation.channel = UNREGISTERED_CHANNEL;
}

/// Carry the reservation over to a new bus topology. The node dropped its
/// side already, so no deregistration is issued.
pub(crate) fn renew(reservation: &mut Reservation) -> Result<(), Error> {
    if !reservation.allocated {
        return Ok(());
    }

    reservation.channel = reservation.manager.renew().map_err(|e| {
        warn!("Isochronous resource renewal failed: {}", e);
        e
    })?;

    Ok(())
}
