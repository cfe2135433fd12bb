// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Synchronized start and stop of media transport.
//!
//! One of both transport instances carries the sampling clock; the node
//! recovers its clock from the stream the host sends when the configured
//! signal source is one of the stream receivers, and drives the stream it
//! transmits from an external source otherwise. The dependent instance is
//! valid only while the clock carrier runs, so the order of start and stop
//! is fixed.

use {
    super::{device::DiceState, *},
    std::sync::Arc,
};

/// Direction of media transport from the point of view of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Outbound; the node receives the stream.
    Playback,
    /// Inbound; the node transmits the stream.
    Capture,
}

impl std::fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Playback => "playback",
            Self::Capture => "capture",
        };
        write!(f, "{}", label)
    }
}

/// Role of one transport instance for synchronization of sampling clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Unset,
    /// The instance carries the sampling clock.
    Master,
    /// The instance is valid only while the master runs.
    Slave,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Unset
    }
}

/// Packet processing context for one direction, driven by the hosting
/// environment.
pub trait PacketEngine {
    /// Start packet processing in the isochronous channel at the speed.
    fn start(&mut self, channel: u32, speed: u32) -> Result<(), Error>;

    /// Stop packet processing.
    fn stop(&mut self);

    /// Block until packet flow is observed, or the timeout expires.
    fn wait_running(&mut self, timeout_ms: u32) -> bool;
}

/// Media client attached to one stream. The engine never owns the client; it
/// only pokes it when streaming breaks underneath.
pub trait PcmSubstream {
    /// Stop data transfer and report an interruption to the user client.
    fn abort(&self);

    /// Drop negotiated parameters so that the client negotiates them again.
    fn reset(&self);
}

/// Position of PCM data channels and MIDI ports in the quadlets of one data
/// block.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PacketLayout {
    pub pcm_quadlets: Vec<u32>,
    pub midi_quadlets: Vec<u32>,
}

/// Compute the position of data in the quadlets of one data block. When
/// several streams are merged into one channel, or dual-wire packing is in
/// effect, the data is not in the default order.
pub fn build_packet_layout(config: &StreamConfig, dual_wire: bool) -> PacketLayout {
    let mut layout = PacketLayout::default();
    let mut q = 0u32;

    if !dual_wire {
        for entry in config.entries.iter().take(config.channel_count) {
            for _ in 0..entry.pcm_channels {
                layout.pcm_quadlets.push(q);
                q += 1;
            }
            if entry.midi_ports > 0 {
                layout.midi_quadlets.push(q);
                q += 2;
            }
        }
    } else {
        // Each PCM channel takes two interleaved quadlets; the first pass
        // covers the even positions, the second the odd ones.
        for entry in config.entries.iter().take(config.channel_count) {
            for _ in 0..entry.pcm_channels {
                layout.pcm_quadlets.push(q);
                q += 2;
            }
            if entry.midi_ports > 0 {
                layout.midi_quadlets.push(q);
                q += 1;
            }
        }
        q = 1;
        for entry in config.entries.iter().take(config.channel_count) {
            for _ in 0..entry.pcm_channels {
                layout.pcm_quadlets.push(q);
                q += 2;
            }
            q += (entry.midi_ports > 0) as u32;
        }
    }

    layout
}

/// One transport instance with everything it owns.
pub(crate) struct StreamInstance {
    pub direction: StreamDirection,
    pub running: bool,
    pub sync_mode: SyncMode,
    pub layout: PacketLayout,
    pub config: StreamConfig,
    pub reservation: Reservation,
    pub engine: Box<dyn PacketEngine + Send>,
    pub client: Option<std::sync::Weak<dyn PcmSubstream + Send + Sync>>,
}

impl StreamInstance {
    pub fn new(
        direction: StreamDirection,
        engine: Box<dyn PacketEngine + Send>,
        manager: Box<dyn IsoResourceManager + Send>,
    ) -> Self {
        StreamInstance {
            direction,
            running: false,
            sync_mode: SyncMode::Unset,
            layout: PacketLayout::default(),
            config: StreamConfig::default(),
            reservation: Reservation::new(manager),
            engine,
            client: None,
        }
    }

    pub fn client(&self) -> Option<Arc<dyn PcmSubstream + Send + Sync>> {
        self.client.as_ref().and_then(|c| c.upgrade())
    }
}

fn roles_for_source(src: ClockSource) -> (StreamDirection, StreamDirection) {
    if src.is_stream() {
        (StreamDirection::Playback, StreamDirection::Capture)
    } else {
        (StreamDirection::Capture, StreamDirection::Playback)
    }
}

/// Roles derived from the transport instances themselves. Once any instance
/// runs this is the only valid lookup; the clock select register changes
/// underneath concurrently with deferred notification, and a stale read at
/// teardown can reverse the required stop order.
pub(crate) fn runtime_roles(state: &DiceState) -> (StreamDirection, StreamDirection) {
    if state.playback.sync_mode == SyncMode::Master {
        (StreamDirection::Playback, StreamDirection::Capture)
    } else {
        (StreamDirection::Capture, StreamDirection::Playback)
    }
}

fn stream_roles(
    state: &DiceState,
    io: &mut impl RegisterTransaction,
    timeout_ms: u32,
) -> Result<(StreamDirection, StreamDirection), Error> {
    if state.any_running() {
        Ok(runtime_roles(state))
    } else {
        global_section::read_clock_select(io, &state.sections, timeout_ms)
            .map(|config| roles_for_source(config.src))
    }
}

/// The bounded wait for packet flow after the transport is enabled.
const TRANSPORT_START_TIMEOUT_MS: u32 = 200;

pub(crate) fn enable_set(
    enabled: &mut bool,
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    timeout_ms: u32,
) -> Result<(), Error> {
    if *enabled {
        return Ok(());
    }
    ownership::write_enable(io, sections, true, timeout_ms)?;
    *enabled = true;
    Ok(())
}

pub(crate) fn enable_clear(
    enabled: &mut bool,
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    timeout_ms: u32,
) {
    if !*enabled {
        return;
    }
    // Teardown path; the node drops the enable state by itself at worst.
    let _ = ownership::write_enable(io, sections, false, timeout_ms)
        .map_err(|e| warn!("Transport disable failed: {}", e));
    *enabled = false;
}

fn start_instance(
    instance: &mut StreamInstance,
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    rate: u32,
    dual_wire: bool,
    speed: u32,
    timeout_ms: u32,
) -> Result<(), Error> {
    resources::allocate(
        io,
        sections,
        instance.direction,
        &instance.config,
        &mut instance.reservation,
        rate,
        dual_wire,
        speed,
        timeout_ms,
    )?;

    if instance.running {
        return Ok(());
    }

    debug!("Starting {} transport", instance.direction);

    instance.layout = build_packet_layout(&instance.config, dual_wire);
    instance
        .engine
        .start(instance.reservation.channel(), speed)?;
    instance.running = true;

    Ok(())
}

fn stop_instance(
    instance: &mut StreamInstance,
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    timeout_ms: u32,
) {
    if instance.running {
        debug!("Stopping {} transport", instance.direction);
    }

    instance.engine.stop();
    instance.running = false;

    if instance.reservation.allocated() {
        resources::free(
            io,
            sections,
            instance.direction,
            &instance.config,
            &mut instance.reservation,
            timeout_ms,
        );
    }
}

fn try_start(
    state: &mut DiceState,
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    direction: StreamDirection,
    master_dir: StreamDirection,
    slave_dir: StreamDirection,
    rate: u32,
    dual_wire: bool,
    speed: u32,
    timeout_ms: u32,
    master_started: &mut bool,
    slave_started: &mut bool,
) -> Result<(), Error> {
    if !state.instance(master_dir).running {
        state.instance_mut(master_dir).sync_mode = SyncMode::Master;
        state.instance_mut(slave_dir).sync_mode = SyncMode::Slave;

        start_instance(
            state.instance_mut(master_dir),
            io,
            sections,
            rate,
            dual_wire,
            speed,
            timeout_ms,
        )?;
        *master_started = true;
    }

    if direction != master_dir {
        // The node accepts slave transport setup only while disabled.
        enable_clear(&mut state.enabled, io, sections, timeout_ms);

        start_instance(
            state.instance_mut(slave_dir),
            io,
            sections,
            rate,
            dual_wire,
            speed,
            timeout_ms,
        )?;
        *slave_started = true;
    }

    if *master_started || *slave_started {
        enable_set(&mut state.enabled, io, sections, timeout_ms)?;
    }

    if *master_started
        && !state
            .instance_mut(master_dir)
            .engine
            .wait_running(TRANSPORT_START_TIMEOUT_MS)
    {
        let msg = "Master transport did not start streaming";
        error!("{}", msg);
        return Err(Error::new(EngineError::StreamStart, msg));
    }

    if *slave_started
        && !state
            .instance_mut(slave_dir)
            .engine
            .wait_running(TRANSPORT_START_TIMEOUT_MS)
    {
        let msg = "Slave transport did not start streaming";
        error!("{}", msg);
        return Err(Error::new(EngineError::StreamStart, msg));
    }

    Ok(())
}

/// Start the transport for the direction at the rate, bringing the clock
/// carrier up first when it does not run yet. A failure on the way unwinds
/// every instance this call started and leaves the node disabled.
pub(crate) fn start(
    state: &mut DiceState,
    io: &mut impl RegisterTransaction,
    direction: StreamDirection,
    rate: u32,
    timeout_ms: u32,
) -> Result<(), Error> {
    if state.instance(direction).running {
        return Ok(());
    }

    let sections = state.sections.clone();
    let speed = state.max_speed;
    let dual_wire = state.hi_dualwire && rate > 96000;

    let (master_dir, slave_dir) = stream_roles(state, io, timeout_ms)?;

    let mut master_started = false;
    let mut slave_started = false;

    try_start(
        state,
        io,
        &sections,
        direction,
        master_dir,
        slave_dir,
        rate,
        dual_wire,
        speed,
        timeout_ms,
        &mut master_started,
        &mut slave_started,
    )
    .map_err(|e| {
        enable_clear(&mut state.enabled, io, &sections, timeout_ms);
        if master_started {
            stop_instance(state.instance_mut(master_dir), io, &sections, timeout_ms);
        }
        if slave_started {
            stop_instance(state.instance_mut(slave_dir), io, &sections, timeout_ms);
        }
        e
    })
}

/// Stop the transport for the direction. Stopping the clock carrier takes
/// the dependent instance down first; stopping the dependent one alone keeps
/// the carrier running and enables the node again.
pub(crate) fn stop(
    state: &mut DiceState,
    io: &mut impl RegisterTransaction,
    direction: StreamDirection,
    timeout_ms: u32,
) -> Result<(), Error> {
    if !state.instance(direction).running {
        return Ok(());
    }

    let sections = state.sections.clone();
    let (master_dir, slave_dir) = runtime_roles(state);

    // Reconfiguration always happens with the node disabled.
    enable_clear(&mut state.enabled, io, &sections, timeout_ms);

    if direction == master_dir {
        stop_instance(state.instance_mut(slave_dir), io, &sections, timeout_ms);
    }
    stop_instance(state.instance_mut(direction), io, &sections, timeout_ms);

    if direction == slave_dir && state.instance(master_dir).running {
        enable_set(&mut state.enabled, io, &sections, timeout_ms)?;
    }

    Ok(())
}

/// Stop both instances; a no-op unless the clock carrier runs.
pub(crate) fn stop_all(
    state: &mut DiceState,
    io: &mut impl RegisterTransaction,
    timeout_ms: u32,
) {
    let (master_dir, slave_dir) = runtime_roles(state);

    if state.instance(master_dir).running {
        let sections = state.sections.clone();
        enable_clear(&mut state.enabled, io, &sections, timeout_ms);
        stop_instance(state.instance_mut(slave_dir), io, &sections, timeout_ms);
        stop_instance(state.instance_mut(master_dir), io, &sections, timeout_ms);
    }
}

/// Force both instances down without negotiated teardown. After a bus reset
/// the node disabled itself already and stays unresponsive for a while, so
/// no register is touched and reservations stay put for renewal.
pub(crate) fn force_stop(state: &mut DiceState) {
    let (master_dir, slave_dir) = runtime_roles(state);

    state.instance_mut(slave_dir).engine.stop();
    state.instance_mut(slave_dir).running = false;
    state.instance_mut(master_dir).engine.stop();
    state.instance_mut(master_dir).running = false;

    state.enabled = false;
}
