// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Handle for one unit with DICE ASIC.
//!
//! The handle carries the cached snapshots, both transport instances and the
//! few synchronization primitives the engine needs; one mutex serializing
//! control operations against deferred notification processing, one short
//! lock for the notification accumulator and the device lock counter, and
//! the queue into which the notification callback hands events over.

use {
    super::{
        ext_sync_section::read_ext_sync_info, notification::ClockAccept, stream::StreamInstance, *,
    },
    std::{
        sync::{
            mpsc::{sync_channel, Receiver, SyncSender},
            Arc, Condvar, Mutex,
        },
        thread,
        time::Duration,
    },
};

/// The pieces of hosting environment one transport instance is wired to.
pub struct StreamParts {
    /// Packet processing context for the direction.
    pub engine: Box<dyn PacketEngine + Send>,
    /// Reservation of isochronous resources for the direction.
    pub resources: Box<dyn IsoResourceManager + Send>,
}

/// Mutable state serialized by the control mutex.
pub(crate) struct DiceState {
    pub sections: GeneralSections,
    pub global: GlobalSettings,
    pub ext_sync: ExtendedSyncInfo,
    pub enabled: bool,
    pub owner: Option<OwnerInfo>,
    pub owner_generation: Option<u32>,
    pub hi_dualwire: bool,
    pub max_speed: u32,
    pub playback: StreamInstance,
    pub capture: StreamInstance,
}

impl DiceState {
    pub fn instance(&self, direction: StreamDirection) -> &StreamInstance {
        match direction {
            StreamDirection::Playback => &self.playback,
            StreamDirection::Capture => &self.capture,
        }
    }

    pub fn instance_mut(&mut self, direction: StreamDirection) -> &mut StreamInstance {
        match direction {
            StreamDirection::Playback => &mut self.playback,
            StreamDirection::Capture => &mut self.capture,
        }
    }

    pub fn any_running(&self) -> bool {
        self.playback.running || self.capture.running
    }
}

/// State under the short critical-section lock; touched from the
/// notification callback context as well.
pub(crate) struct Notified {
    pub bits: u32,
    /// Positive for engine users, -1 while an external tool holds the unit.
    pub dev_lock_count: i32,
    pub dev_lock_changed: bool,
}

const NOTIFICATION_QUEUE_CAPACITY: usize = 32;

/// Handle for one unit.
pub struct Dice {
    pub(crate) timeout_ms: u32,
    pub(crate) state: Mutex<DiceState>,
    pub(crate) notified: Mutex<Notified>,
    pub(crate) wait: Condvar,
    pub(crate) accept: ClockAccept,
    pub(crate) queue: SyncSender<u32>,
}

impl Dice {
    /// Build a handle with its deferred queue. The hosting environment drains
    /// the receiver in ordinary blocking context and feeds each event into
    /// [`Dice::process_notification`].
    pub fn new(
        playback: StreamParts,
        capture: StreamParts,
        hi_dualwire: bool,
        max_speed: u32,
        timeout_ms: u32,
    ) -> (Self, Receiver<u32>) {
        let (tx, rx) = sync_channel(NOTIFICATION_QUEUE_CAPACITY);

        let state = DiceState {
            sections: GeneralSections::default(),
            global: GlobalSettings::default(),
            ext_sync: ExtendedSyncInfo::default(),
            enabled: false,
            owner: None,
            owner_generation: None,
            hi_dualwire,
            max_speed,
            playback: StreamInstance::new(
                StreamDirection::Playback,
                playback.engine,
                playback.resources,
            ),
            capture: StreamInstance::new(
                StreamDirection::Capture,
                capture.engine,
                capture.resources,
            ),
        };

        let dice = Dice {
            timeout_ms,
            state: Mutex::new(state),
            notified: Mutex::new(Notified {
                bits: 0,
                dev_lock_count: 0,
                dev_lock_changed: false,
            }),
            wait: Condvar::new(),
            accept: ClockAccept::default(),
            queue: tx,
        };

        (dice, rx)
    }

    /// Take the unit into service; locate the sections, verify the protocol
    /// version, claim ownership and fill every cached snapshot. Ownership is
    /// returned when anything after the claim fails.
    pub fn attach(
        &self,
        io: &mut impl RegisterTransaction,
        owner: OwnerInfo,
        generation: u32,
    ) -> Result<(), Error> {
        let timeout_ms = self.timeout_ms;

        let mut sections = GeneralSections::default();
        transaction::read_general_sections(io, &mut sections, timeout_ms)?;

        global_section::verify_protocol_version(io, &sections, timeout_ms)?;

        ownership::acquire(
            io,
            &sections,
            &owner,
            &RetryPolicy::default(),
            &mut |d| thread::sleep(d),
            timeout_ms,
        )?;

        let result = Self::read_snapshots(io, &sections, timeout_ms);

        match result {
            Ok((global, ext_sync, playback_config, capture_config)) => {
                let mut state = self.state.lock().unwrap();
                state.sections = sections;
                state.global = global;
                state.ext_sync = ext_sync;
                state.owner = Some(owner);
                state.owner_generation = Some(generation);
                state.playback.config = playback_config;
                state.capture.config = capture_config;
                Ok(())
            }
            Err(e) => {
                ownership::release(io, &sections, &owner, timeout_ms);
                Err(e)
            }
        }
    }

    fn read_snapshots(
        io: &mut impl RegisterTransaction,
        sections: &GeneralSections,
        timeout_ms: u32,
    ) -> Result<(GlobalSettings, ExtendedSyncInfo, StreamConfig, StreamConfig), Error> {
        let mut global = GlobalSettings::default();
        global_section::read_global_settings(io, sections, &mut global, timeout_ms)?;

        let mut ext_sync = ExtendedSyncInfo::default();
        if sections.ext_sync.size >= ext_sync_section::EXT_SYNC_SIZE {
            read_ext_sync_info(io, sections, &mut ext_sync, timeout_ms)?;
        } else {
            debug!("Extended sync section not available");
        }

        let mut playback_config = StreamConfig::default();
        stream_format::update_config(
            io,
            sections,
            StreamDirection::Playback,
            &mut playback_config,
            timeout_ms,
        )?;

        let mut capture_config = StreamConfig::default();
        stream_format::update_config(
            io,
            sections,
            StreamDirection::Capture,
            &mut capture_config,
            timeout_ms,
        )?;

        Ok((global, ext_sync, playback_config, capture_config))
    }

    /// Take the unit out of service; stop everything and return ownership.
    /// Best effort all the way down.
    pub fn detach(&self, io: &mut impl RegisterTransaction) {
        self.abort_clients();

        let mut state = self.state.lock().unwrap();
        stream::stop_all(&mut state, io, self.timeout_ms);

        if let Some(owner) = state.owner.take() {
            let sections = state.sections.clone();
            ownership::release(io, &sections, &owner, self.timeout_ms);
        }
        state.owner_generation = None;
    }

    fn abort_clients(&self) {
        let clients: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .playback
                .client()
                .into_iter()
                .chain(state.capture.client())
                .collect()
        };
        clients.iter().for_each(|client| client.abort());
    }

    /// React to a change of bus topology. The node disabled its transport by
    /// itself and stays unresponsive for hundreds of milliseconds, so both
    /// instances are forced down without negotiated teardown, reservations
    /// are renewed and ownership is claimed again in the new generation. A
    /// unit claimed by another host meanwhile is a surfaced failure.
    pub fn handle_bus_reset(
        &self,
        io: &mut impl RegisterTransaction,
        generation: u32,
    ) -> Result<(), Error> {
        info!("Bus topology changed, generation {}", generation);

        self.abort_clients();

        let mut state = self.state.lock().unwrap();

        stream::force_stop(&mut state);

        let _ = resources::renew(&mut state.playback.reservation);
        let _ = resources::renew(&mut state.capture.reservation);

        if let Some(owner) = state.owner {
            let sections = state.sections.clone();
            match ownership::renew(io, &sections, &owner, self.timeout_ms) {
                Ok(()) => {
                    state.owner_generation = Some(generation);
                    Ok(())
                }
                Err(e) => {
                    state.owner_generation = None;
                    Err(e)
                }
            }
        } else {
            Ok(())
        }
    }

    /// Start the transport for the direction at the rate. The clock of node
    /// is switched first when it reports another rate; rejected when any
    /// transport runs at the other rate, or an external tool holds the unit.
    pub fn start_stream(
        &self,
        io: &mut impl RegisterTransaction,
        direction: StreamDirection,
        rate: u32,
    ) -> Result<(), Error> {
        let rate_index = clock_rate_to_index(rate).ok_or_else(|| {
            let msg = format!("Sampling rate {} is not expressible", rate);
            Error::new(EngineError::Protocol, &msg)
        })?;

        {
            let notified = self.notified.lock().unwrap();
            if notified.dev_lock_count < 0 {
                let msg = "The unit is held by an external tool";
                return Err(Error::new(EngineError::Ownership, msg));
            }
        }

        let (sections, already_running, any_running) = {
            let state = self.state.lock().unwrap();
            (
                state.sections.clone(),
                state.instance(direction).running,
                state.any_running(),
            )
        };

        if already_running {
            return Ok(());
        }

        let current = global_section::read_clock_select(io, &sections, self.timeout_ms)?;
        if u8::from(current.rate) as usize != rate_index {
            if any_running {
                let msg = format!(
                    "Rate {} rejected while transport runs at {}",
                    rate, current.rate
                );
                error!("{}", msg);
                return Err(Error::new(EngineError::Busy, &msg));
            }
            ownership::change_rate(
                io,
                &sections,
                &self.accept,
                rate_index,
                false,
                self.timeout_ms,
            )?;
        }

        let mut state = self.state.lock().unwrap();
        stream::start(&mut state, io, direction, rate, self.timeout_ms)
    }

    /// Stop the transport for the direction, honoring the dependency between
    /// both instances.
    pub fn stop_stream(
        &self,
        io: &mut impl RegisterTransaction,
        direction: StreamDirection,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        stream::stop(&mut state, io, direction, self.timeout_ms)
    }

    /// Stop both instances when the clock carrier runs.
    pub fn stop_all_streams(&self, io: &mut impl RegisterTransaction) {
        let mut state = self.state.lock().unwrap();
        stream::stop_all(&mut state, io, self.timeout_ms);
    }

    /// Select a new rate of sampling clock. Rejected when any transport runs
    /// at another rate.
    pub fn change_clock_rate(
        &self,
        io: &mut impl RegisterTransaction,
        rate: u32,
        force: bool,
    ) -> Result<(), Error> {
        let rate_index = clock_rate_to_index(rate).ok_or_else(|| {
            let msg = format!("Sampling rate {} is not expressible", rate);
            Error::new(EngineError::Protocol, &msg)
        })?;

        let (sections, any_running) = {
            let state = self.state.lock().unwrap();
            (state.sections.clone(), state.any_running())
        };

        let current = global_section::read_clock_select(io, &sections, self.timeout_ms)?;
        if any_running && u8::from(current.rate) as usize != rate_index {
            let msg = format!(
                "Rate {} rejected while transport runs at {}",
                rate, current.rate
            );
            error!("{}", msg);
            return Err(Error::new(EngineError::Busy, &msg));
        }

        ownership::change_rate(
            io,
            &sections,
            &self.accept,
            rate_index,
            force,
            self.timeout_ms,
        )
    }

    /// Read the layout of isochronous streams again for the direction. The
    /// transport for the direction has to be stopped.
    pub fn update_stream_config(
        &self,
        io: &mut impl RegisterTransaction,
        direction: StreamDirection,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if state.instance(direction).running {
            let msg = "Stream layout can not be read while its transport runs";
            return Err(Error::new(EngineError::Busy, msg));
        }

        let sections = state.sections.clone();
        let mut config = state.instance(direction).config;
        let result = stream_format::update_config(io, &sections, direction, &mut config, self.timeout_ms);
        state.instance_mut(direction).config = config;

        result
    }

    /// Attach a media client to the stream of the direction. The engine keeps
    /// a weak reference only.
    pub fn attach_substream(
        &self,
        direction: StreamDirection,
        client: &Arc<dyn PcmSubstream + Send + Sync>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.instance_mut(direction).client = Some(Arc::downgrade(client));
    }

    pub fn detach_substream(&self, direction: StreamDirection) {
        let mut state = self.state.lock().unwrap();
        state.instance_mut(direction).client = None;
    }

    /// Count an engine-side user of the unit in. Fails while an external
    /// tool holds the unit.
    pub fn try_lock(&self) -> Result<(), Error> {
        let mut notified = self.notified.lock().unwrap();

        if notified.dev_lock_count < 0 {
            let msg = "The unit is held by an external tool";
            return Err(Error::new(EngineError::Ownership, msg));
        }

        notified.dev_lock_count += 1;
        if notified.dev_lock_count == 1 {
            notified.dev_lock_changed = true;
            self.wait.notify_all();
        }

        Ok(())
    }

    pub fn unlock(&self) {
        let mut notified = self.notified.lock().unwrap();

        if notified.dev_lock_count <= 0 {
            return;
        }

        notified.dev_lock_count -= 1;
        if notified.dev_lock_count == 0 {
            notified.dev_lock_changed = true;
            self.wait.notify_all();
        }
    }

    /// Hold the unit for an external tool, keeping the engine away from it.
    pub fn external_lock(&self) -> Result<(), Error> {
        let mut notified = self.notified.lock().unwrap();

        if notified.dev_lock_count != 0 {
            let msg = "The unit is in use";
            return Err(Error::new(EngineError::Ownership, msg));
        }

        notified.dev_lock_count = -1;
        notified.dev_lock_changed = true;
        self.wait.notify_all();

        Ok(())
    }

    pub fn external_unlock(&self) -> Result<(), Error> {
        let mut notified = self.notified.lock().unwrap();

        if notified.dev_lock_count != -1 {
            let msg = "The unit is not held externally";
            return Err(Error::new(EngineError::Ownership, msg));
        }

        notified.dev_lock_count = 0;
        notified.dev_lock_changed = true;
        self.wait.notify_all();

        Ok(())
    }

    /// Consume the accumulated notification bits, exactly once.
    pub fn take_notified_bits(&self) -> u32 {
        let mut notified = self.notified.lock().unwrap();
        let bits = notified.bits;
        notified.bits = 0;
        bits
    }

    /// Consume a pending change of the device lock state, yielding whether
    /// the engine holds the unit now.
    pub fn take_lock_change(&self) -> Option<bool> {
        let mut notified = self.notified.lock().unwrap();
        if notified.dev_lock_changed {
            notified.dev_lock_changed = false;
            Some(notified.dev_lock_count > 0)
        } else {
            None
        }
    }

    /// Block until notification bits or a lock change is pending, or the
    /// timeout expires.
    pub fn wait_event(&self, timeout: Duration) -> bool {
        let notified = self.notified.lock().unwrap();
        let (_, result) = self
            .wait
            .wait_timeout_while(notified, timeout, |n| {
                !n.dev_lock_changed && n.bits == 0
            })
            .unwrap();
        !result.timed_out()
    }

    pub fn global_settings(&self) -> GlobalSettings {
        self.state.lock().unwrap().global.clone()
    }

    pub fn ext_sync_info(&self) -> ExtendedSyncInfo {
        self.state.lock().unwrap().ext_sync
    }

    pub fn stream_config(&self, direction: StreamDirection) -> StreamConfig {
        self.state.lock().unwrap().instance(direction).config
    }

    pub fn packet_layout(&self, direction: StreamDirection) -> stream::PacketLayout {
        self.state
            .lock()
            .unwrap()
            .instance(direction)
            .layout
            .clone()
    }

    pub fn is_running(&self, direction: StreamDirection) -> bool {
        self.state.lock().unwrap().instance(direction).running
    }
}
