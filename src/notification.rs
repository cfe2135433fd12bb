// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Receipt and deferred processing of asynchronous notification.
//!
//! The node reports state changes by a single quadlet write to the address
//! registered in the owner register. The receipt runs in the constrained
//! context of the response subsystem; it accumulates the bits, hands a copy
//! over to the deferred queue without blocking and acknowledges the write.
//! Interpretation and reaction happen later in ordinary blocking context.

use {
    super::{ext_sync_section::read_ext_sync_info, *},
    hinawa::{FwRcode, FwTcode},
    std::{
        sync::{Condvar, Mutex},
        time::Duration,
    },
};

/// The content of rx stream format section changed.
pub const NOTIFY_RX_CFG_CHG: u32 = 0x00000001;
/// The content of tx stream format section changed.
pub const NOTIFY_TX_CFG_CHG: u32 = 0x00000002;
/// The node detected several streams in the same isochronous channel.
pub const NOTIFY_DUP_ISOC: u32 = 0x00000004;
/// The node detected an isochronous bandwidth error.
pub const NOTIFY_BW_ERR: u32 = 0x00000008;
/// The lock state against the signal source of sampling clock changed.
pub const NOTIFY_LOCK_CHG: u32 = 0x00000010;
/// The node accepted a new configuration of sampling clock.
pub const NOTIFY_CLOCK_ACCEPTED: u32 = 0x00000020;
/// The content of global section changed.
pub const NOTIFY_INTERFACE_CHG: u32 = 0x00000040;

const KNOWN_MASK: u32 = NOTIFY_RX_CFG_CHG
    | NOTIFY_TX_CFG_CHG
    | NOTIFY_DUP_ISOC
    | NOTIFY_BW_ERR
    | NOTIFY_LOCK_CHG
    | NOTIFY_CLOCK_ACCEPTED
    | NOTIFY_INTERFACE_CHG;

/// Waiter for the acceptance of a new clock configuration. Armed before the
/// clock select register is written; a notification arriving after the
/// bounded wait expired is absorbed by the next arming.
#[derive(Default)]
pub struct ClockAccept {
    accepted: Mutex<bool>,
    cond: Condvar,
}

impl ClockAccept {
    pub fn rearm(&self) {
        *self.accepted.lock().unwrap() = false;
    }

    pub fn signal(&self) {
        *self.accepted.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Block until the acceptance is signalled, or the timeout expires.
    pub fn wait(&self, timeout: Duration) -> bool {
        let accepted = self.accepted.lock().unwrap();
        let (accepted, _) = self
            .cond
            .wait_timeout_while(accepted, timeout, |accepted| !*accepted)
            .unwrap();
        *accepted
    }
}

impl Dice {
    /// Entry for the unsolicited write from the node, callable in the
    /// constrained context of the response subsystem. Accumulates the bits
    /// under the short lock, hands a copy over to the deferred queue without
    /// blocking, then acknowledges. A full queue drops the event with a log;
    /// the accumulator keeps its bits regardless.
    pub fn dispatch_notification(&self, tcode: FwTcode, offset: u64, frame: &[u8]) -> FwRcode {
        if tcode != FwTcode::WriteQuadletRequest {
            return FwRcode::TypeError;
        }
        if (offset & 0x3) != 0 || frame.len() < 4 {
            return FwRcode::AddressError;
        }

        let mut bits = 0u32;
        deserialize_u32(&mut bits, frame);

        {
            let mut notified = self.notified.lock().unwrap();
            notified.bits |= bits;
        }

        if let Err(e) = self.queue.try_send(bits) {
            error!("Notification 0x{:08x} dropped: {}", bits, e);
        }

        self.wait.notify_all();

        FwRcode::Complete
    }

    /// Interpret one notification event in ordinary blocking context. The
    /// node sends the acceptance of a clock change together with the layout
    /// change it caused, so the acceptance is signalled after everything
    /// else; a waiter proceeds over refreshed configuration only.
    pub fn process_notification(&self, io: &mut impl RegisterTransaction, bits: u32) {
        let rx = bits & NOTIFY_RX_CFG_CHG > 0;
        let tx = bits & NOTIFY_TX_CFG_CHG > 0;
        if rx || tx {
            debug!("Stream layout change notified, rx: {}, tx: {}", rx, tx);
            self.process_stream_reconfiguration(io, rx, tx);
        }

        if bits & NOTIFY_LOCK_CHG > 0 {
            debug!("Lock change notified");
            self.process_lock_change(io);
        }

        if bits & NOTIFY_DUP_ISOC > 0 {
            warn!("The node detected a duplicated isochronous channel number");
        }

        if bits & NOTIFY_BW_ERR > 0 {
            warn!("The node detected an isochronous bandwidth error");
        }

        if bits & NOTIFY_INTERFACE_CHG > 0 {
            debug!("Interface change notified");
            self.process_interface_change(io);
        }

        if bits & NOTIFY_CLOCK_ACCEPTED > 0 {
            debug!("Clock change accepted");
            self.accept.signal();
        }

        let other = bits & !KNOWN_MASK;
        if other > 0 {
            info!("Unclassified notification bits: 0x{:08x}", other);
        }
    }

    fn process_stream_reconfiguration(&self, io: &mut impl RegisterTransaction, rx: bool, tx: bool) {
        let any_running = self.state.lock().unwrap().any_running();
        if any_running {
            info!("The node reconfigured its streams, stopping transport");

            let clients: Vec<_> = {
                let state = self.state.lock().unwrap();
                state
                    .playback
                    .client()
                    .into_iter()
                    .chain(state.capture.client())
                    .collect()
            };
            clients.iter().for_each(|client| client.reset());

            let mut state = self.state.lock().unwrap();
            stream::stop_all(&mut state, io, self.timeout_ms);
        }

        // The layouts have to be read with the transport stopped, else the
        // stale configuration leaks into resource release.
        if rx {
            self.refresh_stream_config(io, StreamDirection::Playback);
        }
        if tx {
            self.refresh_stream_config(io, StreamDirection::Capture);
        }
    }

    fn refresh_stream_config(&self, io: &mut impl RegisterTransaction, direction: StreamDirection) {
        let mut state = self.state.lock().unwrap();
        let sections = state.sections.clone();
        let mut config = state.instance(direction).config;

        let result =
            stream_format::update_config(io, &sections, direction, &mut config, self.timeout_ms);
        state.instance_mut(direction).config = config;

        if let Err(e) = result {
            error!("Failed to update {} stream layout: {}", direction, e);
        }
    }

    fn process_lock_change(&self, io: &mut impl RegisterTransaction) {
        let sections = self.state.lock().unwrap().sections.clone();

        let mut info = ExtendedSyncInfo::default();
        if let Err(e) = read_ext_sync_info(io, &sections, &mut info, self.timeout_ms) {
            error!("Failed to read sync state on lock change: {}", e);
            return;
        }

        let mut state = self.state.lock().unwrap();
        let prev = state.ext_sync;
        state.ext_sync = info;
        drop(state);

        if info.clock_source != prev.clock_source {
            debug!(
                "Sync source changed: {} (was {})",
                info.clock_source, prev.clock_source
            );
        }
        if info.rate != prev.rate {
            debug!("Sync rate changed: {} (was {})", info.rate, prev.rate);
        }
        if info.adat_user_data != prev.adat_user_data {
            debug!(
                "ADAT user data changed: {:?} (was {:?})",
                info.adat_user_data, prev.adat_user_data
            );
        }

        if prev.locked && !info.locked {
            info!("Sampling clock unlocked");
        }
        if !prev.locked && info.locked {
            info!("Sampling clock locked");
        }
    }

    fn process_interface_change(&self, io: &mut impl RegisterTransaction) {
        let sections = self.state.lock().unwrap().sections.clone();

        let mut settings = GlobalSettings::default();
        if let Err(e) =
            global_section::read_global_settings(io, &sections, &mut settings, self.timeout_ms)
        {
            error!("Failed to read global settings on interface change: {}", e);
            return;
        }

        let mut state = self.state.lock().unwrap();
        let prev = std::mem::replace(&mut state.global, settings.clone());
        drop(state);

        if settings.clock_config != prev.clock_config {
            debug!(
                "Clock select changed: {:?} (was {:?})",
                settings.clock_config, prev.clock_config
            );
        }
        if settings.enable != prev.enable {
            debug!("Enable changed: {} (was {})", settings.enable, prev.enable);
        }
        if settings.clock_status != prev.clock_status {
            debug!(
                "Clock status changed: {:?} (was {:?})",
                settings.clock_status, prev.clock_status
            );
        }
        if settings.measured_rate != prev.measured_rate {
            debug!(
                "Measured rate changed: {} (was {})",
                settings.measured_rate, prev.measured_rate
            );
        }
        if settings.clock_caps != prev.clock_caps {
            debug!(
                "Clock capabilities changed: {:?} (was {:?})",
                settings.clock_caps, prev.clock_caps
            );
        }
    }
}
