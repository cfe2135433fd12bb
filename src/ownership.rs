// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Exclusive ownership of node and control of sampling clock.
//!
//! The owner register arbitrates which host controls the node and where the
//! node sends asynchronous notification. The arbitration is a compare-swap
//! operation over the 64 bit field; the reserved pattern means that no host
//! holds the node.

use {super::*, std::time::Duration};

/// The pattern in owner register which means that no host holds the node.
pub const NO_OWNER: u64 = 0xffff000000000000;

/// Identity the host claims in the owner register; the node id in the upper
/// bits and the address to which notification is sent in the lower bits.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerInfo {
    /// Node id of the host in the bus.
    pub node_id: u32,
    /// The address at which the host receives notification.
    pub notification_offset: u64,
}

impl OwnerInfo {
    const NODE_SHIFT: usize = 48;

    pub fn value(&self) -> u64 {
        ((self.node_id as u64) << Self::NODE_SHIFT)
            | (self.notification_offset & ((1u64 << Self::NODE_SHIFT) - 1))
    }
}

/// Bounded retry against transient failure, expressed as data so that the
/// schedule is verifiable without a real bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of retries after the initial attempt.
    pub retries: usize,
    /// The delay before each retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            delay: Duration::from_millis(20),
        }
    }
}

fn attempt_claim(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    owner: &OwnerInfo,
    timeout_ms: u32,
) -> Result<u64, Error> {
    let mut frames = [0; 16];
    serialize_u64(&NO_OWNER, &mut frames[..8]);
    serialize_u64(&owner.value(), &mut frames[8..16]);

    io.lock_compare_swap(
        sections.global.offset + global_section::OWNER_OFFSET,
        &mut frames,
        timeout_ms,
    )
    .map(|_| {
        let mut prior = 0u64;
        deserialize_u64(&mut prior, &frames[..8]);
        prior
    })
}

/// Claim exclusive ownership of the node. Transient transaction failure is
/// retried per the policy; a node held by another owner is rejected at once.
pub fn acquire(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    owner: &OwnerInfo,
    policy: &RetryPolicy,
    sleep: &mut dyn FnMut(Duration),
    timeout_ms: u32,
) -> Result<(), Error> {
    let mut retried = 0;

    loop {
        match attempt_claim(io, sections, owner, timeout_ms) {
            Ok(prior) => {
                return if prior == NO_OWNER {
                    Ok(())
                } else {
                    error!("Device is already in use, owner 0x{:016x}", prior);
                    Err(Error::new(EngineError::Ownership, "Device is already in use"))
                };
            }
            Err(e) => {
                if retried >= policy.retries {
                    return Err(e);
                }
                debug!(
                    "Ownership attempt {} failed, retrying: {}",
                    retried + 1,
                    e
                );
                retried += 1;
                sleep(policy.delay);
            }
        }
    }
}

/// Claim ownership again after the bus topology changed. A node held by
/// another owner is a surfaced failure; a transaction failure is tolerated
/// since the next topology change retries anyway.
pub fn renew(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    owner: &OwnerInfo,
    timeout_ms: u32,
) -> Result<(), Error> {
    match attempt_claim(io, sections, owner, timeout_ms) {
        Ok(prior) => {
            if prior == NO_OWNER {
                Ok(())
            } else {
                error!("Device is already in use, owner 0x{:016x}", prior);
                Err(Error::new(EngineError::Ownership, "Device is already in use"))
            }
        }
        Err(e) => {
            warn!("Ownership renewal postponed: {}", e);
            Ok(())
        }
    }
}

/// Return ownership of the node. Best effort; the node forgets the owner by
/// itself at the next bus reset.
pub fn release(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    owner: &OwnerInfo,
    timeout_ms: u32,
) {
    let mut frames = [0; 16];
    serialize_u64(&owner.value(), &mut frames[..8]);
    serialize_u64(&NO_OWNER, &mut frames[8..16]);

    let _ = io
        .lock_compare_swap(
            sections.global.offset + global_section::OWNER_OFFSET,
            &mut frames,
            timeout_ms,
        )
        .map_err(|e| debug!("Ownership release failed: {}", e));
}

/// Write the transport enable register. Callers track the cached state and
/// keep the operation idempotent.
pub fn write_enable(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    enable: bool,
    timeout_ms: u32,
) -> Result<(), Error> {
    io.write_quadlet(
        sections.global.offset + global_section::ENABLE_OFFSET,
        enable as u32,
        timeout_ms,
    )
}

/// The bounded wait for the node to accept a new clock configuration.
pub const ACCEPT_TIMEOUT_MS: u64 = 100;

/// Select a new rate of sampling clock, keeping the configured signal source.
/// The node reports acceptance by notification; expiry of the bounded wait is
/// logged and not propagated since the node applies the change regardless.
pub fn change_rate(
    io: &mut impl RegisterTransaction,
    sections: &GeneralSections,
    accept: &notification::ClockAccept,
    rate_index: usize,
    force: bool,
    timeout_ms: u32,
) -> Result<(), Error> {
    let current = global_section::read_clock_select(io, sections, timeout_ms)?;
    if !force && u8::from(current.rate) as usize == rate_index {
        return Ok(());
    }

    let config = ClockConfig {
        rate: ClockRate::from(rate_index as u8),
        src: current.src,
    };

    // Armed before the write so that an early notification is not lost.
    accept.rearm();

    global_section::write_clock_select(io, sections, config, timeout_ms)?;

    if !accept.wait(Duration::from_millis(ACCEPT_TIMEOUT_MS)) {
        warn!(
            "Clock change not accepted within {} ms, continuing",
            ACCEPT_TIMEOUT_MS
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::transaction::test_util::{FakeTransaction, LockReply},
    };

    fn sections() -> GeneralSections {
        let mut sections = GeneralSections::default();
        sections.global.offset = 0x28;
        sections.global.size = 0x68;
        sections
    }

    fn owner() -> OwnerInfo {
        OwnerInfo {
            node_id: 0xffc0,
            notification_offset: 0x0000fffff0000904,
        }
    }

    #[test]
    fn acquire_claims_vacant_device() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke_u64(sections.global.offset, NO_OWNER);

        let mut slept = Vec::new();
        acquire(
            &mut io,
            &sections,
            &owner(),
            &RetryPolicy::default(),
            &mut |d| slept.push(d),
            100,
        )
        .unwrap();

        assert_eq!(io.peek_u64(sections.global.offset), owner().value());
        assert_eq!(slept.len(), 0);
    }

    #[test]
    fn acquire_rejects_held_device_without_retry() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke_u64(sections.global.offset, 0xffc1000000001000);

        let mut slept = Vec::new();
        let err = acquire(
            &mut io,
            &sections,
            &owner(),
            &RetryPolicy::default(),
            &mut |d| slept.push(d),
            100,
        )
        .unwrap_err();

        assert_eq!(err.kind::<EngineError>(), Some(EngineError::Ownership));
        assert_eq!(slept.len(), 0);
        assert_eq!(io.logged().iter().filter(|l| l.starts_with("lock")).count(), 1);
        assert_eq!(io.peek_u64(sections.global.offset), 0xffc1000000001000);
    }

    #[test]
    fn acquire_retries_with_spacing_then_succeeds() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke_u64(sections.global.offset, NO_OWNER);
        io.lock_replies.push_back(LockReply::Fail);
        io.lock_replies.push_back(LockReply::Fail);

        let mut slept = Vec::new();
        acquire(
            &mut io,
            &sections,
            &owner(),
            &RetryPolicy::default(),
            &mut |d| slept.push(d),
            100,
        )
        .unwrap();

        assert_eq!(slept, vec![Duration::from_millis(20); 2]);
        assert_eq!(io.logged().iter().filter(|l| l.starts_with("lock")).count(), 3);
        assert_eq!(io.peek_u64(sections.global.offset), owner().value());
    }

    #[test]
    fn acquire_gives_up_after_bounded_retries() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        for _ in 0..4 {
            io.lock_replies.push_back(LockReply::Fail);
        }

        let mut slept = Vec::new();
        let result = acquire(
            &mut io,
            &sections,
            &owner(),
            &RetryPolicy::default(),
            &mut |d| slept.push(d),
            100,
        );

        assert!(result.is_err());
        assert_eq!(slept, vec![Duration::from_millis(20); 3]);
        assert_eq!(io.logged().iter().filter(|l| l.starts_with("lock")).count(), 4);
    }

    #[test]
    fn release_swallows_failure() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.lock_replies.push_back(LockReply::Fail);

        release(&mut io, &sections, &owner(), 100);
    }

    #[test]
    fn release_returns_device_to_vacant() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke_u64(sections.global.offset, owner().value());

        release(&mut io, &sections, &owner(), 100);

        assert_eq!(io.peek_u64(sections.global.offset), NO_OWNER);
    }

    #[test]
    fn renew_tolerates_transaction_failure() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.lock_replies.push_back(LockReply::Fail);

        renew(&mut io, &sections, &owner(), 100).unwrap();
    }

    #[test]
    fn renew_surfaces_foreign_owner() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        io.poke_u64(sections.global.offset, 0xffc1000000001000);

        let err = renew(&mut io, &sections, &owner(), 100).unwrap_err();
        assert_eq!(err.kind::<EngineError>(), Some(EngineError::Ownership));
    }

    #[test]
    fn change_rate_skips_matching_rate() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        let select = u32::from(ClockConfig {
            rate: ClockRate::R48000,
            src: ClockSource::Adat,
        });
        io.poke(sections.global.offset + global_section::CLOCK_SELECT_OFFSET, select);

        let accept = notification::ClockAccept::default();
        change_rate(&mut io, &sections, &accept, 2, false, 100).unwrap();

        assert!(io.logged().iter().all(|l| !l.starts_with("write")));
    }

    #[test]
    fn change_rate_preserves_source() {
        let sections = sections();
        let mut io = FakeTransaction::new();
        let select = u32::from(ClockConfig {
            rate: ClockRate::R48000,
            src: ClockSource::Adat,
        });
        let select_offset = sections.global.offset + global_section::CLOCK_SELECT_OFFSET;
        io.poke(select_offset, select);

        let accept = notification::ClockAccept::default();
        accept.signal();
        change_rate(&mut io, &sections, &accept, 4, false, 100).unwrap();

        let written = ClockConfig::from(io.peek(select_offset));
        assert_eq!(written.rate, ClockRate::R96000);
        assert_eq!(written.src, ClockSource::Adat);
    }
}
