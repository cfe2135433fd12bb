// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2023 Takashi Sakamoto

//! Transaction client for the private register space of node.
//!
//! The module includes the trait to operate registers in the private address
//! space by IEEE 1394 asynchronous transaction, as well as its implementation
//! backed by Linux FireWire character device.

use {
    super::*,
    hinawa::{prelude::FwReqExtManual, FwNode, FwReq, FwTcode},
};

/// The head of private address space in which all registers reside.
pub const BASE_ADDR: u64 = 0xffffe0000000;

const MAX_FRAME_SIZE: usize = 512;

/// Synchronous register transactions against the private address space of
/// node. Every operation is a round trip; when it fails the content of the
/// addressed register has to be assumed unchanged.
pub trait RegisterTransaction {
    /// Initiate read transaction to offset in the private address space and
    /// finish it.
    fn read(&mut self, offset: usize, frames: &mut [u8], timeout_ms: u32) -> Result<(), Error>;

    /// Initiate write transaction to offset in the private address space and
    /// finish it.
    fn write(&mut self, offset: usize, frames: &mut [u8], timeout_ms: u32) -> Result<(), Error>;

    /// Initiate lock transaction with compare-swap operation against a 64 bit
    /// field. The frame carries the expected value followed by the new value;
    /// when the transaction finishes, the first 8 bytes carry the value the
    /// register had before the operation.
    fn lock_compare_swap(
        &mut self,
        offset: usize,
        frames: &mut [u8; 16],
        timeout_ms: u32,
    ) -> Result<(), Error>;

    fn read_quadlet(&mut self, offset: usize, timeout_ms: u32) -> Result<u32, Error> {
        let mut raw = [0; 4];
        self.read(offset, &mut raw, timeout_ms)
            .map(|_| u32::from_be_bytes(raw))
    }

    fn write_quadlet(&mut self, offset: usize, val: u32, timeout_ms: u32) -> Result<(), Error> {
        let mut raw = val.to_be_bytes();
        self.write(offset, &mut raw, timeout_ms)
    }
}

/// Implementation of register transactions initiated to an actual node in
/// IEEE 1394 bus.
#[derive(Debug)]
pub struct FwTransaction {
    req: FwReq,
    node: FwNode,
}

impl FwTransaction {
    pub fn new(node: FwNode) -> Self {
        FwTransaction {
            req: FwReq::default(),
            node,
        }
    }

    pub fn node(&self) -> &FwNode {
        &self.node
    }
}

impl RegisterTransaction for FwTransaction {
    fn read(&mut self, offset: usize, mut frames: &mut [u8], timeout_ms: u32) -> Result<(), Error> {
        let mut addr = BASE_ADDR + offset as u64;

        while frames.len() > 0 {
            let len = std::cmp::min(frames.len(), MAX_FRAME_SIZE);
            let tcode = if len == 4 {
                FwTcode::ReadQuadletRequest
            } else {
                FwTcode::ReadBlockRequest
            };

            self.req
                .transaction(&self.node, tcode, addr, len, &mut frames[0..len], timeout_ms)?;

            addr += len as u64;
            frames = &mut frames[len..];
        }

        Ok(())
    }

    fn write(&mut self, offset: usize, mut frames: &mut [u8], timeout_ms: u32) -> Result<(), Error> {
        let mut addr = BASE_ADDR + offset as u64;

        while frames.len() > 0 {
            let len = std::cmp::min(frames.len(), MAX_FRAME_SIZE);
            let tcode = if len == 4 {
                FwTcode::WriteQuadletRequest
            } else {
                FwTcode::WriteBlockRequest
            };

            self.req
                .transaction(&self.node, tcode, addr, len, &mut frames[0..len], timeout_ms)?;

            addr += len as u64;
            frames = &mut frames[len..];
        }

        Ok(())
    }

    fn lock_compare_swap(
        &mut self,
        offset: usize,
        frames: &mut [u8; 16],
        timeout_ms: u32,
    ) -> Result<(), Error> {
        self.req.transaction(
            &self.node,
            FwTcode::LockCompareSwap,
            BASE_ADDR + offset as u64,
            8,
            frames,
            timeout_ms,
        )
    }
}

/// Read the pointer table at the head of address space for the layout of
/// sections.
pub fn read_general_sections(
    io: &mut impl RegisterTransaction,
    sections: &mut GeneralSections,
    timeout_ms: u32,
) -> Result<(), Error> {
    let mut raw = [0; GeneralSections::SIZE];
    io.read(0, &mut raw, timeout_ms)?;
    deserialize_general_sections(sections, &raw)
        .map_err(|cause| Error::new(EngineError::Invalid(0), &cause))
}

#[cfg(test)]
pub(crate) mod test_util {
    use {
        super::*,
        std::{
            collections::{BTreeMap, VecDeque},
            sync::{Arc, Mutex},
        },
    };

    /// Scripted reply for one lock transaction; when the queue is vacant the
    /// compare-swap operates against the quadlet map for real.
    pub(crate) enum LockReply {
        Prior(u64),
        Fail,
    }

    /// In-memory stand-in for the register space of node, recording every
    /// transaction in issue order.
    pub(crate) struct FakeTransaction {
        pub mem: BTreeMap<usize, u32>,
        pub log: Arc<Mutex<Vec<String>>>,
        pub read_errors_at: Vec<usize>,
        pub write_errors_at: Vec<usize>,
        pub lock_replies: VecDeque<LockReply>,
    }

    impl FakeTransaction {
        pub fn new() -> Self {
            FakeTransaction {
                mem: BTreeMap::new(),
                log: Arc::new(Mutex::new(Vec::new())),
                read_errors_at: Vec::new(),
                write_errors_at: Vec::new(),
                lock_replies: VecDeque::new(),
            }
        }

        pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Self {
            let mut fake = Self::new();
            fake.log = log;
            fake
        }

        pub fn poke(&mut self, offset: usize, val: u32) {
            self.mem.insert(offset, val);
        }

        pub fn poke_u64(&mut self, offset: usize, val: u64) {
            self.poke(offset, (val >> 32) as u32);
            self.poke(offset + 4, (val & 0xffffffff) as u32);
        }

        pub fn peek(&self, offset: usize) -> u32 {
            self.mem.get(&offset).copied().unwrap_or(0)
        }

        pub fn peek_u64(&self, offset: usize) -> u64 {
            ((self.peek(offset) as u64) << 32) | (self.peek(offset + 4) as u64)
        }

        pub fn logged(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl RegisterTransaction for FakeTransaction {
        fn read(&mut self, offset: usize, frames: &mut [u8], _: u32) -> Result<(), Error> {
            self.record(format!("read {:#x} {}", offset, frames.len()));
            if self.read_errors_at.contains(&offset) {
                return Err(Error::new(EngineError::Invalid(-1), "read failure"));
            }
            for (i, chunk) in frames.chunks_mut(4).enumerate() {
                let val = self.peek(offset + i * 4);
                chunk.copy_from_slice(&val.to_be_bytes());
            }
            Ok(())
        }

        fn write(&mut self, offset: usize, frames: &mut [u8], _: u32) -> Result<(), Error> {
            let mut vals = Vec::new();
            for chunk in frames.chunks(4) {
                let mut quadlet = [0; 4];
                quadlet.copy_from_slice(chunk);
                vals.push(u32::from_be_bytes(quadlet));
            }
            self.record(format!(
                "write {:#x} {}",
                offset,
                vals.iter()
                    .map(|v| format!("{:#010x}", v))
                    .collect::<Vec<_>>()
                    .join(",")
            ));
            if self.write_errors_at.contains(&offset) {
                return Err(Error::new(EngineError::Invalid(-1), "write failure"));
            }
            for (i, val) in vals.iter().enumerate() {
                self.mem.insert(offset + i * 4, *val);
            }
            Ok(())
        }

        fn lock_compare_swap(
            &mut self,
            offset: usize,
            frames: &mut [u8; 16],
            _: u32,
        ) -> Result<(), Error> {
            self.record(format!("lock {:#x}", offset));

            if let Some(reply) = self.lock_replies.pop_front() {
                return match reply {
                    LockReply::Prior(val) => {
                        frames[..8].copy_from_slice(&val.to_be_bytes());
                        Ok(())
                    }
                    LockReply::Fail => Err(Error::new(EngineError::Invalid(-1), "lock failure")),
                };
            }

            let mut expected = 0u64;
            deserialize_u64(&mut expected, &frames[..8]);
            let mut new = 0u64;
            deserialize_u64(&mut new, &frames[8..16]);

            let prior = self.peek_u64(offset);
            if prior == expected {
                self.poke_u64(offset, new);
            }
            frames[..8].copy_from_slice(&prior.to_be_bytes());
            Ok(())
        }
    }

    #[test]
    fn quadlet_helpers() {
        let mut io = FakeTransaction::new();
        io.write_quadlet(0x40, 0xdeadbeef, 10).unwrap();
        assert_eq!(io.peek(0x40), 0xdeadbeef);
        assert_eq!(io.read_quadlet(0x40, 10).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn lock_swaps_on_match_only() {
        let mut io = FakeTransaction::new();
        io.poke_u64(0x0, 0x1122334455667788);

        let mut frames = [0; 16];
        frames[..8].copy_from_slice(&0x1122334455667788u64.to_be_bytes());
        frames[8..].copy_from_slice(&0xaabbccddeeff0011u64.to_be_bytes());
        io.lock_compare_swap(0x0, &mut frames, 10).unwrap();
        assert_eq!(&frames[..8], &0x1122334455667788u64.to_be_bytes());
        assert_eq!(io.peek_u64(0x0), 0xaabbccddeeff0011);

        let mut frames = [0; 16];
        frames[..8].copy_from_slice(&0x1122334455667788u64.to_be_bytes());
        io.lock_compare_swap(0x0, &mut frames, 10).unwrap();
        assert_eq!(&frames[..8], &0xaabbccddeeff0011u64.to_be_bytes());
        assert_eq!(io.peek_u64(0x0), 0xaabbccddeeff0011);
    }
}
