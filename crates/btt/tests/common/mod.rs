#![allow(dead_code)]
//! Shared fixtures: small-namespace options and a fault-injecting
//! namespace that drops a suffix of durable writes to simulate power
//! loss mid-operation.

use btt::{Btt, BttOptions, ByteOffset, Lane, MappedRange, MemNamespace, Namespace};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

pub const MIB: u64 = 1 << 20;
pub const LBASIZE: u32 = 512;
pub const NFREE: u32 = 4;
pub const RAWSIZE: u64 = 8 * MIB;

/// Options for an 8 MiB namespace with 16 MiB arena cap and 4 lanes.
pub fn small_opts(rawsize: u64) -> BttOptions {
    BttOptions {
        rawsize,
        lbasize: LBASIZE,
        parent_uuid: [0x11; 16],
        maxlane: 0,
        arena_max: 16 * MIB,
        arena_min: MIB,
        nfree: NFREE,
    }
}

pub fn open_mem(rawsize: u64) -> (Arc<MemNamespace>, Btt) {
    let ns = Arc::new(MemNamespace::new(rawsize as usize));
    let btt = Btt::init(ns.clone(), small_opts(rawsize)).unwrap();
    (ns, btt)
}

pub fn reopen(image: Vec<u8>) -> (Arc<MemNamespace>, Btt) {
    let rawsize = image.len() as u64;
    let ns = Arc::new(MemNamespace::from_vec(image));
    let btt = Btt::init(ns.clone(), small_opts(rawsize)).unwrap();
    (ns, btt)
}

pub fn block(byte: u8) -> Vec<u8> {
    vec![byte; LBASIZE as usize]
}

/// Namespace that persists only the first `budget` durable writes and
/// silently drops the rest, as if power failed at that point. Reads
/// observe only what was persisted, so the surviving image is exactly
/// what a crashed machine would find.
pub struct FaultNamespace {
    bytes: Mutex<Vec<u8>>,
    budget: AtomicI64,
}

impl FaultNamespace {
    pub fn new(image: Vec<u8>, budget: i64) -> Self {
        Self {
            bytes: Mutex::new(image),
            budget: AtomicI64::new(budget),
        }
    }

    /// The surviving media image.
    pub fn image(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    fn consume(&self) -> bool {
        self.budget.fetch_sub(1, Ordering::SeqCst) > 0
    }
}

impl Namespace for FaultNamespace {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }

    fn read_at(&self, _lane: Lane, off: ByteOffset, buf: &mut [u8]) -> btt::Result<()> {
        let bytes = self.bytes.lock().unwrap();
        let start = off.0 as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, _lane: Lane, off: ByteOffset, buf: &[u8]) -> btt::Result<()> {
        if !self.consume() {
            return Ok(());
        }
        let mut bytes = self.bytes.lock().unwrap();
        let start = off.0 as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn map_at(&self, _lane: Lane, off: ByteOffset, len: usize) -> btt::Result<MappedRange> {
        let bytes = self.bytes.lock().unwrap();
        let start = off.0 as usize;
        let end = (start + len).min(bytes.len());
        Ok(MappedRange::new(off, bytes[start..end].to_vec()))
    }

    fn sync_range(&self, lane: Lane, range: &MappedRange) -> btt::Result<()> {
        self.write_at(lane, range.offset(), range.as_slice())
    }
}
