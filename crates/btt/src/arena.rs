//! Per-arena runtime state: flog slots, the read tracking table, and
//! map locks.
//!
//! The flog is the free-list/log that makes a block remap power-fail
//! atomic. Each lane owns one slot: a pair of on-media entries toggled
//! by sequence number, plus a host-order cache of the current entry
//! whose `old_map` field names the lane's free block.
//!
//! The read tracking table (rtt) lets readers publish the internal
//! block they are about to read; a writer spins on it before reusing a
//! freed block, so readers never block writers.

use btt_error::Result;
use btt_ns::Namespace;
use btt_ondisk::{
    map_entry_offset, next_seq, FlogEntry, MapEntry, BTT_FLOG_PAIR_STRIDE,
};
use btt_types::{ByteOffset, Lane, BTTINFO_FLAG_ERROR};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{fence, AtomicU32, Ordering};
use tracing::{trace, warn};

/// Runtime state of one flog pair, owned by one lane.
#[derive(Debug)]
pub(crate) struct FlogSlot {
    /// Absolute offsets of the two halves of the pair.
    pub entries: [ByteOffset; 2],
    /// Index of the half that receives the next write.
    pub next: usize,
    /// Host-order copy of the current entry.
    pub flog: FlogEntry,
}

/// Guard for one stripe of the map; dropping it releases the stripe
/// without writing (the abort path).
pub(crate) type MapGuard<'a> = MutexGuard<'a, ()>;

#[derive(Debug)]
pub(crate) struct Arena {
    /// Info-block flags, possibly extended with `BTTINFO_FLAG_ERROR` if
    /// flog parsing found a consistency fault. Set during load, frozen
    /// afterwards.
    pub flags: u32,
    pub external_nlba: u32,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    /// Absolute offsets into the namespace (on media they are
    /// arena-relative; converted once at load).
    pub dataoff: ByteOffset,
    pub mapoff: ByteOffset,
    pub flogoff: ByteOffset,
    /// One slot per lane.
    pub flogs: Vec<Mutex<FlogSlot>>,
    /// One published read per lane; `MapEntry::RTT_IDLE` when idle.
    pub rtt: Vec<AtomicU32>,
    /// Map stripes, indexed by `premap_lba % nfree`.
    pub map_locks: Vec<Mutex<()>>,
}

impl Arena {
    /// Build runtime state for an arena whose info block has already
    /// validated. Loads every flog pair, running crash recovery where a
    /// pair records an unfinished map update.
    pub fn load(
        ns: &dyn Namespace,
        lane: Lane,
        startoff: ByteOffset,
        info: &btt_ondisk::ArenaInfo,
        nfree: u32,
    ) -> Result<Self> {
        let mut arena = Self {
            flags: info.flags,
            external_nlba: info.external_nlba,
            internal_lbasize: info.internal_lbasize,
            internal_nlba: info.internal_nlba,
            dataoff: startoff.add(info.dataoff),
            mapoff: startoff.add(info.mapoff),
            flogoff: startoff.add(info.flogoff),
            flogs: Vec::with_capacity(nfree as usize),
            rtt: (0..nfree)
                .map(|_| AtomicU32::new(MapEntry::RTT_IDLE))
                .collect(),
            map_locks: (0..nfree).map(|_| Mutex::new(())).collect(),
        };
        fence(Ordering::SeqCst);

        let mut flog_off = arena.flogoff;
        for slot_idx in 0..nfree {
            let (slot, fault) = arena.read_flog_pair(ns, lane, flog_off, slot_idx)?;
            if fault {
                arena.flags |= BTTINFO_FLAG_ERROR;
            }
            arena.flogs.push(Mutex::new(slot));
            flog_off = flog_off.add(BTT_FLOG_PAIR_STRIDE);
        }

        Ok(arena)
    }

    /// Load one flog pair and decide which half is current.
    ///
    /// Cases: both sequence numbers equal is a consistency fault (the
    /// arena goes read-only); one zero means the other half is current;
    /// otherwise the half one sequence step ahead wins.
    fn read_flog_pair(
        &self,
        ns: &dyn Namespace,
        lane: Lane,
        flog_off: ByteOffset,
        slot_idx: u32,
    ) -> Result<(FlogSlot, bool)> {
        let entries = [flog_off, flog_off.add(16)];

        let mut pair = [0_u8; 32];
        ns.read_at(lane, flog_off, &mut pair)?;
        let mut half = [0_u8; 16];
        half.copy_from_slice(&pair[..16]);
        let first = FlogEntry::from_bytes(half);
        half.copy_from_slice(&pair[16..]);
        let second = FlogEntry::from_bytes(half);

        if first.seq == second.seq {
            warn!(
                target: "btt::flog",
                event = "seq_collision",
                slot = slot_idx,
                seq = first.seq,
            );
            let slot = FlogSlot {
                entries,
                next: 0,
                flog: FlogEntry::default(),
            };
            return Ok((slot, true));
        }

        let (current, next) = if first.seq == 0 {
            (second, 0)
        } else if second.seq == 0 {
            (first, 1)
        } else if next_seq(first.seq) == second.seq {
            (second, 0)
        } else {
            (first, 1)
        };

        trace!(
            target: "btt::flog",
            event = "flog_loaded",
            slot = slot_idx,
            lba = current.lba,
            old_map = current.old_map,
            new_map = current.new_map,
            seq = current.seq,
        );

        // old_map == new_map is the freshly initialized state; nothing
        // to recover. Otherwise the pair records a remap whose map
        // update may not have landed.
        if current.old_map != current.new_map {
            let entry = self.read_map_entry(ns, lane, current.lba)?;
            if entry.raw() == current.old_map {
                warn!(
                    target: "btt::flog",
                    event = "recover_map",
                    slot = slot_idx,
                    lba = current.lba,
                    new_map = current.new_map,
                );
                ns.write_at(
                    lane,
                    map_entry_offset(self.mapoff, current.lba),
                    &MapEntry::from_raw(current.new_map).encode(),
                )?;
            }
            // Equal to new_map: the remap finished and old_map is the
            // free block. Equal to neither: the entry was superseded.
        }

        let slot = FlogSlot {
            entries,
            next,
            flog: current,
        };
        Ok((slot, false))
    }

    /// Read the live map entry for `premap_lba`.
    pub fn read_map_entry(
        &self,
        ns: &dyn Namespace,
        lane: Lane,
        premap_lba: u32,
    ) -> Result<MapEntry> {
        let mut bytes = [0_u8; 4];
        ns.read_at(lane, map_entry_offset(self.mapoff, premap_lba), &mut bytes)?;
        Ok(MapEntry::decode(bytes))
    }

    /// Commit a remap through the lane's flog pair.
    ///
    /// The 12-byte body goes to the non-current half first; once it is
    /// durable, the 4-byte sequence write makes that half current. The
    /// sequence write is the atomic commit point of the whole block
    /// write.
    pub fn flog_update(
        &self,
        ns: &dyn Namespace,
        lane: Lane,
        premap_lba: u32,
        old_map: u32,
        new_map: u32,
    ) -> Result<()> {
        let mut slot = self.flogs[lane.index()].lock();

        let entry = FlogEntry {
            lba: premap_lba,
            old_map,
            new_map,
            seq: next_seq(slot.flog.seq),
        };
        let target = slot.entries[slot.next];

        ns.write_at(lane, target, &entry.encode_body())?;
        ns.write_at(lane, target.add(12), &entry.seq.to_le_bytes())?;

        slot.next = 1 - slot.next;
        slot.flog = entry;

        trace!(
            target: "btt::flog",
            event = "flog_update",
            lane = lane.0,
            lba = premap_lba,
            old_map,
            new_map,
            seq = entry.seq,
        );
        Ok(())
    }

    /// The free block currently owned by `lane`.
    pub fn free_block(&self, lane: Lane) -> u32 {
        self.flogs[lane.index()].lock().flog.old_map & btt_ondisk::BTT_MAP_ENTRY_LBA_MASK
    }

    /// Acquire the map stripe covering `premap_lba` and read the entry
    /// under the lock. Dropping the returned guard without calling
    /// [`Arena::map_unlock`] aborts the update.
    pub fn map_lock(
        &self,
        ns: &dyn Namespace,
        lane: Lane,
        premap_lba: u32,
    ) -> Result<(MapGuard<'_>, MapEntry)> {
        let stripe = premap_lba as usize % self.map_locks.len();
        let guard = self.map_locks[stripe].lock();
        let entry = self.read_map_entry(ns, lane, premap_lba)?;
        trace!(
            target: "btt::map",
            event = "map_locked",
            premap_lba,
            entry = entry.raw(),
        );
        Ok((guard, entry))
    }

    /// Write `entry` for `premap_lba` and release the stripe.
    pub fn map_unlock(
        &self,
        ns: &dyn Namespace,
        lane: Lane,
        premap_lba: u32,
        entry: MapEntry,
        guard: MapGuard<'_>,
    ) -> Result<()> {
        let result = ns.write_at(
            lane,
            map_entry_offset(self.mapoff, premap_lba),
            &entry.encode(),
        );
        drop(guard);
        trace!(
            target: "btt::map",
            event = "map_unlocked",
            premap_lba,
            entry = entry.raw(),
        );
        result
    }

    /// Absolute offset of internal block `postmap_lba` in the data area.
    pub fn data_block_offset(&self, postmap_lba: u32) -> ByteOffset {
        self.dataoff
            .add(u64::from(postmap_lba) * u64::from(self.internal_lbasize))
    }
}
