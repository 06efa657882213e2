#![forbid(unsafe_code)]
//! Block Translation Table: power-fail atomic single-block writes.
//!
//! A BTT instance sits on a linear byte-addressable namespace that only
//! guarantees byte-level durability, and maps every external logical
//! block address to a dynamically reassigned internal block. A torn
//! update can therefore never leave a caller-visible block half
//! written: after any crash, every external LBA reads either its last
//! fully committed contents or a previously committed version.
//!
//! How a write stays atomic: each concurrent lane owns a free internal
//! block, recorded in its flog slot. The write lands in that free
//! block first, then the flog pair is updated (body, then the sequence
//! number as the commit point), and finally the map entry is switched
//! to the new block. If the process dies anywhere in between, the next
//! open replays the flog and either completes or discards the remap.
//!
//! Entry points:
//!
//! - [`Btt::init`]: open a namespace, loading an existing layout or
//!   deferring creation to the first write.
//! - [`Btt::read`] / [`Btt::write`]: single-block I/O, callable
//!   concurrently from distinct lanes.
//! - [`Btt::set_zero`] / [`Btt::set_error`]: per-block flag updates.
//! - [`Btt::check`]: offline consistency scan.
//! - [`Btt::nlane`] / [`Btt::nlba`]: concurrency and capacity limits.
//!
//! Runtime state is freed on drop; the namespace itself is never
//! resized or truncated.

mod arena;
mod check;
mod layout;

use arena::Arena;
pub use btt_error::{BttError, Result};
pub use btt_ns::{FileNamespace, MappedRange, MemNamespace, Namespace};
pub use btt_ondisk::{
    ArenaInfo, FlogEntry, MapEntry, BTT_MAP_ENTRY_ERROR, BTT_MAP_ENTRY_LBA_MASK,
    BTT_MAP_ENTRY_ZERO,
};
pub use btt_types::{
    ByteOffset, Lane, BTTINFO_FLAG_ERROR, BTTINFO_FLAG_ERROR_MASK, BTT_DEFAULT_NFREE,
    BTT_MAX_ARENA, BTT_MIN_SIZE,
};

use layout::LayoutState;
use parking_lot::Mutex;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Construction parameters for a BTT instance.
///
/// The defaults carry the production layout constants; `arena_max`,
/// `arena_min`, and `nfree` exist so tests can lay out small namespaces
/// without gigabytes of backing store. Layout parameters must match
/// whatever is already on media and never change after first write.
#[derive(Debug, Clone)]
pub struct BttOptions {
    /// Size of the namespace in bytes.
    pub rawsize: u64,
    /// External LBA size callers read and write.
    pub lbasize: u32,
    /// UUID of the containing namespace, stamped into every info block.
    pub parent_uuid: [u8; 16],
    /// Upper bound on the lane count; 0 means "no bound" and the lane
    /// count equals the free-block count.
    pub maxlane: u32,
    /// Largest size a single arena may occupy.
    pub arena_max: u64,
    /// Smallest namespace, and smallest trailing remainder that still
    /// becomes an arena.
    pub arena_min: u64,
    /// Free blocks per arena at layout creation.
    pub nfree: u32,
}

impl Default for BttOptions {
    fn default() -> Self {
        Self {
            rawsize: 0,
            lbasize: btt_types::BTT_MIN_LBA,
            parent_uuid: [0; 16],
            maxlane: 0,
            arena_max: BTT_MAX_ARENA,
            arena_min: BTT_MIN_SIZE,
            nfree: BTT_DEFAULT_NFREE,
        }
    }
}

/// An open BTT instance over a namespace.
///
/// All methods taking a [`Lane`] may be called concurrently as long as
/// every concurrent caller uses a distinct lane below [`Btt::nlane`].
pub struct Btt {
    ns: Arc<dyn Namespace>,
    rawsize: u64,
    lbasize: u32,
    parent_uuid: [u8; 16],
    arena_max: u64,
    arena_min: u64,
    nfree: u32,
    nlane: u32,
    nlba: u64,
    /// Serializes one-shot layout creation; `arenas` is the laidout
    /// flag (empty until a layout exists).
    layout_write_mutex: Mutex<()>,
    arenas: OnceLock<Vec<Arena>>,
}

impl Btt {
    /// Open a namespace, loading its layout if one exists.
    ///
    /// With no valid layout present the instance still computes the
    /// geometry a future layout would have, so `nlba` bounds checks
    /// work before any data exists; reads return zeros and the first
    /// write creates the layout.
    pub fn init(ns: Arc<dyn Namespace>, opts: BttOptions) -> Result<Self> {
        if opts.rawsize < opts.arena_min {
            return Err(BttError::NamespaceTooSmall {
                rawsize: opts.rawsize,
                min: opts.arena_min,
            });
        }

        let mut btt = Self {
            ns,
            rawsize: opts.rawsize,
            lbasize: opts.lbasize,
            parent_uuid: opts.parent_uuid,
            arena_max: opts.arena_max,
            arena_min: opts.arena_min,
            nfree: opts.nfree,
            nlane: 0,
            nlba: 0,
            layout_write_mutex: Mutex::new(()),
            arenas: OnceLock::new(),
        };

        match layout::read_layout(&*btt.ns, Lane(0), btt.rawsize, btt.arena_min)? {
            LayoutState::Valid(infos) => {
                // Arenas may disagree on nfree; the instance adopts the
                // minimum so every runtime table stays in bounds.
                let mut nfree = btt.nfree;
                let mut nlba = 0_u64;
                for (_, inf) in &infos {
                    nfree = nfree.min(inf.nfree);
                    nlba += u64::from(inf.external_nlba);
                }
                btt.nfree = nfree;
                btt.nlba = nlba;

                let arenas = infos
                    .iter()
                    .map(|(off, inf)| Arena::load(&*btt.ns, Lane(0), *off, inf, nfree))
                    .collect::<Result<Vec<_>>>()?;
                let _ = btt.arenas.set(arenas);
            }
            LayoutState::None => {
                let geo = layout::compute_geometry(
                    btt.rawsize,
                    btt.lbasize,
                    btt.nfree,
                    btt.arena_max,
                    btt.arena_min,
                )?;
                btt.nlba = geo.total_nlba;
            }
        }

        btt.nlane = if opts.maxlane == 0 {
            btt.nfree
        } else {
            btt.nfree.min(opts.maxlane)
        };

        info!(
            target: "btt",
            event = "init",
            nlba = btt.nlba,
            nlane = btt.nlane,
            laidout = btt.laidout(),
        );
        Ok(btt)
    }

    /// Number of lanes: the number of threads that may enter this
    /// instance concurrently, each with a unique lane in `0..nlane`.
    #[must_use]
    pub fn nlane(&self) -> u32 {
        self.nlane
    }

    /// Number of usable external blocks.
    #[must_use]
    pub fn nlba(&self) -> u64 {
        self.nlba
    }

    /// External LBA size in bytes.
    #[must_use]
    pub fn lbasize(&self) -> u32 {
        self.lbasize
    }

    /// Whether the namespace currently carries a valid layout.
    #[must_use]
    pub fn laidout(&self) -> bool {
        self.arenas.get().is_some()
    }

    fn check_lane(&self, lane: Lane) -> Result<()> {
        if lane.0 >= self.nlane {
            return Err(BttError::LaneOutOfRange {
                lane: lane.0,
                nlane: self.nlane,
            });
        }
        Ok(())
    }

    fn check_lba(&self, lba: u64) -> Result<()> {
        if lba >= self.nlba {
            debug!(target: "btt", event = "lba_out_of_range", lba, nlba = self.nlba);
            return Err(BttError::LbaOutOfRange {
                lba,
                nlba: self.nlba,
            });
        }
        Ok(())
    }

    fn check_buf(&self, len: usize) -> Result<()> {
        if len != self.lbasize as usize {
            return Err(BttError::BadBufferLength {
                len,
                lbasize: self.lbasize,
            });
        }
        Ok(())
    }

    /// Resolve an external LBA to its arena and pre-map LBA. Arenas are
    /// ordered; the first whose running external count exceeds the LBA
    /// owns it.
    fn lba_to_arena_lba<'a>(&self, arenas: &'a [Arena], lba: u64) -> Result<(&'a Arena, u32)> {
        let mut remaining = lba;
        for arena in arenas {
            if remaining < u64::from(arena.external_nlba) {
                return Ok((arena, remaining as u32));
            }
            remaining -= u64::from(arena.external_nlba);
        }
        // Unreachable after check_lba; kept as an error rather than a
        // panic so a corrupted nlba cannot abort the caller.
        Err(BttError::LbaOutOfRange {
            lba,
            nlba: self.nlba,
        })
    }

    /// Create the layout if it does not exist yet (double-checked under
    /// the layout mutex) and return the arenas either way.
    fn ensure_layout(&self, lane: Lane) -> Result<&[Arena]> {
        if let Some(arenas) = self.arenas.get() {
            return Ok(arenas.as_slice());
        }

        let _guard = self.layout_write_mutex.lock();
        if self.arenas.get().is_none() {
            let geo = layout::compute_geometry(
                self.rawsize,
                self.lbasize,
                self.nfree,
                self.arena_max,
                self.arena_min,
            )?;
            let infos = layout::write_layout(
                &*self.ns,
                lane,
                &geo,
                self.lbasize,
                self.nfree,
                self.parent_uuid,
            )?;
            let arenas = infos
                .iter()
                .map(|(off, inf)| Arena::load(&*self.ns, lane, *off, inf, self.nfree))
                .collect::<Result<Vec<_>>>()?;
            let _ = self.arenas.set(arenas);
            info!(
                target: "btt::layout",
                event = "layout_written",
                narena = infos.len(),
                nlba = self.nlba,
            );
        }

        self.arenas.get().map(Vec::as_slice).ok_or_else(|| {
            BttError::Io(std::io::Error::other("layout creation left no arenas"))
        })
    }

    /// Read the block at `lba` into `buf` (`buf.len()` must equal the
    /// LBA size).
    ///
    /// Publishes the resolved internal block in the read tracking table
    /// for the duration of the data read, then re-reads the map entry;
    /// if a concurrent writer moved the block in between, the read
    /// adopts the new entry and retries. That closes the race between
    /// resolving the entry and guarding it.
    pub fn read(&self, lane: Lane, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;
        self.check_buf(buf.len())?;

        // No layout yet: every block reads as zeros.
        let Some(arenas) = self.arenas.get() else {
            buf.fill(0);
            return Ok(());
        };
        let (arena, premap_lba) = self.lba_to_arena_lba(arenas, lba)?;

        let mut entry = arena.read_map_entry(&*self.ns, lane, premap_lba)?;
        loop {
            if entry.is_error() {
                return Err(BttError::BadBlock { lba });
            }
            if entry.is_zero() {
                buf.fill(0);
                return Ok(());
            }

            // Flag bits are known clear here, so the raw entry is the
            // bare post-map LBA and cannot collide with the idle
            // sentinel.
            arena.rtt[lane.index()].store(entry.raw(), Ordering::SeqCst);
            fence(Ordering::SeqCst);

            let latest = match arena.read_map_entry(&*self.ns, lane, premap_lba) {
                Ok(latest) => latest,
                Err(err) => {
                    arena.rtt[lane.index()].store(MapEntry::RTT_IDLE, Ordering::SeqCst);
                    return Err(err);
                }
            };
            if latest == entry {
                break;
            }
            entry = latest;
        }

        let result = self
            .ns
            .read_at(lane, arena.data_block_offset(entry.postmap_lba()), buf);
        arena.rtt[lane.index()].store(MapEntry::RTT_IDLE, Ordering::SeqCst);
        result
    }

    /// Atomically write the block at `lba` from `buf` (`buf.len()` must
    /// equal the LBA size).
    ///
    /// On return the write is durable and the block will never read
    /// torn: the data goes to the lane's free block, the flog sequence
    /// write commits the remap, and the map entry follows. A crash
    /// before the sequence write leaves the old contents; after it, the
    /// new contents (the map is rolled forward on the next open if
    /// needed).
    pub fn write(&self, lane: Lane, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;
        self.check_buf(buf.len())?;

        // First write through here creates the metadata layout.
        let arenas = match self.arenas.get() {
            Some(arenas) => arenas.as_slice(),
            None => self.ensure_layout(lane)?,
        };
        let (arena, premap_lba) = self.lba_to_arena_lba(arenas, lba)?;

        if arena.flags & BTTINFO_FLAG_ERROR_MASK != 0 {
            return Err(BttError::ArenaError { flags: arena.flags });
        }

        // The lane owns its free block exclusively; only outstanding
        // reads can still reference it. Wait for them to drain.
        let free_block = arena.free_block(lane);
        for slot in arena.rtt.iter().take(self.nlane as usize) {
            while slot.load(Ordering::SeqCst) == free_block {
                std::hint::spin_loop();
            }
        }

        self.ns
            .write_at(lane, arena.data_block_offset(free_block), buf)?;

        let (guard, old_entry) = arena.map_lock(&*self.ns, lane, premap_lba)?;
        if let Err(err) =
            arena.flog_update(&*self.ns, lane, premap_lba, old_entry.raw(), free_block)
        {
            // Abort: release the stripe without touching the entry.
            drop(guard);
            return Err(err);
        }
        arena.map_unlock(
            &*self.ns,
            lane,
            premap_lba,
            MapEntry::from_raw(free_block),
            guard,
        )
    }

    /// Make `lba` read as zeros.
    ///
    /// A no-op on an unlaid-out namespace, where every block already
    /// reads as zeros.
    pub fn set_zero(&self, lane: Lane, lba: u64) -> Result<()> {
        self.map_entry_set_flag(lane, lba, BTT_MAP_ENTRY_ZERO)
    }

    /// Make `lba` fail reads with an I/O error until it is rewritten.
    ///
    /// Forces layout creation on an unlaid-out namespace, since the
    /// flag has to be persisted.
    pub fn set_error(&self, lane: Lane, lba: u64) -> Result<()> {
        self.map_entry_set_flag(lane, lba, BTT_MAP_ENTRY_ERROR)
    }

    fn map_entry_set_flag(&self, lane: Lane, lba: u64, flag: u32) -> Result<()> {
        self.check_lane(lane)?;
        self.check_lba(lba)?;

        let arenas = match self.arenas.get() {
            Some(arenas) => arenas.as_slice(),
            None if flag == BTT_MAP_ENTRY_ZERO => return Ok(()),
            None => self.ensure_layout(lane)?,
        };
        let (arena, premap_lba) = self.lba_to_arena_lba(arenas, lba)?;

        if arena.flags & BTTINFO_FLAG_ERROR_MASK != 0 {
            return Err(BttError::ArenaError { flags: arena.flags });
        }

        let (guard, old_entry) = arena.map_lock(&*self.ns, lane, premap_lba)?;
        if flag == BTT_MAP_ENTRY_ZERO && old_entry.is_zero() {
            // Already zero; release without writing.
            drop(guard);
            return Ok(());
        }
        arena.map_unlock(&*self.ns, lane, premap_lba, old_entry.with_flag(flag), guard)
    }

    /// Consistency check: within each arena, every internal block must
    /// be referenced exactly once across the map and the flog free
    /// blocks.
    ///
    /// Returns `Ok(false)` for an inconsistent layout; errors are
    /// reserved for namespace I/O failures. Takes `&mut self` because
    /// all other operations must be quiesced for the scan to be
    /// meaningful.
    pub fn check(&mut self) -> Result<bool> {
        let Some(arenas) = self.arenas.get() else {
            // Consistent by definition: nothing on media yet.
            return Ok(true);
        };

        let mut consistent = true;
        for arena in arenas {
            if !check::check_arena(&*self.ns, arena)? {
                consistent = false;
            }
        }
        Ok(consistent)
    }
}

impl std::fmt::Debug for Btt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btt")
            .field("rawsize", &self.rawsize)
            .field("lbasize", &self.lbasize)
            .field("nfree", &self.nfree)
            .field("nlane", &self.nlane)
            .field("nlba", &self.nlba)
            .field("laidout", &self.laidout())
            .finish_non_exhaustive()
    }
}
