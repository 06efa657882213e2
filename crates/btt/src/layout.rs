//! Layout detection, geometry computation, and initial-layout writing.
//!
//! A namespace is partitioned into arenas of at most `arena_max` bytes;
//! a trailing remainder becomes a final arena iff it is at least
//! `arena_min`. Inside an arena, regions run: info block, data, map,
//! flog, backup info block. All on-media offsets are arena-relative;
//! the runtime converts them to absolute on load.

use btt_error::{BttError, Result};
use btt_ns::Namespace;
use btt_ondisk::{ArenaInfo, FlogEntry, MapEntry, BTT_FLOG_PAIR_STRIDE, BTT_MAP_ENTRY_ZERO};
use btt_types::{
    round_up, ByteOffset, Lane, BTTINFO_MAJOR_VERSION, BTTINFO_MINOR_VERSION, BTT_ALIGNMENT,
    BTT_INFO_SIZE, BTT_INTERNAL_LBA_ALIGNMENT, BTT_MAP_ENTRY_SIZE, BTT_MIN_LBA,
};
use tracing::{debug, trace};

/// Computed shape of one arena, before or after it exists on media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArenaGeometry {
    /// Absolute offset of the arena in the namespace.
    pub startoff: ByteOffset,
    /// Bytes this arena occupies.
    pub arena_size: u64,
    /// Arena-relative offset of the next arena; 0 for the last.
    pub nextoff: u64,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    pub external_nlba: u32,
    /// Arena-relative region offsets.
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Geometry {
    pub arenas: Vec<ArenaGeometry>,
    pub total_nlba: u64,
}

/// Outcome of scanning a namespace for an existing layout.
pub(crate) enum LayoutState {
    /// Every info block in the chain validated.
    Valid(Vec<(ByteOffset, ArenaInfo)>),
    /// No layout; reads return zeros until the first write creates one.
    None,
}

fn short_arena_err(rawsize: u64, min: u64) -> BttError {
    BttError::NamespaceTooSmall { rawsize, min }
}

/// Compute the deterministic layout a fresh namespace of `rawsize`
/// bytes would receive. Pure; performs no I/O.
pub(crate) fn compute_geometry(
    rawsize: u64,
    lbasize: u32,
    nfree: u32,
    arena_max: u64,
    arena_min: u64,
) -> Result<Geometry> {
    let flog_size = round_up(u64::from(nfree) * BTT_FLOG_PAIR_STRIDE, BTT_ALIGNMENT);
    let internal_lbasize = round_up(
        u64::from(lbasize.max(BTT_MIN_LBA)),
        u64::from(BTT_INTERNAL_LBA_ALIGNMENT),
    );

    let mut arenas = Vec::new();
    let mut total_nlba = 0_u64;
    let mut remaining = rawsize;
    let mut startoff = ByteOffset::ZERO;

    while remaining >= arena_min {
        let arena_size = remaining.min(arena_max);
        remaining -= arena_size;

        let arena_datasize = arena_size
            .checked_sub(2 * BTT_INFO_SIZE)
            .and_then(|size| size.checked_sub(flog_size))
            .and_then(|size| size.checked_sub(BTT_ALIGNMENT))
            .ok_or_else(|| short_arena_err(arena_size, arena_min))?;

        let internal_nlba = arena_datasize / (internal_lbasize + BTT_MAP_ENTRY_SIZE);
        let external_nlba = internal_nlba
            .checked_sub(u64::from(nfree))
            .ok_or_else(|| short_arena_err(arena_size, arena_min))?;
        if external_nlba == 0 {
            return Err(short_arena_err(arena_size, arena_min));
        }

        let mapsize = round_up(external_nlba * BTT_MAP_ENTRY_SIZE, BTT_ALIGNMENT);
        let nextoff = if remaining >= arena_min { arena_size } else { 0 };
        let infooff = arena_size - BTT_INFO_SIZE;
        let flogoff = infooff - flog_size;
        let mapoff = flogoff - mapsize;
        let dataoff = BTT_INFO_SIZE;

        debug!(
            target: "btt::layout",
            event = "arena_geometry",
            arena = arenas.len(),
            arena_size,
            internal_nlba,
            external_nlba,
            dataoff,
            mapoff,
            flogoff,
            infooff,
        );

        total_nlba += external_nlba;
        arenas.push(ArenaGeometry {
            startoff,
            arena_size,
            nextoff,
            internal_lbasize: internal_lbasize as u32,
            internal_nlba: internal_nlba as u32,
            external_nlba: external_nlba as u32,
            dataoff,
            mapoff,
            flogoff,
            infooff,
        });
        startoff = startoff.add(arena_size);
    }

    if arenas.is_empty() {
        return Err(short_arena_err(rawsize, arena_min));
    }

    Ok(Geometry { arenas, total_nlba })
}

/// Scan the namespace for an existing layout.
///
/// A first info block that fails validation means "unlaid-out", never a
/// hard error; only namespace I/O failures propagate.
pub(crate) fn read_layout(
    ns: &dyn Namespace,
    lane: Lane,
    rawsize: u64,
    arena_min: u64,
) -> Result<LayoutState> {
    let mut infos = Vec::new();
    let mut remaining = rawsize;
    let mut arena_off = ByteOffset::ZERO;

    while remaining >= arena_min {
        let mut block = vec![0_u8; BTT_INFO_SIZE as usize];
        ns.read_at(lane, arena_off, &mut block)?;

        let info = match ArenaInfo::decode(&block) {
            Ok(info) => info,
            Err(err) => {
                debug!(
                    target: "btt::layout",
                    event = "no_layout",
                    arena = infos.len(),
                    reason = %err,
                );
                return Ok(LayoutState::None);
            }
        };

        let nextoff = info.nextoff;
        infos.push((arena_off, info));
        if nextoff == 0 {
            break;
        }
        arena_off = arena_off.add(nextoff);
        match remaining.checked_sub(nextoff) {
            Some(rest) => remaining = rest,
            None => break,
        }
    }

    if infos.is_empty() {
        return Ok(LayoutState::None);
    }
    Ok(LayoutState::Valid(infos))
}

fn zero_length_window() -> BttError {
    BttError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "namespace returned a zero-length map window",
    ))
}

/// Write the identity map for one arena through mapped windows.
fn write_initial_map(
    ns: &dyn Namespace,
    lane: Lane,
    geo: &ArenaGeometry,
) -> Result<()> {
    let mut premap = 0_u32;
    let mut off = geo.startoff.add(geo.mapoff);

    while premap < geo.external_nlba {
        let wanted = (geo.external_nlba - premap) as usize * BTT_MAP_ENTRY_SIZE as usize;
        let mut window = ns.map_at(lane, off, wanted)?;
        let usable = window.len() / BTT_MAP_ENTRY_SIZE as usize;
        if usable == 0 {
            return Err(zero_length_window());
        }

        let bytes = window.as_mut_slice();
        for slot in 0..usable {
            let entry = MapEntry::identity(premap + slot as u32);
            bytes[slot * 4..slot * 4 + 4].copy_from_slice(&entry.encode());
        }
        ns.sync_range(lane, &window)?;

        premap += usable as u32;
        off = off.add(usable as u64 * BTT_MAP_ENTRY_SIZE);
    }
    Ok(())
}

/// Write the initial flog for one arena: each pair's first half holds
/// `old = new = free block | ZERO` at sequence 1, second half all zeros.
fn write_initial_flog(
    ns: &dyn Namespace,
    lane: Lane,
    geo: &ArenaGeometry,
    nfree: u32,
) -> Result<()> {
    let mut entry_off = geo.startoff.add(geo.flogoff);
    for slot in 0..nfree {
        let free = (geo.external_nlba + slot) | BTT_MAP_ENTRY_ZERO;
        let initial = FlogEntry {
            lba: 0,
            old_map: free,
            new_map: free,
            seq: 1,
        };
        trace!(
            target: "btt::flog",
            event = "flog_init",
            slot,
            free = free & btt_ondisk::BTT_MAP_ENTRY_LBA_MASK,
        );
        ns.write_at(lane, entry_off, &initial.encode())?;
        ns.write_at(lane, entry_off.add(16), &[0_u8; 16])?;
        entry_off = entry_off.add(BTT_FLOG_PAIR_STRIDE);
    }
    Ok(())
}

/// Write a complete fresh layout: map, flog, then both info blocks.
///
/// The caller holds the layout-write mutex. A failure anywhere leaves
/// the namespace unlaid-out (the info blocks are written last), and a
/// later write retries from scratch.
pub(crate) fn write_layout(
    ns: &dyn Namespace,
    lane: Lane,
    geo: &Geometry,
    lbasize: u32,
    nfree: u32,
    parent_uuid: [u8; 16],
) -> Result<Vec<(ByteOffset, ArenaInfo)>> {
    let mut infos = Vec::with_capacity(geo.arenas.len());

    for arena in &geo.arenas {
        write_initial_map(ns, lane, arena)?;
        write_initial_flog(ns, lane, arena, nfree)?;

        let info = ArenaInfo {
            parent_uuid,
            flags: 0,
            major: BTTINFO_MAJOR_VERSION,
            minor: BTTINFO_MINOR_VERSION,
            external_lbasize: lbasize,
            external_nlba: arena.external_nlba,
            internal_lbasize: arena.internal_lbasize,
            internal_nlba: arena.internal_nlba,
            nfree,
            infosize: BTT_INFO_SIZE as u32,
            nextoff: arena.nextoff,
            dataoff: arena.dataoff,
            mapoff: arena.mapoff,
            flogoff: arena.flogoff,
            infooff: arena.infooff,
        };
        let block = info.encode();
        ns.write_at(lane, arena.startoff, &block)?;
        ns.write_at(lane, arena.startoff.add(arena.infooff), &block)?;

        debug!(
            target: "btt::layout",
            event = "arena_written",
            startoff = arena.startoff.0,
            external_nlba = arena.external_nlba,
        );
        infos.push((arena.startoff, info));
    }

    Ok(infos)
}
