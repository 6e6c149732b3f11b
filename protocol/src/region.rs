// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared region accessor
//!
//! Maps a file-backed shared memory object (for example `/dev/shm/lg-stream`
//! or an IVSHMEM BAR exposed through sysfs) and provides:
//!
//! - bounds checked access to the usable part of the mapping
//! - a per-process peer ID, claimed in a small peer table and kept alive by
//!   a heartbeat counter
//! - doorbells: per-peer, per-channel counters that another peer can ring
//! - [`RegionEvent`]s, manual-reset events backed by a doorbell counter
//!
//! The peer table and doorbell counters live in a transport block in the last
//! page of the mapping. Producers re-initialize the protocol header at the
//! start of the region freely without disturbing peer registration.
//!
//! Peers may live on opposite sides of a VM or container boundary, so
//! liveness is judged only from state inside the region: an owner bumps its
//! entry's heartbeat every [`HEARTBEAT_INTERVAL`] while mapped, and an entry
//! whose heartbeat stays still for [`PEER_STALE_AFTER`] may be reclaimed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use memmap2::MmapMut;

use crate::descriptor::Pod;
use crate::futex::{futex_wait, futex_wake};

/// Bytes reserved at the end of the mapping for the transport block
pub const TRANSPORT_BLOCK_SIZE: usize = 4096;

/// Maximum number of peers attached to one region
pub const MAX_PEERS: usize = 8;

/// Doorbell channels per peer
pub const MAX_CHANNELS: u32 = 4;

/// Smallest mapping accepted by default
pub const DEFAULT_MIN_SIZE: usize = 2 * TRANSPORT_BLOCK_SIZE;

/// Peer identifier, 1-based. 0 means no peer.
pub type PeerId = u32;

/// Peer ID value meaning "no peer"
pub const NO_PEER: PeerId = 0;

/// How often a mapped peer bumps its heartbeat
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// An occupied peer entry whose heartbeat does not move for this long is
/// considered abandoned
pub const PEER_STALE_AFTER: Duration = Duration::from_secs(1);

#[repr(C)]
struct TransportBlock {
    /// Owner token per peer entry, 0 when free
    peers: [AtomicU32; MAX_PEERS],
    /// Heartbeat counters, bumped by each entry's owner while mapped
    heartbeats: [AtomicU32; MAX_PEERS],
    /// Doorbell counters, indexed by peer entry then channel
    doorbells: [[AtomicU32; MAX_CHANNELS as usize]; MAX_PEERS],
}

const _: () = assert!(std::mem::size_of::<TransportBlock>() <= TRANSPORT_BLOCK_SIZE);

/// Region errors
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("Shared memory object not found: {0}")]
    NotFound(PathBuf),

    #[error("Shared memory object is {size} bytes, need at least {min}")]
    TooSmall { size: u64, min: usize },

    #[error("Failed to map shared memory: {0}")]
    Map(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Shared region is not initialized")]
    NotInitialized,

    #[error("No free peer entry in the shared region")]
    NoFreePeer,

    #[error("Peer {0} is not attached")]
    PeerNotAttached(PeerId),

    #[error("Invalid doorbell channel {0}")]
    InvalidChannel(u32),

    #[error("Range {offset:#x}+{len} is outside the {size} byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Offset {offset:#x} is not aligned to {align} bytes")]
    Misaligned { offset: usize, align: usize },
}

/// Result of a successful [`RegionEvent::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    Timeout,
}

/// Wait failure
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The accessor backing the event was deinitialized
    #[error("Wait abandoned, region was deinitialized")]
    Abandoned,

    #[error("Wait failed: {0}")]
    Failed(#[source] io::Error),
}

/// One live mapping plus the peer entry claimed through it
struct Mapping {
    _mmap: MmapMut,
    base: NonNull<u8>,
    /// Bytes before the transport block
    capacity: usize,
    peer_index: usize,
    token: u32,
    detached: AtomicBool,
}

// SAFETY: the mapping is process-shared memory; every access goes through
// atomics or through bounds checked raw copies, never through Rust references
// that assume exclusive ownership.
unsafe impl Send for Mapping {}
// SAFETY: see above.
unsafe impl Sync for Mapping {}

impl TransportBlock {
    fn claim_free(&self, token: u32) -> Option<usize> {
        self.peers.iter().position(|entry| {
            entry
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Claim a free entry, or failing that one whose owner stopped beating
    fn claim_peer(&self, token: u32) -> Result<usize, RegionError> {
        if let Some(index) = self.claim_free(token) {
            self.heartbeats[index].fetch_add(1, Ordering::Release);
            return Ok(index);
        }

        let before: [(u32, u32); MAX_PEERS] = std::array::from_fn(|index| {
            (
                self.peers[index].load(Ordering::Acquire),
                self.heartbeats[index].load(Ordering::Acquire),
            )
        });
        debug!("Peer table full, watching heartbeats for {PEER_STALE_AFTER:?}");
        thread::sleep(PEER_STALE_AFTER);

        for (index, (owner, beat)) in before.into_iter().enumerate() {
            if self.heartbeats[index].load(Ordering::Acquire) != beat {
                continue;
            }
            if self.peers[index]
                .compare_exchange(owner, token, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.heartbeats[index].fetch_add(1, Ordering::Release);
                if owner != 0 {
                    debug!("Reclaimed peer entry {index} from unresponsive owner {owner:#x}");
                }
                return Ok(index);
            }
        }
        Err(RegionError::NoFreePeer)
    }
}

impl Mapping {
    fn transport(&self) -> &TransportBlock {
        // SAFETY: `capacity` is 64-byte aligned and at least
        // TRANSPORT_BLOCK_SIZE bytes remain after it (checked in `map`); the
        // block holds only atomics so shared references are sound.
        unsafe { &*(self.base.as_ptr().add(self.capacity) as *const TransportBlock) }
    }

    fn map(file: &File, len: usize) -> Result<Self, RegionError> {
        // SAFETY: the file is opened read/write and other peers modify the
        // contents concurrently; all accesses below are raw copies or
        // atomics, never long-lived references into the mapping.
        let mut mmap = unsafe { MmapMut::map_mut(file) }.map_err(RegionError::Map)?;
        let base = NonNull::new(mmap.as_mut_ptr())
            .ok_or_else(|| RegionError::Map(io::Error::other("null mapping")))?;
        let capacity = (len - TRANSPORT_BLOCK_SIZE) & !63;
        let token = std::process::id().max(1);

        // SAFETY: same placement as `transport()`; the mapping stays alive
        // for the duration of this borrow.
        let transport = unsafe { &*(base.as_ptr().add(capacity) as *const TransportBlock) };
        let peer_index = transport.claim_peer(token)?;

        Ok(Mapping {
            _mmap: mmap,
            base,
            capacity,
            peer_index,
            token,
            detached: AtomicBool::new(false),
        })
    }

    fn beat(&self) {
        self.transport().heartbeats[self.peer_index].fetch_add(1, Ordering::Release);
    }

    fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake anything still blocked on this peer's doorbells so it observes
        // the detach instead of sleeping out its timeout.
        for bell in &self.transport().doorbells[self.peer_index] {
            bell.fetch_add(1, Ordering::Release);
            if let Err(e) = futex_wake(bell) {
                warn!("Failed to wake doorbell waiters: {e}");
            }
        }

        let _ = self.transport().peers[self.peer_index].compare_exchange(
            self.token,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(RegionError::OutOfBounds {
                offset,
                len,
                size: self.capacity,
            }),
        }
    }

    fn doorbell(&self, peer_index: usize, channel: u32) -> Result<&AtomicU32, RegionError> {
        if channel >= MAX_CHANNELS {
            return Err(RegionError::InvalidChannel(channel));
        }
        Ok(&self.transport().doorbells[peer_index][channel as usize])
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Bump the heartbeat until the mapping is detached or dropped
fn heartbeat_loop(mapping: &Weak<Mapping>) {
    loop {
        match mapping.upgrade() {
            Some(mapping) if !mapping.detached.load(Ordering::Acquire) => mapping.beat(),
            _ => return,
        }
        thread::park_timeout(HEARTBEAT_INTERVAL);
    }
}

/// Lifecycle owner of a region mapping.
///
/// `initialize` and `deinitialize` are idempotent and may be called in any
/// order; a failed `initialize` leaves the accessor uninitialized.
pub struct SharedRegion {
    path: PathBuf,
    min_size: usize,
    mapping: Option<Arc<Mapping>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl SharedRegion {
    /// Create an uninitialized accessor for the object at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            min_size: DEFAULT_MIN_SIZE,
            mapping: None,
            heartbeat: None,
        }
    }

    /// Require the object to be at least `min_size` bytes
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size.max(DEFAULT_MIN_SIZE);
        self
    }

    /// Object size whose usable part holds at least `usable` bytes
    pub fn required_size(usable: usize) -> usize {
        crate::layout::align_up(usable, TRANSPORT_BLOCK_SIZE) + TRANSPORT_BLOCK_SIZE
    }

    /// Open and map an existing object
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegionError> {
        let mut region = Self::new(path);
        region.initialize()?;
        Ok(region)
    }

    /// Create the backing file (or grow an existing one) to `size` bytes,
    /// then map it. An existing larger file is never shrunk so a peer
    /// already mapping it is unaffected.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }
        drop(file);

        let mut region = Self::new(path).with_min_size(size);
        region.initialize()?;
        Ok(region)
    }

    /// Map the object and claim a peer entry. Re-initializing an
    /// initialized accessor releases the previous mapping first.
    pub fn initialize(&mut self) -> Result<(), RegionError> {
        self.deinitialize();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RegionError::NotFound(self.path.clone()),
                _ => RegionError::Io(e),
            })?;

        let len = file.metadata()?.len();
        if len < self.min_size as u64 {
            return Err(RegionError::TooSmall {
                size: len,
                min: self.min_size,
            });
        }
        let len = usize::try_from(len).map_err(|_| RegionError::TooSmall {
            size: len,
            min: self.min_size,
        })?;

        let mapping = Arc::new(Mapping::map(&file, len)?);
        let weak = Arc::downgrade(&mapping);
        let heartbeat = thread::Builder::new()
            .name("lg-heartbeat".to_string())
            .spawn(move || heartbeat_loop(&weak))?;

        info!(
            "Mapped shared region {} ({} bytes usable) as peer {}",
            self.path.display(),
            mapping.capacity,
            mapping.peer_index + 1
        );
        self.mapping = Some(mapping);
        self.heartbeat = Some(heartbeat);
        Ok(())
    }

    /// Detach from the region. Waiters on this accessor's events observe
    /// [`WaitError::Abandoned`]; the mapping itself is unmapped once the last
    /// [`RegionView`] is dropped.
    pub fn deinitialize(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            mapping.detach();
            debug!("Detached from shared region {}", self.path.display());
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.thread().unpark();
            if heartbeat.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a cloneable handle to the mapped memory
    pub fn view(&self) -> Result<RegionView, RegionError> {
        self.mapping
            .as_ref()
            .map(|mapping| RegionView {
                mapping: Arc::clone(mapping),
            })
            .ok_or(RegionError::NotInitialized)
    }

    pub fn peer_id(&self) -> Result<PeerId, RegionError> {
        self.view().map(|view| view.peer_id())
    }

    pub fn size(&self) -> Result<usize, RegionError> {
        self.view().map(|view| view.size())
    }

    pub fn create_event(&self, channel: u32) -> Result<RegionEvent, RegionError> {
        self.view()?.create_event(channel)
    }

    pub fn ring_doorbell(&self, peer: PeerId, channel: u32) -> Result<(), RegionError> {
        self.view()?.ring_doorbell(peer, channel)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Cloneable handle to a mapped region
#[derive(Clone)]
pub struct RegionView {
    mapping: Arc<Mapping>,
}

impl std::fmt::Debug for RegionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionView")
            .field("size", &self.mapping.capacity)
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

impl RegionView {
    /// Usable size in bytes (the transport block is excluded)
    pub fn size(&self) -> usize {
        self.mapping.capacity
    }

    /// This process's peer ID
    pub fn peer_id(&self) -> PeerId {
        self.mapping.peer_index as PeerId + 1
    }

    /// True once the owning [`SharedRegion`] was deinitialized
    pub fn is_detached(&self) -> bool {
        self.mapping.detached.load(Ordering::Acquire)
    }

    /// Bounds check a byte range
    pub fn check_range(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        self.mapping.check_range(offset, len)
    }

    /// Shared 32-bit atomic at `offset`
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32, RegionError> {
        if offset % 4 != 0 {
            return Err(RegionError::Misaligned { offset, align: 4 });
        }
        self.check_range(offset, 4)?;
        // SAFETY: in bounds and 4-byte aligned (the mapping base is page
        // aligned); AtomicU32 has the layout of u32 and shared mutation
        // through it is sound.
        Ok(unsafe { &*(self.mapping.base.as_ptr().add(offset) as *const AtomicU32) })
    }

    /// Copy a plain-old-data value out of the region
    pub fn read<T: Pod>(&self, offset: usize) -> Result<T, RegionError> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        // SAFETY: in bounds; T is Pod so any bit pattern is valid and an
        // unaligned read is fine.
        Ok(unsafe { std::ptr::read_unaligned(self.mapping.base.as_ptr().add(offset) as *const T) })
    }

    /// Copy a plain-old-data value into the region
    pub fn write<T: Pod>(&self, offset: usize, value: &T) -> Result<(), RegionError> {
        self.check_range(offset, std::mem::size_of::<T>())?;
        // SAFETY: in bounds; T is Pod and the destination is plain shared
        // memory with no Rust references outstanding over it.
        unsafe {
            std::ptr::write_unaligned(self.mapping.base.as_ptr().add(offset) as *mut T, *value);
        }
        Ok(())
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], RegionError> {
        self.check_range(offset, len)?;
        // SAFETY: in bounds and the mapping outlives the borrow of `self`.
        // The producer only rewrites ranges the consumer has completed.
        Ok(unsafe { std::slice::from_raw_parts(self.mapping.base.as_ptr().add(offset), len) })
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the range under the stream protocol: no other
    /// slice (in this or another process) may access it while the returned
    /// slice is alive.
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8], RegionError> {
        self.check_range(offset, len)?;
        // SAFETY: in bounds; exclusivity is guaranteed by the caller.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.mapping.base.as_ptr().add(offset), len) })
    }

    /// Copy `src` into the region at `offset`
    pub fn copy_in(&self, offset: usize, src: &[u8]) -> Result<(), RegionError> {
        self.check_range(offset, src.len())?;
        // SAFETY: in bounds; `src` is a Rust slice and cannot alias the
        // mapping, both pointers are valid for `src.len()` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.mapping.base.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Zero `len` bytes at `offset`
    pub fn zero(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        self.check_range(offset, len)?;
        // SAFETY: in bounds; zero is a valid value for every protocol field.
        unsafe {
            std::ptr::write_bytes(self.mapping.base.as_ptr().add(offset), 0, len);
        }
        Ok(())
    }

    /// True if `peer` currently owns its entry. A peer that exits without
    /// detaching stays attached until its entry is reclaimed.
    pub fn is_peer_attached(&self, peer: PeerId) -> bool {
        let Some(index) = (peer as usize).checked_sub(1).filter(|i| *i < MAX_PEERS) else {
            return false;
        };
        self.mapping.transport().peers[index].load(Ordering::Acquire) != 0
    }

    /// Signal `channel` of `peer`. Fails if the peer is not attached or the
    /// channel is out of range.
    pub fn ring_doorbell(&self, peer: PeerId, channel: u32) -> Result<(), RegionError> {
        if channel >= MAX_CHANNELS {
            return Err(RegionError::InvalidChannel(channel));
        }
        if !self.is_peer_attached(peer) {
            return Err(RegionError::PeerNotAttached(peer));
        }
        let bell = self.mapping.doorbell(peer as usize - 1, channel)?;
        bell.fetch_add(1, Ordering::Release);
        futex_wake(bell)?;
        Ok(())
    }

    /// Create an event signaled by doorbell rings on this peer's `channel`.
    /// The event starts unsignaled.
    pub fn create_event(&self, channel: u32) -> Result<RegionEvent, RegionError> {
        let seen = self
            .mapping
            .doorbell(self.mapping.peer_index, channel)?
            .load(Ordering::Acquire);
        Ok(RegionEvent {
            mapping: Arc::clone(&self.mapping),
            channel,
            seen,
        })
    }
}

/// Manual-reset event backed by one of this peer's doorbells.
///
/// Signaled whenever the doorbell has been rung since the last
/// [`reset`](RegionEvent::reset); stays signaled until reset.
pub struct RegionEvent {
    mapping: Arc<Mapping>,
    channel: u32,
    seen: u32,
}

impl RegionEvent {
    fn counter(&self) -> &AtomicU32 {
        &self.mapping.transport().doorbells[self.mapping.peer_index][self.channel as usize]
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn is_signaled(&self) -> bool {
        self.counter().load(Ordering::Acquire) != self.seen
    }

    /// Clear the signaled state
    pub fn reset(&mut self) {
        self.seen = self.counter().load(Ordering::Acquire);
    }

    /// Wait until signaled or until `timeout` elapses. Does not reset.
    pub fn wait(&self, timeout: Duration) -> Result<WaitStatus, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.mapping.detached.load(Ordering::Acquire) {
                return Err(WaitError::Abandoned);
            }

            let current = self.counter().load(Ordering::Acquire);
            if current != self.seen {
                return Ok(WaitStatus::Signaled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitStatus::Timeout);
            }

            futex_wait(self.counter(), current, deadline - now).map_err(WaitError::Failed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION_SIZE: usize = 64 * 1024;

    fn temp_region() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        (dir, path)
    }

    #[test]
    fn test_create_and_open() {
        let (_dir, path) = temp_region();
        let producer = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let consumer = SharedRegion::open(&path).unwrap();

        assert_eq!(producer.size().unwrap(), REGION_SIZE - TRANSPORT_BLOCK_SIZE);
        assert_ne!(producer.peer_id().unwrap(), NO_PEER);
        assert_ne!(producer.peer_id().unwrap(), consumer.peer_id().unwrap());
    }

    #[test]
    fn test_required_size_covers_usable() {
        let (_dir, path) = temp_region();
        let usable = 3 * TRANSPORT_BLOCK_SIZE + 17;
        let region = SharedRegion::create(&path, SharedRegion::required_size(usable)).unwrap();
        assert!(region.size().unwrap() >= usable);
    }

    #[test]
    fn test_open_missing_object() {
        let (_dir, path) = temp_region();
        let mut region = SharedRegion::new(&path);
        assert!(matches!(region.initialize(), Err(RegionError::NotFound(_))));
        assert!(!region.is_initialized());
        assert!(matches!(region.view(), Err(RegionError::NotInitialized)));

        // Safe after a failed initialize.
        region.deinitialize();
        region.deinitialize();
    }

    #[test]
    fn test_open_too_small() {
        let (_dir, path) = temp_region();
        std::fs::write(&path, [0u8; 128]).unwrap();
        let mut region = SharedRegion::new(&path);
        assert!(matches!(
            region.initialize(),
            Err(RegionError::TooSmall { size: 128, .. })
        ));

        let _producer = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let mut region = SharedRegion::new(&path).with_min_size(REGION_SIZE * 2);
        assert!(matches!(region.initialize(), Err(RegionError::TooSmall { .. })));
    }

    #[test]
    fn test_deinitialize_is_idempotent() {
        let (_dir, path) = temp_region();
        let mut region = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let view = region.view().unwrap();
        region.deinitialize();
        region.deinitialize();
        assert!(!region.is_initialized());
        assert!(view.is_detached());

        region.initialize().unwrap();
        assert!(region.is_initialized());
    }

    #[test]
    fn test_peer_entries_are_released() {
        let (_dir, path) = temp_region();
        let _owner = SharedRegion::create(&path, REGION_SIZE).unwrap();

        let mut regions = Vec::new();
        for _ in 1..MAX_PEERS {
            regions.push(SharedRegion::open(&path).unwrap());
        }
        assert!(matches!(SharedRegion::open(&path), Err(RegionError::NoFreePeer)));

        let freed = regions.pop().unwrap().peer_id().unwrap();
        let again = SharedRegion::open(&path).unwrap();
        assert_eq!(again.peer_id().unwrap(), freed);
    }

    /// Owner token standing in for a peer in another VM; no local process
    /// has this ID
    const FOREIGN_OWNER: u32 = 0x7FFF_FFF0;

    /// Occupy every free entry with a foreign owner
    fn occupy_free_entries(view: &RegionView) -> Vec<PeerId> {
        let transport = view.mapping.transport();
        let mut taken = Vec::new();
        for (index, entry) in transport.peers.iter().enumerate() {
            if entry
                .compare_exchange(0, FOREIGN_OWNER, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                taken.push(index as PeerId + 1);
            }
        }
        taken
    }

    #[test]
    fn test_live_foreign_peer_is_kept() {
        let (_dir, path) = temp_region();
        let owner = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let view = owner.view().unwrap();
        let foreign = occupy_free_entries(&view);
        assert_eq!(foreign.len(), MAX_PEERS - 1);

        let stop = Arc::new(AtomicBool::new(false));
        let beater = {
            let view = view.clone();
            let stop = stop.clone();
            let foreign = foreign.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    for peer in &foreign {
                        view.mapping.transport().heartbeats[*peer as usize - 1]
                            .fetch_add(1, Ordering::Release);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };

        // Fresh heartbeats keep the entries even though the owner is unknown
        // to this host.
        assert!(matches!(SharedRegion::open(&path), Err(RegionError::NoFreePeer)));
        assert!(view.is_peer_attached(foreign[0]));
        owner.ring_doorbell(foreign[0], 0).unwrap();

        stop.store(true, Ordering::Release);
        beater.join().unwrap();

        let reclaimed = SharedRegion::open(&path).unwrap();
        assert!(foreign.contains(&reclaimed.peer_id().unwrap()));
    }

    #[test]
    fn test_heartbeat_advances_while_mapped() {
        let (_dir, path) = temp_region();
        let mut region = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let view = region.view().unwrap();
        let index = view.peer_id() as usize - 1;
        let beat = || view.mapping.transport().heartbeats[index].load(Ordering::Acquire);

        let first = beat();
        thread::sleep(HEARTBEAT_INTERVAL * 3);
        assert_ne!(beat(), first);

        region.deinitialize();
        let stopped = beat();
        thread::sleep(HEARTBEAT_INTERVAL * 3);
        assert_eq!(beat(), stopped);
    }

    #[test]
    fn test_read_write_bounds() {
        let (_dir, path) = temp_region();
        let region = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let view = region.view().unwrap();
        let size = view.size();

        view.copy_in(16, b"hello").unwrap();
        assert_eq!(view.bytes(16, 5).unwrap(), b"hello");
        view.zero(16, 5).unwrap();
        assert_eq!(view.bytes(16, 5).unwrap(), &[0u8; 5]);

        assert!(matches!(
            view.bytes(size - 2, 4),
            Err(RegionError::OutOfBounds { .. })
        ));
        assert!(matches!(
            view.copy_in(usize::MAX, b"x"),
            Err(RegionError::OutOfBounds { .. })
        ));
        assert!(matches!(
            view.atomic_u32(6),
            Err(RegionError::Misaligned { offset: 6, align: 4 })
        ));

        view.atomic_u32(8).unwrap().store(42, Ordering::Release);
        let other = SharedRegion::open(&path).unwrap();
        let other_view = other.view().unwrap();
        assert_eq!(other_view.atomic_u32(8).unwrap().load(Ordering::Acquire), 42);
    }

    #[test]
    fn test_doorbell_signals_event() {
        let (_dir, path) = temp_region();
        let producer = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let consumer = SharedRegion::open(&path).unwrap();

        let mut event = consumer.create_event(1).unwrap();
        assert!(!event.is_signaled());
        assert_eq!(event.wait(Duration::from_millis(5)).unwrap(), WaitStatus::Timeout);

        producer
            .ring_doorbell(consumer.peer_id().unwrap(), 1)
            .unwrap();
        assert!(event.is_signaled());
        assert_eq!(event.wait(Duration::ZERO).unwrap(), WaitStatus::Signaled);

        // Manual reset: still signaled until reset.
        assert_eq!(event.wait(Duration::ZERO).unwrap(), WaitStatus::Signaled);
        event.reset();
        assert!(!event.is_signaled());

        // Other channels are independent.
        producer
            .ring_doorbell(consumer.peer_id().unwrap(), 0)
            .unwrap();
        assert!(!event.is_signaled());
    }

    #[test]
    fn test_doorbell_wakes_waiter() {
        let (_dir, path) = temp_region();
        let producer = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let consumer = SharedRegion::open(&path).unwrap();
        let event = consumer.create_event(0).unwrap();
        let target = consumer.peer_id().unwrap();

        let view = producer.view().unwrap();
        let ringer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            view.ring_doorbell(target, 0).unwrap();
        });

        assert_eq!(event.wait(Duration::from_secs(5)).unwrap(), WaitStatus::Signaled);
        ringer.join().unwrap();
    }

    #[test]
    fn test_doorbell_errors() {
        let (_dir, path) = temp_region();
        let producer = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let mut consumer = SharedRegion::open(&path).unwrap();
        let target = consumer.peer_id().unwrap();

        assert!(matches!(
            producer.ring_doorbell(target, MAX_CHANNELS),
            Err(RegionError::InvalidChannel(_))
        ));
        assert!(matches!(
            producer.ring_doorbell(NO_PEER, 0),
            Err(RegionError::PeerNotAttached(NO_PEER))
        ));
        assert!(matches!(
            producer.ring_doorbell(MAX_PEERS as PeerId + 1, 0),
            Err(RegionError::PeerNotAttached(_))
        ));

        consumer.deinitialize();
        assert!(matches!(
            producer.ring_doorbell(target, 0),
            Err(RegionError::PeerNotAttached(_))
        ));
    }

    #[test]
    fn test_deinitialize_abandons_waiters() {
        let (_dir, path) = temp_region();
        let mut region = SharedRegion::create(&path, REGION_SIZE).unwrap();
        let event = region.create_event(2).unwrap();

        let waiter = thread::spawn(move || event.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        region.deinitialize();

        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(WaitError::Abandoned)));
    }
}
