//! Beacon reader — find the in-guest companion's shared-memory pages,
//! snapshot them tear-free, and decode the records inside.
//!
//! The companion publishes fixed-size page arrays ("categories") and a
//! single discovery page describing where each array lives.  The host
//! side never synchronizes with the writer: every raw page access is a
//! racy read, and the only defense is the per-page version pair checked
//! by [`vmlens_protocol::page_version`].
//!
//! The reader therefore works on **snapshots**: each refresh copies
//! every reachable page into a reader-owned buffer, validates the copy,
//! and commits it only when it improves on what is already held — a
//! torn read never overwrites a good copy.  Decoded views (PID
//! generations, process details, section/PTE maps) are served from the
//! snapshot, not from live memory.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

use vmlens_protocol::{self as proto, CameraStatus, Category, Record, PAGE_SIZE};

use crate::backend::{BackendError, MemoryBackend};

// ═══════════════════════════════════════════════════════════════════════
//  Errors and identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Errors from beacon discovery and the control channel.
#[derive(Error, Debug)]
pub enum BeaconError {
    /// No discovery page anywhere in the mapped region.  This is a hard
    /// failure — introspection is unavailable, not retryable.
    #[error("no discovery page found in {scanned:#x} bytes of mapped memory")]
    Unavailable { scanned: usize },

    /// The directory has no control page for the requested camera.
    #[error("camera {camera:?} has no control page in the directory")]
    NoControlPage { camera: CameraId },

    /// Backend access failed (read-only mapping, out of range, …).
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Which of the two camera channels to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CameraId {
    One,
    Two,
}

impl CameraId {
    /// The category holding this camera's data pages.
    pub fn data_category(self) -> Category {
        match self {
            CameraId::One => Category::Camera1,
            CameraId::Two => Category::Camera2,
        }
    }

    /// Index of this camera's page within [`Category::Control`].
    fn control_index(self) -> usize {
        match self {
            CameraId::One => 0,
            CameraId::Two => 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoded views
// ═══════════════════════════════════════════════════════════════════════

/// One PID snapshot generation, assembled from its pages in index order.
#[derive(Debug, Clone, Serialize)]
pub struct PidGeneration {
    pub generation: u32,
    /// Total PIDs the writer claims for this generation.
    pub total_pids: u32,
    /// PIDs recovered so far, page-index order preserved.
    pub pids: Vec<u32>,
    /// True when every page of the generation was observed tear-free in
    /// the most recent refresh pass and the counts add up.
    pub complete: bool,
}

/// Process details assembled from scan-category records.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub state: char,
    pub vsize_kb: u64,
    pub rss_kb: u64,
    pub start_time: u64,
    pub cpu_time: u64,
    pub exe_path: String,
}

impl ProcessInfo {
    fn from_entry(e: &proto::ProcessEntry) -> Self {
        Self {
            pid: e.pid,
            ppid: e.ppid,
            uid: e.uid,
            gid: e.gid,
            comm: e.comm_str().to_string(),
            state: e.state as char,
            vsize_kb: e.vsize_kb,
            rss_kb: e.rss_kb,
            start_time: e.start_time,
            cpu_time: e.cpu_time,
            exe_path: e.exe_path_str().to_string(),
        }
    }
}

/// One virtual-memory region of a camera target.
#[derive(Debug, Clone, Serialize)]
pub struct SectionInfo {
    pub pid: u32,
    pub va_start: u64,
    pub va_end: u64,
    pub perms: u32,
    pub path: String,
    /// Page sequence this section was last written under.
    pub sequence: u32,
}

/// Per-category health, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: u32,
    pub expected_pages: usize,
    pub reachable_pages: usize,
    pub valid_pages: usize,
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal snapshot state
// ═══════════════════════════════════════════════════════════════════════

/// Where each page of a category lives in the memory file.
struct CategoryMapping {
    /// Per-index file offset; `None` when the arithmetic offset falls
    /// outside the mapped region (guest not fully initialized).
    source_offsets: Vec<Option<u64>>,
}

impl CategoryMapping {
    fn reachable(&self) -> usize {
        self.source_offsets.iter().filter(|o| o.is_some()).count()
    }
}

/// Reader-owned copy of one category's pages.
struct CategorySnapshot {
    /// Contiguous page buffer, `pages * PAGE_SIZE` bytes.
    data: Vec<u8>,
    valid: Vec<bool>,
    versions: Vec<u32>,
    /// Refresh pass in which each page was last observed tear-free.
    epochs: Vec<u64>,
    pages: usize,
}

impl CategorySnapshot {
    fn new(pages: usize) -> Self {
        Self {
            data: vec![0u8; pages * PAGE_SIZE],
            valid: vec![false; pages],
            versions: vec![0; pages],
            epochs: vec![0; pages],
            pages,
        }
    }

    /// Borrow page `index`, if it holds a valid copy.
    fn page(&self, index: usize) -> Option<&[u8]> {
        if index < self.pages && self.valid[index] {
            Some(&self.data[index * PAGE_SIZE..(index + 1) * PAGE_SIZE])
        } else {
            None
        }
    }

    fn valid_pages(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// Wrapping-aware "a is newer than b" on 32-bit sequence space.
fn version_newer(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) as i32 > 0
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════
//  BeaconReader
// ═══════════════════════════════════════════════════════════════════════

/// Host-side consumer of the beacon protocol.
///
/// Construction scans for the discovery page, builds the page directory
/// by arithmetic offset from it, and takes an initial snapshot.  Call
/// [`refresh`](Self::refresh) to pick up new writer output.
pub struct BeaconReader {
    backend: MemoryBackend,
    discovery_offset: u64,
    discovery: proto::DiscoveryPage,
    mappings: Vec<CategoryMapping>,
    snapshots: Vec<CategorySnapshot>,
    /// Monotonic refresh-pass counter.
    epoch: u64,
}

impl BeaconReader {
    /// Scan `backend` for the discovery page and build the directory.
    ///
    /// Returns [`BeaconError::Unavailable`] when the full mapped extent
    /// holds no decodable discovery page.
    pub fn new(backend: MemoryBackend) -> Result<Self, BeaconError> {
        let (discovery_offset, discovery) = Self::scan_for_discovery(&backend)?;

        info!(
            "beacon discovery at {:#x}: session {}, {} categories",
            discovery_offset,
            discovery.header.session_id,
            Category::COUNT,
        );

        let mut mappings = Vec::with_capacity(Category::COUNT);
        let mut snapshots = Vec::with_capacity(Category::COUNT);
        for cat in 0..Category::COUNT {
            let slot = discovery.slots[cat];
            let pages = slot.page_count as usize;
            let mut source_offsets = Vec::with_capacity(pages);
            for index in 0..pages {
                let offset = discovery_offset
                    + (slot.base_offset as u64 + index as u64) * PAGE_SIZE as u64;
                let reachable = offset as usize + PAGE_SIZE <= backend.len();
                source_offsets.push(reachable.then_some(offset));
            }
            let mapping = CategoryMapping { source_offsets };
            debug!(
                "category {}: {} pages declared, {} reachable",
                cat,
                pages,
                mapping.reachable(),
            );
            mappings.push(mapping);
            snapshots.push(CategorySnapshot::new(pages));
        }

        let mut reader = Self {
            backend,
            discovery_offset,
            discovery,
            mappings,
            snapshots,
            epoch: 0,
        };
        reader.refresh();
        Ok(reader)
    }

    /// Stride the mapped region at page granularity looking for the
    /// discovery page; stop at the first decodable match.
    fn scan_for_discovery(
        backend: &MemoryBackend,
    ) -> Result<(u64, proto::DiscoveryPage), BeaconError> {
        let mem = backend.as_slice();
        let magic = proto::MAGIC1.to_le_bytes();
        let mut offset = 0usize;
        while offset + PAGE_SIZE <= mem.len() {
            let page = &mem[offset..offset + PAGE_SIZE];
            // Cheap first-word filter before the full decode.
            if page[..4] == magic {
                if let Some(discovery) = proto::decode_discovery(page) {
                    return Ok((offset as u64, discovery));
                }
            }
            offset += PAGE_SIZE;
        }
        Err(BeaconError::Unavailable { scanned: mem.len() })
    }

    /// Re-copy every reachable page and return how many were updated.
    ///
    /// A page is updated only when the fresh copy is tear-free and its
    /// version advanced; a page that reads torn keeps its last valid
    /// copy.  A tear-free re-read at an unchanged version counts as
    /// "observed this pass" for generation completeness but is not an
    /// update.
    pub fn refresh(&mut self) -> usize {
        self.epoch += 1;

        // The directory itself may have advanced (write indices,
        // sequences).  A torn discovery page keeps the previous copy.
        if let Ok(page) = self.backend.read(self.discovery_offset, PAGE_SIZE) {
            if let Some(discovery) = proto::decode_discovery(page) {
                self.discovery = discovery;
            }
        }

        let mut scratch = vec![0u8; PAGE_SIZE];
        let mut updated = 0usize;

        for cat in 0..Category::COUNT {
            let mapping = &self.mappings[cat];
            let snapshot = &mut self.snapshots[cat];

            for index in 0..snapshot.pages {
                let Some(offset) = mapping.source_offsets[index] else {
                    continue;
                };
                // Copy first, validate the copy: the source can change
                // under us at any moment, the scratch buffer cannot.
                if self.backend.read_into(offset, &mut scratch).is_err() {
                    continue;
                }
                let Some(version) = Self::validate_page(
                    &scratch,
                    cat as u32,
                    index as u32,
                    self.discovery.header.session_id,
                ) else {
                    if snapshot.valid[index] {
                        debug!("category {} page {} torn, keeping last valid copy", cat, index);
                    }
                    continue;
                };

                if snapshot.valid[index] && version == snapshot.versions[index] {
                    snapshot.epochs[index] = self.epoch;
                    continue;
                }
                if snapshot.valid[index] && !version_newer(version, snapshot.versions[index]) {
                    continue;
                }

                snapshot.data[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
                    .copy_from_slice(&scratch);
                snapshot.valid[index] = true;
                snapshot.versions[index] = version;
                snapshot.epochs[index] = self.epoch;
                updated += 1;
            }
        }

        debug!("refresh pass {}: {} pages updated", self.epoch, updated);
        updated
    }

    /// Tear check plus identity check: the copy must carry the expected
    /// category, index, and session, otherwise it is a stale leftover
    /// from a previous writer.
    fn validate_page(page: &[u8], category: u32, index: u32, session: u32) -> Option<u32> {
        let header = proto::decode_header(page)?;
        if header.category as u32 != category
            || header.page_index != index
            || header.session_id != session
        {
            return None;
        }
        proto::page_version(page)
    }

    // ─── Accessors ───────────────────────────────────────────────────

    /// Session identifier of the writer that produced the directory.
    pub fn session_id(&self) -> u32 {
        self.discovery.header.session_id
    }

    /// The most recently decoded discovery page.
    pub fn discovery(&self) -> &proto::DiscoveryPage {
        &self.discovery
    }

    /// The underlying memory backend.
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Per-category page health.
    pub fn category_stats(&self) -> Vec<CategoryStats> {
        (0..Category::COUNT)
            .map(|cat| CategoryStats {
                category: cat as u32,
                expected_pages: self.snapshots[cat].pages,
                reachable_pages: self.mappings[cat].reachable(),
                valid_pages: self.snapshots[cat].valid_pages(),
            })
            .collect()
    }

    // ─── PID generations ─────────────────────────────────────────────

    /// All PID generations currently visible, ascending by generation.
    ///
    /// A generation is complete only when its pages were all observed
    /// tear-free in the most recent refresh pass and the per-page
    /// counts sum to the declared total — pages copied across different
    /// passes are never mixed into one complete snapshot, because the
    /// writer may have started a new generation mid-copy.
    pub fn pid_generations(&self) -> Vec<PidGeneration> {
        struct Accum {
            total_pids: u32,
            pids: Vec<u32>,
            consistent: bool,
            current_pass: bool,
        }

        let snapshot = &self.snapshots[Category::PidList as usize];
        let mut generations: BTreeMap<u32, Accum> = BTreeMap::new();

        for index in 0..snapshot.pages {
            let Some(page) = snapshot.page(index) else {
                continue;
            };
            let Some(view) = proto::decode_pid_list(page) else {
                continue;
            };
            let entry = generations.entry(view.generation).or_insert(Accum {
                total_pids: view.total_pids,
                pids: Vec::new(),
                consistent: true,
                current_pass: true,
            });
            if entry.total_pids != view.total_pids {
                // Bookkeeping mismatch across pages of one generation.
                entry.consistent = false;
            }
            entry.pids.extend(view.iter());
            entry.current_pass &= snapshot.epochs[index] == self.epoch;
        }

        generations
            .into_iter()
            .map(|(generation, accum)| {
                let complete = accum.consistent
                    && accum.current_pass
                    && accum.pids.len() as u32 == accum.total_pids;
                PidGeneration {
                    generation,
                    total_pids: accum.total_pids,
                    pids: accum.pids,
                    complete,
                }
            })
            .collect()
    }

    /// The most recent complete PID generation, if any.
    pub fn latest_complete_generation(&self) -> Option<PidGeneration> {
        self.pid_generations()
            .into_iter()
            .filter(|g| g.complete)
            .next_back()
    }

    // ─── Process details ─────────────────────────────────────────────

    /// All processes described in the scan category, keyed by PID.
    ///
    /// When a PID appears in several pages the record from the page
    /// with the higher write sequence wins.  A missing or empty scan
    /// category yields an empty map, not an error.
    pub fn processes(&self) -> BTreeMap<u32, ProcessInfo> {
        let snapshot = &self.snapshots[Category::Scan as usize];
        let mut latest: BTreeMap<u32, (ProcessInfo, u32)> = BTreeMap::new();

        for index in 0..snapshot.pages {
            let Some(page) = snapshot.page(index) else {
                continue;
            };
            let Some(view) = proto::decode_data_page(page) else {
                continue;
            };
            let sequence = view.header.sequence;
            for record in view.records() {
                if let Record::Process(entry) = record {
                    let info = ProcessInfo::from_entry(&entry);
                    match latest.get(&entry.pid) {
                        Some((_, seq)) if !version_newer(sequence, *seq) => {}
                        _ => {
                            latest.insert(entry.pid, (info, sequence));
                        }
                    }
                }
            }
        }

        latest.into_iter().map(|(pid, (info, _))| (pid, info)).collect()
    }

    /// Details for one process, if the scan category has seen it.
    pub fn process(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes().remove(&pid)
    }

    // ─── Camera data ─────────────────────────────────────────────────

    /// Section map for `pid` from one camera's rolling data.
    ///
    /// Sections sharing a (start, size) key deduplicate to the one with
    /// the higher written sequence.  Sorted by start address.
    pub fn camera_sections(&self, camera: CameraId, pid: u32) -> Vec<SectionInfo> {
        let snapshot = &self.snapshots[camera.data_category() as usize];
        let mut newest: BTreeMap<(u64, u64), SectionInfo> = BTreeMap::new();

        for index in 0..snapshot.pages {
            let Some(page) = snapshot.page(index) else {
                continue;
            };
            let Some(view) = proto::decode_data_page(page) else {
                continue;
            };
            let sequence = view.header.sequence;
            for record in view.records() {
                let Record::Section(entry) = record else {
                    continue;
                };
                if entry.pid != pid {
                    continue;
                }
                let key = (entry.va_start, entry.va_end.wrapping_sub(entry.va_start));
                let replace = match newest.get(&key) {
                    Some(existing) => version_newer(sequence, existing.sequence),
                    None => true,
                };
                if replace {
                    newest.insert(
                        key,
                        SectionInfo {
                            pid: entry.pid,
                            va_start: entry.va_start,
                            va_end: entry.va_end,
                            perms: entry.perms,
                            path: entry.path_str().to_string(),
                            sequence,
                        },
                    );
                }
            }
        }

        newest.into_values().collect()
    }

    /// VA→PA page map for `pid` from one camera's PTE records.
    ///
    /// PTE records carry no PID of their own; they attach to the most
    /// recent process/section record earlier in the same page stream.
    /// Among entries for the same VA the higher page sequence wins.
    pub fn camera_ptes(&self, camera: CameraId, pid: u32) -> BTreeMap<u64, u64> {
        let snapshot = &self.snapshots[camera.data_category() as usize];
        let mut newest: BTreeMap<u64, (u64, u32)> = BTreeMap::new();

        for index in 0..snapshot.pages {
            let Some(page) = snapshot.page(index) else {
                continue;
            };
            let Some(view) = proto::decode_data_page(page) else {
                continue;
            };
            let sequence = view.header.sequence;
            let mut context_pid: Option<u32> = None;
            for record in view.records() {
                match record {
                    Record::Process(e) => context_pid = Some(e.pid),
                    Record::Section(e) => context_pid = Some(e.pid),
                    Record::Pte(e) => {
                        if context_pid != Some(pid) || e.pa == 0 {
                            continue;
                        }
                        let replace = match newest.get(&e.va) {
                            Some((_, seq)) => version_newer(sequence, *seq),
                            None => true,
                        };
                        if replace {
                            newest.insert(e.va, (e.pa, sequence));
                        }
                    }
                }
            }
        }

        newest.into_iter().map(|(va, (pa, _))| (va, pa)).collect()
    }

    // ─── Camera control channel ──────────────────────────────────────

    fn control_offset(&self, camera: CameraId) -> Result<u64, BeaconError> {
        self.mappings[Category::Control as usize]
            .source_offsets
            .get(camera.control_index())
            .copied()
            .flatten()
            .ok_or(BeaconError::NoControlPage { camera })
    }

    /// Ask the guest to switch `camera` to `pid`.
    ///
    /// Writes the command, target, and a bumped version pair to the
    /// host-owned control page (Idle → Switching).  A command written
    /// while the previous one is still switching simply overwrites it —
    /// last write wins, there is no queue.  Requires a read-write
    /// backend.
    pub fn set_camera_focus(&mut self, camera: CameraId, pid: u32) -> Result<(), BeaconError> {
        let offset = self.control_offset(camera)?;

        // Read the last state to continue its version chain.  A torn
        // control page is ignored entirely — never guess partial
        // fields — and the chain restarts from zero.
        let mut page = vec![0u8; PAGE_SIZE];
        self.backend.read_into(offset, &mut page)?;
        let last = proto::decode_camera_control(&page);

        let version = last.map(|c| c.version).unwrap_or(0).wrapping_add(1);
        let sequence = last.map(|c| c.header.sequence).unwrap_or(0).wrapping_add(1);
        let current_pid = last.map(|c| c.current_pid).unwrap_or(0);

        let header = proto::PageHeader {
            session_id: self.discovery.header.session_id,
            category: Category::Control,
            page_index: camera.control_index() as u32,
            sequence,
            timestamp_us: now_micros(),
        };
        proto::encode_camera_control(
            &mut page,
            &header,
            version,
            proto::CAMERA_CMD_CHANGE_FOCUS,
            pid,
            CameraStatus::Switching,
            current_pid,
        );
        self.backend.write(offset, &page)?;

        info!("camera {:?} focus requested: pid {}", camera, pid);
        Ok(())
    }

    /// PID the guest reports it is currently servicing on `camera`.
    ///
    /// `None` when the control page is absent or reads torn — a torn
    /// page is "stale, retry", never data.
    pub fn camera_focus(&self, camera: CameraId) -> Option<u32> {
        let offset = self.control_offset(camera).ok()?;
        let page = self.backend.read(offset, PAGE_SIZE).ok()?;
        proto::decode_camera_control(page).map(|c| c.current_pid)
    }

    /// Current servicing state of `camera`, if readable tear-free.
    pub fn camera_status(&self, camera: CameraId) -> Option<CameraStatus> {
        let offset = self.control_offset(camera).ok()?;
        let page = self.backend.read(offset, PAGE_SIZE).ok()?;
        proto::decode_camera_control(page).map(|c| c.status)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
