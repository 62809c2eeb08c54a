//! Beacon wire format shared between the in-guest companion and the host
//! reader.
//!
//! This crate defines the page layouts, category directory, and record
//! encodings used to exchange structured telemetry through ordinary shared
//! memory.  It is `no_std`-compatible with zero dependencies so the same
//! code can be linked into a guest-side writer.
//!
//! # Transport
//!
//! The companion allocates page-aligned shared memory inside the guest and
//! publishes fixed-size **beacon pages**; the host finds them by scanning
//! the file that mirrors guest physical RAM.  Writer and reader never
//! synchronize — the host may observe any page mid-write, so every page
//! carries a version number twice (top and bottom) and a page is only
//! trusted when both copies agree.
//!
//! # Page layout
//!
//! Every page is exactly 4096 bytes:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────
//! 0x000   4     magic1           (0x3142FACE)
//! 0x004   4     magic2           (0xCAFEBABE)
//! 0x008   4     session_id
//! 0x00C   4     category
//! 0x010   4     page_index       (within the category)
//! 0x014   4     sequence
//! 0x018   8     timestamp_us
//! 0x020   4     version_top      ← tear detection
//! 0x024   4056  body             (category-specific)
//! 0xFFC   4     version_bottom   ← must equal version_top
//! ```
//!
//! All numeric fields are little-endian, fixed-width, and fixed-offset.
//! Decoders never read past the buffer: bad magic, an out-of-range
//! category, or a version mismatch yields `None`, not garbage fields.

#![cfg_attr(not(feature = "std"), no_std)]

// ═══════════════════════════════════════════════════════════════════════
//  Core constants
// ═══════════════════════════════════════════════════════════════════════

/// Size of every beacon page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// First magic word of every beacon page.
pub const MAGIC1: u32 = 0x3142_FACE;

/// Second magic word of every beacon page.
pub const MAGIC2: u32 = 0xCAFE_BABE;

/// Byte offset of `version_top` (immediately after the 32-byte header).
pub const VERSION_TOP_OFFSET: usize = 32;

/// Byte offset of the category-specific body.
pub const BODY_OFFSET: usize = 36;

/// Byte offset of `version_bottom` (the page's last four bytes).
pub const VERSION_BOTTOM_OFFSET: usize = PAGE_SIZE - 4;

/// Size of the category-specific body in bytes.
pub const BODY_SIZE: usize = VERSION_BOTTOM_OFFSET - BODY_OFFSET;

// Layout must tile the page exactly.
const _: () = assert!(BODY_OFFSET + BODY_SIZE + 4 == PAGE_SIZE);
const _: () = assert!(BODY_SIZE == 4056);

// ═══════════════════════════════════════════════════════════════════════
//  Categories
// ═══════════════════════════════════════════════════════════════════════

/// Number of directory slots in the discovery page.
///
/// Fixed at allocation time so the directory never grows; slots beyond
/// [`Category::COUNT`] are zeroed.
pub const DIRECTORY_SLOTS: usize = 8;

/// Fixed-purpose page arrays published by the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Category {
    /// The single discovery page (category 0, index 0).
    Directory = 0,
    /// PID snapshot generations.
    PidList = 1,
    /// Rolling scan of process / section records.
    Scan = 2,
    /// Camera 1 data stream.
    Camera1 = 3,
    /// Camera 2 data stream.
    Camera2 = 4,
    /// Camera control pages (index 0 for camera 1, index 1 for camera 2).
    Control = 5,
}

impl Category {
    /// Number of defined categories.
    pub const COUNT: usize = 6;

    /// Convert a raw `u32` to a [`Category`], if in range.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Directory),
            1 => Some(Self::PidList),
            2 => Some(Self::Scan),
            3 => Some(Self::Camera1),
            4 => Some(Self::Camera2),
            5 => Some(Self::Control),
            _ => None,
        }
    }
}

const _: () = assert!(Category::COUNT <= DIRECTORY_SLOTS);

// ═══════════════════════════════════════════════════════════════════════
//  Little-endian field access
// ═══════════════════════════════════════════════════════════════════════

fn get_u16(buf: &[u8], off: usize) -> Option<u16> {
    let b = buf.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn get_u32(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn get_u64(buf: &[u8], off: usize) -> Option<u64> {
    let b = buf.get(off..off + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_le_bytes(raw))
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

// ═══════════════════════════════════════════════════════════════════════
//  Page header
// ═══════════════════════════════════════════════════════════════════════

/// Decoded 32-byte header common to every beacon page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Session identifier (the companion's PID by convention).
    pub session_id: u32,
    /// Which category array this page belongs to.
    pub category: Category,
    /// Index within the category.
    pub page_index: u32,
    /// Monotonically increasing write sequence.
    pub sequence: u32,
    /// Wall-clock microseconds when the page was written.
    pub timestamp_us: u64,
}

/// Decode a page header.
///
/// Validates the magic pair and the category range but **not** the
/// version pair — the directory build needs the identity of pages that
/// are momentarily torn.  Use [`page_version`] for the tear check.
pub fn decode_header(buf: &[u8]) -> Option<PageHeader> {
    if buf.len() < PAGE_SIZE {
        return None;
    }
    if get_u32(buf, 0)? != MAGIC1 || get_u32(buf, 4)? != MAGIC2 {
        return None;
    }
    let category = Category::from_u32(get_u32(buf, 12)?)?;
    Some(PageHeader {
        session_id: get_u32(buf, 8)?,
        category,
        page_index: get_u32(buf, 16)?,
        sequence: get_u32(buf, 20)?,
        timestamp_us: get_u64(buf, 24)?,
    })
}

/// Encode a page header into `buf` (magic pair included).
///
/// Returns `None` if the buffer is not a full page.
pub fn encode_header(buf: &mut [u8], hdr: &PageHeader) -> Option<()> {
    if buf.len() < PAGE_SIZE {
        return None;
    }
    put_u32(buf, 0, MAGIC1);
    put_u32(buf, 4, MAGIC2);
    put_u32(buf, 8, hdr.session_id);
    put_u32(buf, 12, hdr.category as u32);
    put_u32(buf, 16, hdr.page_index);
    put_u32(buf, 20, hdr.sequence);
    put_u64(buf, 24, hdr.timestamp_us);
    Some(())
}

/// Read the page version, if the page is tear-free.
///
/// Returns `Some(version)` iff `version_top == version_bottom`.  This is
/// the only consistency check a reader may perform; a mismatch means the
/// writer was mid-update when the page was observed.
pub fn page_version(buf: &[u8]) -> Option<u32> {
    let top = get_u32(buf, VERSION_TOP_OFFSET)?;
    let bottom = get_u32(buf, VERSION_BOTTOM_OFFSET)?;
    if top == bottom {
        Some(top)
    } else {
        None
    }
}

/// Write `version` to both the top and bottom version words.
pub fn write_version(buf: &mut [u8], version: u32) -> Option<()> {
    if buf.len() < PAGE_SIZE {
        return None;
    }
    put_u32(buf, VERSION_TOP_OFFSET, version);
    put_u32(buf, VERSION_BOTTOM_OFFSET, version);
    Some(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Discovery page
// ═══════════════════════════════════════════════════════════════════════

/// One 16-byte directory entry in the discovery page.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x0     4     base_offset   (pages, relative to the discovery page)
/// 0x4     4     page_count
/// 0x8     4     write_index
/// 0xC     4     sequence
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySlot {
    /// Offset of the category's first page, in pages, relative to the
    /// discovery page.
    pub base_offset: u32,
    /// Number of pages in the category (fixed at allocation time).
    pub page_count: u32,
    /// The writer's current write position within the category.
    pub write_index: u32,
    /// Sequence number of the writer's most recent pass.
    pub sequence: u32,
}

/// Decoded discovery page: the root of the page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPage {
    pub header: PageHeader,
    pub version: u32,
    pub slots: [CategorySlot; DIRECTORY_SLOTS],
}

/// Decode the discovery page.
///
/// Requires a tear-free page with category [`Category::Directory`] and
/// page index 0.
pub fn decode_discovery(buf: &[u8]) -> Option<DiscoveryPage> {
    let header = decode_header(buf)?;
    if header.category != Category::Directory || header.page_index != 0 {
        return None;
    }
    let version = page_version(buf)?;
    let mut slots = [CategorySlot::default(); DIRECTORY_SLOTS];
    for (i, slot) in slots.iter_mut().enumerate() {
        let off = BODY_OFFSET + i * 16;
        *slot = CategorySlot {
            base_offset: get_u32(buf, off)?,
            page_count: get_u32(buf, off + 4)?,
            write_index: get_u32(buf, off + 8)?,
            sequence: get_u32(buf, off + 12)?,
        };
    }
    Some(DiscoveryPage { header, version, slots })
}

/// Encode a discovery page (header, slots, and version pair).
pub fn encode_discovery(
    buf: &mut [u8],
    hdr: &PageHeader,
    version: u32,
    slots: &[CategorySlot; DIRECTORY_SLOTS],
) -> Option<()> {
    if hdr.category != Category::Directory || hdr.page_index != 0 {
        return None;
    }
    encode_header(buf, hdr)?;
    for (i, slot) in slots.iter().enumerate() {
        let off = BODY_OFFSET + i * 16;
        put_u32(buf, off, slot.base_offset);
        put_u32(buf, off + 4, slot.page_count);
        put_u32(buf, off + 8, slot.write_index);
        put_u32(buf, off + 12, slot.sequence);
    }
    write_version(buf, version)
}

// ═══════════════════════════════════════════════════════════════════════
//  PID list pages
// ═══════════════════════════════════════════════════════════════════════

/// Body offset of the inline PID array.
const PID_ARRAY_OFFSET: usize = BODY_OFFSET + 12;

/// Maximum PIDs that fit in one page.
pub const MAX_PIDS_PER_PAGE: usize = (VERSION_BOTTOM_OFFSET - PID_ARRAY_OFFSET) / 4;

const _: () = assert!(MAX_PIDS_PER_PAGE == 1011);

/// Decoded view of one PID-list page.
///
/// A full PID snapshot spans several pages sharing one `generation`; the
/// snapshot is complete only when every page is tear-free and the sum of
/// per-page counts equals `total_pids`.
#[derive(Debug, Clone, Copy)]
pub struct PidListView<'a> {
    pub header: PageHeader,
    pub version: u32,
    /// Which snapshot generation this page belongs to.
    pub generation: u32,
    /// Total PIDs across all pages of this generation.
    pub total_pids: u32,
    count: usize,
    body: &'a [u8],
}

impl<'a> PidListView<'a> {
    /// Number of PIDs stored in this page.
    pub fn count(&self) -> usize {
        self.count
    }

    /// PID at index `i` within this page.
    pub fn pid(&self, i: usize) -> Option<u32> {
        if i >= self.count {
            return None;
        }
        get_u32(self.body, i * 4)
    }

    /// Iterate over the PIDs in page order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        let count = self.count;
        let body = self.body;
        (0..count).filter_map(move |i| get_u32(body, i * 4))
    }
}

/// Decode a PID-list page (tear-free, category [`Category::PidList`]).
pub fn decode_pid_list(buf: &[u8]) -> Option<PidListView<'_>> {
    let header = decode_header(buf)?;
    if header.category != Category::PidList {
        return None;
    }
    let version = page_version(buf)?;
    let generation = get_u32(buf, BODY_OFFSET)?;
    let total_pids = get_u32(buf, BODY_OFFSET + 4)?;
    let count = get_u32(buf, BODY_OFFSET + 8)? as usize;
    if count > MAX_PIDS_PER_PAGE {
        return None;
    }
    Some(PidListView {
        header,
        version,
        generation,
        total_pids,
        count,
        body: &buf[PID_ARRAY_OFFSET..VERSION_BOTTOM_OFFSET],
    })
}

/// Encode one PID-list page.
///
/// `pids` must fit in a single page; the caller splits a generation
/// across pages and keeps `total_pids` constant within it.
pub fn encode_pid_list(
    buf: &mut [u8],
    hdr: &PageHeader,
    version: u32,
    generation: u32,
    total_pids: u32,
    pids: &[u32],
) -> Option<()> {
    if hdr.category != Category::PidList || pids.len() > MAX_PIDS_PER_PAGE {
        return None;
    }
    encode_header(buf, hdr)?;
    put_u32(buf, BODY_OFFSET, generation);
    put_u32(buf, BODY_OFFSET + 4, total_pids);
    put_u32(buf, BODY_OFFSET + 8, pids.len() as u32);
    for (i, pid) in pids.iter().enumerate() {
        put_u32(buf, PID_ARRAY_OFFSET + i * 4, *pid);
    }
    write_version(buf, version)
}

// ═══════════════════════════════════════════════════════════════════════
//  Data-page records
// ═══════════════════════════════════════════════════════════════════════

/// Record tag: process entry.
pub const TAG_PROCESS: u8 = 0x01;
/// Record tag: virtual-memory section entry.
pub const TAG_SECTION: u8 = 0x02;
/// Record tag: page-table entry.
pub const TAG_PTE: u8 = 0x03;
/// Record tag: end of stream.
pub const TAG_END: u8 = 0xFF;

/// Encoded size of a [`ProcessEntry`].
pub const PROCESS_ENTRY_SIZE: usize = 200;
/// Encoded size of a [`SectionEntry`].
pub const SECTION_ENTRY_SIZE: usize = 96;
/// Encoded size of a [`PteEntry`].
pub const PTE_ENTRY_SIZE: usize = 24;

/// Fixed-width process description (200 bytes on the wire).
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    1     tag (0x01)
/// 0x01    3     reserved
/// 0x04    4     pid
/// 0x08    4     ppid
/// 0x0C    4     uid
/// 0x10    4     gid
/// 0x14    1     state (R/S/D/Z/T)
/// 0x15    3     reserved
/// 0x18    8     vsize_kb
/// 0x20    8     rss_kb
/// 0x28    8     start_time
/// 0x30    8     cpu_time
/// 0x38    16    comm (NUL-padded)
/// 0x48    128   exe_path (NUL-padded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub state: u8,
    pub vsize_kb: u64,
    pub rss_kb: u64,
    pub start_time: u64,
    pub cpu_time: u64,
    pub comm: [u8; 16],
    pub exe_path: [u8; 128],
}

impl ProcessEntry {
    /// Process name as a string, trimmed at the first NUL.
    pub fn comm_str(&self) -> &str {
        str_until_nul(&self.comm)
    }

    /// Executable path as a string, trimmed at the first NUL.
    pub fn exe_path_str(&self) -> &str {
        str_until_nul(&self.exe_path)
    }
}

/// One virtual-memory region of a process (96 bytes on the wire).
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    1     tag (0x02)
/// 0x01    3     reserved
/// 0x04    4     pid
/// 0x08    8     va_start
/// 0x10    8     va_end
/// 0x18    4     perms (r=1, w=2, x=4, p=8)
/// 0x1C    4     reserved
/// 0x20    64    path (NUL-padded)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    pub pid: u32,
    pub va_start: u64,
    pub va_end: u64,
    pub perms: u32,
    pub path: [u8; 64],
}

impl SectionEntry {
    /// Backing path (or `[heap]`, `[stack]`, …), trimmed at the first NUL.
    pub fn path_str(&self) -> &str {
        str_until_nul(&self.path)
    }
}

/// One resolved page-table entry (24 bytes on the wire).
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    1     tag (0x03)
/// 0x01    3     reserved
/// 0x04    4     flags
/// 0x08    8     va (page-aligned)
/// 0x10    8     pa (non-zero)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteEntry {
    pub flags: u32,
    pub va: u64,
    pub pa: u64,
}

/// Any record that can appear in a data-page stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Process(ProcessEntry),
    Section(SectionEntry),
    Pte(PteEntry),
}

impl Record {
    /// Encoded size of this record in bytes.
    pub fn wire_size(&self) -> usize {
        match self {
            Record::Process(_) => PROCESS_ENTRY_SIZE,
            Record::Section(_) => SECTION_ENTRY_SIZE,
            Record::Pte(_) => PTE_ENTRY_SIZE,
        }
    }
}

fn str_until_nul(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..end]).unwrap_or("")
}

fn decode_process(buf: &[u8]) -> Option<ProcessEntry> {
    if buf.len() < PROCESS_ENTRY_SIZE {
        return None;
    }
    let mut comm = [0u8; 16];
    comm.copy_from_slice(&buf[0x38..0x48]);
    let mut exe_path = [0u8; 128];
    exe_path.copy_from_slice(&buf[0x48..0xC8]);
    Some(ProcessEntry {
        pid: get_u32(buf, 0x04)?,
        ppid: get_u32(buf, 0x08)?,
        uid: get_u32(buf, 0x0C)?,
        gid: get_u32(buf, 0x10)?,
        state: buf[0x14],
        vsize_kb: get_u64(buf, 0x18)?,
        rss_kb: get_u64(buf, 0x20)?,
        start_time: get_u64(buf, 0x28)?,
        cpu_time: get_u64(buf, 0x30)?,
        comm,
        exe_path,
    })
}

fn encode_process(buf: &mut [u8], e: &ProcessEntry) {
    buf[..PROCESS_ENTRY_SIZE].fill(0);
    buf[0] = TAG_PROCESS;
    put_u32(buf, 0x04, e.pid);
    put_u32(buf, 0x08, e.ppid);
    put_u32(buf, 0x0C, e.uid);
    put_u32(buf, 0x10, e.gid);
    buf[0x14] = e.state;
    put_u64(buf, 0x18, e.vsize_kb);
    put_u64(buf, 0x20, e.rss_kb);
    put_u64(buf, 0x28, e.start_time);
    put_u64(buf, 0x30, e.cpu_time);
    buf[0x38..0x48].copy_from_slice(&e.comm);
    buf[0x48..0xC8].copy_from_slice(&e.exe_path);
}

fn decode_section(buf: &[u8]) -> Option<SectionEntry> {
    if buf.len() < SECTION_ENTRY_SIZE {
        return None;
    }
    let mut path = [0u8; 64];
    path.copy_from_slice(&buf[0x20..0x60]);
    Some(SectionEntry {
        pid: get_u32(buf, 0x04)?,
        va_start: get_u64(buf, 0x08)?,
        va_end: get_u64(buf, 0x10)?,
        perms: get_u32(buf, 0x18)?,
        path,
    })
}

fn encode_section(buf: &mut [u8], e: &SectionEntry) {
    buf[..SECTION_ENTRY_SIZE].fill(0);
    buf[0] = TAG_SECTION;
    put_u32(buf, 0x04, e.pid);
    put_u64(buf, 0x08, e.va_start);
    put_u64(buf, 0x10, e.va_end);
    put_u32(buf, 0x18, e.perms);
    buf[0x20..0x60].copy_from_slice(&e.path);
}

fn decode_pte(buf: &[u8]) -> Option<PteEntry> {
    if buf.len() < PTE_ENTRY_SIZE {
        return None;
    }
    Some(PteEntry {
        flags: get_u32(buf, 0x04)?,
        va: get_u64(buf, 0x08)?,
        pa: get_u64(buf, 0x10)?,
    })
}

fn encode_pte(buf: &mut [u8], e: &PteEntry) {
    buf[..PTE_ENTRY_SIZE].fill(0);
    buf[0] = TAG_PTE;
    put_u32(buf, 0x04, e.flags);
    put_u64(buf, 0x08, e.va);
    put_u64(buf, 0x10, e.pa);
}

// ═══════════════════════════════════════════════════════════════════════
//  Data pages
// ═══════════════════════════════════════════════════════════════════════

/// Body offset of the record stream within a data page.
const RECORD_STREAM_OFFSET: usize = BODY_OFFSET + 4;

/// Record-stream capacity of one data page in bytes.
pub const DATA_PAGE_CAPACITY: usize = VERSION_BOTTOM_OFFSET - RECORD_STREAM_OFFSET;

/// Decoded view of one generic data page.
///
/// The body is `record_count (u16) | continuation (u16)` followed by a
/// stream of tagged records.  Records never cross a page boundary, so a
/// whole page is the only unit that can tear.
#[derive(Debug, Clone, Copy)]
pub struct DataPageView<'a> {
    pub header: PageHeader,
    pub version: u32,
    /// Number of records in this page.
    pub record_count: u16,
    /// Non-zero when more pages of the same burst follow.
    pub continuation: u16,
    stream: &'a [u8],
}

impl<'a> DataPageView<'a> {
    /// Iterate over the records in stream order.
    ///
    /// The iterator stops at the declared record count, the end marker,
    /// an unknown tag, or a truncated record — whichever comes first.
    pub fn records(&self) -> RecordIter<'a> {
        RecordIter {
            stream: self.stream,
            offset: 0,
            remaining: self.record_count as usize,
        }
    }
}

/// Iterator over the tagged records of a data page.
pub struct RecordIter<'a> {
    stream: &'a [u8],
    offset: usize,
    remaining: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.remaining == 0 {
            return None;
        }
        let tag = *self.stream.get(self.offset)?;
        let rest = &self.stream[self.offset..];
        let (record, size) = match tag {
            TAG_PROCESS => (Record::Process(decode_process(rest)?), PROCESS_ENTRY_SIZE),
            TAG_SECTION => (Record::Section(decode_section(rest)?), SECTION_ENTRY_SIZE),
            TAG_PTE => (Record::Pte(decode_pte(rest)?), PTE_ENTRY_SIZE),
            _ => return None,
        };
        self.offset += size;
        self.remaining -= 1;
        Some(record)
    }
}

/// Decode a data page (tear-free, category [`Category::Scan`],
/// [`Category::Camera1`], or [`Category::Camera2`]).
pub fn decode_data_page(buf: &[u8]) -> Option<DataPageView<'_>> {
    let header = decode_header(buf)?;
    match header.category {
        Category::Scan | Category::Camera1 | Category::Camera2 => {}
        _ => return None,
    }
    let version = page_version(buf)?;
    Some(DataPageView {
        header,
        version,
        record_count: get_u16(buf, BODY_OFFSET)?,
        continuation: get_u16(buf, BODY_OFFSET + 2)?,
        stream: &buf[RECORD_STREAM_OFFSET..VERSION_BOTTOM_OFFSET],
    })
}

/// Encode a data page from a record slice.
///
/// Returns the number of records written, which may be fewer than
/// `records.len()` when the page fills up — the writer then continues on
/// the next page.  A [`TAG_END`] marker is appended when space allows.
pub fn encode_data_page(
    buf: &mut [u8],
    hdr: &PageHeader,
    version: u32,
    continuation: u16,
    records: &[Record],
) -> Option<usize> {
    match hdr.category {
        Category::Scan | Category::Camera1 | Category::Camera2 => {}
        _ => return None,
    }
    encode_header(buf, hdr)?;
    buf[RECORD_STREAM_OFFSET..VERSION_BOTTOM_OFFSET].fill(0);

    let mut offset = RECORD_STREAM_OFFSET;
    let mut written = 0usize;
    for record in records {
        let size = record.wire_size();
        if offset + size > VERSION_BOTTOM_OFFSET {
            break;
        }
        match record {
            Record::Process(e) => encode_process(&mut buf[offset..], e),
            Record::Section(e) => encode_section(&mut buf[offset..], e),
            Record::Pte(e) => encode_pte(&mut buf[offset..], e),
        }
        offset += size;
        written += 1;
    }
    if offset < VERSION_BOTTOM_OFFSET {
        buf[offset] = TAG_END;
    }
    put_u16(buf, BODY_OFFSET, written as u16);
    put_u16(buf, BODY_OFFSET + 2, continuation);
    write_version(buf, version)?;
    Some(written)
}

// ═══════════════════════════════════════════════════════════════════════
//  Camera control page
// ═══════════════════════════════════════════════════════════════════════

/// Control command: no pending request.
pub const CAMERA_CMD_NONE: u32 = 0;
/// Control command: switch the camera to a new target PID.
pub const CAMERA_CMD_CHANGE_FOCUS: u32 = 1;

/// Camera servicing state, as published by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CameraStatus {
    /// No focus change pending.
    Idle = 0,
    /// A focus-change command was written but not yet acknowledged.
    Switching = 1,
    /// The guest is producing data for the new target.
    Active = 2,
}

impl CameraStatus {
    /// Convert a raw `u32` to a [`CameraStatus`], if in range.
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Idle),
            1 => Some(Self::Switching),
            2 => Some(Self::Active),
            _ => None,
        }
    }
}

/// Decoded camera control page.
///
/// Lives in [`Category::Control`]; page index 0 controls camera 1 and
/// page index 1 controls camera 2.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x24    4     command       ← written by host
/// 0x28    4     target_pid    ← written by host
/// 0x2C    4     status        ← written by guest
/// 0x30    4     current_pid   ← written by guest
/// ```
///
/// A writer on either side must ignore a control page it reads as torn —
/// partial command fields are never acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraControl {
    pub header: PageHeader,
    pub version: u32,
    pub command: u32,
    pub target_pid: u32,
    pub status: CameraStatus,
    /// PID the guest is currently servicing.
    pub current_pid: u32,
}

/// Decode a camera control page (tear-free).
pub fn decode_camera_control(buf: &[u8]) -> Option<CameraControl> {
    let header = decode_header(buf)?;
    if header.category != Category::Control {
        return None;
    }
    let version = page_version(buf)?;
    Some(CameraControl {
        header,
        version,
        command: get_u32(buf, BODY_OFFSET)?,
        target_pid: get_u32(buf, BODY_OFFSET + 4)?,
        status: CameraStatus::from_u32(get_u32(buf, BODY_OFFSET + 8)?)?,
        current_pid: get_u32(buf, BODY_OFFSET + 12)?,
    })
}

/// Encode a camera control page.
pub fn encode_camera_control(
    buf: &mut [u8],
    hdr: &PageHeader,
    version: u32,
    command: u32,
    target_pid: u32,
    status: CameraStatus,
    current_pid: u32,
) -> Option<()> {
    if hdr.category != Category::Control {
        return None;
    }
    encode_header(buf, hdr)?;
    put_u32(buf, BODY_OFFSET, command);
    put_u32(buf, BODY_OFFSET + 4, target_pid);
    put_u32(buf, BODY_OFFSET + 8, status as u32);
    put_u32(buf, BODY_OFFSET + 12, current_pid);
    write_version(buf, version)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
