//! vmlens host — inspect a running VM's memory without guest cooperation.
//!
//! This crate maps the file that mirrors guest physical RAM and recovers
//! structure from it two independent ways:
//!
//! - [`beacon`] — decode the page-granular, lock-free "beacon" protocol
//!   written by an optional in-guest companion (process lists, section
//!   maps, PTE dumps) and drive its camera control channel.
//! - [`walker`] — walk architecture-specific page tables (ARM64, x86-64)
//!   to translate guest virtual addresses to guest-physical addresses.
//!
//! # Architecture
//!
//! - [`backend`] — memory-mapped access to the guest-physical memory file
//! - [`walker`] — `PageTableWalker` trait with ARM64 and x86-64 walkers
//! - [`beacon`] — beacon discovery, snapshotting, decoding, camera control
//! - [`translate`] — per-process VA→PA cache with background prefetch

pub mod backend;
pub mod beacon;
pub mod translate;
pub mod walker;
