//! # Kernel Memory Configuration
//!
//! Authoritative source for the constants and boot-time switches shared by
//! the early memory allocators. Both the boot memory allocator and the
//! per-CPU allocator read their limits from here so the two never drift
//! apart.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Node and CPU limits**: `MAX_NUMNODES`, `NR_CPUS`
//! * **Address windows**: the higher half direct map, the DMA and DMA32
//!   boundaries, and the low-memory allocation limit
//! * **Per-CPU sizing**: minimum unit size, early map capacity, and the
//!   reserves set aside for modules and dynamic allocations
//!
//! ### Boot Parameters ([`params`])
//! Parses the early command line switches that tune the allocators:
//!
//! ```rust
//! use kernel_info::params::{BootParams, FirstChunkKind};
//!
//! let params = BootParams::parse("quiet bootmem_debug percpu_alloc=embed");
//! assert!(params.bootmem_debug);
//! assert_eq!(params.percpu_alloc, FirstChunkKind::Embed);
//! ```
//!
//! All layout constants are validated at compile time, so an inconsistent
//! configuration fails the build rather than the boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
pub mod params;
