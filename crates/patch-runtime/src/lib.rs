//! Runtime branch patching ("static branches")
//!
//! A branch whose condition changes rarely - a feature toggle, an
//! instrumentation hook - can be represented as patchable machine code: in
//! the common case the site costs an unconditional fall-through or jump,
//! with the decision baked into the instruction stream instead of evaluated
//! at run time. Flipping the flag rewrites the site between its two
//! fixed-width encodings.
//!
//! # Architecture
//!
//! ```text
//! Toggles (coordinator)          enable/disable/attach/detach
//!      |  looks up bound entries per key
//!      v
//! jump-table records             relative, position-independent
//!      |  resolve site/target at lookup time
//!      v
//! InstrSet (site encoder)        nop <-> jmp, range-checked, pure
//!      |  (location, old bytes, new bytes)
//!      v
//! PatchEngine                    verify, write via RW alias, sync once
//! ```
//!
//! # Toggling protocol
//!
//! Keys are reference counted: nested enables must be balanced, and the
//! physical patch tracks whether the count crosses zero. Reading a key is a
//! single atomic load and never contends with an in-flight patch pass;
//! mutation serializes behind one process-wide lock.
//!
//! Batching exists because synchronization dominates: rewriting a site on a
//! family without code-fetch atomicity means quiescing every other execution
//! unit, by far the most expensive step. The engine therefore applies any
//! number of site changes - across any number of keys - under a single
//! synchronization pass.
//!
//! # Code images
//!
//! Patchable code lives in [`CodeImage`]s: dual-view regions whose writable
//! alias is confined to the patch engine. An image embeds its entry table
//! and key slots; attaching it to the coordinator scans the table, binds
//! entries to keys, and normalizes each site to its key's logical state
//! before the image id is handed out.
//!
//! # Failure model
//!
//! A branch target outside the encodable displacement fails the whole batch
//! with [`PatchError::EncodingRange`] before any byte is written. Protocol
//! violations - dangling key references, unbalanced disables, a site holding
//! bytes the engine cannot account for - panic: they indicate a
//! loading/unloading bug, and continuing risks executing a stale jump into
//! unmapped memory.
//!
//! # Platform support
//!
//! Code images are supported on Linux (memfd + dual mmap) and macOS
//! (MAP_JIT). Site encoders cover x86-64 (5-byte no-op / `jmp rel32`) and
//! Arm64 (`nop` / `b`), selected per image at build time.

mod arch;
mod coordinator;
mod engine;
mod error;
mod image;
mod key;

pub use arch::{
    AARCH64, EmitStrategy, InstrSet, MAX_SITE_WIDTH, SiteCode, SiteState, X86_64_FETCH_ATOMIC,
    X86_64_STOP_MACHINE,
};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use arch::host;
pub use coordinator::{ImageId, Toggles};
pub use engine::{FenceQuiesce, PatchEngine, Quiesce, SiteWrite};
pub use error::{PatchError, PatchResult};
pub use image::{CodeImage, ImageBuilder};
pub use key::ToggleKey;

pub use jump_table::Polarity;
