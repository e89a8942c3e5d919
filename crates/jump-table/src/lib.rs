//! Position-independent jump-entry tables for runtime branch patching
//!
//! A patchable branch ("static branch") is a location in executable code that
//! is rewritten between two fixed-width encodings - a no-op filler and an
//! unconditional jump - depending on the state of a toggle key. This crate
//! defines the table that describes those locations.
//!
//! # Table layout
//!
//! The table is a sequence of fixed-size records in a read-only-after-load
//! section. Each record holds three pointer-width fields, and every field
//! stores a displacement *relative to the record's own address*:
//!
//! ```text
//! record @ A:
//!     site_rel     patch site          = A + site_rel
//!     target_rel   taken-branch label  = A + target_rel
//!     key_rel      key slot | polarity = A + key_rel (low bit stolen)
//! ```
//!
//! Relative encoding keeps the table relocation-free: code loaded at a
//! different base address than it was produced for needs no fixups. Absolute
//! addresses are computed from the record address at lookup time and never
//! stored resolved.
//!
//! The low bit of the key field encodes branch polarity: whether the site's
//! taken behavior follows the key's state directly or inverted. Key slots are
//! pointer-aligned, so the bit is recoverable by masking the resolved address.
//!
//! Records are emitted once, when the code containing the branch is produced,
//! and are immutable thereafter - only the code *at* the site mutates.

mod entry;
mod table;

pub use entry::{EntryRef, JumpEntry, Polarity, ENTRY_ALIGN, ENTRY_SIZE, KEY_SLOT_SIZE};
pub use table::{EntrySpec, EntryTable, SectionAddrs, TableBuilder, TableError};
