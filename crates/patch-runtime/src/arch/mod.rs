//! Instruction-set strategies for patch sites
//!
//! Everything architecture-specific lives behind the [`InstrSet`] trait:
//! the two fixed-shape site encodings, the displacement range check, and
//! whether rewriting needs a stop-the-world pass. The generic engine and
//! coordinator never branch on an architecture name.
//!
//! An image picks its strategy at build time; the supported families are
//! plain statics so strategies can be shared as `&'static dyn InstrSet`.

pub mod aarch64;
pub mod x86_64;

pub use aarch64::AARCH64;
pub use x86_64::{X86_64_FETCH_ATOMIC, X86_64_STOP_MACHINE};

use crate::error::PatchResult;

/// Widest site encoding across supported families (x86-64 jmp rel32)
pub const MAX_SITE_WIDTH: usize = 5;

/// The two physical states of a patch site
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiteState {
    /// Fall through: a no-op filler occupies the site
    Unpatched,
    /// Taken: an unconditional jump to the target occupies the site
    Patched,
}

impl SiteState {
    /// Map a logical branch decision to the physical site state
    pub fn from_branch(taken: bool) -> Self {
        if taken {
            SiteState::Patched
        } else {
            SiteState::Unpatched
        }
    }
}

/// Initial filler written at a site when an image is produced
///
/// `NopFill` is the common form. `BranchHint` emits the jump itself; its
/// presence tells offline analysis tooling that the fallthrough path is
/// intentionally dead and needs no stack or flow adjustment. Both are
/// normalized to the key's logical state when the image is attached, so the
/// runtime patch pair is always no-op/jump regardless of strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EmitStrategy {
    #[default]
    NopFill,
    BranchHint,
}

/// The exact byte encoding of one site state
///
/// Fixed inline storage; encoders never allocate.
#[derive(Clone, Copy)]
pub struct SiteCode {
    bytes: [u8; MAX_SITE_WIDTH],
    len: u8,
}

impl SiteCode {
    pub fn new(code: &[u8]) -> Self {
        debug_assert!(code.len() <= MAX_SITE_WIDTH);
        let mut bytes = [0u8; MAX_SITE_WIDTH];
        bytes[..code.len()].copy_from_slice(code);
        Self {
            bytes,
            len: code.len() as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for SiteCode {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SiteCode {}

impl std::fmt::Debug for SiteCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiteCode({:02x?})", self.as_bytes())
    }
}

/// One instruction-set family's patching contract
///
/// Implementations are pure: `encode` is a function of its inputs only and
/// never touches code. Writing bytes is the patch engine's job.
pub trait InstrSet: Send + Sync {
    /// Family name, for diagnostics
    fn name(&self) -> &'static str;

    /// Fixed width in bytes of every site on this family
    ///
    /// Both encodings fill exactly this many bytes, which is what makes a
    /// patch a same-size overwrite rather than an insert or delete.
    fn site_width(&self) -> usize;

    /// Encode the given state for a site at `site` branching to `target`
    ///
    /// Fails with [`PatchError::EncodingRange`] when the displacement does
    /// not fit the family's branch encoding, before anything is written.
    ///
    /// [`PatchError::EncodingRange`]: crate::PatchError::EncodingRange
    fn encode(&self, state: SiteState, site: usize, target: usize) -> PatchResult<SiteCode>;

    /// Whether this family lacks same-width code-fetch atomicity
    ///
    /// When true, every other execution unit must be quiesced to a known-safe
    /// point before the write and resumed after; when false a single aligned
    /// write followed by instruction-cache maintenance suffices.
    fn requires_quiesce(&self) -> bool;

    /// Initial bytes emitted at a site when the image is built
    fn emit_site(
        &self,
        strategy: EmitStrategy,
        site: usize,
        target: usize,
    ) -> PatchResult<SiteCode> {
        let state = match strategy {
            EmitStrategy::NopFill => SiteState::Unpatched,
            EmitStrategy::BranchHint => SiteState::Patched,
        };
        self.encode(state, site, target)
    }
}

/// The strategy for the build host
#[cfg(target_arch = "x86_64")]
pub fn host() -> &'static dyn InstrSet {
    &X86_64_FETCH_ATOMIC
}

/// The strategy for the build host
#[cfg(target_arch = "aarch64")]
pub fn host() -> &'static dyn InstrSet {
    &AARCH64
}
