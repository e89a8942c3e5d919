//! The patch engine: batched rewriting of live patch sites
//!
//! The engine is the only component that touches code. A toggle pass runs in
//! three phases:
//!
//! 1. **Prepare** - encode the old and new form of every affected site.
//!    Displacement range failures surface here, before any byte is written,
//!    so a batch is all-or-nothing with respect to range validation.
//! 2. **Verify** - the bytes currently at each site must equal the expected
//!    old encoding. A mismatch means a double patch or a corrupted site; that
//!    is a protocol bug, and the engine panics rather than rewrite code whose
//!    state it cannot account for.
//! 3. **Write + synchronize** - all writes, then exactly one synchronization
//!    pass regardless of batch size. Families without code-fetch atomicity
//!    get their writes wrapped in the quiescer's stop-the-world window;
//!    fetch-atomic families take a plain write followed by instruction-cache
//!    maintenance. Paying the barrier once per batch instead of once per site
//!    is the entire point of batching.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::{
    arch::{MAX_SITE_WIDTH, SiteCode, SiteState},
    error::PatchResult,
    image::CodeImage,
};

/// Stop-the-world synchronization for instruction sets without code-fetch
/// atomicity
///
/// `quiesce` must bring every other execution unit to a point where none is
/// mid-fetch of the sites about to change, run `apply`, and only then let
/// them resume (after which they must refetch). Implementations decide what
/// an "execution unit" is: test harnesses use a rendezvous lock over reader
/// threads.
pub trait Quiesce: Send + Sync {
    fn quiesce(&self, apply: &mut dyn FnMut());
}

/// Default quiescer: full fences around the writes
///
/// Suitable only when no other unit executes the affected code during the
/// pass; deployments with live concurrent executors must supply a real
/// rendezvous via [`PatchEngine::with_quiescer`].
pub struct FenceQuiesce;

impl Quiesce for FenceQuiesce {
    fn quiesce(&self, apply: &mut dyn FnMut()) {
        fence(Ordering::SeqCst);
        apply();
        fence(Ordering::SeqCst);
    }
}

/// One prepared site transition: location plus both encodings
pub struct SiteWrite<'a> {
    image: &'a CodeImage,
    site_off: usize,
    expect: SiteCode,
    code: SiteCode,
}

impl std::fmt::Debug for SiteWrite<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteWrite")
            .field("site_off", &self.site_off)
            .finish_non_exhaustive()
    }
}

/// Applies encoding changes to live code
pub struct PatchEngine {
    quiescer: Box<dyn Quiesce>,
    /// Synchronization passes performed; one per applied batch
    sync_passes: AtomicU64,
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchEngine {
    pub fn new() -> Self {
        Self::with_quiescer(Box::new(FenceQuiesce))
    }

    pub fn with_quiescer(quiescer: Box<dyn Quiesce>) -> Self {
        Self {
            quiescer,
            sync_passes: AtomicU64::new(0),
        }
    }

    /// Number of synchronization passes performed so far
    ///
    /// Instrumentation hook: a batch over any number of sites and keys
    /// advances this by exactly one.
    pub fn sync_passes(&self) -> u64 {
        self.sync_passes.load(Ordering::SeqCst)
    }

    /// Prepare a transition of the site at `site_off` from one state to the
    /// other
    ///
    /// Both encodings are produced here; an unreachable target fails the
    /// whole pending batch before anything is written.
    pub fn prepare<'a>(
        &self,
        image: &'a CodeImage,
        site_off: usize,
        target: usize,
        from: SiteState,
        to: SiteState,
    ) -> PatchResult<SiteWrite<'a>> {
        let site = image.base() + site_off;
        let arch = image.arch();
        Ok(SiteWrite {
            image,
            site_off,
            expect: arch.encode(from, site, target)?,
            code: arch.encode(to, site, target)?,
        })
    }

    /// Prepare the initialization of a freshly attached site
    ///
    /// A new image's sites hold whichever filler the emission strategy chose;
    /// this accepts either valid form and produces a write only when the site
    /// does not already match the key's logical state. Any other byte pattern
    /// at the site is a fatal integrity violation.
    pub fn prepare_init<'a>(
        &self,
        image: &'a CodeImage,
        site_off: usize,
        target: usize,
        desired: SiteState,
    ) -> PatchResult<Option<SiteWrite<'a>>> {
        let site = image.base() + site_off;
        let arch = image.arch();
        let want = arch.encode(desired, site, target)?;

        let mut current = [0u8; MAX_SITE_WIDTH];
        let current = &mut current[..arch.site_width()];
        image.read_code(site_off, current);

        if current == want.as_bytes() {
            return Ok(None);
        }

        // Only now does the other form matter; a site that already matches
        // never pays its range validation
        let opposite = match desired {
            SiteState::Unpatched => SiteState::Patched,
            SiteState::Patched => SiteState::Unpatched,
        };
        let other = arch.encode(opposite, site, target)?;
        if current != other.as_bytes() {
            panic!(
                "integrity violation: site {site:#x} holds {current:02x?}, \
                 which is neither encoding of this site"
            );
        }
        Ok(Some(SiteWrite {
            image,
            site_off,
            expect: other,
            code: want,
        }))
    }

    /// Apply a prepared batch: verify, write, synchronize once
    ///
    /// An empty batch does nothing and pays no synchronization. Once writing
    /// starts the batch runs to completion; there is no cancellation.
    pub fn apply(&self, batch: &[SiteWrite<'_>]) {
        if batch.is_empty() {
            return;
        }

        for write in batch {
            let mut current = [0u8; MAX_SITE_WIDTH];
            let current = &mut current[..write.expect.len()];
            write.image.read_code(write.site_off, current);
            if current != write.expect.as_bytes() {
                panic!(
                    "integrity violation: site {:#x} holds {:02x?}, expected {:02x?} \
                     (double patch or unaccounted writer)",
                    write.image.base() + write.site_off,
                    current,
                    write.expect.as_bytes()
                );
            }
        }

        let needs_quiesce = batch
            .iter()
            .any(|write| write.image.arch().requires_quiesce());

        self.sync_passes.fetch_add(1, Ordering::SeqCst);

        let mut write_all = || {
            for write in batch {
                // Safety: offsets were validated against the text section by
                // prepare, and the coordinator lock serializes writers
                unsafe { write.image.patch(write.site_off, write.code.as_bytes()) };
            }
        };

        if needs_quiesce {
            self.quiescer.quiesce(&mut write_all);
        } else {
            write_all();
        }

        for write in batch {
            write.image.sync_code(write.site_off, write.code.len());
        }
    }
}
