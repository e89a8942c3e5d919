//! Executable code images with embedded jump-entry tables
//!
//! An image is one contiguous dual-view region laid out as:
//!
//! ```text
//! +------------------+ rx base
//! | text             |   patch sites live here
//! +------------------+ aligned
//! | entry table      |   packed records, read-only after build
//! +------------------+
//! | key slots        |   pointer-width words holding key ids
//! +------------------+
//! ```
//!
//! The table and key slots are immutable once built; only the bytes at the
//! patch sites ever change, and only the patch engine changes them, through
//! the writable alias. Everything else treats the image as immutable data.

// Platform-specific Mapping implementations
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux::Mapping;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos::Mapping;

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
compile_error!("code images only supported on macOS and Linux");

use jump_table::{
    ENTRY_ALIGN, ENTRY_SIZE, EntrySpec, EntryTable, KEY_SLOT_SIZE, Polarity, SectionAddrs,
    TableBuilder,
};

use crate::{
    arch::{EmitStrategy, InstrSet},
    error::{PatchError, PatchResult},
    key::ToggleKey,
};

/// A loaded unit of patchable code
///
/// Built once by [`ImageBuilder`]; afterwards the only mutation is the patch
/// engine rewriting site bytes. Readers and executors use the executable
/// alias exclusively.
pub struct CodeImage {
    map: Mapping,
    arch: &'static dyn InstrSet,
    text_len: usize,
    table_off: usize,
    table_len: usize,
    slots_off: usize,
    key_count: usize,
}

impl CodeImage {
    /// Load address of the text section (executable alias)
    pub fn base(&self) -> usize {
        self.map.rx_base()
    }

    /// Length of the text section
    pub fn text_len(&self) -> usize {
        self.text_len
    }

    /// The instruction-set strategy this image was built for
    pub fn arch(&self) -> &'static dyn InstrSet {
        self.arch
    }

    /// View of the embedded entry table
    pub(crate) fn entry_table(&self) -> PatchResult<EntryTable> {
        // Safety: the table section was emitted by build and lives as long
        // as the mapping
        let table =
            unsafe { EntryTable::from_raw(self.base() + self.table_off, self.table_len) }?;
        Ok(table)
    }

    /// Read the key id stored at `slot_addr`, if it is one of this image's
    /// key slots
    pub(crate) fn key_id_at(&self, slot_addr: usize) -> Option<u64> {
        let slots_base = self.base() + self.slots_off;
        let slots_end = slots_base + self.key_count * KEY_SLOT_SIZE;
        if slot_addr < slots_base || slot_addr >= slots_end || slot_addr % KEY_SLOT_SIZE != 0 {
            return None;
        }
        // Safety: bounds-checked above; slots are immutable after build
        Some(unsafe { (slot_addr as *const usize).read() } as u64)
    }

    /// Text offset of the site at `addr`, if `addr` falls inside this
    /// image's text section
    pub(crate) fn site_offset(&self, addr: usize) -> Option<usize> {
        let off = addr.checked_sub(self.base())?;
        (off + self.arch.site_width() <= self.text_len).then_some(off)
    }

    /// Copy code bytes out of the executable alias
    ///
    /// Reads are volatile so a concurrent patch (through the writable alias)
    /// is observed as some prefix of old and new bytes, never optimized away.
    pub fn read_code(&self, offset: usize, buf: &mut [u8]) {
        assert!(
            offset + buf.len() <= self.map.capacity(),
            "read past end of image"
        );
        let base = self.base() as *const u8;
        for (i, out) in buf.iter_mut().enumerate() {
            // Safety: bounds asserted above
            *out = unsafe { base.add(offset + i).read_volatile() };
        }
    }

    /// Overwrite site bytes through the writable alias
    ///
    /// This is the single self-modifying-code capability in the crate; only
    /// the patch engine calls it.
    ///
    /// # Safety
    ///
    /// The caller must serialize writes (the coordinator lock) and ensure the
    /// range stays within the text section.
    pub(crate) unsafe fn patch(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.text_len,
            "patch outside text section"
        );
        self.map.write(offset, bytes);
    }

    /// Instruction-cache maintenance for a patched range
    pub(crate) fn sync_code(&self, offset: usize, len: usize) {
        self.map.sync_code(offset, len);
    }

    /// Get a function pointer at the given text offset
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `offset` is a valid entry point within the text section
    /// - the type `F` matches the actual function signature
    pub unsafe fn get_function<F: Copy>(&self, offset: usize) -> F {
        debug_assert!(offset < self.text_len, "offset {offset} >= text length");
        let ptr = (self.base() + offset) as *const u8;
        std::mem::transmute_copy(&ptr)
    }
}

impl std::fmt::Debug for CodeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeImage")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("text_len", &self.text_len)
            .field("arch", &self.arch.name())
            .finish_non_exhaustive()
    }
}

/// One patch site declared while building an image
#[derive(Debug, Clone, Copy)]
struct SiteDecl {
    site: usize,
    target: usize,
    key_slot: usize,
    polarity: Polarity,
}

/// Builds a [`CodeImage`]: text, patch sites, and the keys they test
///
/// The builder plays the role of the toolchain that would normally emit the
/// section at compile time: it writes the initial filler at every site
/// (per the selected [`EmitStrategy`]) and packs the entry table against the
/// image's final load address.
pub struct ImageBuilder {
    arch: &'static dyn InstrSet,
    strategy: EmitStrategy,
    text: Vec<u8>,
    sites: Vec<SiteDecl>,
    key_ids: Vec<u64>,
}

impl ImageBuilder {
    pub fn new(arch: &'static dyn InstrSet) -> Self {
        Self {
            arch,
            strategy: EmitStrategy::default(),
            text: Vec::new(),
            sites: Vec::new(),
            key_ids: Vec::new(),
        }
    }

    /// Select the initial filler written at every site
    pub fn emit_strategy(&mut self, strategy: EmitStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Set the text section bytes
    pub fn text(&mut self, text: &[u8]) -> &mut Self {
        self.text = text.to_vec();
        self
    }

    /// Declare a key slot for `key`, returning its slot index
    pub fn key(&mut self, key: &ToggleKey) -> usize {
        self.key_ids.push(key.id());
        self.key_ids.len() - 1
    }

    /// Declare a patch site at text offset `site` branching to text offset
    /// `target`, testing the key in `key_slot` with the given polarity
    pub fn site(
        &mut self,
        site: usize,
        target: usize,
        key_slot: usize,
        polarity: Polarity,
    ) -> &mut Self {
        self.sites.push(SiteDecl {
            site,
            target,
            key_slot,
            polarity,
        });
        self
    }

    /// Allocate the region, emit text, sites, table, and key slots
    pub fn build(&self) -> PatchResult<CodeImage> {
        let width = self.arch.site_width();
        for decl in &self.sites {
            if decl.site + width > self.text.len() {
                return Err(PatchError::Layout {
                    reason: format!(
                        "site at {:#x} ({width} bytes) exceeds text length {}",
                        decl.site,
                        self.text.len()
                    ),
                });
            }
            if decl.key_slot >= self.key_ids.len() {
                return Err(PatchError::Layout {
                    reason: format!("site at {:#x} references undeclared key slot", decl.site),
                });
            }
        }

        let text_len = self.text.len();
        let table_off = text_len.next_multiple_of(ENTRY_ALIGN);
        let table_len = self.sites.len() * ENTRY_SIZE;
        let slots_off = table_off + table_len;
        let total = slots_off + self.key_ids.len() * KEY_SLOT_SIZE;

        let map = Mapping::allocate(total.max(1))?;
        let base = map.rx_base();

        let mut table_builder = TableBuilder::new();
        for &id in &self.key_ids {
            table_builder.key(id as usize);
        }
        for decl in &self.sites {
            table_builder.entry(EntrySpec {
                site: decl.site,
                target: decl.target,
                key_slot: decl.key_slot,
                polarity: decl.polarity,
            });
        }
        let (table_bytes, slot_bytes) = table_builder.build(SectionAddrs {
            text: base,
            table: base + table_off,
            key_slots: base + slots_off,
        })?;

        // Overwrite each site with its initial filler. BranchHint encodes the
        // jump, so far targets fail here rather than at first toggle.
        let mut text = self.text.clone();
        for decl in &self.sites {
            let code = self
                .arch
                .emit_site(self.strategy, base + decl.site, base + decl.target)?;
            text[decl.site..decl.site + width].copy_from_slice(code.as_bytes());
        }

        // Safety: all ranges computed from the layout above
        unsafe {
            map.write(0, &text);
            map.write(table_off, &table_bytes);
            map.write(slots_off, &slot_bytes);
        }
        map.sync_code(0, total.max(1));

        Ok(CodeImage {
            map,
            arch: self.arch,
            text_len,
            table_off,
            table_len,
            slots_off,
            key_count: self.key_ids.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use jump_table::Polarity;

    use super::*;
    use crate::arch::{SiteState, X86_64_FETCH_ATOMIC};
    use crate::key::ToggleKey;

    fn nop_text(len: usize) -> Vec<u8> {
        vec![0x90; len]
    }

    #[test]
    fn test_build_empty_image() {
        let image = ImageBuilder::new(&X86_64_FETCH_ATOMIC)
            .text(&nop_text(16))
            .build()
            .expect("build failed");
        assert_eq!(image.text_len(), 16);
        assert!(image.entry_table().unwrap().is_empty());
    }

    #[test]
    fn test_build_emits_nop_filler() {
        let key = ToggleKey::new_for_test(1);
        let mut builder = ImageBuilder::new(&X86_64_FETCH_ATOMIC);
        let slot = builder.key(&key);
        let image = builder
            .text(&nop_text(32))
            .site(4, 16, slot, Polarity::Direct)
            .build()
            .expect("build failed");

        let mut site = [0u8; 5];
        image.read_code(4, &mut site);
        let nop = X86_64_FETCH_ATOMIC
            .encode(SiteState::Unpatched, 0, 0)
            .unwrap();
        assert_eq!(&site, nop.as_bytes());
    }

    #[test]
    fn test_build_branch_hint_emits_jump() {
        let key = ToggleKey::new_for_test(1);
        let mut builder = ImageBuilder::new(&X86_64_FETCH_ATOMIC);
        let slot = builder.key(&key);
        let image = builder
            .emit_strategy(EmitStrategy::BranchHint)
            .text(&nop_text(32))
            .site(4, 16, slot, Polarity::Direct)
            .build()
            .expect("build failed");

        let mut site = [0u8; 5];
        image.read_code(4, &mut site);
        let jmp = X86_64_FETCH_ATOMIC
            .encode(SiteState::Patched, image.base() + 4, image.base() + 16)
            .unwrap();
        assert_eq!(&site, jmp.as_bytes());
    }

    #[test]
    fn test_entry_table_resolves_into_image() {
        let key = ToggleKey::new_for_test(42);
        let mut builder = ImageBuilder::new(&X86_64_FETCH_ATOMIC);
        let slot = builder.key(&key);
        let image = builder
            .text(&nop_text(64))
            .site(8, 32, slot, Polarity::Inverted)
            .build()
            .expect("build failed");

        let table = image.entry_table().unwrap();
        assert_eq!(table.len(), 1);
        let entry = table.iter().next().unwrap();
        assert_eq!(entry.site_addr(), image.base() + 8);
        assert_eq!(entry.target_addr(), image.base() + 32);
        assert_eq!(entry.polarity(), Polarity::Inverted);
        assert_eq!(image.key_id_at(entry.key_slot_addr()), Some(42));
    }

    #[test]
    fn test_key_id_at_rejects_foreign_address() {
        let key = ToggleKey::new_for_test(1);
        let mut builder = ImageBuilder::new(&X86_64_FETCH_ATOMIC);
        let slot = builder.key(&key);
        let image = builder
            .text(&nop_text(32))
            .site(0, 8, slot, Polarity::Direct)
            .build()
            .expect("build failed");

        assert_eq!(image.key_id_at(0x1000), None);
        assert_eq!(image.key_id_at(image.base()), None);
    }

    #[test]
    fn test_site_past_text_rejected() {
        let key = ToggleKey::new_for_test(1);
        let mut builder = ImageBuilder::new(&X86_64_FETCH_ATOMIC);
        let slot = builder.key(&key);
        let err = builder
            .text(&nop_text(8))
            .site(6, 0, slot, Polarity::Direct)
            .build()
            .unwrap_err();
        assert!(matches!(err, PatchError::Layout { .. }));
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_code_execution() {
        // mov eax, 42; ret
        let code: &[u8] = &[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let image = ImageBuilder::new(&X86_64_FETCH_ATOMIC)
            .text(code)
            .build()
            .expect("build failed");

        unsafe {
            let func: extern "C" fn() -> u32 = image.get_function(0);
            assert_eq!(func(), 42);
        }
    }
}
