//! Table building and parsing
//!
//! The builder runs once, when the code containing the branches is produced:
//! given the final section addresses it emits the packed record bytes and the
//! key-slot words. The parser is the load-time view over an emitted table.

use thiserror::Error;

use crate::entry::{EntryRef, JumpEntry, Polarity, ENTRY_ALIGN, ENTRY_SIZE, KEY_SLOT_SIZE};

/// Table layout errors
#[derive(Debug, Clone, Error)]
pub enum TableError {
    #[error("table base {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: usize, align: usize },

    #[error("table length {len} is not a multiple of the {record}-byte record size")]
    TruncatedTable { len: usize, record: usize },

    #[error("entry references key slot {slot} but only {count} slots were declared")]
    UnknownKeySlot { slot: usize, count: usize },

    #[error("duplicate patch site at text offset {site:#x}")]
    DuplicateSite { site: usize },
}

/// One site description fed to the builder, in text-relative offsets
#[derive(Debug, Clone, Copy)]
pub struct EntrySpec {
    /// Offset of the patch site within the text section
    pub site: usize,
    /// Offset of the taken-branch target within the text section
    pub target: usize,
    /// Index into the key-slot array
    pub key_slot: usize,
    /// Branch polarity of this site
    pub polarity: Polarity,
}

/// Final absolute addresses of the three sections the table ties together
#[derive(Debug, Clone, Copy)]
pub struct SectionAddrs {
    /// Load address of the text section
    pub text: usize,
    /// Load address of the entry table
    pub table: usize,
    /// Load address of the key-slot array
    pub key_slots: usize,
}

/// Builds the packed entry table and key-slot words for one code image
///
/// The builder is address-agnostic until `build` is handed the final section
/// addresses, at which point every field becomes a displacement from its
/// record. Building for a different load address produces a different byte
/// image but identical resolved meaning.
#[derive(Debug, Default)]
pub struct TableBuilder {
    entries: Vec<EntrySpec>,
    key_ids: Vec<usize>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key slot holding `key_id`, returning its slot index
    pub fn key(&mut self, key_id: usize) -> usize {
        self.key_ids.push(key_id);
        self.key_ids.len() - 1
    }

    /// Declare one patch site
    pub fn entry(&mut self, spec: EntrySpec) -> &mut Self {
        self.entries.push(spec);
        self
    }

    /// Number of declared entries
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of declared key slots
    pub fn key_count(&self) -> usize {
        self.key_ids.len()
    }

    /// Emit the packed table bytes and key-slot bytes for the given addresses
    ///
    /// Site offsets must be unique (one record per physical site) and every
    /// referenced key slot must have been declared.
    pub fn build(&self, addrs: SectionAddrs) -> Result<(Vec<u8>, Vec<u8>), TableError> {
        let mut sites: Vec<usize> = self.entries.iter().map(|e| e.site).collect();
        sites.sort_unstable();
        if let Some(dup) = sites.windows(2).find(|w| w[0] == w[1]) {
            return Err(TableError::DuplicateSite { site: dup[0] });
        }

        let mut table = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for (index, spec) in self.entries.iter().enumerate() {
            if spec.key_slot >= self.key_ids.len() {
                return Err(TableError::UnknownKeySlot {
                    slot: spec.key_slot,
                    count: self.key_ids.len(),
                });
            }
            let record_addr = addrs.table + index * ENTRY_SIZE;
            let entry = JumpEntry::pack(
                record_addr,
                addrs.text + spec.site,
                addrs.text + spec.target,
                addrs.key_slots + spec.key_slot * KEY_SLOT_SIZE,
                spec.polarity,
            );
            table.extend_from_slice(&entry.to_bytes());
        }

        let mut slots = Vec::with_capacity(self.key_ids.len() * KEY_SLOT_SIZE);
        for id in &self.key_ids {
            slots.extend_from_slice(&id.to_ne_bytes());
        }

        Ok((table, slots))
    }
}

/// Load-time view over an emitted entry table
#[derive(Debug, Clone, Copy)]
pub struct EntryTable {
    base: usize,
    count: usize,
}

impl EntryTable {
    /// Create a view over the table section at `base` spanning `len` bytes
    ///
    /// # Safety
    ///
    /// The memory range must contain an emitted table that stays live and
    /// unmodified for the lifetime of the view.
    pub unsafe fn from_raw(base: usize, len: usize) -> Result<Self, TableError> {
        if base % ENTRY_ALIGN != 0 {
            return Err(TableError::Misaligned {
                addr: base,
                align: ENTRY_ALIGN,
            });
        }
        if len % ENTRY_SIZE != 0 {
            return Err(TableError::TruncatedTable {
                len,
                record: ENTRY_SIZE,
            });
        }
        Ok(Self {
            base,
            count: len / ENTRY_SIZE,
        })
    }

    /// Number of records in the table
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate the records in emission order
    pub fn iter(&self) -> impl Iterator<Item = EntryRef> + '_ {
        (0..self.count).map(move |i| {
            // Safety: from_raw's contract covers every record in the range
            unsafe { EntryRef::from_addr(self.base + i * ENTRY_SIZE) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a table into a real buffer and return (buffer, table view).
    ///
    /// Layout within the buffer: key slots first, then the table, with the
    /// "text" section placed at a fixed distance below the buffer so site
    /// resolution can be checked against known addresses.
    fn build_into_buffer(specs: &[EntrySpec], keys: &[usize]) -> (Vec<u8>, EntryTable, SectionAddrs) {
        let mut builder = TableBuilder::new();
        for &k in keys {
            builder.key(k);
        }
        for &spec in specs {
            builder.entry(spec);
        }

        let slots_len = keys.len() * KEY_SLOT_SIZE;
        // Slack for aligning both sections within the buffer
        let mut buf = vec![0u8; slots_len + specs.len() * ENTRY_SIZE + 2 * ENTRY_ALIGN + KEY_SLOT_SIZE];
        let base = buf.as_ptr() as usize;
        let slots_addr = base.next_multiple_of(KEY_SLOT_SIZE);
        let table_addr = (slots_addr + slots_len).next_multiple_of(ENTRY_ALIGN);

        let addrs = SectionAddrs {
            text: base.wrapping_sub(0x1_0000),
            table: table_addr,
            key_slots: slots_addr,
        };
        let (table_bytes, slot_bytes) = builder.build(addrs).expect("build failed");

        buf[slots_addr - base..slots_addr - base + slots_len].copy_from_slice(&slot_bytes);
        buf[table_addr - base..table_addr - base + table_bytes.len()]
            .copy_from_slice(&table_bytes);

        let table = unsafe { EntryTable::from_raw(table_addr, table_bytes.len()) }.unwrap();
        (buf, table, addrs)
    }

    #[test]
    fn test_build_and_iterate() {
        let specs = [
            EntrySpec {
                site: 0x10,
                target: 0x40,
                key_slot: 0,
                polarity: Polarity::Direct,
            },
            EntrySpec {
                site: 0x80,
                target: 0x20,
                key_slot: 1,
                polarity: Polarity::Inverted,
            },
        ];
        let (buf, table, addrs) = build_into_buffer(&specs, &[7, 9]);

        assert_eq!(table.len(), 2);
        let resolved: Vec<EntryRef> = table.iter().collect();

        assert_eq!(resolved[0].site_addr(), addrs.text + 0x10);
        assert_eq!(resolved[0].target_addr(), addrs.text + 0x40);
        assert_eq!(resolved[0].key_slot_addr(), addrs.key_slots);
        assert_eq!(resolved[0].polarity(), Polarity::Direct);

        assert_eq!(resolved[1].site_addr(), addrs.text + 0x80);
        assert_eq!(resolved[1].target_addr(), addrs.text + 0x20);
        assert_eq!(resolved[1].key_slot_addr(), addrs.key_slots + KEY_SLOT_SIZE);
        assert_eq!(resolved[1].polarity(), Polarity::Inverted);

        // Key slots hold the declared ids
        let slot0 = usize::from_ne_bytes(
            buf[addrs.key_slots - buf.as_ptr() as usize..][..KEY_SLOT_SIZE]
                .try_into()
                .unwrap(),
        );
        assert_eq!(slot0, 7);
    }

    #[test]
    fn test_duplicate_site_rejected() {
        let mut builder = TableBuilder::new();
        builder.key(1);
        let spec = EntrySpec {
            site: 0x10,
            target: 0x40,
            key_slot: 0,
            polarity: Polarity::Direct,
        };
        builder.entry(spec).entry(spec);

        let err = builder
            .build(SectionAddrs {
                text: 0x1000,
                table: 0x2000,
                key_slots: 0x3000,
            })
            .unwrap_err();
        assert!(matches!(err, TableError::DuplicateSite { site: 0x10 }));
    }

    #[test]
    fn test_unknown_key_slot_rejected() {
        let mut builder = TableBuilder::new();
        builder.entry(EntrySpec {
            site: 0,
            target: 8,
            key_slot: 3,
            polarity: Polarity::Direct,
        });

        let err = builder
            .build(SectionAddrs {
                text: 0x1000,
                table: 0x2000,
                key_slots: 0x3000,
            })
            .unwrap_err();
        assert!(matches!(err, TableError::UnknownKeySlot { slot: 3, count: 0 }));
    }

    #[test]
    fn test_misaligned_table_rejected() {
        let err = unsafe { EntryTable::from_raw(0x1001, ENTRY_SIZE) }.unwrap_err();
        assert!(matches!(err, TableError::Misaligned { .. }));
    }

    #[test]
    fn test_truncated_table_rejected() {
        let err = unsafe { EntryTable::from_raw(0x1000, ENTRY_SIZE + 1) }.unwrap_err();
        assert!(matches!(err, TableError::TruncatedTable { .. }));
    }

    #[test]
    fn test_empty_table() {
        let table = unsafe { EntryTable::from_raw(0x1000, 0) }.unwrap();
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);
    }
}
