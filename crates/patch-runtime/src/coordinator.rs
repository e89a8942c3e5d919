//! The toggle coordinator: public state-machine surface over keys and images
//!
//! All mutation - toggling, attaching, detaching - runs under one
//! process-wide lock, serializing concurrent toggle requests against each
//! other. `is_enabled` never takes that lock: it reads the key's atomic
//! count, which is published only after a physical pass commits, so during an
//! in-flight pass readers see the pre-transition value.
//!
//! Per key the state machine is disabled <-> enabling <-> enabled <->
//! disabling; the in-progress states exist only for the duration of the
//! engine call and are not observable from outside.
//!
//! Attaching an image scans its entry table and binds every record to its
//! key *before* handing out the image id, and normalizes each site to the
//! key's current logical state in one batch. A record referencing a key this
//! coordinator never registered is a loading-protocol bug and panics.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use jump_table::EntryRef;

use crate::{
    arch::SiteState,
    engine::{PatchEngine, Quiesce},
    error::{PatchError, PatchResult},
    image::CodeImage,
    key::ToggleKey,
};

/// Identifier of an attached code image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(u64);

/// One entry bound to a key: the owning image and the record's address
///
/// Only the record address is stored; site and target are resolved from the
/// record on every pass, never cached.
struct Binding {
    image: u64,
    record_addr: usize,
}

struct KeyRecord {
    key: ToggleKey,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Registry {
    keys: HashMap<u64, KeyRecord>,
    images: HashMap<u64, Arc<CodeImage>>,
    next_key: u64,
    next_image: u64,
}

/// Coordinator over toggle keys, attached images, and the patch engine
pub struct Toggles {
    engine: PatchEngine,
    registry: Mutex<Registry>,
}

impl Default for Toggles {
    fn default() -> Self {
        Self::new()
    }
}

impl Toggles {
    pub fn new() -> Self {
        Self {
            engine: PatchEngine::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Create a coordinator whose engine synchronizes through `quiescer`
    pub fn with_quiescer(quiescer: Box<dyn Quiesce>) -> Self {
        Self {
            engine: PatchEngine::with_quiescer(quiescer),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The engine, exposing the synchronization-pass counter
    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    /// Register a new toggle key
    pub fn register_key(&self, initial: bool) -> ToggleKey {
        let mut registry = self.lock();
        let id = registry.next_key;
        registry.next_key += 1;
        let key = ToggleKey::new(id, initial);
        registry.keys.insert(
            id,
            KeyRecord {
                key: key.clone(),
                bindings: Vec::new(),
            },
        );
        key
    }

    /// Current logical state of a key; lock-free
    pub fn is_enabled(&self, key: &ToggleKey) -> bool {
        key.is_enabled()
    }

    /// Attach a code image: scan its entries, bind them to their keys, and
    /// normalize every site to its key's logical state
    ///
    /// Runs before the image id is handed out, i.e. before the code is
    /// published to executors. The normalization is one engine batch.
    pub fn attach(&self, image: CodeImage) -> PatchResult<ImageId> {
        let mut registry = self.lock();
        let table = image.entry_table()?;

        let mut bindings = Vec::with_capacity(table.len());
        let mut writes = Vec::new();
        for entry in table.iter() {
            let site_off = image.site_offset(entry.site_addr()).unwrap_or_else(|| {
                panic!(
                    "integrity violation: entry site {:#x} outside image text",
                    entry.site_addr()
                )
            });
            let key_id = image.key_id_at(entry.key_slot_addr()).unwrap_or_else(|| {
                panic!(
                    "integrity violation: dangling key reference {:#x}",
                    entry.key_slot_addr()
                )
            });
            let record = registry.keys.get(&key_id).unwrap_or_else(|| {
                panic!("integrity violation: entry references unregistered key {key_id}")
            });

            let desired =
                SiteState::from_branch(entry.polarity().branch_state(record.key.is_enabled()));
            if let Some(write) =
                self.engine
                    .prepare_init(&image, site_off, entry.target_addr(), desired)?
            {
                writes.push(write);
            }
            bindings.push((key_id, entry.record_addr()));
        }

        self.engine.apply(&writes);
        drop(writes);

        let id = registry.next_image;
        registry.next_image += 1;
        for (key_id, record_addr) in bindings {
            registry
                .keys
                .get_mut(&key_id)
                .expect("key validated above")
                .bindings
                .push(Binding {
                    image: id,
                    record_addr,
                });
        }
        registry.images.insert(id, Arc::new(image));
        Ok(ImageId(id))
    }

    /// Shared handle to an attached image
    ///
    /// The handle stays valid across detach: the mapping is released when the
    /// last handle drops, so readers never end up pointing at unmapped
    /// memory. Detached images are merely excluded from all future passes.
    pub fn image(&self, id: ImageId) -> PatchResult<Arc<CodeImage>> {
        let registry = self.lock();
        registry
            .images
            .get(&id.0)
            .cloned()
            .ok_or(PatchError::UnknownImage { id: id.0 })
    }

    /// Detach an image: unbind every entry it contributed and release it
    ///
    /// The code is going away with the image, so its sites are not rewritten;
    /// they are only excluded from all future passes. After detach, toggling
    /// the keys it referenced touches zero sites from this image.
    pub fn detach(&self, id: ImageId) -> PatchResult<()> {
        let mut registry = self.lock();
        let image = registry
            .images
            .remove(&id.0)
            .ok_or(PatchError::UnknownImage { id: id.0 })?;
        for record in registry.keys.values_mut() {
            record.bindings.retain(|binding| binding.image != id.0);
        }
        drop(image);
        Ok(())
    }

    /// Enable a key, patching its sites when the count crosses zero
    pub fn enable(&self, key: &ToggleKey) -> PatchResult<()> {
        self.transition(&[key], true)
    }

    /// Disable a key, patching its sites when the count returns to zero
    ///
    /// Panics on an unbalanced disable.
    pub fn disable(&self, key: &ToggleKey) -> PatchResult<()> {
        self.transition(&[key], false)
    }

    /// Enable several keys under one synchronization pass
    ///
    /// All zero-crossing keys' site changes go into a single engine batch,
    /// so toggling N keys costs one barrier, not N.
    pub fn enable_many(&self, keys: &[&ToggleKey]) -> PatchResult<()> {
        self.transition(keys, true)
    }

    /// Disable several keys under one synchronization pass
    pub fn disable_many(&self, keys: &[&ToggleKey]) -> PatchResult<()> {
        self.transition(keys, false)
    }

    fn transition(&self, keys: &[&ToggleKey], enable: bool) -> PatchResult<()> {
        let registry = self.lock();

        // Prepare the full batch first: a range failure discards everything
        // before any count or byte changes
        let mut batch = Vec::new();
        for key in keys {
            let count = key.count();
            if !enable && count <= 0 {
                panic!("unbalanced disable of key {}", key.id());
            }
            let crossing = if enable { count == 0 } else { count == 1 };
            if !crossing {
                continue;
            }

            let record = registry.keys.get(&key.id()).unwrap_or_else(|| {
                panic!("key {} is not registered with this coordinator", key.id())
            });
            for binding in &record.bindings {
                let image = registry
                    .images
                    .get(&binding.image)
                    .expect("binding outlived its image");
                // Safety: the record lives in the image's table section,
                // which is alive while the image is attached
                let entry = unsafe { EntryRef::from_addr(binding.record_addr) };
                let site_off = image
                    .site_offset(entry.site_addr())
                    .expect("bound entry site left the text section");

                let old = SiteState::from_branch(entry.polarity().branch_state(!enable));
                let new = SiteState::from_branch(entry.polarity().branch_state(enable));
                batch.push(self.engine.prepare(
                    image,
                    site_off,
                    entry.target_addr(),
                    old,
                    new,
                )?);
            }
        }

        self.engine.apply(&batch);
        drop(batch);

        // Publish the logical state only after the physical pass committed
        let delta = if enable { 1 } else { -1 };
        for key in keys {
            key.store_count(key.count() + delta);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .expect("toggle registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_is_exact() {
        let toggles = Toggles::new();
        let key = toggles.register_key(false);
        assert!(!toggles.is_enabled(&key));

        for _ in 0..3 {
            toggles.enable(&key).unwrap();
        }
        assert!(toggles.is_enabled(&key));

        toggles.disable(&key).unwrap();
        toggles.disable(&key).unwrap();
        assert!(toggles.is_enabled(&key));
        toggles.disable(&key).unwrap();
        assert!(!toggles.is_enabled(&key));
    }

    #[test]
    fn test_key_registered_enabled() {
        let toggles = Toggles::new();
        let key = toggles.register_key(true);
        assert!(toggles.is_enabled(&key));
        toggles.disable(&key).unwrap();
        assert!(!toggles.is_enabled(&key));
    }

    #[test]
    #[should_panic(expected = "unbalanced disable")]
    fn test_unbalanced_disable_is_fatal() {
        let toggles = Toggles::new();
        let key = toggles.register_key(false);
        let _ = toggles.disable(&key);
    }

    #[test]
    fn test_detach_unknown_image() {
        let toggles = Toggles::new();
        let err = toggles.detach(ImageId(99)).unwrap_err();
        assert!(matches!(err, PatchError::UnknownImage { id: 99 }));
    }

    #[test]
    fn test_toggling_entryless_key_pays_no_sync() {
        let toggles = Toggles::new();
        let key = toggles.register_key(false);
        toggles.enable(&key).unwrap();
        toggles.disable(&key).unwrap();
        assert_eq!(toggles.engine().sync_passes(), 0);
    }
}
