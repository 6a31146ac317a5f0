//! Disk arrays as checkpointed storage state.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::storage::checkpoint::StorageState;
use crate::storage::disk_array::{ArrayElement, DiskArray, DiskArrayCollection};
use crate::storage::manager::StorageManager;
use crate::types::Result;

/// One lazily created [`DiskArrayCollection`] whose first header page is
/// recorded in the metadata range.
pub struct ArrayStore {
    bypass_shadowing: bool,
    collection: Mutex<Option<Arc<DiskArrayCollection>>>,
}

impl ArrayStore {
    /// Creates an empty store. `bypass_shadowing` lets arrays write pages
    /// allocated since the last checkpoint in place.
    pub fn new(bypass_shadowing: bool) -> Self {
        Self {
            bypass_shadowing,
            collection: Mutex::new(None),
        }
    }

    /// The collection, created on first use.
    pub fn collection(&self, storage: &StorageManager) -> Result<Arc<DiskArrayCollection>> {
        let mut slot = self.collection.lock();
        if let Some(collection) = slot.as_ref() {
            return Ok(collection.clone());
        }
        let collection = Arc::new(DiskArrayCollection::create(
            storage.allocator(),
            storage.shadow().clone(),
            self.bypass_shadowing,
        )?);
        *slot = Some(collection.clone());
        Ok(collection)
    }

    /// Adds an empty array and returns its index with a typed handle.
    pub fn create_array<T: ArrayElement>(&self, storage: &StorageManager) -> Result<(usize, DiskArray<T>)> {
        let collection = self.collection(storage)?;
        let idx = collection.add_disk_array();
        Ok((idx, collection.get_disk_array(idx)?))
    }

    /// Typed handle on array `idx`.
    pub fn array<T: ArrayElement>(&self, storage: &StorageManager, idx: usize) -> Result<DiskArray<T>> {
        self.collection(storage)?.get_disk_array(idx)
    }

    /// Number of arrays, including ones not yet checkpointed.
    pub fn num_arrays(&self) -> usize {
        self.collection
            .lock()
            .as_ref()
            .map_or(0, |collection| collection.num_disk_arrays())
    }

    fn current(&self) -> Option<Arc<DiskArrayCollection>> {
        self.collection.lock().clone()
    }
}

impl StorageState for ArrayStore {
    fn checkpoint(&self, storage: &StorageManager) -> Result<bool> {
        let Some(collection) = self.current() else {
            return Ok(false);
        };
        if !collection.has_changes() {
            return Ok(false);
        }
        collection.checkpoint(storage.allocator())?;
        Ok(true)
    }

    fn serialize(&self, ser: &mut Serializer<'_>) -> Result<()> {
        ser.write_debugging_info("array_store")?;
        ser.write_page_opt(self.current().and_then(|collection| collection.first_page()))
    }

    fn deserialize(&self, storage: &StorageManager, de: &mut Deserializer<'_>) -> Result<()> {
        de.validate_debugging_info("array_store")?;
        let collection = match de.read_page_opt()? {
            Some(first) => Some(Arc::new(DiskArrayCollection::open(
                storage.data_fh().clone(),
                storage.shadow().clone(),
                first,
                self.bypass_shadowing,
            )?)),
            None => None,
        };
        debug!(
            arrays = collection.as_ref().map_or(0, |c| c.num_disk_arrays()),
            "array_store.open"
        );
        *self.collection.lock() = collection;
        Ok(())
    }

    fn finalize_checkpoint(&self, _storage: &StorageManager) -> Result<()> {
        if let Some(collection) = self.current() {
            collection.checkpoint_in_memory();
        }
        Ok(())
    }

    fn rollback_checkpoint(&self, _storage: &StorageManager) -> Result<()> {
        let mut slot = self.collection.lock();
        if let Some(collection) = slot.as_ref() {
            collection.rollback_in_memory();
            if collection.first_page().is_none() {
                *slot = None;
            }
        }
        Ok(())
    }
}
