//! Image registry store: image -> discovered CLIs, plus the routes that
//! expose them.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::info;

use crate::error::RegistryError;
use crate::routes::{RouteDescriptor, RouteTable};
use crate::types::{CliEntry, ImageRef, RegistryRecord};

#[derive(Default)]
struct Inner {
    images: RegistryRecord,
    routes: RouteTable,
}

/// Every mutation goes through a single write lock so readers see the
/// record and the route table change together.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, RegistryError> {
        self.inner.read().map_err(|_| RegistryError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, RegistryError> {
        self.inner.write().map_err(|_| RegistryError::Poisoned)
    }

    /// Replace all entries for `image` and publish their routes. Entries
    /// must all belong to `image`.
    pub fn upsert(&self, image: &ImageRef, entries: Vec<CliEntry>) -> Result<(), RegistryError> {
        if entries.iter().any(|e| &e.image != image) {
            return Err(RegistryError::StoreConflict(image.to_string()));
        }

        let mut inner = self.write()?;
        inner.routes.unpublish(image);
        inner.routes.publish(&entries);

        let clis: BTreeMap<String, CliEntry> =
            entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        info!("Registered {} CLI(s) for {}", clis.len(), image);
        inner
            .images
            .entry(image.repository.clone())
            .or_default()
            .insert(image.version().to_string(), clis);
        Ok(())
    }

    /// Remove the metadata and routes of `image`. Returns whether it was
    /// registered; removing an unknown image is a no-op.
    pub fn remove(&self, image: &ImageRef) -> Result<bool, RegistryError> {
        let mut inner = self.write()?;
        inner.routes.unpublish(image);

        let Some(versions) = inner.images.get_mut(&image.repository) else {
            return Ok(false);
        };
        let existed = versions.remove(image.version()).is_some();
        if versions.is_empty() {
            inner.images.remove(&image.repository);
        }
        if existed {
            info!("Removed metadata for {}", image);
        }
        Ok(existed)
    }

    pub fn contains(&self, image: &ImageRef) -> Result<bool, RegistryError> {
        Ok(self
            .read()?
            .images
            .get(&image.repository)
            .is_some_and(|v| v.contains_key(image.version())))
    }

    /// Point-in-time copy of every registered image.
    pub fn list(&self) -> Result<RegistryRecord, RegistryError> {
        Ok(self.read()?.images.clone())
    }

    /// Resolve a published route to its descriptor and entry.
    pub fn route(&self, path: &str) -> Result<Option<(RouteDescriptor, CliEntry)>, RegistryError> {
        let inner = self.read()?;
        let Some(descriptor) = inner.routes.lookup(path) else {
            return Ok(None);
        };
        let entry = inner
            .images
            .get(&descriptor.image.repository)
            .and_then(|v| v.get(descriptor.image.version()))
            .and_then(|clis| clis.get(&descriptor.cli))
            .cloned();
        Ok(entry.map(|e| (descriptor.clone(), e)))
    }

    pub fn route_count(&self) -> Result<usize, RegistryError> {
        Ok(self.read()?.routes.len())
    }
}
