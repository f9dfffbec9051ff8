//! Texture cache
//!
//! Textures are requested by name. The cache deduplicates loads, keeps a
//! reverse map so device handles can be released by either key, and
//! memoizes failures in a blacklist so a missing file is hit on disk at
//! most once. Disk access goes through the [`TextureLoader`] seam, which
//! tests replace with an in-memory double.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;
use log::error;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::device::{Device, TextureHandle, TextureParams};

/// Errors from loading a texture image.
#[derive(Debug)]
pub enum TextureError {
    IoError(std::io::Error),
    DecodeError(image::ImageError),
}

impl fmt::Display for TextureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "texture io error: {e}"),
            Self::DecodeError(e) => write!(f, "texture decode error: {e}"),
        }
    }
}

impl std::error::Error for TextureError {}

impl From<std::io::Error> for TextureError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

impl From<image::ImageError> for TextureError {
    fn from(e: image::ImageError) -> Self {
        Self::DecodeError(e)
    }
}

/// Source of texture images, keyed by logical name.
pub trait TextureLoader: Send + Sync {
    /// Load and decode an image.
    ///
    /// # Errors
    ///
    /// Returns [`TextureError`] when the name cannot be read or decoded.
    fn load(&self, name: &str) -> Result<RgbaImage, TextureError>;
}

/// Loader reading `base_dir/name` from disk.
pub struct FileTextureLoader {
    base_dir: PathBuf,
}

impl FileTextureLoader {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl TextureLoader for FileTextureLoader {
    fn load(&self, name: &str) -> Result<RgbaImage, TextureError> {
        let path = self.base_dir.join(name);
        let image = image::open(path)?;
        Ok(image.to_rgba8())
    }
}

/// Cached texture: device handle plus pixel sizes. An invalid handle
/// marks a texture that failed to load.
#[derive(Debug, Clone, Copy)]
pub struct TextureRef {
    pub handle: TextureHandle,
    pub size: (u32, u32),
    pub original_size: (u32, u32),
}

impl TextureRef {
    /// The failed-load placeholder.
    pub const INVALID: Self = Self {
        handle: TextureHandle::INVALID,
        size: (0, 0),
        original_size: (0, 0),
    };

    #[must_use]
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }
}

/// Name-keyed texture cache with failure memoization.
pub struct TextureCache {
    loader: Arc<dyn TextureLoader>,
    params: TextureParams,
    by_name: FxHashMap<String, TextureRef>,
    by_handle: FxHashMap<TextureHandle, String>,
    blacklist: FxHashSet<String>,
}

impl TextureCache {
    #[must_use]
    pub fn new(loader: Arc<dyn TextureLoader>) -> Self {
        Self {
            loader,
            params: TextureParams::default(),
            by_name: FxHashMap::default(),
            by_handle: FxHashMap::default(),
            blacklist: FxHashSet::default(),
        }
    }

    /// Set the creation parameters applied to subsequently loaded
    /// textures.
    pub fn set_params(&mut self, params: TextureParams) {
        self.params = params;
    }

    /// Share the loader, for background pre-loading threads.
    #[must_use]
    pub fn loader(&self) -> Arc<dyn TextureLoader> {
        Arc::clone(&self.loader)
    }

    /// Look up a cached texture without loading.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TextureRef> {
        self.by_name.get(name).copied()
    }

    /// Logical name of a device handle, if the cache owns it.
    #[must_use]
    pub fn name_of(&self, handle: TextureHandle) -> Option<&str> {
        self.by_handle.get(&handle).map(String::as_str)
    }

    /// Load a texture by name, or return the cached result.
    ///
    /// A name that previously failed returns the invalid placeholder
    /// without touching the loader again.
    pub fn load(&mut self, device: &mut dyn Device, name: &str) -> TextureRef {
        if self.blacklist.contains(name) {
            return TextureRef::INVALID;
        }
        if let Some(cached) = self.by_name.get(name) {
            return *cached;
        }

        match self.loader.load(name) {
            Ok(image) => self.upload(device, name, &image),
            Err(err) => {
                error!("Couldn't load texture '{name}': {err}");
                self.blacklist.insert(name.to_string());
                TextureRef::INVALID
            }
        }
    }

    /// Insert an already decoded image under a name, as the background
    /// pre-loader does once decoding finishes on its thread.
    pub fn insert_loaded(
        &mut self,
        device: &mut dyn Device,
        name: &str,
        image: &RgbaImage,
    ) -> TextureRef {
        if let Some(cached) = self.by_name.get(name) {
            return *cached;
        }
        self.blacklist.remove(name);
        self.upload(device, name, image)
    }

    /// Create a texture under a name, or rewrite its pixels if it already
    /// exists. The ground compositor uses this for its tile textures.
    pub fn create_or_update(
        &mut self,
        device: &mut dyn Device,
        name: &str,
        image: &RgbaImage,
    ) -> TextureRef {
        if let Some(cached) = self.by_name.get(name).copied() {
            if cached.is_valid() {
                device.update_texture(cached.handle, image);
                return cached;
            }
            self.by_name.remove(name);
        }
        self.upload(device, name, image)
    }

    /// Release a texture by name.
    pub fn delete_by_name(&mut self, device: &mut dyn Device, name: &str) {
        if let Some(texture) = self.by_name.remove(name) {
            self.by_handle.remove(&texture.handle);
            if texture.is_valid() {
                device.destroy_texture(texture.handle);
            }
        }
    }

    /// Release a texture by device handle.
    pub fn delete(&mut self, device: &mut dyn Device, handle: TextureHandle) {
        if let Some(name) = self.by_handle.remove(&handle) {
            self.by_name.remove(&name);
            device.destroy_texture(handle);
        }
    }

    /// Destroy every cached texture and forget all names, including the
    /// blacklist. Idempotent.
    pub fn flush(&mut self, device: &mut dyn Device) {
        for texture in self.by_name.values() {
            if texture.is_valid() {
                device.destroy_texture(texture.handle);
            }
        }
        self.by_name.clear();
        self.by_handle.clear();
        self.blacklist.clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn upload(&mut self, device: &mut dyn Device, name: &str, image: &RgbaImage) -> TextureRef {
        match device.create_texture(image, &self.params, name) {
            Some(handle) => {
                let texture = TextureRef {
                    handle,
                    size: image.dimensions(),
                    original_size: image.dimensions(),
                };
                self.by_name.insert(name.to_string(), texture);
                self.by_handle.insert(handle, name.to_string());
                texture
            }
            None => {
                error!("Device rejected texture '{name}' ({}x{})", image.width(), image.height());
                self.blacklist.insert(name.to_string());
                TextureRef::INVALID
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl CountingLoader {
        fn new(fail: bool) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl TextureLoader for CountingLoader {
        fn load(&self, _name: &str) -> Result<RgbaImage, TextureError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TextureError::IoError(std::io::Error::from(
                    std::io::ErrorKind::NotFound,
                )))
            } else {
                Ok(RgbaImage::new(8, 8))
            }
        }
    }

    #[test]
    fn test_load_is_cached() {
        let loader = Arc::new(CountingLoader::new(false));
        let mut cache = TextureCache::new(loader.clone());
        let mut device = NullDevice::new(64, 64);

        let a = cache.load(&mut device, "rock.png");
        let b = cache.load(&mut device, "rock.png");
        assert!(a.is_valid());
        assert_eq!(a.handle, b.handle);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(device.textures_created(), 1);
    }

    #[test]
    fn test_blacklist_stops_disk_access() {
        let loader = Arc::new(CountingLoader::new(true));
        let mut cache = TextureCache::new(loader.clone());
        let mut device = NullDevice::new(64, 64);

        assert!(!cache.load(&mut device, "missing.png").is_valid());
        assert!(!cache.load(&mut device, "missing.png").is_valid());
        // The second request never reached the loader.
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_clears_blacklist_and_is_idempotent() {
        let loader = Arc::new(CountingLoader::new(true));
        let mut cache = TextureCache::new(loader.clone());
        let mut device = NullDevice::new(64, 64);

        cache.load(&mut device, "missing.png");
        cache.flush(&mut device);
        cache.flush(&mut device);
        assert!(cache.is_empty());

        // The failure memo is gone, so the loader is consulted again.
        cache.load(&mut device, "missing.png");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delete_by_handle_and_name() {
        let loader = Arc::new(CountingLoader::new(false));
        let mut cache = TextureCache::new(loader);
        let mut device = NullDevice::new(64, 64);

        let a = cache.load(&mut device, "a.png");
        cache.load(&mut device, "b.png");

        cache.delete(&mut device, a.handle);
        assert!(cache.get("a.png").is_none());
        assert!(cache.name_of(a.handle).is_none());

        cache.delete_by_name(&mut device, "b.png");
        assert!(cache.is_empty());
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_create_or_update_reuses_handle() {
        let loader = Arc::new(CountingLoader::new(false));
        let mut cache = TextureCache::new(loader);
        let mut device = NullDevice::new(64, 64);

        let tile = RgbaImage::new(16, 16);
        let first = cache.create_or_update(&mut device, "shadow00", &tile);
        let second = cache.create_or_update(&mut device, "shadow00", &tile);
        assert_eq!(first.handle, second.handle);
        assert_eq!(device.textures_created(), 1);
        assert_eq!(device.texture_uploads(), 1);
    }
}
