//! Cache factory for creating cache backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{CacheBackend, CacheConfig};

use super::{MemoryNumberCache, PersistentNumberCache, SharedCache};

/// Resolve the data directory.
fn resolve_data_dir(config_path: Option<&Path>) -> PathBuf {
    match config_path {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path),
        None => PathBuf::from("./data/numberd"),
    }
}

/// Create a cache backend based on configuration.
pub fn create_cache(config: &CacheConfig) -> anyhow::Result<SharedCache> {
    match config.backend {
        CacheBackend::Memory => {
            tracing::info!("using in-memory number cache (volatile)");
            Ok(Arc::new(MemoryNumberCache::new()))
        }
        CacheBackend::Fjall => {
            let data_dir = resolve_data_dir(config.path.as_deref());
            tracing::info!(path = %data_dir.display(), "using persistent number cache");
            Ok(PersistentNumberCache::open(&data_dir)? as SharedCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocationKey;

    #[test]
    fn test_resolve_data_dir_explicit_absolute() {
        let path = Path::new("/custom/data/path");
        assert_eq!(resolve_data_dir(Some(path)), path);
    }

    #[test]
    fn test_resolve_data_dir_explicit_relative() {
        let resolved = resolve_data_dir(Some(Path::new("./my-data")));
        assert!(resolved.ends_with("my-data"));
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_create_memory_cache() {
        let cache = create_cache(&CacheConfig::memory()).unwrap();
        assert_eq!(cache.name(), "memory");

        let key = LocationKey::new("p1", "l1");
        cache.seed_usage(&key, "+1", 2).unwrap();
        assert_eq!(cache.usage(&key).unwrap(), vec![("+1".to_string(), 2)]);
    }

    #[test]
    fn test_create_fjall_cache() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let cache = create_cache(&CacheConfig::fjall(temp_dir.path())).unwrap();
        assert_eq!(cache.name(), "fjall");
    }
}
