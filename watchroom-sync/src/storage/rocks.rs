//! RocksDB-backed entry storage.
//!
//! Column families, routed by key prefix:
//! - `rooms`: `room:{id}` playback hashes
//! - `members`: `users:{id}` and `ready:{id}` sets
//! - `chat`: `chat:{id}` message lists (LZ4 compressed, they are the
//!   only values that grow)
//! - `locks`: `lock:room:{id}` proposal flags
//!
//! Values are bincode-encoded [`Entry`]s; the expiry deadline travels inside
//! the value, so a restart keeps every pending TTL.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};

use super::{Backend, Entry, StoreError};

const CF_ROOMS: &str = "rooms";
const CF_MEMBERS: &str = "members";
const CF_CHAT: &str = "chat";
const CF_LOCKS: &str = "locks";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_MEMBERS, CF_CHAT, CF_LOCKS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("watchroom_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksBackend {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Already LZ4 at the value level.
            CF_CHAT => opts.set_compression_type(DBCompressionType::None),
            // Tiny, short-lived flags.
            CF_LOCKS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn route(key: &str) -> &'static str {
        if key.starts_with("users:") || key.starts_with("ready:") {
            CF_MEMBERS
        } else if key.starts_with("chat:") {
            CF_CHAT
        } else if key.starts_with("lock:") {
            CF_LOCKS
        } else {
            CF_ROOMS
        }
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl Backend for RocksBackend {
    fn load(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let cf_name = Self::route(key);
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            None => Ok(None),
            Some(bytes) if cf_name == CF_CHAT => {
                let raw = lz4_flex::decompress_size_prepended(&bytes)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Entry::decode(&raw).map(Some)
            }
            Some(bytes) => Entry::decode(&bytes).map(Some),
        }
    }

    fn save(&self, key: &str, entry: &Entry) -> Result<(), StoreError> {
        let cf_name = Self::route(key);
        let cf = self.cf(cf_name)?;
        let mut bytes = entry.encode()?;
        if cf_name == CF_CHAT {
            bytes = lz4_flex::compress_prepend_size(&bytes);
        }
        self.db.put_cf_opt(cf, key.as_bytes(), &bytes, &self.write_opts())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf(Self::route(key))?;
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
