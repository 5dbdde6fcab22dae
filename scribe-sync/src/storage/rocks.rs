//! RocksDB-backed operation store.
//!
//! Column families:
//! - `operations`: accepted operations, keyed by `<document key><version: 8 bytes BE>`,
//!   value is the JSON-encoded operation, LZ4 compressed
//! - `metadata`: per-document metadata (bincode), keyed by `<document key>`
//!
//! The document key is the id's UTF-8 bytes prefixed by their length (u16 BE),
//! so one document's operations form a contiguous, version-ordered range.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{OperationStore, StoreError};
use crate::protocol::{DocumentId, Operation};

const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored next to the operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document: String,
    /// Version of the last recorded operation
    pub version: u64,
    /// Operations currently stored (after compaction)
    pub operation_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document: &DocumentId) -> Self {
        let now = unix_secs();
        Self {
            document: document.as_str().to_string(),
            version: 0,
            operation_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed store of accepted operations.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened operation store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Values are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    /// Load document metadata, if the document was ever written.
    pub fn load_metadata(&self, document: &DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_key(document))? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// All documents with recorded operations.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut documents = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            documents.push(DocumentId::new(DocumentMetadata::decode(&value)?.document));
        }
        Ok(documents)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

impl OperationStore for RocksStore {
    fn load_current_version(&self, document: &DocumentId) -> Result<u64, StoreError> {
        Ok(self.load_metadata(document)?.map_or(0, |meta| meta.version))
    }

    fn append_operations(&self, document: &DocumentId, operations: &[Operation]) -> Result<(), StoreError> {
        let Some(last) = operations.last() else {
            return Ok(());
        };
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for op in operations {
            let json = serde_json::to_vec(op).map_err(|e| StoreError::Serialization(e.to_string()))?;
            let compressed = lz4_flex::compress_prepend_size(&json);
            batch.put_cf(cf_ops, operation_key(document, op.version), compressed);
        }

        let mut meta = self
            .load_metadata(document)?
            .unwrap_or_else(|| DocumentMetadata::new(document));
        meta.version = meta.version.max(last.version);
        meta.operation_count += operations.len() as u64;
        meta.updated_at = unix_secs();
        batch.put_cf(cf_meta, document_key(document), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn load_operations_since(&self, document: &DocumentId, since: u64) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = document_key(document);
        let start = operation_key(document, since.saturating_add(1));

        let mut operations = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let json = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let op: Operation =
                serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
            operations.push(op);
        }
        Ok(operations)
    }
}

/// `<len: u16 BE><utf-8 bytes>`
fn document_key(document: &DocumentId) -> Vec<u8> {
    let bytes = document.as_str().as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    let mut key = Vec::with_capacity(2 + len + 8);
    key.extend_from_slice(&(len as u16).to_be_bytes());
    key.extend_from_slice(&bytes[..len]);
    key
}

fn operation_key(document: &DocumentId, version: u64) -> Vec<u8> {
    let mut key = document_key(document);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(version: u64, target: &str) -> Operation {
        let mut op = Operation::insert(target, format!("v{version}"), version - 1);
        op.version = version;
        op
    }

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_unknown_document_is_version_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = DocumentId::from("missing");
        assert_eq!(store.load_current_version(&doc).unwrap(), 0);
        assert!(store.load_metadata(&doc).unwrap().is_none());
        assert!(store.load_operations_since(&doc, 0).unwrap().is_empty());
    }

    #[test]
    fn test_append_updates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let doc = DocumentId::from("D");

        store.append_operations(&doc, &[op(1, "a"), op(2, "b")]).unwrap();
        store.append_operations(&doc, &[op(3, "a")]).unwrap();

        let meta = store.load_metadata(&doc).unwrap().unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.operation_count, 3);
        assert_eq!(meta.document, "D");
        assert_eq!(store.load_current_version(&doc).unwrap(), 3);
    }

    #[test]
    fn test_load_since_is_ordered_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let d = DocumentId::from("D");
        // "D" is a prefix of "DD"; the length prefix keeps their ranges apart
        let dd = DocumentId::from("DD");

        store.append_operations(&d, &[op(1, "a"), op(2, "b"), op(3, "c")]).unwrap();
        store.append_operations(&dd, &[op(1, "z")]).unwrap();

        let loaded = store.load_operations_since(&d, 1).unwrap();
        let versions: Vec<u64> = loaded.iter().map(|op| op.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(loaded[0].target, "b");

        assert_eq!(store.load_operations_since(&dd, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = DocumentId::from("D");
        {
            let store = open(&dir);
            store.append_operations(&doc, &[op(1, "a"), op(2, "a")]).unwrap();
            store.flush().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.load_current_version(&doc).unwrap(), 2);
        assert_eq!(store.load_operations_since(&doc, 0).unwrap()[1], op(2, "a"));
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }
}
