use std::{collections::BTreeMap, ops::Bound, path::Path, time::Instant};

use metrics::{counter, histogram};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};

use crate::error::{Result, StoreError};

/// Column map for one logical row. Column names are short ASCII qualifiers
/// ("payload", "deleted", counter names); values are opaque bytes.
pub type Row = BTreeMap<String, Vec<u8>>;

/// Logical tables multiplexed onto one storage handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Token/identifier registry rows and allocation counters.
    Uid,
    /// Primary and child entity rows.
    Entities,
    /// Time-bucketed device event rows.
    Events,
}

impl Table {
    fn prefix(self) -> u8 {
        match self {
            Table::Uid => 0x01,
            Table::Entities => 0x02,
            Table::Events => 0x03,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Table::Uid => "uid",
            Table::Entities => "entities",
            Table::Events => "events",
        }
    }
}

/// Contract this crate requires from the underlying sorted store. Single-row
/// puts, deletes and increments are atomic; nothing spanning rows is.
pub trait KeyValueStore: Send + Sync {
    /// Read a row, or `None` if it does not exist.
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Row>>;

    /// Merge columns into a row, creating it if absent. Existing columns not
    /// named in `columns` are left untouched.
    fn put(&self, table: Table, key: &[u8], columns: Row) -> Result<()>;

    /// Apply several puts as one bulk write.
    fn put_batch(&self, table: Table, rows: Vec<(Vec<u8>, Row)>) -> Result<()>;

    /// Remove an entire row. Removing a missing row is not an error.
    fn delete(&self, table: Table, key: &[u8]) -> Result<()>;

    /// Remove a single column from a row, leaving the rest of the row intact.
    fn delete_column(&self, table: Table, key: &[u8], column: &str) -> Result<()>;

    /// Ordered iteration over `[start, stop)` in lexicographic key order.
    fn scan(&self, table: Table, start: &[u8], stop: &[u8]) -> Result<Vec<(Vec<u8>, Row)>>;

    /// Atomically add `delta` to a big-endian i64 counter column, treating a
    /// missing column as zero, and return the new value.
    fn atomic_increment(&self, table: Table, key: &[u8], column: &str, delta: i64) -> Result<i64>;
}

pub(crate) fn encode_counter(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

pub(crate) fn decode_counter(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Storage(format!("counter column has {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(arr))
}

/// In-memory implementation backed by ordered maps. Used by the test suites
/// and for embedding without a RocksDB directory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<u8, BTreeMap<Vec<u8>, Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Row>> {
        let tables = self.tables.lock();
        Ok(tables
            .get(&table.prefix())
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&self, table: Table, key: &[u8], columns: Row) -> Result<()> {
        let mut tables = self.tables.lock();
        let row = tables
            .entry(table.prefix())
            .or_default()
            .entry(key.to_vec())
            .or_default();
        for (column, value) in columns {
            row.insert(column, value);
        }
        Ok(())
    }

    fn put_batch(&self, table: Table, rows: Vec<(Vec<u8>, Row)>) -> Result<()> {
        let mut tables = self.tables.lock();
        let entries = tables.entry(table.prefix()).or_default();
        for (key, columns) in rows {
            let row = entries.entry(key).or_default();
            for (column, value) in columns {
                row.insert(column, value);
            }
        }
        Ok(())
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(rows) = tables.get_mut(&table.prefix()) {
            rows.remove(key);
        }
        Ok(())
    }

    fn delete_column(&self, table: Table, key: &[u8], column: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables
            .get_mut(&table.prefix())
            .and_then(|rows| rows.get_mut(key))
        {
            row.remove(column);
        }
        Ok(())
    }

    fn scan(&self, table: Table, start: &[u8], stop: &[u8]) -> Result<Vec<(Vec<u8>, Row)>> {
        let tables = self.tables.lock();
        let Some(rows) = tables.get(&table.prefix()) else {
            return Ok(Vec::new());
        };
        let range = (
            Bound::Included(start.to_vec()),
            Bound::Excluded(stop.to_vec()),
        );
        Ok(rows
            .range(range)
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect())
    }

    fn atomic_increment(&self, table: Table, key: &[u8], column: &str, delta: i64) -> Result<i64> {
        let mut tables = self.tables.lock();
        let row = tables
            .entry(table.prefix())
            .or_default()
            .entry(key.to_vec())
            .or_default();
        let current = match row.get(column) {
            Some(bytes) => decode_counter(bytes)?,
            None => 0,
        };
        let next = current.wrapping_add(delta);
        row.insert(column.to_string(), encode_counter(next));
        Ok(next)
    }
}

/// RocksDB-backed implementation. Each logical row is stored as one RocksDB
/// entry (table prefix byte + row key) whose value is the serialized column
/// map, so scan order matches row-key order exactly. Read-modify-write paths
/// (merge puts, increments) are serialized by a write lock; readers go
/// straight to the db.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path.as_ref())
            .map_err(|err| StoreError::Storage(err.to_string()))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn storage_key(table: Table, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(key.len() + 1);
        full.push(table.prefix());
        full.extend_from_slice(key);
        full
    }

    fn load_row(&self, table: Table, key: &[u8]) -> Result<Option<Row>> {
        let raw = self
            .db
            .get(Self::storage_key(table, key))
            .map_err(|err| StoreError::Storage(err.to_string()))?;
        match raw {
            Some(bytes) => {
                let row = serde_json::from_slice(&bytes)
                    .map_err(|err| StoreError::Storage(format!("corrupt row: {err}")))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn store_row(&self, batch: &mut WriteBatch, table: Table, key: &[u8], row: &Row) -> Result<()> {
        let bytes = serde_json::to_vec(row)?;
        batch.put(Self::storage_key(table, key), bytes);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db
            .write(batch)
            .map_err(|err| StoreError::Storage(err.to_string()))
    }
}

fn record_store_op(table: Table, op: &'static str, status: &'static str, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    counter!("fleetstore_store_ops_total", "table" => table.as_str(), "op" => op, "status" => status)
        .increment(1);
    histogram!("fleetstore_store_op_seconds", "table" => table.as_str(), "op" => op)
        .record(elapsed);
}

impl KeyValueStore for RocksStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Row>> {
        let started = Instant::now();
        let result = self.load_row(table, key);
        record_store_op(
            table,
            "get",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn put(&self, table: Table, key: &[u8], columns: Row) -> Result<()> {
        let started = Instant::now();
        let _guard = self.write_lock.lock();
        let result = (|| {
            let mut row = self.load_row(table, key)?.unwrap_or_default();
            for (column, value) in columns {
                row.insert(column, value);
            }
            let mut batch = WriteBatch::default();
            self.store_row(&mut batch, table, key, &row)?;
            self.write(batch)
        })();
        record_store_op(
            table,
            "put",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn put_batch(&self, table: Table, rows: Vec<(Vec<u8>, Row)>) -> Result<()> {
        let started = Instant::now();
        let _guard = self.write_lock.lock();
        let result = (|| {
            let mut batch = WriteBatch::default();
            for (key, columns) in rows {
                let mut row = self.load_row(table, &key)?.unwrap_or_default();
                for (column, value) in columns {
                    row.insert(column, value);
                }
                self.store_row(&mut batch, table, &key, &row)?;
            }
            self.write(batch)
        })();
        record_store_op(
            table,
            "put_batch",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        let started = Instant::now();
        let _guard = self.write_lock.lock();
        let result = self
            .db
            .delete(Self::storage_key(table, key))
            .map_err(|err| StoreError::Storage(err.to_string()));
        record_store_op(
            table,
            "delete",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn delete_column(&self, table: Table, key: &[u8], column: &str) -> Result<()> {
        let started = Instant::now();
        let _guard = self.write_lock.lock();
        let result = (|| {
            let Some(mut row) = self.load_row(table, key)? else {
                return Ok(());
            };
            row.remove(column);
            let mut batch = WriteBatch::default();
            self.store_row(&mut batch, table, key, &row)?;
            self.write(batch)
        })();
        record_store_op(
            table,
            "delete_column",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn scan(&self, table: Table, start: &[u8], stop: &[u8]) -> Result<Vec<(Vec<u8>, Row)>> {
        let started = Instant::now();
        let result = (|| {
            let start_key = Self::storage_key(table, start);
            let stop_key = Self::storage_key(table, stop);
            let iter = self
                .db
                .iterator(IteratorMode::From(&start_key, Direction::Forward));

            let mut rows = Vec::new();
            for item in iter {
                let (key, value) = item.map_err(|err| StoreError::Storage(err.to_string()))?;
                if key.as_ref() >= stop_key.as_slice() {
                    break;
                }
                if key.first() != Some(&table.prefix()) {
                    break;
                }
                let row: Row = serde_json::from_slice(&value)
                    .map_err(|err| StoreError::Storage(format!("corrupt row: {err}")))?;
                rows.push((key[1..].to_vec(), row));
            }
            Ok(rows)
        })();
        record_store_op(
            table,
            "scan",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }

    fn atomic_increment(&self, table: Table, key: &[u8], column: &str, delta: i64) -> Result<i64> {
        let started = Instant::now();
        let _guard = self.write_lock.lock();
        let result = (|| {
            let mut row = self.load_row(table, key)?.unwrap_or_default();
            let current = match row.get(column) {
                Some(bytes) => decode_counter(bytes)?,
                None => 0,
            };
            let next = current.wrapping_add(delta);
            row.insert(column.to_string(), encode_counter(next));
            let mut batch = WriteBatch::default();
            self.store_row(&mut batch, table, key, &row)?;
            self.write(batch)?;
            Ok(next)
        })();
        record_store_op(
            table,
            "increment",
            if result.is_ok() { "ok" } else { "err" },
            started,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(columns: &[(&str, &[u8])]) -> Row {
        columns
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_vec()))
            .collect()
    }

    #[test]
    fn put_merges_columns() {
        let store = MemoryStore::new();
        store
            .put(Table::Entities, b"k", row(&[("a", b"1"), ("b", b"2")]))
            .unwrap();
        store.put(Table::Entities, b"k", row(&[("b", b"3")])).unwrap();

        let loaded = store.get(Table::Entities, b"k").unwrap().unwrap();
        assert_eq!(loaded.get("a").unwrap(), b"1");
        assert_eq!(loaded.get("b").unwrap(), b"3");
    }

    #[test]
    fn scan_is_bounded_and_ordered() {
        let store = MemoryStore::new();
        for key in [&b"\x01\x00"[..], b"\x01\x01", b"\x02\x00", b"\x00\xff"] {
            store.put(Table::Entities, key, row(&[("v", key)])).unwrap();
        }
        let rows = store.scan(Table::Entities, b"\x01", b"\x02").unwrap();
        let keys: Vec<_> = rows.iter().map(|(key, _)| key.clone()).collect();
        assert_eq!(keys, vec![b"\x01\x00".to_vec(), b"\x01\x01".to_vec()]);
    }

    #[test]
    fn tables_are_isolated() {
        let store = MemoryStore::new();
        store.put(Table::Uid, b"k", row(&[("v", b"uid")])).unwrap();
        assert!(store.get(Table::Entities, b"k").unwrap().is_none());
    }

    #[test]
    fn rocks_store_round_trips_rows_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        store
            .put(Table::Entities, b"\x01\x00", row(&[("payload", b"a")]))
            .unwrap();
        store
            .put(Table::Entities, b"\x01\x01", row(&[("payload", b"b")]))
            .unwrap();
        store
            .put(Table::Entities, b"\x01\x00", row(&[("deleted", &[0x01])]))
            .unwrap();

        let merged = store.get(Table::Entities, b"\x01\x00").unwrap().unwrap();
        assert_eq!(merged.get("payload").unwrap(), b"a");
        assert!(merged.contains_key("deleted"));

        let rows = store.scan(Table::Entities, b"\x01", b"\x02").unwrap();
        assert_eq!(rows.len(), 2);

        assert_eq!(store.atomic_increment(Table::Uid, b"c", "n", 1).unwrap(), 1);
        assert_eq!(store.atomic_increment(Table::Uid, b"c", "n", 1).unwrap(), 2);
    }

    #[test]
    fn increment_starts_from_zero_and_descends_with_negative_delta() {
        let store = MemoryStore::new();
        assert_eq!(store.atomic_increment(Table::Uid, b"c", "n", 1).unwrap(), 1);
        assert_eq!(store.atomic_increment(Table::Uid, b"c", "n", 1).unwrap(), 2);

        store
            .put(Table::Uid, b"d", row(&[("n", &encode_counter(i64::MAX))]))
            .unwrap();
        assert_eq!(
            store.atomic_increment(Table::Uid, b"d", "n", -1).unwrap(),
            i64::MAX - 1
        );
    }
}
