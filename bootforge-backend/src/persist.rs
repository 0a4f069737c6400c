// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent storage for tracker entities.
//!
//! The tracker treats persistence as an opaque key/value sink: one namespace
//! per entity prefix, JSON documents keyed by entity key.  Two
//! implementations exist: an in-memory one for tests and ephemeral servers,
//! and a sled-backed one for real deployments.  Writes happen inside the
//! tracker's lock scope, so a slow disk serializes mutators of the same
//! prefix and nothing else.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bootforge_common::Error;
use camino::Utf8Path;

/// An opaque per-prefix key/value sink and source.
pub trait PersistentStore: Send + Sync {
    fn save(&self, prefix: &str, key: &str, val: &[u8]) -> Result<(), Error>;
    fn load(&self, prefix: &str, key: &str) -> Result<Option<Vec<u8>>, Error>;
    fn remove(&self, prefix: &str, key: &str) -> Result<(), Error>;
    /// Every key currently present under `prefix`, in key order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Volatile storage.  Everything is forgotten when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl PersistentStore for MemoryStore {
    fn save(&self, prefix: &str, key: &str, val: &[u8]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        data.entry(prefix.to_string())
            .or_default()
            .insert(key.to_string(), val.to_vec());
        Ok(())
    }

    fn load(&self, prefix: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data.get(prefix).and_then(|t| t.get(key)).cloned())
    }

    fn remove(&self, prefix: &str, key: &str) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        data.get_mut(prefix).and_then(|t| t.remove(key));
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data
            .get(prefix)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// Durable storage on a sled database: one tree per prefix, JSON values.
///
/// Each database is only ever read and written by one version of this
/// program, so there is no schema migration machinery here.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Utf8Path) -> Result<SledStore, Error> {
        let db = sled::open(path.as_std_path()).map_err(|e| {
            Error::backend(format!("open database {:?}: {}", path, e))
        })?;
        Ok(SledStore { db })
    }

    fn tree(&self, prefix: &str) -> Result<sled::Tree, Error> {
        self.db.open_tree(prefix).map_err(|e| {
            Error::backend(format!("open tree {:?}: {}", prefix, e))
        })
    }
}

impl PersistentStore for SledStore {
    fn save(&self, prefix: &str, key: &str, val: &[u8]) -> Result<(), Error> {
        let tree = self.tree(prefix)?;
        tree.insert(key, val).map_err(|e| {
            Error::backend(format!("save {}/{}: {}", prefix, key, e))
        })?;
        tree.flush().map_err(|e| {
            Error::backend(format!("flush {}/{}: {}", prefix, key, e))
        })?;
        Ok(())
    }

    fn load(&self, prefix: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let val = self.tree(prefix)?.get(key).map_err(|e| {
            Error::backend(format!("load {}/{}: {}", prefix, key, e))
        })?;
        Ok(val.map(|v| v.to_vec()))
    }

    fn remove(&self, prefix: &str, key: &str) -> Result<(), Error> {
        let tree = self.tree(prefix)?;
        tree.remove(key).map_err(|e| {
            Error::backend(format!("remove {}/{}: {}", prefix, key, e))
        })?;
        tree.flush().map_err(|e| {
            Error::backend(format!("flush {}/{}: {}", prefix, key, e))
        })?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let tree = self.tree(prefix)?;
        let mut res = Vec::new();
        for entry in tree.iter() {
            let (k, _) = entry.map_err(|e| {
                Error::backend(format!("iterate {}: {}", prefix, e))
            })?;
            let k = String::from_utf8(k.to_vec()).map_err(|e| {
                Error::backend(format!("non-utf8 key under {}: {}", prefix, e))
            })?;
            res.push(k);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn exercise(bs: &dyn PersistentStore) {
        assert_eq!(bs.load("machines", "m1").unwrap(), None);
        bs.save("machines", "m1", b"{\"a\":1}").unwrap();
        bs.save("machines", "m2", b"{\"a\":2}").unwrap();
        bs.save("leases", "0A000005", b"{}").unwrap();
        assert_eq!(bs.load("machines", "m1").unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(bs.keys("machines").unwrap(), vec!["m1", "m2"]);
        assert_eq!(bs.keys("leases").unwrap(), vec!["0A000005"]);
        assert_eq!(bs.keys("bootenvs").unwrap(), Vec::<String>::new());
        bs.remove("machines", "m1").unwrap();
        assert_eq!(bs.load("machines", "m1").unwrap(), None);
        assert_eq!(bs.keys("machines").unwrap(), vec!["m2"]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        let tmp = camino_tempfile::Utf8TempDir::with_prefix("bootforge-persist")
            .unwrap();
        let bs = SledStore::open(tmp.path()).unwrap();
        exercise(&bs);
    }
}
