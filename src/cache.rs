//! On-disk fingerprint store backing incremental rebuild decisions.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Fingerprint;

const STORE_FILE: &str = "fingerprints.cbor";

/// Fingerprints recorded after each node's last successful run.
///
/// Read once at schedule time and written only by the orchestrator, never
/// by worker threads. A missing or unreadable store behaves as empty, so
/// cache corruption can only cause a rebuild, never a wrong skip.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CacheStore {
    entries: HashMap<String, Fingerprint>,
}

impl CacheStore {
    pub(crate) fn load(dir: &Utf8Path) -> Self {
        let path = dir.join(STORE_FILE);
        let Ok(file) = File::open(&path) else {
            return Self::default();
        };

        ciborium::from_reader(BufReader::new(file)).unwrap_or_else(|err| {
            tracing::warn!("Discarding unreadable fingerprint store '{path}': {err}");
            Self::default()
        })
    }

    pub(crate) fn save(&self, dir: &Utf8Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(dir.join(STORE_FILE))?;
        ciborium::into_writer(self, BufWriter::new(file)).map_err(std::io::Error::other)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Fingerprint> {
        self.entries.get(name).copied()
    }

    pub(crate) fn record(&mut self, name: &str, fingerprint: Fingerprint) {
        self.entries.insert(name.to_string(), fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FingerprintBuilder;
    use camino::Utf8PathBuf;

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let fp = FingerprintBuilder::default().field("compile").finish();

        let mut store = CacheStore::default();
        store.record("native-compile", fp);
        store.save(&dir).unwrap();

        let loaded = CacheStore::load(&dir);
        assert_eq!(loaded.get("native-compile"), Some(fp));
        assert_eq!(loaded.get("package"), None);
    }

    #[test]
    fn missing_store_is_empty() {
        let store = CacheStore::load(Utf8Path::new("/no/such/dir"));
        assert_eq!(store.get("native-compile"), None);
    }

    #[test]
    fn corrupt_store_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORE_FILE), b"not cbor at all").unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let store = CacheStore::load(&dir);
        assert_eq!(store.get("native-compile"), None);
    }
}
