use std::time::SystemTime;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for node identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash summarizing the inputs relevant to a task node.
///
/// A node whose current fingerprint equals the one recorded after its last
/// successful run is considered up to date and is skipped instead of
/// re-executed. Fingerprints cover structured request fields as well as the
/// identity stamps (mtime + length) of files on the classpath, so either
/// kind of change invalidates the node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Incremental builder for [`Fingerprint`] values.
///
/// Every field is length-prefixed before hashing so that adjacent fields
/// cannot alias (`"ab" + "c"` hashes differently from `"a" + "bc"`).
#[derive(Default)]
pub(crate) struct FingerprintBuilder(blake3::Hasher);

impl FingerprintBuilder {
    pub(crate) fn field(mut self, value: &str) -> Self {
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    pub(crate) fn fields<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for value in values {
            self = self.field(value.as_ref());
        }
        self
    }

    /// Mixes in the fingerprint of an upstream node, so invalidation
    /// cascades to every dependent node.
    pub(crate) fn chain(mut self, upstream: Fingerprint) -> Self {
        self.0.update(upstream.as_bytes());
        self
    }

    /// Mixes in a file's identity stamp: its path, mtime and length.
    pub(crate) fn file_stamp(self, path: &Utf8Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();

        Ok(self
            .field(path.as_str())
            .field(&mtime.as_nanos().to_string())
            .field(&meta.len().to_string()))
    }

    pub(crate) fn finish(self) -> Fingerprint {
        let bytes: [u8; 32] = self.0.finalize().into();
        Fingerprint(bytes)
    }
}
