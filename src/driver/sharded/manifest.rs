//! Manifest descriptor for one logical file.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// On-disk descriptor listing the chunks that make up a logical file.
///
/// `chunk_sizes` is omitted from the wire form when empty so manifests stay
/// readable by deployments that predate variable-size chunks; readers of
/// such a manifest assume every chunk but the last is exactly the engine's
/// configured chunk size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Lowercase hex chunk hashes in file-offset order.
    #[serde(default)]
    pub chunks: Vec<String>,
    /// Per-chunk byte counts, same length as `chunks` when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunk_sizes: Vec<u64>,
    /// Total logical file size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Wall-clock time of the most recent successful writer close.
    #[serde(default = "epoch")]
    pub mod_time: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Manifest {
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad manifest: {e}")))
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(io::Error::other)
    }

    /// Per-chunk sizes, synthesizing the legacy uniform layout when
    /// `chunk_sizes` is absent: every chunk is `chunk_size` except the
    /// last, which takes the remainder of `size`.
    pub fn resolved_chunk_sizes(&self, chunk_size: u64) -> Vec<u64> {
        if !self.chunk_sizes.is_empty() || self.chunks.is_empty() {
            return self.chunk_sizes.clone();
        }
        let n = self.chunks.len();
        let mut sizes = vec![chunk_size; n - 1];
        sizes.push(self.size.saturating_sub((n as u64 - 1) * chunk_size));
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_sizes_omitted_when_empty() {
        let m = Manifest {
            chunks: vec!["ab".into()],
            chunk_sizes: Vec::new(),
            size: 11,
            mod_time: Utc::now(),
        };
        let text = String::from_utf8(m.encode().unwrap()).unwrap();
        assert!(!text.contains("chunkSizes"));
        assert!(text.contains("\"chunks\""));
        assert!(text.contains("\"modTime\""));
    }

    #[test]
    fn test_decode_legacy_manifest() {
        let data = br#"{"chunks":["aa","bb","cc"],"size":9000000,"modTime":"2024-05-01T10:00:00Z"}"#;
        let m = Manifest::decode(data).unwrap();
        assert!(m.chunk_sizes.is_empty());
        assert_eq!(
            m.resolved_chunk_sizes(4_194_304),
            vec![4_194_304, 4_194_304, 9_000_000 - 2 * 4_194_304]
        );
    }

    #[test]
    fn test_resolved_sizes_prefers_explicit() {
        let m = Manifest {
            chunks: vec!["aa".into(), "bb".into()],
            chunk_sizes: vec![7, 3],
            size: 10,
            mod_time: Utc::now(),
        };
        assert_eq!(m.resolved_chunk_sizes(4096), vec![7, 3]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Manifest::decode(b"not json").is_err());
    }
}
