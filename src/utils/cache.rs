//! Cache keys for skipping expensive steps, and the on-disk manifest that remembers them.
//!
//! A key is a readable composite of stage, tool, version and sample, followed by two
//! truncated SHA-256 digests: one over the reference marker (canonical path plus
//! modification time) and one over the input file markers, the key of the upstream step and
//! the tool parameters. Truncation trades a bounded collision risk for short keys and
//! directory names; the bound is exposed by [`collision_probability`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task;

use crate::config::defs::{PipelineError, MAX_HASH_LEN, MIN_HASH_LEN};
use crate::datatypes::reference::ReferenceGenome;
use crate::datatypes::sample::StageEntity;
use crate::datatypes::stage::FileRole;
use crate::pipelines::stages::StageDescriptor;
use crate::utils::command::ToolParams;
use crate::utils::file::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Approximate probability that at least two of `n` distinct inputs share a digest
/// truncated to `hash_len` hex digits (birthday bound).
pub fn collision_probability(n: u64, hash_len: usize) -> f64 {
    let space = 2f64.powi((4 * hash_len) as i32);
    let pairs = (n as f64) * (n.saturating_sub(1) as f64) / 2.0;
    -(-pairs / space).exp_m1()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKeyDeriver {
    hash_len: usize,
}

impl CacheKeyDeriver {
    pub fn new(hash_len: usize) -> Result<Self, PipelineError> {
        if !(MIN_HASH_LEN..=MAX_HASH_LEN).contains(&hash_len) {
            return Err(PipelineError::InvalidConfig(format!(
                "hash length {} outside {}..={}",
                hash_len, MIN_HASH_LEN, MAX_HASH_LEN
            )));
        }
        Ok(CacheKeyDeriver { hash_len })
    }

    pub fn hash_len(&self) -> usize {
        self.hash_len
    }

    /// First `hash_len` hex digits of SHA-256 over the length-prefixed parts.
    pub fn short_hash<S: AsRef<[u8]>>(&self, parts: &[S]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            let bytes = part.as_ref();
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(self.hash_len);
        digest
    }

    pub fn reference_hash(&self, reference: &ReferenceGenome) -> String {
        self.short_hash(&[reference_marker(&reference.ref_path())])
    }

    /// Key for running `descriptor`'s stage on the `input` entity.
    ///
    /// Each input file enters the hash with its size and modification time, and `upstream`
    /// is the key of the run that produced `input`. Intermediate paths are fixed by the
    /// naming convention, so a changed upstream step must still change every key after it.
    pub fn derive_key(
        &self,
        descriptor: &StageDescriptor,
        input: &StageEntity,
        upstream: Option<&CacheKey>,
        tool: &ToolParams,
        reference: Option<&ReferenceGenome>,
    ) -> CacheKey {
        let ref_hash = reference
            .map(|r| self.reference_hash(r))
            .unwrap_or_else(|| "-".to_string());

        let mut parts: Vec<String> = input
            .files()
            .into_iter()
            .map(|(role, path)| format!("{}={}", role, file_marker(path)))
            .collect();
        parts.push(format!("upstream={}", upstream.map(CacheKey::as_str).unwrap_or("-")));
        parts.push("--".to_string());
        parts.extend(tool.params.iter().cloned());

        CacheKey(format!(
            "{}:{}@{}:{}:r{}:i{}",
            descriptor.stage,
            tool.tool,
            tool.version,
            input.sample(),
            ref_hash,
            self.short_hash(parts.as_slice())
        ))
    }

    /// Key for building an index of `reference` with an index tool.
    pub fn index_key(&self, reference: &ReferenceGenome, tool: &ToolParams) -> CacheKey {
        CacheKey(format!(
            "index:{}@{}:r{}:i{}",
            tool.tool,
            tool.version,
            self.reference_hash(reference),
            self.short_hash(tool.params.as_slice())
        ))
    }
}

/// Canonical absolute path plus modification time in seconds, when the file exists.
pub fn reference_marker(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let modified = std::fs::metadata(&canonical)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{}@{}", canonical.display(), modified)
}

/// Canonical path, byte length and modification time in nanoseconds of an input file.
/// Rewriting a file in place changes its marker even within the same second.
pub fn file_marker(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    match std::fs::metadata(&canonical) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos().to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("{}#{}@{}", canonical.display(), meta.len(), modified)
        }
        Err(_) => format!("{}@-", canonical.display()),
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub stage: String,
    pub files: BTreeMap<FileRole, PathBuf>,
    pub recorded_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: BTreeMap<CacheKey, CacheEntry>,
}

/// Keys of completed steps and the outputs they produced, persisted as JSON.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    manifest: Mutex<Manifest>,
}

impl CacheStore {
    /// Loads the manifest at `path`. A missing file starts an empty cache; an unreadable
    /// one is logged and replaced on the next write.
    pub fn open(path: PathBuf) -> Result<Self, PipelineError> {
        let manifest = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Manifest>(&text) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Ignoring unreadable cache manifest {}: {}", path.display(), e);
                    Manifest::default()
                }
            }
        } else {
            Manifest::default()
        };
        debug!("Cache manifest {} holds {} entries", path.display(), manifest.entries.len());
        Ok(CacheStore { path, manifest: Mutex::new(manifest) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.manifest.lock().await.entries.len()
    }

    /// Recorded outputs for `key`, only if every one of them still exists.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let manifest = self.manifest.lock().await;
        let entry = manifest.entries.get(key)?;
        if entry.files.values().all(|p| p.exists()) {
            Some(entry.clone())
        } else {
            debug!("Cache entry {} is stale: outputs missing", key);
            None
        }
    }

    /// Stores `files` under `key` and rewrites the manifest. The write runs on the blocking
    /// pool while the lock is held, so manifest snapshots land in order.
    pub async fn record(&self, key: CacheKey, stage: &str, files: BTreeMap<FileRole, PathBuf>) -> Result<(), PipelineError> {
        let mut manifest = self.manifest.lock().await;
        manifest.entries.insert(
            key,
            CacheEntry {
                stage: stage.to_string(),
                files,
                recorded_at: chrono::Local::now().to_rfc3339(),
            },
        );
        let snapshot = serde_json::to_value(&*manifest)
            .map_err(|e| PipelineError::Cache(format!("serializing manifest: {}", e)))?;
        let path = self.path.clone();
        task::spawn_blocking(move || write_json_atomic(&path, &snapshot))
            .await
            .map_err(|e| PipelineError::Cache(format!("manifest writer task failed: {}", e)))?
            .map_err(|e| PipelineError::Cache(format!("writing {}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::sample::{MatePair, RawReads, SampleId};
    use crate::datatypes::stage::StageKind;
    use crate::pipelines::stages::StageRegistry;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn raw(sample: &str) -> StageEntity {
        RawReads::new(
            SampleId::new(sample).unwrap(),
            MatePair::new(
                PathBuf::from(format!("/data/{}_1.fastq.gz", sample)),
                PathBuf::from(format!("/data/{}_2.fastq.gz", sample)),
            ),
        )
        .into()
    }

    fn fastp() -> ToolParams {
        ToolParams::new("fastp", "0.23.4", vec!["-q".to_string(), "20".to_string()])
    }

    #[test]
    fn test_key_is_deterministic() {
        let deriver = CacheKeyDeriver::new(16).unwrap();
        let registry = StageRegistry::standard();
        let descriptor = registry.descriptor(StageKind::FilteredReads).unwrap();
        let reference = ReferenceGenome::new(PathBuf::from("/refs"), "GRCh38_short.fasta").unwrap();
        let a = deriver.derive_key(descriptor, &raw("S1"), None, &fastp(), Some(&reference));
        let b = deriver.derive_key(descriptor, &raw("S1"), None, &fastp(), Some(&reference));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("filtered_reads:fastp@0.23.4:S1:r"));
    }

    #[test]
    fn test_key_changes_with_each_input() {
        let deriver = CacheKeyDeriver::new(16).unwrap();
        let registry = StageRegistry::standard();
        let descriptor = registry.descriptor(StageKind::FilteredReads).unwrap();
        let ref_a = ReferenceGenome::new(PathBuf::from("/refs"), "a.fasta").unwrap();
        let ref_b = ReferenceGenome::new(PathBuf::from("/refs"), "b.fasta").unwrap();
        let base = deriver.derive_key(descriptor, &raw("S1"), None, &fastp(), Some(&ref_a));

        assert_ne!(base, deriver.derive_key(descriptor, &raw("S1"), None, &fastp(), Some(&ref_b)));
        assert_ne!(base, deriver.derive_key(descriptor, &raw("S2"), None, &fastp(), Some(&ref_a)));
        let newer = ToolParams::new("fastp", "0.24.0", fastp().params);
        assert_ne!(base, deriver.derive_key(descriptor, &raw("S1"), None, &newer, Some(&ref_a)));
        let stricter = ToolParams::new("fastp", "0.23.4", vec!["-q".to_string(), "30".to_string()]);
        assert_ne!(base, deriver.derive_key(descriptor, &raw("S1"), None, &stricter, Some(&ref_a)));
        let other_stage = registry.descriptor(StageKind::Alignment).unwrap();
        assert_ne!(base, deriver.derive_key(other_stage, &raw("S1"), None, &fastp(), Some(&ref_a)));
    }

    #[test]
    fn test_key_follows_upstream_run() {
        let deriver = CacheKeyDeriver::new(16).unwrap();
        let registry = StageRegistry::standard();
        let descriptor = registry.descriptor(StageKind::Alignment).unwrap();
        let lenient = CacheKey("filtered_reads:fastp@0.23.4:S1:r-:iaaaa".to_string());
        let strict = CacheKey("filtered_reads:fastp@0.23.4:S1:r-:ibbbb".to_string());
        let a = deriver.derive_key(descriptor, &raw("S1"), Some(&lenient), &fastp(), None);
        let b = deriver.derive_key(descriptor, &raw("S1"), Some(&strict), &fastp(), None);
        assert_ne!(a, b);
        assert_eq!(a, deriver.derive_key(descriptor, &raw("S1"), Some(&lenient), &fastp(), None));
    }

    #[test]
    fn test_file_marker_tracks_rewrites() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("S1_1_filt.fastq.gz");
        assert!(file_marker(&path).ends_with("@-"));
        std::fs::write(&path, b"@r/1\nACGT\n+\nIIII\n")?;
        let before = file_marker(&path);
        assert_eq!(before, file_marker(&path));
        std::fs::write(&path, b"@r/1\nACGTACGT\n+\nIIIIIIII\n")?;
        assert_ne!(before, file_marker(&path));
        Ok(())
    }

    #[test]
    fn test_reference_hashes_do_not_collide_for_catalog_sizes() {
        let deriver = CacheKeyDeriver::new(16).unwrap();
        let mut seen = HashSet::new();
        for i in 0..5_000 {
            let reference = ReferenceGenome::new(PathBuf::from("/refs"), &format!("genome_{}.fasta", i)).unwrap();
            assert!(seen.insert(deriver.reference_hash(&reference)));
        }
    }

    #[test]
    fn test_collision_probability_bound() {
        assert!(collision_probability(100, 16) < 1e-15);
        assert!(collision_probability(100, 8) < 2e-6);
        assert!(collision_probability(1_000_000, 8) > 0.99);
        assert_eq!(collision_probability(1, 16), 0.0);
    }

    #[test]
    fn test_hash_len_is_validated_and_applied() {
        assert!(CacheKeyDeriver::new(4).is_err());
        let deriver = CacheKeyDeriver::new(12).unwrap();
        assert_eq!(deriver.short_hash(&["abc"]).len(), 12);
    }

    #[test]
    fn test_reference_marker_tracks_modification() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ref.fa");
        assert!(reference_marker(&path).ends_with("@-"));
        std::fs::write(&path, b">chr1\nACGT\n")?;
        let marker = reference_marker(&path);
        assert!(!marker.ends_with("@-"));
        assert_eq!(marker, reference_marker(&path));
        Ok(())
    }

    #[tokio::test]
    async fn test_store_round_trip_and_staleness() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join(".cache").join("manifest.json");
        let output = dir.path().join("S1_bwa.bam");
        std::fs::write(&output, b"bam")?;
        let key = CacheKey("alignment:bwa@0.7.17:S1:rabc:idef".to_string());

        let store = CacheStore::open(manifest.clone())?;
        assert!(store.lookup(&key).await.is_none());
        store
            .record(key.clone(), "alignment", BTreeMap::from([(FileRole::Primary, output.clone())]))
            .await?;

        let reopened = CacheStore::open(manifest)?;
        assert_eq!(reopened.len().await, 1);
        let entry = reopened.lookup(&key).await.expect("entry should survive reopen");
        assert_eq!(entry.files.get(&FileRole::Primary), Some(&output));

        std::fs::remove_file(&output)?;
        assert!(reopened.lookup(&key).await.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_manifest_starts_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manifest = dir.path().join("manifest.json");
        std::fs::write(&manifest, b"{not json")?;
        assert!(CacheStore::open(manifest).is_ok());
        Ok(())
    }
}
