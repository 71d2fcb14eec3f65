use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::defs::PipelineError;
use crate::utils::file::is_gzipped;

/// A reference FASTA in a directory, optionally with an index built by a named tool.
///
/// Some tools want the reference path and expect index files next to it, others take an
/// index prefix, so both are kept. Indexing never mutates a reference: it produces a new
/// value through [`ReferenceGenome::with_index`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceGenome {
    ref_name: String,
    ref_dir: PathBuf,
    index_name: Option<String>,
    indexed_with: Option<String>,
    index_dir: Option<PathBuf>,
}

impl ReferenceGenome {
    pub fn new(ref_dir: PathBuf, ref_name: &str) -> Result<Self, PipelineError> {
        if ref_name.is_empty() || ref_name.contains(['/', '\\']) {
            return Err(PipelineError::InvalidIdentifier {
                value: ref_name.to_string(),
                reason: "reference name must be a bare file name".to_string(),
            });
        }
        Ok(ReferenceGenome {
            ref_name: ref_name.to_string(),
            ref_dir,
            index_name: None,
            indexed_with: None,
            index_dir: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let ref_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::InvalidIdentifier {
                value: path.display().to_string(),
                reason: "reference path has no file name".to_string(),
            })?;
        let ref_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ReferenceGenome::new(ref_dir, ref_name)
    }

    pub fn ref_name(&self) -> &str {
        &self.ref_name
    }

    pub fn ref_dir(&self) -> &Path {
        &self.ref_dir
    }

    pub fn ref_path(&self) -> PathBuf {
        self.ref_dir.join(&self.ref_name)
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    pub fn indexed_with(&self) -> Option<&str> {
        self.indexed_with.as_deref()
    }

    pub fn index_dir(&self) -> Option<&Path> {
        self.index_dir.as_deref()
    }

    pub fn is_indexed_with(&self, tool: &str) -> bool {
        self.indexed_with.as_deref() == Some(tool) && self.index_name.is_some()
    }

    /// Prefix handed to aligners (`-x`, `-p` or positional), e.g. `<index_dir>/bt2_idx`.
    pub fn index_prefix(&self) -> Option<PathBuf> {
        match (&self.index_dir, &self.index_name) {
            (Some(dir), Some(name)) => Some(dir.join(name)),
            (None, Some(name)) => Some(self.ref_dir.join(name)),
            _ => None,
        }
    }

    /// Canonical path of the reference file, used to tell references apart. Falls back to
    /// the joined path when the file does not exist yet.
    pub fn identity(&self) -> String {
        let path = self.ref_path();
        std::fs::canonicalize(&path)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    pub fn with_index(&self, index_dir: PathBuf, index_name: &str, tool: &str) -> ReferenceGenome {
        ReferenceGenome {
            ref_name: self.ref_name.clone(),
            ref_dir: self.ref_dir.clone(),
            index_name: Some(index_name.to_string()),
            indexed_with: Some(tool.to_string()),
            index_dir: Some(index_dir),
        }
    }

    /// Path of an uncompressed copy of the reference. A gzipped `<name>.gz` is inflated
    /// once to `<name>` in the same directory; later calls reuse it.
    pub fn decompressed_path(&self) -> Result<PathBuf, PipelineError> {
        let path = self.ref_path();
        let Some(stem) = self.ref_name.strip_suffix(".gz") else {
            return Ok(path);
        };
        let target = self.ref_dir.join(stem);
        if target.exists() {
            return Ok(target);
        }
        if !is_gzipped(&path)? {
            return Err(PipelineError::Io(format!(
                "{} has a .gz suffix but is not gzip data",
                path.display()
            )));
        }
        debug!("Decompressing reference {} to {}", path.display(), target.display());
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&path)?));
        let mut tmp = NamedTempFile::new_in(&self.ref_dir)?;
        io::copy(&mut decoder, &mut tmp)?;
        tmp.persist(&target).map_err(|e| PipelineError::Io(e.to_string()))?;
        Ok(target)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_from_path_splits_dir_and_name() {
        let reference = ReferenceGenome::from_path(Path::new("/refs/GRCh38_short.fasta")).unwrap();
        assert_eq!(reference.ref_name(), "GRCh38_short.fasta");
        assert_eq!(reference.ref_dir(), Path::new("/refs"));
        assert_eq!(reference.ref_path(), PathBuf::from("/refs/GRCh38_short.fasta"));
        assert!(!reference.is_indexed_with("bwa"));
    }

    #[test]
    fn test_with_index_leaves_original_untouched() {
        let reference = ReferenceGenome::new(PathBuf::from("/refs"), "ref.fa").unwrap();
        let indexed = reference.with_index(PathBuf::from("/idx/bwa"), "bwa_idx", "bwa");
        assert!(indexed.is_indexed_with("bwa"));
        assert!(!indexed.is_indexed_with("hisat2"));
        assert_eq!(indexed.index_prefix(), Some(PathBuf::from("/idx/bwa/bwa_idx")));
        assert_eq!(reference.index_name(), None);
    }

    #[test]
    fn test_rejects_nested_name() {
        assert!(ReferenceGenome::new(PathBuf::from("/refs"), "a/ref.fa").is_err());
    }

    #[test]
    fn test_decompressed_path_inflates_once() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let gz_path = dir.path().join("ref.fa.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
        encoder.write_all(b">chr1\nACGT\n")?;
        encoder.finish()?;

        let reference = ReferenceGenome::from_path(&gz_path)?;
        let plain = reference.decompressed_path()?;
        assert_eq!(plain, dir.path().join("ref.fa"));
        assert_eq!(std::fs::read_to_string(&plain)?, ">chr1\nACGT\n");
        assert_eq!(reference.decompressed_path()?, plain);
        Ok(())
    }

    #[test]
    fn test_plain_reference_passes_through() -> anyhow::Result<()> {
        let reference = ReferenceGenome::new(PathBuf::from("/refs"), "ref.fa")?;
        assert_eq!(reference.decompressed_path()?, PathBuf::from("/refs/ref.fa"));
        Ok(())
    }
}
