use std::fmt;
use std::path::{Path, PathBuf};

use fxhash::FxHashMap as HashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::defs::{PipelineError, FASTQ_GZ_SUFFIX};
use crate::datatypes::sample::{
    AlignmentResult, FilteredReads, MatePair, Provenance, RawReads, SampleId, StageEntity, VariantCallSet,
};
use crate::datatypes::stage::{FileRole, Mate, StageKind};
use crate::utils::fastq::mates_agree;
use crate::utils::naming::{parse_mate_name, parse_output_name};

/// How raw mate files are recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatePattern {
    /// File name suffix of raw read files, including the leading dot.
    pub suffix: String,
    /// Read the first record of both mates and require their ids to pair up.
    pub verify_headers: bool,
}

impl Default for MatePattern {
    fn default() -> Self {
        MatePattern {
            suffix: FASTQ_GZ_SUFFIX.to_string(),
            verify_headers: false,
        }
    }
}

/// Why a file or sample was left out of a discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscoveryDiagnostic {
    /// File carries the suffix but its name does not parse.
    Skipped { path: PathBuf, reason: String },
    /// Only one mate was found for the sample.
    IncompleteSample { sample: String, missing: Mate },
    /// A second file for an already-seen mate; the first one is kept.
    DuplicateMate { sample: String, mate: Mate, path: PathBuf },
    /// First records of the two mates do not pair up.
    MateMismatch { sample: String },
    /// A mate could not be read while checking headers.
    UnreadableMate { sample: String, reason: String },
}

impl fmt::Display for DiscoveryDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryDiagnostic::Skipped { path, reason } => write!(f, "Skipped {}: {}", path.display(), reason),
            DiscoveryDiagnostic::IncompleteSample { sample, missing } => {
                write!(f, "IncompleteSample({}): mate {} missing", sample, missing)
            }
            DiscoveryDiagnostic::DuplicateMate { sample, mate, path } => {
                write!(f, "DuplicateMate({}, {}): ignoring {}", sample, mate, path.display())
            }
            DiscoveryDiagnostic::MateMismatch { sample } => write!(f, "MateMismatch({})", sample),
            DiscoveryDiagnostic::UnreadableMate { sample, reason } => {
                write!(f, "UnreadableMate({}): {}", sample, reason)
            }
        }
    }
}

impl DiscoveryDiagnostic {
    /// The error this diagnostic stands for in the pipeline taxonomy.
    pub fn to_error(&self) -> PipelineError {
        match self {
            DiscoveryDiagnostic::Skipped { path, reason } => PipelineError::InvalidIdentifier {
                value: path.display().to_string(),
                reason: reason.clone(),
            },
            DiscoveryDiagnostic::IncompleteSample { sample, missing } => PipelineError::IncompleteSample {
                sample: sample.clone(),
                missing: missing.to_string(),
            },
            DiscoveryDiagnostic::DuplicateMate { sample, mate, path } => PipelineError::InvalidIdentifier {
                value: path.display().to_string(),
                reason: format!("second file for mate {} of sample {}", mate, sample),
            },
            DiscoveryDiagnostic::MateMismatch { sample } => PipelineError::IncompleteSample {
                sample: sample.clone(),
                missing: "a matching mate".to_string(),
            },
            DiscoveryDiagnostic::UnreadableMate { sample, reason } => {
                PipelineError::Io(format!("sample {}: {}", sample, reason))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Discovery {
    pub samples: Vec<RawReads>,
    pub diagnostics: Vec<DiscoveryDiagnostic>,
}

impl Discovery {
    pub fn sample_ids(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.sample().as_str()).collect()
    }
}

#[derive(Default)]
struct MateSlots {
    read1: Option<PathBuf>,
    read2: Option<PathBuf>,
}

/// Files under `directory`, recursively, in a stable name-sorted order.
fn sorted_files(directory: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !directory.is_dir() {
        return Err(PipelineError::Io(format!("{} is not a directory", directory.display())));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = entry.map_err(|e| PipelineError::Io(e.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Scans `directory` for raw mate files and groups them into per-sample raw reads.
///
/// Samples come back in first-seen order of a name-sorted walk, so repeated runs over an
/// unchanged directory give identical results. Malformed names, duplicate mates and
/// incomplete samples are reported in `diagnostics` and never abort the scan.
pub fn discover(directory: &Path, pattern: &MatePattern) -> Result<Discovery, PipelineError> {
    let mut order: Vec<SampleId> = Vec::new();
    let mut slots: HashMap<SampleId, MateSlots> = HashMap::default();
    let mut diagnostics = Vec::new();

    for path in sorted_files(directory)? {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            if path.to_string_lossy().ends_with(pattern.suffix.as_str()) {
                diagnostics.push(DiscoveryDiagnostic::Skipped {
                    path: path.clone(),
                    reason: "file name is not valid UTF-8".to_string(),
                });
            }
            continue;
        };
        let (sample, mate) = match parse_mate_name(file_name, &pattern.suffix) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                debug!("Skipping {}: {}", path.display(), e);
                diagnostics.push(DiscoveryDiagnostic::Skipped { path, reason: e.to_string() });
                continue;
            }
        };

        debug!("Found {} with mate {} for sample {}", file_name, mate, sample);
        let entry = slots.entry(sample.clone()).or_insert_with(|| {
            order.push(sample.clone());
            MateSlots::default()
        });
        let slot = match mate {
            Mate::R1 => &mut entry.read1,
            Mate::R2 => &mut entry.read2,
        };
        if slot.is_some() {
            diagnostics.push(DiscoveryDiagnostic::DuplicateMate { sample: sample.to_string(), mate, path });
        } else {
            *slot = Some(path);
        }
    }

    let mut samples = Vec::new();
    for sample in order {
        let Some(found) = slots.remove(&sample) else {
            continue;
        };
        match (found.read1, found.read2) {
            (Some(read1), Some(read2)) => {
                if pattern.verify_headers {
                    match mates_agree(&read1, &read2) {
                        Ok(true) => {}
                        Ok(false) => {
                            diagnostics.push(DiscoveryDiagnostic::MateMismatch { sample: sample.to_string() });
                            continue;
                        }
                        Err(e) => {
                            diagnostics.push(DiscoveryDiagnostic::UnreadableMate {
                                sample: sample.to_string(),
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    }
                }
                samples.push(RawReads::new(sample, MatePair::new(read1, read2)));
            }
            (Some(_), None) => diagnostics.push(DiscoveryDiagnostic::IncompleteSample {
                sample: sample.to_string(),
                missing: Mate::R2,
            }),
            (None, Some(_)) => diagnostics.push(DiscoveryDiagnostic::IncompleteSample {
                sample: sample.to_string(),
                missing: Mate::R1,
            }),
            (None, None) => {}
        }
    }

    for diagnostic in &diagnostics {
        warn!("{}", diagnostic);
    }
    info!(
        "Discovered {} complete sample(s) in {} ({} diagnostic(s))",
        samples.len(),
        directory.display(),
        diagnostics.len()
    );
    Ok(Discovery { samples, diagnostics })
}

/// Rebuilds stage entities of `stage` from existing outputs named by `tool` under
/// `directory`. Samples missing a required file are skipped; order follows first sight.
pub fn rediscover(directory: &Path, stage: StageKind, tool: &str) -> Result<Vec<StageEntity>, PipelineError> {
    let mut order: Vec<SampleId> = Vec::new();
    let mut found: HashMap<SampleId, Vec<(FileRole, PathBuf)>> = HashMap::default();

    for path in sorted_files(directory)? {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((sample, role)) = parse_output_name(file_name, stage, tool) {
            found
                .entry(sample.clone())
                .or_insert_with(|| {
                    order.push(sample.clone());
                    Vec::new()
                })
                .push((role, path));
        }
    }

    let provenance = Provenance::new(tool, "unknown", Vec::new());
    let mut entities = Vec::new();
    for sample in order {
        let files = found.remove(&sample).unwrap_or_default();
        let get = |role: FileRole| files.iter().find(|(r, _)| *r == role).map(|(_, p)| p.clone());
        let entity: Option<StageEntity> = match stage {
            StageKind::FilteredReads => match (get(FileRole::Read1), get(FileRole::Read2), get(FileRole::Report)) {
                (Some(r1), Some(r2), Some(report)) => Some(
                    FilteredReads::new(sample.clone(), MatePair::new(r1, r2), report, provenance.clone()).into(),
                ),
                _ => None,
            },
            StageKind::Alignment => get(FileRole::Primary).map(|bam| {
                AlignmentResult::new(
                    sample.clone(),
                    bam,
                    get(FileRole::Index),
                    get(FileRole::Report),
                    provenance.clone(),
                )
                .into()
            }),
            StageKind::VariantCalls => get(FileRole::Primary).map(|vcf| {
                VariantCallSet::new(sample.clone(), vcf, get(FileRole::Index), provenance.clone()).into()
            }),
            StageKind::Reads | StageKind::Protein => {
                return Err(PipelineError::UnsupportedRole {
                    stage,
                    role: "rediscovery".to_string(),
                });
            }
        };
        match entity {
            Some(entity) => entities.push(entity),
            None => warn!("Sample {} has incomplete {} outputs in {}", sample, stage, directory.display()),
        }
    }
    Ok(entities)
}
