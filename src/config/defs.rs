use std::collections::HashMap;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::LevelFilter;
use thiserror::Error;

use crate::datatypes::stage::StageKind;
use crate::utils::discovery::MatePattern;

// External software
pub const FASTP_TAG: &str = "fastp";
pub const BWA_TAG: &str = "bwa";
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const BOWTIE2_BUILD_TAG: &str = "bowtie2-build";
pub const HISAT2_TAG: &str = "hisat2";
pub const HISAT2_BUILD_TAG: &str = "hisat2-build";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const GATK_TAG: &str = "gatk";
pub const PRODIGAL_TAG: &str = "prodigal";

pub const FILTER_TOOLS: &[&str] = &[FASTP_TAG];
pub const ALIGNER_TOOLS: &[&str] = &[BWA_TAG, BOWTIE2_TAG, HISAT2_TAG];
pub const CALLER_TOOLS: &[&str] = &[BCFTOOLS_TAG, GATK_TAG];
pub const PROTEIN_TOOLS: &[&str] = &[PRODIGAL_TAG];

lazy_static! {
    pub static ref TOOL_VERSIONS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(FASTP_TAG, "0.23.4");
        m.insert(BWA_TAG, "0.7.17");
        m.insert(BOWTIE2_TAG, "2.5.1");
        m.insert(BOWTIE2_BUILD_TAG, "2.5.1");
        m.insert(HISAT2_TAG, "2.2.1");
        m.insert(HISAT2_BUILD_TAG, "2.2.1");
        m.insert(SAMTOOLS_TAG, "1.20");
        m.insert(BCFTOOLS_TAG, "1.20");
        m.insert(GATK_TAG, "4.5.0.0");
        m.insert(PRODIGAL_TAG, "2.6.3");

        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    Mpileup,
    Call,
}

// Static filenames
pub const FASTQ_GZ_SUFFIX: &str = ".fastq.gz";
pub const CACHE_DIR: &str = ".cache";
pub const CACHE_MANIFEST: &str = "manifest.json";
pub const INDEX_DIR: &str = "indices";
pub const BATCH_REPORT: &str = "batch_report.json";

// Static parameters

/// Hex digits kept from the SHA-256 digest of a reference marker. 16 digits is 64 bits,
/// which keeps the birthday bound below 1e-15 for catalogs of a few hundred references.
pub const DEFAULT_HASH_LEN: usize = 16;
pub const MIN_HASH_LEN: usize = 8;
pub const MAX_HASH_LEN: usize = 64;

pub const DEFAULT_MIN_QUALITY: u8 = 20;
pub const READ_GROUP_PLATFORM: &str = "ILLUMINA";


/// Errors raised by the pipeline core. Every variant carries owned strings so a failure
/// can be handed to every sample waiting on the same shared resource.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Sample {sample} is missing mate {missing}")]
    IncompleteSample { sample: String, missing: String },

    #[error("Cannot run {stage} for sample {sample}: {missing}")]
    PrecursorMissing { sample: String, stage: StageKind, missing: String },

    #[error("Tool {tool} failed (exit code {exit_code:?}): {error}")]
    ToolInvocationFailed { tool: String, exit_code: Option<i32>, error: String },

    #[error("Reference {reference} unavailable: {error}")]
    ReferenceUnavailable { reference: String, error: String },

    #[error("Stage {stage} has no '{role}' output")]
    UnsupportedRole { stage: StageKind, role: String },

    #[error("Tool {tool} is not eligible for stage {stage}")]
    UnsupportedTool { stage: StageKind, tool: String },

    #[error("Entity for sample {found} cannot join the lineage of sample {expected}")]
    SampleMismatch { expected: String, found: String },

    #[error("Output name {name} would be produced more than once")]
    NameCollision { name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}


/// Tools chosen for each transforming stage of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSelection {
    pub filter: String,
    pub aligner: String,
    pub caller: String,
    pub protein: Option<String>,
}

impl Default for ToolSelection {
    fn default() -> Self {
        ToolSelection {
            filter: FASTP_TAG.to_string(),
            aligner: BWA_TAG.to_string(),
            caller: BCFTOOLS_TAG.to_string(),
            protein: None,
        }
    }
}


/// Everything a run needs, passed explicitly into discovery and the runner.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub mate_pattern: MatePattern,
    pub tools: ToolSelection,
    pub hash_len: usize,
    pub threads: usize,
    pub max_parallel_samples: usize,
    pub min_quality: u8,
    pub storage_retries: usize,
    /// Final VCFs are copied here when set.
    pub publish_dir: Option<PathBuf>,
    pub tool_versions: HashMap<String, String>,
    pub log_level: LevelFilter,
}

impl RunConfig {
    pub fn new(out_dir: PathBuf) -> Self {
        RunConfig {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            out_dir,
            mate_pattern: MatePattern::default(),
            tools: ToolSelection::default(),
            hash_len: DEFAULT_HASH_LEN,
            threads: 4,
            max_parallel_samples: 4,
            min_quality: DEFAULT_MIN_QUALITY,
            storage_retries: 3,
            publish_dir: None,
            tool_versions: HashMap::new(),
            log_level: LevelFilter::Info,
        }
    }

    /// Checks ranges and tool eligibility before anything touches the filesystem.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(MIN_HASH_LEN..=MAX_HASH_LEN).contains(&self.hash_len) {
            return Err(PipelineError::InvalidConfig(format!(
                "hash length {} outside {}..={}",
                self.hash_len, MIN_HASH_LEN, MAX_HASH_LEN
            )));
        }
        if self.threads == 0 || self.max_parallel_samples == 0 {
            return Err(PipelineError::InvalidConfig(
                "threads and max parallel samples must be at least 1".to_string(),
            ));
        }
        let checks = [
            (StageKind::FilteredReads, Some(&self.tools.filter), FILTER_TOOLS),
            (StageKind::Alignment, Some(&self.tools.aligner), ALIGNER_TOOLS),
            (StageKind::VariantCalls, Some(&self.tools.caller), CALLER_TOOLS),
            (StageKind::Protein, self.tools.protein.as_ref(), PROTEIN_TOOLS),
        ];
        for (stage, tool, eligible) in checks {
            if let Some(tool) = tool {
                if !eligible.contains(&tool.as_str()) {
                    return Err(PipelineError::UnsupportedTool { stage, tool: tool.clone() });
                }
            }
        }
        Ok(())
    }

    /// Version string recorded in provenance and cache keys. Explicit overrides win over
    /// the built-in table.
    pub fn tool_version(&self, tool: &str) -> String {
        if let Some(version) = self.tool_versions.get(tool) {
            return version.clone();
        }
        TOOL_VERSIONS
            .get(tool)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn cache_manifest_path(&self) -> PathBuf {
        self.out_dir.join(CACHE_DIR).join(CACHE_MANIFEST)
    }

    pub fn index_root(&self) -> PathBuf {
        self.out_dir.join(INDEX_DIR)
    }

    pub fn sample_dir(&self, sample: &str) -> PathBuf {
        self.out_dir.join(sample)
    }
}
