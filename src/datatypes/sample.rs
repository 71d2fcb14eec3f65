use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::defs::PipelineError;
use crate::datatypes::stage::{FileRole, Mate, StageKind};
use crate::utils::naming::validate_sample_id;

/// Sample identifier parsed from the first filename token. Validated once at construction
/// and never re-derived afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleId(String);

impl SampleId {
    pub fn new(value: &str) -> Result<Self, PipelineError> {
        validate_sample_id(value)?;
        Ok(SampleId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SampleId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_sample_id(&value)?;
        Ok(SampleId(value))
    }
}

impl From<SampleId> for String {
    fn from(id: SampleId) -> Self {
        id.0
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SampleId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}


/// Ordered read files of one paired-end sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatePair {
    read1: PathBuf,
    read2: PathBuf,
}

impl MatePair {
    pub(crate) fn new(read1: PathBuf, read2: PathBuf) -> Self {
        MatePair { read1, read2 }
    }

    pub fn read1(&self) -> &Path {
        &self.read1
    }

    pub fn read2(&self) -> &Path {
        &self.read2
    }

    pub fn get(&self, mate: Mate) -> &Path {
        match mate {
            Mate::R1 => &self.read1,
            Mate::R2 => &self.read2,
        }
    }
}


/// Which tool produced an entity, at which version, with which parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    tool: String,
    version: String,
    params: Vec<String>,
}

impl Provenance {
    pub fn new(tool: &str, version: &str, params: Vec<String>) -> Self {
        Provenance {
            tool: tool.to_string(),
            version: version.to_string(),
            params,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReads {
    sample: SampleId,
    mates: MatePair,
}

impl RawReads {
    pub(crate) fn new(sample: SampleId, mates: MatePair) -> Self {
        RawReads { sample, mates }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn mates(&self) -> &MatePair {
        &self.mates
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredReads {
    sample: SampleId,
    mates: MatePair,
    report: PathBuf,
    provenance: Provenance,
}

impl FilteredReads {
    pub(crate) fn new(sample: SampleId, mates: MatePair, report: PathBuf, provenance: Provenance) -> Self {
        FilteredReads { sample, mates, report, provenance }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn mates(&self) -> &MatePair {
        &self.mates
    }

    pub fn report(&self) -> &Path {
        &self.report
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    sample: SampleId,
    bam: PathBuf,
    bam_index: Option<PathBuf>,
    report: Option<PathBuf>,
    provenance: Provenance,
}

impl AlignmentResult {
    pub(crate) fn new(
        sample: SampleId,
        bam: PathBuf,
        bam_index: Option<PathBuf>,
        report: Option<PathBuf>,
        provenance: Provenance,
    ) -> Self {
        AlignmentResult { sample, bam, bam_index, report, provenance }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn bam(&self) -> &Path {
        &self.bam
    }

    pub fn bam_index(&self) -> Option<&Path> {
        self.bam_index.as_deref()
    }

    pub fn report(&self) -> Option<&Path> {
        self.report.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantCallSet {
    sample: SampleId,
    vcf: PathBuf,
    vcf_index: Option<PathBuf>,
    provenance: Provenance,
}

impl VariantCallSet {
    pub(crate) fn new(sample: SampleId, vcf: PathBuf, vcf_index: Option<PathBuf>, provenance: Provenance) -> Self {
        VariantCallSet { sample, vcf, vcf_index, provenance }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn vcf(&self) -> &Path {
        &self.vcf
    }

    pub fn vcf_index(&self) -> Option<&Path> {
        self.vcf_index.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinPrediction {
    sample: SampleId,
    proteins: PathBuf,
    genes: PathBuf,
    provenance: Provenance,
}

impl ProteinPrediction {
    pub(crate) fn new(sample: SampleId, proteins: PathBuf, genes: PathBuf, provenance: Provenance) -> Self {
        ProteinPrediction { sample, proteins, genes, provenance }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn proteins(&self) -> &Path {
        &self.proteins
    }

    pub fn genes(&self) -> &Path {
        &self.genes
    }
}


/// One sample at one stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage")]
pub enum StageEntity {
    RawReads(RawReads),
    FilteredReads(FilteredReads),
    Alignment(AlignmentResult),
    VariantCalls(VariantCallSet),
    Protein(ProteinPrediction),
}

impl StageEntity {
    pub fn sample(&self) -> &SampleId {
        match self {
            StageEntity::RawReads(e) => &e.sample,
            StageEntity::FilteredReads(e) => &e.sample,
            StageEntity::Alignment(e) => &e.sample,
            StageEntity::VariantCalls(e) => &e.sample,
            StageEntity::Protein(e) => &e.sample,
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            StageEntity::RawReads(_) => StageKind::Reads,
            StageEntity::FilteredReads(_) => StageKind::FilteredReads,
            StageEntity::Alignment(_) => StageKind::Alignment,
            StageEntity::VariantCalls(_) => StageKind::VariantCalls,
            StageEntity::Protein(_) => StageKind::Protein,
        }
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            StageEntity::RawReads(_) => None,
            StageEntity::FilteredReads(e) => Some(&e.provenance),
            StageEntity::Alignment(e) => Some(&e.provenance),
            StageEntity::VariantCalls(e) => Some(&e.provenance),
            StageEntity::Protein(e) => Some(&e.provenance),
        }
    }

    /// Files referenced by the entity, keyed by role. Optional files that were not
    /// produced are left out.
    pub fn files(&self) -> Vec<(FileRole, &Path)> {
        let mut files: Vec<(FileRole, &Path)> = Vec::new();
        match self {
            StageEntity::RawReads(e) => {
                files.push((FileRole::Read1, e.mates.read1()));
                files.push((FileRole::Read2, e.mates.read2()));
            }
            StageEntity::FilteredReads(e) => {
                files.push((FileRole::Read1, e.mates.read1()));
                files.push((FileRole::Read2, e.mates.read2()));
                files.push((FileRole::Report, &e.report));
            }
            StageEntity::Alignment(e) => {
                files.push((FileRole::Primary, &e.bam));
                if let Some(index) = &e.bam_index {
                    files.push((FileRole::Index, index));
                }
                if let Some(report) = &e.report {
                    files.push((FileRole::Report, report));
                }
            }
            StageEntity::VariantCalls(e) => {
                files.push((FileRole::Primary, &e.vcf));
                if let Some(index) = &e.vcf_index {
                    files.push((FileRole::Index, index));
                }
            }
            StageEntity::Protein(e) => {
                files.push((FileRole::Primary, &e.proteins));
                files.push((FileRole::Genes, &e.genes));
            }
        }
        files
    }

    pub fn file(&self, role: FileRole) -> Option<&Path> {
        self.files().into_iter().find(|(r, _)| *r == role).map(|(_, p)| p)
    }
}

impl From<RawReads> for StageEntity {
    fn from(e: RawReads) -> Self {
        StageEntity::RawReads(e)
    }
}

impl From<FilteredReads> for StageEntity {
    fn from(e: FilteredReads) -> Self {
        StageEntity::FilteredReads(e)
    }
}

impl From<AlignmentResult> for StageEntity {
    fn from(e: AlignmentResult) -> Self {
        StageEntity::Alignment(e)
    }
}

impl From<VariantCallSet> for StageEntity {
    fn from(e: VariantCallSet) -> Self {
        StageEntity::VariantCalls(e)
    }
}

impl From<ProteinPrediction> for StageEntity {
    fn from(e: ProteinPrediction) -> Self {
        StageEntity::Protein(e)
    }
}


/// Stage entities of a single sample, in the order they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleLineage {
    sample: SampleId,
    entities: Vec<StageEntity>,
}

impl SampleLineage {
    pub fn new(raw: RawReads) -> Self {
        SampleLineage {
            sample: raw.sample.clone(),
            entities: vec![StageEntity::RawReads(raw)],
        }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn entities(&self) -> &[StageEntity] {
        &self.entities
    }

    pub fn latest(&self) -> &StageEntity {
        // A lineage always starts from its raw reads.
        &self.entities[self.entities.len() - 1]
    }

    pub fn get(&self, stage: StageKind) -> Option<&StageEntity> {
        self.entities.iter().find(|e| e.stage() == stage)
    }

    pub fn file(&self, stage: StageKind, role: FileRole) -> Option<&Path> {
        self.get(stage).and_then(|e| e.file(role))
    }

    /// Appends the next stage entity. The entity must belong to this sample and directly
    /// follow the latest recorded stage.
    pub fn record(&mut self, entity: StageEntity) -> Result<(), PipelineError> {
        if entity.sample() != &self.sample {
            return Err(PipelineError::SampleMismatch {
                expected: self.sample.to_string(),
                found: entity.sample().to_string(),
            });
        }
        let latest = self.latest().stage();
        if entity.stage().previous() != Some(latest) {
            return Err(PipelineError::PrecursorMissing {
                sample: self.sample.to_string(),
                stage: entity.stage(),
                missing: format!("latest recorded stage is {}", latest),
            });
        }
        self.entities.push(entity);
        Ok(())
    }
}
