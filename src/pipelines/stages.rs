//! Ordered table of pipeline stages: which entity each consumes, which tools may run it,
//! what must already exist before it runs, and which files it leaves behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::defs::{
    PipelineError, ALIGNER_TOOLS, BOWTIE2_BUILD_TAG, BOWTIE2_TAG, BWA_TAG, CALLER_TOOLS, FILTER_TOOLS, GATK_TAG,
    HISAT2_BUILD_TAG, HISAT2_TAG, PROTEIN_TOOLS,
};
use crate::datatypes::reference::ReferenceGenome;
use crate::datatypes::sample::SampleLineage;
use crate::datatypes::stage::{FileRole, StageKind};
use crate::utils::naming::derive_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// A file of an earlier stage, recorded in the lineage and present on disk.
    Files(StageKind, FileRole),
    /// A reference indexed by the selected aligner.
    IndexedReference,
    /// A reference FASTA, indexed or not.
    Reference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub stage: StageKind,
    /// Stage that must be the latest one recorded before this one runs.
    pub input: Option<StageKind>,
    pub tools: &'static [&'static str],
    pub requires: &'static [Requirement],
}

impl StageDescriptor {
    /// Stage whose entity the tool actually reads. Usually `input`, but protein prediction
    /// reads filtered mates although it runs after variant calling.
    pub fn source(&self) -> Option<StageKind> {
        self.requires
            .iter()
            .find_map(|r| match r {
                Requirement::Files(stage, _) => Some(*stage),
                _ => None,
            })
            .or(self.input)
    }
}

/// How an aligner's reference index is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub aligner: &'static str,
    pub tool: &'static str,
    pub index_name: &'static str,
}

const INDEX_SPECS: &[IndexSpec] = &[
    IndexSpec { aligner: BWA_TAG, tool: BWA_TAG, index_name: "bwa_idx" },
    IndexSpec { aligner: BOWTIE2_TAG, tool: BOWTIE2_BUILD_TAG, index_name: "bt2_idx" },
    IndexSpec { aligner: HISAT2_TAG, tool: HISAT2_BUILD_TAG, index_name: "hs2_idx" },
];

/// Output names a stage produces for one sample and tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedOutputs {
    /// Must exist once the stage's tools exit successfully.
    pub required: Vec<(FileRole, String)>,
    /// Kept when the tool writes them.
    pub optional: Vec<(FileRole, String)>,
    /// Written between steps and removed after the stage succeeds.
    pub scratch: Vec<(FileRole, String)>,
}

impl ExpectedOutputs {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(&self.optional)
            .chain(&self.scratch)
            .map(|(_, name)| name.as_str())
    }

    /// Every output joined onto `dir`, keyed by role.
    pub fn paths(&self, dir: &Path) -> BTreeMap<FileRole, PathBuf> {
        self.required
            .iter()
            .chain(&self.optional)
            .chain(&self.scratch)
            .map(|(role, name)| (*role, dir.join(name)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StageRegistry {
    descriptors: Vec<StageDescriptor>,
}

impl StageRegistry {
    pub fn standard() -> Self {
        let descriptors = vec![
            StageDescriptor {
                stage: StageKind::Reads,
                input: None,
                tools: &[],
                requires: &[],
            },
            StageDescriptor {
                stage: StageKind::FilteredReads,
                input: Some(StageKind::Reads),
                tools: FILTER_TOOLS,
                requires: &[
                    Requirement::Files(StageKind::Reads, FileRole::Read1),
                    Requirement::Files(StageKind::Reads, FileRole::Read2),
                ],
            },
            StageDescriptor {
                stage: StageKind::Alignment,
                input: Some(StageKind::FilteredReads),
                tools: ALIGNER_TOOLS,
                requires: &[
                    Requirement::Files(StageKind::FilteredReads, FileRole::Read1),
                    Requirement::Files(StageKind::FilteredReads, FileRole::Read2),
                    Requirement::IndexedReference,
                ],
            },
            StageDescriptor {
                stage: StageKind::VariantCalls,
                input: Some(StageKind::Alignment),
                tools: CALLER_TOOLS,
                requires: &[
                    Requirement::Files(StageKind::Alignment, FileRole::Primary),
                    Requirement::Reference,
                ],
            },
            StageDescriptor {
                stage: StageKind::Protein,
                input: Some(StageKind::VariantCalls),
                tools: PROTEIN_TOOLS,
                requires: &[Requirement::Files(StageKind::FilteredReads, FileRole::Read1)],
            },
        ];
        StageRegistry { descriptors }
    }

    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, stage: StageKind) -> Option<&StageDescriptor> {
        self.descriptors.iter().find(|d| d.stage == stage)
    }

    /// Stage that follows `stage`, leaving protein prediction out unless enabled.
    pub fn next_after(&self, stage: StageKind, protein: bool) -> Option<StageKind> {
        self.descriptors
            .iter()
            .find(|d| d.input == Some(stage))
            .map(|d| d.stage)
            .filter(|s| protein || *s != StageKind::Protein)
    }

    pub fn index_spec(&self, aligner: &str) -> Option<IndexSpec> {
        INDEX_SPECS.iter().find(|s| s.aligner == aligner).copied()
    }

    /// Checks that `tool` may run `stage` for the sample in `lineage`, and that everything
    /// the stage needs is in place.
    pub fn validate(
        &self,
        stage: StageKind,
        tool: &str,
        lineage: &SampleLineage,
        reference: Option<&ReferenceGenome>,
    ) -> Result<(), PipelineError> {
        let unsupported = || PipelineError::UnsupportedTool { stage, tool: tool.to_string() };
        let descriptor = self.descriptor(stage).ok_or_else(unsupported)?;
        if !descriptor.tools.contains(&tool) {
            return Err(unsupported());
        }

        let sample = lineage.sample().to_string();
        let precursor = |missing: String| PipelineError::PrecursorMissing {
            sample: sample.clone(),
            stage,
            missing,
        };

        let latest = lineage.latest().stage();
        if descriptor.input != Some(latest) {
            return Err(precursor(format!("latest recorded stage is {}", latest)));
        }

        for requirement in descriptor.requires {
            match requirement {
                Requirement::Files(from, role) => match lineage.file(*from, *role) {
                    Some(path) if path.is_file() => {}
                    Some(path) => return Err(precursor(format!("{} {} not found at {}", from, role, path.display()))),
                    None => return Err(precursor(format!("no {} {} recorded", from, role))),
                },
                Requirement::IndexedReference => match reference {
                    Some(r) if r.is_indexed_with(tool) => {}
                    Some(r) => return Err(precursor(format!("reference {} is not indexed for {}", r.ref_name(), tool))),
                    None => return Err(precursor("no reference given".to_string())),
                },
                Requirement::Reference => {
                    if reference.is_none() {
                        return Err(precursor("no reference given".to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Names of the files `tool` leaves behind when running `stage` for `sample`.
    pub fn expected_outputs(&self, stage: StageKind, sample: &str, tool: &str) -> Result<ExpectedOutputs, PipelineError> {
        let name = |role| derive_name(sample, stage, role, tool).map(|n| (role, n));
        let outputs = match stage {
            StageKind::Reads => {
                return Err(PipelineError::UnsupportedTool { stage, tool: tool.to_string() });
            }
            StageKind::FilteredReads => ExpectedOutputs {
                required: vec![name(FileRole::Read1)?, name(FileRole::Read2)?, name(FileRole::Report)?],
                ..Default::default()
            },
            StageKind::Alignment => ExpectedOutputs {
                required: vec![name(FileRole::Primary)?, name(FileRole::Index)?],
                optional: if tool == HISAT2_TAG { vec![name(FileRole::Report)?] } else { Vec::new() },
                scratch: vec![name(FileRole::Intermediate)?],
            },
            StageKind::VariantCalls => ExpectedOutputs {
                required: vec![name(FileRole::Primary)?],
                optional: if tool == GATK_TAG { vec![name(FileRole::Index)?] } else { Vec::new() },
                scratch: if tool == GATK_TAG { Vec::new() } else { vec![name(FileRole::Intermediate)?] },
            },
            StageKind::Protein => ExpectedOutputs {
                required: vec![name(FileRole::Primary)?, name(FileRole::Genes)?],
                ..Default::default()
            },
        };
        Ok(outputs)
    }
}
