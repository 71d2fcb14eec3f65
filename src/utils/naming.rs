//! Canonical file names for every stage output, and the parser that reads them back.
//!
//! A sample id is a run of ASCII letters, digits and `-`. Because it never contains `_` or
//! `.`, the text before the first `_` of any derived name is always the sample, which is
//! what makes names collision-free across samples and re-derivable by discovery.

use crate::config::defs::{PipelineError, FASTP_TAG};
use crate::datatypes::sample::SampleId;
use crate::datatypes::stage::{FileRole, Mate, StageKind};

pub fn validate_sample_id(value: &str) -> Result<(), PipelineError> {
    let reason = if value.is_empty() {
        Some("sample id is empty")
    } else if value.contains(['/', '\\']) {
        Some("sample id contains a path separator")
    } else if value.contains('_') {
        Some("sample id contains '_', which delimits the mate token")
    } else if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Some("sample id may only contain ASCII letters, digits and '-'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PipelineError::InvalidIdentifier {
            value: value.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

pub fn validate_tool_name(value: &str) -> Result<(), PipelineError> {
    let reason = if value.is_empty() {
        Some("tool name is empty")
    } else if value.contains(['/', '\\']) {
        Some("tool name contains a path separator")
    } else if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        Some("tool name may only contain ASCII letters, digits, '-' and '_'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PipelineError::InvalidIdentifier {
            value: value.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Roles a stage can name a file for.
pub fn roles_for(stage: StageKind) -> &'static [FileRole] {
    match stage {
        StageKind::Reads => &[FileRole::Read1, FileRole::Read2],
        StageKind::FilteredReads => &[FileRole::Read1, FileRole::Read2, FileRole::Report],
        StageKind::Alignment => &[
            FileRole::Intermediate,
            FileRole::Primary,
            FileRole::Index,
            FileRole::Report,
        ],
        StageKind::VariantCalls => &[FileRole::Intermediate, FileRole::Primary, FileRole::Index],
        StageKind::Protein => &[FileRole::Primary, FileRole::Genes],
    }
}

/// Derives the file name for `(sample, stage, role, tool)`.
///
/// Read files of the first two stages keep the fixed `<sample>_<mate>` layout existing
/// datasets use; every later stage embeds the tool name.
pub fn derive_name(sample: &str, stage: StageKind, role: FileRole, tool: &str) -> Result<String, PipelineError> {
    validate_sample_id(sample)?;
    validate_tool_name(tool)?;

    let name = match (stage, role) {
        (StageKind::Reads, FileRole::Read1) => format!("{}_1.fastq.gz", sample),
        (StageKind::Reads, FileRole::Read2) => format!("{}_2.fastq.gz", sample),
        (StageKind::FilteredReads, FileRole::Read1) => format!("{}_1_filt.fastq.gz", sample),
        (StageKind::FilteredReads, FileRole::Read2) => format!("{}_2_filt.fastq.gz", sample),
        (StageKind::FilteredReads, FileRole::Report) => {
            let ext = if tool == FASTP_TAG { "json" } else { "html" };
            format!("{}_filt_report.{}", sample, ext)
        }
        (StageKind::Alignment, FileRole::Intermediate) => format!("{}_{}.sam", sample, tool),
        (StageKind::Alignment, FileRole::Primary) => format!("{}_{}.bam", sample, tool),
        (StageKind::Alignment, FileRole::Index) => format!("{}_{}.bam.bai", sample, tool),
        (StageKind::Alignment, FileRole::Report) => format!("{}_{}_report.txt", sample, tool),
        (StageKind::VariantCalls, FileRole::Intermediate) => format!("{}_{}.bcf", sample, tool),
        (StageKind::VariantCalls, FileRole::Primary) => format!("{}_{}.vcf", sample, tool),
        (StageKind::VariantCalls, FileRole::Index) => format!("{}_{}.vcf.idx", sample, tool),
        (StageKind::Protein, FileRole::Primary) => format!("{}_{}_prot.faa", sample, tool),
        (StageKind::Protein, FileRole::Genes) => format!("{}_{}_genes.gbk", sample, tool),
        (stage, role) => {
            return Err(PipelineError::UnsupportedRole { stage, role: role.to_string() });
        }
    };
    Ok(name)
}

/// Reads a derived name back into its sample and role for a given stage and tool.
pub fn parse_output_name(name: &str, stage: StageKind, tool: &str) -> Option<(SampleId, FileRole)> {
    let sample = name.split('_').next()?;
    let sample_id = SampleId::new(sample).ok()?;
    roles_for(stage)
        .iter()
        .find(|role| derive_name(sample, stage, **role, tool).ok().as_deref() == Some(name))
        .map(|role| (sample_id, *role))
}

/// Parses a raw mate file name of the form `<sample>_<mate><suffix>`.
///
/// Returns `Ok(None)` for files that do not carry the suffix at all. Files that carry the
/// suffix but do not split into exactly a valid sample token and a mate token `1` or `2`
/// are rejected with `InvalidIdentifier` rather than guessed at.
pub fn parse_mate_name(file_name: &str, suffix: &str) -> Result<Option<(SampleId, Mate)>, PipelineError> {
    let Some(stem) = file_name.strip_suffix(suffix) else {
        return Ok(None);
    };
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() != 2 {
        return Err(PipelineError::InvalidIdentifier {
            value: file_name.to_string(),
            reason: format!("expected <sample>_<mate>{}, found {} token(s)", suffix, tokens.len()),
        });
    }
    let sample = SampleId::new(tokens[0])?;
    let mate = Mate::from_token(tokens[1]).ok_or_else(|| PipelineError::InvalidIdentifier {
        value: file_name.to_string(),
        reason: format!("mate token '{}' is not 1 or 2", tokens[1]),
    })?;
    Ok(Some((sample, mate)))
}
