/// Functions and structs for building external tool command lines and running them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::config::defs::{
    PipelineError, RunConfig, BCFTOOLS_TAG, BOWTIE2_BUILD_TAG, BOWTIE2_TAG, BWA_TAG, FASTP_TAG, GATK_TAG,
    HISAT2_BUILD_TAG, HISAT2_TAG, PRODIGAL_TAG, SAMTOOLS_TAG,
};
use crate::datatypes::sample::{MatePair, Provenance, SampleId};
use crate::datatypes::stage::{FileRole, StageKind};

/// Tool identity plus the parameters that change its output. Paths are left out: they
/// follow from the sample and the naming convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolParams {
    pub tool: String,
    pub version: String,
    pub params: Vec<String>,
}

impl ToolParams {
    pub fn new(tool: &str, version: &str, params: Vec<String>) -> Self {
        ToolParams {
            tool: tool.to_string(),
            version: version.to_string(),
            params,
        }
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::new(&self.tool, &self.version, self.params.clone())
    }
}

/// Builds the parameters recorded for `tool` under `config`.
pub fn tool_params(config: &RunConfig, tool: &str) -> ToolParams {
    let params = match tool {
        FASTP_TAG => fastp::params(config),
        BWA_TAG => bwa::params(),
        BOWTIE2_TAG | BOWTIE2_BUILD_TAG => bowtie2::params(),
        HISAT2_TAG | HISAT2_BUILD_TAG => hisat2::params(),
        BCFTOOLS_TAG => bcftools::params(),
        GATK_TAG => gatk::params(),
        PRODIGAL_TAG => prodigal::params(),
        _ => Vec::new(),
    };
    ToolParams::new(tool, &config.tool_version(tool), params)
}


/// One external program call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn new(tool: &str, args: Vec<String>) -> Self {
        Invocation { tool: tool.to_string(), args }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an external program. Timeouts and retries, if any, belong to the implementation;
/// callers only look at the exit code and at the files the program was asked to write.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: &[String], working_dir: &Path) -> Result<ToolOutput>;
}

/// Runs tools as local subprocesses.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(&self, tool: &str, args: &[String], working_dir: &Path) -> Result<ToolOutput> {
        debug!("Running {} {} in {}", tool, args.join(" "), working_dir.display());
        let output = Command::new(tool)
            .args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", tool, e, tool))?;

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}


fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn output<'a>(outputs: &'a BTreeMap<FileRole, PathBuf>, stage: StageKind, role: FileRole) -> Result<&'a Path, PipelineError> {
    outputs
        .get(&role)
        .map(PathBuf::as_path)
        .ok_or_else(|| PipelineError::UnsupportedRole { stage, role: role.to_string() })
}

pub mod fastp {
    use super::*;

    pub fn params(config: &RunConfig) -> Vec<String> {
        vec!["-q".to_string(), config.min_quality.to_string()]
    }

    pub fn arg_generator(
        config: &RunConfig,
        mates: &MatePair,
        out1: &Path,
        out2: &Path,
        report: &Path,
    ) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-i".to_string());
        args_vec.push(path_arg(mates.read1()));
        args_vec.push("-I".to_string());
        args_vec.push(path_arg(mates.read2()));
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(out1));
        args_vec.push("-O".to_string());
        args_vec.push(path_arg(out2));
        args_vec.push("-j".to_string());
        args_vec.push(path_arg(report));
        args_vec.push("-w".to_string());
        args_vec.push(config.threads.min(16).to_string());
        args_vec.extend(params(config));
        args_vec
    }
}

pub mod bwa {
    use super::*;

    pub fn params() -> Vec<String> {
        vec!["mem".to_string()]
    }

    pub fn index_args(reference: &Path, prefix: &Path) -> Vec<String> {
        vec!["index".to_string(), "-p".to_string(), path_arg(prefix), path_arg(reference)]
    }

    pub fn mem_args(config: &RunConfig, sample: &SampleId, prefix: &Path, mates: &MatePair, sam: &Path) -> Vec<String> {
        vec![
            "mem".to_string(),
            "-t".to_string(),
            config.threads.to_string(),
            "-R".to_string(),
            read_group(sample),
            "-o".to_string(),
            path_arg(sam),
            path_arg(prefix),
            path_arg(mates.read1()),
            path_arg(mates.read2()),
        ]
    }
}

pub mod bowtie2 {
    use super::*;

    pub fn params() -> Vec<String> {
        vec!["--very-sensitive".to_string()]
    }

    pub fn build_args(config: &RunConfig, reference: &Path, prefix: &Path) -> Vec<String> {
        vec![
            "--threads".to_string(),
            config.threads.to_string(),
            path_arg(reference),
            path_arg(prefix),
        ]
    }

    pub fn align_args(config: &RunConfig, sample: &SampleId, prefix: &Path, mates: &MatePair, sam: &Path) -> Vec<String> {
        let mut args_vec = params();
        args_vec.extend([
            "-p".to_string(),
            config.threads.to_string(),
            "--rg-id".to_string(),
            sample.to_string(),
            "--rg".to_string(),
            format!("SM:{}", sample),
            "-x".to_string(),
            path_arg(prefix),
            "-1".to_string(),
            path_arg(mates.read1()),
            "-2".to_string(),
            path_arg(mates.read2()),
            "-S".to_string(),
            path_arg(sam),
        ]);
        args_vec
    }
}

pub mod hisat2 {
    use super::*;

    pub fn params() -> Vec<String> {
        Vec::new()
    }

    pub fn build_args(config: &RunConfig, reference: &Path, prefix: &Path) -> Vec<String> {
        vec!["-p".to_string(), config.threads.to_string(), path_arg(reference), path_arg(prefix)]
    }

    pub fn align_args(
        config: &RunConfig,
        sample: &SampleId,
        prefix: &Path,
        mates: &MatePair,
        sam: &Path,
        report: &Path,
    ) -> Vec<String> {
        vec![
            "-p".to_string(),
            config.threads.to_string(),
            "--rg-id".to_string(),
            sample.to_string(),
            "--rg".to_string(),
            format!("SM:{}", sample),
            "-x".to_string(),
            path_arg(prefix),
            "-1".to_string(),
            path_arg(mates.read1()),
            "-2".to_string(),
            path_arg(mates.read2()),
            "-S".to_string(),
            path_arg(sam),
            "--summary-file".to_string(),
            path_arg(report),
        ]
    }
}

pub mod samtools {
    use super::*;
    use crate::config::defs::SamtoolsSubcommand;

    pub fn arg_generator(config: &RunConfig, subcommand: SamtoolsSubcommand, input: &Path, output: &Path) -> Vec<String> {
        match subcommand {
            SamtoolsSubcommand::Sort => vec![
                "sort".to_string(),
                "-@".to_string(),
                config.threads.to_string(),
                "-o".to_string(),
                path_arg(output),
                path_arg(input),
            ],
            SamtoolsSubcommand::Index => vec!["index".to_string(), path_arg(input), path_arg(output)],
        }
    }
}

pub mod bcftools {
    use super::*;
    use crate::config::defs::BcftoolsSubcommand;

    pub fn params() -> Vec<String> {
        vec!["-mv".to_string()]
    }

    pub fn arg_generator(subcommand: BcftoolsSubcommand, reference: &Path, input: &Path, output: &Path) -> Vec<String> {
        match subcommand {
            BcftoolsSubcommand::Mpileup => vec![
                "mpileup".to_string(),
                "-f".to_string(),
                path_arg(reference),
                "-Ou".to_string(),
                "-o".to_string(),
                path_arg(output),
                path_arg(input),
            ],
            BcftoolsSubcommand::Call => {
                let mut args_vec = vec!["call".to_string()];
                args_vec.extend(params());
                args_vec.extend(["-Ov".to_string(), "-o".to_string(), path_arg(output), path_arg(input)]);
                args_vec
            }
        }
    }
}

pub mod gatk {
    use super::*;

    pub fn params() -> Vec<String> {
        vec!["HaplotypeCaller".to_string()]
    }

    pub fn arg_generator(reference: &Path, bam: &Path, vcf: &Path) -> Vec<String> {
        vec![
            "HaplotypeCaller".to_string(),
            "-R".to_string(),
            path_arg(reference),
            "-I".to_string(),
            path_arg(bam),
            "-O".to_string(),
            path_arg(vcf),
        ]
    }
}

pub mod prodigal {
    use super::*;

    pub fn params() -> Vec<String> {
        vec!["-p".to_string(), "meta".to_string()]
    }

    pub fn arg_generator(input: &Path, proteins: &Path, genes: &Path) -> Vec<String> {
        let mut args_vec = vec![
            "-i".to_string(),
            path_arg(input),
            "-a".to_string(),
            path_arg(proteins),
            "-o".to_string(),
            path_arg(genes),
        ];
        args_vec.extend(params());
        args_vec
    }
}

fn read_group(sample: &SampleId) -> String {
    format!(
        "@RG\\tID:{}\\tSM:{}\\tLB:{}\\tPL:{}",
        sample,
        sample,
        sample,
        crate::config::defs::READ_GROUP_PLATFORM
    )
}


/// Calls that filter a sample's raw reads.
pub fn filter_invocations(
    config: &RunConfig,
    tool: &str,
    mates: &MatePair,
    outputs: &BTreeMap<FileRole, PathBuf>,
) -> Result<Vec<Invocation>, PipelineError> {
    let stage = StageKind::FilteredReads;
    match tool {
        FASTP_TAG => Ok(vec![Invocation::new(
            FASTP_TAG,
            fastp::arg_generator(
                config,
                mates,
                output(outputs, stage, FileRole::Read1)?,
                output(outputs, stage, FileRole::Read2)?,
                output(outputs, stage, FileRole::Report)?,
            ),
        )]),
        _ => Err(PipelineError::UnsupportedTool { stage, tool: tool.to_string() }),
    }
}

/// Call that builds an index with `index_tool` under `prefix`.
pub fn index_invocation(config: &RunConfig, index_tool: &str, reference: &Path, prefix: &Path) -> Result<Invocation, PipelineError> {
    let args = match index_tool {
        BWA_TAG => bwa::index_args(reference, prefix),
        BOWTIE2_BUILD_TAG => bowtie2::build_args(config, reference, prefix),
        HISAT2_BUILD_TAG => hisat2::build_args(config, reference, prefix),
        _ => {
            return Err(PipelineError::UnsupportedTool {
                stage: StageKind::Alignment,
                tool: index_tool.to_string(),
            });
        }
    };
    Ok(Invocation::new(index_tool, args))
}

/// Calls that align filtered mates against an indexed reference and leave a sorted,
/// indexed BAM.
pub fn align_invocations(
    config: &RunConfig,
    tool: &str,
    sample: &SampleId,
    mates: &MatePair,
    index_prefix: &Path,
    outputs: &BTreeMap<FileRole, PathBuf>,
) -> Result<Vec<Invocation>, PipelineError> {
    use crate::config::defs::SamtoolsSubcommand;

    let stage = StageKind::Alignment;
    let sam = output(outputs, stage, FileRole::Intermediate)?;
    let bam = output(outputs, stage, FileRole::Primary)?;
    let bai = output(outputs, stage, FileRole::Index)?;

    let aligner = match tool {
        BWA_TAG => Invocation::new(BWA_TAG, bwa::mem_args(config, sample, index_prefix, mates, sam)),
        BOWTIE2_TAG => Invocation::new(BOWTIE2_TAG, bowtie2::align_args(config, sample, index_prefix, mates, sam)),
        HISAT2_TAG => Invocation::new(
            HISAT2_TAG,
            hisat2::align_args(config, sample, index_prefix, mates, sam, output(outputs, stage, FileRole::Report)?),
        ),
        _ => return Err(PipelineError::UnsupportedTool { stage, tool: tool.to_string() }),
    };

    Ok(vec![
        aligner,
        Invocation::new(SAMTOOLS_TAG, samtools::arg_generator(config, SamtoolsSubcommand::Sort, sam, bam)),
        Invocation::new(SAMTOOLS_TAG, samtools::arg_generator(config, SamtoolsSubcommand::Index, bam, bai)),
    ])
}

/// Calls that produce a VCF from a sorted BAM.
pub fn call_invocations(
    tool: &str,
    reference: &Path,
    bam: &Path,
    outputs: &BTreeMap<FileRole, PathBuf>,
) -> Result<Vec<Invocation>, PipelineError> {
    use crate::config::defs::BcftoolsSubcommand;

    let stage = StageKind::VariantCalls;
    let vcf = output(outputs, stage, FileRole::Primary)?;
    match tool {
        BCFTOOLS_TAG => {
            let bcf = output(outputs, stage, FileRole::Intermediate)?;
            Ok(vec![
                Invocation::new(BCFTOOLS_TAG, bcftools::arg_generator(BcftoolsSubcommand::Mpileup, reference, bam, bcf)),
                Invocation::new(BCFTOOLS_TAG, bcftools::arg_generator(BcftoolsSubcommand::Call, reference, bcf, vcf)),
            ])
        }
        GATK_TAG => Ok(vec![Invocation::new(GATK_TAG, gatk::arg_generator(reference, bam, vcf))]),
        _ => Err(PipelineError::UnsupportedTool { stage, tool: tool.to_string() }),
    }
}

/// Calls that predict proteins from a read file.
pub fn protein_invocations(
    tool: &str,
    input: &Path,
    outputs: &BTreeMap<FileRole, PathBuf>,
) -> Result<Vec<Invocation>, PipelineError> {
    let stage = StageKind::Protein;
    match tool {
        PRODIGAL_TAG => Ok(vec![Invocation::new(
            PRODIGAL_TAG,
            prodigal::arg_generator(
                input,
                output(outputs, stage, FileRole::Primary)?,
                output(outputs, stage, FileRole::Genes)?,
            ),
        )]),
        _ => Err(PipelineError::UnsupportedTool { stage, tool: tool.to_string() }),
    }
}


/// Runs `<tool> --version` (or the tool's equivalent) and pulls out the version token.
pub async fn check_version(invoker: &dyn ToolInvoker, tool: &str, working_dir: &Path) -> Result<String> {
    let flag = match tool {
        PRODIGAL_TAG => "-v",
        _ => "--version",
    };
    let out = invoker.invoke(tool, &[flag.to_string()], working_dir).await?;
    let text = if out.stdout.trim().is_empty() { &out.stderr } else { &out.stdout };
    let first_line = text
        .lines()
        .next()
        .ok_or_else(|| anyhow!("No output from {} {}", tool, flag))?;
    first_line
        .split_whitespace()
        .map(|t| t.trim_end_matches(':').trim_start_matches(['v', 'V']))
        .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid {} {} output: {}", tool, flag, first_line))
}
