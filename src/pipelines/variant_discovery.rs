use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::config::defs::{PipelineError, RunConfig, BATCH_REPORT};
use crate::datatypes::reference::ReferenceGenome;
use crate::datatypes::sample::SampleId;
use crate::datatypes::stage::{FileRole, StageKind};
use crate::pipelines::runner::{BatchReport, Milestone, PipelineRunner, SampleFailure};
use crate::utils::command::ToolInvoker;
use crate::utils::discovery::{discover, Discovery, DiscoveryDiagnostic};
use crate::utils::storage::{with_retries, Storage};


/// Scans `seq_dir` and logs what a run would pick up, without running any tool.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `seq_dir` - directory holding `<sample>_<mate>` read files
///
/// # Returns
/// Result<Discovery, PipelineError>
pub fn discover_only(config: &RunConfig, seq_dir: &Path) -> Result<Discovery, PipelineError> {
    let discovery = discover(seq_dir, &config.mate_pattern)?;
    for raw in &discovery.samples {
        info!(
            "{}: {} + {}",
            raw.sample(),
            raw.mates().read1().display(),
            raw.mates().read2().display()
        );
    }
    Ok(discovery)
}


/// Samples discovery had to leave out, as failures at the discovery milestone.
fn excluded_samples(discovery: &Discovery) -> Vec<SampleFailure> {
    discovery
        .diagnostics
        .iter()
        .filter_map(|diagnostic| {
            let sample = match diagnostic {
                DiscoveryDiagnostic::IncompleteSample { sample, .. } => sample,
                DiscoveryDiagnostic::MateMismatch { sample } => sample,
                DiscoveryDiagnostic::UnreadableMate { sample, .. } => sample,
                _ => return None,
            };
            let sample = SampleId::new(sample).ok()?;
            Some(SampleFailure {
                sample,
                stage: Milestone::Discovered,
                reason: diagnostic.to_error(),
            })
        })
        .collect()
}


/// Full run: fetches the reference, discovers samples, drives them through every stage,
/// optionally publishes the VCFs and writes the batch report to the output directory.
/// A VCF that cannot be published stays in `completed` and adds a failure at `done`.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `seq_dir` - directory holding `<sample>_<mate>` read files
/// * `reference` - storage handle of the reference FASTA
/// * `invoker` - runs external tools
/// * `storage` - resolves the reference and receives published files
///
/// # Returns
/// Result<BatchReport, PipelineError>
pub async fn run(
    config: Arc<RunConfig>,
    seq_dir: &Path,
    reference: &str,
    invoker: Arc<dyn ToolInvoker>,
    storage: &dyn Storage,
) -> Result<BatchReport, PipelineError> {
    tokio::fs::create_dir_all(&config.out_dir).await?;

    let ref_path = with_retries("reference download", config.storage_retries, || storage.download(reference))
        .await
        .map_err(|e| PipelineError::ReferenceUnavailable {
            reference: reference.to_string(),
            error: format!("{:#}", e),
        })?;
    let reference = ReferenceGenome::from_path(&ref_path)?;
    info!("Reference: {}", ref_path.display());

    let discovery = discover(seq_dir, &config.mate_pattern)?;
    let excluded = excluded_samples(&discovery);
    if discovery.samples.is_empty() {
        warn!("No complete samples found in {}", seq_dir.display());
    }

    let runner = Arc::new(PipelineRunner::new(config.clone(), invoker)?);
    let mut report = runner.run_batch(discovery.samples, reference).await?;
    report.failures.extend(excluded);

    if config.publish_dir.is_some() {
        let mut unpublished = Vec::new();
        for lineage in &report.completed {
            let Some(vcf) = lineage.file(StageKind::VariantCalls, FileRole::Primary) else {
                continue;
            };
            match with_retries("publish", config.storage_retries, || storage.upload(vcf)).await {
                Ok(handle) => info!("Published {} as {}", vcf.display(), handle),
                Err(e) => {
                    warn!("Could not publish {}: {:#}", vcf.display(), e);
                    unpublished.push(SampleFailure {
                        sample: lineage.sample().clone(),
                        stage: Milestone::Done,
                        reason: PipelineError::Io(format!("publishing {}: {:#}", vcf.display(), e)),
                    });
                }
            }
        }
        report.failures.extend(unpublished);
    }

    let report_path = config.out_dir.join(BATCH_REPORT);
    report.write(&report_path)?;
    info!("Batch report written to {}", report_path.display());
    Ok(report)
}
