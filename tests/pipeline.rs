use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use seqstage::config::defs::{PipelineError, RunConfig, BATCH_REPORT};
use seqstage::datatypes::reference::ReferenceGenome;
use seqstage::datatypes::stage::{FileRole, StageKind};
use seqstage::pipelines::runner::{Milestone, PipelineRunner};
use seqstage::pipelines::variant_discovery;
use seqstage::utils::command::{ToolInvoker, ToolOutput};
use seqstage::utils::discovery::{discover, rediscover, MatePattern};
use seqstage::utils::storage::{LocalStorage, Storage};

/// Stands in for the external tools: records every call and creates each output path the
/// call names inside its working directory.
#[derive(Default)]
struct MockInvoker {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    /// Fail calls of this tool whose arguments mention the given text.
    fail_on: Option<(String, String)>,
    /// Exit 0 without writing anything.
    write_nothing: bool,
    index_delay: Duration,
}

impl MockInvoker {
    fn count(&self, tool: &str, first_arg: Option<&str>) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, args)| t == tool && first_arg.is_none_or(|a| args.first().map(String::as_str) == Some(a)))
            .count()
    }

    fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn invoke(&self, tool: &str, args: &[String], working_dir: &Path) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push((tool.to_string(), args.to_vec()));

        if let Some((fail_tool, needle)) = &self.fail_on {
            if fail_tool == tool && args.iter().any(|a| a.contains(needle.as_str())) {
                return Ok(ToolOutput {
                    stdout: String::new(),
                    stderr: "mock failure\n".to_string(),
                    exit_code: 1,
                });
            }
        }

        let builds_index = tool.ends_with("-build") || (tool == "bwa" && args.first().map(String::as_str) == Some("index"));
        if builds_index {
            tokio::time::sleep(self.index_delay).await;
        }
        if !self.write_nothing {
            for arg in args {
                let path = Path::new(arg);
                if path.starts_with(working_dir) && !path.exists() {
                    std::fs::write(path, b"mock")?;
                }
            }
        }
        Ok(ToolOutput::default())
    }
}

/// Serves downloads from the local filesystem but never accepts an upload.
struct UnreachableBucket;

#[async_trait]
impl Storage for UnreachableBucket {
    async fn download(&self, handle: &str) -> Result<PathBuf> {
        LocalStorage::new(PathBuf::new()).download(handle).await
    }

    async fn upload(&self, _path: &Path) -> Result<String> {
        Err(anyhow::anyhow!("bucket down"))
    }
}

struct Fixture {
    _dir: TempDir,
    seq_dir: PathBuf,
    reference: ReferenceGenome,
    config: RunConfig,
}

fn fixture(samples: &[&str]) -> Result<Fixture> {
    let dir = tempdir()?;
    let seq_dir = dir.path().join("reads");
    std::fs::create_dir_all(&seq_dir)?;
    for sample in samples {
        std::fs::write(seq_dir.join(format!("{}_1.fastq.gz", sample)), b"@r/1\nACGT\n+\nIIII\n")?;
        std::fs::write(seq_dir.join(format!("{}_2.fastq.gz", sample)), b"@r/2\nACGT\n+\nIIII\n")?;
    }
    let ref_dir = dir.path().join("refs");
    std::fs::create_dir_all(&ref_dir)?;
    std::fs::write(ref_dir.join("ref.fa"), b">chr1\nACGTACGT\n")?;
    let reference = ReferenceGenome::new(ref_dir, "ref.fa")?;

    let mut config = RunConfig::new(dir.path().join("out"));
    config.threads = 2;
    config.max_parallel_samples = 4;
    Ok(Fixture {
        _dir: dir,
        seq_dir,
        reference,
        config,
    })
}

async fn run(fx: &Fixture, invoker: Arc<MockInvoker>) -> Result<seqstage::pipelines::runner::BatchReport> {
    let discovery = discover(&fx.seq_dir, &MatePattern::default())?;
    let runner = Arc::new(PipelineRunner::new(Arc::new(fx.config.clone()), invoker)?);
    Ok(runner.run_batch(discovery.samples, fx.reference.clone()).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_builds_index_once() -> Result<()> {
    let fx = fixture(&["S1", "S2", "S3"])?;
    let invoker = Arc::new(MockInvoker {
        index_delay: Duration::from_millis(50),
        ..Default::default()
    });

    let report = run(&fx, invoker.clone()).await?;

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(report.completed.len(), 3);
    assert_eq!(invoker.count("bwa", Some("index")), 1);
    assert_eq!(invoker.count("bwa", Some("mem")), 3);
    assert_eq!(invoker.count("fastp", None), 3);

    let out = &fx.config.out_dir;
    for sample in ["S1", "S2", "S3"] {
        assert!(out.join(sample).join(format!("{}_bcftools.vcf", sample)).is_file());
        assert!(out.join(sample).join(format!("{}_bwa.bam.bai", sample)).is_file());
        assert!(!out.join(sample).join(format!("{}_bwa.sam", sample)).exists());
    }
    let lineage = &report.completed[0];
    let stages: Vec<StageKind> = lineage.entities().iter().map(|e| e.stage()).collect();
    assert_eq!(
        stages,
        vec![StageKind::Reads, StageKind::FilteredReads, StageKind::Alignment, StageKind::VariantCalls]
    );
    assert_eq!(lineage.get(StageKind::Alignment).and_then(|e| e.provenance()).map(|p| p.tool()), Some("bwa"));
    assert!(fx.config.cache_manifest_path().is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_index_failure_is_shared_by_all_samples() -> Result<()> {
    let fx = fixture(&["S1", "S2"])?;
    let invoker = Arc::new(MockInvoker {
        fail_on: Some(("bwa".to_string(), "bwa_idx".to_string())),
        index_delay: Duration::from_millis(20),
        ..Default::default()
    });

    let report = run(&fx, invoker.clone()).await?;

    assert!(report.completed.is_empty());
    assert_eq!(report.failures.len(), 2);
    for failure in &report.failures {
        assert_eq!(failure.stage, Milestone::Indexed);
        assert!(matches!(failure.reason, PipelineError::ReferenceUnavailable { .. }));
    }
    assert_eq!(invoker.count("bwa", Some("index")), 1);
    assert_eq!(invoker.count("bwa", Some("mem")), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_reference_fails_at_indexed() -> Result<()> {
    let fx = fixture(&["S1"])?;
    std::fs::remove_file(fx.reference.ref_path())?;
    let invoker = Arc::new(MockInvoker::default());

    let report = run(&fx, invoker.clone()).await?;

    let failure = report.failure("S1").expect("S1 should fail");
    assert_eq!(failure.stage, Milestone::Indexed);
    assert!(matches!(failure.reason, PipelineError::ReferenceUnavailable { .. }));
    assert_eq!(invoker.count("bwa", None), 0);
    Ok(())
}

#[tokio::test]
async fn test_tool_failure_stays_with_its_sample() -> Result<()> {
    let fx = fixture(&["S1", "S2"])?;
    let invoker = Arc::new(MockInvoker {
        fail_on: Some(("samtools".to_string(), "S2_bwa.sam".to_string())),
        ..Default::default()
    });

    let report = run(&fx, invoker).await?;

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].sample().as_str(), "S1");
    let failure = report.failure("S2").expect("S2 should fail");
    assert_eq!(failure.stage, Milestone::Aligned);
    assert_eq!(
        failure.reason,
        PipelineError::ToolInvocationFailed {
            tool: "samtools".to_string(),
            exit_code: Some(1),
            error: "mock failure".to_string(),
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_unwritten_outputs_fail_the_stage() -> Result<()> {
    let fx = fixture(&["S1"])?;
    let invoker = Arc::new(MockInvoker {
        write_nothing: true,
        ..Default::default()
    });

    let report = run(&fx, invoker).await?;

    let failure = report.failure("S1").expect("S1 should fail");
    assert_eq!(failure.stage, Milestone::Filtered);
    assert!(matches!(
        &failure.reason,
        PipelineError::ToolInvocationFailed { tool, .. } if tool == "fastp"
    ));
    Ok(())
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() -> Result<()> {
    let fx = fixture(&["S1", "S2"])?;
    let first = Arc::new(MockInvoker::default());
    let report = run(&fx, first.clone()).await?;
    assert!(report.is_success());
    assert!(first.total() > 0);

    let second = Arc::new(MockInvoker::default());
    let again = run(&fx, second.clone()).await?;
    assert!(again.is_success());
    assert_eq!(second.total(), 0);
    assert_eq!(again.completed.len(), 2);

    std::fs::remove_file(fx.config.out_dir.join("S1").join("S1_bcftools.vcf"))?;
    let third = Arc::new(MockInvoker::default());
    let rerun = run(&fx, third.clone()).await?;
    assert!(rerun.is_success());
    assert_eq!(third.count("bcftools", None), 2);
    assert_eq!(third.count("fastp", None), 0);
    Ok(())
}

#[tokio::test]
async fn test_stricter_filter_realigns_and_recalls() -> Result<()> {
    let mut fx = fixture(&["S1"])?;
    fx.config.min_quality = 20;
    let first = Arc::new(MockInvoker::default());
    assert!(run(&fx, first.clone()).await?.is_success());

    fx.config.min_quality = 30;
    let second = Arc::new(MockInvoker::default());
    let report = run(&fx, second.clone()).await?;

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(second.count("fastp", None), 1);
    assert_eq!(second.count("bwa", Some("mem")), 1);
    assert_eq!(second.count("bcftools", None), 2);
    assert_eq!(second.count("bwa", Some("index")), 0);
    Ok(())
}

#[tokio::test]
async fn test_each_reference_gets_its_own_index() -> Result<()> {
    let fx = fixture(&["S1"])?;
    let ref_dir = fx.reference.ref_dir().to_path_buf();
    std::fs::write(ref_dir.join("other.fa"), b">chr2\nTTTTGGGG\n")?;
    let other = ReferenceGenome::new(ref_dir, "other.fa")?;
    let invoker = Arc::new(MockInvoker::default());
    let runner = PipelineRunner::new(Arc::new(fx.config.clone()), invoker.clone())?;

    let first = runner.ensure_index(&fx.reference, "bwa").await?;
    let second = runner.ensure_index(&other, "bwa").await?;

    assert!(first.index_dir().is_some());
    assert_ne!(first.index_dir(), second.index_dir());
    assert_eq!(invoker.count("bwa", Some("index")), 2);

    let later = PipelineRunner::new(Arc::new(fx.config.clone()), invoker.clone())?;
    let again = later.ensure_index(&fx.reference, "bwa").await?;
    assert_eq!(again.index_dir(), first.index_dir());
    assert_eq!(invoker.count("bwa", Some("index")), 2);
    Ok(())
}

#[tokio::test]
async fn test_publish_failure_still_writes_report() -> Result<()> {
    let fx = fixture(&["S1"])?;
    let mut config = fx.config.clone();
    config.publish_dir = Some(config.out_dir.join("published"));
    config.storage_retries = 1;
    let config = Arc::new(config);
    let reference = fx.reference.ref_path().display().to_string();

    let report = variant_discovery::run(
        config.clone(),
        &fx.seq_dir,
        &reference,
        Arc::new(MockInvoker::default()),
        &UnreachableBucket,
    )
    .await?;

    assert_eq!(report.completed.len(), 1);
    let failure = report.failure("S1").expect("publishing S1 should fail");
    assert_eq!(failure.stage, Milestone::Done);
    assert!(matches!(&failure.reason, PipelineError::Io(msg) if msg.contains("bucket down")));

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(config.out_dir.join(BATCH_REPORT))?)?;
    assert_eq!(written["completed"].as_array().map(Vec::len), Some(1));
    assert_eq!(written["failures"][0]["stage"], "done");
    Ok(())
}

#[tokio::test]
async fn test_hisat2_gatk_and_protein_prediction() -> Result<()> {
    let mut fx = fixture(&["S1"])?;
    fx.config.tools.aligner = "hisat2".to_string();
    fx.config.tools.caller = "gatk".to_string();
    fx.config.tools.protein = Some("prodigal".to_string());
    let invoker = Arc::new(MockInvoker::default());

    let report = run(&fx, invoker.clone()).await?;

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(invoker.count("hisat2-build", None), 1);
    let lineage = &report.completed[0];
    assert_eq!(lineage.entities().len(), 5);
    assert!(lineage.file(StageKind::Alignment, FileRole::Report).is_some());
    assert!(lineage.file(StageKind::VariantCalls, FileRole::Index).is_none());
    let proteins = lineage.file(StageKind::Protein, FileRole::Primary).expect("protein output");
    assert!(proteins.ends_with("S1_prodigal_prot.faa"));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_samples_are_a_name_collision() -> Result<()> {
    let fx = fixture(&["S1"])?;
    let discovery = discover(&fx.seq_dir, &MatePattern::default())?;
    let mut samples = discovery.samples.clone();
    samples.extend(discovery.samples);
    let invoker = Arc::new(MockInvoker::default());
    let runner = Arc::new(PipelineRunner::new(Arc::new(fx.config.clone()), invoker.clone())?);

    let result = runner.run_batch(samples, fx.reference.clone()).await;

    assert!(matches!(result, Err(PipelineError::NameCollision { .. })));
    assert_eq!(invoker.total(), 0);
    Ok(())
}

#[tokio::test]
async fn test_variant_discovery_run_reports_incomplete_samples() -> Result<()> {
    let fx = fixture(&["S1"])?;
    std::fs::write(fx.seq_dir.join("S2_1.fastq.gz"), b"@r/1\nACGT\n+\nIIII\n")?;
    let storage = LocalStorage::new(fx.config.out_dir.join("published"));
    let mut config = fx.config.clone();
    config.publish_dir = Some(storage.destination().to_path_buf());
    let config = Arc::new(config);
    let reference = format!("file://{}", fx.reference.ref_path().display());

    let report = variant_discovery::run(config.clone(), &fx.seq_dir, &reference, Arc::new(MockInvoker::default()), &storage).await?;

    assert_eq!(report.completed.len(), 1);
    let failure = report.failure("S2").expect("S2 is incomplete");
    assert_eq!(failure.stage, Milestone::Discovered);
    assert_eq!(
        failure.reason,
        PipelineError::IncompleteSample {
            sample: "S2".to_string(),
            missing: "2".to_string(),
        }
    );
    assert!(storage.destination().join("S1_bcftools.vcf").is_file());

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(config.out_dir.join(BATCH_REPORT))?)?;
    assert_eq!(written["completed"].as_array().map(Vec::len), Some(1));
    assert_eq!(written["failures"][0]["stage"], "discovered");
    Ok(())
}

#[tokio::test]
async fn test_outputs_rediscover_after_run() -> Result<()> {
    let fx = fixture(&["S1", "S2"])?;
    let report = run(&fx, Arc::new(MockInvoker::default())).await?;
    assert!(report.is_success());

    let calls = rediscover(&fx.config.out_dir, StageKind::VariantCalls, "bcftools")?;
    let mut samples: Vec<&str> = calls.iter().map(|e| e.sample().as_str()).collect();
    samples.sort();
    assert_eq!(samples, vec!["S1", "S2"]);

    let first = discover(&fx.seq_dir, &MatePattern::default())?;
    let second = discover(&fx.seq_dir, &MatePattern::default())?;
    assert_eq!(first, second);
    assert_eq!(first.sample_ids(), vec!["S1", "S2"]);
    Ok(())
}

#[tokio::test]
async fn test_missing_reference_handle_is_reference_unavailable() -> Result<()> {
    let fx = fixture(&["S1"])?;
    let mut config = fx.config.clone();
    config.storage_retries = 1;
    let storage = LocalStorage::new(config.out_dir.join("published"));
    let result = variant_discovery::run(
        Arc::new(config),
        &fx.seq_dir,
        "/definitely/not/here.fa",
        Arc::new(MockInvoker::default()),
        &storage,
    )
    .await;
    assert!(matches!(result, Err(PipelineError::ReferenceUnavailable { .. })));
    Ok(())
}
