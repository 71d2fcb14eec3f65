//! Drives every discovered sample through filtering, alignment, variant calling and the
//! optional protein prediction step.
//!
//! Each sample runs in its own task, bounded by a semaphore. Stages within a sample run in
//! order; a failure stops that sample only. The reference index for the selected aligner is
//! built at most once per reference, however many samples ask for it at the same time: the
//! first caller builds it and every other caller waits on the same cell and sees the same
//! outcome, success or failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::task;

use crate::config::defs::{PipelineError, RunConfig};
use crate::datatypes::reference::ReferenceGenome;
use crate::datatypes::sample::{
    AlignmentResult, FilteredReads, MatePair, ProteinPrediction, RawReads, SampleId, SampleLineage, VariantCallSet,
};
use crate::datatypes::stage::{FileRole, StageKind};
use crate::pipelines::stages::{IndexSpec, StageRegistry};
use crate::utils::cache::{CacheKey, CacheKeyDeriver, CacheStore};
use crate::utils::command::{self, tool_params, Invocation, ToolInvoker, ToolParams};
use crate::utils::file::{has_prefixed_entry, missing_files, write_json_atomic};

/// Points a sample passes on its way through a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    Discovered,
    Filtered,
    Indexed,
    Aligned,
    VariantCalled,
    ProteinPredicted,
    Done,
}

impl Milestone {
    pub fn next(&self, protein: bool) -> Option<Milestone> {
        match self {
            Milestone::Discovered => Some(Milestone::Filtered),
            Milestone::Filtered => Some(Milestone::Indexed),
            Milestone::Indexed => Some(Milestone::Aligned),
            Milestone::Aligned => Some(Milestone::VariantCalled),
            Milestone::VariantCalled if protein => Some(Milestone::ProteinPredicted),
            Milestone::VariantCalled | Milestone::ProteinPredicted => Some(Milestone::Done),
            Milestone::Done => None,
        }
    }

    /// Stage this milestone completes or, for `Indexed`, unblocks. `Done` belongs to the
    /// last stage the run plans.
    pub fn stage(&self, protein: bool) -> StageKind {
        match self {
            Milestone::Discovered => StageKind::Reads,
            Milestone::Filtered => StageKind::FilteredReads,
            Milestone::Indexed | Milestone::Aligned => StageKind::Alignment,
            Milestone::VariantCalled => StageKind::VariantCalls,
            Milestone::Done if !protein => StageKind::VariantCalls,
            Milestone::ProteinPredicted | Milestone::Done => StageKind::Protein,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Milestone::Discovered => "discovered",
            Milestone::Filtered => "filtered",
            Milestone::Indexed => "indexed",
            Milestone::Aligned => "aligned",
            Milestone::VariantCalled => "variant_called",
            Milestone::ProteinPredicted => "protein_predicted",
            Milestone::Done => "done",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleState {
    Reached(Milestone),
    Failed { stage: Milestone, reason: PipelineError },
}

/// State machine of one sample. Moves only forward, one milestone at a time; a failed
/// sample never moves again.
#[derive(Debug, Clone)]
pub struct SampleProgress {
    sample: SampleId,
    protein: bool,
    state: SampleState,
}

impl SampleProgress {
    pub fn new(sample: SampleId, protein: bool) -> Self {
        SampleProgress {
            sample,
            protein,
            state: SampleState::Reached(Milestone::Discovered),
        }
    }

    pub fn state(&self) -> &SampleState {
        &self.state
    }

    pub fn advance(&mut self, to: Milestone) -> Result<(), PipelineError> {
        let missing = match &self.state {
            SampleState::Reached(current) if current.next(self.protein) == Some(to) => {
                debug!("Sample {}: {} -> {}", self.sample, current, to);
                self.state = SampleState::Reached(to);
                return Ok(());
            }
            SampleState::Reached(current) => format!("cannot move from {} to {}", current, to),
            SampleState::Failed { stage, .. } => format!("sample already failed at {}", stage),
        };
        Err(PipelineError::PrecursorMissing {
            sample: self.sample.to_string(),
            stage: to.stage(self.protein),
            missing,
        })
    }

    pub fn fail(&mut self, stage: Milestone, reason: PipelineError) -> SampleFailure {
        self.state = SampleState::Failed { stage, reason: reason.clone() };
        SampleFailure {
            sample: self.sample.clone(),
            stage,
            reason,
        }
    }
}

fn serialize_error<S: Serializer>(error: &PipelineError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFailure {
    pub sample: SampleId,
    pub stage: Milestone,
    #[serde(serialize_with = "serialize_error")]
    pub reason: PipelineError,
}

/// Outcome of a batch: finished lineages and per-sample failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub completed: Vec<SampleLineage>,
    pub failures: Vec<SampleFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, sample: &str) -> Option<&SampleFailure> {
        self.failures.iter().find(|f| f.sample.as_str() == sample)
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        write_json_atomic(path, self).map_err(PipelineError::from)
    }
}

type IndexCell = Arc<OnceCell<Result<ReferenceGenome, PipelineError>>>;

pub struct PipelineRunner {
    config: Arc<RunConfig>,
    registry: StageRegistry,
    invoker: Arc<dyn ToolInvoker>,
    cache: CacheStore,
    deriver: CacheKeyDeriver,
    indices: Mutex<HashMap<(String, String), IndexCell>>,
}

impl PipelineRunner {
    pub fn new(config: Arc<RunConfig>, invoker: Arc<dyn ToolInvoker>) -> Result<Self, PipelineError> {
        config.validate()?;
        let deriver = CacheKeyDeriver::new(config.hash_len)?;
        let cache = CacheStore::open(config.cache_manifest_path())?;
        Ok(PipelineRunner {
            config,
            registry: StageRegistry::standard(),
            invoker,
            cache,
            deriver,
            indices: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Runs all `samples` against `reference`. Fails as a whole only for problems found
    /// before any tool runs; everything after that is reported per sample.
    pub async fn run_batch(self: Arc<Self>, samples: Vec<RawReads>, reference: ReferenceGenome) -> Result<BatchReport, PipelineError> {
        self.check_collisions(&samples)?;
        info!(
            "Running {} sample(s) against {} with at most {} at a time",
            samples.len(),
            reference.ref_name(),
            self.config.max_parallel_samples
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_samples));
        let mut sample_ids = Vec::with_capacity(samples.len());
        let mut tasks = Vec::with_capacity(samples.len());
        for raw in samples {
            let runner = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let reference = reference.clone();
            sample_ids.push(raw.sample().clone());
            tasks.push(tokio::spawn(async move {
                let sample = raw.sample().clone();
                let _permit = semaphore.acquire_owned().await.map_err(|e| SampleFailure {
                    sample,
                    stage: Milestone::Discovered,
                    reason: PipelineError::Io(format!("scheduler closed: {}", e)),
                })?;
                runner.run_sample(raw, &reference).await
            }));
        }

        let mut report = BatchReport::default();
        for (sample, result) in sample_ids.into_iter().zip(join_all(tasks).await) {
            match result {
                Ok(Ok(lineage)) => report.completed.push(lineage),
                Ok(Err(failure)) => report.failures.push(failure),
                Err(e) => report.failures.push(SampleFailure {
                    sample,
                    stage: Milestone::Discovered,
                    reason: PipelineError::Io(format!("sample task aborted: {}", e)),
                }),
            }
        }
        info!(
            "Batch finished: {} completed, {} failed",
            report.completed.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn run_sample(&self, raw: RawReads, reference: &ReferenceGenome) -> Result<SampleLineage, SampleFailure> {
        let sample = raw.sample().clone();
        let mut progress = SampleProgress::new(sample.clone(), self.config.tools.protein.is_some());
        let mut lineage = SampleLineage::new(raw);
        info!("Sample {}: started", sample);

        match self.drive(&mut progress, &mut lineage, reference).await {
            Ok(()) => {
                info!("Sample {}: done", sample);
                Ok(lineage)
            }
            Err((stage, reason)) => {
                error!("Sample {} failed at {}: {}", sample, stage, reason);
                Err(progress.fail(stage, reason))
            }
        }
    }

    async fn drive(
        &self,
        progress: &mut SampleProgress,
        lineage: &mut SampleLineage,
        reference: &ReferenceGenome,
    ) -> Result<(), (Milestone, PipelineError)> {
        let at = |milestone: Milestone| move |e: PipelineError| (milestone, e);
        let tools = &self.config.tools;
        let mut keys = BTreeMap::new();

        let filtered = self.filter(lineage, &mut keys).await.map_err(at(Milestone::Filtered))?;
        lineage.record(filtered.into()).map_err(at(Milestone::Filtered))?;
        progress.advance(Milestone::Filtered).map_err(at(Milestone::Filtered))?;

        let indexed = self.ensure_index(reference, &tools.aligner).await.map_err(at(Milestone::Indexed))?;
        progress.advance(Milestone::Indexed).map_err(at(Milestone::Indexed))?;

        let aligned = self.align(lineage, &indexed, &mut keys).await.map_err(at(Milestone::Aligned))?;
        lineage.record(aligned.into()).map_err(at(Milestone::Aligned))?;
        progress.advance(Milestone::Aligned).map_err(at(Milestone::Aligned))?;

        let calls = self.call_variants(lineage, &indexed, &mut keys).await.map_err(at(Milestone::VariantCalled))?;
        lineage.record(calls.into()).map_err(at(Milestone::VariantCalled))?;
        progress.advance(Milestone::VariantCalled).map_err(at(Milestone::VariantCalled))?;

        if tools.protein.is_some() {
            let proteins = self.predict_proteins(lineage, &mut keys).await.map_err(at(Milestone::ProteinPredicted))?;
            lineage.record(proteins.into()).map_err(at(Milestone::ProteinPredicted))?;
            progress.advance(Milestone::ProteinPredicted).map_err(at(Milestone::ProteinPredicted))?;
        }

        progress.advance(Milestone::Done).map_err(at(Milestone::Done))
    }

    async fn filter(&self, lineage: &SampleLineage, keys: &mut BTreeMap<StageKind, CacheKey>) -> Result<FilteredReads, PipelineError> {
        let tool = self.config.tools.filter.as_str();
        let mates = mates_of(lineage, StageKind::Reads)?;
        let (mut files, params) = self
            .execute_stage(lineage, keys, StageKind::FilteredReads, tool, None, |outputs| {
                command::filter_invocations(&self.config, tool, &mates, outputs)
            })
            .await?;
        let stage = StageKind::FilteredReads;
        Ok(FilteredReads::new(
            lineage.sample().clone(),
            MatePair::new(take(&mut files, stage, FileRole::Read1)?, take(&mut files, stage, FileRole::Read2)?),
            take(&mut files, stage, FileRole::Report)?,
            params.provenance(),
        ))
    }

    async fn align(
        &self,
        lineage: &SampleLineage,
        reference: &ReferenceGenome,
        keys: &mut BTreeMap<StageKind, CacheKey>,
    ) -> Result<AlignmentResult, PipelineError> {
        let tool = self.config.tools.aligner.as_str();
        let mates = mates_of(lineage, StageKind::FilteredReads)?;
        let prefix = reference.index_prefix().ok_or_else(|| PipelineError::ReferenceUnavailable {
            reference: reference.identity(),
            error: "no index prefix".to_string(),
        })?;
        let sample = lineage.sample().clone();
        let (mut files, params) = self
            .execute_stage(lineage, keys, StageKind::Alignment, tool, Some(reference), |outputs| {
                command::align_invocations(&self.config, tool, &sample, &mates, &prefix, outputs)
            })
            .await?;
        Ok(AlignmentResult::new(
            sample,
            take(&mut files, StageKind::Alignment, FileRole::Primary)?,
            files.remove(&FileRole::Index),
            files.remove(&FileRole::Report),
            params.provenance(),
        ))
    }

    async fn call_variants(
        &self,
        lineage: &SampleLineage,
        reference: &ReferenceGenome,
        keys: &mut BTreeMap<StageKind, CacheKey>,
    ) -> Result<VariantCallSet, PipelineError> {
        let tool = self.config.tools.caller.as_str();
        let fasta = decompressed(reference)
            .await
            .map_err(|e| PipelineError::ReferenceUnavailable {
                reference: reference.identity(),
                error: e.to_string(),
            })?;
        let bam = lineage
            .file(StageKind::Alignment, FileRole::Primary)
            .map(Path::to_path_buf)
            .ok_or_else(|| precursor(lineage, StageKind::VariantCalls, "no alignment recorded"))?;
        let (mut files, params) = self
            .execute_stage(lineage, keys, StageKind::VariantCalls, tool, Some(reference), |outputs| {
                command::call_invocations(tool, &fasta, &bam, outputs)
            })
            .await?;
        Ok(VariantCallSet::new(
            lineage.sample().clone(),
            take(&mut files, StageKind::VariantCalls, FileRole::Primary)?,
            files.remove(&FileRole::Index),
            params.provenance(),
        ))
    }

    async fn predict_proteins(&self, lineage: &SampleLineage, keys: &mut BTreeMap<StageKind, CacheKey>) -> Result<ProteinPrediction, PipelineError> {
        let stage = StageKind::Protein;
        let tool = self
            .config
            .tools
            .protein
            .as_deref()
            .ok_or_else(|| PipelineError::InvalidConfig("protein prediction is not enabled".to_string()))?;
        let reads = lineage
            .file(StageKind::FilteredReads, FileRole::Read1)
            .map(Path::to_path_buf)
            .ok_or_else(|| precursor(lineage, stage, "no filtered reads recorded"))?;
        let (mut files, params) = self
            .execute_stage(lineage, keys, stage, tool, None, |outputs| {
                command::protein_invocations(tool, &reads, outputs)
            })
            .await?;
        Ok(ProteinPrediction::new(
            lineage.sample().clone(),
            take(&mut files, stage, FileRole::Primary)?,
            take(&mut files, stage, FileRole::Genes)?,
            params.provenance(),
        ))
    }

    /// Validates, consults the cache, runs the planned invocations and checks the required
    /// outputs. Returns the produced files by role and leaves the stage's key in `keys`.
    async fn execute_stage<F>(
        &self,
        lineage: &SampleLineage,
        keys: &mut BTreeMap<StageKind, CacheKey>,
        stage: StageKind,
        tool: &str,
        reference: Option<&ReferenceGenome>,
        plan: F,
    ) -> Result<(BTreeMap<FileRole, PathBuf>, ToolParams), PipelineError>
    where
        F: FnOnce(&BTreeMap<FileRole, PathBuf>) -> Result<Vec<Invocation>, PipelineError>,
    {
        self.registry.validate(stage, tool, lineage, reference)?;
        let descriptor = self
            .registry
            .descriptor(stage)
            .ok_or_else(|| PipelineError::UnsupportedTool { stage, tool: tool.to_string() })?;
        let input = descriptor
            .source()
            .and_then(|s| lineage.get(s))
            .ok_or_else(|| precursor(lineage, stage, "input entity not recorded"))?;

        let sample = lineage.sample();
        let params = tool_params(&self.config, tool);
        let upstream = descriptor.source().and_then(|s| keys.get(&s));
        let key = self.deriver.derive_key(descriptor, input, upstream, &params, reference);
        let expected = self.registry.expected_outputs(stage, sample.as_str(), tool)?;
        let dir = self.config.sample_dir(sample.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let paths = expected.paths(&dir);

        if let Some(entry) = self.cache.lookup(&key).await {
            if expected.required.iter().all(|(role, _)| entry.files.contains_key(role)) {
                info!("Sample {}: cache hit for {} ({}), skipping {}", sample, stage, key, tool);
                keys.insert(stage, key);
                return Ok((entry.files, params));
            }
        }

        for invocation in plan(&paths)? {
            self.invoke(&invocation, &dir).await?;
        }

        let required: Vec<&Path> = expected
            .required
            .iter()
            .filter_map(|(role, _)| paths.get(role).map(PathBuf::as_path))
            .collect();
        let missing = missing_files(required);
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            return Err(PipelineError::ToolInvocationFailed {
                tool: tool.to_string(),
                exit_code: Some(0),
                error: format!("expected outputs not written: {}", missing.join(", ")),
            });
        }

        let mut produced = BTreeMap::new();
        for (role, _) in expected.required.iter().chain(&expected.optional) {
            if let Some(path) = paths.get(role).filter(|p| p.exists()) {
                produced.insert(*role, path.clone());
            }
        }
        for (role, _) in &expected.scratch {
            if let Some(path) = paths.get(role).filter(|p| p.exists()) {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("Could not remove {}: {}", path.display(), e);
                }
            }
        }

        self.cache.record(key.clone(), stage.as_str(), produced.clone()).await?;
        keys.insert(stage, key);
        Ok((produced, params))
    }

    async fn invoke(&self, invocation: &Invocation, working_dir: &Path) -> Result<(), PipelineError> {
        debug!("Invoking {} {}", invocation.tool, invocation.args.join(" "));
        let output = self
            .invoker
            .invoke(&invocation.tool, &invocation.args, working_dir)
            .await
            .map_err(|e| PipelineError::ToolInvocationFailed {
                tool: invocation.tool.clone(),
                exit_code: None,
                error: e.to_string(),
            })?;
        if !output.success() {
            return Err(PipelineError::ToolInvocationFailed {
                tool: invocation.tool.clone(),
                exit_code: Some(output.exit_code),
                error: stderr_tail(&output.stderr),
            });
        }
        Ok(())
    }

    /// Reference indexed for `aligner`, building the index on first use. Concurrent callers
    /// for the same reference and index tool share one build and its outcome.
    pub async fn ensure_index(&self, reference: &ReferenceGenome, aligner: &str) -> Result<ReferenceGenome, PipelineError> {
        if reference.is_indexed_with(aligner) {
            return Ok(reference.clone());
        }
        let spec = self.registry.index_spec(aligner).ok_or_else(|| PipelineError::UnsupportedTool {
            stage: StageKind::Alignment,
            tool: aligner.to_string(),
        })?;

        let cell = {
            let mut indices = self.indices.lock().await;
            Arc::clone(
                indices
                    .entry((reference.identity(), spec.tool.to_string()))
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        cell.get_or_init(|| self.build_index(reference, spec)).await.clone()
    }

    async fn build_index(&self, reference: &ReferenceGenome, spec: IndexSpec) -> Result<ReferenceGenome, PipelineError> {
        let unavailable = |error: String| PipelineError::ReferenceUnavailable {
            reference: reference.identity(),
            error,
        };

        let ref_path = reference.ref_path();
        if !ref_path.is_file() {
            return Err(unavailable(format!("{} not found", ref_path.display())));
        }
        let fasta = decompressed(reference).await.map_err(|e| unavailable(e.to_string()))?;

        let params = tool_params(&self.config, spec.tool);
        let key = self.deriver.index_key(reference, &params);
        let index_dir = self
            .config
            .index_root()
            .join(format!("{}_{}", spec.tool, self.deriver.short_hash(&[key.as_str()])));
        let indexed = reference.with_index(index_dir.clone(), spec.index_name, spec.aligner);

        let ready = |dir: &Path| has_prefixed_entry(dir, spec.index_name).unwrap_or(false);
        if self.cache.lookup(&key).await.is_some() && ready(&index_dir) {
            info!("Cache hit for {} index of {} ({})", spec.tool, reference.ref_name(), key);
            return Ok(indexed);
        }

        info!("Building {} index of {} in {}", spec.tool, reference.ref_name(), index_dir.display());
        tokio::fs::create_dir_all(&index_dir)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let invocation = command::index_invocation(&self.config, spec.tool, &fasta, &index_dir.join(spec.index_name))?;
        self.invoke(&invocation, &index_dir)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !ready(&index_dir) {
            return Err(unavailable(format!(
                "{} wrote no {}* files to {}",
                spec.tool,
                spec.index_name,
                index_dir.display()
            )));
        }

        self.cache
            .record(key, "index", BTreeMap::from([(FileRole::Index, index_dir)]))
            .await?;
        Ok(indexed)
    }

    fn planned_stages(&self) -> Vec<(StageKind, &str)> {
        let tools = &self.config.tools;
        let mut stages = vec![
            (StageKind::FilteredReads, tools.filter.as_str()),
            (StageKind::Alignment, tools.aligner.as_str()),
            (StageKind::VariantCalls, tools.caller.as_str()),
        ];
        if let Some(protein) = tools.protein.as_deref() {
            stages.push((StageKind::Protein, protein));
        }
        stages
    }

    /// Rejects a batch in which two stage outputs would land on the same path.
    pub fn check_collisions(&self, samples: &[RawReads]) -> Result<(), PipelineError> {
        let stages = self.planned_stages();
        let mut seen = HashSet::new();
        for raw in samples {
            let sample = raw.sample().as_str();
            let dir = self.config.sample_dir(sample);
            for (stage, tool) in &stages {
                for name in self.registry.expected_outputs(*stage, sample, tool)?.names() {
                    let path = dir.join(name);
                    if !seen.insert(path.clone()) {
                        return Err(PipelineError::NameCollision {
                            name: path.display().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Uncompressed reference path. Inflating a large FASTA stays off the async workers.
async fn decompressed(reference: &ReferenceGenome) -> Result<PathBuf, PipelineError> {
    let reference = reference.clone();
    task::spawn_blocking(move || reference.decompressed_path())
        .await
        .map_err(|e| PipelineError::Io(format!("decompression task failed: {}", e)))?
}

fn precursor(lineage: &SampleLineage, stage: StageKind, missing: &str) -> PipelineError {
    PipelineError::PrecursorMissing {
        sample: lineage.sample().to_string(),
        stage,
        missing: missing.to_string(),
    }
}

fn mates_of(lineage: &SampleLineage, stage: StageKind) -> Result<MatePair, PipelineError> {
    let read = |role: FileRole| {
        lineage
            .file(stage, role)
            .map(Path::to_path_buf)
            .ok_or_else(|| precursor(lineage, stage, &format!("no {} recorded", role)))
    };
    Ok(MatePair::new(read(FileRole::Read1)?, read(FileRole::Read2)?))
}

fn take(files: &mut BTreeMap<FileRole, PathBuf>, stage: StageKind, role: FileRole) -> Result<PathBuf, PipelineError> {
    files
        .remove(&role)
        .ok_or_else(|| PipelineError::Cache(format!("no {} output recorded for {}", role, stage)))
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> SampleId {
        SampleId::new(id).unwrap()
    }

    #[test]
    fn test_milestone_order() {
        let mut m = Milestone::Discovered;
        let mut seen = vec![m];
        while let Some(next) = m.next(false) {
            seen.push(next);
            m = next;
        }
        assert_eq!(
            seen,
            vec![
                Milestone::Discovered,
                Milestone::Filtered,
                Milestone::Indexed,
                Milestone::Aligned,
                Milestone::VariantCalled,
                Milestone::Done
            ]
        );
        assert_eq!(Milestone::VariantCalled.next(true), Some(Milestone::ProteinPredicted));
    }

    #[test]
    fn test_progress_rejects_out_of_order() {
        let mut progress = SampleProgress::new(sample("S1"), false);
        let err = progress.advance(Milestone::Aligned).unwrap_err();
        assert!(matches!(err, PipelineError::PrecursorMissing { stage: StageKind::Alignment, .. }));
        assert_eq!(progress.state(), &SampleState::Reached(Milestone::Discovered));

        progress.advance(Milestone::Filtered).unwrap();
        assert!(progress.advance(Milestone::Filtered).is_err());
        assert!(progress.advance(Milestone::ProteinPredicted).is_err());
    }

    #[test]
    fn test_done_belongs_to_last_planned_stage() {
        assert_eq!(Milestone::Done.stage(false), StageKind::VariantCalls);
        assert_eq!(Milestone::Done.stage(true), StageKind::Protein);

        let mut progress = SampleProgress::new(sample("S1"), false);
        for milestone in [Milestone::Filtered, Milestone::Indexed, Milestone::Aligned] {
            progress.advance(milestone).unwrap();
        }
        let err = progress.advance(Milestone::Done).unwrap_err();
        assert!(matches!(err, PipelineError::PrecursorMissing { stage: StageKind::VariantCalls, .. }));
    }

    #[test]
    fn test_failed_sample_is_terminal() {
        let mut progress = SampleProgress::new(sample("S1"), false);
        let reason = PipelineError::ReferenceUnavailable {
            reference: "/refs/ref.fa".to_string(),
            error: "missing".to_string(),
        };
        let failure = progress.fail(Milestone::Indexed, reason.clone());
        assert_eq!(failure.stage, Milestone::Indexed);
        assert_eq!(progress.state(), &SampleState::Failed { stage: Milestone::Indexed, reason });
        assert!(progress.advance(Milestone::Filtered).is_err());
    }

    #[test]
    fn test_batch_report_serializes_reasons() -> anyhow::Result<()> {
        let report = BatchReport {
            completed: Vec::new(),
            failures: vec![SampleFailure {
                sample: sample("S2"),
                stage: Milestone::Aligned,
                reason: PipelineError::ToolInvocationFailed {
                    tool: "bwa".to_string(),
                    exit_code: Some(1),
                    error: "boom".to_string(),
                },
            }],
        };
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["failures"][0]["stage"], "aligned");
        assert_eq!(json["failures"][0]["sample"], "S2");
        assert!(json["failures"][0]["reason"].as_str().unwrap_or("").contains("bwa"));
        assert!(!report.is_success());
        assert!(report.failure("S2").is_some());
        Ok(())
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr = "a\nb\n\nc\nd\ne\nf\ng\n";
        assert_eq!(stderr_tail(stderr), "c | d | e | f | g");
        assert_eq!(stderr_tail(""), "");
    }
}
