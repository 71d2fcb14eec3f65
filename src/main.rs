use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};

use seqstage::cli::{parse, Arguments};
use seqstage::config::defs::{PipelineError, RunConfig, ToolSelection, SAMTOOLS_TAG};
use seqstage::pipelines::runner::BatchReport;
use seqstage::pipelines::variant_discovery;
use seqstage::utils::command::{check_version, ProcessInvoker, ToolInvoker};
use seqstage::utils::discovery::MatePattern;
use seqstage::utils::storage::LocalStorage;
use seqstage::utils::system::{detect_cores_and_load, detect_ram, threads_per_sample};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n SeqStage\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    let threads = threads_per_sample(max_cores, args.max_parallel_samples);
    debug!(
        "Detected {} usable cores; CPU load {}%; {} threads per tool call for {} parallel samples",
        max_cores, cpu_load, threads, args.max_parallel_samples
    );

    match detect_ram() {
        Ok((total_ram, available_ram)) => {
            debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
            debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
        }
        Err(e) => warn!("{}", e),
    }

    let out_dir = setup_output_dir(&args, &dir)?;
    let module = args.module.clone();
    let run_config = Arc::new(build_config(&args, dir, out_dir, threads, log_level));

    let outcome = match module.as_str() {
        "discover" => discover_run(&run_config, &args.seq_dir).map(|_| None),
        "variant_discovery" => variant_discovery_run(run_config.clone(), &args).await.map(Some),
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    };

    match outcome {
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
        Ok(Some(report)) if !report.is_success() => {
            for failure in &report.failures {
                error!("{} failed at {}: {}", failure.sample, failure.stage, failure.reason);
            }
            error!(
                "{} failure(s), {} sample(s) completed, at {} milliseconds.",
                report.failures.len(),
                report.completed.len(),
                run_start.elapsed().as_millis()
            );
            std::process::exit(2);
        }
        Ok(_) => {}
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


fn build_config(args: &Arguments, cwd: PathBuf, out_dir: PathBuf, threads: usize, log_level: LevelFilter) -> RunConfig {
    RunConfig {
        cwd,
        out_dir,
        mate_pattern: MatePattern {
            suffix: args.suffix.clone(),
            verify_headers: args.verify_headers,
        },
        tools: ToolSelection {
            filter: args.filter_tool.clone(),
            aligner: args.aligner.clone(),
            caller: args.caller.clone(),
            protein: args.protein_tool.clone(),
        },
        hash_len: args.hash_len,
        threads,
        max_parallel_samples: args.max_parallel_samples,
        min_quality: args.quality,
        storage_retries: args.storage_retries,
        publish_dir: args.publish.clone(),
        tool_versions: HashMap::new(),
        log_level,
    }
}


fn discover_run(config: &RunConfig, seq_dir: &Path) -> Result<(), PipelineError> {
    let discovery = variant_discovery::discover_only(config, seq_dir)?;
    println!("{}", discovery.sample_ids().join("\n"));
    Ok(())
}


async fn variant_discovery_run(config: Arc<RunConfig>, args: &Arguments) -> Result<BatchReport, PipelineError> {
    let reference = args
        .reference
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig("variant_discovery needs --reference".to_string()))?;
    config.validate()?;

    let invoker: Arc<dyn ToolInvoker> = Arc::new(ProcessInvoker);
    let config = if args.check_tools {
        Arc::new(with_detected_versions(&config, invoker.as_ref()).await)
    } else {
        config
    };

    let storage = LocalStorage::new(
        config
            .publish_dir
            .clone()
            .unwrap_or_else(|| config.out_dir.join("published")),
    );
    variant_discovery::run(config, &args.seq_dir, reference, invoker, &storage).await
}


/// Asks every selected tool for its version and records what answers, so provenance and
/// cache keys follow the installed tools.
async fn with_detected_versions(config: &RunConfig, invoker: &dyn ToolInvoker) -> RunConfig {
    let tools = &config.tools;
    let mut selected = vec![tools.filter.as_str(), tools.aligner.as_str(), SAMTOOLS_TAG, tools.caller.as_str()];
    selected.extend(tools.protein.as_deref());

    let mut config = config.clone();
    for tool in selected {
        match check_version(invoker, tool, &config.cwd).await {
            Ok(version) => {
                info!("{} version {}", tool, version);
                config.tool_versions.insert(tool.to_string(), version);
            }
            Err(e) => warn!("Could not determine {} version: {}", tool, e),
        }
    }
    config
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `seqstage_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => cwd.join(path),
        None => cwd.join(format!("seqstage_{}", chrono::Local::now().format("%Y%m%d"))),
    };
    fs::create_dir_all(&out_dir)
        .map_err(|e| anyhow!("Cannot create output directory {}: {}", out_dir.display(), e))?;
    Ok(out_dir)
}
