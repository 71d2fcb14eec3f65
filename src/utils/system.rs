// src/utils/system.rs: host resources used to size a run

use std::time::Duration;

use anyhow::{anyhow, Result};
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for tool threads.
///
/// # Arguments
///
/// * `requested_threads` - upper bound from the command line
///
/// # Returns
///
/// Result<(usize, f32)> usable cores, current cpu usage
pub async fn detect_cores_and_load(requested_threads: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    let max_cores = physical_cores.min(requested_threads).max(1);
    Ok((max_cores, cpu_load))
}


/// Splits the usable cores between concurrently running samples.
///
/// # Arguments
///
/// * `cores` - usable cores from detect_cores_and_load
/// * `max_parallel_samples` - samples allowed to run at once
///
/// # Returns
///
/// Threads handed to each tool invocation, at least 1.
pub fn threads_per_sample(cores: usize, max_parallel_samples: usize) -> usize {
    (cores / max_parallel_samples.max(1)).max(1)
}


/// Finds the amount of total and available RAM.
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let mut system = System::new_all();
    system.refresh_memory();
    let (total_ram, available_ram) = (system.total_memory(), system.available_memory());

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_per_sample() {
        assert_eq!(threads_per_sample(16, 4), 4);
        assert_eq!(threads_per_sample(3, 4), 1);
        assert_eq!(threads_per_sample(8, 0), 8);
    }

    #[tokio::test]
    async fn test_detect_cores_respects_request() -> Result<()> {
        let (cores, _load) = detect_cores_and_load(1).await?;
        assert_eq!(cores, 1);
        Ok(())
    }
}
