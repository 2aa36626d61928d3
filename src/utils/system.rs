// src/utils/system.rs: System functions

use std::time::Duration;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for the thread budget
///
/// # Arguments
///
/// * `requested` - Budget given on the command line, if any.
///
/// # Returns
///
/// (budget, current cpu usage percent)
pub async fn detect_cores_and_load(requested: Option<usize>) -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1).max(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    (requested.unwrap_or(physical_cores), cpu_load)
}

/// Whether the machine already looks busy enough to warn about.
pub fn is_heavily_loaded(cpu_load: f32) -> bool {
    cpu_load > 50.0
}
