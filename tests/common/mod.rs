//! Shared helpers for the integration suites

#![allow(dead_code)]

use rand::Rng;
use sentrybox::{
    control::{Config, SandboxRegistry},
    spec::RuntimeSpec,
};
use std::path::PathBuf;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scratch directory, honoring the test runner's TEST_TMPDIR.
pub fn tmp_dir(tag: &str) -> PathBuf {
    let base = std::env::var_os("TEST_TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let path = base.join(format!(
        "sentrybox-test-{}-{}-{:08x}",
        tag,
        std::process::id(),
        rand::thread_rng().gen::<u32>()
    ));
    std::fs::create_dir_all(&path).unwrap();
    path
}

pub fn random_container_id() -> String {
    format!("test-container-{:016x}", rand::thread_rng().gen::<u64>())
}

pub fn test_config(root_dir: PathBuf) -> Config {
    Config::new(root_dir)
}

pub fn registry() -> SandboxRegistry {
    SandboxRegistry::new()
}

/// The container will just sleep for a long time; tests kill it before it
/// finishes.
pub fn sleep_spec() -> RuntimeSpec {
    RuntimeSpec::with_args(vec!["sleep", "1000"])
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Shard/partition filter for table-driven tests, honoring the runner's
/// TEST_SHARD_INDEX/TEST_TOTAL_SHARDS and PARTITION/TOTAL_PARTITIONS.
pub fn in_this_shard(case_index: usize) -> bool {
    let (shard, total) = match (
        env_usize("TEST_SHARD_INDEX"),
        env_usize("TEST_TOTAL_SHARDS"),
    ) {
        (Some(shard), Some(total)) if total > 1 => (shard, total),
        _ => match (env_usize("PARTITION"), env_usize("TOTAL_PARTITIONS")) {
            // PARTITION is 1-based
            (Some(partition), Some(total)) if total > 1 => (partition.saturating_sub(1), total),
            _ => return true,
        },
    };
    case_index % total == shard
}
