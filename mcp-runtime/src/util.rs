use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::RuntimeArgs;
use crate::cache::CacheConfig;

pub fn cache_config(args: &RuntimeArgs) -> CacheConfig {
    let mut config = CacheConfig::for_project(&args.project_dir);
    if let Some(path) = &args.snapshot_path {
        config.snapshot_path = resolve_in_project(&args.project_dir, path);
    }
    if let Some(path) = &args.manifest_path {
        config.manifest_path = resolve_in_project(&args.project_dir, path);
    }
    config.dbt_bin = args.dbt_bin.clone();
    config.mf_bin = args.mf_bin.clone();
    config.dimension_concurrency = args.dimension_concurrency.max(1);
    config.build_timeout = Duration::from_secs(args.build_timeout_secs);
    config
}

pub fn command_timeout(args: &RuntimeArgs) -> Duration {
    Duration::from_secs(args.command_timeout_secs)
}

/// Relative paths are taken from the project directory, not the process cwd.
pub fn resolve_in_project(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}
