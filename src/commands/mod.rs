pub mod audit;
pub mod ingest;
pub mod query;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::config::{AuditConfig, load_config, resolve_config_path};

/// Loads the audit config when one can be found; commands that work without
/// one fall back to defaults. An explicit `--config` that cannot be read is an error.
fn load_config_or_default(explicit: Option<&Path>) -> Result<AuditConfig> {
    match resolve_config_path(explicit) {
        Ok(path) => load_config(&path),
        Err(err) => {
            debug!(reason = %err, "no config file, using defaults");
            Ok(AuditConfig::default())
        }
    }
}

fn effective_db_path(config: &AuditConfig, override_path: Option<&Path>) -> PathBuf {
    override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.store.db_path.clone())
}
