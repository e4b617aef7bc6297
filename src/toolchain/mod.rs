//! Picks the `pg_dump`/`psql` pair that can talk to the target server.
//!
//! `pg_dump` refuses to dump from a server newer than itself, so the search starts at
//! the server's own major version and walks upward to the newest client we ship.

pub(crate) mod server_version;

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use which::which_in;

use crate::config::BackupTarget;
use crate::errors::{PipelineError, Result};

pub const LOWEST_VERSION: u32 = 15;
pub const HIGHEST_VERSION: u32 = 17;

// https://www.postgresql.org/docs/current/functions-info.html#FUNCTIONS-INFO-VERSION
const VERSION_MULTIPLIER: u32 = 10_000;

const DUMP_TOOL: &str = "pg_dump";
const RESTORE_TOOL: &str = "psql";

/// Client executables bound once at startup and reused by every dump and restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    pub major_version: u32,
    pub dump_executable_path: PathBuf,
    pub restore_executable_path: PathBuf,
}

/// Probes the server and binds the matching client tools.
pub async fn resolve(target: &BackupTarget, bin_dirs: &[String]) -> Result<ToolBinding> {
    info!(host = %target.host, port = target.port, "Detecting PostgreSQL version");
    let version_num = server_version::query_server_version(target).await?;
    select_binding(version_num, bin_dirs)
}

/// Major version encoded in `server_version_num`, rejecting servers older than we support.
pub fn major_version(version_num: u32) -> Result<u32> {
    let minimum = LOWEST_VERSION * VERSION_MULTIPLIER;
    if version_num < minimum {
        return Err(PipelineError::UnsupportedVersion {
            detected: version_num,
            minimum,
        });
    }
    Ok(version_num / VERSION_MULTIPLIER)
}

/// Chooses the lowest installed client at or above the server's major version.
pub fn select_binding(version_num: u32, bin_dirs: &[String]) -> Result<ToolBinding> {
    let major = major_version(version_num)?;
    info!(version = major, "Detected PostgreSQL major version");

    for version in major..=HIGHEST_VERSION {
        for template in bin_dirs {
            let dir = expand_dir(template, version);
            let Some(dump) = find_tool(&dir, DUMP_TOOL) else {
                debug!(dir = %dir.display(), "no pg_dump in candidate directory");
                continue;
            };
            let Some(restore) = find_tool(&dir, RESTORE_TOOL) else {
                debug!(dir = %dir.display(), "pg_dump found without psql, skipping");
                continue;
            };
            info!(path = %dump.display(), "Found suitable pg_dump");
            return Ok(ToolBinding {
                major_version: version,
                dump_executable_path: dump,
                restore_executable_path: restore,
            });
        }
    }

    Err(PipelineError::ToolNotFound { major })
}

fn expand_dir(template: &str, version: u32) -> PathBuf {
    PathBuf::from(template.replace("{version}", &version.to_string()))
}

/// Looks for an executable `name` directly inside `dir`, never on `PATH`.
fn find_tool(dir: &Path, name: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    which_in(name, Some(dir.as_os_str()), Path::new("/")).ok()
}
