// pgdumps3/src/toolchain/server_version.rs
use sqlx::{Connection, PgConnection};
use tracing::{debug, warn};

use crate::config::{BackupTarget, MAINTENANCE_DATABASE};
use crate::errors::{PipelineError, Result};

/// Asks the live server for `server_version_num`, e.g. `160004` for 16.4.
pub async fn query_server_version(target: &BackupTarget) -> Result<u32> {
    let url = probe_url(target)?;
    let mut conn = PgConnection::connect(&url)
        .await
        .map_err(PipelineError::VersionQuery)?;

    let raw: String = sqlx::query_scalar("SELECT current_setting('server_version_num')")
        .fetch_one(&mut conn)
        .await
        .map_err(PipelineError::VersionQuery)?;

    if let Err(e) = conn.close().await {
        warn!(error = %e, "failed to close version probe connection");
    }

    debug!(version_num = %raw, "postgres server version");
    parse_version_num(&raw)
}

/// The version is server-wide, and the target database is missing before a first restore.
fn probe_url(target: &BackupTarget) -> Result<String> {
    target.connection_url(MAINTENANCE_DATABASE)
}

pub fn parse_version_num(raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| PipelineError::VersionParse {
            raw: raw.to_string(),
        })
}
