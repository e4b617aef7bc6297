// pgdumps3/src/restore/db_restore.rs
use tokio::process::Command;

use crate::config::{BackupTarget, MAINTENANCE_DATABASE};
use crate::toolchain::ToolBinding;

/// `psql` invocation that replays a plain SQL dump read from stdin.
///
/// Dumps are taken with `--create`, so the script itself drops and recreates the target
/// database by name and then `\connect`s to it; connecting to the target first would make
/// the drop fail.
pub fn restore_command(binding: &ToolBinding, target: &BackupTarget) -> Command {
    let mut cmd = Command::new(&binding.restore_executable_path);
    cmd.arg("-X") // Do not read psqlrc
        .arg("-h")
        .arg(&target.host)
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-U")
        .arg(&target.user)
        .arg("-d")
        .arg(MAINTENANCE_DATABASE)
        .arg("--no-password")
        .arg("-v")
        .arg("ON_ERROR_STOP=1") // Exit nonzero on the first failing statement
        .env("PGPASSWORD", &target.password);
    cmd
}
