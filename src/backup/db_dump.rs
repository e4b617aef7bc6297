// pgdumps3/src/backup/db_dump.rs
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::config::{BackupTarget, DumpNaming};
use crate::toolchain::ToolBinding;

/// gzip level passed to `pg_dump -Z`; the tool compresses, we only move bytes.
const COMPRESSION_LEVEL: &str = "6";

/// `pg_dump` invocation producing a gzip'd plain SQL script that drops and recreates the database.
pub fn dump_command(binding: &ToolBinding, target: &BackupTarget) -> Command {
    let mut cmd = Command::new(&binding.dump_executable_path);
    cmd.arg("-h")
        .arg(&target.host)
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-U")
        .arg(&target.user)
        .arg("-d")
        .arg(&target.database)
        .arg("--no-password")
        .arg("--verbose")
        .arg("--clean")
        .arg("--if-exists")
        .arg("--create")
        .arg("-Z")
        .arg(COMPRESSION_LEVEL)
        .env("PGPASSWORD", &target.password);
    cmd
}

/// Object key for a dump taken at `now`: `{prefix}/pg{N}_{db}_{timestamp}{infix}{suffix}`.
///
/// Two dumps of the same database started within the same second get the same key; the
/// later upload overwrites the earlier one.
pub fn generate_dump_name(
    naming: &DumpNaming,
    db_name: &str,
    major_version: u32,
    now: DateTime<Utc>,
) -> String {
    let date = now
        .with_timezone(&naming.time_zone)
        .format("%Y-%m-%dT%H-%M-%S");
    let filename = format!(
        "pg{}_{}_{}{}{}",
        major_version, db_name, date, naming.infix, naming.suffix
    );

    let prefix = naming.prefix.trim_end_matches('/');
    if prefix.is_empty() {
        filename
    } else {
        format!("{}/{}", prefix, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    fn naming(prefix: &str, infix: &str, tz: chrono_tz::Tz) -> DumpNaming {
        DumpNaming {
            prefix: prefix.to_string(),
            infix: infix.to_string(),
            suffix: ".sql.gz".to_string(),
            time_zone: tz,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_key_format() {
        let key = generate_dump_name(&naming("backups", "", chrono_tz::UTC), "mydb", 16, noon());
        assert_eq!(key, "backups/pg16_mydb_2024-05-01T12-00-00.sql.gz");
    }

    #[test]
    fn test_key_uses_configured_time_zone_and_infix() {
        let key = generate_dump_name(
            &naming("backups", "_dev", chrono_tz::Europe::Berlin),
            "mydb",
            17,
            noon(),
        );
        assert_eq!(key, "backups/pg17_mydb_2024-05-01T14-00-00_dev.sql.gz");
    }

    #[test]
    fn test_key_prefix_slashes_not_doubled() {
        let utc = chrono_tz::UTC;
        assert_eq!(
            generate_dump_name(&naming("nightly/", "", utc), "db", 15, noon()),
            "nightly/pg15_db_2024-05-01T12-00-00.sql.gz"
        );
        assert_eq!(
            generate_dump_name(&naming("", "", utc), "db", 15, noon()),
            "pg15_db_2024-05-01T12-00-00.sql.gz"
        );
        assert_eq!(
            generate_dump_name(&naming("/nightly/", "", utc), "db", 15, noon()),
            "/nightly/pg15_db_2024-05-01T12-00-00.sql.gz"
        );
    }

    #[test]
    fn test_same_second_collides() {
        let n = naming("backups", "", chrono_tz::UTC);
        let later = noon() + chrono::Duration::milliseconds(900);
        assert_eq!(
            generate_dump_name(&n, "mydb", 16, noon()),
            generate_dump_name(&n, "mydb", 16, later)
        );
        assert_ne!(
            generate_dump_name(&n, "mydb", 16, noon()),
            generate_dump_name(&n, "mydb", 16, noon() + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn test_dump_command_arguments() {
        let binding = ToolBinding {
            major_version: 16,
            dump_executable_path: PathBuf::from("/usr/libexec/postgresql16/pg_dump"),
            restore_executable_path: PathBuf::from("/usr/libexec/postgresql16/psql"),
        };
        let target = BackupTarget {
            host: "db".to_string(),
            port: 5433,
            user: "admin".to_string(),
            password: "secret".to_string(),
            database: "mydb".to_string(),
        };

        let cmd = dump_command(&binding, &target);
        let std_cmd = cmd.as_std();
        let args: Vec<&OsStr> = std_cmd.get_args().collect();

        assert_eq!(std_cmd.get_program(), "/usr/libexec/postgresql16/pg_dump");
        assert_eq!(
            args,
            [
                "-h", "db", "-p", "5433", "-U", "admin", "-d", "mydb", "--no-password",
                "--verbose", "--clean", "--if-exists", "--create", "-Z", "6"
            ]
        );
        assert!(
            std_cmd
                .get_envs()
                .any(|(k, v)| k == "PGPASSWORD" && v == Some(OsStr::new("secret")))
        );
        assert!(!args.contains(&OsStr::new("secret")));
    }
}
