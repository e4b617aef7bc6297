use serde::Serialize;
use std::time::Duration;

use crate::errors::Result;

/// What a successful dump or restore moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub key: String,
    /// Storage location reported by the upload; restores have none.
    pub location: Option<String>,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

/// Operator-facing summary of one pipeline run, printed as JSON by one-shot commands.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub operation: &'static str,
    pub success: bool,
    pub key: String,
    pub location: Option<String>,
    pub bytes_transferred: Option<u64>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl PipelineReport {
    pub fn new(operation: &'static str, key: &str, result: &Result<PipelineOutcome>, elapsed: Duration) -> Self {
        match result {
            Ok(outcome) => PipelineReport {
                operation,
                success: true,
                key: outcome.key.clone(),
                location: outcome.location.clone(),
                bytes_transferred: Some(outcome.bytes_transferred),
                duration_secs: outcome.elapsed.as_secs_f64(),
                error: None,
            },
            Err(e) => PipelineReport {
                operation,
                success: false,
                key: key.to_string(),
                location: None,
                bytes_transferred: None,
                duration_secs: elapsed.as_secs_f64(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;

    #[test]
    fn failed_run_reports_no_bytes() {
        let result: Result<PipelineOutcome> = Err(PipelineError::Cancelled);
        let report = PipelineReport::new("dump", "backups/k", &result, Duration::from_millis(1500));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["key"], "backups/k");
        assert_eq!(json["bytes_transferred"], serde_json::Value::Null);
        assert_eq!(json["error"], "operation cancelled");
        assert_eq!(json["duration_secs"], 1.5);
    }

    #[test]
    fn successful_run_reports_outcome() {
        let result: Result<PipelineOutcome> = Ok(PipelineOutcome {
            key: "backups/k".to_string(),
            location: Some("http://minio:9000/test-bucket/backups/k".to_string()),
            bytes_transferred: 42,
            elapsed: Duration::from_secs(2),
        });
        let report = PipelineReport::new("dump", "backups/k", &result, Duration::from_secs(3));

        assert!(report.success);
        assert_eq!(report.bytes_transferred, Some(42));
        assert_eq!(report.duration_secs, 2.0);
        assert!(report.error.is_none());
    }
}
