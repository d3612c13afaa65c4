//! Run summary line

use std::time::Duration;
use tracing::{error, info};
use zreplica_types::{RunOutcome, RunReport};

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// The single human-readable line describing how a run ended
pub fn summary_line(report: &RunReport) -> String {
    let route = format!("{} -> {}", report.source, report.target_path);
    let elapsed = format_duration(report.elapsed);

    match &report.outcome {
        Ok(RunOutcome::Replicated {
            snapshot,
            incremental,
            bytes,
        }) => format!(
            "SUCCESS {}: {} {} in {}, {} transferred",
            route,
            if *incremental { "incremental" } else { "full" },
            snapshot,
            elapsed,
            format_bytes(*bytes)
        ),
        Ok(RunOutcome::AlreadyInSync { ancestor }) => format!(
            "SUCCESS {}: no new data since {} in {}, {} transferred",
            route,
            ancestor,
            elapsed,
            format_bytes(0)
        ),
        Err(e) => format!("FAILURE {}: {} after {}", route, e, elapsed),
    }
}

/// Emit the summary line to the log sink
pub fn log_summary(report: &RunReport) -> String {
    let line = summary_line(report);
    if report.is_success() {
        info!(target: "zreplica::summary", run_id = %report.run_id, "{}", line);
    } else {
        error!(
            target: "zreplica::summary",
            run_id = %report.run_id,
            exit_code = report.exit_code(),
            "{}",
            line
        );
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use zreplica_types::{Endpoint, Error, RunId};

    fn report(outcome: Result<RunOutcome, Error>) -> RunReport {
        RunReport {
            run_id: RunId::new_v4(),
            source: "nas:tank/data".parse::<Endpoint>().unwrap(),
            target_path: "pool/data".to_string(),
            elapsed: Duration::from_secs(75),
            outcome,
        }
    }

    #[rstest]
    #[case(0, "0 B")]
    #[case(1023, "1023 B")]
    #[case(1536, "1.5 KiB")]
    #[case(5 * 1024 * 1024 * 1024, "5.0 GiB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(75)), "1m 15s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_success_line() {
        let line = summary_line(&report(Ok(RunOutcome::Replicated {
            snapshot: "zreplica-h-20240101000000".into(),
            incremental: true,
            bytes: 2048,
        })));
        assert_eq!(
            line,
            "SUCCESS nas:tank/data -> pool/data: incremental zreplica-h-20240101000000 in 1m 15s, 2.0 KiB transferred"
        );
    }

    #[test]
    fn test_in_sync_line() {
        let line = summary_line(&report(Ok(RunOutcome::AlreadyInSync {
            ancestor: "m".into(),
        })));
        assert!(line.starts_with("SUCCESS"));
        assert!(line.contains("no new data since m"));
    }

    #[test]
    fn test_failure_line() {
        let line = log_summary(&report(Err(Error::NoCommonAncestor {
            source_path: "nas:tank/data".into(),
            target_path: "pool/data".into(),
        })));
        assert!(line.starts_with("FAILURE nas:tank/data -> pool/data: No common ancestor"));
        assert!(line.ends_with("after 1m 15s"));
    }
}
