//! CLI entry point: argument parsing, logger init, signal handling, and
//! exit-code mapping (§6, §7).

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use log::LevelFilter;

use vraft::utils::{CliOptions, ErrorKind, VRaftError};
use vraft::{node, Node};

// Single-threaded runtime: every worker in the design doc's concurrency
// model (§5) is a cooperating task, not a parallel OS thread, and the `ME`
// thread-local log prefix (utils::print) is only ever set on this one
// thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opts = CliOptions::parse();

    let level = match opts.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            eprintln!("fatal: unknown --log-level '{}'", other);
            return ExitCode::from(1);
        }
    };
    vraft::utils::logger_init(level);

    let shutdown = Arc::new(AtomicBool::new(false));
    let signaled = Arc::new(AtomicBool::new(false));
    install_signal_handler(shutdown.clone(), signaled.clone());

    match run(opts, shutdown).await {
        Ok(()) if signaled.load(Ordering::SeqCst) => ExitCode::from(130),
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            node::report_fatal(&e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(opts: CliOptions, shutdown: Arc<AtomicBool>) -> Result<(), VRaftError> {
    let results_dir = PathBuf::from(&opts.results_dir);
    let is_leader = opts.is_leader();

    let node = Node::build(opts, shutdown).await?;
    let artifact = node.run().await?;

    if is_leader {
        if let Some(artifact) = artifact {
            write_artifact(&results_dir, &artifact)?;
        }
    }
    Ok(())
}

fn write_artifact(
    dir: &PathBuf,
    artifact: &vraft::experiment::ResultArtifact,
) -> Result<(), VRaftError> {
    fs::create_dir_all(dir)?;
    let filename = format!("reliability_experiment_results_{}.json", utc_timestamp());
    let path = dir.join(filename);
    let json = serde_json::to_string_pretty(artifact)
        .map_err(|e| VRaftError::of(ErrorKind::Other, format!("serializing artifact: {}", e)))?;
    fs::write(&path, json)?;
    log::info!("wrote result artifact to {}", path.display());
    Ok(())
}

/// Renders `now` as `YYYYMMDD_HHMMSS` in UTC without pulling in a date/time
/// crate -- none of the teacher's dependencies or the rest of the pack
/// carry one, so this is a small self-contained civil-calendar conversion
/// (Howard Hinnant's days-from-civil algorithm, run in reverse).
fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let days = secs.div_euclid(86400);
    let time_of_day = secs.rem_euclid(86400);

    let (year, month, day) = civil_from_days(days);
    let hour = time_of_day / 3600;
    let minute = (time_of_day % 3600) / 60;
    let second = time_of_day % 60;

    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        year, month, day, hour, minute, second
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}

fn exit_code_for(err: &VRaftError) -> u8 {
    match err.kind() {
        ErrorKind::Config => 1,
        _ => 2,
    }
}

/// Installs a SIGINT/SIGTERM handler that sets the shutdown flag; a second
/// signal forces immediate exit with code 130 (§6), since the core has no
/// forced-termination path of its own (§5). `signaled` lets `main` report
/// exit code 130 even when the first signal is handled gracefully to
/// completion rather than forcing the process down.
fn install_signal_handler(shutdown: Arc<AtomicBool>, signaled: Arc<AtomicBool>) {
    let already_signaled = Arc::new(AtomicBool::new(false));
    let res = ctrlc::set_handler(move || {
        signaled.store(true, Ordering::SeqCst);
        if already_signaled.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        shutdown.store(true, Ordering::SeqCst);
    });
    if let Err(e) = res {
        eprintln!("warning: failed to install signal handler: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_from_days_epoch() {
        // day 0 (1970-01-01, Unix epoch) per Hinnant's algorithm.
        assert_eq!(civil_from_days(0), (1970, 1, 1));
    }

    #[test]
    fn civil_from_days_known_date() {
        // 2024-03-01 is 19783 days after the epoch.
        assert_eq!(civil_from_days(19783), (2024, 3, 1));
    }
}
