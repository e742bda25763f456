use serde::Serialize;

/// Result of a one-shot stability probe.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub path: String,
    pub attempts: u32,
    /// Time spent waiting between attempts in seconds.
    pub waited_secs: f64,
}

/// Result of a one-shot upload.
#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub path: String,
    pub title: String,
    pub visibility: String,
    /// Bytes the server had acknowledged when the upload ended.
    pub bytes_sent: u64,
    /// Remote identifier, present only when the upload completed.
    pub video_id: Option<String>,
    /// Failure detail, present only when the upload failed.
    pub error: Option<String>,
    /// Wall-clock time for the upload in seconds.
    pub elapsed_secs: f64,
}

/// Print the outcome of a probe.
///
/// - `json = true`: emit a pretty-printed JSON object to stdout.
/// - `json = false`: emit a one-line human-readable summary to stdout.
pub fn print_probe(report: &ProbeReport, json: bool) {
    if json {
        print_json(report);
        return;
    }

    println!(
        "{} is ready after {} attempt(s) ({:.1}s waited)",
        report.path, report.attempts, report.waited_secs
    );
}

/// Print the outcome of an upload.
///
/// Failures are written to **stderr** in human mode so that stdout only ever
/// carries successful results.
pub fn print_upload(report: &UploadReport, json: bool) {
    if json {
        print_json(report);
        return;
    }

    match (&report.video_id, &report.error) {
        (Some(video_id), _) => {
            println!("Uploaded {} in {:.2}s", report.path, report.elapsed_secs);
            println!("  video id: {video_id}");
            println!("  title: {} ({})", report.title, report.visibility);
        }
        (None, Some(error)) => {
            eprintln!(
                "Upload of {} failed after {} bytes: {}",
                report.path, report.bytes_sent, error
            );
        }
        (None, None) => {
            eprintln!("Upload of {} ended without a result", report.path);
        }
    }
}

/// Write a progress line to stderr, keeping stdout clean for the final report.
pub fn print_progress(bytes_sent: u64, total_bytes: u64) {
    eprintln!(
        "  {} / {} ({}%)",
        human_bytes(bytes_sent),
        human_bytes(total_bytes),
        percent(bytes_sent, total_bytes)
    );
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("error serialising report: {}", e),
    }
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        done.saturating_mul(100) / total
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
