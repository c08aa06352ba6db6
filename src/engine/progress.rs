use crate::core::model::RefreshScope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Receives refresh progress as a fraction in `[0, 1]`
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, fraction: f64, message: &str);

    fn on_finished(&self, _report: &RefreshReport) {}
}

/// Reports progress through `tracing`
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_progress(&self, fraction: f64, message: &str) {
        tracing::debug!(percent = (fraction * 100.0).round() as u32, "{}", message);
    }

    fn on_finished(&self, report: &RefreshReport) {
        tracing::info!("{}", report.summary());
    }
}

/// A progress update delivered over a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress { fraction: f64, message: String },
    Finished(RefreshReport),
}

/// Forwards progress to an `mpsc` receiver; a dropped receiver is ignored
pub struct ChannelProgress {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, fraction: f64, message: &str) {
        let _ = self.tx.send(ProgressEvent::Progress {
            fraction,
            message: message.to_string(),
        });
    }

    fn on_finished(&self, report: &RefreshReport) {
        let _ = self.tx.send(ProgressEvent::Finished(report.clone()));
    }
}

/// Clamps and orders the fractions handed to a sink so they never move backwards
pub(crate) struct Progress<'a> {
    sink: &'a dyn ProgressSink,
    reported: f64,
}

impl<'a> Progress<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            reported: 0.0,
        }
    }

    pub fn report(&mut self, fraction: f64, message: &str) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.reported = self.reported.max(fraction);
        self.sink.on_progress(self.reported, message);
    }
}

/// Cooperative cancellation flag shared between a refresh and its caller
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A refresh phase that aborted on a store failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: &'static str,
    pub error: String,
}

/// Outcome of a refresh; partial when phases failed or it was cancelled
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub scope: RefreshScope,
    pub files_processed: usize,
    pub files_failed: usize,
    pub records_written: usize,
    pub phase_failures: Vec<PhaseFailure>,
    pub cancelled: bool,
    pub duration: Duration,
    /// Cache version after the refresh
    pub version: u64,
}

impl RefreshReport {
    pub(crate) fn new(scope: RefreshScope) -> Self {
        Self {
            scope,
            files_processed: 0,
            files_failed: 0,
            records_written: 0,
            phase_failures: Vec::new(),
            cancelled: false,
            duration: Duration::ZERO,
            version: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.phase_failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let status = if self.cancelled {
            "cancelled"
        } else if !self.phase_failures.is_empty() {
            "finished with errors"
        } else {
            "finished"
        };
        let mut summary = format!(
            "Refresh ({}) {} in {}: {} files, {} records",
            self.scope,
            status,
            format_duration(self.duration),
            self.files_processed,
            self.records_written
        );
        if self.files_failed > 0 {
            summary.push_str(&format!(", {} failed", self.files_failed));
        }
        for failure in &self.phase_failures {
            summary.push_str(&format!("; {} phase failed: {}", failure.phase, failure.error));
        }
        summary
    }
}

/// Outcome of one periodic scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub changed: usize,
    pub deleted: usize,
    pub added: usize,
    /// Tracked files whose digest could not be computed this cycle
    pub unreadable: usize,
    /// Files whose re-extraction failed
    pub failed: usize,
    pub reparsed: usize,
}

impl ScanReport {
    pub fn has_changes(&self) -> bool {
        self.changed + self.deleted + self.added > 0
    }
}

/// Human-readable duration such as `1m 5s 20ms`; zero units are left out
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(&str, u128); 5] = [
        ("d", 86_400_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ];

    let mut remaining = duration.as_millis();
    if remaining == 0 {
        return "0ms".to_string();
    }
    let mut parts = Vec::new();
    for (suffix, size) in UNITS {
        let count = remaining / size;
        if count > 0 {
            parts.push(format!("{}{}", count, suffix));
            remaining %= size;
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl ProgressSink for Recorder {
        fn on_progress(&self, fraction: f64, _message: &str) {
            self.0.lock().unwrap().push(fraction);
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(20)), "20ms");
        assert_eq!(format_duration(Duration::from_millis(65_020)), "1m 5s 20ms");
        assert_eq!(format_duration(Duration::from_secs(3_600)), "1h");
        assert_eq!(
            format_duration(Duration::from_secs(90_061)),
            "1d 1h 1m 1s"
        );
    }

    #[test]
    fn test_progress_is_clamped_and_monotone() {
        let recorder = Recorder::default();
        let mut progress = Progress::new(&recorder);
        progress.report(0.5, "half");
        progress.report(0.25, "behind");
        progress.report(7.0, "over");
        progress.report(f64::NAN, "nan");

        assert_eq!(*recorder.0.lock().unwrap(), vec![0.5, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_channel_progress() {
        let (sink, rx) = ChannelProgress::new();
        sink.on_progress(0.1, "markup");
        sink.on_finished(&RefreshReport::new(RefreshScope::All));
        drop(sink);

        let events: Vec<ProgressEvent> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ProgressEvent::Finished(_)));
    }

    #[test]
    fn test_report_summary() {
        let mut report = RefreshReport::new(RefreshScope::Markup);
        report.files_processed = 3;
        report.records_written = 12;
        report.duration = Duration::from_millis(1_500);
        assert_eq!(
            report.summary(),
            "Refresh (markup) finished in 1s 500ms: 3 files, 12 records"
        );
        assert!(report.is_complete());

        report.phase_failures.push(PhaseFailure {
            phase: "markup",
            error: "disk full".to_string(),
        });
        assert!(report.summary().contains("markup phase failed: disk full"));
        assert!(!report.is_complete());
    }
}
