//! Structured logging and per-job log capture
//!
//! Process-wide output goes through `tracing`; [`init`] installs the
//! subscriber. A [`Logger`] is handed to every replication job: each line is
//! emitted as a `tracing` event inside the job's span *and* mirrored into an
//! in-memory buffer so the job record can expose its log to callers. The
//! span carries `tag`, `digest` and `state` fields that jobs fill in as they
//! progress.

use crate::error::{ReplicationError, Result};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::Span;
use tracing::field::{Empty, display};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins over the verbosity flag.
pub fn init(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| ReplicationError::Config(format!("failed to init logging: {}", e)))
}

/// Logger handed to a single job
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
    lines: Arc<Mutex<Vec<String>>>,
}

impl Logger {
    pub fn new(job_id: &str, repository: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "job",
                job_id = %job_id,
                repository = %repository,
                tag = Empty,
                digest = Empty,
                state = Empty,
            ),
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A logger not tied to any job; lines are still captured.
    pub fn detached() -> Self {
        Self {
            span: Span::none(),
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_tag(&self, tag: &str) {
        self.span.record("tag", display(tag));
    }

    pub fn set_digest(&self, digest: &str) {
        self.span.record("digest", display(digest));
    }

    pub fn set_state(&self, state: impl fmt::Display) {
        self.span.record("state", display(state));
    }

    pub fn info(&self, message: &str) {
        self.span.in_scope(|| tracing::info!("{}", message));
        self.capture("INFO", message);
    }

    pub fn warning(&self, message: &str) {
        self.span.in_scope(|| tracing::warn!("{}", message));
        self.capture("WARNING", message);
    }

    pub fn error(&self, message: &str) {
        self.span.in_scope(|| tracing::error!("{}", message));
        self.capture("ERROR", message);
    }

    /// Debug-level detail, not mirrored into the job log.
    pub fn detail(&self, message: &str) {
        self.span.in_scope(|| tracing::debug!("{}", message));
    }

    /// Snapshot of the captured lines
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn capture(&self, level: &str, message: &str) {
        let line = format!(
            "{} [{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level,
            message
        );
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_lines_with_levels() {
        let logger = Logger::new("job-1", "library/nginx");
        logger.info("pulling manifest");
        logger.detail("accept headers set");
        logger.warning("project already exists");

        let lines = logger.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] pulling manifest"));
        assert!(lines[1].ends_with("[WARNING] project already exists"));
    }

    #[derive(Clone, Default)]
    struct Output(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Output {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn progress_fields_are_recorded_on_the_span() {
        let output = Output::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let output = output.clone();
                move || output.clone()
            })
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let logger = Logger::new("job-1", "library/nginx");
            logger.set_state("pull manifest");
            logger.set_tag("1.25");
            logger.set_digest("sha256:abc");
            logger.info("manifest pulled");
        });

        let written = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("job_id=job-1"), "{}", written);
        assert!(written.contains("tag=1.25"), "{}", written);
        assert!(written.contains("digest=sha256:abc"), "{}", written);
        assert!(written.contains("state=pull manifest"), "{}", written);
        assert!(written.contains("manifest pulled"), "{}", written);
    }

    #[test]
    fn clones_share_the_buffer() {
        let logger = Logger::detached();
        let clone = logger.clone();
        clone.error("boom");
        assert_eq!(logger.lines().len(), 1);
    }
}
