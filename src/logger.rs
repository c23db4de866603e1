//! Structured logging for apiwitness.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON), making it easy to ingest into log
//! shippers.
//!
//! All public functions are intentionally cheap - they take a shared reference
//! to the logger and do a single allocation per event for the formatted string.

use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds that apiwitness can emit.
///
/// Each variant carries exactly the fields needed to describe that event.
/// The `#[serde(tag = "event")]` attribute ensures JSON output includes an
/// `"event"` key so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// A condition worth flagging that does not stop the capture.
    Warning { message: &'a str },

    /// Verbose diagnostics, suppressed unless the debug option is set.
    Debug { message: &'a str },

    /// A TLS handshake was observed on a flow; its payload will not be parsed.
    TlsConnection {
        client: &'a str,
        server: &'a str,
        sni: Option<&'a str>,
    },

    /// A pipeline reported a fatal error; the other pipelines keep running.
    PipelineError { interface: &'a str, error: &'a str },

    /// Kernel-level packet drops reported by the capture handle at stop.
    CaptureDrops { interface: &'a str, dropped: u64 },

    /// Final counters emitted on shutdown.
    SessionSummary {
        tcp_packets: u64,
        http_requests: u64,
        http_responses: u64,
        unparsed: u64,
        exchanges: u64,
    },
}

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and passed as an `Arc<Logger>` to every module
/// that needs to emit events. The internal `Mutex` serialises writes so that
/// output lines are never interleaved across threads.
pub struct Logger {
    /// Whether to format events as NDJSON instead of plain text.
    json: bool,
    /// Whether `Event::Debug` lines are emitted at all.
    debug: bool,
    /// Optional buffered file writer. `None` when `--log-file` was not given.
    file: Option<Mutex<BufWriter<std::fs::File>>>,
}

/// Type alias used throughout the codebase for convenience.
pub type SharedLogger = Arc<Logger>;

impl Logger {
    /// Creates a new logger.
    ///
    /// # Arguments
    /// * `json`     - Emit NDJSON instead of plain text when `true`.
    /// * `log_path` - If `Some`, open (or create) this file for appended writes.
    /// * `debug`    - Emit `Event::Debug` lines when `true`.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, log_path: Option<&str>, debug: bool) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self { json, debug, file })
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log file.
    ///
    /// Plain-text output is prefixed with a timestamp and the event tag.
    /// NDJSON output is a single JSON object per line with a `"timestamp"` field
    /// injected alongside the event fields.
    pub fn log(&self, event: &Event) {
        if let Event::Debug { .. } = event {
            if !self.debug {
                return;
            }
        }

        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

        let line = if self.json {
            // Serialise the event to a JSON Value so we can inject the timestamp.
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(timestamp.clone()),
                );
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            // Plain-text: "[TIMESTAMP] [TAG] human-readable description"
            format!("[{}] {}", timestamp, self.plain_text(event))
        };

        println!("{}", line);

        // If a log file was configured, also write there.
        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    /// Convenience wrapper for `Event::Info`.
    pub fn info(&self, message: &str) {
        self.log(&Event::Info { message });
    }

    /// Convenience wrapper for `Event::Warning`.
    pub fn warn(&self, message: &str) {
        self.log(&Event::Warning { message });
    }

    /// Convenience wrapper for `Event::Debug`.
    pub fn debug(&self, message: &str) {
        self.log(&Event::Debug { message });
    }

    /// Formats an [`Event`] as a human-readable plain-text string (no timestamp).
    fn plain_text(&self, event: &Event) -> String {
        match event {
            Event::Info { message } => format!("[INFO] {}", message),

            Event::Warning { message } => format!("[WARN] {}", message),

            Event::Debug { message } => format!("[DEBUG] {}", message),

            Event::TlsConnection { client, server, sni } => match sni {
                Some(name) => format!("[TLS] {} -> {} sni={}", client, server, name),
                None => format!("[TLS] {} -> {}", client, server),
            },

            Event::PipelineError { interface, error } => {
                format!("[PIPELINE ERROR] {}: {}", interface, error)
            }

            Event::CaptureDrops { interface, dropped } => {
                format!("[DROPS] {} dropped {} packets in the kernel", interface, dropped)
            }

            Event::SessionSummary {
                tcp_packets,
                http_requests,
                http_responses,
                unparsed,
                exchanges,
            } => format!(
                "[SUMMARY] tcp={} requests={} responses={} unparsed={} exchanges={}",
                tcp_packets, http_requests, http_responses, unparsed, exchanges
            ),
        }
    }
}
