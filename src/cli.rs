use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{CaptureConfig, Options};
use crate::error::Error;

/// apiwitness - passive HTTP API traffic capture.
///
/// Observes traffic on one or more interfaces, reconstructs HTTP/1.x
/// request/response exchanges, and archives them locally as HAR files.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "apiwitness",
    version,
    about = "Passive HTTP API traffic capture",
    long_about = None,
)]
pub struct Cli {
    // ── Capture ──────────────────────────────────────────────────────────────

    /// Network interface to capture on. Repeatable.
    ///
    /// If omitted, apiwitness captures on every interface that is up,
    /// not loopback, and supports link-layer capture.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interfaces: Vec<String>,

    /// BPF filter expression (tcpdump syntax) selecting the traffic to treat
    /// as API traffic. Empty means everything.
    #[arg(short = 'f', long = "filter", value_name = "BPF", default_value = "")]
    pub filter: String,

    /// Replay packets from a saved pcap file instead of capturing live.
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    pub read_file: Option<PathBuf>,

    // ── Exchange filtering ───────────────────────────────────────────────────

    /// Drop exchanges whose request path matches this regex. Repeatable.
    #[arg(long = "path-exclusions", value_name = "REGEX")]
    pub path_exclusions: Vec<String>,

    /// Drop exchanges whose host matches this regex. Repeatable.
    #[arg(long = "host-exclusions", value_name = "REGEX")]
    pub host_exclusions: Vec<String>,

    /// Keep only exchanges whose request path matches at least one of these
    /// regexes. Repeatable.
    #[arg(long = "path-allow", value_name = "REGEX")]
    pub path_allowlist: Vec<String>,

    /// Keep only exchanges whose host matches at least one of these regexes.
    /// Repeatable.
    #[arg(long = "host-allow", value_name = "REGEX")]
    pub host_allowlist: Vec<String>,

    // ── Rate control ─────────────────────────────────────────────────────────

    /// Admit each exchange independently with this probability, in (0, 1].
    #[arg(long = "sample-rate", value_name = "RATE", default_value_t = 1.0)]
    pub sample_rate: f64,

    /// Cap admitted exchanges per minute across all interfaces.
    ///
    /// At most one of --sample-rate and --rate-limit may be set.
    #[arg(long = "rate-limit", value_name = "PER_MINUTE")]
    pub witnesses_per_minute: Option<f64>,

    // ── Output ───────────────────────────────────────────────────────────────

    /// Directory for the local archive; one HAR file per interface.
    ///
    /// Created if missing; must be writable if present.
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Ingest endpoint domain, used to keep the capture from witnessing its
    /// own uploads.
    #[arg(long = "domain", value_name = "DOMAIN", default_value = "")]
    pub domain: String,

    /// Client identifier forwarded to the ingest endpoint.
    #[arg(long = "client-id", value_name = "ID", default_value = "")]
    pub client_id: String,

    /// Attach a key=value tag to the trace. Repeatable.
    #[arg(short = 't', long = "tag", value_name = "KEY=VALUE")]
    pub tags: Vec<String>,

    // ── Lifetime ─────────────────────────────────────────────────────────────

    /// Run this shell command and stop capturing when it exits; its exit
    /// code is preserved.
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub exec_command: Option<String>,

    /// User to run the command as.
    #[arg(short = 'u', long = "user", value_name = "USER")]
    pub exec_user: Option<String>,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit log entries as newline-delimited JSON (NDJSON).
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Verbose diagnostics plus capture of traffic not matching the filter.
    #[arg(long = "debug")]
    pub debug: bool,

    /// Do not suppress this process's own traffic to the ingest endpoint.
    #[arg(long = "dogfood", hide = true)]
    pub dogfood: bool,
}

impl Cli {
    /// Builds the capture configuration from the parsed flags.
    pub fn into_config(self) -> Result<CaptureConfig, Error> {
        let mut tags = HashMap::new();
        for entry in &self.tags {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(Error::Config(format!(
                    "tag {:?} is not of the form KEY=VALUE",
                    entry
                )));
            };
            tags.insert(key.to_string(), value.to_string());
        }

        Ok(CaptureConfig {
            interfaces: self.interfaces,
            filter: self.filter,
            path_exclusions: self.path_exclusions,
            host_exclusions: self.host_exclusions,
            path_allowlist: self.path_allowlist,
            host_allowlist: self.host_allowlist,
            sample_rate: self.sample_rate,
            witnesses_per_minute: self.witnesses_per_minute,
            out_dir: self.out_dir,
            trace: None,
            client_id: self.client_id,
            domain: self.domain,
            exec_command: self.exec_command,
            exec_user: self.exec_user,
            read_file: self.read_file,
            tags,
            options: Options {
                debug: self.debug,
                dogfood: self.dogfood,
            },
        })
    }
}
