//! Capture configuration.
//!
//! The CLI layer (or an embedding program) builds a [`CaptureConfig`] and
//! hands it to the supervisor. Everything here is plain data: the supervisor
//! treats the value as immutable once capture starts, including the
//! [`Options`] flags, which are read at pipeline-construction time only.

use std::collections::HashMap;
use std::path::PathBuf;

use regex::Regex;

use crate::collect::backend::TraceUri;
use crate::error::Error;
use crate::logger::Logger;

/// Process-wide boolean options captured at start-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Enables negation capture and verbose diagnostics.
    pub debug: bool,
    /// Disables self-traffic suppression so the tool can observe its own
    /// uploads.
    pub dogfood: bool,
}

/// Everything the supervisor needs to run a capture session.
#[derive(Debug, Clone, Default)]
pub struct CaptureConfig {
    /// Interfaces to capture on; empty means every eligible interface.
    pub interfaces: Vec<String>,
    /// User BPF filter expression (tcpdump syntax); empty means unfiltered.
    pub filter: String,

    /// Exchanges whose request path matches any of these are dropped.
    pub path_exclusions: Vec<String>,
    /// Exchanges whose host matches any of these are dropped.
    pub host_exclusions: Vec<String>,
    /// When non-empty, the request path must match at least one.
    pub path_allowlist: Vec<String>,
    /// When non-empty, the host must match at least one.
    pub host_allowlist: Vec<String>,

    /// Admission probability per exchange, in (0, 1]. 1.0 admits everything.
    pub sample_rate: f64,
    /// Process-wide ceiling on exchanges per minute across all pipelines.
    pub witnesses_per_minute: Option<f64>,

    /// Local archive directory; one HAR file per interface is written here.
    pub out_dir: Option<PathBuf>,
    /// Remote trace destination, served by an injected ingest client.
    pub trace: Option<TraceUri>,

    /// Client identity forwarded to the ingest endpoint.
    pub client_id: String,
    /// Ingest endpoint domain; used for self-traffic exclusion.
    pub domain: String,

    /// When set, capture lifetime is bounded by this shell command.
    pub exec_command: Option<String>,
    /// User to run the command as, via sudo.
    pub exec_user: Option<String>,

    /// Replay a saved pcap file instead of capturing live.
    pub read_file: Option<PathBuf>,

    /// Key/value annotations attached to the trace.
    pub tags: HashMap<String, String>,

    pub options: Options,
}

impl CaptureConfig {
    /// Drops regex entries that would have surprising global effects.
    ///
    /// An empty exclusion regex matches every path or host and would drop
    /// everything; an empty allow regex alongside non-empty ones would allow
    /// everything. Both are removed with a warning.
    pub fn lint(&mut self, logger: &Logger) {
        for (flag, list) in [
            ("--path-exclusions", &mut self.path_exclusions),
            ("--host-exclusions", &mut self.host_exclusions),
        ] {
            let before = list.len();
            list.retain(|r| !r.is_empty());
            if list.len() != before {
                logger.warn(&format!(
                    "ignoring empty regex in {}, which would otherwise exclude everything",
                    flag
                ));
            }
        }

        for (flag, list) in [
            ("--path-allow", &mut self.path_allowlist),
            ("--host-allow", &mut self.host_allowlist),
        ] {
            let before = list.len();
            list.retain(|r| !r.is_empty());
            if list.len() != before && !list.is_empty() {
                logger.warn(&format!(
                    "ignoring empty regex in {}, which would otherwise include everything",
                    flag
                ));
            }
        }
    }

    /// Rejects configurations that cannot be run.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(Error::Config(format!(
                "sample rate must be in (0, 1], got {}",
                self.sample_rate
            )));
        }
        if let Some(rate) = self.witnesses_per_minute {
            if rate <= 0.0 {
                return Err(Error::Config(format!(
                    "rate limit must be positive, got {}",
                    rate
                )));
            }
            if self.sample_rate != 1.0 {
                return Err(Error::Config(
                    "at most one of --sample-rate and --rate-limit may be set".to_string(),
                ));
            }
        }
        if self.out_dir.is_none() && self.trace.is_none() {
            return Err(Error::Config(
                "no output configured: set a local directory, a remote trace, or both".to_string(),
            ));
        }
        Ok(())
    }

    /// True when any path or host filter survives linting.
    pub fn has_user_filters(&self) -> bool {
        !self.path_exclusions.is_empty()
            || !self.host_exclusions.is_empty()
            || !self.path_allowlist.is_empty()
            || !self.host_allowlist.is_empty()
    }
}

/// The path and host regex lists, compiled once before capture starts.
#[derive(Debug, Default)]
pub struct CompiledFilters {
    pub path_exclusions: Vec<Regex>,
    pub host_exclusions: Vec<Regex>,
    pub path_allowlist: Vec<Regex>,
    pub host_allowlist: Vec<Regex>,
}

impl CompiledFilters {
    pub fn compile(config: &CaptureConfig) -> Result<Self, Error> {
        Ok(Self {
            path_exclusions: compile_regexes(&config.path_exclusions, "path exclusion")?,
            host_exclusions: compile_regexes(&config.host_exclusions, "host exclusion")?,
            path_allowlist: compile_regexes(&config.path_allowlist, "path filter")?,
            host_allowlist: compile_regexes(&config.host_allowlist, "host filter")?,
        })
    }
}

fn compile_regexes(patterns: &[String], what: &str) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| Error::Config(format!("failed to compile {} {:?}: {}", what, p, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_logger() -> Logger {
        Logger::new(false, None, false).unwrap()
    }

    fn base_config() -> CaptureConfig {
        CaptureConfig {
            sample_rate: 1.0,
            out_dir: Some(PathBuf::from("/tmp")),
            ..Default::default()
        }
    }

    #[test]
    fn lint_drops_empty_exclusions() {
        let mut cfg = base_config();
        cfg.path_exclusions = vec!["".into(), "^/health$".into()];
        cfg.host_exclusions = vec!["".into()];
        cfg.lint(&quiet_logger());
        assert_eq!(cfg.path_exclusions, vec!["^/health$".to_string()]);
        assert!(cfg.host_exclusions.is_empty());
    }

    #[test]
    fn lint_drops_empty_allow_entries() {
        let mut cfg = base_config();
        cfg.path_allowlist = vec!["".into(), "^/api".into()];
        cfg.lint(&quiet_logger());
        assert_eq!(cfg.path_allowlist, vec!["^/api".to_string()]);
    }

    #[test]
    fn validate_rejects_both_rate_options() {
        let mut cfg = base_config();
        cfg.sample_rate = 0.5;
        cfg.witnesses_per_minute = Some(60.0);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_sample_rate() {
        let mut cfg = base_config();
        cfg.sample_rate = 0.0;
        assert!(cfg.validate().is_err());
        cfg.sample_rate = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_an_output() {
        let mut cfg = base_config();
        cfg.out_dir = None;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn compile_reports_bad_regex() {
        let mut cfg = base_config();
        cfg.path_exclusions = vec!["[".into()];
        assert!(CompiledFilters::compile(&cfg).is_err());
    }
}
