//! The run supervisor.
//!
//! Expands the configuration into one pipeline per (interface,
//! filter-state), resolves the remote trace and validates the local output
//! directory before any capture opens, starts the pipelines, waits for the
//! stop condition (signal, subcommand exit, or first pipeline error),
//! drains everything, and emits the final diagnostics.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::bounded;

use crate::capture::bpf::{build_filters, resolve_ingest_addrs, BpfFilters};
use crate::capture::interfaces::{eligible_interfaces, InterfaceInfo};
use crate::capture::{context_fault_counts, PacketSource};
use crate::collect::backend::{resolve_trace, BackendCollector, IngestClient, TraceId};
use crate::collect::counts::{PacketCountSummary, PacketCounts};
use crate::collect::filters::SelfTrafficMatcher;
use crate::collect::har::HarCollector;
use crate::collect::sample::RateLimit;
use crate::collect::{build_chain, ChainConfig, Collector, DiscardCollector, TeeCollector};
use crate::config::{CaptureConfig, CompiledFilters};
use crate::error::Error;
use crate::logger::{Event, SharedLogger};
use crate::sniff::config::{TOTAL_CAPTURE_BUFFER, TOTAL_REASSEMBLY_BUDGET};
use crate::sniff::Pipeline;
use crate::subprocess::run_command;

/// Empirically, capture takes about a second to start delivering packets;
/// budget five before generating traffic.
const CAPTURE_START_WAIT: Duration = Duration::from_secs(5);

/// Grace interval after the stop condition so in-flight packets still
/// arrive before pipelines drain.
const CAPTURE_STOP_WAIT: Duration = Duration::from_secs(5);

/// Which side of the user filter a pipeline captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Matched,
    Negation,
}

/// All shared counter tables for one run.
struct Summaries {
    matched: Arc<PacketCountSummary>,
    negation: Arc<PacketCountSummary>,
    prefilter: Arc<PacketCountSummary>,
    admitted: Arc<PacketCountSummary>,
}

impl Summaries {
    fn new() -> Self {
        Self {
            matched: PacketCountSummary::new(),
            negation: PacketCountSummary::new(),
            prefilter: PacketCountSummary::new(),
            admitted: PacketCountSummary::new(),
        }
    }
}

/// Captures packets from the network and streams the reconstructed
/// exchanges into the configured sinks. Blocks until the capture ends.
pub fn run(
    mut config: CaptureConfig,
    client: Option<Arc<dyn IngestClient>>,
    logger: SharedLogger,
) -> Result<(), Error> {
    config.lint(&logger);
    config.validate()?;
    let compiled = CompiledFilters::compile(&config)?;

    let tags = collect_trace_tags(&config);

    // Resolve the destination trace before any capture starts; a conflict
    // with an existing trace of the same name downgrades to a lookup.
    let backend = match (&config.trace, &client) {
        (Some(uri), Some(client)) => {
            let (_, trace) = resolve_trace(client.as_ref(), uri, &tags, &logger)?;
            Some(trace)
        }
        (Some(_), None) => {
            return Err(Error::Config(
                "remote output configured but no ingest client is available".to_string(),
            ));
        }
        _ => None,
    };

    if let Some(dir) = &config.out_dir {
        validate_output_dir(dir)?;
    }

    if let Some(path) = config.read_file.clone() {
        return run_replay(&path, &config, &compiled, client, backend, tags, &logger);
    }

    let capture_negation = config.options.debug;
    if capture_negation {
        logger.debug("capturing filtered traffic for diagnostics");
    }

    let interfaces = eligible_interfaces(&config.interfaces)?;
    let ingest_addrs = if config.trace.is_some() {
        resolve_ingest_addrs(&config.domain)
    } else {
        Vec::new()
    };
    let filters = build_filters(
        &interfaces,
        &config.filter,
        capture_negation,
        config.options.dogfood,
        &ingest_addrs,
    )?;
    for (name, filter) in &filters.user {
        logger.debug(&format!("user filter on {}: {:?}", name, filter));
    }
    for (name, filter) in &filters.negation {
        logger.debug(&format!("negation filter on {}: {:?}", name, filter));
    }

    let rate_limit = config.witnesses_per_minute.map(RateLimit::new);
    let summaries = Summaries::new();
    let pipeline_count = filters.pipeline_count().max(1);
    let buffer_share = TOTAL_CAPTURE_BUFFER / pipeline_count;
    let reassembly_share = TOTAL_REASSEMBLY_BUDGET / pipeline_count;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (err_tx, err_rx) = bounded::<Error>(pipeline_count);
    let mut handles = Vec::new();

    for state in [FilterState::Matched, FilterState::Negation] {
        let (filter_map, summary) = match state {
            FilterState::Matched => (&filters.user, &summaries.matched),
            FilterState::Negation => (&filters.negation, &summaries.negation),
        };

        for (interface, filter) in filter_map {
            let sink: Box<dyn Collector> = match state {
                FilterState::Matched => build_sink(
                    interface,
                    &config,
                    &tags,
                    client.clone(),
                    backend.clone(),
                    &logger,
                )?,
                FilterState::Negation => Box::new(DiscardCollector),
            };

            let self_traffic = if state == FilterState::Matched
                && !config.options.dogfood
                && config.trace.is_some()
            {
                Some(SelfTrafficMatcher {
                    ingest_host: config.domain.clone(),
                    ingest_addrs: ingest_addrs.clone(),
                })
            } else {
                None
            };

            let prefilter = if state == FilterState::Matched && config.has_user_filters() {
                Some(Arc::clone(&summaries.prefilter))
            } else {
                None
            };

            let chain = build_chain(ChainConfig {
                interface,
                filters: &compiled,
                sample_rate: config.sample_rate,
                rate_limit: rate_limit.clone(),
                prefilter,
                admitted: Arc::clone(&summaries.admitted),
                self_traffic,
                sink,
            });

            let mut pipeline = Pipeline::new(
                interface,
                Arc::clone(summary),
                chain,
                reassembly_share,
                Arc::clone(&logger),
            );

            let interface = interface.clone();
            let filter = filter.clone();
            let shutdown = Arc::clone(&shutdown);
            let err_tx = err_tx.clone();
            let thread_logger = Arc::clone(&logger);
            let handle = thread::Builder::new()
                .name(format!("capture-{}", interface))
                .spawn(move || {
                    let run_result = PacketSource::open_live(&interface, &filter, buffer_share)
                        .and_then(|mut source| pipeline.run(&mut source, &shutdown));
                    let drain_result = pipeline.drain(Utc::now());
                    if let Err(e) = run_result.and(drain_result) {
                        thread_logger.log(&Event::PipelineError {
                            interface: &interface,
                            error: &e.to_string(),
                        });
                        let _ = err_tx.try_send(e);
                    }
                })
                .map_err(|e| Error::Config(format!("failed to spawn capture thread: {}", e)))?;
            handles.push(handle);
        }
    }
    drop(err_tx);

    let names: Vec<&str> = interfaces.keys().map(String::as_str).collect();
    logger.info(&format!("capturing on interfaces {}", names.join(", ")));
    if config.filter.trim().is_empty() {
        logger.warn("no BPF filter is set; all network traffic is treated as API traffic");
    }

    // Wait for the stop condition.
    let mut stop_error: Option<Error> = None;
    if let Some(command) = &config.exec_command {
        // Give capture time to go live before the subcommand generates
        // traffic.
        thread::sleep(CAPTURE_START_WAIT);
        logger.info("running subcommand");
        match run_command(config.exec_user.as_deref(), command) {
            Ok(()) => {
                if let Ok(e) = err_rx.try_recv() {
                    stop_error = Some(e);
                } else {
                    logger.info("subcommand finished, stopping trace collection");
                }
            }
            Err(e) => stop_error = Some(e),
        }
    } else {
        let (sig_tx, sig_rx) = bounded::<()>(2);
        ctrlc::set_handler(move || {
            let _ = sig_tx.try_send(());
        })
        .map_err(|e| Error::Config(format!("failed to install signal handler: {}", e)))?;

        logger.info("send SIGINT or SIGTERM to stop");
        crossbeam_channel::select! {
            recv(sig_rx) -> _ => {
                logger.info("received stop signal, stopping trace collection");
            }
            recv(err_rx) -> err => {
                if let Ok(e) = err {
                    stop_error = Some(e);
                }
            }
        }
    }

    // Let in-flight packets arrive, then broadcast stop and drain.
    thread::sleep(CAPTURE_STOP_WAIT);
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    if stop_error.is_none() {
        if let Ok(e) = err_rx.try_recv() {
            stop_error = Some(e);
        }
    }
    if let Some(e) = stop_error {
        return Err(e);
    }

    report(
        &logger,
        &interfaces,
        &filters,
        &summaries,
        config.has_user_filters(),
    )
}

/// Replays a saved capture through a single matched pipeline.
fn run_replay(
    path: &Path,
    config: &CaptureConfig,
    compiled: &CompiledFilters,
    client: Option<Arc<dyn IngestClient>>,
    backend: Option<TraceId>,
    tags: HashMap<String, String>,
    logger: &SharedLogger,
) -> Result<(), Error> {
    let mut source = PacketSource::open_file(path)?;
    let interface = source.interface().to_string();

    let sink = build_sink(&interface, config, &tags, client, backend, logger)?;
    let rate_limit = config.witnesses_per_minute.map(RateLimit::new);
    let summaries = Summaries::new();
    let prefilter = config
        .has_user_filters()
        .then(|| Arc::clone(&summaries.prefilter));

    let chain = build_chain(ChainConfig {
        interface: &interface,
        filters: compiled,
        sample_rate: config.sample_rate,
        rate_limit,
        prefilter,
        admitted: Arc::clone(&summaries.admitted),
        self_traffic: None,
        sink,
    });

    let mut pipeline = Pipeline::new(
        &interface,
        Arc::clone(&summaries.matched),
        chain,
        TOTAL_REASSEMBLY_BUDGET,
        Arc::clone(logger),
    );

    logger.info(&format!("replaying {}", path.display()));
    let shutdown = AtomicBool::new(false);
    let run_result = pipeline.run(&mut source, &shutdown);
    let drain_result = pipeline.drain(Utc::now());
    run_result.and(drain_result)?;

    let mut interfaces = BTreeMap::new();
    interfaces.insert(
        interface.clone(),
        InterfaceInfo {
            name: interface,
            addrs: Vec::new(),
        },
    );
    report(
        logger,
        &interfaces,
        &BpfFilters::default(),
        &summaries,
        config.has_user_filters(),
    )
}

/// Builds the terminal sink for a matched pipeline.
fn build_sink(
    interface: &str,
    config: &CaptureConfig,
    tags: &HashMap<String, String>,
    client: Option<Arc<dyn IngestClient>>,
    backend: Option<TraceId>,
    logger: &SharedLogger,
) -> Result<Box<dyn Collector>, Error> {
    let local = config
        .out_dir
        .as_ref()
        .map(|dir| Box::new(HarCollector::new(interface, dir, tags.clone())) as Box<dyn Collector>);

    let remote = match (client, backend) {
        (Some(client), Some(trace)) => Some(Box::new(BackendCollector::new(
            client,
            trace,
            Vec::new(),
            Arc::clone(logger),
        )) as Box<dyn Collector>),
        _ => None,
    };

    match (remote, local) {
        (Some(remote), Some(local)) => Ok(Box::new(TeeCollector {
            first: remote,
            second: local,
        })),
        (Some(remote), None) => Ok(remote),
        (None, Some(local)) => Ok(local),
        (None, None) => Err(Error::Config("invalid output location".to_string())),
    }
}

/// Tags attached to the trace: the user's, plus the capture flags, plus a
/// default source marker. CI and deployment enrichment happens outside.
fn collect_trace_tags(config: &CaptureConfig) -> HashMap<String, String> {
    let mut tags = config.tags.clone();
    if !config.interfaces.is_empty() {
        tags.insert(
            "x-capture-interfaces-flag".to_string(),
            config.interfaces.join(","),
        );
    }
    if !config.filter.is_empty() {
        tags.insert("x-capture-filter-flag".to_string(), config.filter.clone());
    }
    tags.entry("x-capture-source".to_string())
        .or_insert_with(|| "user".to_string());
    tags
}

/// Existing directories must be writable (probed with a sentinel file);
/// missing ones are created.
fn validate_output_dir(dir: &Path) -> Result<(), Error> {
    let dir_err = |reason: String| Error::OutputDir {
        path: dir.to_path_buf(),
        reason,
    };

    match fs::metadata(dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(dir_err("not a directory".to_string()));
            }
            let probe = dir.join("apiwitness_probe");
            fs::write(&probe, b"1").map_err(|e| dir_err(format!("not writable: {}", e)))?;
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => fs::create_dir_all(dir).map_err(|e| dir_err(format!("cannot create: {}", e))),
    }
}

// ── Shutdown reporting ───────────────────────────────────────────────────────

fn dump_packet_counters(
    logger: &SharedLogger,
    interfaces: &BTreeMap<String, InterfaceInfo>,
    matched: &PacketCountSummary,
    negation: Option<&PacketCountSummary>,
    show_interface: bool,
) {
    let mut states: Vec<(&str, &PacketCountSummary)> = vec![("MATCHED", matched)];
    if let Some(negation) = negation {
        states.push(("UNMATCHED", negation));
    }

    if show_interface {
        logger.debug("packets per interface (tcp / req / resp / unparsed):");
        for name in interfaces.keys() {
            for (state, summary) in &states {
                let count = summary.total_on_interface(name);
                logger.debug(&format!(
                    "  {:>12} {:>9} {:>7} {:>5} {:>5} {:>5}",
                    name,
                    state,
                    count.tcp_packets,
                    count.http_requests,
                    count.http_responses,
                    count.unparsed
                ));
            }
        }
    }

    logger.debug("packets per port (tcp / req / resp / unparsed):");
    for (state, summary) in &states {
        logger.debug(&format!("  -- {} --", state));
        let by_port = summary.all_ports();
        if by_port.is_empty() {
            logger.debug("  no packets captured");
        }
        for (port, count) in by_port {
            logger.debug(&format!(
                "  {:>8} {:>7} {:>5} {:>5} {:>5}",
                port, count.tcp_packets, count.http_requests, count.http_responses, count.unparsed
            ));
        }
    }
}

/// Emits the final diagnostics and maps the counters to the run outcome.
fn report(
    logger: &SharedLogger,
    interfaces: &BTreeMap<String, InterfaceInfo>,
    filters: &BpfFilters,
    summaries: &Summaries,
    user_filters_present: bool,
) -> Result<(), Error> {
    let negation_ran = !filters.negation.is_empty();
    dump_packet_counters(
        logger,
        interfaces,
        &summaries.matched,
        negation_ran.then_some(summaries.negation.as_ref()),
        true,
    );
    if user_filters_present {
        logger.debug("counts before allow and exclude filters and sampling:");
        dump_packet_counters(logger, interfaces, &summaries.prefilter, None, false);
    }

    let (missing, invalid, lost_after_parse) = context_fault_counts();
    if missing + invalid + lost_after_parse > 0 {
        logger.info(&format!(
            "capture context problems during the trace: {} missing, {} invalid, {} lost after parse",
            missing, invalid, lost_after_parse
        ));
        logger.info("these may cause some packets to be missing from the trace");
    }

    let total = summaries.matched.total();
    let admitted = summaries.admitted.total().http_requests;
    logger.log(&Event::SessionSummary {
        tcp_packets: total.tcp_packets,
        http_requests: total.http_requests,
        http_responses: total.http_responses,
        unparsed: total.unparsed,
        exchanges: admitted,
    });

    outcome(logger, summaries, user_filters_present, negation_ran, &total, admitted)
}

fn outcome(
    logger: &SharedLogger,
    summaries: &Summaries,
    user_filters_present: bool,
    negation_ran: bool,
    total: &PacketCounts,
    admitted: u64,
) -> Result<(), Error> {
    if admitted > 0 {
        logger.info("success");
        return Ok(());
    }

    if total.http_requests > 0 && total.http_responses == 0 {
        logger.warn("saw HTTP requests, but no responses");
        return Ok(());
    }
    if total.http_responses > 0 && total.http_requests == 0 {
        logger.warn("saw HTTP responses, but no requests");
        return Ok(());
    }

    if total.tcp_packets == 0 {
        if !negation_ran || summaries.negation.total().tcp_packets == 0 {
            logger.warn("did not capture any TCP packets; traffic may be on another interface");
        } else {
            logger.warn("did not capture any TCP packets matching the filter; check the filter");
        }
    } else if total.http_requests == 0 && total.http_responses == 0 && total.unparsed > 0 {
        logger.warn(&format!(
            "captured {} TCP packets but {} unparsed segments; this may be HTTPS traffic, which requires a proxy or HAR export",
            total.tcp_packets, total.unparsed
        ));
    } else if user_filters_present && summaries.prefilter.total().http_requests > 0 {
        logger.warn(&format!(
            "captured {} HTTP requests before allow and exclude rules, but all were filtered",
            summaries.prefilter.total().http_requests
        ));
    } else {
        logger.warn("no complete HTTP exchanges were admitted");
    }
    Err(Error::TraceEmpty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use std::path::PathBuf;

    fn logger() -> SharedLogger {
        Arc::new(Logger::new(false, None, false).unwrap())
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("apiwitness-sup-{}-{}", name, std::process::id()))
    }

    #[test]
    fn output_dir_is_created_when_missing() {
        let dir = scratch("create");
        std::fs::remove_dir_all(&dir).ok();
        validate_output_dir(&dir).unwrap();
        assert!(dir.is_dir());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn output_dir_rejects_files() {
        let file = scratch("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            validate_output_dir(&file),
            Err(Error::OutputDir { .. })
        ));
        std::fs::remove_file(&file).ok();
    }

    #[test]
    fn writable_dir_passes_the_probe() {
        let dir = scratch("probe");
        std::fs::create_dir_all(&dir).unwrap();
        validate_output_dir(&dir).unwrap();
        assert!(!dir.join("apiwitness_probe").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trace_tags_record_capture_flags() {
        let mut config = CaptureConfig {
            sample_rate: 1.0,
            out_dir: Some(PathBuf::from("/tmp")),
            ..Default::default()
        };
        config.interfaces = vec!["eth0".to_string(), "eth1".to_string()];
        config.filter = "tcp port 80".to_string();

        let tags = collect_trace_tags(&config);
        assert_eq!(tags["x-capture-interfaces-flag"], "eth0,eth1");
        assert_eq!(tags["x-capture-filter-flag"], "tcp port 80");
        assert_eq!(tags["x-capture-source"], "user");
    }

    #[test]
    fn user_supplied_source_tag_wins() {
        let mut config = CaptureConfig::default();
        config
            .tags
            .insert("x-capture-source".to_string(), "ci".to_string());
        let tags = collect_trace_tags(&config);
        assert_eq!(tags["x-capture-source"], "ci");
    }

    fn counts(tcp: u64, req: u64, resp: u64, unparsed: u64) -> PacketCounts {
        PacketCounts {
            tcp_packets: tcp,
            http_requests: req,
            http_responses: resp,
            unparsed,
        }
    }

    #[test]
    fn outcome_success_with_admitted_exchanges() {
        let summaries = Summaries::new();
        let total = counts(10, 2, 2, 0);
        assert!(outcome(&logger(), &summaries, false, false, &total, 2).is_ok());
    }

    #[test]
    fn outcome_unpaired_messages_warn_but_succeed() {
        let summaries = Summaries::new();
        assert!(outcome(&logger(), &summaries, false, false, &counts(10, 3, 0, 0), 0).is_ok());
        assert!(outcome(&logger(), &summaries, false, false, &counts(10, 0, 3, 0), 0).is_ok());
    }

    #[test]
    fn outcome_empty_trace_fails() {
        let summaries = Summaries::new();
        let result = outcome(&logger(), &summaries, false, false, &counts(0, 0, 0, 0), 0);
        assert!(matches!(result, Err(Error::TraceEmpty)));
    }

    #[test]
    fn outcome_https_suspicion_fails() {
        let summaries = Summaries::new();
        let result = outcome(&logger(), &summaries, false, false, &counts(40, 0, 0, 12), 0);
        assert!(matches!(result, Err(Error::TraceEmpty)));
    }

    #[test]
    fn outcome_all_filtered_fails() {
        let summaries = Summaries::new();
        summaries.prefilter.record_request("eth0", 80);
        let result = outcome(&logger(), &summaries, true, false, &counts(10, 1, 1, 0), 0);
        assert!(matches!(result, Err(Error::TraceEmpty)));
    }
}
