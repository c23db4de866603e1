//! Packet intake.
//!
//! A [`PacketSource`] is either a live, promiscuous pcap handle on one
//! interface or a saved capture file replayed through the identical
//! downstream path. Both yield timestamped link-layer frames.
//!
//! Capture timestamps are the packet clock everything downstream runs on.
//! Frames whose capture context is missing or malformed are dropped and
//! counted rather than aborting the pipeline; the counts are reported at
//! shutdown when non-zero.

pub mod bpf;
pub mod interfaces;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use pcap::{Active, Capture, Offline};

use crate::error::Error;
use crate::sniff::config::{CAPTURE_POLL_MS, SNAPLEN};

// ── Recoverable capture-context faults ───────────────────────────────────────
//
// Process-wide so the supervisor can report one total across pipelines.

/// Frames that arrived without a capture timestamp.
pub static CONTEXT_MISSING: AtomicU64 = AtomicU64::new(0);

/// Frames whose capture timestamp could not be represented.
pub static CONTEXT_INVALID: AtomicU64 = AtomicU64::new(0);

/// Messages that finished parsing without their start timestamp.
pub static CONTEXT_LOST_AFTER_PARSE: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the three fault counters, in declaration order.
pub fn context_fault_counts() -> (u64, u64, u64) {
    (
        CONTEXT_MISSING.load(Ordering::Relaxed),
        CONTEXT_INVALID.load(Ordering::Relaxed),
        CONTEXT_LOST_AFTER_PARSE.load(Ordering::Relaxed),
    )
}

/// Capture metadata attached to every frame handed downstream.
#[derive(Debug, Clone, Copy)]
pub struct PacketContext {
    pub ts: DateTime<Utc>,
}

/// Converts a pcap packet header into a context, counting faults.
fn context_of(header: &pcap::PacketHeader) -> Option<PacketContext> {
    let secs = header.ts.tv_sec as i64;
    let usecs = header.ts.tv_usec as i64;
    if secs == 0 && usecs == 0 {
        CONTEXT_MISSING.fetch_add(1, Ordering::Relaxed);
        return None;
    }
    if secs < 0 || !(0..1_000_000).contains(&usecs) {
        CONTEXT_INVALID.fetch_add(1, Ordering::Relaxed);
        return None;
    }
    match Utc.timestamp_opt(secs, (usecs * 1000) as u32) {
        chrono::LocalResult::Single(ts) => Some(PacketContext { ts }),
        _ => {
            CONTEXT_INVALID.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

// ── Packet source ────────────────────────────────────────────────────────────

/// One step of the capture loop.
pub enum Next<'a> {
    /// A frame with a valid capture context.
    Packet { data: &'a [u8], ctx: PacketContext },
    /// The frame was dropped for a counted, recoverable reason.
    Skipped,
    /// The read timeout expired; check the shutdown flag and poll again.
    TimedOut,
    /// End of a replayed file.
    Finished,
    /// The capture handle failed.
    Failed(Error),
}

enum Handle {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

/// A lazy sequence of timestamped link-layer frames for one pipeline.
pub struct PacketSource {
    handle: Handle,
    interface: String,
}

impl PacketSource {
    /// Opens a live capture on `interface` with the compiled `filter`.
    ///
    /// The kernel buffer is this pipeline's share of the total capture
    /// budget; the short read timeout lets the capture loop poll the
    /// shutdown flag while idle.
    pub fn open_live(interface: &str, filter: &str, buffer_share: usize) -> Result<Self, Error> {
        let open_err = |e: pcap::Error| Error::CaptureOpen {
            interface: interface.to_string(),
            reason: e.to_string(),
        };

        let mut cap = Capture::from_device(interface)
            .map_err(open_err)?
            .promisc(true)
            .snaplen(SNAPLEN)
            .buffer_size(buffer_share as i32)
            .timeout(CAPTURE_POLL_MS)
            .open()
            .map_err(open_err)?;

        if !filter.is_empty() {
            cap.filter(filter, true).map_err(|e| Error::InvalidFilter {
                interface: interface.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(Self {
            handle: Handle::Live(cap),
            interface: interface.to_string(),
        })
    }

    /// Opens a saved capture file for replay.
    pub fn open_file(path: &Path) -> Result<Self, Error> {
        let interface = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "replay".to_string());
        let cap = Capture::from_file(path).map_err(|e| Error::CaptureOpen {
            interface: interface.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            handle: Handle::File(cap),
            interface,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Reads the next frame. Blocks up to the read timeout on live handles.
    pub fn next_packet(&mut self) -> Next<'_> {
        let result = match &mut self.handle {
            Handle::Live(cap) => cap.next_packet(),
            Handle::File(cap) => cap.next_packet(),
        };
        match result {
            Ok(packet) => match context_of(packet.header) {
                Some(ctx) => Next::Packet {
                    data: packet.data,
                    ctx,
                },
                None => Next::Skipped,
            },
            Err(pcap::Error::TimeoutExpired) => Next::TimedOut,
            Err(pcap::Error::NoMorePackets) => Next::Finished,
            Err(e) => Next::Failed(Error::CaptureRead {
                interface: self.interface.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Kernel drop count, available on live handles only.
    pub fn dropped(&mut self) -> Option<u64> {
        match &mut self.handle {
            Handle::Live(cap) => cap.stats().ok().map(|s| s.dropped as u64),
            Handle::File(_) => None,
        }
    }
}
