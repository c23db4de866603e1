use std::time::Duration;

/// Snap length for live captures.
///
/// Full message bodies are archived, so the capture must carry entire
/// segments, not just request lines and headers.
pub const SNAPLEN: i32 = 65_535;

/// Read timeout on live capture handles, in milliseconds.
///
/// The capture loop wakes at this interval to check the shutdown flag even
/// when no traffic arrives.
pub const CAPTURE_POLL_MS: i32 = 200;

/// Total kernel buffer budget shared by all live capture handles.
///
/// Each pipeline receives an equal share so memory stays bounded no matter
/// how many interfaces are active.
pub const TOTAL_CAPTURE_BUFFER: usize = 32 * 1024 * 1024;

/// Total out-of-order reassembly budget shared by all pipelines.
///
/// As with the capture buffer, each pipeline gets `1 / pipeline-count` of
/// this. When a pipeline exceeds its share, the oldest sequence gap is
/// forced closed to release buffered segments.
pub const TOTAL_REASSEMBLY_BUDGET: usize = 8 * 1024 * 1024;

/// How long a half-stream waits for a missing segment before the gap is
/// skipped and delivery resumes at the next buffered byte.
pub const GAP_TIMEOUT: Duration = Duration::from_secs(10);

/// A flow with no activity for this long is closed and its state dropped.
///
/// Connections that ended without an observed FIN or RST would otherwise
/// hold reassembly state forever.
pub const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a new flow may stay unclassified (TLS vs plaintext) before it
/// is conservatively treated as plaintext.
pub const CLASSIFY_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum client bytes needed before a flow is conservatively classified
/// as plaintext. A TLS record header or an HTTP method is always shorter.
pub const TLS_PEEK_BYTES: usize = 9;

/// Per-message body cap. Bodies beyond this are dropped and the message is
/// flagged truncated.
pub const BODY_CAP: usize = 1024 * 1024;

/// Upper bound on buffered header bytes before a message is abandoned and
/// the parser resynchronizes.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Ports that mark their endpoint as the server when no SYN was observed.
pub const HTTP_SERVER_PORTS: [u16; 2] = [80, 8080];

/// Minimum spacing between timeout sweeps over the flow table, measured on
/// the packet clock.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
