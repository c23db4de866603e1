//! Streaming HTTP/1.x parsing and request/response pairing.
//!
//! Each plaintext flow carries one [`MessageParser`] per direction: requests
//! on the client-to-server half, responses on the other. Parsed messages
//! pair FIFO within the flow: the k-th response belongs to the k-th request.
//!
//! Framing covers Content-Length, chunked transfer coding, and
//! close-delimited response bodies. Bodies are capped; a capped message is
//! flagged truncated, never dropped. A parse error abandons the current
//! message, counts one unparsed segment, and resynchronizes at the next
//! plausible request-line or status-line boundary.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::capture::CONTEXT_LOST_AFTER_PARSE;
use crate::collect::counts::PacketCountSummary;
use crate::sniff::config::{BODY_CAP, MAX_HEAD_BYTES};
use crate::sniff::types::{
    Direction, Exchange, FlowPair, Headers, HttpRequest, HttpResponse,
};

const MAX_HEADERS: usize = 64;

/// How many trailing bytes survive a failed resync scan, so a boundary
/// split across segments is still found.
const RESYNC_TAIL: usize = 8;

// ── Single-direction parser ──────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Role {
    Request,
    Response,
}

enum ChunkPhase {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

enum Framing {
    Length(usize),
    Chunked(ChunkPhase),
    /// Response body runs until the connection closes.
    UntilClose,
}

enum State {
    Head,
    Body(Framing),
    Resync,
}

/// Fields shared by both message kinds while a message is in flight.
struct Partial {
    method: String,
    path: String,
    host: Option<String>,
    status: u16,
    reason: String,
    version: u8,
    headers: Headers,
    body: Vec<u8>,
    truncated: bool,
}

pub enum Message {
    Request(HttpRequest),
    Response(HttpResponse),
}

enum HeadParse {
    Complete { consumed: usize, partial: Partial, framing: Framing },
    Incomplete,
    Invalid,
}

pub struct MessageParser {
    role: Role,
    buf: Vec<u8>,
    state: State,
    partial: Option<Partial>,
    /// Capture timestamp of the first byte of the in-flight message.
    msg_start: Option<DateTime<Utc>>,
}

impl MessageParser {
    fn new(role: Role) -> Self {
        Self {
            role,
            buf: Vec::new(),
            state: State::Head,
            partial: None,
            msg_start: None,
        }
    }

    /// Feeds in-order payload bytes. Returns completed messages plus the
    /// number of messages abandoned to resynchronization.
    fn push(&mut self, bytes: &[u8], ts: DateTime<Utc>) -> (Vec<Message>, u64) {
        if self.buf.is_empty() && self.msg_start.is_none() && !bytes.is_empty() {
            self.msg_start = Some(ts);
        }
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        let mut abandoned = 0;

        loop {
            match &mut self.state {
                State::Head => {
                    if self.buf.is_empty() {
                        break;
                    }
                    match self.parse_head() {
                        HeadParse::Complete { consumed, partial, framing } => {
                            self.buf.drain(..consumed);
                            self.partial = Some(partial);
                            self.state = State::Body(framing);
                            self.try_finish_empty_body(ts, &mut out);
                        }
                        HeadParse::Incomplete => {
                            if self.buf.len() > MAX_HEAD_BYTES {
                                abandoned += self.abandon();
                            } else {
                                break;
                            }
                        }
                        HeadParse::Invalid => {
                            abandoned += self.abandon();
                        }
                    }
                }

                State::Body(Framing::Length(remaining)) => {
                    let take = (*remaining).min(self.buf.len());
                    *remaining -= take;
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    append_body(self.partial.as_mut(), &chunk);
                    if *remaining == 0 {
                        self.finish(ts, &mut out);
                    } else {
                        break;
                    }
                }

                State::Body(Framing::Chunked(phase)) => match phase {
                    ChunkPhase::Size => {
                        let Some(line_end) = find_crlf(&self.buf) else {
                            if self.buf.len() > MAX_HEAD_BYTES {
                                abandoned += self.abandon();
                            }
                            break;
                        };
                        let line = &self.buf[..line_end];
                        let size_str = line
                            .split(|&b| b == b';')
                            .next()
                            .unwrap_or(line);
                        let size = std::str::from_utf8(size_str)
                            .ok()
                            .map(str::trim)
                            .and_then(|s| usize::from_str_radix(s, 16).ok());
                        match size {
                            Some(0) => {
                                self.buf.drain(..line_end + 2);
                                self.state = State::Body(Framing::Chunked(ChunkPhase::Trailers));
                            }
                            Some(n) => {
                                self.buf.drain(..line_end + 2);
                                self.state =
                                    State::Body(Framing::Chunked(ChunkPhase::Data { remaining: n }));
                            }
                            None => {
                                abandoned += self.abandon();
                            }
                        }
                    }
                    ChunkPhase::Data { remaining } => {
                        let take = (*remaining).min(self.buf.len());
                        *remaining -= take;
                        let chunk: Vec<u8> = self.buf.drain(..take).collect();
                        append_body(self.partial.as_mut(), &chunk);
                        if *remaining == 0 {
                            self.state = State::Body(Framing::Chunked(ChunkPhase::DataCrlf));
                        } else {
                            break;
                        }
                    }
                    ChunkPhase::DataCrlf => {
                        if self.buf.len() < 2 {
                            break;
                        }
                        if !self.buf.starts_with(b"\r\n") {
                            abandoned += self.abandon();
                        } else {
                            self.buf.drain(..2);
                            self.state = State::Body(Framing::Chunked(ChunkPhase::Size));
                        }
                    }
                    ChunkPhase::Trailers => {
                        if self.buf.starts_with(b"\r\n") {
                            self.buf.drain(..2);
                            self.finish(ts, &mut out);
                        } else if let Some(end) = find_subslice(&self.buf, b"\r\n\r\n") {
                            self.buf.drain(..end + 4);
                            self.finish(ts, &mut out);
                        } else {
                            if self.buf.len() > MAX_HEAD_BYTES {
                                abandoned += self.abandon();
                            }
                            break;
                        }
                    }
                },

                State::Body(Framing::UntilClose) => {
                    let chunk: Vec<u8> = self.buf.drain(..).collect();
                    append_body(self.partial.as_mut(), &chunk);
                    break;
                }

                State::Resync => {
                    if !self.resync(ts) {
                        break;
                    }
                }
            }
        }

        (out, abandoned)
    }

    /// A sequence gap makes the in-flight message unrecoverable.
    fn on_gap(&mut self) -> u64 {
        let lost = self.abandon();
        // Whatever bytes follow the gap start mid-stream.
        self.state = State::Resync;
        lost
    }

    /// Connection closed: finalize a close-delimited body, abandon anything
    /// else half-parsed.
    fn finish_at_close(&mut self, ts: DateTime<Utc>) -> (Option<Message>, u64) {
        match &self.state {
            State::Body(Framing::UntilClose) => {
                let mut out = Vec::new();
                self.finish(ts, &mut out);
                (out.pop(), 0)
            }
            State::Head if self.buf.is_empty() && self.partial.is_none() => (None, 0),
            State::Resync => (None, 0),
            _ => {
                let lost = self.abandon_quietly();
                (None, lost)
            }
        }
    }

    /// Parses a message head from the front of `buf`.
    fn parse_head(&self) -> HeadParse {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        match self.role {
            Role::Request => {
                let mut req = httparse::Request::new(&mut headers);
                match req.parse(&self.buf) {
                    Ok(httparse::Status::Complete(consumed)) => {
                        let (Some(method), Some(path), Some(version)) =
                            (req.method, req.path, req.version)
                        else {
                            return HeadParse::Invalid;
                        };
                        let headers = owned_headers(req.headers);
                        let framing = request_framing(&headers);
                        HeadParse::Complete {
                            consumed,
                            partial: Partial {
                                method: method.to_string(),
                                path: path.to_string(),
                                host: header_value(&headers, "host").map(str::to_string),
                                status: 0,
                                reason: String::new(),
                                version,
                                headers,
                                body: Vec::new(),
                                truncated: false,
                            },
                            framing,
                        }
                    }
                    Ok(httparse::Status::Partial) => HeadParse::Incomplete,
                    Err(_) => HeadParse::Invalid,
                }
            }
            Role::Response => {
                let mut resp = httparse::Response::new(&mut headers);
                match resp.parse(&self.buf) {
                    Ok(httparse::Status::Complete(consumed)) => {
                        let (Some(code), Some(version)) = (resp.code, resp.version) else {
                            return HeadParse::Invalid;
                        };
                        let headers = owned_headers(resp.headers);
                        let framing = response_framing(code, &headers);
                        HeadParse::Complete {
                            consumed,
                            partial: Partial {
                                method: String::new(),
                                path: String::new(),
                                host: None,
                                status: code,
                                reason: resp.reason.unwrap_or("").to_string(),
                                version,
                                headers,
                                body: Vec::new(),
                                truncated: false,
                            },
                            framing,
                        }
                    }
                    Ok(httparse::Status::Partial) => HeadParse::Incomplete,
                    Err(_) => HeadParse::Invalid,
                }
            }
        }
    }

    /// Completes zero-length bodies immediately after the head.
    fn try_finish_empty_body(&mut self, ts: DateTime<Utc>, out: &mut Vec<Message>) {
        if matches!(self.state, State::Body(Framing::Length(0))) {
            self.finish(ts, out);
        }
    }

    fn finish(&mut self, ts: DateTime<Utc>, out: &mut Vec<Message>) {
        let Some(partial) = self.partial.take() else {
            self.state = State::Head;
            return;
        };
        let start = match self.msg_start.take() {
            Some(start) => start,
            None => {
                CONTEXT_LOST_AFTER_PARSE.fetch_add(1, Ordering::Relaxed);
                ts
            }
        };
        if !self.buf.is_empty() {
            // Pipelined follow-up already buffered; it starts now.
            self.msg_start = Some(ts);
        }

        let message = match self.role {
            Role::Request => Message::Request(HttpRequest {
                method: partial.method,
                path: partial.path,
                host: partial.host,
                version: partial.version,
                headers: partial.headers,
                body: partial.body,
                truncated: partial.truncated,
                start,
                end: ts,
            }),
            Role::Response => Message::Response(HttpResponse {
                status: partial.status,
                reason: partial.reason,
                version: partial.version,
                headers: partial.headers,
                body: partial.body,
                truncated: partial.truncated,
                start,
                end: ts,
            }),
        };
        out.push(message);
        self.state = State::Head;
    }

    /// Drops the in-flight message and enters resynchronization.
    fn abandon(&mut self) -> u64 {
        let lost = self.abandon_quietly();
        self.state = State::Resync;
        lost.max(1)
    }

    fn abandon_quietly(&mut self) -> u64 {
        let had_message = self.partial.take().is_some() || !self.buf.is_empty();
        self.msg_start = None;
        self.state = State::Head;
        u64::from(had_message)
    }

    /// Scans for the next plausible message boundary. Returns true when one
    /// was found and parsing can resume.
    fn resync(&mut self, ts: DateTime<Utc>) -> bool {
        let needles: &[&[u8]] = match self.role {
            Role::Request => &[
                b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ",
                b"CONNECT ", b"TRACE ",
            ],
            Role::Response => &[b"HTTP/1."],
        };

        // Boundaries only count at the start of a line; position zero is the
        // garbage that got us here.
        let mut found = None;
        'scan: for i in 1..self.buf.len() {
            if self.buf[i - 1] != b'\n' {
                continue;
            }
            for needle in needles {
                if self.buf[i..].starts_with(needle) {
                    found = Some(i);
                    break 'scan;
                }
            }
        }

        match found {
            Some(at) => {
                self.buf.drain(..at);
                self.msg_start = Some(ts);
                self.state = State::Head;
                true
            }
            None => {
                if self.buf.len() > RESYNC_TAIL {
                    let cut = self.buf.len() - RESYNC_TAIL;
                    self.buf.drain(..cut);
                }
                false
            }
        }
    }
}

// ── Framing helpers ──────────────────────────────────────────────────────────

fn owned_headers(raw: &[httparse::Header]) -> Headers {
    raw.iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &Headers) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &Headers) -> Option<usize> {
    header_value(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

fn request_framing(headers: &Headers) -> Framing {
    if is_chunked(headers) {
        Framing::Chunked(ChunkPhase::Size)
    } else {
        Framing::Length(content_length(headers).unwrap_or(0))
    }
}

fn response_framing(status: u16, headers: &Headers) -> Framing {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Framing::Length(0);
    }
    if is_chunked(headers) {
        return Framing::Chunked(ChunkPhase::Size);
    }
    match content_length(headers) {
        Some(n) => Framing::Length(n),
        None => Framing::UntilClose,
    }
}

fn append_body(partial: Option<&mut Partial>, bytes: &[u8]) {
    let Some(partial) = partial else {
        return;
    };
    let room = BODY_CAP.saturating_sub(partial.body.len());
    if bytes.len() <= room {
        partial.body.extend_from_slice(bytes);
    } else {
        partial.body.extend_from_slice(&bytes[..room]);
        partial.truncated = true;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_subslice(buf: &[u8], needle: &[u8]) -> Option<usize> {
    buf.windows(needle.len()).position(|w| w == needle)
}

// ── Connection-level pairing ─────────────────────────────────────────────────

/// HTTP state for one plaintext flow: a parser per direction plus the FIFO
/// pairing queue. Counts requests, responses, and unparsed segments into
/// the pipeline's summary as messages resolve.
pub struct HttpConn {
    flow: FlowPair,
    requests: MessageParser,
    responses: MessageParser,
    pending: VecDeque<HttpRequest>,
    summary: Arc<PacketCountSummary>,
    interface: String,
}

impl HttpConn {
    pub fn new(flow: FlowPair, summary: Arc<PacketCountSummary>, interface: &str) -> Self {
        Self {
            flow,
            requests: MessageParser::new(Role::Request),
            responses: MessageParser::new(Role::Response),
            pending: VecDeque::new(),
            summary,
            interface: interface.to_string(),
        }
    }

    pub fn on_data(&mut self, dir: Direction, bytes: &[u8], ts: DateTime<Utc>) -> Vec<Exchange> {
        let port = self.flow.server.port;
        let parser = match dir {
            Direction::ToServer => &mut self.requests,
            Direction::ToClient => &mut self.responses,
        };
        let (messages, abandoned) = parser.push(bytes, ts);
        for _ in 0..abandoned {
            self.summary.record_unparsed(&self.interface, port);
        }

        let mut exchanges = Vec::new();
        for message in messages {
            self.resolve(message, &mut exchanges);
        }
        exchanges
    }

    pub fn on_gap(&mut self, dir: Direction) {
        let parser = match dir {
            Direction::ToServer => &mut self.requests,
            Direction::ToClient => &mut self.responses,
        };
        let lost = parser.on_gap();
        for _ in 0..lost.max(1) {
            self.summary
                .record_unparsed(&self.interface, self.flow.server.port);
        }
    }

    /// Flow closed: a close-delimited response can now complete.
    pub fn on_close(&mut self, ts: DateTime<Utc>) -> Vec<Exchange> {
        let mut exchanges = Vec::new();
        let (message, lost_resp) = self.responses.finish_at_close(ts);
        if let Some(message) = message {
            self.resolve(message, &mut exchanges);
        }
        let (_, lost_req) = self.requests.finish_at_close(ts);
        for _ in 0..lost_resp + lost_req {
            self.summary
                .record_unparsed(&self.interface, self.flow.server.port);
        }
        exchanges
    }

    fn resolve(&mut self, message: Message, exchanges: &mut Vec<Exchange>) {
        let port = self.flow.server.port;
        match message {
            Message::Request(request) => {
                self.summary.record_request(&self.interface, port);
                self.pending.push_back(request);
            }
            Message::Response(response) => {
                self.summary.record_response(&self.interface, port);
                if let Some(request) = self.pending.pop_front() {
                    exchanges.push(Exchange {
                        flow: self.flow,
                        request,
                        response,
                    });
                }
                // A response with no outstanding request has nothing to
                // pair with; it stays visible through the counters.
            }
        }
    }
}
