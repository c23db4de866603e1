//! Local archive sink.
//!
//! Buffers admitted exchanges and writes one HAR 1.2 document per interface
//! under the configured output directory on close. Trace tags are carried in
//! the log comment so downstream tooling can recover them.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use serde::Serialize;

use crate::collect::Collector;
use crate::error::Error;
use crate::sniff::types::{Exchange, Headers};

#[derive(Serialize)]
struct Har {
    log: HarLog,
}

#[derive(Serialize)]
struct HarLog {
    version: &'static str,
    creator: HarCreator,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    entries: Vec<HarEntry>,
}

#[derive(Serialize)]
struct HarCreator {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarEntry {
    started_date_time: String,
    /// Total elapsed time in milliseconds.
    time: f64,
    request: HarRequest,
    response: HarResponse,
    cache: HarCache,
    timings: HarTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

#[derive(Serialize)]
struct HarCache {}

#[derive(Serialize)]
struct HarTimings {
    send: f64,
    wait: f64,
    receive: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarHeader {
    name: String,
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
    method: String,
    url: String,
    http_version: String,
    cookies: Vec<()>,
    headers: Vec<HarHeader>,
    query_string: Vec<()>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_data: Option<HarPostData>,
    headers_size: i64,
    body_size: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarPostData {
    mime_type: String,
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarResponse {
    status: u16,
    status_text: String,
    http_version: String,
    cookies: Vec<()>,
    headers: Vec<HarHeader>,
    content: HarContent,
    redirect_url: String,
    headers_size: i64,
    body_size: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HarContent {
    size: i64,
    mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

fn har_headers(headers: &Headers) -> Vec<HarHeader> {
    headers
        .iter()
        .map(|(name, value)| HarHeader {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn entry_of(exchange: &Exchange) -> HarEntry {
    let request = &exchange.request;
    let response = &exchange.response;

    let url = format!("http://{}{}", exchange.host(), request.path);
    let elapsed = (response.end - request.start)
        .to_std()
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0;

    let post_data = if request.body.is_empty() {
        None
    } else {
        String::from_utf8(request.body.clone()).ok().map(|text| HarPostData {
            mime_type: header_value(&request.headers, "content-type")
                .unwrap_or("application/octet-stream")
                .to_string(),
            text,
        })
    };

    let mut comment = None;
    if request.truncated || response.truncated {
        comment = Some("body truncated at capture limit".to_string());
    }

    HarEntry {
        started_date_time: request
            .start
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        time: elapsed,
        request: HarRequest {
            method: request.method.clone(),
            url,
            http_version: format!("HTTP/1.{}", request.version),
            cookies: Vec::new(),
            headers: har_headers(&request.headers),
            query_string: Vec::new(),
            post_data,
            headers_size: -1,
            body_size: request.body.len() as i64,
        },
        response: HarResponse {
            status: response.status,
            status_text: response.reason.clone(),
            http_version: format!("HTTP/1.{}", response.version),
            cookies: Vec::new(),
            headers: har_headers(&response.headers),
            content: HarContent {
                size: response.body.len() as i64,
                mime_type: header_value(&response.headers, "content-type")
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                text: String::from_utf8(response.body.clone()).ok(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: response.body.len() as i64,
        },
        cache: HarCache {},
        timings: HarTimings {
            send: 0.0,
            wait: elapsed,
            receive: 0.0,
        },
        comment,
    }
}

/// Terminal sink that archives one interface's exchanges as a HAR file.
pub struct HarCollector {
    path: PathBuf,
    tags: HashMap<String, String>,
    entries: Vec<HarEntry>,
}

impl HarCollector {
    /// Archives to `<out_dir>/<interface>.har`.
    pub fn new(interface: &str, out_dir: &Path, tags: HashMap<String, String>) -> Self {
        let file_name = format!("{}.har", interface.replace(['/', '\\'], "_"));
        Self {
            path: out_dir.join(file_name),
            tags,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Collector for HarCollector {
    fn process(&mut self, exchange: Exchange) {
        self.entries.push(entry_of(&exchange));
    }

    fn close(&mut self) -> Result<(), Error> {
        let comment = if self.tags.is_empty() {
            None
        } else {
            serde_json::to_string(&self.tags).ok()
        };
        let har = Har {
            log: HarLog {
                version: "1.2",
                creator: HarCreator {
                    name: env!("CARGO_PKG_NAME"),
                    version: env!("CARGO_PKG_VERSION"),
                },
                comment,
                entries: std::mem::take(&mut self.entries),
            },
        };

        let write_err = |reason: String| Error::ArchiveWrite {
            path: self.path.clone(),
            reason,
        };
        let file = File::create(&self.path).map_err(|e| write_err(e.to_string()))?;
        serde_json::to_writer(BufWriter::new(file), &har)
            .map_err(|e| write_err(e.to_string()))
    }
}
