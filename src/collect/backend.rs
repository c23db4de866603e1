//! Remote ingest sink.
//!
//! The actual ingest client (service lookup, trace creation, authenticated
//! upload) is an external collaborator; this module defines its contract
//! and the chain stage that forwards exchanges to it. A trace is resolved
//! once, before capture starts, and shared by every matched pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error as ThisError;

use crate::collect::Collector;
use crate::error::Error;
use crate::logger::SharedLogger;
use crate::sniff::types::Exchange;

/// Remote trace destination: a service plus an optional trace name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceUri {
    pub service: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

#[derive(Debug, ThisError)]
pub enum IngestError {
    /// The trace already exists; recover by looking it up by name.
    #[error("trace already exists")]
    Conflict,

    #[error("ingest endpoint returned status {0}")]
    Status(u16),

    #[error("ingest transport failure: {0}")]
    Transport(String),
}

/// Contract the external ingest client must satisfy. Implementations must
/// be thread-safe: one instance is shared by every pipeline.
pub trait IngestClient: Send + Sync {
    fn resolve_service(&self, name: &str) -> Result<ServiceId, IngestError>;

    fn create_trace(
        &self,
        service: &ServiceId,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> Result<TraceId, IngestError>;

    fn find_trace(&self, service: &ServiceId, name: &str) -> Result<TraceId, IngestError>;

    fn upload(&self, trace: &TraceId, exchange: &Exchange) -> Result<(), IngestError>;

    /// Flush any client-side buffering; called once per pipeline at close.
    fn flush(&self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Transforms applied to an exchange before upload. Returning `None` drops
/// the exchange. Supplied by external post-processor plugins.
pub trait ExchangeTransform: Send {
    fn transform(&self, exchange: Exchange) -> Option<Exchange>;
}

/// Random name for traces created without an explicit one.
pub fn random_trace_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("trace-{}", suffix.to_lowercase())
}

/// Resolves the destination trace before capture starts.
///
/// Creation losing the race to an existing trace of the same name is
/// recovered by switching to lookup.
pub fn resolve_trace(
    client: &dyn IngestClient,
    uri: &TraceUri,
    tags: &HashMap<String, String>,
    logger: &SharedLogger,
) -> Result<(ServiceId, TraceId), IngestError> {
    let service = client.resolve_service(&uri.service)?;
    let name = uri.name.clone().unwrap_or_else(random_trace_name);

    match client.create_trace(&service, &name, tags) {
        Ok(trace) => {
            logger.info(&format!("created new trace {} in {}", name, uri.service));
            Ok((service, trace))
        }
        Err(IngestError::Conflict) => {
            let trace = client.find_trace(&service, &name)?;
            logger.info(&format!("adding to existing trace {} in {}", name, uri.service));
            Ok((service, trace))
        }
        Err(e) => Err(e),
    }
}

/// Terminal sink forwarding exchanges to the ingest endpoint.
///
/// Upload failures are logged and counted; the most recent failure is
/// surfaced at close so a dead endpoint is not silently ignored.
pub struct BackendCollector {
    client: Arc<dyn IngestClient>,
    trace: TraceId,
    transforms: Vec<Box<dyn ExchangeTransform>>,
    logger: SharedLogger,
    failed: u64,
    last_failed: bool,
}

impl BackendCollector {
    pub fn new(
        client: Arc<dyn IngestClient>,
        trace: TraceId,
        transforms: Vec<Box<dyn ExchangeTransform>>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            client,
            trace,
            transforms,
            logger,
            failed: 0,
            last_failed: false,
        }
    }
}

impl Collector for BackendCollector {
    fn process(&mut self, exchange: Exchange) {
        let mut current = exchange;
        for transform in &self.transforms {
            match transform.transform(current) {
                Some(next) => current = next,
                None => return,
            }
        }

        match self.client.upload(&self.trace, &current) {
            Ok(()) => self.last_failed = false,
            Err(e) => {
                self.failed += 1;
                self.last_failed = true;
                self.logger.warn(&format!("upload failed: {}", e));
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.client.flush().map_err(Error::Ingest)?;
        if self.last_failed {
            return Err(Error::Ingest(IngestError::Transport(format!(
                "{} uploads failed, including the last one",
                self.failed
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::sample_exchange;
    use crate::logger::Logger;
    use std::sync::Mutex;

    /// In-memory client scripted to conflict on create when told to.
    pub(crate) struct MockIngest {
        pub conflict_on_create: bool,
        pub fail_uploads: bool,
        pub uploaded: Mutex<Vec<Exchange>>,
    }

    impl MockIngest {
        pub fn new() -> Self {
            Self {
                conflict_on_create: false,
                fail_uploads: false,
                uploaded: Mutex::new(Vec::new()),
            }
        }
    }

    impl IngestClient for MockIngest {
        fn resolve_service(&self, name: &str) -> Result<ServiceId, IngestError> {
            Ok(ServiceId(format!("svc-{}", name)))
        }

        fn create_trace(
            &self,
            _service: &ServiceId,
            name: &str,
            _tags: &HashMap<String, String>,
        ) -> Result<TraceId, IngestError> {
            if self.conflict_on_create {
                Err(IngestError::Conflict)
            } else {
                Ok(TraceId(format!("created-{}", name)))
            }
        }

        fn find_trace(&self, _service: &ServiceId, name: &str) -> Result<TraceId, IngestError> {
            Ok(TraceId(format!("found-{}", name)))
        }

        fn upload(&self, _trace: &TraceId, exchange: &Exchange) -> Result<(), IngestError> {
            if self.fail_uploads {
                return Err(IngestError::Status(503));
            }
            self.uploaded.lock().unwrap().push(exchange.clone());
            Ok(())
        }
    }

    fn logger() -> SharedLogger {
        Arc::new(Logger::new(false, None, false).unwrap())
    }

    #[test]
    fn resolve_creates_a_fresh_trace() {
        let client = MockIngest::new();
        let uri = TraceUri {
            service: "shop".to_string(),
            name: Some("t1".to_string()),
        };
        let (service, trace) =
            resolve_trace(&client, &uri, &HashMap::new(), &logger()).unwrap();
        assert_eq!(service, ServiceId("svc-shop".to_string()));
        assert_eq!(trace, TraceId("created-t1".to_string()));
    }

    #[test]
    fn conflict_falls_back_to_lookup() {
        let mut client = MockIngest::new();
        client.conflict_on_create = true;
        let uri = TraceUri {
            service: "shop".to_string(),
            name: Some("t1".to_string()),
        };
        let (_, trace) = resolve_trace(&client, &uri, &HashMap::new(), &logger()).unwrap();
        assert_eq!(trace, TraceId("found-t1".to_string()));
    }

    #[test]
    fn unnamed_traces_get_a_random_name() {
        let a = random_trace_name();
        let b = random_trace_name();
        assert!(a.starts_with("trace-"));
        assert_ne!(a, b);
    }

    #[test]
    fn uploads_flow_to_the_client() {
        let client = Arc::new(MockIngest::new());
        let mut sink = BackendCollector::new(
            Arc::clone(&client) as Arc<dyn IngestClient>,
            TraceId("t".to_string()),
            Vec::new(),
            logger(),
        );
        sink.process(sample_exchange("/a", "example.com"));
        sink.close().unwrap();
        assert_eq!(client.uploaded.lock().unwrap().len(), 1);
    }

    #[test]
    fn persistent_upload_failure_surfaces_at_close() {
        let client = Arc::new(MockIngest {
            conflict_on_create: false,
            fail_uploads: true,
            uploaded: Mutex::new(Vec::new()),
        });
        let mut sink = BackendCollector::new(
            client,
            TraceId("t".to_string()),
            Vec::new(),
            logger(),
        );
        sink.process(sample_exchange("/a", "example.com"));
        assert!(sink.close().is_err());
    }

    struct DropAll;
    impl ExchangeTransform for DropAll {
        fn transform(&self, _exchange: Exchange) -> Option<Exchange> {
            None
        }
    }

    #[test]
    fn transforms_can_drop_exchanges() {
        let client = Arc::new(MockIngest::new());
        let mut sink = BackendCollector::new(
            Arc::clone(&client) as Arc<dyn IngestClient>,
            TraceId("t".to_string()),
            vec![Box::new(DropAll)],
            logger(),
        );
        sink.process(sample_exchange("/a", "example.com"));
        sink.close().unwrap();
        assert!(client.uploaded.lock().unwrap().is_empty());
    }
}
