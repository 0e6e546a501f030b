//! Query processing pipeline contracts
//!
//! The engine routes and relays; deciding what happens to a query is the
//! pipeline's job. The trait is invoked synchronously from the connection
//! task after a full query has been read and validated. Self-generated
//! answers (rule actions, cache hits, DNSCrypt responses in the larger
//! system) surface through [`QueryVerdict::Respond`] with the buffer
//! rewritten in place.
//!
//! [`ForwardingPipeline`] is the stock implementation: it accepts every
//! query and spreads them over the configured backends.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::proto::Question;
use crate::proxy_protocol::ProxyTlv;

/// What should happen to a query
#[derive(Debug)]
pub enum QueryVerdict {
    /// Close the connection without a response
    Drop,
    /// Send the (possibly rewritten) query buffer back as the response
    Respond,
    /// Forward the query to this backend
    Forward(Arc<Backend>),
}

/// Everything the pipeline may inspect or rewrite about a query
#[derive(Debug)]
pub struct QueryContext<'a> {
    /// The raw query message; may be rewritten in place
    pub buffer: &'a mut Vec<u8>,
    /// The parsed first question
    pub question: &'a Question,
    /// Client address, after PROXY-protocol override
    pub client: SocketAddr,
    /// Destination address, after PROXY-protocol override
    pub destination: SocketAddr,
    /// TLS server name indication, when the query arrived over DoT
    pub server_name: Option<&'a str>,
    /// Decoded PROXY-protocol TLVs, when present
    pub proxy_tlvs: Option<&'a [ProxyTlv]>,
    /// Whether the query starts a zone transfer
    pub is_xfr: bool,
}

/// Everything the pipeline may inspect or rewrite about a response
#[derive(Debug)]
pub struct ResponseContext<'a> {
    /// The raw response message; may be rewritten in place
    pub buffer: &'a mut Vec<u8>,
    /// Client the response is going to
    pub client: SocketAddr,
    /// Name of the backend that answered
    pub backend: Option<&'a str>,
}

/// The processing pipeline a worker runs every query and response through
pub trait QueryPipeline: Send + Sync + fmt::Debug {
    /// Decide what happens to a query
    fn process_query(&self, query: &mut QueryContext<'_>) -> QueryVerdict;

    /// Inspect a response before it is relayed; `false` drops it silently
    fn process_response(&self, response: &mut ResponseContext<'_>) -> bool {
        let _ = response;
        true
    }
}

/// Backend selection strategy for [`ForwardingPipeline`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Rotate over the backends
    #[default]
    RoundRobin,
    /// Pick a backend at random
    Random,
    /// Always use the first backend
    FirstAvailable,
}

/// Stock pipeline: accept everything, spread queries over the backends
#[derive(Debug)]
pub struct ForwardingPipeline {
    backends: Vec<Arc<Backend>>,
    strategy: SelectionStrategy,
    rr_counter: AtomicUsize,
}

impl ForwardingPipeline {
    /// Create a pipeline over `backends`
    #[must_use]
    pub fn new(backends: Vec<Arc<Backend>>, strategy: SelectionStrategy) -> Self {
        Self {
            backends,
            strategy,
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// The configured selection strategy
    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    fn select(&self) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }
        let index = match self.strategy {
            SelectionStrategy::RoundRobin => {
                self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.backends.len()
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..self.backends.len()),
            SelectionStrategy::FirstAvailable => 0,
        };
        Some(Arc::clone(&self.backends[index]))
    }
}

impl QueryPipeline for ForwardingPipeline {
    fn process_query(&self, _query: &mut QueryContext<'_>) -> QueryVerdict {
        match self.select() {
            Some(backend) => QueryVerdict::Forward(backend),
            None => QueryVerdict::Drop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::proto;

    fn backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend::from_config(&BackendConfig::new(
            name,
            "192.0.2.53:53".parse().unwrap(),
        )))
    }

    fn query_bytes() -> Vec<u8> {
        let mut query = vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        query.extend_from_slice(&[
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00,
            0x01, 0x00, 0x01,
        ]);
        query
    }

    fn run_query(pipeline: &dyn QueryPipeline) -> QueryVerdict {
        let mut buffer = query_bytes();
        let question = proto::parse_question(&buffer).unwrap();
        let mut query = QueryContext {
            buffer: &mut buffer,
            question: &question,
            client: "10.0.0.7:5353".parse().unwrap(),
            destination: "192.0.2.1:53".parse().unwrap(),
            server_name: None,
            proxy_tlvs: None,
            is_xfr: false,
        };
        pipeline.process_query(&mut query)
    }

    #[test]
    fn test_round_robin_rotates() {
        let pipeline = ForwardingPipeline::new(
            vec![backend("a"), backend("b")],
            SelectionStrategy::RoundRobin,
        );

        let mut names = Vec::new();
        for _ in 0..4 {
            match run_query(&pipeline) {
                QueryVerdict::Forward(b) => names.push(b.name.clone()),
                other => panic!("expected forward, got {other:?}"),
            }
        }
        assert_eq!(names, ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_first_available_sticks() {
        let pipeline = ForwardingPipeline::new(
            vec![backend("a"), backend("b")],
            SelectionStrategy::FirstAvailable,
        );
        for _ in 0..3 {
            match run_query(&pipeline) {
                QueryVerdict::Forward(b) => assert_eq!(b.name, "a"),
                other => panic!("expected forward, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_random_selects_configured_backends() {
        let pipeline =
            ForwardingPipeline::new(vec![backend("a"), backend("b")], SelectionStrategy::Random);
        for _ in 0..8 {
            match run_query(&pipeline) {
                QueryVerdict::Forward(b) => assert!(b.name == "a" || b.name == "b"),
                other => panic!("expected forward, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_pipeline_drops() {
        let pipeline = ForwardingPipeline::new(Vec::new(), SelectionStrategy::RoundRobin);
        assert!(matches!(run_query(&pipeline), QueryVerdict::Drop));
    }

    #[test]
    fn test_default_response_hook_keeps() {
        let pipeline =
            ForwardingPipeline::new(vec![backend("a")], SelectionStrategy::FirstAvailable);
        let mut buffer = query_bytes();
        let mut response = ResponseContext {
            buffer: &mut buffer,
            client: "10.0.0.7:5353".parse().unwrap(),
            backend: Some("a"),
        };
        assert!(pipeline.process_response(&mut response));
    }

    #[test]
    fn test_context_buffer_is_rewritable() {
        #[derive(Debug)]
        struct Spoofing;
        impl QueryPipeline for Spoofing {
            fn process_query(&self, query: &mut QueryContext<'_>) -> QueryVerdict {
                proto::set_notimp(query.buffer);
                QueryVerdict::Respond
            }
        }

        let mut buffer = query_bytes();
        let question = proto::parse_question(&buffer).unwrap();
        let verdict = {
            let mut query = QueryContext {
                buffer: &mut buffer,
                question: &question,
                client: "10.0.0.7:5353".parse().unwrap(),
                destination: "192.0.2.1:53".parse().unwrap(),
                server_name: None,
                proxy_tlvs: None,
                is_xfr: false,
            };
            Spoofing.process_query(&mut query)
        };
        assert!(matches!(verdict, QueryVerdict::Respond));
        assert!(proto::is_response(&buffer));
    }
}
