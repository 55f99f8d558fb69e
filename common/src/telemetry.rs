//! Request tracing across the mutation pipeline.
//!
//! One client operation touches several nodes: the push lands on the
//! primary, the primary forwards to every secondary's buffer, the commit
//! fans `ApplyMutation` back out. All of those hops carry the same id in a
//! metadata header, so one grep over the cluster's logs reconstructs a
//! mutation end to end.

use std::fmt;

use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity of one client operation as it hops between nodes.
#[derive(Debug, Clone)]
pub struct RequestId(String);

impl RequestId {
    /// The id an incoming request carries; empty when the caller sent none
    /// (the operation still gets a span, just an anonymous one).
    pub fn of<T>(req: &Request<T>) -> Self {
        let id = req
            .metadata()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        RequestId(id)
    }

    /// Span for the handler serving this operation.
    pub fn span(&self, method: &'static str) -> tracing::Span {
        tracing::info_span!("rpc", rpc = %method, request_id = %self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound tagging policy for a typed client.
///
/// `PerCall` mints a fresh id per request and belongs on entry points (the
/// client driver, heartbeats). `Propagate` keeps carrying the id of the
/// operation being served and belongs on every hop made on its behalf:
/// buffer forwarding, the `ApplyMutation` fan-out, re-replication copies.
#[derive(Debug, Clone)]
pub enum RequestTag {
    PerCall,
    Propagate(RequestId),
}

impl Interceptor for RequestTag {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        let id = match self {
            RequestTag::PerCall => Uuid::new_v4().to_string(),
            RequestTag::Propagate(id) => id.0.clone(),
        };
        if let Ok(value) = MetadataValue::try_from(id) {
            req.metadata_mut().insert(REQUEST_ID_HEADER, value);
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagated_tag_carries_the_incoming_id() {
        let mut inbound = Request::new(());
        inbound
            .metadata_mut()
            .insert(REQUEST_ID_HEADER, MetadataValue::from_static("abc-123"));
        let id = RequestId::of(&inbound);
        assert_eq!(id.to_string(), "abc-123");

        let mut tag = RequestTag::Propagate(id);
        let outbound = tag.call(Request::new(())).unwrap();
        assert_eq!(
            outbound
                .metadata()
                .get(REQUEST_ID_HEADER)
                .unwrap()
                .to_str()
                .unwrap(),
            "abc-123"
        );
    }

    #[test]
    fn per_call_tag_mints_distinct_ids() {
        let mut tag = RequestTag::PerCall;
        let a = tag.call(Request::new(())).unwrap();
        let b = tag.call(Request::new(())).unwrap();
        let a = a.metadata().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        let b = b.metadata().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
