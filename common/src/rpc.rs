use std::future::Future;

use tonic::transport::{Channel, Endpoint};

use crate::GfsError;

/// Dial a peer by address. Connections are per-call; nobody pools.
pub async fn connect(addr: &str) -> Result<Channel, GfsError> {
    let url = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let endpoint =
        Endpoint::from_shared(url.clone()).map_err(|e| GfsError::Rpc(e.to_string()))?;
    endpoint
        .connect()
        .await
        .map_err(|e| GfsError::Rpc(format!("failed to connect to {}: {}", url, e)))
}

/// Fan a set of calls out concurrently and wait for every one of them.
/// Returns `Ok` only if all calls succeeded; otherwise the last error
/// observed (callers must not depend on which one).
pub async fn call_all<F>(calls: Vec<F>) -> Result<(), GfsError>
where
    F: Future<Output = Result<(), GfsError>> + Send + 'static,
{
    let handles: Vec<_> = calls.into_iter().map(tokio::spawn).collect();

    let mut last_err = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => last_err = Some(e),
            Err(join_err) => last_err = Some(GfsError::Unknown(join_err.to_string())),
        }
    }

    match last_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
