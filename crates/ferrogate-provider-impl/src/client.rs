//! One `wreq::Client` per process, lazily built and shared by every adapter.
//!
//! Mirrors the corpus's `SharedClient` idiom: connection pooling only pays
//! off if every adapter reuses the same client, so construction happens once
//! behind a `OnceLock` rather than per-adapter or per-call.

use std::sync::{Arc, OnceLock};

use ferrogate_common::CoreError;

struct SharedClient {
    proxy: Option<String>,
    client: Arc<wreq::Client>,
}

static SHARED_CLIENT: OnceLock<SharedClient> = OnceLock::new();

/// Returns the process-wide client, building it on first use. A second call
/// requesting a different proxy than the one the client was built with is a
/// configuration error — this process only ever speaks through one egress.
pub fn shared_client(proxy: Option<&str>) -> Result<Arc<wreq::Client>, CoreError> {
    if let Some(existing) = SHARED_CLIENT.get() {
        if existing.proxy.as_deref() != proxy {
            return Err(CoreError::internal(
                "proxy mismatch: only a single global proxy is supported per process",
            ));
        }
        return Ok(existing.client.clone());
    }

    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        let proxy = wreq::Proxy::all(proxy_url)
            .map_err(|e| CoreError::internal(format!("invalid proxy url: {e}")))?;
        builder = builder.proxy(proxy);
    }

    let client = Arc::new(
        builder
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build http client: {e}")))?,
    );

    let shared = SharedClient {
        proxy: proxy.map(str::to_string),
        client: client.clone(),
    };

    // Lost the race: another caller built one first, hand back theirs so the
    // whole process still shares a single connection pool.
    if SHARED_CLIENT.set(shared).is_err() {
        return Ok(SHARED_CLIENT.get().expect("just set").client.clone());
    }

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_the_same_client_across_calls() {
        let a = shared_client(None).unwrap();
        let b = shared_client(None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
