use std::collections::BTreeMap;

use crate::{channel::BoxFuture, error::HeadersError};

pub type Headers = BTreeMap<String, String>;

/// Supplies authentication headers for each session handshake, including every reconnect.
pub trait HeadersProvider: Send + Sync + 'static {
    fn get_headers(&self) -> BoxFuture<'_, Result<Headers, HeadersError>>;
}

/// Returns the same headers for every session.
#[derive(Clone, Debug, Default)]
pub struct StaticHeadersProvider {
    headers: Headers,
}

impl StaticHeadersProvider {
    pub fn new(headers: Headers) -> Self {
        Self { headers }
    }

    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self::default().header("authorization", format!("Bearer {}", token.as_ref()))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl HeadersProvider for StaticHeadersProvider {
    fn get_headers(&self) -> BoxFuture<'_, Result<Headers, HeadersError>> {
        let headers = self.headers.clone();
        Box::pin(async move { Ok(headers) })
    }
}

/// Calls a closure on every handshake, e.g. to read a token refreshed elsewhere.
pub struct FnHeadersProvider<F> {
    fetch: F,
}

impl<F> FnHeadersProvider<F>
where
    F: Fn() -> Result<Headers, HeadersError> + Send + Sync + 'static,
{
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F> HeadersProvider for FnHeadersProvider<F>
where
    F: Fn() -> Result<Headers, HeadersError> + Send + Sync + 'static,
{
    fn get_headers(&self) -> BoxFuture<'_, Result<Headers, HeadersError>> {
        let fetched = (self.fetch)();
        Box::pin(async move { fetched })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn bearer_sets_authorization_header() {
        let provider = StaticHeadersProvider::bearer("t0k3n").header("x-tenant", "acme");
        let headers = provider.get_headers().await.expect("headers");
        assert_eq!(headers.get("authorization").map(String::as_str), Some("Bearer t0k3n"));
        assert_eq!(headers.get("x-tenant").map(String::as_str), Some("acme"));
    }

    #[tokio::test]
    async fn closure_provider_runs_per_call() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = FnHeadersProvider::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(HeadersError::retryable("identity provider unreachable"))
            } else {
                Ok(Headers::from([("authorization".to_string(), format!("Bearer {n}"))]))
            }
        });

        let first = provider.get_headers().await.expect_err("first call fails");
        assert!(first.retryable);
        let second = provider.get_headers().await.expect("second call");
        assert_eq!(second["authorization"], "Bearer 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
