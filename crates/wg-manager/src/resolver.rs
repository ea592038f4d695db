//! Asynchronous endpoint hostname resolution with bounded retry.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::UnresolvedEndpoint;

/// Resolution outcome as collected from a [`JoinSet`].
pub type Resolution<T> = (T, Result<ResolvedAddrs, UnresolvedEndpoint>);

/// Performs a single DNS lookup.
pub trait HostLookup: Send + Sync + 'static {
    /// Looks up `host`, returning addresses with `port` applied.
    fn lookup(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// Lookup through the system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Retry and concurrency bounds for resolution.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Lookups per hostname before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed lookup.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between lookups.
    pub max_backoff: Duration,
    /// Factor applied to the delay after each failure.
    pub backoff_multiplier: f64,
    /// How long a reconcile waits for a hostname before giving up on it.
    pub timeout: Duration,
    /// Lookups allowed in flight at once.
    pub max_concurrent: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(5),
            max_concurrent: 4,
        }
    }
}

impl ResolverConfig {
    /// Sets the attempt bound (at least one lookup is always made).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial backoff.
    #[must_use]
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Sets the per-hostname wait bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub fn with_max_concurrent(mut self, permits: usize) -> Self {
        self.max_concurrent = permits.max(1);
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_backoff.as_millis() as f64 * factor) as u64;
        Duration::from_millis(delay_millis).min(self.max_backoff)
    }
}

/// Addresses a hostname resolved to. Finite and single-pass.
#[derive(Debug)]
pub struct ResolvedAddrs {
    addrs: std::vec::IntoIter<SocketAddr>,
}

impl ResolvedAddrs {
    fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs: addrs.into_iter(),
        }
    }
}

impl Iterator for ResolvedAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        self.addrs.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.addrs.size_hint()
    }
}

impl ExactSizeIterator for ResolvedAddrs {}

/// Resolves peer endpoint hostnames off the apply path.
///
/// Clones share the concurrency limit.
pub struct EndpointResolver<L = SystemLookup> {
    lookup: Arc<L>,
    config: ResolverConfig,
    permits: Arc<Semaphore>,
}

impl<L> Clone for EndpointResolver<L> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
            config: self.config.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl Default for EndpointResolver<SystemLookup> {
    fn default() -> Self {
        Self::new(SystemLookup, ResolverConfig::default())
    }
}

impl<L: HostLookup> EndpointResolver<L> {
    /// Creates a resolver.
    #[must_use]
    pub fn new(lookup: L, config: ResolverConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            lookup: Arc::new(lookup),
            config,
            permits,
        }
    }

    /// The resolver's configuration.
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves `host`, retrying with backoff.
    ///
    /// Every failed or empty lookup counts as transient until the attempt
    /// bound is reached.
    ///
    /// # Errors
    ///
    /// Returns [`UnresolvedEndpoint`] once the attempts are exhausted.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ResolvedAddrs, UnresolvedEndpoint> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = {
                let Ok(_permit) = self.permits.acquire().await else {
                    return Err(UnresolvedEndpoint {
                        host: host.to_string(),
                        attempts: attempt - 1,
                        reason: "resolver shut down".to_string(),
                    });
                };
                self.lookup.lookup(host, port).await
            };

            let reason = match outcome {
                Ok(addrs) if !addrs.is_empty() => {
                    debug!(host, attempt, count = addrs.len(), "resolved endpoint");
                    return Ok(ResolvedAddrs::new(addrs));
                }
                Ok(_) => "no addresses returned".to_string(),
                Err(e) => e.to_string(),
            };

            if attempt >= max_attempts {
                warn!(host, attempts = attempt, %reason, "giving up on endpoint");
                return Err(UnresolvedEndpoint {
                    host: host.to_string(),
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            debug!(host, attempt, ?delay, %reason, "lookup failed, backing off");
            sleep(delay).await;
        }
    }

    /// Starts resolving `host` on `tasks`, tagging the result with `tag`.
    ///
    /// Dropping the set aborts the lookup.
    pub fn spawn<T>(
        &self,
        tasks: &mut JoinSet<Resolution<T>>,
        tag: T,
        host: String,
        port: u16,
    ) where
        T: Send + 'static,
    {
        let resolver = self.clone();
        tasks.spawn(async move {
            let result = resolver.resolve(&host, port).await;
            (tag, result)
        });
    }
}
