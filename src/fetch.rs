//! Asset fetching and profile resolution contracts.
//!
//! The actual transport (HTTP, browser cache, filesystem) lives outside the
//! core; callers hand in anything implementing [`AssetFetcher`]. The core
//! wraps it in [`CachingFetcher`] for content-length freshness checks,
//! in-flight deduplication and bounded retry, and resolves manifest color
//! space names to profile material through [`ProfileResolver`].

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{ConvertError, ConvertResult};
use crate::manifest::{ColorSpaceDef, Manifest};

/// Blocking fetch transport. `content_length` is the HEAD-style precheck
/// used for cache freshness.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str, timeout: Duration) -> ConvertResult<Vec<u8>>;
    fn content_length(&self, url: &str, timeout: Duration) -> ConvertResult<Option<u64>>;
}

#[derive(Clone)]
struct CachedEntry {
    bytes: Arc<Vec<u8>>,
    length: u64,
}

#[derive(Default)]
struct InFlight {
    slot: Mutex<Option<Result<Arc<Vec<u8>>, String>>>,
    done: Condvar,
}

/// Persistent-cache wrapper around a fetch transport.
pub struct CachingFetcher<F: AssetFetcher> {
    inner: F,
    cache: Mutex<HashMap<String, CachedEntry>>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl<F: AssetFetcher> CachingFetcher<F> {
    pub fn new(inner: F) -> Self {
        Self::with_retry(inner, 4, Duration::from_millis(100))
    }

    pub fn with_retry(inner: F, max_attempts: u32, base_backoff: Duration) -> Self {
        CachingFetcher {
            inner,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Fetches `url`, deduplicating concurrent requests and serving cached
    /// bytes when the length precheck confirms freshness.
    pub fn fetch(&self, url: &str, timeout: Duration) -> ConvertResult<Arc<Vec<u8>>> {
        // Join an in-flight request for the same URL if one exists.
        let (flight, leader) = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(url) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = Arc::new(InFlight::default());
                    in_flight.insert(url.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        if !leader {
            let mut slot = flight.slot.lock().unwrap();
            while slot.is_none() {
                slot = flight.done.wait(slot).unwrap();
            }
            return match slot.as_ref().unwrap() {
                Ok(bytes) => Ok(bytes.clone()),
                Err(reason) => Err(ConvertError::AssetFetchFailed {
                    url: url.to_string(),
                    reason: reason.clone(),
                }),
            };
        }

        let result = self.fetch_fresh(url, timeout);

        {
            let mut slot = flight.slot.lock().unwrap();
            *slot = Some(match &result {
                Ok(bytes) => Ok(bytes.clone()),
                Err(e) => Err(e.to_string()),
            });
            flight.done.notify_all();
        }
        self.in_flight.lock().unwrap().remove(url);
        result
    }

    fn fetch_fresh(&self, url: &str, timeout: Duration) -> ConvertResult<Arc<Vec<u8>>> {
        if let Some(entry) = self.cache.lock().unwrap().get(url).cloned() {
            match self.inner.content_length(url, timeout) {
                Ok(Some(length)) if length == entry.length => {
                    debug!("cache hit for {url} ({length} bytes)");
                    return Ok(entry.bytes);
                }
                Ok(_) => debug!("cache stale for {url}, refetching"),
                Err(e) => warn!("length precheck failed for {url}: {e}"),
            }
        }

        let mut last_reason = String::new();
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                std::thread::sleep(self.base_backoff * 2u32.pow(attempt - 1));
            }
            match self.inner.fetch(url, timeout) {
                Ok(bytes) => {
                    let bytes = Arc::new(bytes);
                    self.cache.lock().unwrap().insert(
                        url.to_string(),
                        CachedEntry {
                            bytes: bytes.clone(),
                            length: bytes.len() as u64,
                        },
                    );
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!("fetch attempt {} for {url} failed: {e}", attempt + 1);
                    last_reason = e.to_string();
                }
            }
        }
        Err(ConvertError::AssetFetchFailed {
            url: url.to_string(),
            reason: last_reason,
        })
    }
}

/// What a manifest color space name resolves to.
#[derive(Debug, Clone)]
pub enum ResolvedProfile {
    /// ICC bytes fetched from the profile path.
    Bytes(Arc<Vec<u8>>),
    /// The `"Lab"` sentinel: use the engine's builtin Lab D50 profile.
    BuiltinLab,
    /// No profile: the space is passthrough (typical for spot colors).
    Passthrough,
}

impl ResolvedProfile {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, ResolvedProfile::Passthrough)
    }
}

/// Resolves manifest color space names against a fetcher.
pub struct ProfileResolver<'a, F: AssetFetcher> {
    fetcher: &'a CachingFetcher<F>,
    color_spaces: HashMap<String, ColorSpaceDef>,
    base_url: String,
    timeout: Duration,
}

impl<'a, F: AssetFetcher> ProfileResolver<'a, F> {
    pub fn new(
        manifest: &Manifest,
        fetcher: &'a CachingFetcher<F>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        ProfileResolver {
            fetcher,
            color_spaces: manifest.color_spaces.clone().into_iter().collect(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn definition(&self, name: &str) -> Option<&ColorSpaceDef> {
        self.color_spaces.get(name)
    }

    pub fn fetcher(&self) -> &'a CachingFetcher<F> {
        self.fetcher
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn resolve(&self, name: &str) -> ConvertResult<ResolvedProfile> {
        let def = self.color_spaces.get(name).ok_or_else(|| {
            ConvertError::InvalidArgument(format!("unknown color space {name:?} in manifest"))
        })?;
        match def.profile.as_deref() {
            None => Ok(ResolvedProfile::Passthrough),
            Some("Lab") => Ok(ResolvedProfile::BuiltinLab),
            Some(path) => {
                let url = join_url(&self.base_url, path);
                Ok(ResolvedProfile::Bytes(self.fetcher.fetch(&url, self.timeout)?))
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() {
        path.to_string()
    } else if base.ends_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
