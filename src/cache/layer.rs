//! Interception layer that applies a caching strategy to every request.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::classify::{Classifier, RequestClass};
use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheClass, CacheGeneration, CacheResult};
use crate::config::Config;
use crate::error::FetchError;
use crate::http::{Fetcher, Request, Response};

/// Outcome of an intercepted request.
pub type Intercepted = CacheResult<Response>;

/// Cache layer between the application and the network.
///
/// Owns the cache partitions; nothing else reads or writes them. Failures of
/// the cache itself are logged and never block the network path.
pub struct Interceptor<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  classifier: Classifier,
  generation: RwLock<CacheGeneration>,
  origin: Url,
  precache: Vec<String>,
  offline_page: String,
}

impl<S: CacheStorage> Interceptor<S> {
  pub fn new(config: &Config, storage: S, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
    let origin = Url::parse(&config.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", config.server.url, e))?;

    Ok(Self {
      storage: Arc::new(storage),
      fetcher,
      classifier: Classifier::new(&origin, &config.server, &config.cache),
      generation: RwLock::new(CacheGeneration::new(&config.cache.generation)),
      origin,
      precache: config.cache.precache.clone(),
      offline_page: config.cache.offline_page.clone(),
    })
  }

  pub fn generation(&self) -> CacheGeneration {
    match self.generation.read() {
      Ok(g) => g.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  fn partition(&self, class: CacheClass) -> String {
    self.generation().partition(class)
  }

  /// Populate the static partition of the current generation.
  ///
  /// Assets that fail to download are logged and skipped. Returns how many
  /// were stored.
  pub async fn install(&self) -> Result<usize> {
    let generation = self.generation();
    for class in CacheClass::ALL {
      self
        .storage
        .ensure_partition(&generation.partition(class), class, generation.tag())?;
    }

    let partition = generation.partition(CacheClass::Static);
    let mut stored = 0;
    for path in &self.precache {
      let url = match self.origin.join(path) {
        Ok(url) => url,
        Err(e) => {
          warn!(path, error = %e, "skipping invalid precache path");
          continue;
        }
      };
      let request = Request::get(url);
      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if self.remember_once(&partition, &request, &response) {
            stored += 1;
          }
        }
        Ok(response) => warn!(url = %request.url, status = response.status, "precache fetch rejected"),
        Err(e) => warn!(url = %request.url, error = %e, "precache fetch failed"),
      }
    }

    info!(generation = generation.tag(), stored, "installed cache generation");
    Ok(stored)
  }

  /// Make the current generation the only one on disk.
  ///
  /// Deletes every partition whose name this generation does not own and
  /// returns the deleted names.
  pub fn activate(&self) -> Result<Vec<String>> {
    let generation = self.generation();
    for class in CacheClass::ALL {
      self
        .storage
        .ensure_partition(&generation.partition(class), class, generation.tag())?;
    }

    let known = generation.known_partitions();
    let mut deleted = Vec::new();
    for name in self.storage.partitions()? {
      if !known.contains(&name) {
        self.storage.delete_partition(&name)?;
        deleted.push(name);
      }
    }

    if !deleted.is_empty() {
      info!(generation = generation.tag(), ?deleted, "deleted stale cache partitions");
    }
    Ok(deleted)
  }

  /// Switch to a new generation: install it, then activate it.
  pub async fn upgrade(&self, tag: &str) -> Result<Vec<String>> {
    {
      let mut generation = self
        .generation
        .write()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      *generation = CacheGeneration::new(tag);
    }
    self.install().await?;
    self.activate()
  }

  /// Drop everything opportunistically cached in this generation.
  pub fn clear_dynamic(&self) -> Result<usize> {
    let dynamic = self.storage.clear_partition(&self.partition(CacheClass::Dynamic))?;
    let api = self.storage.clear_partition(&self.partition(CacheClass::Api))?;
    Ok(dynamic + api)
  }

  /// Perform a request through the caching strategy for its class.
  pub async fn fetch(&self, request: &Request) -> Result<Intercepted, FetchError> {
    let class = self.classifier.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "intercepting request");

    match class {
      RequestClass::Passthrough => self
        .fetcher
        .fetch(request)
        .await
        .map(CacheResult::passthrough),
      RequestClass::StaticAsset => self.cache_first(request).await,
      RequestClass::Api => self.network_first_api(request).await,
      RequestClass::Navigation => self.navigation(request).await,
      RequestClass::Other => self.network_first(request).await,
    }
  }

  /// Cached copy if present, otherwise fetch and keep a copy.
  async fn cache_first(&self, request: &Request) -> Result<Intercepted, FetchError> {
    let partition = self.partition(CacheClass::Static);
    if let Some(cached) = self.lookup(&partition, request) {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = self.fetcher.fetch(request).await?;
    if response.is_success() {
      self.remember_once(&partition, request, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Network first; on failure the last cached copy, then a critical-read
  /// default, then the original error.
  async fn network_first_api(&self, request: &Request) -> Result<Intercepted, FetchError> {
    let partition = self.partition(CacheClass::Api);
    let path = request.url.path();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() && self.classifier.is_cacheable_route(path) {
          self.remember(&partition, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        if let Some(cached) = self.lookup(&partition, request) {
          debug!(url = %request.url, error = %e, "serving cached API response");
          return Ok(CacheResult::offline(cached.response, cached.cached_at));
        }
        if let Some(payload) = self.classifier.critical_default(path) {
          debug!(url = %request.url, error = %e, "serving default for critical read");
          return Ok(CacheResult::fallback(Response::json(200, payload)));
        }
        Err(e)
      }
    }
  }

  /// Network first; on failure the cached page, then the offline page.
  async fn navigation(&self, request: &Request) -> Result<Intercepted, FetchError> {
    let partition = self.partition(CacheClass::Dynamic);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(&partition, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        if let Some(cached) = self.lookup(&partition, request) {
          return Ok(CacheResult::offline(cached.response, cached.cached_at));
        }
        debug!(url = %request.url, error = %e, "serving offline page");
        Ok(CacheResult::fallback(Response::html(200, &self.offline_page)))
      }
    }
  }

  /// Network first with best-effort caching; cached copy on failure.
  async fn network_first(&self, request: &Request) -> Result<Intercepted, FetchError> {
    let partition = self.partition(CacheClass::Dynamic);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.remember(&partition, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(&partition, request) {
        Some(cached) => Ok(CacheResult::offline(cached.response, cached.cached_at)),
        None => Err(e),
      },
    }
  }

  fn lookup(&self, partition: &str, request: &Request) -> Option<CachedResponse> {
    match self.storage.get(partition, request) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(partition, url = %request.url, error = %e, "cache read failed, ignoring cache");
        None
      }
    }
  }

  fn remember(&self, partition: &str, request: &Request, response: &Response) {
    if let Err(e) = self.storage.put(partition, request, response) {
      warn!(partition, url = %request.url, error = %e, "cache write failed, continuing uncached");
    }
  }

  fn remember_once(&self, partition: &str, request: &Request, response: &Response) -> bool {
    match self.storage.put_if_absent(partition, request, response) {
      Ok(stored) => stored,
      Err(e) => {
        warn!(partition, url = %request.url, error = %e, "cache write failed, continuing uncached");
        false
      }
    }
  }
}
