//! The data store: element registry and page fetch path.
//!
//! Every piece of data the proxy can serve is an *element* with a cache
//! key `<kind>_<id>`. Each kind supplies three functions: a hasher that
//! produces the key, a fetcher for the read path behind a miss, and a
//! revalidation predicate for hits. [`DataStore::get`] reads the cache,
//! fans out fetches for everything missing or invalid, and joins.
//!
//! Pages are the interesting kind: their fetcher coalesces concurrent
//! origin requests per key, and their predicate implements the two
//! staleness tiers (serve-and-refresh up to 3× `max-age`, refuse past
//! that).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ab::AbEngine;
use crate::backend::{CacheBackend, Element, PageEntry};
use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::{FetchFailure, ProxyError, Result};
use crate::kv::KvClient;
use crate::mail::Mailer;
use crate::message::{Message, UNCACHEABLE_METHODS};
use crate::origin::OriginClient;
use crate::session::SessionSource;

/// Response statuses that are never cached.
pub const UNCACHEABLE_STATUS: [u16; 6] = [500, 502, 503, 504, 304, 307];
/// Response statuses cached for a fixed short window.
pub const SHORT_STATUS: [u16; 1] = [404];
/// The short window, in seconds.
pub const SHORT_TTL: u64 = 30;

/// A page fetch in flight, shareable between concurrent callers.
pub type PageFuture =
    Shared<BoxFuture<'static, std::result::Result<PageEntry, FetchFailure>>>;

/// One element kind: a name plus its hash / fetch / revalidation triple.
///
/// Kind names never contain `_`; keys are `<kind>_<id>`. Adding a kind is
/// one more row in [`REGISTRY`].
pub struct KindSpec {
    /// Kind name, the key prefix
    pub name: &'static str,
    /// Cache-key producer, pure in `(request, id)`
    pub hash: fn(&DataStore, &Message, &str) -> String,
    /// Origin read path for a missing or invalid element
    pub fetch: for<'a> fn(
        &'a DataStore,
        &'a Message,
        &'a str,
    ) -> BoxFuture<'a, Result<Option<Element>>>,
    /// Revalidation predicate for a cached element
    pub valid: fn(&DataStore, &Message, &str, &Element) -> bool,
}

impl std::fmt::Debug for KindSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindSpec").field("name", &self.name).finish_non_exhaustive()
    }
}

macro_rules! boxed_fetch {
    ($method:ident) => {{
        fn wrapper<'a>(
            store: &'a DataStore,
            request: &'a Message,
            id: &'a str,
        ) -> BoxFuture<'a, Result<Option<Element>>> {
            Box::pin(store.$method(request, id))
        }
        wrapper
    }};
}

fn valid_always(
    _store: &DataStore,
    _request: &Message,
    _id: &str,
    _element: &Element,
) -> bool {
    true
}

/// The element kinds the store knows how to serve.
pub static REGISTRY: &[KindSpec] = &[
    KindSpec {
        name: "page",
        hash: DataStore::hash_page_plain,
        fetch: boxed_fetch!(fetch_page_element),
        valid: DataStore::valid_page,
    },
    KindSpec {
        name: "expiration",
        hash: DataStore::hash_expiration,
        fetch: boxed_fetch!(fetch_nothing),
        valid: valid_always,
    },
    KindSpec {
        name: "abvalue",
        hash: DataStore::hash_abvalue,
        fetch: boxed_fetch!(fetch_abvalue),
        valid: valid_always,
    },
    KindSpec {
        name: "abdependency",
        hash: DataStore::hash_abdependency,
        fetch: boxed_fetch!(fetch_nothing),
        valid: valid_always,
    },
    KindSpec {
        name: "session",
        hash: DataStore::hash_session,
        fetch: boxed_fetch!(fetch_session),
        valid: valid_always,
    },
    KindSpec {
        name: "memcache",
        hash: DataStore::hash_memcache,
        fetch: boxed_fetch!(fetch_memcache),
        valid: valid_always,
    },
    KindSpec {
        name: "viewdb",
        hash: DataStore::hash_viewdb,
        fetch: boxed_fetch!(fetch_viewdb),
        valid: valid_always,
    },
    KindSpec {
        name: "unread",
        hash: DataStore::hash_unread,
        fetch: boxed_fetch!(fetch_unread),
        valid: valid_always,
    },
    KindSpec {
        name: "favorite",
        hash: DataStore::hash_favorite,
        fetch: boxed_fetch!(fetch_favorite),
        valid: valid_always,
    },
    KindSpec {
        name: "subscription",
        hash: DataStore::hash_subscription,
        fetch: boxed_fetch!(fetch_subscription),
        valid: valid_always,
    },
    KindSpec {
        name: "geo",
        hash: DataStore::hash_geo,
        fetch: boxed_fetch!(fetch_nothing),
        valid: valid_always,
    },
    KindSpec {
        name: "ip",
        hash: DataStore::hash_ip,
        fetch: boxed_fetch!(fetch_nothing),
        valid: valid_always,
    },
];

fn kind_spec(name: &str) -> Option<&'static KindSpec> {
    REGISTRY.iter().find(|spec| spec.name == name)
}

/// Splits a comma list header, dropping empties, sorted.
pub(crate) fn parse_list(raw: Option<&str>) -> Vec<String> {
    let mut items: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    items.sort();
    items
}

/// Parses a `test:label,test:label` cohort header.
pub(crate) fn parse_cohort(raw: Option<&str>) -> HashMap<String, String> {
    raw.unwrap_or("")
        .split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(test, label)| (test.to_string(), label.to_string()))
        .collect()
}

/// The central dispatcher: element registry, miss fan-out, page fetching
/// with origin coalescing, and the stale-while-revalidate tiers.
pub struct DataStore {
    me: Weak<DataStore>,
    config: Arc<Config>,
    cache: Arc<dyn CacheBackend>,
    kv: Arc<dyn KvClient>,
    viewdb: Arc<dyn KvClient>,
    sessions: Arc<dyn SessionSource>,
    /// Cohort assignment and salting
    pub ab: Arc<AbEngine>,
    clock: Arc<dyn TimeSource>,
    origin: OriginClient,
    mailer: Mailer,
    pending: Mutex<HashMap<String, PageFuture>>,
    page_failures: Mutex<HashMap<String, FetchFailure>>,
    variants: Mutex<HashMap<String, Vec<String>>>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("pending", &self.pending.lock().len())
            .field("variants", &self.variants.lock().len())
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Wires the store together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        cache: Arc<dyn CacheBackend>,
        kv: Arc<dyn KvClient>,
        viewdb: Arc<dyn KvClient>,
        sessions: Arc<dyn SessionSource>,
        ab: Arc<AbEngine>,
        clock: Arc<dyn TimeSource>,
        mailer: Mailer,
    ) -> Arc<Self> {
        let origin = OriginClient::from_config(&config);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            cache,
            kv,
            viewdb,
            sessions,
            ab,
            clock,
            origin,
            mailer,
            pending: Mutex::new(HashMap::new()),
            page_failures: Mutex::new(HashMap::new()),
            variants: Mutex::new(HashMap::new()),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().unwrap_or_else(|| {
            unreachable!("the store is only reachable through its Arc")
        })
    }

    /// Kind prefix of a key, everything before the first `_`.
    pub fn element_kind(key: &str) -> &str {
        key.split('_').next().unwrap_or("")
    }

    /// Id of a key, everything after the first `_`.
    pub fn element_id(key: &str) -> &str {
        key.split_once('_').map(|(_, id)| id).unwrap_or("")
    }

    /// Cache key for `kind` with `id` under `request`; empty when the
    /// kind cannot be keyed for this request (e.g. no session cookie).
    pub fn element_hash(&self, request: &Message, kind: &str, id: &str) -> String {
        match kind_spec(kind) {
            Some(spec) => (spec.hash)(self, request, id),
            None => String::new(),
        }
    }

    /// Reads `keys`, fetching whatever is missing or invalid, in parallel.
    ///
    /// `force` skips the cache read entirely. A failed element fetch
    /// degrades to an empty mapping; nothing here aborts the caller.
    pub async fn get(
        &self,
        keys: Vec<String>,
        request: &Message,
        force: bool,
    ) -> HashMap<String, Option<Element>> {
        let mut elements: HashMap<String, Option<Element>> = if force {
            keys.iter().map(|key| (key.clone(), None)).collect()
        } else {
            match self.cache.get(&keys).await {
                Ok(found) => found,
                Err(err) => {
                    self.mailer.error(format!("cache read failed: {err}"));
                    keys.iter().map(|key| (key.clone(), None)).collect()
                }
            }
        };
        self.handle_misses(&mut elements, request).await;
        elements
    }

    /// Drops `keys` from the cache.
    pub async fn delete(&self, keys: &[String]) {
        if let Err(err) = self.cache.delete(keys).await {
            self.mailer.error(format!("cache delete failed: {err}"));
        }
    }

    /// Drops the entire cache.
    pub async fn flush(&self) {
        if let Err(err) = self.cache.flush().await {
            self.mailer.error(format!("cache flush failed: {err}"));
        }
    }

    /// Writes the expiration sentinel for this URI, soft-invalidating
    /// every cached variant for the next 24 hours.
    pub async fn set_expiration(&self, request: &Message) {
        let key = self.element_hash(request, "expiration", "");
        let stamp = Element::Stamp(self.clock.now());
        if let Err(err) =
            self.cache.set(HashMap::from([(key, stamp)]), 86_400).await
        {
            self.mailer.error(format!("cache write failed: {err}"));
        }
    }

    /// Known page-key variants of a base URI.
    pub fn variants_of(&self, uri: &str) -> Vec<String> {
        self.variants
            .lock()
            .get(uri.trim_end_matches('?'))
            .cloned()
            .unwrap_or_default()
    }

    /// Why the last fetch for this page key failed, if it did.
    pub fn take_page_failure(&self, key: &str) -> Option<FetchFailure> {
        self.page_failures.lock().remove(key)
    }

    /// Number of page fetches currently in flight.
    pub fn pending_fetches(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether a mutator named `<op>_<target>` exists.
    pub fn has_mutator(&self, name: &str) -> bool {
        matches!(
            name,
            "incr_memcache"
                | "decr_memcache"
                | "set_memcache"
                | "delete_memcache"
                | "incr_viewdb"
                | "set_viewdb"
        )
    }

    /// Runs a mutator in the background, fire-and-forget.
    ///
    /// Unknown names are reported through the mailer, matching the
    /// templating contract: log and continue.
    pub fn spawn_mutation(&self, name: &str, key: &str, value: Option<&str>) {
        if !self.has_mutator(name) {
            self.mailer.error(format!("data store is missing {name}"));
            return;
        }
        let store = self.arc();
        let name = name.to_string();
        let key = key.to_string();
        let value = value.map(str::to_string);
        tokio::spawn(async move {
            let result = match name.as_str() {
                "incr_memcache" => store.kv.incr(&key).await.map(|_| ()),
                "decr_memcache" => store.kv.decr(&key).await.map(|_| ()),
                "set_memcache" => {
                    store
                        .kv
                        .set(&key, value.unwrap_or_default().into_bytes(), 0)
                        .await
                }
                "delete_memcache" => {
                    store.delete(&[format!("memcache_{key}")]).await;
                    store.kv.delete(&key).await
                }
                "incr_viewdb" => {
                    let _ = store.viewdb.add(&key, b"0".to_vec()).await;
                    store.viewdb.incr(&key).await.map(|_| ())
                }
                "set_viewdb" => {
                    store
                        .viewdb
                        .add(&key, value.unwrap_or_default().into_bytes())
                        .await
                        .map(|_| ())
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                warn!(%name, %key, %err, "mutation failed");
            }
        });
    }

    async fn handle_misses(
        &self,
        elements: &mut HashMap<String, Option<Element>>,
        request: &Message,
    ) {
        let mut missing: Vec<(String, &'static KindSpec)> = Vec::new();
        for (key, value) in elements.iter() {
            let kind = Self::element_kind(key);
            let Some(spec) = kind_spec(kind) else {
                warn!(%key, "no such element kind");
                continue;
            };
            let fetch = match value {
                None => {
                    info!("MISS [{key}]");
                    true
                }
                Some(element) => {
                    if (spec.valid)(self, request, Self::element_id(key), element)
                    {
                        info!("HIT [{key}]");
                        false
                    } else {
                        info!("INVALID [{key}]");
                        true
                    }
                }
            };
            if fetch {
                missing.push((key.clone(), spec));
            }
        }
        if missing.is_empty() {
            return;
        }
        let results = futures::future::join_all(missing.iter().map(
            |(key, spec)| async move {
                (spec.fetch)(self, request, Self::element_id(key)).await
            },
        ))
        .await;
        for ((key, _), result) in missing.into_iter().zip(results) {
            match result {
                Ok(element) => {
                    elements.insert(key, element);
                }
                Err(err) => {
                    warn!("error fetching [{key}]: {err}");
                    match &err {
                        ProxyError::Timeout { .. } => {
                            self.page_failures
                                .lock()
                                .insert(key.clone(), FetchFailure::Timeout);
                        }
                        ProxyError::OriginFailure(reason) => {
                            self.page_failures.lock().insert(
                                key.clone(),
                                FetchFailure::Origin(reason.clone()),
                            );
                        }
                        ProxyError::BackendUnavailable(_) => {
                            self.mailer.error(err.to_string());
                        }
                        _ => {}
                    }
                    elements.insert(key, Some(Element::Map(HashMap::new())));
                }
            }
        }
    }

    // ---- page ----

    /// The page key for `request`, salted by language, A/B cohort, and
    /// the cookies the response declared it varies on.
    pub fn hash_page(
        &self,
        request: &Message,
        cookies: &[String],
        abdependency: &[String],
        abvalue: &HashMap<String, String>,
    ) -> String {
        let host = request
            .header("x-real-host")
            .or_else(|| request.header("host"))
            .unwrap_or("");
        let mut key =
            format!("page_{host}{}", request.uri.trim_end_matches('?'));
        if self.config.hash_lang_header {
            let header = request
                .header("accept-language")
                .unwrap_or(self.config.hash_lang_default.as_str());
            let lang = normalize_lang(header);
            if !lang.is_empty() {
                key.push_str("//");
                key.push_str(&lang);
            }
        }
        if !abdependency.is_empty() {
            key.push_str("//");
            key.push_str(&AbEngine::salt(abdependency, abvalue));
        }
        if !cookies.is_empty() {
            let found: Vec<String> = cookies
                .iter()
                .filter(|name| !name.is_empty())
                .filter_map(|name| {
                    request.cookie(name).map(|value| format!("{name}={value}"))
                })
                .collect();
            if !found.is_empty() {
                key.push_str("//");
                key.push_str(&found.join(","));
            }
        }
        debug!("hashed page {key}");
        key
    }

    fn hash_page_plain(&self, request: &Message, _id: &str) -> String {
        self.hash_page(request, &[], &[], &HashMap::new())
    }

    /// Joins the in-flight fetch for `key`, or installs a new one.
    ///
    /// At most one origin fetch runs per page key: the first caller
    /// installs a shared future, every later caller awaits the same one.
    /// The future removes its own registry entry as soon as the origin
    /// exchange settles, success or not.
    pub fn fetch_page(&self, request: &Message, key: &str) -> PageFuture {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(key) {
            return existing.clone();
        }
        let future = self.install_fetch(request, key);
        pending.insert(key.to_string(), future.clone());
        future
    }

    /// Kicks off a background refresh for `key` unless one is already
    /// pending, in which case the caller simply drops out.
    pub fn refresh_page(&self, request: &Message, key: &str) {
        let future = {
            let mut pending = self.pending.lock();
            if pending.contains_key(key) {
                debug!("request is already pending for {}", request.uri);
                return;
            }
            let future = self.install_fetch(request, key);
            pending.insert(key.to_string(), future.clone());
            future
        };
        tokio::spawn(async move {
            let _ = future.await;
        });
    }

    fn install_fetch(&self, request: &Message, key: &str) -> PageFuture {
        let mut outbound = request.clone();
        outbound.remove_header("cache-control");
        outbound.set_header(&self.config.loop_header, "true");
        let store = self.arc();
        let snapshot = request.clone();
        let registry_key = key.to_string();
        async move {
            let result = store.origin.fetch(outbound).await;
            store.pending.lock().remove(&registry_key);
            match result {
                Ok(response) => {
                    Ok(store.extract_page(response, &snapshot).await)
                }
                Err(failure) => {
                    warn!(
                        "could not retrieve [{}]: {failure:?}",
                        snapshot.uri.trim_end_matches('?')
                    );
                    Err(failure)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch_page_element(
        &self,
        request: &Message,
        id: &str,
    ) -> Result<Option<Element>> {
        let key = format!("page_{id}");
        match self.fetch_page(request, &key).await {
            Ok(entry) => Ok(Some(Element::Page(entry))),
            Err(failure) => Err(failure
                .into_error(&request.uri, self.origin.timeout_seconds())),
        }
    }

    /// Applies the cache-decision table to a fresh origin response and
    /// stores what qualifies.
    async fn extract_page(
        &self,
        mut response: Message,
        request: &Message,
    ) -> PageEntry {
        let cookies = parse_list(response.header(&self.config.cookies_header));
        let abvalue = parse_cohort(request.header(&self.config.abvalue_header));
        let abdependency =
            parse_list(response.header(&self.config.abdependency_header));
        let key = self.hash_page(request, &cookies, &abdependency, &abvalue);

        let base = request.uri.trim_end_matches('?').to_string();
        {
            let mut variants = self.variants.lock();
            let known = variants.entry(base.clone()).or_default();
            if !known.contains(&key) {
                debug!("added new variant for {base}: {key}");
                known.push(key.clone());
            }
        }

        let method = request.method.to_ascii_uppercase();
        let (cacheable, cache_control) =
            if UNCACHEABLE_METHODS.contains(&method.as_str()) {
                info!("NO-CACHE (method is {method}) [{key}]");
                (false, 0)
            } else {
                cache_decision(
                    response.status,
                    response.max_age(&self.config.cache_header),
                    &key,
                )
            };

        if cacheable {
            // never replay origin cookies out of a shared cache slot
            response.cookies.clear();
        }
        let entry = PageEntry {
            response,
            rendered_on: self.clock.now(),
            cache_control,
        };
        if cacheable {
            self.cache_set(
                HashMap::from([(key, Element::Page(entry.clone()))]),
                cache_control * 10,
            )
            .await;
        }
        if !abdependency.is_empty() {
            let dependency_key = self.element_hash(request, "abdependency", "");
            self.cache_set(
                HashMap::from([(dependency_key, Element::List(abdependency))]),
                cache_control * 10,
            )
            .await;
        }
        entry
    }

    async fn cache_set(&self, entries: HashMap<String, Element>, ttl: u64) {
        if let Err(err) = self.cache.set(entries, ttl).await {
            self.mailer.error(format!("cache write failed: {err}"));
        }
    }

    /// Decides whether a cached page may be served.
    ///
    /// Hard-stale copies are refused outright. Soft-stale copies are
    /// served, but first the stored entry gets 30 extra seconds and a
    /// 60-second rewrite under the cookie-salted key while a background
    /// refresh runs. Mutating methods never serve from cache.
    fn valid_page(
        store: &DataStore,
        request: &Message,
        id: &str,
        element: &Element,
    ) -> bool {
        let Some(entry) = element.as_page() else {
            return false;
        };
        let now = store.clock.now();
        if now > entry.rendered_on + (entry.cache_control * 3) as f64 {
            info!("STALE-HARD [{id}]");
            return false;
        }
        if now > entry.rendered_on + entry.cache_control as f64 {
            info!("STALE-SOFT [{id}]");
            let cookies =
                parse_list(entry.response.header(&store.config.cookies_header));
            let rewrite_key =
                store.hash_page(request, &cookies, &[], &HashMap::new());
            let (cacheable, cache_control) = cache_decision(
                entry.response.status,
                entry.response.max_age(&store.config.cache_header),
                &rewrite_key,
            );
            if cacheable {
                let mut extended = entry.clone();
                extended.rendered_on += 30.0;
                extended.cache_control = cache_control;
                let rewriter = store.arc();
                tokio::spawn(async move {
                    rewriter
                        .cache_set(
                            HashMap::from([(
                                rewrite_key,
                                Element::Page(extended),
                            )]),
                            60,
                        )
                        .await;
                });
            }
            store.refresh_page(request, &format!("page_{id}"));
            return true;
        }
        if UNCACHEABLE_METHODS
            .contains(&request.method.to_ascii_uppercase().as_str())
        {
            info!("PASS-THROUGH [{}]", request.method.to_ascii_uppercase());
            return false;
        }
        true
    }

    // ---- expiration / abdependency / geo / ip ----

    fn hash_expiration(&self, request: &Message, _id: &str) -> String {
        format!("expiration_{}", request.uri.trim_end_matches('?'))
    }

    fn hash_abdependency(&self, request: &Message, _id: &str) -> String {
        format!("abdependency_{}", request.uri.trim_end_matches('?'))
    }

    fn hash_geo(&self, _request: &Message, id: &str) -> String {
        format!("geo_{id}")
    }

    fn hash_ip(&self, _request: &Message, id: &str) -> String {
        format!("ip_{id}")
    }

    async fn fetch_nothing(
        &self,
        _request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        Ok(None)
    }

    // ---- abvalue ----

    fn hash_abvalue(&self, request: &Message, _id: &str) -> String {
        format!(
            "abvalue_{}",
            request.cookie(&self.config.ab_cookie).unwrap_or_default()
        )
    }

    /// Reads the cohort from durable storage, assigns buckets for any new
    /// tests, mirrors the result locally for five minutes, and re-persists
    /// when something changed.
    async fn fetch_abvalue(
        &self,
        request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        let key = self.hash_abvalue(request, "");
        debug!("looking up ab group: {key}");
        let mut cohort: HashMap<String, String> =
            match self.viewdb.get(&key).await {
                Ok(Some(raw)) => serde_json::from_slice(&raw)
                    .unwrap_or_else(|err| {
                        warn!(%err, "discarding undecodable cohort blob");
                        HashMap::new()
                    }),
                Ok(None) => HashMap::new(),
                Err(err) => {
                    warn!(%err, "durable cohort store unreachable");
                    HashMap::new()
                }
            };
        let updated = self.ab.assign(&mut cohort);
        self.cache_set(
            HashMap::from([(key.clone(), Element::Map(cohort.clone()))]),
            300,
        )
        .await;
        if updated {
            if let Err(err) =
                self.viewdb.set(&key, serde_json::to_vec(&cohort)?, 0).await
            {
                warn!(%err, "could not persist cohort");
            }
        }
        debug!("extracted abvalue {cohort:?}");
        Ok(Some(Element::Map(cohort)))
    }

    // ---- session family ----

    fn read_session(&self, request: &Message) -> String {
        let raw =
            request.cookie(&self.config.session_cookie).unwrap_or_default();
        urlencoding::decode(&raw)
            .map(|decoded| decoded.into_owned())
            .unwrap_or(raw)
    }

    fn hash_session(&self, request: &Message, _id: &str) -> String {
        let id = self.read_session(request);
        if id.is_empty() {
            String::new()
        } else {
            format!("session_{id}")
        }
    }

    async fn fetch_session(
        &self,
        request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        let id = self.read_session(request);
        let fields = self.sessions.lookup(&id).await?;
        let key = self.hash_session(request, "");
        if !key.is_empty() {
            self.cache_set(
                HashMap::from([(key, Element::Map(fields.clone()))]),
                86_400,
            )
            .await;
        }
        Ok(Some(Element::Map(fields)))
    }

    fn hash_unread(&self, request: &Message, _id: &str) -> String {
        format!("unread_{}", self.read_session(request))
    }

    async fn fetch_unread(
        &self,
        request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        let session = self.read_session(request);
        let count = match self.viewdb.get(&format!("unread{session}")).await? {
            Some(raw) => String::from_utf8_lossy(&raw).into_owned(),
            None => "0".to_string(),
        };
        let output = HashMap::from([("count".to_string(), count)]);
        let key = self.hash_unread(request, "");
        self.cache_set(HashMap::from([(key, Element::Map(output.clone()))]), 60)
            .await;
        Ok(Some(Element::Map(output)))
    }

    fn hash_favorite(&self, request: &Message, _id: &str) -> String {
        format!("favorite_{}", self.read_session(request))
    }

    async fn fetch_favorite(
        &self,
        request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        self.fetch_session_kv_map(request, "favorite").await
    }

    fn hash_subscription(&self, request: &Message, _id: &str) -> String {
        format!("subscription_{}", self.read_session(request))
    }

    async fn fetch_subscription(
        &self,
        request: &Message,
        _id: &str,
    ) -> Result<Option<Element>> {
        self.fetch_session_kv_map(request, "subscription").await
    }

    async fn fetch_session_kv_map(
        &self,
        request: &Message,
        kind: &str,
    ) -> Result<Option<Element>> {
        let session = self.read_session(request);
        let fields: HashMap<String, String> =
            match self.viewdb.get(&format!("{kind}{session}")).await? {
                Some(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
                None => HashMap::new(),
            };
        let key = format!("{kind}_{session}");
        self.cache_set(HashMap::from([(key, Element::Map(fields.clone()))]), 60)
            .await;
        Ok(Some(Element::Map(fields)))
    }

    // ---- key-value reads ----

    fn hash_memcache(&self, _request: &Message, id: &str) -> String {
        format!("memcache_{id}")
    }

    async fn fetch_memcache(
        &self,
        _request: &Message,
        id: &str,
    ) -> Result<Option<Element>> {
        let Some(raw) = self.kv.get(id).await? else {
            return Ok(None);
        };
        let value = String::from_utf8_lossy(&raw).into_owned();
        self.cache_set(
            HashMap::from([(
                format!("memcache_{id}"),
                Element::Text(value.clone()),
            )]),
            30,
        )
        .await;
        Ok(Some(Element::Text(value)))
    }

    fn hash_viewdb(&self, _request: &Message, id: &str) -> String {
        format!("viewdb_{id}")
    }

    async fn fetch_viewdb(
        &self,
        _request: &Message,
        id: &str,
    ) -> Result<Option<Element>> {
        let Some(raw) = self.viewdb.get(id).await? else {
            return Ok(None);
        };
        let value = String::from_utf8_lossy(&raw).into_owned();
        self.cache_set(
            HashMap::from([(
                format!("viewdb_{id}"),
                Element::Text(value.clone()),
            )]),
            30,
        )
        .await;
        Ok(Some(Element::Text(value)))
    }
}

/// The cache-decision table for a non-mutating response.
fn cache_decision(status: u16, max_age: Option<u64>, key: &str) -> (bool, u64) {
    let cache_control = max_age.unwrap_or(0);
    if UNCACHEABLE_STATUS.contains(&status) {
        info!("NO-CACHE (status is {status}) [{key}]");
        (false, cache_control)
    } else if SHORT_STATUS.contains(&status) {
        info!("SHORT-CACHE (status is {status}) [{key}]");
        (true, SHORT_TTL)
    } else if cache_control > 0 {
        info!("CACHE [{key}] (for {cache_control}s)");
        (true, cache_control)
    } else {
        info!("NO-CACHE (no cache data) [{key}]");
        (false, cache_control)
    }
}

pub(crate) fn normalize_lang(header: &str) -> String {
    header
        .replace(' ', "")
        .split(';')
        .next()
        .unwrap_or("")
        .split(',')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_never_contain_the_separator() {
        for spec in REGISTRY {
            assert!(!spec.name.contains('_'), "{} has a _", spec.name);
        }
    }

    #[test]
    fn keys_split_on_the_first_separator_only() {
        assert_eq!(DataStore::element_kind("page_www/a//en-us"), "page");
        assert_eq!(DataStore::element_id("page_www/a//en-us"), "www/a//en-us");
        assert_eq!(DataStore::element_id("session_a_b"), "a_b");
    }

    #[test]
    fn list_headers_drop_empties_and_sort() {
        assert_eq!(parse_list(None), Vec::<String>::new());
        assert_eq!(parse_list(Some("")), Vec::<String>::new());
        assert_eq!(
            parse_list(Some("zeta, alpha,,beta")),
            vec!["alpha", "beta", "zeta"]
        );
    }

    #[test]
    fn cohort_headers_round_trip() {
        let cohort = parse_cohort(Some("color:red,shape:round"));
        assert_eq!(cohort["color"], "red");
        assert_eq!(AbEngine::cohort_header(&cohort), "color:red,shape:round");
        assert!(parse_cohort(None).is_empty());
    }

    #[test]
    fn decision_table_matches_the_contract() {
        assert_eq!(cache_decision(500, Some(60), "k"), (false, 60));
        assert_eq!(cache_decision(304, Some(60), "k"), (false, 60));
        assert_eq!(cache_decision(404, None, "k"), (true, SHORT_TTL));
        assert_eq!(cache_decision(200, Some(60), "k"), (true, 60));
        assert_eq!(cache_decision(200, None, "k"), (false, 0));
        assert_eq!(cache_decision(200, Some(0), "k"), (false, 0));
    }

    #[test]
    fn languages_normalize() {
        assert_eq!(normalize_lang("fr-FR,fr;q=0.9"), "fr-fr");
        assert_eq!(normalize_lang("EN-us"), "en-us");
        assert_eq!(normalize_lang(" pt-BR , pt;q=0.8"), "pt-br");
    }
}
