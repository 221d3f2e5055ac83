//! The request pipeline.
//!
//! Stages per request, strictly ordered: early admissions (purge,
//! introspection endpoints, language redirect), normalization, the
//! prefetch barrier, the page fetch with keying verification, the body
//! scan, the dependency batch, and the render.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::ab::AbEngine;
use crate::backend::{Element, PageEntry};
use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::{FetchFailure, Result};
use crate::lookup::{GeoLookup, GeoResolver, IpLookup};
use crate::mail::Mailer;
use crate::message::{Message, UNCACHEABLE_METHODS};
use crate::store::{parse_list, DataStore};
use crate::template::{
    RenderContext, Templater, HASH_FETCH_TARGETS, KEY_FETCH_TARGETS,
    REQUEST_TARGETS, SESSION_TARGETS,
};
use crate::uniques::Uniques;

/// Languages eligible for the hostname redirect.
pub const LANGUAGES: [&str; 19] = [
    "en", "ko", "hi", "ma", "ca", "de", "es", "fr", "it", "nl", "pt", "pt-br",
    "sk", "tl", "vi", "ar", "ru", "zh-cn", "zh-tw",
];

type Elements = HashMap<String, Option<Element>>;

fn find_prefix<'a>(
    elements: &'a Elements,
    prefix: &str,
) -> Option<(&'a str, &'a Option<Element>)> {
    elements
        .iter()
        .find(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.as_str(), value))
}

fn prefix_map(elements: &Elements, prefix: &str) -> HashMap<String, String> {
    match find_prefix(elements, prefix) {
        Some((_, Some(Element::Map(map)))) => map.clone(),
        _ => HashMap::new(),
    }
}

fn prefix_list(elements: &Elements, prefix: &str) -> Vec<String> {
    match find_prefix(elements, prefix) {
        Some((_, Some(Element::List(list)))) => list.clone(),
        _ => Vec::new(),
    }
}

fn find_page(elements: &Elements) -> Option<(String, Option<&PageEntry>)> {
    find_prefix(elements, "page_").map(|(key, value)| {
        (key.to_string(), value.as_ref().and_then(Element::as_page))
    })
}

/// The per-request stage machine.
///
/// One instance serves the whole process: admissions and purges, the
/// prefetch barrier, page fetching with keying verification, the body
/// scan, and the final render. All shared mutable state lives in the
/// fields, not in globals.
pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<DataStore>,
    uniques: Arc<Uniques>,
    geo: Arc<dyn GeoResolver>,
    clock: Arc<dyn TimeSource>,
    mailer: Mailer,
    templater: Templater,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wires the pipeline; fails only when the template pattern does not
    /// compile.
    pub fn new(
        config: Arc<Config>,
        store: Arc<DataStore>,
        uniques: Arc<Uniques>,
        geo: Arc<dyn GeoResolver>,
        clock: Arc<dyn TimeSource>,
        mailer: Mailer,
    ) -> Result<Self> {
        let templater = Templater::new(&config.template_regex)?;
        Ok(Self { config, store, uniques, geo, clock, mailer, templater })
    }

    /// Serves one request, producing the response to emit.
    pub async fn handle(&self, mut request: Message, peer: &str) -> Message {
        if request.header(&self.config.purge_header).is_some() {
            return self.purge(&request).await;
        }

        self.uniques.record(&request.client_ip(peer));

        if request.uri.contains(&self.config.uniques_path) {
            let mut response = Message::response(200);
            response.body = self.uniques.list().into_bytes();
            return response;
        }
        if request.uri.contains(&self.config.time_path) {
            let mut response = Message::response(200);
            response.body = self.clock.now().to_string().into_bytes();
            return response;
        }
        if let Some(location) = self.language_redirect(&request) {
            info!("REDIRECT: {} -> {location}", request.uri);
            let mut response = Message::response(302);
            response.set_header("location", location);
            return response;
        }

        // normalize: pin the host the origin sees, attach the country
        let host = if self.config.rewrite_host.is_empty() {
            request.header("x-real-host").map(str::to_string)
        } else {
            Some(self.config.rewrite_host.clone())
        };
        if let Some(host) = host {
            request.set_header("host", host);
        }
        let country =
            GeoLookup::new(self.geo.clone(), &request, peer).get("ip");
        if !country.is_empty() {
            request.set_header("x-geo", country);
        }

        // the ab identity must exist before any abvalue key is hashed
        self.store.ab.ensure_cookie(&mut request);

        // prefetch barrier
        let mut keys = vec![
            self.store.element_hash(&request, "expiration", ""),
            self.store.element_hash(&request, "abvalue", ""),
            self.store.element_hash(&request, "abdependency", ""),
        ];
        let session_key = self.store.element_hash(&request, "session", "");
        if !session_key.is_empty() {
            keys.push(session_key);
        }
        info!("PREFETCH: {keys:?}");
        let elements = self.store.get(keys, &request, false).await;

        self.get_page(request, elements, peer).await
    }

    /// Echoes the cohort to the origin, computes the page key, fetches.
    async fn get_page(
        &self,
        mut request: Message,
        mut elements: Elements,
        peer: &str,
    ) -> Message {
        let abvalue = prefix_map(&elements, "abvalue_");
        let header_value = AbEngine::cohort_header(&abvalue);
        debug!(
            "saving abvalue header {}: {header_value:?}",
            self.config.abvalue_header
        );
        request.set_header(&self.config.abvalue_header, header_value);

        let abdependency = prefix_list(&elements, "abdependency_");
        let page_key =
            self.store.hash_page(&request, &[], &abdependency, &abvalue);
        let fetched =
            self.store.get(vec![page_key], &request, false).await;
        elements.extend(fetched);

        self.check_page(request, elements, peer).await
    }

    /// Verifies the fetched copy is keyed correctly and not purged.
    ///
    /// A response that declares key-changing cookies is refetched under
    /// the corrected key; a copy rendered before the expiration sentinel
    /// is refetched with the cache skipped.
    async fn check_page(
        &self,
        request: Message,
        mut elements: Elements,
        peer: &str,
    ) -> Message {
        loop {
            let Some((page_key, entry)) = find_page(&elements) else {
                return self.page_failure(None);
            };
            let Some(entry) = entry else {
                return self.page_failure(Some(&page_key));
            };

            let cookies =
                parse_list(entry.response.header(&self.config.cookies_header));
            let abdependency = prefix_list(&elements, "abdependency_");
            let abvalue = prefix_map(&elements, "abvalue_");
            let salted = self.store.hash_page(
                &request,
                &cookies,
                &abdependency,
                &abvalue,
            );
            let plain =
                self.store.hash_page(&request, &[], &abdependency, &abvalue);

            if salted != plain {
                // wrong variant: chase the cookie-salted key instead
                elements.remove(&page_key);
                let fetched =
                    self.store.get(vec![salted], &request, false).await;
                elements.extend(fetched);
                return self.scan_page(request, elements, peer).await;
            }

            let expired = find_prefix(&elements, "expiration_")
                .and_then(|(_, value)| value.as_ref())
                .and_then(Element::as_stamp)
                .filter(|stamp| *stamp > 0.0)
                .is_some_and(|stamp| entry.rendered_on < stamp);
            if expired {
                info!("EXPIRED: refetching {}", request.uri);
                elements.remove(&page_key);
                let fetched =
                    self.store.get(vec![plain], &request, true).await;
                elements.extend(fetched);
                continue;
            }

            return self.scan_page(request, elements, peer).await;
        }
    }

    /// Scans the body for directives and batch-fetches whatever data
    /// they need that is not already loaded.
    async fn scan_page(
        &self,
        request: Message,
        mut elements: Elements,
        peer: &str,
    ) -> Message {
        let Some((page_key, entry)) = find_page(&elements) else {
            return self.page_failure(None);
        };
        let Some(entry) = entry else {
            return self.page_failure(Some(&page_key));
        };
        let logged_in =
            elements.keys().any(|key| key.starts_with("session_"));
        let body = String::from_utf8_lossy(&entry.response.body).into_owned();

        let mut missing: Vec<String> = Vec::new();
        for expression in self.templater.scan(&body) {
            let mut parts = expression.split_whitespace();
            let (Some(_command), Some(target), Some(id)) =
                (parts.next(), parts.next(), parts.next())
            else {
                self.mailer.error(format!(
                    "could not parse expression: [{expression}]"
                ));
                continue;
            };
            let target = target.to_ascii_lowercase();
            if REQUEST_TARGETS.contains(&target.as_str()) {
                continue;
            }
            if KEY_FETCH_TARGETS.contains(&target.as_str())
                || HASH_FETCH_TARGETS.contains(&target.as_str())
                || logged_in
            {
                let key = self.store.element_hash(&request, &target, id);
                if !key.is_empty()
                    && !elements.contains_key(&key)
                    && !missing.contains(&key)
                {
                    missing.push(key);
                }
            }
        }
        if !missing.is_empty() {
            info!("fetching missing keys {missing:?}");
            let fetched = self.store.get(missing, &request, false).await;
            elements.extend(fetched);
        }

        self.render_page(request, elements, peer).await
    }

    /// Substitutes directives and emits the final response.
    async fn render_page(
        &self,
        request: Message,
        elements: Elements,
        peer: &str,
    ) -> Message {
        let Some((page_key, entry)) = find_page(&elements) else {
            return self.page_failure(None);
        };
        let Some(entry) = entry else {
            return self.page_failure(Some(&page_key));
        };
        let entry = entry.clone();

        let mut dicts: HashMap<String, HashMap<String, String>> =
            HashMap::new();
        dicts.insert(
            "page".to_string(),
            HashMap::from([
                ("rendered_on".to_string(), entry.rendered_on.to_string()),
                (
                    "cache_control".to_string(),
                    entry.cache_control.to_string(),
                ),
            ]),
        );
        for target in SESSION_TARGETS {
            dicts.insert(
                target.to_string(),
                prefix_map(&elements, &format!("{target}_")),
            );
        }
        for target in HASH_FETCH_TARGETS {
            dicts.insert(
                target.to_string(),
                prefix_map(&elements, &format!("{target}_")),
            );
        }
        for target in KEY_FETCH_TARGETS {
            let prefix = format!("{target}_");
            let map: HashMap<String, String> = elements
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .filter_map(|(key, value)| {
                    value
                        .as_ref()
                        .and_then(Element::as_text)
                        .map(|text| {
                            (
                                DataStore::element_id(key).to_string(),
                                text.to_string(),
                            )
                        })
                })
                .collect();
            dicts.insert(target.to_string(), map);
        }

        let mut response = entry.response.clone();
        let mut ctx = RenderContext {
            dicts,
            geo: GeoLookup::new(self.geo.clone(), &request, peer),
            ip: IpLookup::new(&request, peer),
            store: &self.store,
            mailer: &self.mailer,
        };
        let body = self
            .templater
            .render(&String::from_utf8_lossy(&response.body), &mut ctx);

        let app_server = response
            .header("x-app-server")
            .unwrap_or("unknown")
            .trim()
            .to_string();
        let elapsed = request
            .received_on
            .map(|arrived| arrived.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        info!(
            "RENDER {} [{}] ({elapsed:.3}s from {app_server})",
            response.status, request.uri
        );

        response.set_header("connection", "close");
        response.set_header(
            "via",
            format!(
                "{} {} {}:{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                self.config.hostname,
                self.config.port
            ),
        );
        let country = ctx.geo.get("ip");
        if !country.is_empty() {
            response.set_header("x-geo", country);
        }
        if self.store.ab.is_new_cookie(&request) {
            if let Some(id) = request.cookie(&self.config.ab_cookie) {
                response.add_cookie(&self.config.ab_cookie, &id);
            }
        }
        for header in [
            &self.config.cache_header,
            &self.config.loop_header,
            &self.config.cookies_header,
            &self.config.abdependency_header,
        ] {
            response.remove_header(header);
        }
        response.remove_header("x-app-server");
        response.body = body.into_bytes();
        response
    }

    fn page_failure(&self, page_key: Option<&str>) -> Message {
        let failure =
            page_key.and_then(|key| self.store.take_page_failure(key));
        match failure {
            Some(FetchFailure::Origin(_)) => Message::response(502),
            _ => {
                let mut response = Message::response(408);
                response.body = b"Request timed out.".to_vec();
                response
            }
        }
    }

    /// The purge channel: invalidation instead of serving.
    async fn purge(&self, request: &Message) -> Message {
        let uri = request.uri.as_str();
        let kind = request
            .header(&self.config.purge_header)
            .unwrap_or("")
            .to_ascii_lowercase();
        info!("expire type: {kind}, arg: {uri}");
        let trimmed = uri.strip_prefix('/').unwrap_or(uri);
        match kind.as_str() {
            "*" => {
                self.store.flush().await;
                info!("cleared entire cache");
            }
            "url" => {
                self.store.set_expiration(request).await;
                info!("expired all variants of {uri}");
            }
            "session" => {
                let keys: Vec<String> = SESSION_TARGETS
                    .iter()
                    .map(|target| format!("{target}_{trimmed}"))
                    .collect();
                self.store.delete(&keys).await;
                info!("deleted session-related keys: {keys:?}");
            }
            other => {
                let key = format!("{other}_{trimmed}");
                self.store.delete(std::slice::from_ref(&key)).await;
                info!("deleted {key}");
            }
        }
        let mut response = Message::response(200);
        response.body = format!("Expired {kind}_{uri}").into_bytes();
        response
    }

    /// A 302 to the language-prefixed host, when one applies.
    fn language_redirect(&self, request: &Message) -> Option<String> {
        let normalized =
            crate::store::normalize_lang(request.header("accept-language")?);
        // full tags like pt-br match directly; otherwise fall back to the
        // primary subtag so fr-FR still lands on fr
        let lang = if LANGUAGES.contains(&normalized.as_str()) {
            normalized
        } else {
            normalized.split('-').next().unwrap_or("").to_string()
        };
        let host = request.header("x-real-host")?;
        if host.split('.').next() != Some(self.config.default_host.as_str()) {
            return None;
        }
        if lang == "en" || !LANGUAGES.contains(&lang.as_str()) {
            return None;
        }
        if UNCACHEABLE_METHODS
            .contains(&request.method.to_ascii_uppercase().as_str())
        {
            return None;
        }
        let base = host.splitn(2, '.').nth(1)?;
        Some(format!("http://{lang}.{base}{}", request.uri))
    }
}
