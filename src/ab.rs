//! A/B testing: the cohort engine.
//!
//! Visitors get a stable identity cookie; each identity gets a bucket per
//! test, drawn from configured weights and persisted so the draw never
//! repeats. Pages that vary by test carry the cohort in their cache key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::message::Message;

/// Where the test catalog comes from.
///
/// Rows are `(test_name, "label:weight,label:weight")`, the shape of the
/// grouping table in the relational store (which itself lives outside
/// this crate).
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync + 'static {
    /// Loads the current rows.
    async fn load(&self) -> Result<Vec<(String, String)>>;
}

/// A fixed catalog for tests and development.
#[derive(Debug, Default)]
pub struct StaticCatalog(Vec<(String, String)>);

impl StaticCatalog {
    /// Builds the catalog from `(test, values_list)` pairs.
    pub fn new<I, S>(rows: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self(rows.into_iter().map(|(t, v)| (t.into(), v.into())).collect())
    }
}

#[async_trait::async_trait]
impl CatalogSource for StaticCatalog {
    async fn load(&self) -> Result<Vec<(String, String)>> {
        Ok(self.0.clone())
    }
}

/// Cohort assignment and page-key salting.
///
/// Holds the process-wide test catalog (refreshed every minute) and the
/// cookie machinery that gives every visitor a stable A/B identity.
pub struct AbEngine {
    config: Arc<Config>,
    source: Arc<dyn CatalogSource>,
    catalog: RwLock<HashMap<String, Vec<(String, f64)>>>,
}

impl std::fmt::Debug for AbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbEngine")
            .field("tests", &self.catalog.read().len())
            .finish_non_exhaustive()
    }
}

/// How often the catalog is re-read.
pub const CATALOG_REFRESH: Duration = Duration::from_secs(60);

impl AbEngine {
    /// Creates an engine with an empty catalog; call [`AbEngine::refresh`]
    /// (or spawn [`AbEngine::refresh_loop`]) to populate it.
    pub fn new(config: Arc<Config>, source: Arc<dyn CatalogSource>) -> Self {
        Self { config, source, catalog: RwLock::new(HashMap::new()) }
    }

    /// Atomically replaces the catalog from the source.
    ///
    /// Rows that do not parse are skipped with a warning.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self.source.load().await?;
        let mut catalog = HashMap::with_capacity(rows.len());
        for (test_name, values_list) in rows {
            match parse_buckets(&values_list) {
                Some(buckets) => {
                    catalog.insert(test_name, buckets);
                }
                None => {
                    warn!(%test_name, %values_list, "skipping unparsable test row")
                }
            }
        }
        debug!(tests = catalog.len(), "refreshed test catalog");
        *self.catalog.write() = catalog;
        Ok(())
    }

    /// Refreshes forever on the catalog interval.
    pub async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CATALOG_REFRESH);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                warn!(%err, "test catalog refresh failed");
            }
        }
    }

    /// The A/B identity of this request.
    ///
    /// Reads the configured cookie; when absent, mints a 25-character
    /// alphanumeric id, sets it on the request, and marks the transient
    /// new-cookie flag so the response writer emits a `set-cookie`.
    pub fn ensure_cookie(&self, request: &mut Message) -> String {
        if let Some(id) = request.cookie(&self.config.ab_cookie) {
            if !id.is_empty() {
                return id;
            }
        }
        let id = generate_id();
        debug!(%id, "generating new ab cookie");
        request.add_cookie(&self.config.ab_cookie, &id);
        request.add_cookie(&self.config.new_ab_cookie, "true");
        id
    }

    /// Whether this request was just issued its identity.
    pub fn is_new_cookie(&self, request: &Message) -> bool {
        request.cookie(&self.config.new_ab_cookie).as_deref() == Some("true")
    }

    /// Assigns a bucket for every cataloged test missing from `cohort`.
    /// Answers whether anything was assigned (and so needs re-persisting).
    pub fn assign(&self, cohort: &mut HashMap<String, String>) -> bool {
        let catalog = self.catalog.read();
        let mut updated = false;
        for (test_name, buckets) in catalog.iter() {
            if !cohort.contains_key(test_name) {
                cohort.insert(test_name.clone(), pick_bucket(buckets));
                updated = true;
            }
        }
        updated
    }

    /// The page-key salt for `dependencies` under `cohort`:
    /// `test:label` pairs joined by commas, in dependency order.
    pub fn salt(
        dependencies: &[String],
        cohort: &HashMap<String, String>,
    ) -> String {
        dependencies
            .iter()
            .map(|test| {
                format!(
                    "{test}:{}",
                    cohort.get(test).map(String::as_str).unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Serializes a cohort for the origin echo header, sorted for
    /// determinism.
    pub fn cohort_header(cohort: &HashMap<String, String>) -> String {
        let mut pairs: Vec<String> =
            cohort.iter().map(|(test, label)| format!("{test}:{label}")).collect();
        pairs.sort();
        pairs.join(",")
    }
}

fn parse_buckets(values_list: &str) -> Option<Vec<(String, f64)>> {
    let mut buckets = Vec::new();
    for item in values_list.split(',') {
        let (label, weight) = item.split_once(':')?;
        buckets.push((label.to_string(), weight.trim().parse().ok()?));
    }
    if buckets.is_empty() {
        None
    } else {
        Some(buckets)
    }
}

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(25)
        .map(char::from)
        .collect()
}

/// Weighted random choice over `(label, weight)` buckets.
///
/// Draws `n` uniformly over the total weight and walks the list
/// subtracting; on numeric underrun the last bucket examined wins, so
/// the tail is always reachable.
fn pick_bucket(buckets: &[(String, f64)]) -> String {
    let total: f64 = buckets.iter().map(|(_, weight)| weight).sum();
    let mut n = total * rand::thread_rng().gen::<f64>();
    let mut chosen = "";
    for (label, weight) in buckets {
        chosen = label.as_str();
        if n < *weight {
            return chosen.to_string();
        }
        n -= weight;
    }
    chosen.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rows: Vec<(&str, &str)>) -> AbEngine {
        AbEngine::new(
            Arc::new(Config::default()),
            Arc::new(StaticCatalog::new(rows)),
        )
    }

    #[tokio::test]
    async fn refresh_skips_bad_rows() {
        let ab = engine(vec![
            ("color", "red:1,blue:3"),
            ("broken", "no-weights-here"),
        ]);
        ab.refresh().await.unwrap();
        let mut cohort = HashMap::new();
        assert!(ab.assign(&mut cohort));
        assert_eq!(cohort.len(), 1);
        assert!(cohort.contains_key("color"));
    }

    #[tokio::test]
    async fn assignment_converges_to_weights() {
        let ab = engine(vec![("color", "red:1,blue:3")]);
        ab.refresh().await.unwrap();
        let draws = 20_000;
        let mut blue = 0;
        for _ in 0..draws {
            let mut cohort = HashMap::new();
            ab.assign(&mut cohort);
            if cohort["color"] == "blue" {
                blue += 1;
            }
        }
        let ratio = blue as f64 / draws as f64;
        assert!((ratio - 0.75).abs() < 0.03, "blue ratio was {ratio}");
    }

    #[test]
    fn tail_bucket_is_reachable_on_underrun() {
        // all the mass on the tail: every draw must land there
        let buckets =
            vec![("a".to_string(), 0.0), ("b".to_string(), 0.0), ("c".to_string(), 1.0)];
        for _ in 0..100 {
            assert_eq!(pick_bucket(&buckets), "c");
        }
    }

    #[test]
    fn new_cookie_is_25_alphanumerics_and_marked() {
        let ab = engine(vec![]);
        let mut request = Message::request("GET", "/");
        let id = ab.ensure_cookie(&mut request);
        assert_eq!(id.len(), 25);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(ab.is_new_cookie(&request));
        // a second read sees the same identity without re-marking
        let again = ab.ensure_cookie(&mut request);
        assert_eq!(id, again);
    }

    #[test]
    fn existing_cookie_is_reused() {
        let ab = engine(vec![]);
        let mut request = Message::request("GET", "/");
        request.cookies.push("abid=stable12345".to_string());
        assert_eq!(ab.ensure_cookie(&mut request), "stable12345");
        assert!(!ab.is_new_cookie(&request));
    }

    #[test]
    fn salt_joins_dependencies_in_order() {
        let cohort = HashMap::from([
            ("color".to_string(), "red".to_string()),
            ("shape".to_string(), "round".to_string()),
        ]);
        let deps = vec!["color".to_string(), "layout".to_string()];
        assert_eq!(AbEngine::salt(&deps, &cohort), "color:red,layout:");
        assert_eq!(
            AbEngine::cohort_header(&cohort),
            "color:red,shape:round"
        );
    }
}
