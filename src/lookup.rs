//! Late-binding geo and client-address lookups.
//!
//! These pose as dictionaries for the templating layer but compute on
//! demand, once per request.

use std::collections::HashMap;
use std::sync::Arc;

use crate::message::Message;

/// Country resolution seam.
///
/// The real resolver sits on a GeoIP database outside this crate; the
/// default resolves nothing.
pub trait GeoResolver: Send + Sync + 'static {
    /// Country code for `ip`, if known.
    fn country(&self, ip: &str) -> Option<String>;
}

/// Resolver that knows no countries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeoResolver;

impl GeoResolver for NullGeoResolver {
    fn country(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// A fixed ip → country table for tests and development.
#[derive(Debug, Default)]
pub struct StaticGeoResolver(HashMap<String, String>);

impl StaticGeoResolver {
    /// Builds the table from `(ip, country)` pairs.
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(ip, cc)| (ip.into(), cc.into())).collect())
    }
}

impl GeoResolver for StaticGeoResolver {
    fn country(&self, ip: &str) -> Option<String> {
        self.0.get(ip).cloned()
    }
}

/// Per-request lazy country lookup.
///
/// Behaves like a dictionary whose `get("ip")` resolves the requesting
/// client; any other argument is looked up as a literal address. Results
/// memoize for the life of the request.
pub struct GeoLookup {
    resolver: Arc<dyn GeoResolver>,
    client_ip: String,
    resolved: HashMap<String, String>,
}

impl std::fmt::Debug for GeoLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoLookup")
            .field("client_ip", &self.client_ip)
            .field("resolved", &self.resolved)
            .finish_non_exhaustive()
    }
}

impl GeoLookup {
    /// Binds the lookup to one request.
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        request: &Message,
        peer: &str,
    ) -> Self {
        Self {
            resolver,
            client_ip: request.client_ip(peer),
            resolved: HashMap::new(),
        }
    }

    /// Country for `arg` (`"ip"` means the requesting client).
    pub fn get(&mut self, arg: &str) -> String {
        if let Some(country) = self.resolved.get(arg) {
            return country.clone();
        }
        let address =
            if arg == "ip" { self.client_ip.as_str() } else { arg };
        let country = self.resolver.country(address).unwrap_or_default();
        self.resolved.insert(arg.to_string(), country.clone());
        country
    }
}

/// Per-request lazy client address lookup.
#[derive(Debug)]
pub struct IpLookup {
    ip: String,
}

impl IpLookup {
    /// Binds the lookup to one request.
    pub fn new(request: &Message, peer: &str) -> Self {
        Self { ip: request.client_ip(peer) }
    }

    /// The client address; the argument is ignored.
    pub fn get(&mut self, _arg: &str) -> String {
        self.ip.clone()
    }
}
