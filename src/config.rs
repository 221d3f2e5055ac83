//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Which cache backend to run behind the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map with per-entry expiry
    #[default]
    Local,
    /// Remote key-value store, keys digested before transport
    Remote,
    /// Cache nothing; every read misses
    Null,
}

/// Runtime configuration for the proxy.
///
/// Every knob has a default so a bare `{}` config file produces a working
/// instance pointed at `127.0.0.1:8000`. The surrounding configuration
/// system (command-line merging, include directives) lives outside this
/// crate; [`Config::from_file`] is its interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface to bind the listener to
    pub interface: String,
    /// Port to listen on
    pub port: u16,
    /// Origin web server as `host:port` (port defaults to 80)
    pub origin: String,
    /// Seconds to wait on an origin fetch before giving up
    pub origin_timeout: u64,
    /// Seconds allowed for a whole request before answering 408
    pub request_deadline: u64,
    /// Which cache backend to use
    pub cache_backend: BackendKind,
    /// Value written into the `host:` header on outbound requests;
    /// empty means "use `x-real-host` as-is"
    pub rewrite_host: String,
    /// Leading host label that marks the default (redirectable) site
    pub default_host: String,
    /// Salt page keys by the request language
    pub hash_lang_header: bool,
    /// Language assumed when the request does not state one
    pub hash_lang_default: String,
    /// Origin header carrying `max-age=N`
    pub cache_header: String,
    /// Origin header listing cookie names the response varies on
    pub cookies_header: String,
    /// Origin header listing A/B tests the page depends on
    pub abdependency_header: String,
    /// Request header used to echo the current cohort to the origin
    pub abvalue_header: String,
    /// Loop-detection marker set on outbound origin requests
    pub loop_header: String,
    /// Header whose presence selects the purge path
    pub purge_header: String,
    /// Cookie holding the A/B identity
    pub ab_cookie: String,
    /// Transient request cookie marking a freshly issued A/B identity
    pub new_ab_cookie: String,
    /// Cookie holding the session id
    pub session_cookie: String,
    /// Regex with one capture group selecting template directives
    pub template_regex: String,
    /// URI fragment serving the unique-IP list
    pub uniques_path: String,
    /// URI fragment serving the current time
    pub time_path: String,
    /// Where to snapshot the uniques table; empty disables persistence
    pub uniques_file: String,
    /// Hostname reported in the `via:` header
    pub hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 8080,
            origin: "127.0.0.1:8000".to_string(),
            origin_timeout: 25,
            request_deadline: 60,
            cache_backend: BackendKind::Local,
            rewrite_host: String::new(),
            default_host: "www".to_string(),
            hash_lang_header: true,
            hash_lang_default: "en-us".to_string(),
            cache_header: "x-encore-control".to_string(),
            cookies_header: "x-encore-cookies".to_string(),
            abdependency_header: "x-encore-ab-tests".to_string(),
            abvalue_header: "x-encore-ab-values".to_string(),
            loop_header: "x-encore".to_string(),
            purge_header: "x-encore-expire".to_string(),
            ab_cookie: "abid".to_string(),
            new_ab_cookie: "abid-new".to_string(),
            session_cookie: "session".to_string(),
            template_regex: r"<&\s*(.*?)\s*&>".to_string(),
            uniques_path: "live/uniques_list".to_string(),
            time_path: "live/time".to_string(),
            uniques_file: String::new(),
            hostname: "localhost".to_string(),
        }
    }
}

impl Config {
    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Split the configured origin into a host and a port.
    pub fn origin_addr(&self) -> (String, u16) {
        match self.origin.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.origin.clone(), 80),
            },
            None => (self.origin.clone(), 80),
        }
    }

    /// Path of the uniques snapshot, if persistence is enabled.
    pub fn uniques_path_file(&self) -> Option<PathBuf> {
        if self.uniques_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.uniques_file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_backend, BackendKind::Local);
        assert_eq!(config.origin_addr(), ("127.0.0.1".to_string(), 8000));
        assert!(config.uniques_path_file().is_none());
    }

    #[test]
    fn origin_without_port_defaults_to_80() {
        let config =
            Config { origin: "origin.internal".to_string(), ..Config::default() };
        assert_eq!(config.origin_addr(), ("origin.internal".to_string(), 80));
    }

    #[test]
    fn backend_kind_parses_lowercase() {
        let config: Config =
            serde_json::from_str(r#"{"cache_backend": "null"}"#).unwrap();
        assert_eq!(config.cache_backend, BackendKind::Null);
    }
}
