//! Template directives and their filters.
//!
//! A directive reads `command target arg1 arg2 ... [| filter ...]`, where
//! `command` is one of `get`, `pop`, `if`, `unless`, `incr`, `decr` and
//! `target` names a dictionary loaded for the request.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::lookup::{GeoLookup, IpLookup};
use crate::mail::Mailer;
use crate::store::DataStore;

/// Targets that read straight from already-loaded request data.
pub const REQUEST_TARGETS: [&str; 4] = ["page", "session", "geo", "ip"];
/// Targets fetched by key through the key-value kinds.
pub const KEY_FETCH_TARGETS: [&str; 2] = ["memcache", "viewdb"];
/// Targets fetched by hashing the request alone.
pub const HASH_FETCH_TARGETS: [&str; 1] = ["abvalue"];
/// Targets that only make sense with a session on the request.
pub const SESSION_TARGETS: [&str; 4] =
    ["session", "favorite", "subscription", "unread"];

/// Everything a directive can read or touch while a body renders.
pub struct RenderContext<'a> {
    /// Loaded dictionaries by target name
    pub dicts: HashMap<String, HashMap<String, String>>,
    /// Lazy country lookup
    pub geo: GeoLookup,
    /// Lazy client-address lookup
    pub ip: IpLookup,
    /// The store, for directive-driven mutations
    pub store: &'a DataStore,
    /// Where directive diagnostics go
    pub mailer: &'a Mailer,
}

impl std::fmt::Debug for RenderContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("dicts", &self.dicts.keys())
            .finish_non_exhaustive()
    }
}

impl RenderContext<'_> {
    fn lookup(&mut self, target: &str, key: &str) -> Option<String> {
        match target {
            "geo" => Some(self.geo.get(key)),
            "ip" => Some(self.ip.get(key)),
            other => {
                self.dicts.get(other).and_then(|dict| dict.get(key)).cloned()
            }
        }
    }

    fn store_local(&mut self, target: &str, key: &str, value: String) {
        self.dicts
            .entry(target.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// The directive scanner and renderer.
///
/// Holds the configured match regex; each directive inside a match reads
/// `command target arg1 arg2 ... [| filter ...]`.
#[derive(Debug, Clone)]
pub struct Templater {
    regex: Regex,
}

impl Templater {
    /// Compiles the configured pattern; it must carry one capture group.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|err| ProxyError::TemplateParse(err.to_string()))?;
        Ok(Self { regex })
    }

    /// All directive expressions in `body`, in order.
    pub fn scan<'b>(&self, body: &'b str) -> Vec<&'b str> {
        self.regex
            .captures_iter(body)
            .filter_map(|caps| caps.get(1))
            .map(|group| group.as_str().trim())
            .collect()
    }

    /// Substitutes every directive in `body`.
    pub fn render(&self, body: &str, ctx: &mut RenderContext<'_>) -> String {
        self.regex
            .replace_all(body, |caps: &regex::Captures<'_>| {
                let expression =
                    caps.get(1).map(|group| group.as_str().trim()).unwrap_or("");
                specialize(expression, ctx)
            })
            .into_owned()
    }
}

/// Evaluates one directive expression.
///
/// Anything that does not parse mails a diagnostic and renders as the
/// expression itself.
pub fn specialize(expression: &str, ctx: &mut RenderContext<'_>) -> String {
    let mut parts = expression.split_whitespace();
    let (command, target) = match (parts.next(), parts.next()) {
        (Some(command), Some(target)) => {
            (command.to_ascii_lowercase(), target.to_string())
        }
        _ => {
            ctx.mailer
                .error(format!("could not parse expression: [{expression}]"));
            return expression.to_string();
        }
    };

    let mut args: Vec<&str> = Vec::new();
    let mut filters: Vec<&str> = Vec::new();
    let mut in_filters = false;
    for arg in parts {
        if arg == "|" {
            in_filters = true;
        } else if in_filters {
            filters.push(arg);
        } else {
            args.push(arg);
        }
    }

    let value = match command.as_str() {
        "get" if !args.is_empty() => {
            let default = args.get(1).copied().unwrap_or("");
            let found = ctx.lookup(&target, args[0]);
            match found {
                Some(value) if !value.is_empty() => value,
                _ => default.to_string(),
            }
        }
        "pop" if !args.is_empty() => {
            let default = args.get(1).copied().unwrap_or("");
            let found = ctx.lookup(&target, args[0]);
            match found {
                Some(value) if !value.is_empty() => {
                    // deletion dispatches on the command name; no kind
                    // registers a "pop_delete", so this reports and moves on
                    ctx.store.spawn_mutation(
                        &format!("{command}_delete"),
                        args[0],
                        None,
                    );
                    value
                }
                _ => default.to_string(),
            }
        }
        "if" if args.len() >= 2 => {
            let truthy =
                ctx.lookup(&target, args[0]).is_some_and(|v| !v.is_empty());
            if truthy {
                args[1].to_string()
            } else {
                args.get(2).copied().unwrap_or("").to_string()
            }
        }
        "unless" if args.len() >= 2 => {
            let truthy =
                ctx.lookup(&target, args[0]).is_some_and(|v| !v.is_empty());
            if !truthy {
                args[1].to_string()
            } else {
                args.get(2).copied().unwrap_or("").to_string()
            }
        }
        "incr" | "decr" if !args.is_empty() => {
            let name = format!("{command}_{target}");
            let setter = format!("set_{target}");
            if !ctx.store.has_mutator(&name)
                || !ctx.store.has_mutator(&setter)
            {
                ctx.mailer.error(format!(
                    "data store is missing {name} or {setter}"
                ));
                String::new()
            } else {
                let found = ctx.lookup(&target, args[0]);
                match found {
                    Some(value) if !value.is_empty() => {
                        ctx.store.spawn_mutation(&name, args[0], None);
                        if let Ok(current) = value.parse::<i64>() {
                            let next = if command == "incr" {
                                current + 1
                            } else {
                                current - 1
                            };
                            ctx.store_local(
                                &target,
                                args[0],
                                next.to_string(),
                            );
                        }
                        String::new()
                    }
                    _ => {
                        if let Some(init) = args.get(1) {
                            ctx.store.spawn_mutation(
                                &setter,
                                args[0],
                                Some(init),
                            );
                            ctx.store_local(
                                &target,
                                args[0],
                                init.to_string(),
                            );
                        }
                        String::new()
                    }
                }
            }
        }
        _ => {
            warn!("invalid command: {command}");
            expression.to_string()
        }
    };

    apply_filters(value, &filters)
}

/// Runs the filter tail over a rendered value, in order.
pub fn apply_filters(mut value: String, filters: &[&str]) -> String {
    for filter in filters {
        value = match *filter {
            "js" => value
                .replace('\\', "\\\\")
                .replace('\'', "\\'")
                .replace('"', "\\\""),
            "html" => value
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;"),
            "comma" => comma(&value),
            _ => value,
        };
    }
    value
}

fn comma_groups() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\d*\.)?\d{1,3}-?").unwrap_or_else(|_| {
            unreachable!("the grouping pattern is a fixed literal")
        })
    })
}

/// Thousands separators: reverse, take up-to-three-digit groups (with an
/// optional decimal prefix and sign), rejoin with commas, reverse back.
fn comma(value: &str) -> String {
    let reversed: String = value.chars().rev().collect();
    let grouped: Vec<&str> = comma_groups()
        .find_iter(&reversed)
        .map(|found| found.as_str())
        .collect();
    grouped.join(",").chars().rev().collect()
}
