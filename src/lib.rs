#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A caching HTTP/1.0 reverse proxy with edge-side template injection.
//!
//! The proxy sits between clients and an origin web application. Cached
//! pages are keyed by host, URI, language, declared cookies, and A/B
//! cohort; concurrent fetches for the same page coalesce into a single
//! origin request; stale copies are served while a background refresh
//! runs (up to three times the declared `max-age`, after which a fetch
//! blocks). Before a body goes out, it is scanned for template
//! directives (`<& get session username &>` by default) whose data is
//! loaded in one parallel batch and substituted in place, so a shared
//! cached page still carries per-visitor state.
//!
//! ## Pieces
//!
//! - [`message`]: the HTTP/1.0 request/response object and its codec.
//! - [`backend`]: the `{get, set, delete, flush}` cache containers —
//!   in-process, remote key-value, or null.
//! - [`kv`]: the async key-value client contract.
//! - [`store`]: the element-kind registry and the page fetch path —
//!   origin coalescing, stale-while-revalidate, the cache-decision
//!   table.
//! - [`ab`]: cohort assignment, persistence, and page-key salting.
//! - [`pipeline`]: the per-request stages, templating, and the purge
//!   channel.
//! - [`server`]: the accept loop.
//!
//! ## Running
//!
//! ```no_run
//! use std::sync::Arc;
//! use encore::{
//!     ab::{AbEngine, StaticCatalog},
//!     backend,
//!     clock::SystemClock,
//!     config::Config,
//!     kv::MemoryKv,
//!     lookup::NullGeoResolver,
//!     mail::Mailer,
//!     pipeline::Pipeline,
//!     session::StaticSessions,
//!     store::DataStore,
//!     uniques::Uniques,
//! };
//!
//! # async fn example() -> encore::Result<()> {
//! let config = Arc::new(Config::default());
//! let clock = Arc::new(SystemClock);
//! let kv = Arc::new(MemoryKv::new());
//! let cache = backend::from_config(&config, kv.clone(), clock.clone());
//! let store = DataStore::new(
//!     config.clone(),
//!     cache,
//!     kv.clone(),
//!     kv,
//!     Arc::new(StaticSessions::new()),
//!     Arc::new(AbEngine::new(config.clone(), Arc::new(StaticCatalog::default()))),
//!     clock.clone(),
//!     Mailer::disabled(),
//! );
//! let pipeline = Arc::new(Pipeline::new(
//!     config.clone(),
//!     store,
//!     Arc::new(Uniques::new(clock.clone(), None)),
//!     Arc::new(NullGeoResolver),
//!     clock,
//!     Mailer::disabled(),
//! )?);
//! let listener =
//!     tokio::net::TcpListener::bind((config.interface.as_str(), config.port))
//!         .await?;
//! encore::server::run(listener, pipeline, config).await?;
//! # Ok(())
//! # }
//! ```

pub mod ab;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod kv;
pub mod lookup;
pub mod mail;
pub mod message;
pub mod origin;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod store;
pub mod template;
pub mod uniques;

pub use error::{FetchFailure, ProxyError, Result};
pub use message::{Direction, HeaderBag, Message};

#[cfg(test)]
mod test;
