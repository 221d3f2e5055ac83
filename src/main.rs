use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use encore::ab::{AbEngine, StaticCatalog};
use encore::backend;
use encore::clock::SystemClock;
use encore::config::Config;
use encore::kv::MemoryKv;
use encore::lookup::NullGeoResolver;
use encore::mail::Mailer;
use encore::pipeline::Pipeline;
use encore::session::StaticSessions;
use encore::store::DataStore;
use encore::uniques::Uniques;

fn load_config() -> Config {
    match std::env::args().nth(1) {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{path}: {err}");
                std::process::exit(2);
            }
        },
        None => Config::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(load_config());
    let clock = Arc::new(SystemClock);

    // the wire clients behind these seams are deployment concerns; the
    // in-process stand-ins keep a bare instance fully functional
    let kv = Arc::new(MemoryKv::new());
    let viewdb = Arc::new(MemoryKv::new());
    let sessions = Arc::new(StaticSessions::new());
    let catalog = Arc::new(StaticCatalog::default());
    let mailer = Mailer::disabled();

    let cache = backend::from_config(&config, kv.clone(), clock.clone());
    let ab = Arc::new(AbEngine::new(config.clone(), catalog));
    tokio::spawn(Arc::clone(&ab).refresh_loop());
    let store = DataStore::new(
        config.clone(),
        cache,
        kv,
        viewdb,
        sessions,
        ab,
        clock.clone(),
        mailer.clone(),
    );

    let uniques = Arc::new(Uniques::new(
        clock.clone(),
        config.uniques_path_file(),
    ));
    tokio::spawn(Arc::clone(&uniques).prune_loop());

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        store,
        uniques,
        Arc::new(NullGeoResolver),
        clock,
        mailer,
    )?);

    let listener =
        TcpListener::bind((config.interface.as_str(), config.port))
            .await
            .with_context(|| {
                format!("binding {}:{}", config.interface, config.port)
            })?;
    info!(
        "proxying {}:{} -> {}",
        config.interface, config.port, config.origin
    );
    encore::server::run(listener, pipeline, config).await?;
    Ok(())
}
