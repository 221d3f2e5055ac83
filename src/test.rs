use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::ab::{AbEngine, StaticCatalog};
use crate::backend::{CacheBackend, Element, LocalBackend};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::kv::{KvClient, MemoryKv};
use crate::lookup::StaticGeoResolver;
use crate::mail::Mailer;
use crate::message::{read_message, Message};
use crate::pipeline::Pipeline;
use crate::session::StaticSessions;
use crate::store::DataStore;
use crate::uniques::Uniques;

struct MockOrigin {
    addr: String,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Message>>>,
}

/// A real HTTP/1.0 origin on a loopback port. Every connection serves one
/// request through `respond`, optionally after a delay.
async fn spawn_origin<F>(delay: Duration, respond: F) -> MockOrigin
where
    F: Fn(&Message) -> Message + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let counter = hits.clone();
    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut reader = BufReader::new(socket);
            let Ok(request) = read_message(&mut reader).await else {
                continue;
            };
            log.lock().push(request.clone());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut response = respond(&request);
            let mut socket = reader.into_inner();
            let _ = socket.write_all(&response.write_response(None)).await;
            let _ = socket.shutdown().await;
        }
    });
    MockOrigin { addr: addr.to_string(), hits, seen }
}

fn cached_response(body: &str, max_age: u64) -> Message {
    let mut response = Message::response(200);
    response.set_header("x-encore-control", format!("max-age={max_age}"));
    response.set_header("x-app-server", "origin1");
    response.body = body.as_bytes().to_vec();
    response
}

struct Harness {
    config: Arc<Config>,
    clock: Arc<ManualClock>,
    cache: Arc<LocalBackend>,
    viewdb: Arc<MemoryKv>,
    sessions: Arc<StaticSessions>,
    store: Arc<DataStore>,
    pipeline: Arc<Pipeline>,
}

async fn harness(origin_addr: &str, tests: Vec<(&str, &str)>) -> Harness {
    let config = Arc::new(Config {
        origin: origin_addr.to_string(),
        origin_timeout: 1,
        ..Config::default()
    });
    let clock = ManualClock::starting_at(1_000_000.0);
    let cache = Arc::new(LocalBackend::new(clock.clone()));
    let kv = Arc::new(MemoryKv::new());
    let viewdb = Arc::new(MemoryKv::new());
    let sessions = Arc::new(StaticSessions::new());
    let ab = Arc::new(AbEngine::new(
        config.clone(),
        Arc::new(StaticCatalog::new(tests)),
    ));
    ab.refresh().await.unwrap();
    let store = DataStore::new(
        config.clone(),
        cache.clone(),
        kv,
        viewdb.clone(),
        sessions.clone(),
        ab.clone(),
        clock.clone(),
        Mailer::disabled(),
    );
    let pipeline = Arc::new(
        Pipeline::new(
            config.clone(),
            store.clone(),
            Arc::new(Uniques::new(clock.clone(), None)),
            Arc::new(StaticGeoResolver::new([("8.8.8.8", "US")])),
            clock.clone(),
            Mailer::disabled(),
        )
        .unwrap(),
    );
    Harness { config, clock, cache, viewdb, sessions, store, pipeline }
}

fn plain_request(uri: &str) -> Message {
    let mut request = Message::request("GET", uri);
    request.set_header("host", "www.example.com");
    request
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn page_key(h: &Harness, request: &Message) -> String {
    h.store.hash_page(request, &[], &[], &HashMap::new())
}

async fn get_page(h: &Harness, request: &Message, key: &str) -> Option<Element> {
    h.store
        .get(vec![key.to_string()], request, false)
        .await
        .remove(key)
        .flatten()
}

// ---- cache lifecycle ----

#[tokio::test]
async fn cold_miss_then_warm_hit() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    let first = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(first.as_page().unwrap().response.body, b"payload");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    // the outbound copy identifies the proxy and drops cache-control
    let outbound = origin.seen.lock()[0].clone();
    assert_eq!(outbound.header(&h.config.loop_header), Some("true"));
    assert_eq!(outbound.header("cache-control"), None);

    let second = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(second.as_page().unwrap().response.body, b"payload");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1, "second read was a hit");
    assert_eq!(h.store.variants_of("/a"), vec![key]);
}

#[tokio::test]
async fn soft_stale_serves_and_refreshes_once() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    get_page(&h, &request, &key).await.unwrap();
    h.clock.advance(61.0);

    let stale = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(stale.as_page().unwrap().response.body, b"payload");
    let hits = origin.hits.clone();
    wait_until(move || hits.load(Ordering::SeqCst) == 2).await;

    // a concurrent hit during the refresh window serves the extended
    // entry and does not launch a second background fetch
    let third = get_page(&h, &request, &key).await.unwrap();
    assert!(third.as_page().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn hard_stale_blocks_on_a_fresh_fetch() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    let first = get_page(&h, &request, &key).await.unwrap();
    let first_rendered = first.as_page().unwrap().rendered_on;
    h.clock.advance(181.0);

    let refetched = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
    assert!(refetched.as_page().unwrap().rendered_on > first_rendered);
}

#[tokio::test]
async fn identical_concurrent_requests_share_one_origin_fetch() {
    let origin =
        spawn_origin(Duration::from_millis(150), |_| {
            cached_response("payload", 60)
        })
        .await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    let results = futures::future::join_all(
        (0..5).map(|_| get_page(&h, &request, &key)),
    )
    .await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(
            result.unwrap().as_page().unwrap().response.body,
            b"payload"
        );
    }
    assert_eq!(h.store.pending_fetches(), 0);
}

#[tokio::test]
async fn mutating_methods_bypass_and_never_cache() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let mut request = plain_request("/a");
    request.method = "POST".to_string();
    let key = page_key(&h, &request);

    get_page(&h, &request, &key).await.unwrap();
    get_page(&h, &request, &key).await.unwrap();
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
    assert!(h.cache.is_empty(), "a POST response was cached");
}

#[tokio::test]
async fn not_found_is_cached_for_the_short_window() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        let mut response = Message::response(404);
        response.body = b"missing".to_vec();
        response
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/gone");
    let key = page_key(&h, &request);

    let entry = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(entry.as_page().unwrap().cache_control, 30);
    get_page(&h, &request, &key).await.unwrap();
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    h.clock.advance(31.0);
    // soft stale now: serve and refresh in the background
    get_page(&h, &request, &key).await.unwrap();
    let hits = origin.hits.clone();
    wait_until(move || hits.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn origin_cookies_never_reach_a_shared_cache_slot() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        let mut response = cached_response("payload", 60);
        response.cookies.push("secret=1".to_string());
        response
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    let served = get_page(&h, &request, &key).await.unwrap();
    assert!(served.as_page().unwrap().response.cookies.is_empty());
    let cached = get_page(&h, &request, &key).await.unwrap();
    assert!(cached.as_page().unwrap().response.cookies.is_empty());
}

#[tokio::test]
async fn uncacheable_responses_keep_their_cookies() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        let mut response = Message::response(200);
        response.cookies.push("volatile=1".to_string());
        response.body = b"fresh".to_vec();
        response
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    let request = plain_request("/a");
    let key = page_key(&h, &request);

    let served = get_page(&h, &request, &key).await.unwrap();
    assert_eq!(served.as_page().unwrap().response.cookies, vec!["volatile=1"]);
    assert!(h.cache.is_empty());
}

// ---- pipeline scenarios ----

#[tokio::test]
async fn templating_substitutes_session_data() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        cached_response("hello <& get session username &>!", 60)
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    h.sessions.insert(
        "u1",
        HashMap::from([("username".to_string(), "Ada".to_string())]),
    );
    let mut request = plain_request("/profile");
    request.cookies.push("session=u1".to_string());

    let response = h.pipeline.handle(request, "127.0.0.1").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello Ada!");
    assert!(response.header("via").is_some());
    assert_eq!(response.header(&h.config.cache_header), None);
    assert_eq!(response.header("x-app-server"), None);
}

#[tokio::test]
async fn templating_escapes_through_the_html_filter() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        cached_response("hello <& get session username | html &>!", 60)
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    h.sessions.insert(
        "u1",
        HashMap::from([("username".to_string(), "<b>".to_string())]),
    );
    let mut request = plain_request("/profile");
    request.cookies.push("session=u1".to_string());

    let response = h.pipeline.handle(request, "127.0.0.1").await;
    assert_eq!(response.body, b"hello &lt;b&gt;!");
}

#[tokio::test]
async fn cohorts_split_the_cache_by_dependency() {
    let origin = spawn_origin(Duration::ZERO, |request| {
        let cohort = request.header("x-encore-ab-values").unwrap_or("");
        let mut response = cached_response(
            &format!("variant for {cohort}"),
            60,
        );
        response.set_header("x-encore-ab-tests", "color");
        response
    })
    .await;
    let h = harness(&origin.addr, vec![("color", "red:1,blue:1")]).await;

    // pin both visitors' cohorts in the durable store
    h.viewdb
        .set(
            "abvalue_useroneuseroneuserone11",
            serde_json::to_vec(&HashMap::from([("color", "red")])).unwrap(),
            0,
        )
        .await
        .unwrap();
    h.viewdb
        .set(
            "abvalue_usertwousertwousertwo22",
            serde_json::to_vec(&HashMap::from([("color", "blue")])).unwrap(),
            0,
        )
        .await
        .unwrap();

    let mut first = plain_request("/b");
    first.cookies.push("abid=useroneuseroneuserone11".to_string());
    let response = h.pipeline.handle(first, "127.0.0.1").await;
    assert_eq!(response.body, b"variant for color:red");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    let mut second = plain_request("/b");
    second.cookies.push("abid=usertwousertwousertwo22".to_string());
    let response = h.pipeline.handle(second, "127.0.0.1").await;
    assert_eq!(response.body, b"variant for color:blue");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);

    // the red visitor comes back: their variant is still cached
    let mut again = plain_request("/b");
    again.cookies.push("abid=useroneuseroneuserone11".to_string());
    let response = h.pipeline.handle(again, "127.0.0.1").await;
    assert_eq!(response.body, b"variant for color:red");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn new_visitors_get_a_cohort_cookie_back() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![("color", "red:1")]).await;

    let response =
        h.pipeline.handle(plain_request("/a"), "127.0.0.1").await;
    let issued = response
        .cookies
        .iter()
        .find(|cookie| cookie.starts_with("abid="))
        .expect("a fresh ab cookie");
    let value = issued.trim_start_matches("abid=").split(';').next().unwrap();
    assert_eq!(value.len(), 25);

    // the cohort was persisted for that identity
    let blob =
        h.viewdb.get(&format!("abvalue_{value}")).await.unwrap().unwrap();
    let cohort: HashMap<String, String> =
        serde_json::from_slice(&blob).unwrap();
    assert_eq!(cohort["color"], "red");
}

#[tokio::test]
async fn cookie_declared_variants_are_chased_to_the_salted_key() {
    let origin = spawn_origin(Duration::ZERO, |_| {
        let mut response = cached_response("varied", 60);
        response.set_header("x-encore-cookies", "beta");
        response
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;
    let mut request = plain_request("/a");
    request.cookies.push("beta=on".to_string());

    let response = h.pipeline.handle(request.clone(), "127.0.0.1").await;
    assert_eq!(response.body, b"varied");
    let salted = h.store.hash_page(
        &request,
        &["beta".to_string()],
        &[],
        &HashMap::new(),
    );
    assert!(salted.contains("beta=on"));
    let cached = get_page(&h, &request, &salted).await.unwrap();
    assert_eq!(cached.as_page().unwrap().response.body, b"varied");
}

#[tokio::test]
async fn purge_url_forces_the_next_request_to_the_origin() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;

    h.pipeline.handle(plain_request("/a"), "127.0.0.1").await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    h.pipeline.handle(plain_request("/a"), "127.0.0.1").await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    h.clock.advance(1.0);
    let mut purge = plain_request("/a");
    purge.set_header(&h.config.purge_header, "url");
    let confirmation = h.pipeline.handle(purge, "127.0.0.1").await;
    assert_eq!(confirmation.status, 200);
    assert!(String::from_utf8_lossy(&confirmation.body).contains("url_/a"));

    // entry is not hard-stale, but the sentinel beats rendered_on
    h.pipeline.handle(plain_request("/a"), "127.0.0.1").await;
    assert_eq!(origin.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn purge_star_flushes_and_purge_kind_deletes() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;

    h.pipeline.handle(plain_request("/a"), "127.0.0.1").await;
    assert!(!h.cache.is_empty());
    let mut purge = plain_request("/a");
    purge.set_header(&h.config.purge_header, "*");
    h.pipeline.handle(purge, "127.0.0.1").await;
    assert!(h.cache.is_empty());

    // session-family purge deletes by uri-derived id
    h.cache
        .set(
            HashMap::from([(
                "session_u9".to_string(),
                Element::Map(HashMap::new()),
            )]),
            60,
        )
        .await
        .unwrap();
    let mut purge = plain_request("/u9");
    purge.set_header(&h.config.purge_header, "session");
    h.pipeline.handle(purge, "127.0.0.1").await;
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn language_redirects_leave_the_default_host() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let mut request = plain_request("/x");
    request.set_header("accept-language", "fr-FR,fr;q=0.9");
    request.set_header("x-real-host", "www.base.tld");

    let response = h.pipeline.handle(request, "127.0.0.1").await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("http://fr.base.tld/x"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn english_and_foreign_hosts_are_not_redirected() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;

    let mut request = plain_request("/x");
    request.set_header("accept-language", "en-US,en;q=0.9");
    request.set_header("x-real-host", "www.base.tld");
    let response = h.pipeline.handle(request, "127.0.0.1").await;
    assert_eq!(response.status, 200);

    let mut request = plain_request("/x");
    request.set_header("accept-language", "fr-FR");
    request.set_header("x-real-host", "fr.base.tld");
    let response = h.pipeline.handle(request, "127.0.0.1").await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn origin_timeouts_answer_408_and_clear_the_registry() {
    let origin = spawn_origin(Duration::from_secs(3), |_| {
        cached_response("late", 60)
    })
    .await;
    let h = harness(&origin.addr, vec![]).await;

    let response =
        h.pipeline.handle(plain_request("/slow"), "127.0.0.1").await;
    assert_eq!(response.status, 408);
    assert_eq!(response.body, b"Request timed out.");
    assert_eq!(h.store.pending_fetches(), 0);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreachable_origins_answer_an_empty_502() {
    let h = harness("127.0.0.1:1", vec![]).await;
    let response =
        h.pipeline.handle(plain_request("/down"), "127.0.0.1").await;
    assert_eq!(response.status, 502);
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn uniques_and_time_endpoints_answer_inline() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;

    h.pipeline.handle(plain_request("/a"), "10.0.0.1").await;
    let listing = h
        .pipeline
        .handle(plain_request("/live/uniques_list"), "10.0.0.2")
        .await;
    let body = String::from_utf8(listing.body).unwrap();
    assert!(body.contains("10.0.0.1"));
    assert!(body.contains("10.0.0.2"));

    let time = h
        .pipeline
        .handle(plain_request("/live/time"), "10.0.0.2")
        .await;
    assert!(String::from_utf8(time.body).unwrap().starts_with("100"));
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn geo_header_rides_along_both_ways() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;

    let response = h.pipeline.handle(plain_request("/a"), "8.8.8.8").await;
    assert_eq!(response.header("x-geo"), Some("US"));
    let outbound = origin.seen.lock()[0].clone();
    assert_eq!(outbound.header("x-geo"), Some("US"));
}

// ---- server frame ----

#[tokio::test]
async fn the_server_answers_once_per_connection_and_rejects_garbage() {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(crate::server::run(
        listener,
        h.pipeline.clone(),
        h.config.clone(),
    ));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /a HTTP/1.0\r\nhost: www.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    client.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(raw.ends_with("payload"));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"not an http line\r\n\r\n").await.unwrap();
    let mut raw = String::new();
    client.read_to_string(&mut raw).await.unwrap();
    assert!(raw.starts_with("HTTP/1.0 400 Bad Request\r\n"));

    server.abort();
}

// ---- key-shape invariant ----

#[tokio::test]
async fn every_emitted_key_is_prefixed_by_its_kind() {
    let origin =
        spawn_origin(Duration::ZERO, |_| cached_response("payload", 60)).await;
    let h = harness(&origin.addr, vec![]).await;
    let mut request = plain_request("/a");
    request.cookies.push("session=u1".to_string());
    request.cookies.push("abid=cohortcohortcohortcoho12".to_string());

    for spec in crate::store::REGISTRY {
        let key = h.store.element_hash(&request, spec.name, "some-id");
        if key.is_empty() {
            continue;
        }
        let prefix = format!("{}_", spec.name);
        assert!(
            key.starts_with(&prefix),
            "{} produced {key}",
            spec.name
        );
    }
}
