//! End-to-end tests against a live proxy instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::Extension, Router};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;

use granary::namespace::Namespace;
use granary::signing::Keypair;

use crate::config::{ChunkingConfig, Config, NamespaceConfig};
use crate::nar::tests::file_nar;
use crate::{copy_queue, StateInner};

const STORE_HASH: &str = "xcp9cav49dmsjbwdjlmkjxj10gkpx553";
const NAR_HASH_B32: &str = "0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9";

struct Proxy {
    addr: SocketAddr,
    _data_dir: tempfile::TempDir,
}

impl Proxy {
    fn url(&self, path: &str) -> String {
        format!("http://{}/test/{}", self.addr, path)
    }
}

/// Spawns a full proxy with one namespace ("test") and a signing key.
async fn spawn_proxy(substituters: Vec<String>) -> Proxy {
    spawn_proxy_with(substituters, true).await
}

async fn spawn_proxy_with(substituters: Vec<String>, with_key: bool) -> Proxy {
    let data_dir = tempfile::tempdir().unwrap();

    let secret_key_file = if with_key {
        let keypair = Keypair::generate("granary-test").unwrap();
        let key_path = data_dir.path().join("signing.key");
        std::fs::write(&key_path, keypair.export_keypair()).unwrap();
        Some(key_path)
    } else {
        None
    };

    let mut namespaces = HashMap::new();
    namespaces.insert(
        "test".parse::<Namespace>().unwrap(),
        NamespaceConfig {
            substituters,
            trusted_public_keys: Vec::new(),
            secret_key_file,
            priority: 40,
        },
    );

    let config = Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        log: Default::default(),
        data_dir: data_dir.path().join("data"),
        chunking: ChunkingConfig {
            min_size: 1024,
            avg_size: 4096,
            max_size: 16384,
        },
        chunk_compression: Default::default(),
        max_cache_size: 0,
        garbage_collection: Default::default(),
        timeouts: Default::default(),
        object_store: None,
        namespaces,
    };

    let (state, copy_rx) = StateInner::new(config).await.unwrap();
    tokio::task::spawn(copy_queue::run_copier(state.clone(), copy_rx));

    let app = Router::new()
        .merge(super::get_router())
        .layer(Extension(state));

    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::task::spawn(server);

    Proxy {
        addr,
        _data_dir: data_dir,
    }
}

/// Spawns a fake upstream cache serving a fixed set of files.
async fn spawn_upstream(files: HashMap<String, Vec<u8>>) -> SocketAddr {
    let files = std::sync::Arc::new(files);

    let handler = {
        let files = files.clone();
        move |uri: axum::http::Uri| {
            let files = files.clone();
            async move {
                let path = uri.path().trim_start_matches('/').to_string();
                match files.get(&path) {
                    Some(body) => Ok(body.clone()),
                    None => Err(axum::http::StatusCode::NOT_FOUND),
                }
            }
        }
    };

    let app = Router::new().fallback(handler);

    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::task::spawn(server);
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn sample_narinfo(compression: &str, url_ext: &str) -> String {
    format!(
        "StorePath: /nix/store/{STORE_HASH}-hello-2.10\n\
         URL: nar/{NAR_HASH_B32}.nar{url_ext}\n\
         Compression: {compression}\n\
         NarHash: sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci\n\
         NarSize: 206104\n\
         References: {STORE_HASH}-hello-2.10\n\
         Deriver: vvb4wxmnjixmrkhmj2xb75z62hrr41i7-hello-2.10.drv\n"
    )
}

async fn xz(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut encoder = async_compression::tokio::bufread::XzEncoder::new(data);
    encoder.read_to_end(&mut out).await.unwrap();
    out
}

/// Polls until a GET answers with the given `X-Cache` value.
async fn await_cache_status(proxy: &Proxy, path: &str, wanted: &str) -> reqwest::Response {
    for _ in 0..50 {
        let res = client().get(proxy.url(path)).send().await.unwrap();

        if res.status().is_success()
            && res
                .headers()
                .get("X-Cache")
                .map(|v| v == wanted)
                .unwrap_or(false)
        {
            return res;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("{} never reached X-Cache: {}", path, wanted);
}

#[tokio::test]
async fn test_nix_cache_info() {
    let proxy = spawn_proxy(Vec::new()).await;

    let res = client()
        .get(proxy.url("nix-cache-info"))
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!(
        "text/x-nix-cache-info",
        res.headers()["Content-Type"].to_str().unwrap()
    );

    let body = res.text().await.unwrap();
    assert_eq!("StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 40\n", body);
}

#[tokio::test]
async fn test_unknown_namespace_is_404() {
    let proxy = spawn_proxy(Vec::new()).await;

    let res = client()
        .get(format!(
            "http://{}/nope/{}.narinfo",
            proxy.addr, STORE_HASH
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::NOT_FOUND, res.status());
}

/// Local hit: PUT then GET returns the sanitized-and-signed manifest.
#[tokio::test]
async fn test_narinfo_put_then_get_is_a_hit() {
    let proxy = spawn_proxy(Vec::new()).await;
    let path = format!("{}.narinfo", STORE_HASH);

    let res = client()
        .put(proxy.url(&path))
        .body(sample_narinfo("xz", ".xz"))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, res.status());

    let res = client().get(proxy.url(&path)).send().await.unwrap();
    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("HIT", res.headers()["X-Cache"].to_str().unwrap());
    assert_eq!(
        "text/x-nix-narinfo",
        res.headers()["Content-Type"].to_str().unwrap()
    );

    let body = res.text().await.unwrap();

    // canonicalized to the uncompressed NAR and re-signed
    assert!(body.contains("Compression: none\n"));
    assert!(body.contains(&format!("URL: nar/{}.nar\n", NAR_HASH_B32)));
    assert!(body.contains("FileSize: 206104\n"));
    assert!(body.contains(
        "FileHash: sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci\n"
    ));
    assert!(body.contains("Sig: granary-test:"));

    // a second GET returns the identical bytes
    let again = client()
        .get(proxy.url(&path))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, again);
}

/// A manifest whose only signature is untrusted is accepted, stripped,
/// and re-signed with the namespace key.
#[tokio::test]
async fn test_untrusted_signature_is_replaced() {
    let proxy = spawn_proxy(Vec::new()).await;
    let path = format!("{}.narinfo", STORE_HASH);

    let foreign = Keypair::generate("bad-key").unwrap();
    let manifest = format!(
        "{}Sig: {}\n",
        sample_narinfo("xz", ".xz"),
        foreign.sign(b"whatever")
    );

    let res = client()
        .put(proxy.url(&path))
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, res.status());

    let body = client()
        .get(proxy.url(&path))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(!body.contains("bad-key"));
    assert!(body.contains("Sig: granary-test:"));
}

/// Without a secret key an unsigned manifest stays unsigned but is
/// still stored and retrievable.
#[tokio::test]
async fn test_unsigned_manifest_without_key_is_stored() {
    let proxy = spawn_proxy_with(Vec::new(), false).await;
    let path = format!("{}.narinfo", STORE_HASH);

    let res = client()
        .put(proxy.url(&path))
        .body(sample_narinfo("xz", ".xz"))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, res.status());

    let res = client().get(proxy.url(&path)).send().await.unwrap();
    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("HIT", res.headers()["X-Cache"].to_str().unwrap());

    let body = res.text().await.unwrap();
    assert!(!body.contains("Sig:"));
}

#[tokio::test]
async fn test_invalid_narinfo_put_is_400() {
    let proxy = spawn_proxy(Vec::new()).await;
    let path = format!("{}.narinfo", STORE_HASH);

    let res = client()
        .put(proxy.url(&path))
        .body("NotAField: hello\n")
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::BAD_REQUEST, res.status());
}

#[tokio::test]
async fn test_miss_is_404_with_header() {
    let proxy = spawn_proxy(Vec::new()).await;
    let path = format!("{}.narinfo", STORE_HASH);

    let res = client().get(proxy.url(&path)).send().await.unwrap();

    assert_eq!(StatusCode::NOT_FOUND, res.status());
    assert_eq!("MISS", res.headers()["X-Cache"].to_str().unwrap());
}

/// NAR round trip: PUT uncompressed, GET identical bytes.
#[tokio::test]
async fn test_nar_put_then_get_round_trips() {
    let proxy = spawn_proxy(Vec::new()).await;
    let nar = file_nar(&granary::testing::fake_data(300 * 1024));
    let path = format!("nar/{}.nar", NAR_HASH_B32);

    let res = client()
        .put(proxy.url(&path))
        .body(nar.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, res.status());

    let res = client().get(proxy.url(&path)).send().await.unwrap();
    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("HIT", res.headers()["X-Cache"].to_str().unwrap());
    assert_eq!(
        "application/x-nix-nar",
        res.headers()["Content-Type"].to_str().unwrap()
    );

    let body = res.bytes().await.unwrap();
    assert_eq!(nar, body);
}

/// A compressed PUT stores the uncompressed bytes.
#[tokio::test]
async fn test_compressed_nar_put_is_stored_uncompressed() {
    let proxy = spawn_proxy(Vec::new()).await;
    let nar = file_nar(&granary::testing::fake_data(200 * 1024));
    let compressed = xz(&nar).await;

    let res = client()
        .put(proxy.url(&format!("nar/{}.nar.xz", NAR_HASH_B32)))
        .body(compressed)
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, res.status());

    let body = client()
        .get(proxy.url(&format!("nar/{}.nar", NAR_HASH_B32)))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(nar, body);
}

#[tokio::test]
async fn test_empty_nar_put_is_400() {
    let proxy = spawn_proxy(Vec::new()).await;

    let res = client()
        .put(proxy.url(&format!("nar/{}.nar", NAR_HASH_B32)))
        .body(Vec::new())
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::BAD_REQUEST, res.status());
}

/// Upstream win: the first 2xx serves the client and the local tier is
/// populated in the background.
#[tokio::test]
async fn test_narinfo_upstream_win_then_local_hit() {
    let manifest = sample_narinfo("xz", ".xz");

    let mut files = HashMap::new();
    files.insert(
        format!("{}.narinfo", STORE_HASH),
        manifest.clone().into_bytes(),
    );
    let upstream = spawn_upstream(files).await;

    let dead = spawn_upstream(HashMap::new()).await;

    let proxy = spawn_proxy(vec![
        format!("http://{}", dead),
        format!("http://{}", upstream),
    ])
    .await;

    let path = format!("{}.narinfo", STORE_HASH);
    let res = client().get(proxy.url(&path)).send().await.unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("REMOTE", res.headers()["X-Cache"].to_str().unwrap());
    assert!(res.headers()["X-Cache-Upstream"]
        .to_str()
        .unwrap()
        .contains(&upstream.to_string()));

    // the client sees the upstream body verbatim
    let body = res.text().await.unwrap();
    assert_eq!(manifest, body);

    // and shortly after, the canonicalized manifest is a local hit
    let res = await_cache_status(&proxy, &path, "HIT").await;
    let body = res.text().await.unwrap();
    assert!(body.contains("Compression: none\n"));
    assert!(body.contains("Sig: granary-test:"));
}

/// A compressed upstream NAR is decompressed on the fly and cached.
#[tokio::test]
async fn test_nar_upstream_xz_is_served_uncompressed() {
    let nar = file_nar(&granary::testing::fake_data(400 * 1024));

    let mut files = HashMap::new();
    files.insert(
        format!("nar/{}.nar.xz", NAR_HASH_B32),
        xz(&nar).await,
    );
    let upstream = spawn_upstream(files).await;

    let proxy = spawn_proxy(vec![format!("http://{}", upstream)]).await;

    let path = format!("nar/{}.nar", NAR_HASH_B32);
    let res = client().get(proxy.url(&path)).send().await.unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("REMOTE", res.headers()["X-Cache"].to_str().unwrap());
    assert_eq!(
        "application/x-nix-nar",
        res.headers()["Content-Type"].to_str().unwrap()
    );

    let body = res.bytes().await.unwrap();
    assert_eq!(nar, body);

    // the ingest sink persisted the uncompressed artifact
    let res = await_cache_status(&proxy, &path, "HIT").await;
    let body = res.bytes().await.unwrap();
    assert_eq!(nar, body);
}

/// HEAD against an upstream warms the cache through the copy queue.
#[tokio::test]
async fn test_head_warms_through_copy_queue() {
    let nar = file_nar(&granary::testing::fake_data(100 * 1024));

    let mut files = HashMap::new();
    files.insert(format!("nar/{}.nar.xz", NAR_HASH_B32), xz(&nar).await);
    let upstream = spawn_upstream(files).await;

    let proxy = spawn_proxy(vec![format!("http://{}", upstream)]).await;

    let path = format!("nar/{}.nar", NAR_HASH_B32);
    let res = client().head(proxy.url(&path)).send().await.unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("REMOTE", res.headers()["X-Cache"].to_str().unwrap());
    assert!(res.headers().contains_key("X-Cache-Upstream"));

    // the copy queue downloads and ingests it
    let res = await_cache_status(&proxy, &path, "HIT").await;
    let body = res.bytes().await.unwrap();
    assert_eq!(nar, body);
}

/// The manifest must describe the store path hash it is uploaded under.
#[tokio::test]
async fn test_narinfo_put_under_wrong_hash_is_400() {
    let proxy = spawn_proxy(Vec::new()).await;

    // valid hash, but not the one in the manifest
    let res = client()
        .put(proxy.url("ia70ss13m22znbl8khrf2hq72qmh5drr.narinfo"))
        .body(sample_narinfo("xz", ".xz"))
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::BAD_REQUEST, res.status());
}

/// A request for the compressed name resolves to the same artifact.
#[tokio::test]
async fn test_nar_xz_path_serves_the_artifact() {
    let proxy = spawn_proxy(Vec::new()).await;
    let nar = file_nar(&granary::testing::fake_data(80 * 1024));

    client()
        .put(proxy.url(&format!("nar/{}.nar", NAR_HASH_B32)))
        .body(nar.clone())
        .send()
        .await
        .unwrap();

    let res = client()
        .get(proxy.url(&format!("nar/{}.nar.xz", NAR_HASH_B32)))
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("HIT", res.headers()["X-Cache"].to_str().unwrap());
    assert_eq!(nar, res.bytes().await.unwrap());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let proxy = spawn_proxy(Vec::new()).await;

    // generate one miss
    client()
        .get(proxy.url(&format!("{}.narinfo", STORE_HASH)))
        .send()
        .await
        .unwrap();

    let res = client()
        .get(format!("http://{}/metrics", proxy.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(StatusCode::OK, res.status());

    let body = res.text().await.unwrap();
    assert!(body.contains("granary_requests_total{kind=\"narinfo\",status=\"miss\"} 1"));
}

/// HEAD of a locally cached artifact reports its uncompressed length.
#[tokio::test]
async fn test_head_hit_reports_length() {
    let proxy = spawn_proxy(Vec::new()).await;
    let nar = file_nar(&granary::testing::fake_data(50 * 1024));
    let path = format!("nar/{}.nar", NAR_HASH_B32);

    client()
        .put(proxy.url(&path))
        .body(nar.clone())
        .send()
        .await
        .unwrap();

    let res = client().head(proxy.url(&path)).send().await.unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!("HIT", res.headers()["X-Cache"].to_str().unwrap());
    assert_eq!(
        nar.len().to_string(),
        res.headers()["Content-Length"].to_str().unwrap()
    );
}
