//! Nix binary cache endpoints.
//!
//! This module is the per-request orchestrator. For every
//! `(namespace, kind, hash)` it decides between a cache hit, an
//! upstream fetch with write-through, and a miss:
//!
//! 1. an index in the local tier whose chunks resolve answers `HIT`;
//! 2. an index in the object tier answers `HIT` too, with the
//!    composite store warming the local tier as chunks stream through;
//! 3. otherwise the upstream fan-out runs. A winning GET body is teed
//!    to the client and into per-tier ingest sinks; a winning HEAD
//!    enqueues an async copy job. Either way the client sees `REMOTE`
//!    and the winning URL in `X-Cache-Upstream`;
//! 4. nothing answered: `MISS`, 404.
//!
//! Ingest failures never fail the client response; they are logged and
//! counted.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    body::{Body, StreamBody},
    extract::{BodyStream, Extension, Path},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use anyhow::anyhow;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::instrument;

use granary::mime;
use granary::namespace::Namespace;
use granary::store_path::{ArchiveHash, StorePathHash};

use crate::assembler::assemble_stream;
use crate::copy_queue::CopyJob;
use crate::decompression::{CompressionFormat, Decompressor};
use crate::error::{ServerError, ServerResult};
use crate::ingest::{spawn_sink_ingest, tee_stream, Frame};
use crate::metrics::CacheStatus;
use crate::upstream::{decompressed_body, fan_out, NARINFO_EXTENSIONS, NAR_EXTENSIONS};
use crate::State;

/// Upper bound on accepted manifest bodies.
const MAX_NARINFO_SIZE: usize = 2 * 1024 * 1024;

/// The artifact a request addresses.
#[derive(Debug, Clone)]
enum Artifact {
    Narinfo(StorePathHash),
    Nar(ArchiveHash),
}

impl Artifact {
    /// The logical (and canonical storage) name.
    fn name(&self) -> String {
        match self {
            Self::Narinfo(hash) => format!("{}.narinfo", hash.as_str()),
            Self::Nar(hash) => format!("nar/{}.nar", hash),
        }
    }

    fn is_nar(&self) -> bool {
        matches!(self, Self::Nar(_))
    }

    fn content_type(&self) -> &'static str {
        match self {
            Self::Narinfo(_) => mime::NARINFO,
            Self::Nar(_) => mime::NAR,
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Narinfo(_) => NARINFO_EXTENSIONS,
            Self::Nar(_) => NAR_EXTENSIONS,
        }
    }

    fn get_deadline(&self, state: &State) -> Duration {
        match self {
            Self::Narinfo(_) => state.config.timeouts.narinfo_get,
            Self::Nar(_) => state.config.timeouts.nar_get,
        }
    }
}

/// Validates the namespace segment against the configuration.
fn resolve_namespace(state: &State, namespace: &str) -> ServerResult<Namespace> {
    let namespace: Namespace = namespace.parse().map_err(|_| ServerError::NotFound)?;

    if state.config.namespaces.contains_key(&namespace) {
        Ok(namespace)
    } else {
        Err(ServerError::NoSuchNamespace)
    }
}

/// Parses `{storePathHash}.narinfo`.
fn parse_narinfo_path(path: &str) -> ServerResult<Artifact> {
    match path.split_once('.') {
        Some((hash, "narinfo")) => {
            let hash = StorePathHash::new(hash.to_string()).map_err(|_| ServerError::NotFound)?;
            Ok(Artifact::Narinfo(hash))
        }
        _ => Err(ServerError::NotFound),
    }
}

/// Parses `{archiveHash}.nar` with an optional compression extension.
fn parse_nar_path(path: &str) -> ServerResult<(Artifact, CompressionFormat)> {
    let (hash, rest) = path.split_once(".nar").ok_or(ServerError::NotFound)?;

    let hash = ArchiveHash::new(hash.to_string()).map_err(|_| ServerError::NotFound)?;

    let format = match rest.strip_prefix('.') {
        Some(ext) => CompressionFormat::from_extension(ext)?,
        None if rest.is_empty() => CompressionFormat::None,
        None => return Err(ServerError::NotFound),
    };

    Ok((Artifact::Nar(hash), format))
}

fn cache_response(
    status: StatusCode,
    cache: CacheStatus,
    content_type: &str,
    upstream: Option<&str>,
) -> axum::http::response::Builder {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header("X-Cache", cache.as_str());

    if let Some(upstream) = upstream {
        builder = builder.header("X-Cache-Upstream", upstream);
    }

    builder
}

fn miss_response(state: &State, artifact: &Artifact) -> Response {
    state.metrics.record_request(artifact.is_nar(), CacheStatus::Miss);

    cache_response(
        StatusCode::NOT_FOUND,
        CacheStatus::Miss,
        artifact.content_type(),
        None,
    )
    .body(Body::empty())
    .unwrap()
    .into_response()
}

/// Gets information on a namespace.
#[instrument(skip_all, fields(namespace))]
async fn get_nix_cache_info(
    Extension(state): Extension<State>,
    Path(namespace): Path<String>,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let ns_config = &state.config.namespaces[&namespace];

    let body = format!(
        "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: {}\n",
        ns_config.priority
    );

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime::NIX_CACHE_INFO)
        .body(Body::from(body))
        .unwrap()
        .into_response())
}

/// Serves a GET for either artifact kind.
async fn serve_get(state: State, namespace: Namespace, artifact: Artifact) -> ServerResult<Response> {
    let name = artifact.name();

    // store tiers
    if let Some((index, store)) = state.lookup_index(&namespace, &name).await? {
        state.metrics.record_request(artifact.is_nar(), CacheStatus::Hit);

        let body = StreamBody::new(assemble_stream(store, index.clone()));

        return Ok(cache_response(
            StatusCode::OK,
            CacheStatus::Hit,
            artifact.content_type(),
            None,
        )
        .header(header::CONTENT_LENGTH, index.length)
        .body(body)
        .unwrap()
        .into_response());
    }

    // upstream federation
    let win = fan_out(
        &state.http,
        &state.upstreams[&namespace],
        &name,
        artifact.extensions(),
        Method::GET,
        artifact.get_deadline(&state),
    )
    .await?;

    let win = match win {
        Some(win) => win,
        None => return Ok(miss_response(&state, &artifact)),
    };

    state
        .metrics
        .record_request(artifact.is_nar(), CacheStatus::Remote);
    let upstream_url = win.url.to_string();

    match &artifact {
        Artifact::Narinfo(_) => {
            // Manifests are small: relay the upstream body verbatim and
            // persist the canonicalized form off the request path.
            let manifest = win
                .response
                .text()
                .await
                .map_err(ServerError::request_error)?;

            {
                let state = state.clone();
                let namespace = namespace.clone();
                let manifest = manifest.clone();
                let name = name.clone();

                tokio::task::spawn(async move {
                    let canonical = match state.canonicalize_narinfo(&namespace, &manifest) {
                        Ok(canonical) => canonical,
                        Err(e) => {
                            state.metrics.ingest_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Upstream manifest {} does not canonicalize: {}", name, e);
                            return;
                        }
                    };

                    if let Err(e) = state
                        .ingest_bytes_all_tiers(&namespace, &name, canonical.into_bytes())
                        .await
                    {
                        state.metrics.ingest_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Failed to persist manifest {}: {}", name, e);
                    }
                });
            }

            Ok(cache_response(
                StatusCode::OK,
                CacheStatus::Remote,
                artifact.content_type(),
                Some(&upstream_url),
            )
            .body(Body::from(manifest))
            .unwrap()
            .into_response())
        }
        Artifact::Nar(_) => {
            // Tee the decompressed body into the client response and
            // one chunking sink per configured tier.
            let reader = decompressed_body(win)?;

            let mut senders: Vec<mpsc::Sender<Frame>> = Vec::new();

            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);
            spawn_sink_ingest(
                state.local.clone(),
                state.local.clone(),
                namespace.clone(),
                name.clone(),
                rx,
                state.chunker,
                state.metrics.clone(),
                "local",
            );

            if let Some(object) = &state.object {
                let (tx, rx) = mpsc::channel(1);
                senders.push(tx);
                spawn_sink_ingest(
                    object.clone(),
                    object.clone(),
                    namespace.clone(),
                    name.clone(),
                    rx,
                    state.chunker,
                    state.metrics.clone(),
                    "object",
                );
            }

            let tee = tee_stream(reader, senders, state.config.timeouts.ingest_stall);

            Ok(cache_response(
                StatusCode::OK,
                CacheStatus::Remote,
                artifact.content_type(),
                Some(&upstream_url),
            )
            .body(StreamBody::new(tee))
            .unwrap()
            .into_response())
        }
    }
}

/// Serves a HEAD for either artifact kind.
async fn serve_head(
    state: State,
    namespace: Namespace,
    artifact: Artifact,
) -> ServerResult<Response> {
    let name = artifact.name();

    if let Some((index, _)) = state.lookup_index(&namespace, &name).await? {
        state.metrics.record_request(artifact.is_nar(), CacheStatus::Hit);

        return Ok(cache_response(
            StatusCode::OK,
            CacheStatus::Hit,
            artifact.content_type(),
            None,
        )
        .header(header::CONTENT_LENGTH, index.length)
        .body(Body::empty())
        .unwrap()
        .into_response());
    }

    let win = fan_out(
        &state.http,
        &state.upstreams[&namespace],
        &name,
        artifact.extensions(),
        Method::HEAD,
        state.config.timeouts.head,
    )
    .await?;

    match win {
        Some(win) => {
            state
                .metrics
                .record_request(artifact.is_nar(), CacheStatus::Remote);

            // warm the cache so the eventual GET hits locally
            state.copy_queue.enqueue(CopyJob {
                namespace,
                url: win.url.clone(),
                name,
            });

            Ok(cache_response(
                StatusCode::OK,
                CacheStatus::Remote,
                artifact.content_type(),
                Some(win.url.as_str()),
            )
            .body(Body::empty())
            .unwrap()
            .into_response())
        }
        None => Ok(miss_response(&state, &artifact)),
    }
}

/// Gets a manifest.
///
/// - GET `/:namespace/{storePathHash}.narinfo`
#[instrument(skip_all, fields(namespace, path))]
async fn get_narinfo(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let artifact = parse_narinfo_path(&path)?;

    serve_get(state, namespace, artifact).await
}

/// Probes a manifest.
#[instrument(skip_all, fields(namespace, path))]
async fn head_narinfo(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let artifact = parse_narinfo_path(&path)?;

    serve_head(state, namespace, artifact).await
}

/// Uploads a manifest.
///
/// The manifest is validated, canonicalized to reference the
/// uncompressed NAR, stripped of untrusted signatures, signed if
/// nothing remains, and persisted in all configured tiers.
#[instrument(skip_all, fields(namespace, path))]
#[axum_macros::debug_handler]
async fn put_narinfo(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
    body: BodyStream,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let artifact = parse_narinfo_path(&path)?;
    let name = artifact.name();

    let bytes = collect_body(body, MAX_NARINFO_SIZE).await?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| ServerError::RequestError(anyhow!("manifest is not UTF-8")))?;

    let narinfo = crate::narinfo::NarInfo::from_str(text)?;

    if let Artifact::Narinfo(hash) = &artifact {
        if narinfo.store_path.to_hash().as_str() != hash.as_str() {
            return Err(ServerError::RequestError(anyhow!(
                "manifest store path does not match the request path"
            )));
        }
    }

    let canonical = state.canonicalize_parsed(&namespace, narinfo);

    state
        .ingest_bytes_all_tiers(&namespace, &name, canonical.into_bytes())
        .await?;

    Ok(StatusCode::OK.into_response())
}

/// Gets a NAR.
///
/// - GET `/:namespace/nar/{archiveHash}.nar`
///
/// The stored artifact is always the uncompressed NAR; requests with a
/// compression extension resolve to the same artifact.
#[instrument(skip_all, fields(namespace, path))]
async fn get_nar(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let (artifact, _) = parse_nar_path(&path)?;

    serve_get(state, namespace, artifact).await
}

/// Probes a NAR.
#[instrument(skip_all, fields(namespace, path))]
async fn head_nar(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let (artifact, _) = parse_nar_path(&path)?;

    serve_head(state, namespace, artifact).await
}

/// Uploads a NAR.
///
/// The body is decompressed according to the request extension and the
/// uncompressed stream is chunked into all configured tiers.
#[instrument(skip_all, fields(namespace, path))]
async fn put_nar(
    Extension(state): Extension<State>,
    Path((namespace, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: BodyStream,
) -> ServerResult<Response> {
    let namespace = resolve_namespace(&state, &namespace)?;
    let (artifact, format) = parse_nar_path(&path)?;
    let name = artifact.name();

    // a bare .nar upload may still declare compression in the headers
    let format = match format {
        CompressionFormat::None => match headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
        {
            None | Some("identity") => CompressionFormat::None,
            Some(encoding) => CompressionFormat::from_extension(encoding)?,
        },
        declared => declared,
    };

    let reader = StreamReader::new(Box::pin(
        body.map(|item| item.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
    ));
    let reader = Decompressor::new_unbuffered(reader, format);

    state
        .ingest_reader_all_tiers(&namespace, &name, reader)
        .await?;

    Ok(StatusCode::OK.into_response())
}

async fn collect_body(mut body: BodyStream, limit: usize) -> ServerResult<Vec<u8>> {
    let mut out = Vec::new();

    while let Some(piece) = body.next().await {
        let piece = piece.map_err(ServerError::request_error)?;

        if out.len() + piece.len() > limit {
            return Err(ServerError::RequestError(anyhow!("body too large")));
        }

        out.extend_from_slice(&piece);
    }

    Ok(out)
}

pub(crate) fn get_router() -> Router {
    Router::new()
        .route("/:namespace/nix-cache-info", get(get_nix_cache_info))
        .route(
            "/:namespace/:path",
            get(get_narinfo).head(head_narinfo).put(put_narinfo),
        )
        .route(
            "/:namespace/nar/:path",
            get(get_nar).head(head_nar).put(put_nar),
        )
}
