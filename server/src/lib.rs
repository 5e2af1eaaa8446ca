#![deny(
    asm_sub_register,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

//! The granary server: a content-addressed caching proxy for Nix
//! binary caches.

mod api;
pub mod assembler;
pub mod config;
pub mod copy_queue;
pub mod decompression;
pub mod error;
pub mod gc;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod nar;
pub mod narinfo;
pub mod store;
pub mod upstream;

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{extract::Extension, http::Uri, Router};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use granary::chunking::ChunkerParams;
use granary::namespace::Namespace;

use config::{Config, NamespaceKeys};
use copy_queue::{CopyJob, CopyQueue};
use error::{ServerError, ServerResult};
use index::ChunkIndex;
use ingest::{ingest_reader, IngestOutcome};
use metrics::Metrics;
use narinfo::NarInfo;
use store::{ChunkStore, CompositeChunkStore, IndexStore, LocalStore, S3Store};
use upstream::Upstream;

pub type State = Arc<StateInner>;

/// Global server state.
pub struct StateInner {
    /// The server configuration.
    pub config: Config,

    /// Validated chunker parameters.
    pub chunker: ChunkerParams,

    /// The local tier.
    pub local: Arc<LocalStore>,

    /// The object-store tier, if configured.
    pub object: Option<Arc<S3Store>>,

    /// The chunk keyspace served to readers: the composite over
    /// {local, object} when both exist, the local tier otherwise.
    pub chunks: Arc<dyn ChunkStore>,

    /// Parsed upstream descriptors, per namespace.
    pub upstreams: HashMap<Namespace, Vec<Upstream>>,

    /// Key material, per namespace. Read-only after startup.
    pub keys: HashMap<Namespace, NamespaceKeys>,

    /// Shared HTTP client for upstream requests.
    pub http: reqwest::Client,

    /// Process metrics.
    pub metrics: Arc<Metrics>,

    /// Producer half of the async copy queue.
    pub copy_queue: CopyQueue,
}

impl StateInner {
    /// Builds the shared state from a configuration.
    ///
    /// Returns the consumer half of the copy queue alongside; callers
    /// that serve requests must run [`copy_queue::run_copier`] on it.
    pub async fn new(config: Config) -> Result<(State, mpsc::Receiver<CopyJob>)> {
        let chunker = config.chunker_params()?;
        let keys = config::load_keys(&config)?;

        let local = Arc::new(
            LocalStore::new(config.data_dir.clone(), config.chunk_compression).await?,
        );

        let object = match &config.object_store {
            Some(object_config) => Some(Arc::new(S3Store::new(object_config.clone()).await?)),
            None => None,
        };

        let chunks: Arc<dyn ChunkStore> = match &object {
            Some(object) => Arc::new(CompositeChunkStore::new(local.clone(), object.clone())),
            None => local.clone(),
        };

        let mut upstreams = HashMap::new();
        for (namespace, ns_config) in &config.namespaces {
            let mut parsed = Vec::new();
            for substituter in &ns_config.substituters {
                parsed.push(Upstream::new(substituter).map_err(|e| {
                    anyhow!(
                        "Invalid substituter \"{}\" in namespace \"{}\": {}",
                        substituter,
                        namespace,
                        e
                    )
                })?);
            }
            upstreams.insert(namespace.clone(), parsed);
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("granary/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let (copy_queue, copy_rx) = CopyQueue::new();

        let state = Arc::new(Self {
            config,
            chunker,
            local,
            object,
            chunks,
            upstreams,
            keys,
            http,
            metrics: Arc::new(Metrics::new()),
            copy_queue,
        });

        Ok((state, copy_rx))
    }

    /// Finds a servable index for an artifact, tier by tier.
    ///
    /// Returns the index and the chunk store to assemble it from. A
    /// local index only counts when all of its chunks resolve locally;
    /// an object-tier index is assembled through the composite store,
    /// which warms the local tier as a side effect.
    pub async fn lookup_index(
        &self,
        namespace: &Namespace,
        name: &str,
    ) -> ServerResult<Option<(ChunkIndex, Arc<dyn ChunkStore>)>> {
        match self.local.get_index(namespace, name).await {
            Ok(Some(index)) => {
                let mut resolvable = true;
                for digest in index.digests() {
                    if !ChunkStore::has(self.local.as_ref(), digest).await? {
                        resolvable = false;
                        break;
                    }
                }

                if resolvable {
                    let store: Arc<dyn ChunkStore> = self.local.clone();
                    return Ok(Some((index, store)));
                }

                tracing::warn!("Local index {} has unresolvable chunks", name);
            }
            Ok(None) => {}
            Err(e) => {
                // the garbage collector will deal with it
                tracing::warn!("Local index {} does not decode: {}", name, e);
            }
        }

        if let Some(object) = &self.object {
            match object.get_index(namespace, name).await {
                Ok(Some(index)) => return Ok(Some((index, self.chunks.clone()))),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Object-tier index {} does not decode: {}", name, e);
                }
            }
        }

        Ok(None)
    }

    /// Canonicalizes a manifest for storage.
    ///
    /// Applies the NAR rewrite, strips signatures that do not verify
    /// under the namespace's trusted keys, and signs the manifest with
    /// the namespace key if no signature remains.
    pub fn canonicalize_parsed(&self, namespace: &Namespace, mut narinfo: NarInfo) -> String {
        narinfo.sanitize_nar();

        if let Some(keys) = self.keys.get(namespace) {
            narinfo.sanitize_signatures(&keys.trusted_keys);

            if narinfo.sigs.is_empty() {
                if let Some(keypair) = &keys.keypair {
                    narinfo.sign(keypair);
                }
            }
        }

        narinfo.to_string()
    }

    /// Parses and canonicalizes a manifest in one step.
    pub fn canonicalize_narinfo(
        &self,
        namespace: &Namespace,
        manifest: &str,
    ) -> ServerResult<String> {
        let narinfo = NarInfo::from_str(manifest)?;
        Ok(self.canonicalize_parsed(namespace, narinfo))
    }

    /// Ingests an in-memory artifact into every configured tier.
    pub async fn ingest_bytes_all_tiers(
        &self,
        namespace: &Namespace,
        name: &str,
        bytes: Vec<u8>,
    ) -> ServerResult<IngestOutcome> {
        self.ingest_reader_all_tiers(namespace, name, Cursor::new(bytes))
            .await
    }

    /// Ingests a stream into every configured tier.
    ///
    /// Chunks flow through the composite store (which writes both
    /// tiers); the index is written to the local tier first and then
    /// mirrored to the object tier.
    pub async fn ingest_reader_all_tiers<R>(
        &self,
        namespace: &Namespace,
        name: &str,
        reader: R,
    ) -> ServerResult<IngestOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let indices: Arc<dyn IndexStore> = self.local.clone();

        let outcome = ingest_reader(
            self.chunks.clone(),
            indices,
            namespace,
            name,
            reader,
            self.chunker,
            &self.metrics,
        )
        .await?;

        if let Some(object) = &self.object {
            object.put_index(namespace, name, &outcome.index).await?;
        }

        Ok(outcome)
    }
}

/// The fallback route.
async fn fallback(_: Uri) -> ServerResult<()> {
    Err(ServerError::NotFound)
}

/// Runs the API server together with the copy-queue consumer.
pub async fn run_server(cli_listen: Option<SocketAddr>, config: Config) -> Result<()> {
    let (state, copy_rx) = StateInner::new(config).await?;

    let listen = cli_listen.unwrap_or(state.config.listen);

    let rest = Router::new()
        .merge(api::get_router())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state.clone()))
        .layer(CatchPanicLayer::new());

    tracing::info!("Listening on {:?}...", listen);

    let (server_ret, _) = tokio::join!(
        axum::Server::bind(&listen).serve(rest.into_make_service()),
        copy_queue::run_copier(state.clone(), copy_rx),
    );

    server_ret?;

    Ok(())
}

/// Runs the periodic garbage collector until shutdown.
pub async fn run_gc_loop(config: Config) -> Result<()> {
    let (state, _copy_rx) = StateInner::new(config).await?;
    gc::run_garbage_collection(state).await;

    Ok(())
}

/// Runs one garbage collection pass, then returns.
pub async fn run_gc_once(config: Config) -> Result<()> {
    let (state, _copy_rx) = StateInner::new(config).await?;
    gc::run_garbage_collection_once(&state).await?;

    Ok(())
}

/// Runs one verify pass over every stored chunk, then returns.
pub async fn run_verify_once(config: Config) -> Result<()> {
    let (state, _copy_rx) = StateInner::new(config).await?;
    gc::run_verify_once(&state).await?;

    Ok(())
}
