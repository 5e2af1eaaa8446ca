//! Upstream federation.
//!
//! On a miss, the proxy asks every configured upstream for the
//! artifact, once per acceptable file extension, all in parallel under
//! one deadline. The first 2xx response wins and every other in-flight
//! request is canceled by dropping its future, which aborts the
//! underlying HTTP transfer. No 2xx before the deadline means "not
//! found"; callers cannot tell a slow federation from an empty one,
//! and the client is not supposed to either.

use std::io;
use std::time::Duration;

use futures::future::{select_ok, BoxFuture};
use reqwest::{Client, Method, Response, Url};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::decompression::{CompressionFormat, Decompressor};
use crate::error::{ServerError, ServerResult};

/// Extensions tried when fetching a NAR.
///
/// The bare `.nar` is tried alongside the compressed forms; whichever
/// the upstream actually has wins.
pub const NAR_EXTENSIONS: &[&str] = &["", ".xz", ".zst", ".bz2"];

/// Extensions tried when fetching a narinfo.
pub const NARINFO_EXTENSIONS: &[&str] = &[""];

/// One upstream cache.
#[derive(Debug, Clone)]
pub struct Upstream {
    base: Url,
}

/// The winning response of a fan-out.
pub struct FanOutWin {
    /// The exact URL that answered.
    pub url: Url,

    /// The winning response, body unread.
    pub response: Response,
}

impl Upstream {
    /// Parses an upstream base URL.
    pub fn new(base: &str) -> ServerResult<Self> {
        let normalized = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };

        let base = Url::parse(&normalized).map_err(ServerError::request_error)?;

        Ok(Self { base })
    }

    /// Resolves an artifact path against this upstream.
    pub fn url_for(&self, path: &str) -> ServerResult<Url> {
        self.base.join(path).map_err(ServerError::request_error)
    }
}

/// Queries all upstreams in parallel and returns the first 2xx winner.
///
/// One request is issued per `(upstream, extension)` pair. Returns
/// `Ok(None)` when nothing answered in time.
pub async fn fan_out(
    client: &Client,
    upstreams: &[Upstream],
    base_path: &str,
    extensions: &[&str],
    method: Method,
    deadline: Duration,
) -> ServerResult<Option<FanOutWin>> {
    let mut requests: Vec<BoxFuture<'static, Result<FanOutWin, ()>>> = Vec::new();

    for upstream in upstreams {
        for extension in extensions {
            let url = upstream.url_for(&format!("{}{}", base_path, extension))?;
            let request = client.request(method.clone(), url.clone());

            requests.push(Box::pin(async move {
                let response = request.send().await.map_err(|_| ())?;

                if response.status().is_success() {
                    Ok(FanOutWin { url, response })
                } else {
                    Err(())
                }
            }));
        }
    }

    if requests.is_empty() {
        return Ok(None);
    }

    match tokio::time::timeout(deadline, select_ok(requests)).await {
        // deadline expired with requests still in flight
        Err(_) => Ok(None),

        // every request failed or answered non-2xx
        Ok(Err(())) => Ok(None),

        // dropping the remaining futures cancels their transfers
        Ok(Ok((win, _remaining))) => Ok(Some(win)),
    }
}

/// Wraps the winning response body in the decompressor implied by the
/// winning URL.
pub fn decompressed_body(win: FanOutWin) -> ServerResult<impl AsyncRead + Send + Unpin> {
    let format = if win.url.path().ends_with(".narinfo") {
        CompressionFormat::None
    } else {
        CompressionFormat::from_nar_path(win.url.path())?
    };

    Ok(Decompressor::new_unbuffered(
        response_reader(win.response),
        format,
    ))
}

/// Converts a response body into an `AsyncRead`.
pub fn response_reader(response: Response) -> impl AsyncRead + Send + Unpin {
    use futures::StreamExt;

    StreamReader::new(Box::pin(
        response
            .bytes_stream()
            .map(|item| item.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
    ))
}
