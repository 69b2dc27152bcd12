//! `RangeSource` over HTTP range requests (the 416/200/206 dance specified
//! in spec.md §6).
//!
//! `read_range` clamps rather than errors on a short response (mirroring the
//! teacher's `AsyncBackend::read`): the header bootstrap in `reader.rs`
//! requests a fixed 512 KiB regardless of the archive's actual size and
//! relies on this to tolerate an archive smaller than that chunk, doing its
//! own sufficiency check against the parsed header lengths afterward.

use bytes::Bytes;
use reqwest::header::{HeaderValue, RANGE};
use reqwest::{Client, IntoUrl, Method, Request, StatusCode, Url};

use crate::backend::RangeSource;
use crate::error::{ComtError, ComtResult};

/// Fetches ranges from a single URL over HTTP(S).
pub struct HttpBackend {
    client: Client,
    url: Url,
}

impl HttpBackend {
    /// Builds a backend for `url`, reusing the given `reqwest::Client`.
    ///
    /// # Errors
    /// Returns an error if `url` cannot be parsed.
    pub fn try_new<U: IntoUrl>(client: Client, url: U) -> ComtResult<Self> {
        Ok(Self {
            client,
            url: url.into_url()?,
        })
    }
}

impl RangeSource for HttpBackend {
    async fn read_range(&self, offset: u64, length: u64) -> ComtResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset + length - 1;
        let range = HeaderValue::try_from(format!("bytes={offset}-{end}"))
            .map_err(|e| ComtError::Internal(e.to_string()))?;

        let mut req = Request::new(Method::GET, self.url.clone());
        req.headers_mut().insert(RANGE, range);

        let response = self.client.execute(req).await?.error_for_status()?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(ComtError::RangeRequestsUnsupported);
        }

        let body = response.bytes().await?;
        let actual = body.len();
        let expected = usize::try_from(length).unwrap_or(usize::MAX);
        if actual > expected {
            return Err(ComtError::UnexpectedByteCount { expected, actual });
        }
        Ok(body)
    }
}
