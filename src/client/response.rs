//! Successful responses and bounded body reads.

use bytes::{Bytes, BytesMut};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// A successful (or cache-served) response.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    /// Raw body. `204 No Content` is normalized to `null`.
    pub body: Bytes,
    /// Served from the conditional cache after a `304 Not Modified`.
    pub from_cache: bool,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Read a response body, failing with [`Error::SizeLimitExceeded`] once more than `limit`
/// bytes arrive.
pub(crate) async fn read_limited(mut response: reqwest::Response, limit: u64) -> Result<Bytes> {
    if let Some(len) = response.content_length()
        && len > limit
    {
        return Err(Error::SizeLimitExceeded { limit });
    }

    let mut buf = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(Error::SizeLimitExceeded { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
