use std::sync::Arc;

use object_store::{ObjectStore, parse_url, path::Path};
use url::Url;

/// Errors produced while resolving an object locator into a store client.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// The locator input is not a valid URL.
    #[error("invalid object URL {input:?}")]
    InvalidUrl {
        /// The rejected input.
        input: String,
        /// The parse failure.
        #[source]
        source: url::ParseError,
    },

    /// No object store client could be created for the URL, e.g. because the
    /// scheme is unknown or the backing store is not compiled in.
    #[error("cannot create object store client for {url}")]
    Connect {
        /// The locator URL.
        url: Url,
        /// Error reported by the store factory.
        #[source]
        source: object_store::Error,
    },
}

/// A bucket + object key pair identifying a remote blob, expressed as an
/// object URL such as `s3://my-bucket/path/to/object`.
///
/// The URL scheme selects the backing store, the host names the bucket, and
/// the path names the object within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocator {
    url: Url,
}

impl ObjectLocator {
    /// Parses a full object URL.
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        let url = Url::parse(input).map_err(|source| LocatorError::InvalidUrl {
            input: input.to_string(),
            source,
        })?;
        Ok(Self { url })
    }

    /// Builds a locator from a bucket URL (e.g. `s3://my-bucket`) and an
    /// object key within that bucket.
    pub fn new(bucket_url: &str, object_name: &str) -> Result<Self, LocatorError> {
        let joined = format!(
            "{}/{}",
            bucket_url.trim_end_matches('/'),
            object_name.trim_start_matches('/')
        );
        Self::parse(&joined)
    }

    /// The locator URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Creates the backend client for this locator, returning the store and
    /// the object path within it.
    pub fn connect(&self) -> Result<(Arc<dyn ObjectStore>, Path), LocatorError> {
        let (store, path) = parse_url(&self.url).map_err(|source| LocatorError::Connect {
            url: self.url.clone(),
            source,
        })?;
        Ok((Arc::from(store), path))
    }
}
