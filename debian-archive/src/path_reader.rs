// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading repository paths.

A [PathReader] resolves repository relative paths like `dists/bullseye/InRelease`
to byte streams. [FilesystemPathReader] serves a local mirror directory and
[HttpPathReader] an HTTP mirror.
*/

use {
    crate::error::{ArchiveError, Result},
    async_trait::async_trait,
    futures::{io::BufReader, AsyncBufRead},
    std::{
        path::{Path, PathBuf},
        pin::Pin,
        time::SystemTime,
    },
    tokio_util::compat::TokioAsyncReadCompatExt,
};

#[cfg(feature = "http")]
use {
    futures::stream::TryStreamExt,
    reqwest::{Client, IntoUrl, StatusCode, Url},
    std::time::{Duration, UNIX_EPOCH},
};

/// Content of a fetched path.
pub struct FetchedPath {
    pub reader: Pin<Box<dyn AsyncBufRead + Send>>,
    /// Upstream modification time, when known.
    pub last_modified: Option<SystemTime>,
}

/// Provides access to repository relative paths.
#[async_trait]
pub trait PathReader: Send + Sync {
    /// Human readable location of the repository root.
    fn location(&self) -> String;

    /// Open a path along with its metadata.
    ///
    /// Missing paths are reported as [ArchiveError::NotFound].
    async fn fetch(&self, path: &str) -> Result<FetchedPath>;

    /// Open a path.
    async fn get_path(&self, path: &str) -> Result<Pin<Box<dyn AsyncBufRead + Send>>> {
        Ok(self.fetch(path).await?.reader)
    }

    /// Read a path into memory.
    async fn get_path_bytes(&self, path: &str) -> Result<Vec<u8>> {
        use futures::AsyncReadExt;

        let mut reader = self.get_path(path).await?;
        let mut buf = vec![];
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ArchiveError::IoPath(path.to_string(), e))?;

        Ok(buf)
    }
}

#[async_trait]
impl<T: PathReader + ?Sized> PathReader for Box<T> {
    fn location(&self) -> String {
        (**self).location()
    }

    async fn fetch(&self, path: &str) -> Result<FetchedPath> {
        (**self).fetch(path).await
    }
}

/// Reads paths under a local directory.
#[derive(Clone, Debug)]
pub struct FilesystemPathReader {
    root_dir: PathBuf,
}

impl FilesystemPathReader {
    /// Construct a new instance, bound to the root directory specified.
    ///
    /// No validation of the passed path is performed.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            root_dir: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PathReader for FilesystemPathReader {
    fn location(&self) -> String {
        format!("{}", self.root_dir.display())
    }

    async fn fetch(&self, path: &str) -> Result<FetchedPath> {
        let full = self.root_dir.join(path);

        let f = match tokio::fs::File::open(&full).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::NotFound(path.to_string()))
            }
            Err(e) => return Err(ArchiveError::IoPath(format!("{}", full.display()), e)),
        };

        let last_modified = f.metadata().await.and_then(|m| m.modified()).ok();

        Ok(FetchedPath {
            reader: Box::pin(BufReader::new(f.compat())),
            last_modified,
        })
    }
}

/// Reads paths from an HTTP mirror.
#[cfg(feature = "http")]
#[derive(Clone, Debug)]
pub struct HttpPathReader {
    client: Client,
    root_url: Url,
}

#[cfg(feature = "http")]
impl HttpPathReader {
    /// Construct an instance bound to the specified URL.
    pub fn new(url: impl IntoUrl) -> Result<Self> {
        Self::new_client(Client::default(), url)
    }

    /// Construct an instance using the given [Client] and URL.
    ///
    /// The URL is the value that follows `deb` in apt sources files, e.g.
    /// `https://deb.debian.org/debian`.
    pub fn new_client(client: Client, url: impl IntoUrl) -> Result<Self> {
        let mut root_url = url.into_url()?;

        // Url::join() drops the final path segment without a trailing slash.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self { client, root_url })
    }
}

#[cfg(feature = "http")]
fn parse_last_modified(value: &str) -> Option<SystemTime> {
    let seconds = mailparse::dateparse(value).ok()?;

    u64::try_from(seconds)
        .ok()
        .map(|s| UNIX_EPOCH + Duration::from_secs(s))
}

#[cfg(feature = "http")]
#[async_trait]
impl PathReader for HttpPathReader {
    fn location(&self) -> String {
        self.root_url.to_string()
    }

    async fn fetch(&self, path: &str) -> Result<FetchedPath> {
        let url = self.root_url.join(path)?;

        let res = self.client.get(url.clone()).send().await?;

        match res.status() {
            StatusCode::NOT_FOUND => return Err(ArchiveError::NotFound(url.to_string())),
            status if !status.is_success() => {
                return Err(ArchiveError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let last_modified = res
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_last_modified);

        Ok(FetchedPath {
            reader: Box::pin(
                res.bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e))
                    .into_async_read(),
            ),
            last_modified,
        })
    }
}
