// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Downloading verified archive files.

A [Downloader] fetches files from a mirror into temporary files. Content is
verified against a [FileHash] as it streams and decompressed according to its file
name. At most `parallel` downloads are in flight at a time. Transient failures
(HTTP 5xx, dropped connections, timeouts) are retried with jittered exponential
backoff; everything else fails immediately.

[Downloader::release()] yields a [ReleaseDownloader] bound to a verified suite.
[ReleaseCache] memoizes those per suite.
*/

use {
    crate::{
        error::{ArchiveError, Result},
        hash::FileHash,
        io::{read_decompressed, Compression, VerifyingReader},
        path_reader::{FilesystemPathReader, PathReader},
        release::Release,
        signing::Keyring,
    },
    futures::{io::BufReader, AsyncRead, AsyncReadExt},
    log::{debug, info, warn},
    rand::Rng,
    serde::Deserialize,
    std::{
        collections::HashMap,
        future::Future,
        io::{Seek, SeekFrom, Write},
        path::PathBuf,
        pin::Pin,
        sync::{Arc, Mutex},
        time::{Duration, SystemTime},
    },
    tempfile::NamedTempFile,
    tokio::sync::{OnceCell, Semaphore},
};

/// Default keyring of the `debian-archive-keyring` package.
pub const DEBIAN_ARCHIVE_KEYRING: &str = "/usr/share/keyrings/debian-archive-keyring.gpg";

/// Default HTTP mirror.
pub const DEFAULT_MIRROR: &str = "https://deb.debian.org/debian";

/// Settings of a [Downloader].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DownloaderConfig {
    /// Maximum number of concurrent downloads.
    pub parallel: usize,
    /// Retries of transient errors per download. 0 retries forever.
    pub max_transient_retries: u32,
    /// HTTP URL of a mirror.
    pub mirror: String,
    /// Local mirror directory, used instead of `mirror`.
    pub local_mirror: Option<PathBuf>,
    /// Keyring trusted to sign `InRelease`.
    pub keyring: PathBuf,
    /// Directory for temporary files. Defaults to the system temporary directory.
    pub temp_dir: Option<PathBuf>,
    /// Bound on each fetch attempt, in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// First retry delay, in milliseconds. Doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Cap on retry delays, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            parallel: 10,
            max_transient_retries: 3,
            mirror: DEFAULT_MIRROR.to_string(),
            local_mirror: None,
            keyring: PathBuf::from(DEBIAN_ARCHIVE_KEYRING),
            temp_dir: None,
            request_timeout_ms: None,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl DownloaderConfig {
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .retry_base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = exponential.min(self.retry_max_delay_ms);

        let jitter = if capped > 3 {
            rand::thread_rng().gen_range(0..capped / 4)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Fetches and verifies files from a mirror.
///
/// Cloning is cheap; clones share the concurrency limit.
#[derive(Clone)]
pub struct Downloader {
    reader: Arc<dyn PathReader>,
    keyring: Arc<Keyring>,
    semaphore: Arc<Semaphore>,
    config: Arc<DownloaderConfig>,
}

impl Downloader {
    pub fn new(reader: impl PathReader + 'static, keyring: Keyring, config: DownloaderConfig) -> Self {
        Self {
            reader: Arc::new(reader),
            keyring: Arc::new(keyring),
            semaphore: Arc::new(Semaphore::new(config.parallel.max(1))),
            config: Arc::new(config),
        }
    }

    /// Construct an instance reading the configured mirror and keyring.
    pub fn from_config(config: DownloaderConfig) -> Result<Self> {
        if !config.keyring.exists() {
            return Err(ArchiveError::Keyring(format!(
                "{} not found; on Debian, install the debian-archive-keyring package",
                config.keyring.display()
            )));
        }
        let keyring = Keyring::from_path(&config.keyring)?;

        if let Some(path) = &config.local_mirror {
            let reader = FilesystemPathReader::new(path);
            return Ok(Self::new(reader, keyring, config));
        }

        Self::new_http(keyring, config)
    }

    #[cfg(feature = "http")]
    fn new_http(keyring: Keyring, config: DownloaderConfig) -> Result<Self> {
        let reader = crate::path_reader::HttpPathReader::new(config.mirror.as_str())?;

        Ok(Self::new(reader, keyring, config))
    }

    #[cfg(not(feature = "http"))]
    fn new_http(_keyring: Keyring, config: DownloaderConfig) -> Result<Self> {
        Err(ArchiveError::InvalidConfig(format!(
            "HTTP support is disabled; cannot use mirror {}",
            config.mirror
        )))
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub fn location(&self) -> String {
        self.reader.location()
    }

    /// Run one attempt, bounded by the request timeout.
    async fn attempt<T>(&self, path: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.config.request_timeout_ms {
            Some(millis) => tokio::time::timeout(Duration::from_millis(millis), fut)
                .await
                .unwrap_or_else(|_| Err(ArchiveError::Timeout(path.to_string()))),
            None => fut.await,
        }
    }

    /// Whether to retry after a failed attempt, and how long to wait first.
    fn should_retry(&self, path: &str, error: &ArchiveError, attempt: u32) -> Option<Duration> {
        let max = self.config.max_transient_retries;

        if !error.is_transient() || (max != 0 && attempt >= max) {
            return None;
        }

        let delay = self.config.retry_delay(attempt);
        warn!(
            "transient error fetching {}: {}; retrying in {:?} (attempt {} of {})",
            path,
            error,
            delay,
            attempt + 1,
            if max == 0 {
                "unlimited".to_string()
            } else {
                max.to_string()
            }
        );

        Some(delay)
    }

    async fn fetch_bytes_once(&self, path: &str) -> Result<(Vec<u8>, Option<SystemTime>)> {
        let mut fetched = self.reader.fetch(path).await?;
        let mut buf = vec![];
        fetched.reader.read_to_end(&mut buf).await?;

        Ok((buf, fetched.last_modified))
    }

    /// Fetch a small file into memory, with retries.
    async fn fetch_bytes(&self, path: &str) -> Result<(Vec<u8>, Option<SystemTime>)> {
        let _permit = self.permit().await?;
        let mut attempt = 0;

        loop {
            match self.attempt(path, self.fetch_bytes_once(path)).await {
                Ok(res) => return Ok(res),
                Err(e) => match self.should_retry(path, &e, attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
            }

            attempt += 1;
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|e| ArchiveError::Other(format!("download slots closed: {}", e)))
    }

    fn new_temp_file(&self) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("archive-");

        Ok(match &self.config.temp_dir {
            Some(dir) => builder
                .tempfile_in(dir)
                .map_err(|e| ArchiveError::IoPath(format!("{}", dir.display()), e))?,
            None => builder.tempfile()?,
        })
    }

    async fn download_once(
        &self,
        path: &str,
        expected: &FileHash,
        compression: Compression,
        file: &mut NamedTempFile,
    ) -> Result<Option<SystemTime>> {
        let fh = file.as_file_mut();
        fh.set_len(0)?;
        fh.seek(SeekFrom::Start(0))?;

        let fetched = self.reader.fetch(path).await?;
        let (verifying, handle) = VerifyingReader::new(fetched.reader, expected.clone());
        let mut decoded: Pin<Box<dyn AsyncRead + Send>> =
            read_decompressed(Box::pin(BufReader::new(verifying)), compression);

        let mut writer = std::io::BufWriter::new(&mut *fh);
        let mut buf = vec![0u8; 65536];
        loop {
            let count = decoded.read(&mut buf).await?;
            if count == 0 {
                break;
            }
            writer.write_all(&buf[0..count])?;
        }
        writer.flush()?;
        drop(writer);

        handle.finish()?;

        Ok(fetched.last_modified)
    }

    /// Download `path`, verifying its raw bytes against `expected`.
    ///
    /// The returned file holds the decompressed content and is removed when dropped.
    /// Dropping the future aborts the download.
    pub async fn download(
        &self,
        path: &str,
        expected: &FileHash,
        compression: Compression,
    ) -> Result<NamedTempFile> {
        let _permit = self.permit().await?;
        let mut file = self.new_temp_file()?;
        let mut attempt = 0;

        let last_modified = loop {
            match self
                .attempt(path, self.download_once(path, expected, compression, &mut file))
                .await
            {
                Ok(res) => break res,
                Err(e) => match self.should_retry(path, &e, attempt) {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e),
                },
            }

            attempt += 1;
        };

        if let Some(mtime) = last_modified {
            filetime::set_file_mtime(file.path(), filetime::FileTime::from_system_time(mtime))
                .map_err(|e| ArchiveError::IoPath(format!("{}", file.path().display()), e))?;
        }

        file.as_file_mut().seek(SeekFrom::Start(0))?;
        debug!("downloaded {} to {}", path, file.path().display());

        Ok(file)
    }

    /// Download a file by the repository relative path in its [FileHash].
    pub async fn temp_file(&self, expected: &FileHash) -> Result<NamedTempFile> {
        self.download(
            &expected.filename,
            expected,
            Compression::from_path_suffix(&expected.filename),
        )
        .await
    }

    /// Fetch and verify a suite's `Release`.
    ///
    /// `InRelease` is preferred. Without it, `Release` must carry a valid
    /// `Release.gpg`.
    pub async fn release(&self, suite: &str) -> Result<(Release, ReleaseDownloader)> {
        let inrelease = format!("dists/{}/InRelease", suite);

        let (text, last_modified) = match self.fetch_bytes(&inrelease).await {
            Ok((data, last_modified)) => {
                let data = String::from_utf8(data).map_err(|_| {
                    ArchiveError::CleartextMalformed(format!("{} is not UTF-8", inrelease))
                })?;

                (self.keyring.verify_cleartext(&data)?.into_bytes(), last_modified)
            }
            Err(e) if e.is_not_found() => {
                warn!("{} not found; using Release and Release.gpg", inrelease);

                let (data, last_modified) =
                    self.fetch_bytes(&format!("dists/{}/Release", suite)).await?;
                let (signature, _) = self
                    .fetch_bytes(&format!("dists/{}/Release.gpg", suite))
                    .await?;
                self.keyring.verify_detached(&data, &signature)?;

                (data, last_modified)
            }
            Err(e) => return Err(e),
        };

        let release = Release::from_reader(text.as_slice())?;
        info!("verified Release of {} from {}", suite, self.location());

        let downloader = ReleaseDownloader {
            downloader: self.clone(),
            suite: suite.to_string(),
            acquire_by_hash: release.acquire_by_hash().unwrap_or(false),
            last_modified,
        };

        Ok((release, downloader))
    }
}

/// Downloads index files of one verified suite.
#[derive(Clone)]
pub struct ReleaseDownloader {
    downloader: Downloader,
    suite: String,
    acquire_by_hash: bool,
    last_modified: Option<SystemTime>,
}

impl ReleaseDownloader {
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// Modification time of the `Release` metadata.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn acquire_by_hash(&self) -> bool {
        self.acquire_by_hash
    }

    /// Repository path fetched for an index entry.
    pub fn fetch_path(&self, expected: &FileHash) -> String {
        if self.acquire_by_hash {
            format!("dists/{}/{}", self.suite, expected.by_hash_path())
        } else {
            format!("dists/{}/{}", self.suite, expected.filename)
        }
    }

    /// Download an index file declared by the suite's `Release`.
    ///
    /// `expected.filename` is relative to `dists/<suite>/`.
    pub async fn temp_file(&self, expected: &FileHash) -> Result<NamedTempFile> {
        self.downloader
            .download(
                &self.fetch_path(expected),
                expected,
                Compression::from_path_suffix(&expected.filename),
            )
            .await
    }
}

/// A verified `Release` along with its downloader.
pub type CachedRelease = Arc<(Release, ReleaseDownloader)>;

/// Memoizes [Downloader::release()] per suite.
///
/// Concurrent first requests for a suite share a single fetch. Failures are not
/// cached.
pub struct ReleaseCache {
    downloader: Downloader,
    cells: Mutex<HashMap<String, Arc<OnceCell<CachedRelease>>>>,
}

impl ReleaseCache {
    pub fn new(downloader: Downloader) -> Self {
        Self {
            downloader,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    fn cell(&self, suite: &str) -> Arc<OnceCell<CachedRelease>> {
        let mut cells = match self.cells.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        cells
            .entry(suite.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// The verified release of a suite, fetching it on first use.
    pub async fn release(&self, suite: &str) -> Result<CachedRelease> {
        let cell = self.cell(suite);

        let cached = cell
            .get_or_try_init(|| async {
                let res = self.downloader.release(suite).await?;
                Ok::<_, ArchiveError>(Arc::new(res))
            })
            .await?;

        Ok(cached.clone())
    }

    /// Download `dists/<suite>/<path>`, verified against the suite's `Release`.
    pub async fn temp_file(&self, path: &str) -> Result<NamedTempFile> {
        let (suite, remainder) = path
            .strip_prefix("dists/")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| {
                ArchiveError::Other(format!("path {} does not start with dists/<suite>/", path))
            })?;

        let cached = self.release(suite).await?;
        let (release, downloader) = &*cached;

        let expected = release
            .indices()?
            .remove(remainder)
            .ok_or_else(|| ArchiveError::UndeclaredIndex(remainder.to_string()))?;

        downloader.temp_file(&expected).await
    }
}
