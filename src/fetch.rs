use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tempfile::Builder;

use crate::case::CaseDeclaration;
use crate::checksum::{ChecksumTable, verify_file};
use crate::error::{BatchPhase, FixtureError, ItemFailure};
use crate::pool::TaskGroup;
use crate::store::Store;

/// Source of raw scanner and reference files.
pub trait RemoteStore: Send + Sync {
    /// Streams `url` into `destination`, which does not exist yet.
    fn download(&self, url: &str, destination: &Path) -> Result<(), FixtureError>;
}

#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
}

impl HttpRemoteStore {
    pub fn new(timeout: Duration) -> Result<Self, FixtureError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("recon-fixtures/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FixtureError::Http(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| FixtureError::Http(err.to_string()))?;

        Ok(Self { client })
    }
}

impl RemoteStore for HttpRemoteStore {
    fn download(&self, url: &str, destination: &Path) -> Result<(), FixtureError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FixtureError::Http(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(FixtureError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let mut file = File::create(destination)
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        // A body cut off mid-stream is a network failure, not a local one.
        std::io::copy(&mut response, &mut file)
            .map_err(|err| FixtureError::Http(format!("{url}: {err}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Downloads raw inputs into the cache and proves them against expected checksums.
pub struct DependencyFetcher<R: RemoteStore> {
    remote: R,
    base_url: String,
    retry: RetryPolicy,
}

impl<R: RemoteStore> DependencyFetcher<R> {
    pub fn new(remote: R, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            remote,
            base_url: base_url.into(),
            retry,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn url_for(&self, relative: &str) -> String {
        format!("{}{relative}", self.base_url)
    }

    /// Downloads `url` to `destination` unless something is already there.
    ///
    /// The body lands in a sibling temp file first, so an interrupted transfer never occupies
    /// `destination`.
    pub fn fetch(&self, url: &str, destination: &Utf8Path) -> Result<(), FixtureError> {
        if destination.as_std_path().exists() {
            tracing::debug!(%destination, "already downloaded");
            return Ok(());
        }
        let parent = destination.parent().ok_or_else(|| {
            FixtureError::Filesystem(format!("invalid destination path {destination}"))
        })?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;

        tracing::info!(url, "downloading");
        let start = Instant::now();
        let temp = Builder::new()
            .prefix(".download")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        self.remote.download(url, temp.path())?;
        temp.persist(destination.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("persist {destination}: {err}")))?;
        tracing::debug!(
            url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "download finished"
        );
        Ok(())
    }

    pub fn fetch_with_retry(&self, url: &str, destination: &Utf8Path) -> Result<(), FixtureError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch(url, destination) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    tracing::debug!(url, attempt, error = %err, "transient download error");
                    if attempt >= self.retry.attempts {
                        return Err(FixtureError::FetchExhausted {
                            url: url.to_string(),
                            attempts: attempt,
                        });
                    }
                    thread::sleep(self.retry.backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Makes `path` hold exactly the bytes whose checksum is `expected`.
    ///
    /// A present file with the wrong content is deleted and fetched again once; a second
    /// mismatch is fatal and leaves nothing at `path`.
    pub fn fetch_and_validate(
        &self,
        path: &Utf8Path,
        url: &str,
        expected: &str,
    ) -> Result<(), FixtureError> {
        if path.as_std_path().exists() {
            match verify_file(path.as_std_path(), expected) {
                Ok(()) => return Ok(()),
                Err(err @ FixtureError::ChecksumMismatch { .. }) => {
                    tracing::warn!(%path, reason = %err, "deleting corrupted download");
                    Store::remove_file_if_exists(path)?;
                }
                Err(err) => return Err(err),
            }
        }
        self.fetch_with_retry(url, path)?;
        if let Err(err) = verify_file(path.as_std_path(), expected) {
            Store::remove_file_if_exists(path)?;
            return Err(err);
        }
        Ok(())
    }

    /// Fetches every distinct remote file the cases read, concurrently.
    ///
    /// All downloads are attempted; any failure turns the batch into one aggregate error.
    pub fn fetch_all(
        &self,
        cases: &[&CaseDeclaration],
        checksums: &ChecksumTable,
        store: &Store,
        pool: &TaskGroup,
    ) -> Result<(), FixtureError> {
        let files = cases
            .iter()
            .flat_map(|case| case.remote_files())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        tracing::info!(count = files.len(), "fetching dependencies");

        let outcomes = pool.run(files, |file| {
            let expected = checksums.lookup(file)?;
            self.fetch_and_validate(&store.cached_file(file), &self.url_for(file), expected)
        });

        let mut failures = Vec::new();
        for (file, outcome) in outcomes {
            if let Err(err) = outcome {
                tracing::error!(dependency = %file, error = %err, "failed to download dependency");
                failures.push(ItemFailure::new(file, &err));
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by(|a, b| a.item.cmp(&b.item));
        Err(FixtureError::BatchFailed {
            phase: BatchPhase::Download,
            failures,
        })
    }
}
