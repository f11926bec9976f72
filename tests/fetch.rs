use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use recon_fixtures::case::{CaseDeclaration, RawConversion, ReconstructionSource};
use recon_fixtures::checksum::{ChecksumTable, bytes_checksum};
use recon_fixtures::error::{BatchPhase, FixtureError};
use recon_fixtures::fetch::{DependencyFetcher, RemoteStore, RetryPolicy};
use recon_fixtures::pool::TaskGroup;
use recon_fixtures::store::Store;

const BASE_URL: &str = "http://raw.test/data/";

enum Reply {
    Body(&'static [u8]),
    Transient,
    Missing,
}

/// Serves scripted replies per URL, falling back to `defaults` once a script runs out.
#[derive(Default)]
struct ScriptedRemote {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: HashMap<String, &'static [u8]>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    fn serving(url: &str, body: &'static [u8]) -> Self {
        let mut remote = Self::default();
        remote.defaults.insert(url.to_string(), body);
        remote
    }

    fn script(self, url: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == url)
            .count()
    }
}

impl RemoteStore for ScriptedRemote {
    fn download(&self, url: &str, destination: &Path) -> Result<(), FixtureError> {
        self.calls.lock().unwrap().push(url.to_string());
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        let reply = match scripted {
            Some(reply) => reply,
            None => match self.defaults.get(url).copied() {
                Some(body) => Reply::Body(body),
                None => Reply::Missing,
            },
        };
        match reply {
            Reply::Body(body) => {
                fs::write(destination, body).unwrap();
                Ok(())
            }
            Reply::Transient => Err(FixtureError::Http("connection reset".to_string())),
            Reply::Missing => Err(FixtureError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

fn no_backoff(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        backoff: Duration::ZERO,
    }
}

fn data_root() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Store::new(root))
}

fn url(file: &str) -> String {
    format!("{BASE_URL}{file}")
}

#[test]
fn fetch_skips_network_when_destination_exists() {
    let (_temp, store) = data_root();
    let fetcher = DependencyFetcher::new(
        ScriptedRemote::serving(&url("a.dat"), b"payload"),
        BASE_URL,
        no_backoff(5),
    );
    let destination = store.cached_file("nested/a.dat");

    fetcher.fetch(&url("a.dat"), &destination).unwrap();
    fetcher.fetch(&url("a.dat"), &destination).unwrap();

    assert_eq!(fs::read(destination.as_std_path()).unwrap(), b"payload");
    assert_eq!(fetcher.remote().calls(), 1);
}

#[test]
fn corrupted_file_is_replaced_by_one_refetch() {
    let (_temp, store) = data_root();
    let remote = ScriptedRemote::serving(&url("a.dat"), b"good bytes");
    let fetcher = DependencyFetcher::new(remote, BASE_URL, no_backoff(5));
    let destination = store.cached_file("a.dat");
    fs::create_dir_all(store.cache_dir().as_std_path()).unwrap();
    fs::write(destination.as_std_path(), b"truncated").unwrap();

    fetcher
        .fetch_and_validate(&destination, &url("a.dat"), &bytes_checksum(b"good bytes"))
        .unwrap();

    assert_eq!(fs::read(destination.as_std_path()).unwrap(), b"good bytes");
    assert_eq!(fetcher.remote().calls(), 1);
}

#[test]
fn valid_existing_file_needs_no_download() {
    let (_temp, store) = data_root();
    let fetcher = DependencyFetcher::new(ScriptedRemote::default(), BASE_URL, no_backoff(5));
    let destination = store.cached_file("a.dat");
    fs::create_dir_all(store.cache_dir().as_std_path()).unwrap();
    fs::write(destination.as_std_path(), b"good bytes").unwrap();

    fetcher
        .fetch_and_validate(&destination, &url("a.dat"), &bytes_checksum(b"good bytes"))
        .unwrap();
    assert_eq!(fetcher.remote().calls(), 0);
}

#[test]
fn second_mismatch_is_fatal_and_leaves_nothing_behind() {
    let (_temp, store) = data_root();
    let fetcher = DependencyFetcher::new(
        ScriptedRemote::serving(&url("a.dat"), b"still wrong"),
        BASE_URL,
        no_backoff(5),
    );
    let destination = store.cached_file("a.dat");

    let result =
        fetcher.fetch_and_validate(&destination, &url("a.dat"), &bytes_checksum(b"expected"));
    assert_matches!(result, Err(FixtureError::ChecksumMismatch { .. }));
    assert!(!destination.as_std_path().exists());
}

#[test]
fn transient_failures_are_retried() {
    let (_temp, store) = data_root();
    let remote = ScriptedRemote::serving(&url("a.dat"), b"payload").script(
        &url("a.dat"),
        vec![Reply::Transient, Reply::Transient],
    );
    let fetcher = DependencyFetcher::new(remote, BASE_URL, no_backoff(5));

    fetcher
        .fetch_with_retry(&url("a.dat"), &store.cached_file("a.dat"))
        .unwrap();
    assert_eq!(fetcher.remote().calls(), 3);
}

#[test]
fn retry_budget_is_bounded() {
    let (_temp, store) = data_root();
    let remote = ScriptedRemote::default().script(
        &url("a.dat"),
        (0..10).map(|_| Reply::Transient).collect(),
    );
    let fetcher = DependencyFetcher::new(remote, BASE_URL, no_backoff(3));
    let destination = store.cached_file("a.dat");

    let result = fetcher.fetch_with_retry(&url("a.dat"), &destination);
    assert_matches!(
        result,
        Err(FixtureError::FetchExhausted { attempts: 3, ref url }) if url.ends_with("a.dat")
    );
    assert_eq!(fetcher.remote().calls(), 3);
    assert!(!destination.as_std_path().exists());
}

#[test]
fn missing_remote_file_is_not_retried() {
    let (_temp, store) = data_root();
    let fetcher = DependencyFetcher::new(ScriptedRemote::default(), BASE_URL, no_backoff(5));

    let result = fetcher.fetch_with_retry(&url("gone.dat"), &store.cached_file("gone.dat"));
    assert_matches!(result, Err(FixtureError::HttpStatus { status: 404, .. }));
    assert_eq!(fetcher.remote().calls(), 1);
}

fn raw_case(name: &str, data_file: &str) -> CaseDeclaration {
    let mut case = CaseDeclaration::new(name.parse().unwrap());
    case.reconstruction_source = Some(ReconstructionSource::Raw(RawConversion::new(
        data_file, "1",
    )));
    case
}

#[test]
fn batch_downloads_each_distinct_file_once() {
    let (_temp, store) = data_root();
    let mut remote = ScriptedRemote::serving(&url("shared.dat"), b"shared");
    remote.defaults.insert(url("own.dat"), b"own");
    let fetcher = DependencyFetcher::new(remote, BASE_URL, no_backoff(5));
    let mut checksums = ChecksumTable::default();
    checksums.insert("shared.dat", bytes_checksum(b"shared"));
    checksums.insert("own.dat", bytes_checksum(b"own"));

    let a = raw_case("a.cfg", "shared.dat");
    let b = raw_case("b.cfg", "shared.dat");
    let c = raw_case("c.cfg", "own.dat");
    fetcher
        .fetch_all(&[&a, &b, &c], &checksums, &store, &TaskGroup::new(4))
        .unwrap();

    assert_eq!(fetcher.remote().calls_for(&url("shared.dat")), 1);
    assert_eq!(fetcher.remote().calls_for(&url("own.dat")), 1);
    assert!(store.cached_file("shared.dat").as_std_path().exists());
}

#[test]
fn batch_failure_reports_every_failed_file() {
    let (_temp, store) = data_root();
    let fetcher = DependencyFetcher::new(
        ScriptedRemote::serving(&url("ok.dat"), b"ok"),
        BASE_URL,
        no_backoff(2),
    );
    let mut checksums = ChecksumTable::default();
    checksums.insert("ok.dat", bytes_checksum(b"ok"));
    checksums.insert("gone.dat", bytes_checksum(b"gone"));

    let ok = raw_case("ok.cfg", "ok.dat");
    let gone = raw_case("gone.cfg", "gone.dat");
    let unknown = raw_case("unknown.cfg", "unlisted.dat");
    let result = fetcher.fetch_all(&[&ok, &gone, &unknown], &checksums, &store, &TaskGroup::new(2));

    assert_matches!(
        result,
        Err(FixtureError::BatchFailed { phase: BatchPhase::Download, ref failures }) => {
            let items = failures.iter().map(|failure| failure.item.as_str()).collect::<Vec<_>>();
            assert_eq!(items, vec!["gone.dat", "unlisted.dat"]);
        }
    );
    // Siblings of a failed download still complete.
    assert!(store.cached_file("ok.dat").as_std_path().exists());
}
