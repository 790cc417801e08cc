//! Instrumented in-memory object store for tests.

use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use object_store::path::Path;
use object_store::{
    Attributes, Error, GetOptions, GetRange, GetResult, GetResultPayload, ListResult,
    MultipartUpload, ObjectMeta, ObjectStore, PutMode, PutMultipartOptions, PutOptions, PutPayload,
    PutResult, Result,
};

/// In-memory object store that records how it is used.
///
/// Beyond storing objects, the mock counts `get_opts` calls per object,
/// remembers every requested range, and tracks how many payload streams are
/// currently open (a stream counts as open until it is dropped). Bounded
/// ranges reaching past the end of an object are clamped, the way S3 clamps
/// them, so requests near the object tail deliver fewer bytes than asked for.
///
/// Cloning shares the underlying storage and instrumentation, so a test can
/// hand a clone to the code under test and keep inspecting the original.
#[derive(Debug, Default, Clone)]
pub struct MockStore {
    storage: SharedStorage,
    open_streams: Arc<AtomicUsize>,
    chunk_size: Arc<AtomicUsize>,
    fail_requests: Arc<AtomicBool>,
}

/// A specialized `Error` for mock store failures.
#[derive(Debug, thiserror::Error)]
enum MockStoreError {
    #[error("no object at {path}")]
    NoSuchObject { path: String },

    #[error("object already exists at {path}")]
    AlreadyExists { path: String },

    #[error("range {start}..{end} cannot be satisfied by an object of {object_size} bytes")]
    InvalidRange {
        start: u64,
        end: u64,
        object_size: u64,
    },

    #[error("injected failure for {path}")]
    InjectedFailure { path: String },
}

impl From<MockStoreError> for Error {
    fn from(source: MockStoreError) -> Self {
        match source {
            MockStoreError::NoSuchObject { ref path } => Self::NotFound {
                path: path.clone(),
                source: source.into(),
            },
            MockStoreError::AlreadyExists { ref path } => Self::AlreadyExists {
                path: path.clone(),
                source: source.into(),
            },
            _ => Self::Generic {
                store: "MockStore",
                source: Box::new(source),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    last_modified: DateTime<Utc>,
    attributes: Attributes,
    e_tag: usize,
    access_count: Arc<AtomicUsize>,
    access_ranges: Arc<Mutex<Vec<Range<u64>>>>,
}

impl Entry {
    fn new(data: Bytes, last_modified: DateTime<Utc>, e_tag: usize, attributes: Attributes) -> Self {
        Self {
            data,
            last_modified,
            attributes,
            e_tag,
            access_count: Arc::new(AtomicUsize::new(0)),
            access_ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn meta(&self, location: &Path) -> ObjectMeta {
        ObjectMeta {
            location: location.clone(),
            last_modified: self.last_modified,
            size: self.data.len() as u64,
            e_tag: Some(self.e_tag.to_string()),
            version: None,
        }
    }
}

#[derive(Debug, Default)]
struct Storage {
    next_etag: usize,
    map: BTreeMap<Path, Entry>,
}

type SharedStorage = Arc<RwLock<Storage>>;

impl std::fmt::Display for MockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockStore")
    }
}

impl MockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with `file_count` objects of `file_size`
    /// bytes each, named `0.bin`, `1.bin`, and so on.
    ///
    /// Byte `i` of each object holds `i % 256`, which makes range contents
    /// easy to verify.
    pub fn new_with_files(file_count: usize, file_size: usize) -> Self {
        let store = Self::new();
        {
            let mut storage = store.storage.write().unwrap();
            let data: Vec<u8> = (0..file_size).map(|i| (i % 256) as u8).collect();
            for file_name in 0..file_count {
                let path = Path::from(format!("{file_name}.bin"));
                let e_tag = storage.next_etag;
                storage.next_etag += 1;
                let entry = Entry::new(
                    Bytes::from(data.clone()),
                    Utc::now(),
                    e_tag,
                    Attributes::default(),
                );
                storage.map.insert(path, entry);
            }
        }
        store
    }

    /// Number of `get_opts` calls made against `location`.
    pub fn request_count(&self, location: &Path) -> Option<usize> {
        self.storage
            .read()
            .unwrap()
            .map
            .get(location)
            .map(|entry| entry.access_count.load(Ordering::SeqCst))
    }

    /// Ranges requested from `location`, in request order. Full-object reads
    /// are recorded as `0..object_size`.
    pub fn requested_ranges(&self, location: &Path) -> Option<Vec<Range<u64>>> {
        self.storage
            .read()
            .unwrap()
            .map
            .get(location)
            .map(|entry| entry.access_ranges.lock().unwrap().clone())
    }

    /// Number of payload streams handed out and not yet dropped.
    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Deliver payloads in chunks of at most `chunk_size` bytes. Zero (the
    /// default) delivers each payload as a single chunk.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.chunk_size.store(chunk_size, Ordering::SeqCst);
    }

    /// While set, every `get_opts` call fails with a transport error.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    fn entry(&self, location: &Path) -> Result<Entry> {
        let storage = self.storage.read().unwrap();
        let entry = storage
            .map
            .get(location)
            .cloned()
            .ok_or_else(|| MockStoreError::NoSuchObject {
                path: location.to_string(),
            })?;
        Ok(entry)
    }

    fn payload_stream(&self, data: Bytes) -> BoxStream<'static, Result<Bytes>> {
        let chunk_size = self.chunk_size.load(Ordering::SeqCst);
        let mut chunks = Vec::new();
        let mut rest = data;
        if chunk_size > 0 {
            while rest.len() > chunk_size {
                chunks.push(rest.split_to(chunk_size));
            }
        }
        if !rest.is_empty() {
            chunks.push(rest);
        }
        TrackedStream {
            chunks: chunks.into_iter(),
            _guard: StreamGuard::new(Arc::clone(&self.open_streams)),
        }
        .boxed()
    }
}

/// Keeps the open-stream counter accurate: incremented when a payload stream
/// is created, decremented when the stream is dropped.
struct StreamGuard {
    open_streams: Arc<AtomicUsize>,
}

impl StreamGuard {
    fn new(open_streams: Arc<AtomicUsize>) -> Self {
        open_streams.fetch_add(1, Ordering::SeqCst);
        Self { open_streams }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TrackedStream {
    chunks: std::vec::IntoIter<Bytes>,
    _guard: StreamGuard,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().chunks.next().map(Ok))
    }
}

/// Clamp a requested range against the object size. Bounded ranges ending
/// past the object are truncated; ranges starting past it are unsatisfiable.
fn clamped_range(range: &GetRange, object_size: u64) -> Result<Range<u64>> {
    let invalid = |start: u64, end: u64| MockStoreError::InvalidRange {
        start,
        end,
        object_size,
    };
    match range {
        GetRange::Bounded(r) => {
            if r.start >= r.end || r.start >= object_size {
                return Err(invalid(r.start, r.end).into());
            }
            Ok(r.start..r.end.min(object_size))
        }
        GetRange::Offset(offset) => {
            if *offset >= object_size {
                return Err(invalid(*offset, object_size).into());
            }
            Ok(*offset..object_size)
        }
        GetRange::Suffix(suffix) => Ok(object_size.saturating_sub(*suffix)..object_size),
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<PutResult> {
        let mut storage = self.storage.write().unwrap();
        let e_tag = storage.next_etag;
        storage.next_etag += 1;
        let entry = Entry::new(payload.into(), Utc::now(), e_tag, opts.attributes);

        match opts.mode {
            PutMode::Overwrite => {
                storage.map.insert(location.clone(), entry);
            }
            PutMode::Create => match storage.map.entry(location.clone()) {
                btree_map::Entry::Occupied(_) => {
                    return Err(MockStoreError::AlreadyExists {
                        path: location.to_string(),
                    }
                    .into());
                }
                btree_map::Entry::Vacant(v) => {
                    v.insert(entry);
                }
            },
            PutMode::Update(_) => unreachable!("MockStore does not support conditional update"),
        }

        Ok(PutResult {
            e_tag: Some(e_tag.to_string()),
            version: None,
        })
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(MockStoreError::InjectedFailure {
                path: location.to_string(),
            }
            .into());
        }

        let entry = self.entry(location)?;
        entry.access_count.fetch_add(1, Ordering::SeqCst);

        let object_size = entry.data.len() as u64;
        let (range, data) = match &options.range {
            Some(range) => {
                let r = clamped_range(range, object_size)?;
                (
                    r.clone(),
                    entry.data.slice(r.start as usize..r.end as usize),
                )
            }
            None => (0..object_size, entry.data.clone()),
        };
        entry.access_ranges.lock().unwrap().push(range.clone());

        Ok(GetResult {
            payload: GetResultPayload::Stream(self.payload_stream(data)),
            attributes: entry.attributes.clone(),
            meta: entry.meta(location),
            range,
        })
    }

    async fn head(&self, location: &Path) -> Result<ObjectMeta> {
        let entry = self.entry(location)?;
        Ok(entry.meta(location))
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        self.storage.write().unwrap().map.remove(location);
        Ok(())
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, Result<ObjectMeta>> {
        let root = Path::default();
        let prefix = prefix.unwrap_or(&root);

        let storage = self.storage.read().unwrap();
        let metas: Vec<_> = storage
            .map
            .iter()
            .filter(|(path, _)| {
                path.prefix_match(prefix)
                    .map(|mut parts| parts.next().is_some())
                    .unwrap_or(false)
            })
            .map(|(path, entry)| Ok(entry.meta(path)))
            .collect();

        futures::stream::iter(metas).boxed()
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        let root = Path::default();
        let prefix = prefix.unwrap_or(&root);

        let mut common_prefixes = BTreeSet::new();
        let mut objects = Vec::new();
        for (path, entry) in self.storage.read().unwrap().map.iter() {
            let Some(mut parts) = path.prefix_match(prefix) else {
                continue;
            };
            let Some(first) = parts.next() else {
                continue;
            };
            if parts.next().is_some() {
                common_prefixes.insert(prefix.child(first));
            } else {
                objects.push(entry.meta(path));
            }
        }

        Ok(ListResult {
            objects,
            common_prefixes: common_prefixes.into_iter().collect(),
        })
    }

    async fn put_multipart_opts(
        &self,
        _location: &Path,
        _opts: PutMultipartOptions,
    ) -> Result<Box<dyn MultipartUpload>> {
        unreachable!("MockStore does not support multipart upload")
    }

    async fn copy(&self, _from: &Path, _to: &Path) -> Result<()> {
        unreachable!("MockStore does not support copy")
    }

    async fn copy_if_not_exists(&self, _from: &Path, _to: &Path) -> Result<()> {
        unreachable!("MockStore does not support copy_if_not_exists")
    }
}
