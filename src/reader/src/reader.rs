//! Buffered random-access reads over a single remote object.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore};

use blobbuf_common::ObjectLocator;

use crate::error::{ReaderError, Result};
use crate::stats::{ReaderStats, ReaderStatsSnapshot};

/// The contiguous byte range of the remote object currently held in memory.
///
/// `data` always holds exactly the cache capacity once a refill succeeds.
struct Window {
    start: u64,
    data: Bytes,
}

impl Window {
    fn contains(&self, offset: u64, len: usize) -> bool {
        offset >= self.start && offset + len as u64 <= self.start + self.data.len() as u64
    }
}

/// Long-lived stream over the full object, consumed by sequential reads.
///
/// Chunks arrive from the store in whatever sizes the transport picks, so a
/// partially consumed chunk is kept around for the next read.
struct SequentialStream {
    chunks: BoxStream<'static, object_store::Result<Bytes>>,
    pending: Bytes,
    exhausted: bool,
}

impl SequentialStream {
    fn new(chunks: BoxStream<'static, object_store::Result<Bytes>>) -> Self {
        Self {
            chunks,
            pending: Bytes::new(),
            exhausted: false,
        }
    }

    /// Reads at most one chunk's worth of bytes into `dest`, returning
    /// `Ok(0)` once the stream is exhausted.
    async fn read(&mut self, dest: &mut [u8]) -> object_store::Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            if self.exhausted {
                return Ok(0);
            }
            match self.chunks.next().await {
                Some(chunk) => self.pending = chunk?,
                None => {
                    self.exhausted = true;
                    return Ok(0);
                }
            }
        }
        let n = dest.len().min(self.pending.len());
        dest[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// Single-slot read-ahead buffer over a remote object.
///
/// `read_at` serves a request from the cached window when the requested range
/// lies entirely inside it. A smaller-than-capacity miss refills the whole
/// window with one range fetch starting at the requested offset; a request at
/// least as large as the capacity bypasses the cache and streams directly
/// into the caller's buffer. `read` consumes the object sequentially through
/// a stream opened at construction and never touches the window.
///
/// There is no internal synchronization: all I/O methods take `&mut self`,
/// so concurrent use of one reader requires external coordination.
///
/// Note that a refill always demands a full window of bytes, so small
/// `read_at` requests within the last `capacity` bytes of the object fail
/// with [`ReaderError::ShortRead`]; reads of the object tail should either be
/// at least `capacity` long or land inside an already cached window.
pub struct BufferedReader {
    store: Arc<dyn ObjectStore>,
    location: Path,
    capacity: usize,
    window: Option<Window>,
    stream: Option<SequentialStream>,
    stats: ReaderStats,
}

impl BufferedReader {
    /// Opens `location` in `store` with a cache window of `capacity` bytes.
    ///
    /// The sequential stream over the full object is opened eagerly;
    /// construction fails with [`ReaderError::Open`] if the object cannot be
    /// read. The cache starts empty.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        location: Path,
        capacity: usize,
    ) -> Result<Self> {
        assert!(capacity > 0, "cache capacity must be positive");
        let result = store.get(&location).await.map_err(|source| ReaderError::Open {
            location: location.clone(),
            source,
        })?;
        let stream = SequentialStream::new(result.into_stream());
        log::debug!("opened {location} with a {capacity} byte cache window");
        Ok(Self {
            store,
            location,
            capacity,
            window: None,
            stream: Some(stream),
            stats: ReaderStats::default(),
        })
    }

    /// Resolves an object URL such as `s3://bucket/key` and opens it.
    ///
    /// Fails with [`ReaderError::Connection`] when no backend client can be
    /// created for the URL.
    pub async fn open_url(url: &str, capacity: usize) -> Result<Self> {
        let locator = ObjectLocator::parse(url)?;
        let (store, location) = locator.connect()?;
        Self::open(store, location, capacity).await
    }

    /// Reads `dest.len()` bytes starting at absolute `offset` in the object.
    ///
    /// Requests covered by the cached window are served from memory without
    /// touching the store. A miss smaller than the cache capacity refills the
    /// window with one range fetch of exactly `capacity` bytes at `offset`
    /// and fails with [`ReaderError::ShortRead`] if the object ends before
    /// the window is full, leaving the previous window intact. A request of
    /// at least `capacity` bytes is fetched directly into `dest`, without
    /// updating the window; its return value is the number of bytes actually
    /// delivered, which is smaller than `dest.len()` when the object ends
    /// inside the requested range.
    pub async fn read_at(&mut self, dest: &mut [u8], offset: u64) -> Result<usize> {
        if self.stream.is_none() {
            return Err(ReaderError::InvalidState);
        }

        if let Some(window) = &self.window {
            if window.contains(offset, dest.len()) {
                let lo = (offset - window.start) as usize;
                dest.copy_from_slice(&window.data[lo..lo + dest.len()]);
                self.stats.incr_cache_hit();
                log::debug!("read_at {} bytes at {offset}: cache hit", dest.len());
                return Ok(dest.len());
            }
        }

        if dest.len() < self.capacity {
            let mut staging = vec![0u8; self.capacity];
            let filled = self.fetch_into(&mut staging, offset).await?;
            if filled < self.capacity {
                return Err(ReaderError::ShortRead {
                    offset,
                    expected: self.capacity,
                    actual: filled,
                });
            }
            let window = self.window.insert(Window {
                start: offset,
                data: Bytes::from(staging),
            });
            dest.copy_from_slice(&window.data[..dest.len()]);
            self.stats.incr_refill();
            log::debug!("read_at {} bytes at {offset}: refilled window", dest.len());
            return Ok(dest.len());
        }

        let filled = self.fetch_into(dest, offset).await?;
        self.stats.incr_bypass();
        log::debug!(
            "read_at {} bytes at {offset}: bypassed cache, {filled} bytes delivered",
            dest.len()
        );
        Ok(filled)
    }

    /// Sequential read from the long-lived stream opened at construction.
    ///
    /// Advances the stream position only; the cached window is never
    /// consulted or modified, and no range fetch is issued. May return fewer
    /// bytes than `dest.len()`; returns `Ok(0)` once the object is exhausted.
    pub async fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(ReaderError::InvalidState)?;
        let n = stream.read(dest).await?;
        self.stats.incr_sequential_read();
        Ok(n)
    }

    /// Closes the sequential stream. A second close is a no-op.
    ///
    /// Every subsequent `read_at` or `read` fails with
    /// [`ReaderError::InvalidState`]. The cache buffer holds no remote
    /// resource and needs no release.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("closed {}", self.location);
        }
    }

    /// The fixed cache capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The object this reader is bound to.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The byte range of the object currently held in the cache window, if a
    /// refill has succeeded.
    pub fn cached_range(&self) -> Option<Range<u64>> {
        self.window
            .as_ref()
            .map(|window| window.start..window.start + window.data.len() as u64)
    }

    /// Snapshot of the diagnostic counters.
    pub fn stats(&self) -> ReaderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fetches `[offset, offset + dest.len())` with one range request,
    /// filling `dest` from the front and returning the number of bytes
    /// written. Fewer bytes than `dest.len()` are written when the object
    /// ends inside the range. The transient stream is dropped before this
    /// returns, on success and on error.
    async fn fetch_into(&self, dest: &mut [u8], offset: u64) -> Result<usize> {
        let options = GetOptions {
            range: Some(GetRange::Bounded(offset..offset + dest.len() as u64)),
            ..Default::default()
        };
        let result = self.store.get_opts(&self.location, options).await?;
        let mut chunks = result.into_stream();
        let mut filled = 0;
        while filled < dest.len() {
            match chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    let n = chunk.len().min(dest.len() - filled);
                    dest[filled..filled + n].copy_from_slice(&chunk[..n]);
                    filled += n;
                }
                None => break,
            }
        }
        Ok(filled)
    }
}

impl fmt::Debug for BufferedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedReader")
            .field("location", &self.location)
            .field("capacity", &self.capacity)
            .field("cached_range", &self.cached_range())
            .field("closed", &self.stream.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobbuf_common::mock_store::MockStore;

    fn object() -> Path {
        Path::from("0.bin")
    }

    async fn open_reader(store: &MockStore, capacity: usize) -> BufferedReader {
        BufferedReader::open(Arc::new(store.clone()), object(), capacity)
            .await
            .unwrap()
    }

    // Objects from MockStore::new_with_files hold `i % 256` at byte `i`.
    fn expect_pattern(buf: &[u8], start: u64) {
        for (i, byte) in buf.iter().enumerate() {
            assert_eq!(
                *byte,
                ((start + i as u64) % 256) as u8,
                "mismatch at position {i}"
            );
        }
    }

    #[tokio::test]
    async fn open_fails_for_missing_object() {
        let store = MockStore::new();
        let err = BufferedReader::open(Arc::new(store), object(), 1024)
            .await
            .unwrap_err();
        match err {
            ReaderError::Open { location, source } => {
                assert_eq!(location, object());
                assert!(matches!(source, object_store::Error::NotFound { .. }));
            }
            other => panic!("expected Open error, got {other:?}"),
        }
    }

    #[tokio::test]
    #[should_panic(expected = "cache capacity must be positive")]
    async fn zero_capacity_is_rejected() {
        let store = MockStore::new_with_files(1, 128);
        let _ = BufferedReader::open(Arc::new(store), object(), 0).await;
    }

    // The three-branch walk: refill at 0, hit inside the window, then a
    // window-sized read at 1024 that bypasses the cache.
    #[tokio::test]
    async fn refill_hit_and_bypass() {
        let store = MockStore::new_with_files(1, 2048);
        let mut reader = open_reader(&store, 1024).await;

        let mut buf = vec![0u8; 100];
        assert_eq!(reader.read_at(&mut buf, 0).await.unwrap(), 100);
        expect_pattern(&buf, 0);
        assert_eq!(reader.cached_range(), Some(0..1024));
        // One request from open (full stream), one from the refill.
        assert_eq!(store.requested_ranges(&object()).unwrap(), vec![0..2048, 0..1024]);

        let mut buf = vec![0u8; 50];
        assert_eq!(reader.read_at(&mut buf, 500).await.unwrap(), 50);
        expect_pattern(&buf, 500);
        assert_eq!(store.request_count(&object()), Some(2));

        let mut buf = vec![0u8; 1024];
        assert_eq!(reader.read_at(&mut buf, 1024).await.unwrap(), 1024);
        expect_pattern(&buf, 1024);
        assert_eq!(reader.cached_range(), Some(0..1024));
        assert_eq!(
            store.requested_ranges(&object()).unwrap(),
            vec![0..2048, 0..1024, 1024..2048]
        );

        let stats = reader.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.refills, 1);
        assert_eq!(stats.bypasses, 1);
    }

    #[tokio::test]
    async fn cache_hit_never_touches_the_store() {
        let store = MockStore::new_with_files(1, 2048);
        let mut reader = open_reader(&store, 1024).await;

        let mut buf = vec![0u8; 100];
        reader.read_at(&mut buf, 256).await.unwrap();
        assert_eq!(reader.cached_range(), Some(256..1280));

        // Any store request from here on fails, so a hit must not fetch.
        store.set_fail_requests(true);

        let mut buf = vec![0u8; 512];
        assert_eq!(reader.read_at(&mut buf, 700).await.unwrap(), 512);
        expect_pattern(&buf, 700);

        // A miss does fetch and therefore fails.
        let err = reader.read_at(&mut buf, 1400).await.unwrap_err();
        assert!(matches!(err, ReaderError::Transport(_)));
    }

    #[tokio::test]
    async fn refill_replaces_previous_window() {
        let store = MockStore::new_with_files(1, 2048);
        let mut reader = open_reader(&store, 256).await;

        let mut buf = vec![0u8; 16];
        reader.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(reader.cached_range(), Some(0..256));

        // A range straddling the window edge is a miss, not a partial hit.
        let mut buf = vec![0u8; 32];
        reader.read_at(&mut buf, 240).await.unwrap();
        expect_pattern(&buf, 240);
        assert_eq!(reader.cached_range(), Some(240..496));

        // The new window serves hits without fetching; the old one is gone.
        store.set_fail_requests(true);
        let mut buf = vec![0u8; 64];
        assert_eq!(reader.read_at(&mut buf, 400).await.unwrap(), 64);
        expect_pattern(&buf, 400);
        assert!(reader.read_at(&mut buf, 0).await.is_err());
    }

    #[tokio::test]
    async fn short_refill_fails_and_keeps_previous_window() {
        let store = MockStore::new_with_files(1, 2048);
        let mut reader = open_reader(&store, 1024).await;

        let mut buf = vec![0u8; 100];
        reader.read_at(&mut buf, 0).await.unwrap();

        // Only 548 bytes remain at offset 1500; the refill demands 1024.
        let err = reader.read_at(&mut buf, 1500).await.unwrap_err();
        match err {
            ReaderError::ShortRead {
                offset,
                expected,
                actual,
            } => {
                assert_eq!(offset, 1500);
                assert_eq!(expected, 1024);
                assert_eq!(actual, 548);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }

        // The previous window still serves hits, without any fetch.
        assert_eq!(reader.cached_range(), Some(0..1024));
        store.set_fail_requests(true);
        let mut buf = vec![0u8; 50];
        assert_eq!(reader.read_at(&mut buf, 500).await.unwrap(), 50);
        expect_pattern(&buf, 500);
    }

    #[tokio::test]
    async fn short_refill_with_no_window_leaves_sentinel() {
        let store = MockStore::new_with_files(1, 512);
        let mut reader = open_reader(&store, 1024).await;

        let mut buf = vec![0u8; 10];
        let err = reader.read_at(&mut buf, 0).await.unwrap_err();
        assert!(matches!(
            err,
            ReaderError::ShortRead {
                expected: 1024,
                actual: 512,
                ..
            }
        ));
        assert_eq!(reader.cached_range(), None);
    }

    #[tokio::test]
    async fn bypass_never_populates_the_window() {
        let store = MockStore::new_with_files(1, 512);
        let mut reader = open_reader(&store, 128).await;

        let mut buf = vec![0u8; 128];
        assert_eq!(reader.read_at(&mut buf, 0).await.unwrap(), 128);
        expect_pattern(&buf, 0);
        assert_eq!(reader.cached_range(), None);
        assert_eq!(store.requested_ranges(&object()).unwrap(), vec![0..512, 0..128]);
        assert_eq!(reader.stats().bypasses, 1);
    }

    #[tokio::test]
    async fn bypass_forwards_short_delivery_as_byte_count() {
        let store = MockStore::new_with_files(1, 800);
        let mut reader = open_reader(&store, 256).await;

        let mut buf = vec![0u8; 600];
        // Only 500 bytes exist past offset 300.
        assert_eq!(reader.read_at(&mut buf, 300).await.unwrap(), 500);
        expect_pattern(&buf[..500], 300);
        assert!(buf[500..].iter().all(|byte| *byte == 0));
        assert_eq!(reader.cached_range(), None);
    }

    #[tokio::test]
    async fn zero_length_read_at_with_empty_cache_still_refills() {
        let store = MockStore::new_with_files(1, 256);
        let mut reader = open_reader(&store, 64).await;

        let mut buf = [0u8; 0];
        assert_eq!(reader.read_at(&mut buf, 10).await.unwrap(), 0);
        assert_eq!(reader.cached_range(), Some(10..74));
    }

    #[tokio::test]
    async fn sequential_read_is_independent_of_the_window() {
        let store = MockStore::new_with_files(1, 2048);
        store.set_chunk_size(100);
        let mut reader = open_reader(&store, 256).await;

        let mut collected = Vec::new();
        while collected.len() < 300 {
            let mut buf = vec![0u8; 150];
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        expect_pattern(&collected, 0);
        assert_eq!(reader.cached_range(), None);
        // Only the full-object request from open; no range fetches.
        assert_eq!(store.request_count(&object()), Some(1));

        // A refill in between does not disturb the sequential position.
        let mut buf = vec![0u8; 32];
        reader.read_at(&mut buf, 512).await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = reader.read(&mut buf).await.unwrap();
        expect_pattern(&buf[..n], collected.len() as u64);
        assert!(reader.stats().sequential_reads >= 4);
    }

    #[tokio::test]
    async fn sequential_read_signals_end_of_object() {
        let store = MockStore::new_with_files(1, 64);
        let mut reader = open_reader(&store, 16).await;

        let mut total = 0;
        loop {
            let mut buf = vec![0u8; 50];
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            expect_pattern(&buf[..n], total as u64);
            total += n;
        }
        assert_eq!(total, 64);

        let mut buf = vec![0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_streams_are_released_on_every_path() {
        let store = MockStore::new_with_files(1, 1024);
        store.set_chunk_size(64);
        let mut reader = open_reader(&store, 256).await;
        // The sequential stream stays open for the reader's lifetime.
        assert_eq!(store.open_stream_count(), 1);

        let mut buf = vec![0u8; 100];
        reader.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(store.open_stream_count(), 1);

        let mut buf = vec![0u8; 512];
        reader.read_at(&mut buf, 128).await.unwrap();
        assert_eq!(store.open_stream_count(), 1);

        // Error path: a refill near the object end comes up short.
        let mut buf = vec![0u8; 100];
        reader.read_at(&mut buf, 900).await.unwrap_err();
        assert_eq!(store.open_stream_count(), 1);

        reader.close();
        assert_eq!(store.open_stream_count(), 0);
        reader.close();
        assert_eq!(store.open_stream_count(), 0);
    }

    #[tokio::test]
    async fn closed_reader_rejects_operations() {
        let store = MockStore::new_with_files(1, 512);
        let mut reader = open_reader(&store, 128).await;
        reader.close();

        let mut buf = vec![0u8; 16];
        assert!(matches!(
            reader.read_at(&mut buf, 0).await.unwrap_err(),
            ReaderError::InvalidState
        ));
        assert!(matches!(
            reader.read(&mut buf).await.unwrap_err(),
            ReaderError::InvalidState
        ));
    }

    #[tokio::test]
    async fn transport_errors_pass_through_unwrapped() {
        let store = MockStore::new_with_files(1, 512);
        let mut reader = open_reader(&store, 128).await;

        store.set_fail_requests(true);
        let mut buf = vec![0u8; 16];
        let err = reader.read_at(&mut buf, 0).await.unwrap_err();
        assert!(matches!(err, ReaderError::Transport(_)));
    }

    #[tokio::test]
    async fn open_url_rejects_malformed_input() {
        let err = BufferedReader::open_url("definitely not a url", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Connection(_)));
    }

    #[tokio::test]
    async fn open_url_reports_missing_object() {
        // A fresh in-memory store holds nothing, so the open itself fails.
        let err = BufferedReader::open_url("memory:///missing.bin", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Open { .. }));
    }
}
