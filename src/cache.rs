//! Fixed-capacity object cache with LRU eviction and a readers/writer
//! concurrency discipline.
//!
//! The textbook version of this cache (see the upstream C implementation
//! this proxy is descended from) guards a fixed array of cache lines with
//! three semaphores: one held exclusively by whichever writer is mutating
//! the set, one serializing increments/decrements of an active-reader
//! count, and one serializing timestamp bumps performed by readers. That
//! protocol is reproduced here with `tokio::sync::RwLock` standing in for
//! the write/reader-count semaphore pair (many concurrent readers, one
//! exclusive writer, no reader ever observes a torn write) and a plain
//! `AtomicU64` standing in for the timestamp semaphore (readers bump
//! recency without taking the write lock).

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Total cache budget in bytes: ten lines of 102,400 bytes each.
pub const MAX_CACHE_BYTES: usize = 1_049_000;
/// Per-object ceiling. An object larger than this is never cached.
pub const MAX_OBJECT_SIZE: usize = 102_400;
/// Fixed number of cache lines, derived from the two constants above.
pub const CACHE_LINES: usize = MAX_CACHE_BYTES / MAX_OBJECT_SIZE;

/// An owned, independent copy of a cached response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedObject {
    pub status_line: String,
    pub headers: String,
    pub body: Bytes,
    pub body_len: usize,
}

impl CachedObject {
    fn size(&self) -> usize {
        self.status_line.len() + self.headers.len() + self.body_len
    }
}

struct CacheLine {
    valid: bool,
    fingerprint: u32,
    timestamp: AtomicU64,
    object: Option<CachedObject>,
}

impl CacheLine {
    fn empty() -> Self {
        Self {
            valid: false,
            fingerprint: 0,
            timestamp: AtomicU64::new(0),
            object: None,
        }
    }
}

/// The shared, process-lifetime object cache. Cheaply `Clone`able; clones
/// share the same underlying line set.
#[derive(Clone)]
pub struct ObjectCache {
    lines: std::sync::Arc<RwLock<Vec<CacheLine>>>,
    clock: std::sync::Arc<AtomicU64>,
}

impl ObjectCache {
    pub fn new() -> Self {
        let mut lines = Vec::with_capacity(CACHE_LINES);
        for _ in 0..CACHE_LINES {
            lines.push(CacheLine::empty());
        }
        Self {
            lines: std::sync::Arc::new(RwLock::new(lines)),
            clock: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Looks up a cached response by request identity. On hit, bumps the
    /// line's recency and returns an owned, independent copy of the object.
    pub async fn fetch(&self, request_line: &str, request_headers: &str) -> Option<CachedObject> {
        let tag = fingerprint(request_line, request_headers);
        let lines = self.lines.read().await;

        let line = lines.iter().find(|l| l.valid && l.fingerprint == tag)?;
        line.timestamp
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        line.object.clone()
    }

    /// Stores a response keyed by request identity, evicting the
    /// least-recently-accessed line if the set is full. A no-op if the
    /// object exceeds [`MAX_OBJECT_SIZE`].
    pub async fn insert(
        &self,
        request_line: &str,
        request_headers: &str,
        status_line: String,
        headers: String,
        body: Bytes,
        body_len: usize,
    ) {
        let object = CachedObject {
            status_line,
            headers,
            body,
            body_len,
        };
        if object.size() > MAX_OBJECT_SIZE {
            return;
        }

        let tag = fingerprint(request_line, request_headers);
        let mut lines = self.lines.write().await;

        let idx = lines
            .iter()
            .position(|l| l.valid && l.fingerprint == tag)
            .or_else(|| lines.iter().position(|l| !l.valid))
            .unwrap_or_else(|| victim_index(&lines));

        let ts = self.clock.fetch_add(1, Ordering::Relaxed);
        let line = &mut lines[idx];
        line.valid = true;
        line.fingerprint = tag;
        *line.timestamp.get_mut() = ts;
        line.object = Some(object);
    }

    /// Number of occupied lines. Exposed for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.lines.read().await.iter().filter(|l| l.valid).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the occupied line with the smallest timestamp; ties broken by
/// lowest index. Every line is occupied by construction (callers only fall
/// back to this once `find_empty_line` fails).
fn victim_index(lines: &[CacheLine]) -> usize {
    let mut victim = 0;
    let mut lowest = lines[0].timestamp.load(Ordering::Relaxed);
    for (i, line) in lines.iter().enumerate().skip(1) {
        let ts = line.timestamp.load(Ordering::Relaxed);
        if ts < lowest {
            lowest = ts;
            victim = i;
        }
    }
    victim
}

/// DJB2 hash of `request_line || request_headers`, truncated to 32 bits.
/// Collisions are tolerated: a false hit returns a stale but well-formed
/// response, which is acceptable for this proxy's cache semantics.
pub fn fingerprint(request_line: &str, request_headers: &str) -> u32 {
    let mut hash: u32 = 5381;
    for &b in request_line.as_bytes().iter().chain(request_headers.as_bytes()) {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(tag: &str) -> (String, String, Bytes, usize) {
        let body = Bytes::from(format!("body-{tag}"));
        let len = body.len();
        (format!("GET /{tag}\r\n"), "Host: x\r\n\r\n".to_string(), body, len)
    }

    #[tokio::test]
    async fn miss_on_empty_cache() {
        let cache = ObjectCache::new();
        assert!(cache.fetch("GET /x\r\n", "Host: x\r\n\r\n").await.is_none());
    }

    #[tokio::test]
    async fn insert_then_fetch_round_trips() {
        let cache = ObjectCache::new();
        let (rl, rh, body, len) = obj("a");
        cache
            .insert(&rl, &rh, "HTTP/1.0 200 OK\r\n".to_string(), "Content-Length: 6\r\n\r\n".to_string(), body.clone(), len)
            .await;

        let hit = cache.fetch(&rl, &rh).await.unwrap();
        assert_eq!(hit.status_line, "HTTP/1.0 200 OK\r\n");
        assert_eq!(hit.body, body);
        assert_eq!(hit.body_len, len);
    }

    #[tokio::test]
    async fn repeated_insert_same_key_keeps_one_line_with_latest_value() {
        let cache = ObjectCache::new();
        let (rl, rh, _, _) = obj("a");

        for i in 0..5 {
            let body = Bytes::from(format!("v{i}"));
            let len = body.len();
            cache
                .insert(&rl, &rh, format!("HTTP/1.0 200 OK {i}\r\n"), "\r\n".to_string(), body, len)
                .await;
        }

        assert_eq!(cache.len().await, 1);
        let hit = cache.fetch(&rl, &rh).await.unwrap();
        assert_eq!(hit.status_line, "HTTP/1.0 200 OK 4\r\n");
        assert_eq!(hit.body, Bytes::from("v4"));
    }

    #[tokio::test]
    async fn eviction_drops_the_least_recently_used_key() {
        let cache = ObjectCache::new();

        for i in 0..CACHE_LINES {
            let (rl, rh, body, len) = obj(&format!("k{i}"));
            cache
                .insert(&rl, &rh, "HTTP/1.0 200 OK\r\n".to_string(), "\r\n".to_string(), body, len)
                .await;
        }
        assert_eq!(cache.len().await, CACHE_LINES);

        // Touch every key except k0 so it becomes the least recently used.
        for i in 1..CACHE_LINES {
            let (rl, rh, _, _) = obj(&format!("k{i}"));
            cache.fetch(&rl, &rh).await;
        }

        let (rl, rh, body, len) = obj("new");
        cache
            .insert(&rl, &rh, "HTTP/1.0 200 OK\r\n".to_string(), "\r\n".to_string(), body, len)
            .await;

        assert_eq!(cache.len().await, CACHE_LINES);
        let (k0_rl, k0_rh, _, _) = obj("k0");
        assert!(cache.fetch(&k0_rl, &k0_rh).await.is_none());
        assert!(cache.fetch(&rl, &rh).await.is_some());
    }

    #[tokio::test]
    async fn oversized_object_is_rejected() {
        let cache = ObjectCache::new();
        let body = Bytes::from(vec![0u8; MAX_OBJECT_SIZE + 1]);
        let len = body.len();
        cache
            .insert("GET /big\r\n", "\r\n", "HTTP/1.0 200 OK\r\n".to_string(), "\r\n".to_string(), body, len)
            .await;
        assert!(cache.fetch("GET /big\r\n", "\r\n").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn returned_copy_is_independent_of_internal_storage() {
        let cache = ObjectCache::new();
        let (rl, rh, body, len) = obj("a");
        cache
            .insert(&rl, &rh, "HTTP/1.0 200 OK\r\n".to_string(), "\r\n".to_string(), body, len)
            .await;

        let mut hit = cache.fetch(&rl, &rh).await.unwrap();
        hit.status_line.push_str("mutated");

        let hit_again = cache.fetch(&rl, &rh).await.unwrap();
        assert_eq!(hit_again.status_line, "HTTP/1.0 200 OK\r\n");
    }

    #[tokio::test]
    async fn fingerprint_is_stable_and_distinguishes_keys() {
        let a = fingerprint("GET /a HTTP/1.0\r\n", "Host: x\r\n\r\n");
        let b = fingerprint("GET /a HTTP/1.0\r\n", "Host: x\r\n\r\n");
        let c = fingerprint("GET /b HTTP/1.0\r\n", "Host: x\r\n\r\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn concurrent_fetch_and_insert_never_observes_a_torn_value() {
        use std::sync::Arc;

        let cache = Arc::new(ObjectCache::new());
        let (rl, rh, body, len) = obj("shared");
        cache
            .insert(&rl, &rh, "HTTP/1.0 200 OK\r\n".to_string(), "\r\n".to_string(), body, len)
            .await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let cache = cache.clone();
            let rl = rl.clone();
            let rh = rh.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let body = Bytes::from(format!("new-{i}"));
                    let len = body.len();
                    cache
                        .insert(&rl, &rh, format!("HTTP/1.0 200 OK {i}\r\n"), "\r\n".to_string(), body, len)
                        .await;
                    None
                } else {
                    cache.fetch(&rl, &rh).await
                }
            }));
        }

        for h in handles {
            if let Some(Some(obj)) = h.await.ok() {
                assert_eq!(obj.body.len(), obj.body_len);
                assert!(obj.status_line.starts_with("HTTP/1.0 200 OK"));
            }
        }
    }
}
