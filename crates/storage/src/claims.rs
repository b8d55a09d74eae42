use super::{Storage, StorageError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const IDEMPOTENCY_PREFIX: &str = "im:idem:client_msg_id:";
const EPOCH_PREFIX: &str = "im:auth:sv:";
const RESEND_LOCK_PREFIX: &str = "im:gw:lock:resend:";

const EPOCH_TTL_SECONDS: i64 = 90 * 24 * 3600;

/// After a Redis error, claims fail immediately for this long instead of
/// stacking every send behind a broken connection.
const FAIL_FAST_WINDOW: Duration = Duration::from_secs(10);

/// Entry count past which a store sweeps out expired claims.
const CACHE_SWEEP_LEN: usize = 65_536;

/// Epoch value reported when Redis cannot answer. Callers treat it as
/// "unknown" and skip enforcement rather than kicking everyone.
pub const EPOCH_UNKNOWN: i64 = -1;

const PEXPIRE_IF_MATCH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DEL_IF_MATCH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Result of claiming a client message identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting; the server id now owns the claim.
    New,
    /// A previous send already claimed this id; carries the server id
    /// assigned back then.
    Existing(String),
}

/// Key under which a (sender, tag, client id) triple is claimed. Exposed
/// so the stream producer can claim and append in one script.
pub fn idempotency_key(sender_id: i64, tag: &str, client_msg_id: &str) -> String {
    format!("{}{}:{}:{}", IDEMPOTENCY_PREFIX, sender_id, tag, client_msg_id)
}

fn claim_key(sender_id: i64, tag: &str, client_msg_id: &str) -> String {
    idempotency_key(sender_id, tag, client_msg_id)
}

struct CachedClaim {
    server_msg_id: String,
    expires_at: Instant,
}

/// In-process cache in front of the Redis claim keys. Repeat sends from a
/// reconnecting client are answered without a round trip, and claims fail
/// fast for a short window after a Redis error.
pub(crate) struct ClaimCache {
    inner: Mutex<ClaimCacheInner>,
}

struct ClaimCacheInner {
    entries: HashMap<String, CachedClaim>,
    fail_fast_until: Option<Instant>,
}

impl ClaimCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ClaimCacheInner {
                entries: HashMap::new(),
                fail_fast_until: None,
            }),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => {
                Some(cached.server_msg_id.clone())
            }
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, server_msg_id: &str, ttl_seconds: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.len() >= CACHE_SWEEP_LEN {
            let now = Instant::now();
            inner.entries.retain(|_, cached| cached.expires_at > now);
        }
        inner.entries.insert(
            key.to_string(),
            CachedClaim {
                server_msg_id: server_msg_id.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds.max(1) as u64),
            },
        );
    }

    fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key);
    }

    /// Whether Redis may be tried, clearing the window once it has passed.
    fn redis_usable(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.fail_fast_until {
            Some(until) if until > Instant::now() => false,
            Some(_) => {
                inner.fail_fast_until = None;
                true
            }
            None => true,
        }
    }

    fn note_redis_error(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.fail_fast_until = Some(Instant::now() + FAIL_FAST_WINDOW);
    }
}

impl Storage {
    /// Claims a (sender, tag, client id) triple for the given server id.
    /// A duplicate send returns the server id recorded by the first one,
    /// so the client can receive the same acknowledgement twice.
    pub async fn claim_msg_id(
        &self,
        sender_id: i64,
        tag: &str,
        client_msg_id: &str,
        server_msg_id: &str,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome, StorageError> {
        let key = claim_key(sender_id, tag, client_msg_id);
        if let Some(existing) = self.claims.lookup(&key) {
            return Ok(ClaimOutcome::Existing(existing));
        }
        if !self.claims.redis_usable() {
            return Err(StorageError::Redis);
        }
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(server_msg_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| {
                self.claims.note_redis_error();
                StorageError::Redis
            })?;
        if set.is_some() {
            self.claims.store(&key, server_msg_id, ttl_seconds);
            return Ok(ClaimOutcome::New);
        }
        let existing: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| {
                self.claims.note_redis_error();
                StorageError::Redis
            })?;
        match existing {
            Some(server_id) => {
                self.claims.store(&key, &server_id, ttl_seconds);
                Ok(ClaimOutcome::Existing(server_id))
            }
            // The claim expired between SET and GET; let the send proceed.
            None => Ok(ClaimOutcome::New),
        }
    }

    /// Drops a claim so a retried send can re-persist after a failure.
    pub async fn forget_msg_id(
        &self,
        sender_id: i64,
        tag: &str,
        client_msg_id: &str,
    ) -> Result<(), StorageError> {
        let key = claim_key(sender_id, tag, client_msg_id);
        self.claims.remove(&key);
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Advances a user's session epoch, invalidating tokens minted against
    /// older epochs.
    pub async fn bump_epoch(&self, user_id: i64) -> Result<i64, StorageError> {
        let key = format!("{}{}", EPOCH_PREFIX, user_id);
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let epoch: i64 = redis::cmd("INCR")
            .arg(&key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(EPOCH_TTL_SECONDS)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(epoch)
    }

    /// Reads a user's current session epoch. Absent means the user has
    /// never been bumped, which is epoch zero. Redis failures report
    /// [`EPOCH_UNKNOWN`] instead of an error.
    pub async fn current_epoch(&self, user_id: i64) -> i64 {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let value: Result<Option<i64>, _> = redis::cmd("GET")
            .arg(format!("{}{}", EPOCH_PREFIX, user_id))
            .query_async::<Option<i64>>(&mut *conn)
            .await;
        match value {
            Ok(epoch) => epoch.unwrap_or(0),
            Err(error) => {
                tracing::warn!(user_id = user_id, "epoch lookup failed: {}", error);
                EPOCH_UNKNOWN
            }
        }
    }

    /// Takes the short resend lock for a user. On Redis failure the lock
    /// is granted so replay still happens after an outage.
    pub async fn acquire_resend_lock(&self, user_id: i64, ttl_seconds: i64) -> bool {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let set: Result<Option<String>, _> = redis::cmd("SET")
            .arg(format!("{}{}", RESEND_LOCK_PREFIX, user_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<Option<String>>(&mut *conn)
            .await;
        match set {
            Ok(outcome) => outcome.is_some(),
            Err(error) => {
                tracing::warn!(user_id = user_id, "resend lock failed: {}", error);
                true
            }
        }
    }

    /// Attempts to take a named leader lease for `ttl_ms`.
    pub async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(set.is_some())
    }

    /// Extends a held lease. Returns false when another owner has taken
    /// it over, at which point the caller must stop acting as leader.
    pub async fn renew_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let renewed: i64 = redis::Script::new(PEXPIRE_IF_MATCH)
            .key(key)
            .arg(owner)
            .arg(ttl_ms.max(1))
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(renewed == 1)
    }

    /// Releases a lease held by `owner`; a lease stolen by someone else
    /// is left alone.
    pub async fn release_lease(&self, key: &str, owner: &str) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let deleted: i64 = redis::Script::new(DEL_IF_MATCH)
            .key(key)
            .arg(owner)
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_answers_repeat_lookups() {
        let cache = ClaimCache::new();
        let key = idempotency_key(7, "SINGLE_CHAT", "c1");
        assert_eq!(cache.lookup(&key), None);
        cache.store(&key, "msg-a", 60);
        assert_eq!(cache.lookup(&key), Some("msg-a".to_string()));
        cache.remove(&key);
        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn redis_error_opens_fail_fast_window() {
        let cache = ClaimCache::new();
        assert!(cache.redis_usable());
        cache.note_redis_error();
        assert!(!cache.redis_usable());
    }

    #[test]
    fn claim_keys_scope_by_sender_and_tag() {
        let a = idempotency_key(1, "SINGLE_CHAT", "c1");
        let b = idempotency_key(1, "GROUP_CHAT", "c1");
        let c = idempotency_key(2, "SINGLE_CHAT", "c1");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
