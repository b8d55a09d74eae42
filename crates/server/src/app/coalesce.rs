use super::AppState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::warn;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CursorKey {
    conversation_id: i64,
    user_id: i64,
    read: bool,
}

/// Batches the chattiest storage writes. A conversation touch keeps only
/// the newest timestamp per conversation, a receipt keeps only the
/// highest sequence per (conversation, user, kind); the flusher task
/// writes each surviving entry once per interval.
pub struct Coalescer {
    touches: Mutex<HashMap<i64, DateTime<Utc>>>,
    cursors: Mutex<HashMap<CursorKey, i64>>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self {
            touches: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn record_touch(&self, conversation_id: i64, at: DateTime<Utc>) {
        let mut touches = self.touches.lock().unwrap_or_else(|e| e.into_inner());
        let slot = touches.entry(conversation_id).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }

    pub(crate) fn record_cursor(&self, conversation_id: i64, user_id: i64, read: bool, seq: i64) {
        let key = CursorKey {
            conversation_id,
            user_id,
            read,
        };
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let slot = cursors.entry(key).or_insert(seq);
        if seq > *slot {
            *slot = seq;
        }
    }

    fn drain(&self) -> (HashMap<i64, DateTime<Utc>>, HashMap<CursorKey, i64>) {
        let touches = {
            let mut touches = self.touches.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *touches)
        };
        let cursors = {
            let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *cursors)
        };
        (touches, cursors)
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn run_flusher(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            flush(&state).await;
        }
    })
}

/// Entries that fail to write are dropped, not retried. A touch is
/// cosmetic ordering metadata and a cursor is re-established by the
/// client's next receipt, so losing one write window is harmless.
async fn flush(state: &Arc<AppState>) {
    let (touches, cursors) = state.coalescer.drain();
    for (conversation_id, at) in touches {
        if let Err(error) = state.storage.touch_conversation(conversation_id, at).await {
            warn!(conversation_id, %error, "conversation touch failed");
        }
    }
    for (key, seq) in cursors {
        if let Err(error) = state
            .storage
            .advance_cursor(key.conversation_id, key.user_id, key.read, seq)
            .await
        {
            warn!(
                conversation_id = key.conversation_id,
                user_id = key.user_id,
                %error,
                "cursor flush failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn touch_keeps_newest_timestamp() {
        let coalescer = Coalescer::new();
        let older = Utc.timestamp_millis_opt(1_000).single().unwrap();
        let newer = Utc.timestamp_millis_opt(2_000).single().unwrap();
        coalescer.record_touch(7, newer);
        coalescer.record_touch(7, older);
        let (touches, _) = coalescer.drain();
        assert_eq!(touches.get(&7), Some(&newer));
    }

    #[test]
    fn cursor_keeps_max_per_kind() {
        let coalescer = Coalescer::new();
        coalescer.record_cursor(7, 1, false, 10);
        coalescer.record_cursor(7, 1, false, 8);
        coalescer.record_cursor(7, 1, true, 6);
        let (_, cursors) = coalescer.drain();
        assert_eq!(cursors.len(), 2);
        let delivered = CursorKey {
            conversation_id: 7,
            user_id: 1,
            read: false,
        };
        let read = CursorKey {
            conversation_id: 7,
            user_id: 1,
            read: true,
        };
        assert_eq!(cursors.get(&delivered), Some(&10));
        assert_eq!(cursors.get(&read), Some(&6));
    }

    #[test]
    fn drain_leaves_maps_empty() {
        let coalescer = Coalescer::new();
        coalescer.record_touch(1, Utc::now());
        coalescer.record_cursor(1, 2, false, 3);
        let _ = coalescer.drain();
        let (touches, cursors) = coalescer.drain();
        assert!(touches.is_empty());
        assert!(cursors.is_empty());
    }
}
