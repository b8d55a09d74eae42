use super::{Storage, StorageError};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

/// Stream of accepted sends awaiting delivery.
pub const ACCEPTED_STREAM: &str = "im:stream:single_chat:accepted";
/// Stream of delivered sends awaiting persistence.
pub const SAVE_STREAM: &str = "im:stream:single_chat:to_save";
/// Consumer group draining [`ACCEPTED_STREAM`].
pub const DELIVER_GROUP: &str = "im:cg:single_chat:deliver";
/// Consumer group draining [`SAVE_STREAM`].
pub const SAVE_GROUP: &str = "im:cg:single_chat:save";
/// Leader lease guarding the deliver worker.
pub const DELIVER_LEASE_KEY: &str = "im:lock:single_chat:deliver_leader";
/// Leader lease guarding the save worker.
pub const SAVE_LEASE_KEY: &str = "im:lock:single_chat:save_leader";

const CLAIM_AND_APPEND: &str = r#"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2])
if not ok then
  local existing = redis.call('GET', KEYS[1])
  if existing then
    return 'EXIST|' .. existing
  end
end
local id = redis.call('XADD', KEYS[2], '*', unpack(ARGV, 3))
return 'NEW|' .. id
"#;

/// A send accepted into the two-phase log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedEvent {
    pub server_msg_id: String,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub client_msg_id: Option<String>,
    pub msg_type: String,
    pub body: Option<String>,
    pub send_ts: i64,
    pub producer_instance: String,
}

/// Result of enqueueing a send into the accepted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; carries the stream entry id.
    New { stream_id: String },
    /// The client id was already claimed; carries the original server id.
    Existing { server_msg_id: String },
}

impl AcceptedEvent {
    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("server_msg_id", self.server_msg_id.clone()),
            ("sender_id", self.sender_id.to_string()),
            ("recipient_id", self.recipient_id.to_string()),
            ("msg_type", self.msg_type.clone()),
            ("send_ts", self.send_ts.to_string()),
            ("producer", self.producer_instance.clone()),
        ];
        if let Some(client_msg_id) = &self.client_msg_id {
            pairs.push(("client_msg_id", client_msg_id.clone()));
        }
        if let Some(body) = &self.body {
            pairs.push(("body", body.clone()));
        }
        pairs
    }

    fn from_entry(entry: &redis::streams::StreamId) -> Option<Self> {
        Some(Self {
            server_msg_id: entry.get("server_msg_id")?,
            sender_id: entry.get::<String>("sender_id")?.parse().ok()?,
            recipient_id: entry.get::<String>("recipient_id")?.parse().ok()?,
            client_msg_id: entry.get("client_msg_id"),
            msg_type: entry.get("msg_type")?,
            body: entry.get("body"),
            send_ts: entry.get::<String>("send_ts")?.parse().ok()?,
            producer_instance: entry.get("producer").unwrap_or_default(),
        })
    }
}

impl Storage {
    /// Claims the sender's client id and appends the event to the accepted
    /// stream in one script. Either both happen or the caller learns the
    /// id was already claimed; a crash can never leave a claim without a
    /// log entry.
    pub async fn enqueue_accepted(
        &self,
        claim_key: &str,
        claim_ttl_seconds: i64,
        event: &AcceptedEvent,
    ) -> Result<EnqueueOutcome, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let script = redis::Script::new(CLAIM_AND_APPEND);
        let mut invocation = script.prepare_invoke();
        invocation.key(claim_key).key(ACCEPTED_STREAM);
        invocation
            .arg(&event.server_msg_id)
            .arg(claim_ttl_seconds.max(1));
        for (field, value) in event.to_pairs() {
            invocation.arg(field).arg(value);
        }
        let reply: String = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        match reply.split_once('|') {
            Some(("NEW", stream_id)) => Ok(EnqueueOutcome::New {
                stream_id: stream_id.to_string(),
            }),
            Some(("EXIST", server_msg_id)) => Ok(EnqueueOutcome::Existing {
                server_msg_id: server_msg_id.to_string(),
            }),
            _ => Err(StorageError::Serialization),
        }
    }

    /// Appends an already-claimed event to a stream. Used for the deliver
    /// to save hand-off.
    pub async fn append_stream(
        &self,
        stream: &str,
        event: &AcceptedEvent,
    ) -> Result<String, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let mut command = redis::cmd("XADD");
        command.arg(stream).arg("*");
        for (field, value) in event.to_pairs() {
            command.arg(field).arg(value);
        }
        command
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    /// Creates a consumer group at the stream tail, creating the stream
    /// itself when absent. An already-existing group is not an error.
    pub async fn ensure_stream_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut *conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(_) => Err(StorageError::Redis),
        }
    }

    /// Reads a batch of undelivered entries for this consumer, blocking
    /// up to `block_ms` when the stream is idle.
    pub async fn read_stream_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<(String, AcceptedEvent)>, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|_| StorageError::Redis)?;
        let mut batch = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                match AcceptedEvent::from_entry(&entry) {
                    Some(event) => batch.push((entry.id.clone(), event)),
                    None => {
                        tracing::warn!(entry_id = %entry.id, "skipping malformed stream entry");
                    }
                }
            }
        }
        Ok(batch)
    }

    /// Acknowledges processed entries for a consumer group.
    pub async fn ack_stream(
        &self,
        stream: &str,
        group: &str,
        entry_ids: &[String],
    ) -> Result<(), StorageError> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let mut command = redis::cmd("XACK");
        command.arg(stream).arg(group);
        for entry_id in entry_ids {
            command.arg(entry_id);
        }
        let _: () = command
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }
}
