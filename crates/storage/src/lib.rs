use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

mod bus;
mod claims;
mod routes;
mod stream;

pub use bus::{ControlMessage, control_topic};
pub use claims::{idempotency_key, ClaimOutcome, EPOCH_UNKNOWN};
pub use routes::{RouteInfo, format_route, parse_route};
pub use stream::{
    AcceptedEvent, EnqueueOutcome, ACCEPTED_STREAM, DELIVER_GROUP, DELIVER_LEASE_KEY, SAVE_GROUP,
    SAVE_LEASE_KEY, SAVE_STREAM,
};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
    redis_client: redis::Client,
    claims: claims::ClaimCache,
}

/// Conversation scope marker persisted with each conversation row.
pub const CONVERSATION_SINGLE: &str = "single";
pub const CONVERSATION_GROUP: &str = "group";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub conversation_id: i64,
    pub kind: String,
    pub user_low: Option<i64>,
    pub user_high: Option<i64>,
    pub group_id: Option<i64>,
    pub last_seq: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub server_msg_id: String,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub recipient_id: Option<i64>,
    pub group_id: Option<i64>,
    pub msg_type: String,
    pub body: Option<String>,
    pub status: String,
    pub msg_seq: i64,
    pub client_msg_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorPair {
    pub delivered_seq: i64,
    pub read_seq: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequestRecord {
    pub request_id: String,
    pub sender_id: i64,
    pub target_id: i64,
    pub note: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call_id: i64,
    pub caller_id: i64,
    pub callee_id: i64,
    pub status: String,
    pub fail_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
}

/// Establishes connectivity to PostgreSQL and Redis backends.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        _pg_task: task,
        redis: Arc::new(Mutex::new(redis_connection)),
        redis_client,
        claims: claims::ClaimCache::new(),
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    pub(crate) fn redis_handle(&self) -> Arc<Mutex<redis::aio::MultiplexedConnection>> {
        Arc::clone(&self.redis)
    }

    pub(crate) fn redis_client(&self) -> &redis::Client {
        &self.redis_client
    }

    /// Resolves the single-chat conversation for a user pair, creating it on
    /// first contact. The pair is stored in unordered form.
    pub async fn ensure_single_conversation(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<ConversationRecord, StorageError> {
        if user_a == user_b || user_a <= 0 || user_b <= 0 {
            return Err(StorageError::Invalid);
        }
        let low = user_a.min(user_b);
        let high = user_a.max(user_b);
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO conversation (kind, user_low, user_high, last_seq, created_at, updated_at)
                VALUES ($1, $2, $3, 0, $4, $4)
                ON CONFLICT (user_low, user_high) WHERE kind = 'single' DO NOTHING",
                &[&CONVERSATION_SINGLE, &low, &high, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = self
            .client
            .query_opt(
                "SELECT conversation_id, kind, user_low, user_high, group_id, last_seq, updated_at
                FROM conversation WHERE kind = $1 AND user_low = $2 AND user_high = $3",
                &[&CONVERSATION_SINGLE, &low, &high],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(conversation_from_row(&row))
    }

    /// Resolves the conversation backing a group, creating it on first use.
    pub async fn ensure_group_conversation(
        &self,
        group_id: i64,
    ) -> Result<ConversationRecord, StorageError> {
        if group_id <= 0 {
            return Err(StorageError::Invalid);
        }
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO conversation (kind, group_id, last_seq, created_at, updated_at)
                VALUES ($1, $2, 0, $3, $3)
                ON CONFLICT (group_id) WHERE kind = 'group' DO NOTHING",
                &[&CONVERSATION_GROUP, &group_id, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = self
            .client
            .query_opt(
                "SELECT conversation_id, kind, user_low, user_high, group_id, last_seq, updated_at
                FROM conversation WHERE kind = $1 AND group_id = $2",
                &[&CONVERSATION_GROUP, &group_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(conversation_from_row(&row))
    }

    /// Allocates the next conversation sequence number. A single statement
    /// advances and returns the counter, so concurrent senders can never
    /// observe the same value.
    pub async fn next_sequence(&self, conversation_id: i64) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_opt(
                "UPDATE conversation SET last_seq = last_seq + 1
                WHERE conversation_id = $1 RETURNING last_seq",
                &[&conversation_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(row.get(0))
    }

    /// Refreshes a conversation's last-activity timestamp.
    pub async fn touch_conversation(
        &self,
        conversation_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "UPDATE conversation SET updated_at = GREATEST(updated_at, $2) WHERE conversation_id = $1",
                &[&conversation_id, &at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Persists a message row. Returns false when the identifier already
    /// exists, which callers treat as an idempotent replay.
    pub async fn insert_message(&self, record: &MessageRecord) -> Result<bool, StorageError> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO message (server_msg_id, conversation_id, sender_id, recipient_id, group_id, msg_type, body, status, msg_seq, client_msg_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (server_msg_id) DO NOTHING",
                &[
                    &record.server_msg_id,
                    &record.conversation_id,
                    &record.sender_id,
                    &record.recipient_id,
                    &record.group_id,
                    &record.msg_type,
                    &record.body,
                    &record.status,
                    &record.msg_seq,
                    &record.client_msg_id,
                    &record.created_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(inserted == 1)
    }

    /// Loads a message by its server-assigned identifier.
    pub async fn find_message(
        &self,
        server_msg_id: &str,
    ) -> Result<Option<MessageRecord>, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT server_msg_id, conversation_id, sender_id, recipient_id, group_id, msg_type, body, status, msg_seq, client_msg_id, created_at
                FROM message WHERE server_msg_id = $1",
                &[&server_msg_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.map(|row| message_from_row(&row)))
    }

    /// Advances a message's lifecycle status. Transitions never move
    /// backwards and revoked rows are left untouched.
    pub async fn mark_message_status(
        &self,
        server_msg_id: &str,
        status: &str,
    ) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE message SET status = $2 WHERE server_msg_id = $1
                AND status <> 'revoked'
                AND CASE status WHEN 'saved' THEN 1 WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 4 END
                  < CASE $2 WHEN 'saved' THEN 1 WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 4 END",
                &[&server_msg_id, &status],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected == 1)
    }

    /// Revokes a message: status flips to revoked and the body is dropped.
    /// Only the original sender may revoke.
    pub async fn revoke_message(
        &self,
        server_msg_id: &str,
        sender_id: i64,
    ) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE message SET status = 'revoked', body = NULL
                WHERE server_msg_id = $1 AND sender_id = $2 AND status <> 'revoked'",
                &[&server_msg_id, &sender_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected == 1)
    }

    /// Moves a member's delivery cursor forward. The stored value only ever
    /// grows, so late or duplicate receipts are harmless.
    pub async fn advance_cursor(
        &self,
        conversation_id: i64,
        user_id: i64,
        read: bool,
        seq: i64,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let query = if read {
            "INSERT INTO member_cursor (conversation_id, user_id, delivered_seq, read_seq, updated_at)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET
                delivered_seq = GREATEST(member_cursor.delivered_seq, excluded.delivered_seq),
                read_seq = GREATEST(member_cursor.read_seq, excluded.read_seq),
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO member_cursor (conversation_id, user_id, delivered_seq, read_seq, updated_at)
            VALUES ($1, $2, $3, 0, $4)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET
                delivered_seq = GREATEST(member_cursor.delivered_seq, excluded.delivered_seq),
                updated_at = excluded.updated_at"
        };
        self.client
            .execute(query, &[&conversation_id, &user_id, &seq, &now])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Reads a member's cursor pair, defaulting to zero when absent.
    pub async fn cursor_of(
        &self,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<CursorPair, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT delivered_seq, read_seq FROM member_cursor
                WHERE conversation_id = $1 AND user_id = $2",
                &[&conversation_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row
            .map(|row| CursorPair {
                delivered_seq: row.get(0),
                read_seq: row.get(1),
            })
            .unwrap_or_default())
    }

    /// Single-chat rows addressed to the user beyond their delivered cursor,
    /// oldest first.
    pub async fn pending_single_messages(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT m.server_msg_id, m.conversation_id, m.sender_id, m.recipient_id, m.group_id, m.msg_type, m.body, m.status, m.msg_seq, m.client_msg_id, m.created_at
                FROM message m
                JOIN conversation c ON c.conversation_id = m.conversation_id
                LEFT JOIN member_cursor mc ON mc.conversation_id = m.conversation_id AND mc.user_id = $1
                WHERE c.kind = 'single' AND m.recipient_id = $1
                  AND m.msg_seq > COALESCE(mc.delivered_seq, 0)
                ORDER BY m.conversation_id ASC, m.msg_seq ASC
                LIMIT $2",
                &[&user_id, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Group rows in the user's groups beyond their delivered cursor,
    /// excluding their own sends, oldest first.
    pub async fn pending_group_messages(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT m.server_msg_id, m.conversation_id, m.sender_id, m.recipient_id, m.group_id, m.msg_type, m.body, m.status, m.msg_seq, m.client_msg_id, m.created_at
                FROM message m
                JOIN conversation c ON c.conversation_id = m.conversation_id
                JOIN group_member gm ON gm.group_id = c.group_id AND gm.user_id = $1
                LEFT JOIN member_cursor mc ON mc.conversation_id = m.conversation_id AND mc.user_id = $1
                WHERE c.kind = 'group' AND m.sender_id <> $1
                  AND m.msg_seq > COALESCE(mc.delivered_seq, 0)
                ORDER BY m.conversation_id ASC, m.msg_seq ASC
                LIMIT $2",
                &[&user_id, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Checks the friend relation between two users in either direction.
    pub async fn are_friends(&self, user_a: i64, user_b: i64) -> Result<bool, StorageError> {
        let low = user_a.min(user_b);
        let high = user_a.max(user_b);
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM friend_relation WHERE user_low = $1 AND user_high = $2",
                &[&low, &high],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    /// Records a pending friend request. Returns false on a replayed
    /// request identifier.
    pub async fn insert_friend_request(
        &self,
        record: &FriendRequestRecord,
    ) -> Result<bool, StorageError> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO friend_request (request_id, sender_id, target_id, note, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (request_id) DO NOTHING",
                &[
                    &record.request_id,
                    &record.sender_id,
                    &record.target_id,
                    &record.note,
                    &record.status,
                    &record.created_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(inserted == 1)
    }

    /// Lists member ids of a group.
    pub async fn group_members(&self, group_id: i64) -> Result<Vec<i64>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT user_id FROM group_member WHERE group_id = $1 ORDER BY user_id ASC",
                &[&group_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Checks membership of one user in a group.
    pub async fn is_group_member(&self, group_id: i64, user_id: i64) -> Result<bool, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM group_member WHERE group_id = $1 AND user_id = $2",
                &[&group_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    /// Persists a new call record.
    pub async fn insert_call_record(&self, record: &CallRecord) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO call_record (call_id, caller_id, callee_id, status, fail_reason, started_at, accepted_at, ended_at, duration_seconds)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (call_id) DO NOTHING",
                &[
                    &record.call_id,
                    &record.caller_id,
                    &record.callee_id,
                    &record.status,
                    &record.fail_reason,
                    &record.started_at,
                    &record.accepted_at,
                    &record.ended_at,
                    &record.duration_seconds,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Advances a call record to a new status with optional terminal fields.
    pub async fn update_call_record(
        &self,
        call_id: i64,
        status: &str,
        fail_reason: Option<&str>,
        accepted_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
        duration_seconds: Option<i32>,
    ) -> Result<bool, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE call_record SET status = $2,
                    fail_reason = COALESCE($3, fail_reason),
                    accepted_at = COALESCE($4, accepted_at),
                    ended_at = COALESCE($5, ended_at),
                    duration_seconds = COALESCE($6, duration_seconds)
                WHERE call_id = $1",
                &[
                    &call_id,
                    &status,
                    &fail_reason,
                    &accepted_at,
                    &ended_at,
                    &duration_seconds,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected == 1)
    }
}

fn conversation_from_row(row: &tokio_postgres::Row) -> ConversationRecord {
    ConversationRecord {
        conversation_id: row.get(0),
        kind: row.get(1),
        user_low: row.get(2),
        user_high: row.get(3),
        group_id: row.get(4),
        last_seq: row.get(5),
        updated_at: row.get(6),
    }
}

fn message_from_row(row: &tokio_postgres::Row) -> MessageRecord {
    MessageRecord {
        server_msg_id: row.get(0),
        conversation_id: row.get(1),
        sender_id: row.get(2),
        recipient_id: row.get(3),
        group_id: row.get(4),
        msg_type: row.get(5),
        body: row.get(6),
        status: row.get(7),
        msg_seq: row.get(8),
        client_msg_id: row.get(9),
        created_at: row.get(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("CREATE TABLE"));
        assert!(INIT_SQL.contains("conversation"));
        assert!(INIT_SQL.contains("message"));
        assert!(INIT_SQL.contains("member_cursor"));
        assert!(INIT_SQL.contains("friend_relation"));
        assert!(INIT_SQL.contains("group_member"));
        assert!(INIT_SQL.contains("call_record"));
    }

    #[test]
    fn route_value_roundtrip() {
        let value = format_route("gw-1", Some("conn-9"));
        assert_eq!(value, "gw-1|conn-9");
        let parsed = parse_route(&value).expect("route");
        assert_eq!(parsed.instance_id, "gw-1");
        assert_eq!(parsed.connection_id.as_deref(), Some("conn-9"));
    }

    #[test]
    fn route_value_tolerates_legacy_form() {
        let parsed = parse_route("gw-legacy").expect("route");
        assert_eq!(parsed.instance_id, "gw-legacy");
        assert!(parsed.connection_id.is_none());
        assert!(parse_route("").is_none());
        assert!(parse_route("  ").is_none());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("WIREGATE_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: WIREGATE_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis = match std::env::var("WIREGATE_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: WIREGATE_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = connect(&pg, &redis).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = 1_000 + (suffix % 1_000_000);
        let bob = alice + 1;

        let conversation = storage.ensure_single_conversation(alice, bob).await?;
        let again = storage.ensure_single_conversation(bob, alice).await?;
        assert_eq!(conversation.conversation_id, again.conversation_id);

        let first = storage.next_sequence(conversation.conversation_id).await?;
        let second = storage.next_sequence(conversation.conversation_id).await?;
        assert_eq!(second, first + 1);

        let record = MessageRecord {
            server_msg_id: format!("msg-{}", suffix),
            conversation_id: conversation.conversation_id,
            sender_id: alice,
            recipient_id: Some(bob),
            group_id: None,
            msg_type: "text".to_string(),
            body: Some("hello".to_string()),
            status: "saved".to_string(),
            msg_seq: second,
            client_msg_id: Some(format!("c-{}", suffix)),
            created_at: Utc::now(),
        };
        assert!(storage.insert_message(&record).await?);
        assert!(!storage.insert_message(&record).await?);

        assert!(
            storage
                .mark_message_status(&record.server_msg_id, "delivered")
                .await?
        );
        assert!(
            !storage
                .mark_message_status(&record.server_msg_id, "saved")
                .await?
        );

        storage
            .advance_cursor(conversation.conversation_id, bob, false, second)
            .await?;
        storage
            .advance_cursor(conversation.conversation_id, bob, false, first)
            .await?;
        let cursor = storage.cursor_of(conversation.conversation_id, bob).await?;
        assert_eq!(cursor.delivered_seq, second);

        let pending = storage.pending_single_messages(bob, 50).await?;
        assert!(
            pending
                .iter()
                .all(|message| message.msg_seq > cursor.delivered_seq)
        );

        let bumped = storage.bump_epoch(alice).await?;
        assert!(bumped > 0);
        assert_eq!(storage.current_epoch(alice).await, bumped);

        let lease_key = format!("im:test:lease:{}", suffix);
        assert!(storage.try_acquire_lease(&lease_key, "gw-a", 5_000).await?);
        assert!(!storage.try_acquire_lease(&lease_key, "gw-b", 5_000).await?);
        assert!(storage.renew_lease(&lease_key, "gw-a", 5_000).await?);
        assert!(!storage.renew_lease(&lease_key, "gw-b", 5_000).await?);
        assert!(!storage.release_lease(&lease_key, "gw-b").await?);
        assert!(storage.release_lease(&lease_key, "gw-a").await?);
        assert!(storage.try_acquire_lease(&lease_key, "gw-b", 5_000).await?);
        assert!(storage.release_lease(&lease_key, "gw-b").await?);

        assert!(storage.revoke_message(&record.server_msg_id, alice).await?);
        let revoked = storage
            .find_message(&record.server_msg_id)
            .await?
            .expect("message present");
        assert_eq!(revoked.status, "revoked");
        assert!(revoked.body.is_none());
        Ok(())
    }
}
