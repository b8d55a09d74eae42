use super::{Storage, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const CONTROL_PREFIX: &str = "im:gw:ctrl:";

/// Upper bound on user ids carried by a single push message. Larger
/// fanouts are split so one payload cannot dominate the channel.
pub const PUSH_BATCH_LIMIT: usize = 500;

/// Message exchanged between gateway instances over the control topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Kick {
        user_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        reason: String,
        ts: i64,
    },
    #[serde(rename_all = "camelCase")]
    Push {
        user_ids: Vec<i64>,
        envelope: Value,
        ts: i64,
    },
}

/// Control topic owned by one gateway instance.
pub fn control_topic(instance_id: &str) -> String {
    format!("{}{}", CONTROL_PREFIX, instance_id)
}

impl Storage {
    /// Publishes one control message to another instance's topic.
    pub async fn publish_control(
        &self,
        instance_id: &str,
        message: &ControlMessage,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(message).map_err(|_| StorageError::Serialization)?;
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let _: () = redis::cmd("PUBLISH")
            .arg(control_topic(instance_id))
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Publishes a push for a set of users on a remote instance, splitting
    /// the recipient list into bounded chunks.
    pub async fn publish_push(
        &self,
        instance_id: &str,
        user_ids: &[i64],
        envelope: &Value,
        ts: i64,
    ) -> Result<(), StorageError> {
        for chunk in user_ids.chunks(PUSH_BATCH_LIMIT) {
            let message = ControlMessage::Push {
                user_ids: chunk.to_vec(),
                envelope: envelope.clone(),
                ts,
            };
            self.publish_control(instance_id, &message).await?;
        }
        Ok(())
    }

    /// Opens a dedicated subscriber on this instance's control topic.
    /// Pub/sub needs its own connection, so the shared multiplexed one is
    /// not reused here.
    pub async fn subscribe_control(
        &self,
        instance_id: &str,
    ) -> Result<redis::aio::PubSub, StorageError> {
        let mut pubsub = self
            .redis_client()
            .get_async_pubsub()
            .await
            .map_err(|_| StorageError::Redis)?;
        pubsub
            .subscribe(control_topic(instance_id))
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_wire_shape() {
        let kick = ControlMessage::Kick {
            user_id: 7,
            connection_id: Some("c-1".to_string()),
            reason: "session_invalid".to_string(),
            ts: 1_000,
        };
        let json = serde_json::to_string(&kick).expect("serialize");
        assert!(json.contains("\"kind\":\"KICK\""));
        assert!(json.contains("\"userId\":7"));
        let back: ControlMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, kick);
    }

    #[test]
    fn push_roundtrip_preserves_envelope() {
        let push = ControlMessage::Push {
            user_ids: vec![1, 2, 3],
            envelope: serde_json::json!({"type": "GROUP_MESSAGE_PUSH", "groupId": 5}),
            ts: 9,
        };
        let json = serde_json::to_string(&push).expect("serialize");
        let back: ControlMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, push);
    }

    #[test]
    fn topic_is_per_instance() {
        assert_eq!(control_topic("gw-1"), "im:gw:ctrl:gw-1");
    }
}
