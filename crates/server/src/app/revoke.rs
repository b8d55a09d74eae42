use super::ConnectionContext;
use crate::util::now_millis;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use wiregate_proto::{reason, Envelope, FrameType, MessageStatus};
use wiregate_storage::MessageRecord;

/// Retracts a stored message on the author's request and spreads the
/// revocation to everyone who could have seen it.
pub(crate) async fn handle(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let server_msg_id = match envelope.server_msg_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => {
            ctx.send_error(reason::MISSING_SERVER_MSG_ID, Some(envelope))
                .await;
            return;
        }
    };
    let record = match ctx.state.storage.find_message(server_msg_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            ctx.send_error(reason::MESSAGE_NOT_FOUND, Some(envelope)).await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "revoke lookup failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    };
    if record.sender_id != ctx.user_id {
        ctx.send_error(reason::ACK_NOT_ALLOWED, Some(envelope)).await;
        return;
    }
    match ctx
        .state
        .storage
        .revoke_message(&record.server_msg_id, ctx.user_id)
        .await
    {
        Ok(true) => {}
        // Already revoked; nothing left to announce.
        Ok(false) => {
            ctx.send_error(reason::MESSAGE_NOT_FOUND, Some(envelope)).await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "revoke update failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(envelope)).await;
            return;
        }
    }

    let notice = revoked_envelope(&record);
    ctx.send(&notice).await;
    match record.group_id {
        None => {
            if let Some(recipient) = record.recipient_id {
                ctx.state.deliver_to_user(recipient, &notice).await;
            }
        }
        Some(group_id) => spread_to_group(ctx, group_id, &notice).await,
    }
}

/// Pushes the revocation to online group members, batching remote
/// instances the same way message fanout does.
async fn spread_to_group(ctx: &Arc<ConnectionContext>, group_id: i64, notice: &Envelope) {
    let state = &ctx.state;
    let members: Vec<i64> = match state.storage.group_members(group_id).await {
        Ok(members) => members
            .into_iter()
            .filter(|id| *id != ctx.user_id)
            .collect(),
        Err(error) => {
            warn!(group_id, %error, "member list load failed");
            return;
        }
    };
    let routes = match state.storage.routes_of(&members).await {
        Ok(routes) => routes,
        Err(error) => {
            warn!(group_id, %error, "route batch lookup failed, pushing per member");
            for member in &members {
                state.deliver_to_user(*member, notice).await;
            }
            return;
        }
    };
    let mut remote: HashMap<String, Vec<i64>> = HashMap::new();
    for (user_id, route) in routes {
        if route.instance_id == state.config.instance_id {
            state.deliver_local(user_id, notice).await;
        } else {
            remote.entry(route.instance_id).or_default().push(user_id);
        }
    }
    if remote.is_empty() {
        return;
    }
    let value = match serde_json::to_value(notice) {
        Ok(value) => value,
        Err(_) => return,
    };
    let ts = now_millis();
    for (instance_id, user_ids) in remote {
        if let Err(error) = state
            .storage
            .publish_push(&instance_id, &user_ids, &value, ts)
            .await
        {
            warn!(group_id, instance = %instance_id, %error, "revoke publish failed");
        }
    }
}

fn revoked_envelope(record: &MessageRecord) -> Envelope {
    let mut frame = Envelope::of(FrameType::MessageRevoked);
    frame.server_msg_id = Some(record.server_msg_id.clone());
    frame.from = Some(record.sender_id);
    frame.to = record.recipient_id;
    frame.group_id = record.group_id;
    frame.msg_seq = Some(record.msg_seq);
    frame.status = Some(MessageStatus::Revoked.as_str().to_string());
    frame.ts = Some(now_millis());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn revoked_notice_carries_scope() {
        let record = MessageRecord {
            server_msg_id: "s1".to_string(),
            conversation_id: 7,
            sender_id: 1,
            recipient_id: None,
            group_id: Some(42),
            msg_type: "text".to_string(),
            body: Some("gone".to_string()),
            status: "revoked".to_string(),
            msg_seq: 9,
            client_msg_id: Some("c1".to_string()),
            created_at: Utc::now(),
        };
        let frame = revoked_envelope(&record);
        assert_eq!(frame.kind, "MESSAGE_REVOKED");
        assert_eq!(frame.group_id, Some(42));
        assert_eq!(frame.msg_seq, Some(9));
        assert_eq!(frame.status.as_deref(), Some("revoked"));
        assert!(frame.body.is_none());
    }
}
