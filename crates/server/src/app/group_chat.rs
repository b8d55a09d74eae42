use super::{message_envelope, single_chat::saved_ack, AppState, ConnectionContext};
use crate::config::GroupFanoutMode;
use crate::util::{generate_id, now_millis, sanitize_text};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use wiregate_proto::{reason, ChatKind, Envelope, FrameType, MessageStatus, MAX_BODY_LEN};
use wiregate_storage::{ClaimOutcome, MessageRecord, StorageError};

/// Auto mode pushes full messages only while the group stays below
/// these bounds; past them members get a lightweight notice instead.
const AUTO_PUSH_MAX_MEMBERS: usize = 2_000;
const AUTO_PUSH_MAX_ONLINE: usize = 500;
/// Above this many online members even the notice fanout is skipped.
const NOTIFY_CEILING: usize = 2_000;
/// Groups this large get no online fanout at all; members pick the
/// message up through backlog replay.
const HUGE_GROUP_MEMBERS: usize = 10_000;

#[derive(Debug)]
pub(crate) struct GroupSendRequest {
    pub client_msg_id: String,
    pub group_id: i64,
    pub body: String,
    pub msg_type: String,
}

#[derive(Debug, PartialEq, Eq)]
enum FanoutPlan {
    Push,
    Notify,
    Skip,
}

pub(crate) fn validate(envelope: &Envelope) -> Result<GroupSendRequest, &'static str> {
    let client_msg_id = match envelope.client_msg_id.as_deref() {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => return Err(reason::MISSING_MSG_ID),
    };
    let group_id = match envelope.group_id {
        Some(id) if id > 0 => id,
        _ => return Err(reason::MISSING_TO),
    };
    let body = match envelope.body.as_deref() {
        Some(body) if !body.trim().is_empty() => sanitize_text(body),
        _ => return Err(reason::MISSING_BODY),
    };
    if body.chars().count() > MAX_BODY_LEN {
        return Err(reason::BODY_TOO_LONG);
    }
    let msg_type = envelope
        .msg_type
        .as_deref()
        .filter(|value| !value.is_empty())
        .unwrap_or("text")
        .to_string();
    Ok(GroupSendRequest {
        client_msg_id,
        group_id,
        body,
        msg_type,
    })
}

pub(crate) async fn handle(ctx: &Arc<ConnectionContext>, envelope: Envelope) {
    let request = match validate(&envelope) {
        Ok(request) => request,
        Err(code) => {
            ctx.send_error(code, Some(&envelope)).await;
            return;
        }
    };
    let state = &ctx.state;
    match state
        .storage
        .is_group_member(request.group_id, ctx.user_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            ctx.send_error(reason::NOT_GROUP_MEMBER, Some(&envelope))
                .await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "membership check failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(&envelope)).await;
            return;
        }
    }

    let server_msg_id = generate_id("msg");
    match state
        .storage
        .claim_msg_id(
            ctx.user_id,
            ChatKind::Group.as_str(),
            &request.client_msg_id,
            &server_msg_id,
            state.config.idempotency_ttl_seconds,
        )
        .await
    {
        Ok(ClaimOutcome::New) => {}
        Ok(ClaimOutcome::Existing(existing)) => {
            ctx.send(&saved_ack(&request.client_msg_id, &existing, None))
                .await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "idempotency claim failed");
            ctx.send_error(reason::INTERNAL_ERROR, Some(&envelope)).await;
            return;
        }
    }

    let record = match persist(state, ctx.user_id, &request, &server_msg_id).await {
        Ok(record) => record,
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "group message persist failed");
            if let Err(error) = state
                .storage
                .forget_msg_id(ctx.user_id, ChatKind::Group.as_str(), &request.client_msg_id)
                .await
            {
                warn!(user_id = ctx.user_id, %error, "claim rollback failed");
            }
            ctx.send_error(reason::INTERNAL_ERROR, Some(&envelope)).await;
            return;
        }
    };
    state.metrics.mark_accepted();
    ctx.send(&saved_ack(
        &request.client_msg_id,
        &server_msg_id,
        Some(record.msg_seq),
    ))
    .await;

    let mut delivery = message_envelope(&record);
    delivery.mentions = envelope.mentions.clone();
    delivery.reply_to_server_msg_id = envelope.reply_to_server_msg_id.clone();
    delivery.important = envelope.important;
    fanout(state, ctx.user_id, &record, delivery).await;
}

async fn persist(
    state: &Arc<AppState>,
    sender_id: i64,
    request: &GroupSendRequest,
    server_msg_id: &str,
) -> Result<MessageRecord, StorageError> {
    let storage = &state.storage;
    let conversation = storage.ensure_group_conversation(request.group_id).await?;
    let msg_seq = storage.next_sequence(conversation.conversation_id).await?;
    let record = MessageRecord {
        server_msg_id: server_msg_id.to_string(),
        conversation_id: conversation.conversation_id,
        sender_id,
        recipient_id: None,
        group_id: Some(request.group_id),
        msg_type: request.msg_type.clone(),
        body: Some(request.body.clone()),
        status: MessageStatus::Saved.as_str().to_string(),
        msg_seq,
        client_msg_id: Some(request.client_msg_id.clone()),
        created_at: Utc::now(),
    };
    storage.insert_message(&record).await?;
    state
        .coalescer
        .record_touch(conversation.conversation_id, record.created_at);
    Ok(record)
}

/// Spreads a saved group message to online members, full frame or
/// notice depending on group shape and configured mode. Under a notice
/// plan, mentioned members and the replied-to author still receive the
/// full frame.
async fn fanout(state: &Arc<AppState>, sender_id: i64, record: &MessageRecord, delivery: Envelope) {
    let group_id = match record.group_id {
        Some(id) => id,
        None => return,
    };
    let members: Vec<i64> = match state.storage.group_members(group_id).await {
        Ok(members) => members.into_iter().filter(|id| *id != sender_id).collect(),
        Err(error) => {
            warn!(group_id, %error, "member list load failed");
            return;
        }
    };
    let group_size = members.len() + 1;
    if group_size >= HUGE_GROUP_MEMBERS {
        debug!(group_id, group_size, "huge group, skipping online fanout");
        return;
    }
    let routes = match state.storage.routes_of(&members).await {
        Ok(routes) => routes,
        Err(error) => {
            // Batch presence is unavailable; push per member instead so
            // nobody online is skipped.
            warn!(group_id, %error, "route batch lookup failed, pushing per member");
            for member in &members {
                if state.deliver_to_user(*member, &delivery).await {
                    state.metrics.mark_delivered();
                }
            }
            return;
        }
    };
    let online = routes.len();
    let plan = choose_plan(state.config.group_fanout_mode, group_size, online);
    if plan == FanoutPlan::Skip {
        debug!(group_id, online, "online fanout skipped, relying on replay");
        return;
    }
    let important = match plan {
        FanoutPlan::Notify => important_members(state, &delivery, &members).await,
        _ => HashSet::new(),
    };
    let notice = notify_envelope(record);
    state.metrics.mark_group_fanout();
    // One serialization of each shape, shared across every local
    // recipient connection.
    let (delivery_text, notice_text) = match (delivery.encode(), notice.encode()) {
        (Ok(full), Ok(light)) => (full, light),
        _ => return,
    };

    let mut remote_full: HashMap<String, Vec<i64>> = HashMap::new();
    let mut remote_notice: HashMap<String, Vec<i64>> = HashMap::new();
    for (user_id, route) in routes {
        let full = plan == FanoutPlan::Push || important.contains(&user_id);
        if route.instance_id == state.config.instance_id {
            let text = if full { &delivery_text } else { &notice_text };
            let mut delivered = false;
            for entry in state.sessions.get_all(user_id).await {
                delivered |= state.deliver_local_text(&entry, text);
            }
            if delivered {
                state.metrics.mark_delivered();
            }
        } else {
            let bucket = if full {
                &mut remote_full
            } else {
                &mut remote_notice
            };
            bucket.entry(route.instance_id).or_default().push(user_id);
        }
    }
    publish_remote(state, group_id, &delivery, remote_full).await;
    publish_remote(state, group_id, &notice, remote_notice).await;
}

/// Members for whom a notice is not enough: anyone the sender mentioned
/// plus the author of the replied-to message.
async fn important_members(
    state: &Arc<AppState>,
    delivery: &Envelope,
    members: &[i64],
) -> HashSet<i64> {
    let eligible: HashSet<i64> = members.iter().copied().collect();
    let mut important = HashSet::new();
    if let Some(mentions) = delivery.mentions.as_ref() {
        for mention in mentions {
            if let Ok(user_id) = mention.trim().parse::<i64>() {
                if eligible.contains(&user_id) {
                    important.insert(user_id);
                }
            }
        }
    }
    if let Some(reply_to) = delivery.reply_to_server_msg_id.as_deref() {
        if let Ok(Some(target)) = state.storage.find_message(reply_to).await {
            if eligible.contains(&target.sender_id) {
                important.insert(target.sender_id);
            }
        }
    }
    important
}

async fn publish_remote(
    state: &Arc<AppState>,
    group_id: i64,
    envelope: &Envelope,
    remote: HashMap<String, Vec<i64>>,
) {
    if remote.is_empty() {
        return;
    }
    let value = match serde_json::to_value(envelope) {
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
            warn!(group_id, instance = %instance_id, %error, "remote fanout publish failed");
        }
    }
}

fn choose_plan(mode: GroupFanoutMode, group_size: usize, online: usize) -> FanoutPlan {
    match mode {
        GroupFanoutMode::Push => FanoutPlan::Push,
        GroupFanoutMode::Notify => {
            if online > NOTIFY_CEILING {
                FanoutPlan::Skip
            } else {
                FanoutPlan::Notify
            }
        }
        GroupFanoutMode::Auto => {
            if group_size <= AUTO_PUSH_MAX_MEMBERS && online <= AUTO_PUSH_MAX_ONLINE {
                FanoutPlan::Push
            } else if online > NOTIFY_CEILING {
                FanoutPlan::Skip
            } else {
                FanoutPlan::Notify
            }
        }
        GroupFanoutMode::None => FanoutPlan::Skip,
    }
}

/// Lightweight new-message notice; the client fetches the body itself.
fn notify_envelope(record: &MessageRecord) -> Envelope {
    let mut frame = Envelope::of(FrameType::GroupNotify);
    frame.group_id = record.group_id;
    frame.server_msg_id = Some(record.server_msg_id.clone());
    frame.from = Some(record.sender_id);
    frame.msg_seq = Some(record.msg_seq);
    frame.ts = Some(record.created_at.timestamp_millis());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_order_is_stable() {
        let mut envelope = Envelope::of(FrameType::GroupChat);
        assert_eq!(validate(&envelope).unwrap_err(), reason::MISSING_MSG_ID);
        envelope.client_msg_id = Some("c1".to_string());
        assert_eq!(validate(&envelope).unwrap_err(), reason::MISSING_TO);
        envelope.group_id = Some(9);
        assert_eq!(validate(&envelope).unwrap_err(), reason::MISSING_BODY);
        envelope.body = Some("x".repeat(MAX_BODY_LEN + 1));
        assert_eq!(validate(&envelope).unwrap_err(), reason::BODY_TOO_LONG);
        envelope.body = Some("hello".to_string());
        assert!(validate(&envelope).is_ok());
    }

    #[test]
    fn auto_mode_prefers_push_for_small_groups() {
        assert_eq!(choose_plan(GroupFanoutMode::Auto, 50, 30), FanoutPlan::Push);
        assert_eq!(
            choose_plan(GroupFanoutMode::Auto, 50, AUTO_PUSH_MAX_ONLINE + 1),
            FanoutPlan::Notify
        );
        assert_eq!(
            choose_plan(GroupFanoutMode::Auto, AUTO_PUSH_MAX_MEMBERS + 1, 10),
            FanoutPlan::Notify
        );
        assert_eq!(
            choose_plan(GroupFanoutMode::Auto, 5_000, NOTIFY_CEILING + 1),
            FanoutPlan::Skip
        );
    }

    #[test]
    fn forced_modes_override_shape() {
        assert_eq!(
            choose_plan(GroupFanoutMode::Push, 5_000, 1_000),
            FanoutPlan::Push
        );
        assert_eq!(
            choose_plan(GroupFanoutMode::Notify, 10, 2),
            FanoutPlan::Notify
        );
        assert_eq!(
            choose_plan(GroupFanoutMode::Notify, 5_000, NOTIFY_CEILING + 1),
            FanoutPlan::Skip
        );
        assert_eq!(choose_plan(GroupFanoutMode::None, 10, 2), FanoutPlan::Skip);
    }
}
