use super::{AppState, ConnectionContext};
use crate::util::now_millis;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};
use wiregate_proto::{
    clamp_call_reason, reason, CallState, Envelope, FrameType, MAX_ICE_LEN, MAX_SDP_LEN,
};
use wiregate_storage::CallRecord;

/// One ongoing call between two users. Lives only in memory; the
/// durable record in Postgres trails it through status updates.
#[derive(Debug, Clone)]
pub(crate) struct CallSession {
    pub call_id: i64,
    pub caller_id: i64,
    pub callee_id: i64,
    pub kind: String,
    pub state: CallState,
    pub started_at_ms: i64,
    pub accepted_at_ms: Option<i64>,
}

#[derive(Default)]
struct CallTable {
    calls: HashMap<i64, CallSession>,
    by_user: HashMap<i64, i64>,
}

/// In-memory registry of ringing and active calls on this instance.
/// Each user participates in at most one call at a time.
pub struct CallRegistry {
    table: Mutex<CallTable>,
}

impl CallRegistry {
    pub fn new() -> Self {
        CallRegistry {
            table: Mutex::new(CallTable::default()),
        }
    }

    /// Registers a new ringing call unless either party is already in
    /// one. The busy check and the insert share the lock, so two
    /// concurrent invites cannot both claim the same user.
    async fn begin(&self, session: CallSession) -> bool {
        let mut table = self.table.lock().await;
        if table.by_user.contains_key(&session.caller_id)
            || table.by_user.contains_key(&session.callee_id)
        {
            return false;
        }
        table.by_user.insert(session.caller_id, session.call_id);
        table.by_user.insert(session.callee_id, session.call_id);
        table.calls.insert(session.call_id, session);
        true
    }

    async fn get(&self, call_id: i64) -> Option<CallSession> {
        self.table.lock().await.calls.get(&call_id).cloned()
    }

    pub(crate) async fn call_of_user(&self, user_id: i64) -> Option<CallSession> {
        let table = self.table.lock().await;
        let call_id = table.by_user.get(&user_id)?;
        table.calls.get(call_id).cloned()
    }

    /// Moves a ringing call to accepted, stamping the accept time.
    async fn accept(&self, call_id: i64, now_ms: i64) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        let session = table.calls.get_mut(&call_id)?;
        if session.state != CallState::Ringing {
            return None;
        }
        session.state = CallState::Accepted;
        session.accepted_at_ms = Some(now_ms);
        Some(session.clone())
    }

    /// Removes the call and both user slots, returning the final
    /// in-memory session.
    async fn finish(&self, call_id: i64) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        let session = table.calls.remove(&call_id)?;
        table.by_user.remove(&session.caller_id);
        table.by_user.remove(&session.callee_id);
        Some(session)
    }

    /// Tears the call down only while it is still ringing. An accepted
    /// or already finished call is left alone.
    async fn timeout_if_ringing(&self, call_id: i64) -> Option<CallSession> {
        let mut table = self.table.lock().await;
        match table.calls.get(&call_id) {
            Some(session) if session.state == CallState::Ringing => {}
            _ => return None,
        }
        let session = table.calls.remove(&call_id)?;
        table.by_user.remove(&session.caller_id);
        table.by_user.remove(&session.callee_id);
        Some(session)
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound on every durable call-record write so a slow database never
/// stalls signaling.
const RECORD_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Time-ordered identifier with a random low part so two invites in
/// the same millisecond stay distinct.
fn generate_call_id() -> i64 {
    (now_millis() << 10) | i64::from(rand::random::<u16>() & 0x3ff)
}

fn call_frame(frame_type: FrameType, session: &CallSession) -> Envelope {
    let mut frame = Envelope::of(frame_type);
    frame.call_id = Some(session.call_id);
    frame.ts = Some(now_millis());
    frame
}

async fn send_call_error(ctx: &Arc<ConnectionContext>, code: &str, envelope: &Envelope) {
    let mut frame = Envelope::of(FrameType::CallError);
    frame.reason = Some(code.to_string());
    frame.call_id = envelope.call_id;
    frame.ts = Some(now_millis());
    ctx.send(&frame).await;
}

fn validated_sdp<'a>(envelope: &'a Envelope) -> Result<&'a str, &'static str> {
    match envelope.sdp.as_deref() {
        Some(sdp) if !sdp.trim().is_empty() => {
            if sdp.len() > MAX_SDP_LEN {
                Err(reason::SDP_TOO_LONG)
            } else {
                Ok(sdp)
            }
        }
        _ => Err(reason::MISSING_SDP),
    }
}

pub(crate) async fn handle_invite(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let state = &ctx.state;
    let callee_id = match envelope.to {
        Some(to) if to > 0 => to,
        _ => {
            send_call_error(ctx, reason::MISSING_TO, envelope).await;
            return;
        }
    };
    let kind = envelope
        .call_kind
        .as_deref()
        .filter(|value| !value.is_empty())
        .unwrap_or("video");
    if kind != "audio" && kind != "video" {
        send_call_error(ctx, reason::UNSUPPORTED_CALL_KIND, envelope).await;
        return;
    }
    let sdp = match validated_sdp(envelope) {
        Ok(sdp) => sdp,
        Err(code) => {
            send_call_error(ctx, code, envelope).await;
            return;
        }
    };
    if callee_id == ctx.user_id {
        send_call_error(ctx, reason::CANNOT_CALL_SELF, envelope).await;
        return;
    }
    match state.storage.are_friends(ctx.user_id, callee_id).await {
        Ok(true) => {}
        Ok(false) => {
            send_call_error(ctx, reason::NOT_FRIEND, envelope).await;
            return;
        }
        Err(error) => {
            warn!(user_id = ctx.user_id, %error, "friendship check failed");
            send_call_error(ctx, reason::INTERNAL_ERROR, envelope).await;
            return;
        }
    }
    // The callee has to be reachable somewhere before ringing starts.
    let callee_reachable = state.sessions.contains(callee_id).await
        || matches!(state.storage.route_of(callee_id).await, Ok(Some(_)));
    if !callee_reachable {
        send_call_error(ctx, reason::CALLEE_OFFLINE, envelope).await;
        return;
    }

    let session = CallSession {
        call_id: generate_call_id(),
        caller_id: ctx.user_id,
        callee_id,
        kind: kind.to_string(),
        state: CallState::Ringing,
        started_at_ms: now_millis(),
        accepted_at_ms: None,
    };
    let call_id = session.call_id;
    if !state.calls.begin(session.clone()).await {
        send_call_error(ctx, reason::BUSY, envelope).await;
        return;
    }
    let record = CallRecord {
        call_id,
        caller_id: ctx.user_id,
        callee_id,
        status: CallState::Ringing.as_str().to_string(),
        fail_reason: None,
        started_at: timestamp(session.started_at_ms),
        accepted_at: None,
        ended_at: None,
        duration_seconds: None,
    };
    let inserted = match timeout(
        RECORD_WRITE_TIMEOUT,
        state.storage.insert_call_record(&record),
    )
    .await
    {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(call_id, %error, "call record insert failed");
            false
        }
        Err(_) => {
            warn!(call_id, "call record insert timed out");
            false
        }
    };
    if !inserted {
        state.calls.finish(call_id).await;
        send_call_error(ctx, reason::INTERNAL_ERROR, envelope).await;
        return;
    }

    let mut ring = call_frame(FrameType::CallInvite, &session);
    ring.from = Some(ctx.user_id);
    ring.to = Some(callee_id);
    ring.call_kind = Some(session.kind.clone());
    ring.sdp = Some(sdp.to_string());
    if !state.deliver_to_user(callee_id, &ring).await {
        state.calls.finish(call_id).await;
        record_transition(
            state,
            call_id,
            CallState::Failed,
            Some("callee_unreachable"),
            None,
            Some(now_millis()),
            None,
        );
        send_call_error(ctx, reason::CALLEE_OFFLINE, envelope).await;
        return;
    }
    info!(call_id, caller = ctx.user_id, callee = callee_id, kind, "call ringing");

    let mut ok = call_frame(FrameType::CallInviteOk, &session);
    ok.to = Some(callee_id);
    ctx.send(&ok).await;

    spawn_ring_timeout(Arc::clone(state), call_id);
}

/// Converts a ringing call to missed after the ring window and tells
/// both ends. Does nothing if the call got answered or torn down first.
fn spawn_ring_timeout(state: Arc<AppState>, call_id: i64) {
    tokio::spawn(async move {
        sleep(Duration::from_secs(state.config.call_ring_seconds.max(1))).await;
        let session = match state.calls.timeout_if_ringing(call_id).await {
            Some(session) => session,
            None => return,
        };
        info!(call_id, "call timed out unanswered");
        record_transition(
            &state,
            call_id,
            CallState::Missed,
            None,
            None,
            Some(now_millis()),
            None,
        );
        let frame = call_frame(FrameType::CallTimeout, &session);
        state.deliver_to_user(session.caller_id, &frame).await;
        state.deliver_to_user(session.callee_id, &frame).await;
    });
}

pub(crate) async fn handle_accept(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let state = &ctx.state;
    let call_id = match envelope.call_id {
        Some(id) => id,
        None => {
            send_call_error(ctx, reason::MISSING_CALL_ID, envelope).await;
            return;
        }
    };
    let sdp = match validated_sdp(envelope) {
        Ok(sdp) => sdp,
        Err(code) => {
            send_call_error(ctx, code, envelope).await;
            return;
        }
    };
    let session = match state.calls.get(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    if ctx.user_id != session.callee_id {
        let code = if ctx.user_id == session.caller_id {
            reason::ONLY_CALLEE_CAN_ACCEPT
        } else {
            reason::CALL_NOT_PARTICIPANT
        };
        send_call_error(ctx, code, envelope).await;
        return;
    }
    let now_ms = now_millis();
    let session = match state.calls.accept(call_id, now_ms).await {
        Some(session) => session,
        // The ring timer or a teardown won the race.
        None => {
            send_call_error(ctx, reason::CALL_NOT_RINGING, envelope).await;
            return;
        }
    };
    record_transition(
        state,
        call_id,
        CallState::Accepted,
        None,
        Some(now_ms),
        None,
        None,
    );
    info!(call_id, callee = ctx.user_id, "call accepted");

    let mut answer = call_frame(FrameType::CallAccept, &session);
    answer.from = Some(ctx.user_id);
    answer.to = Some(session.caller_id);
    answer.sdp = Some(sdp.to_string());
    state.deliver_to_user(session.caller_id, &answer).await;
}

pub(crate) async fn handle_reject(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    end_ringing(
        ctx,
        envelope,
        RingingTeardown {
            required_role: Role::Callee,
            wrong_role_code: reason::ONLY_CALLEE_CAN_REJECT,
            final_state: CallState::Rejected,
            notify_frame: FrameType::CallReject,
        },
    )
    .await;
}

pub(crate) async fn handle_cancel(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    end_ringing(
        ctx,
        envelope,
        RingingTeardown {
            required_role: Role::Caller,
            wrong_role_code: reason::ONLY_CALLER_CAN_CANCEL,
            final_state: CallState::Canceled,
            notify_frame: FrameType::CallCancel,
        },
    )
    .await;
}

#[derive(PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

struct RingingTeardown {
    required_role: Role,
    wrong_role_code: &'static str,
    final_state: CallState,
    notify_frame: FrameType,
}

/// Reject and cancel share everything except which side may do it and
/// the terminal status they leave behind.
async fn end_ringing(ctx: &Arc<ConnectionContext>, envelope: &Envelope, plan: RingingTeardown) {
    let state = &ctx.state;
    let call_id = match envelope.call_id {
        Some(id) => id,
        None => {
            send_call_error(ctx, reason::MISSING_CALL_ID, envelope).await;
            return;
        }
    };
    let session = match state.calls.get(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    let acting_as = if ctx.user_id == session.caller_id {
        Role::Caller
    } else if ctx.user_id == session.callee_id {
        Role::Callee
    } else {
        send_call_error(ctx, reason::CALL_NOT_PARTICIPANT, envelope).await;
        return;
    };
    if acting_as != plan.required_role {
        send_call_error(ctx, plan.wrong_role_code, envelope).await;
        return;
    }
    if session.state != CallState::Ringing {
        send_call_error(ctx, reason::CALL_NOT_RINGING, envelope).await;
        return;
    }
    let session = match state.calls.finish(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    let call_reason = clamp_call_reason(envelope.call_reason.as_deref());
    record_transition(
        state,
        call_id,
        plan.final_state,
        call_reason.as_deref(),
        None,
        Some(now_millis()),
        None,
    );
    info!(call_id, user_id = ctx.user_id, status = plan.final_state.as_str(), "call torn down");

    let peer = if ctx.user_id == session.caller_id {
        session.callee_id
    } else {
        session.caller_id
    };
    let mut frame = call_frame(plan.notify_frame, &session);
    frame.from = Some(ctx.user_id);
    frame.to = Some(peer);
    frame.call_reason = call_reason;
    state.deliver_to_user(peer, &frame).await;
}

pub(crate) async fn handle_end(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let state = &ctx.state;
    let call_id = match envelope.call_id {
        Some(id) => id,
        None => {
            send_call_error(ctx, reason::MISSING_CALL_ID, envelope).await;
            return;
        }
    };
    let session = match state.calls.get(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    if ctx.user_id != session.caller_id && ctx.user_id != session.callee_id {
        send_call_error(ctx, reason::CALL_NOT_PARTICIPANT, envelope).await;
        return;
    }
    let session = match state.calls.finish(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    let now_ms = now_millis();
    // Ending a call that never connected counts as a cancel from the
    // caller and a reject from the callee.
    let (final_state, duration) = match session.state {
        CallState::Accepted => {
            let accepted = session.accepted_at_ms.unwrap_or(now_ms);
            let seconds = ((now_ms - accepted) / 1000).max(0) as i32;
            (CallState::Ended, Some(seconds))
        }
        _ if ctx.user_id == session.caller_id => (CallState::Canceled, None),
        _ => (CallState::Rejected, None),
    };
    let call_reason = clamp_call_reason(envelope.call_reason.as_deref());
    record_transition(
        state,
        call_id,
        final_state,
        call_reason.as_deref(),
        None,
        Some(now_ms),
        duration,
    );
    info!(
        call_id,
        user_id = ctx.user_id,
        status = final_state.as_str(),
        "call ended"
    );

    let peer = if ctx.user_id == session.caller_id {
        session.callee_id
    } else {
        session.caller_id
    };
    let mut frame = call_frame(FrameType::CallEnd, &session);
    frame.from = Some(ctx.user_id);
    frame.to = Some(peer);
    frame.call_reason = call_reason;
    state.deliver_to_user(peer, &frame).await;
}

pub(crate) async fn handle_ice(ctx: &Arc<ConnectionContext>, envelope: &Envelope) {
    let state = &ctx.state;
    let call_id = match envelope.call_id {
        Some(id) => id,
        None => {
            send_call_error(ctx, reason::MISSING_CALL_ID, envelope).await;
            return;
        }
    };
    let candidate = match envelope.ice_candidate.as_deref() {
        Some(candidate) if !candidate.trim().is_empty() => candidate,
        _ => {
            send_call_error(ctx, reason::MISSING_ICE_CANDIDATE, envelope).await;
            return;
        }
    };
    if candidate.len() > MAX_ICE_LEN {
        send_call_error(ctx, reason::ICE_CANDIDATE_TOO_LONG, envelope).await;
        return;
    }
    let session = match state.calls.get(call_id).await {
        Some(session) => session,
        None => {
            send_call_error(ctx, reason::CALL_NOT_FOUND, envelope).await;
            return;
        }
    };
    let peer = if ctx.user_id == session.caller_id {
        session.callee_id
    } else if ctx.user_id == session.callee_id {
        session.caller_id
    } else {
        send_call_error(ctx, reason::CALL_NOT_PARTICIPANT, envelope).await;
        return;
    };
    let mut frame = call_frame(FrameType::CallIce, &session);
    frame.from = Some(ctx.user_id);
    frame.to = Some(peer);
    frame.ice_candidate = Some(candidate.to_string());
    frame.ice_sdp_mid = envelope.ice_sdp_mid.clone();
    frame.ice_sdp_m_line_index = envelope.ice_sdp_m_line_index;
    state.deliver_to_user(peer, &frame).await;
}

/// Fails over any call the disconnecting user was part of, telling the
/// surviving peer.
pub(crate) async fn handle_disconnect(state: &Arc<AppState>, user_id: i64) {
    // Runs after the closing connection is unbound; another live device
    // of the same user keeps the call alive.
    if state.sessions.contains(user_id).await {
        return;
    }
    let session = match state.calls.call_of_user(user_id).await {
        Some(session) => session,
        None => return,
    };
    if state.calls.finish(session.call_id).await.is_none() {
        return;
    }
    let now_ms = now_millis();
    let duration = session
        .accepted_at_ms
        .filter(|_| session.state == CallState::Accepted)
        .map(|accepted| ((now_ms - accepted) / 1000).max(0) as i32);
    record_transition(
        state,
        session.call_id,
        CallState::Failed,
        Some("peer_disconnect"),
        None,
        Some(now_ms),
        duration,
    );
    info!(call_id = session.call_id, user_id, "call dropped on disconnect");

    let peer = if user_id == session.caller_id {
        session.callee_id
    } else {
        session.caller_id
    };
    let mut frame = call_frame(FrameType::CallEnd, &session);
    frame.from = Some(user_id);
    frame.to = Some(peer);
    frame.call_reason = Some("peer_disconnect".to_string());
    state.deliver_to_user(peer, &frame).await;
}

/// Writes the durable status transition behind the signaling path.
/// Signaling frames never wait on the database; the in-memory registry
/// is authoritative and the record trails it.
fn record_transition(
    state: &Arc<AppState>,
    call_id: i64,
    status: CallState,
    fail_reason: Option<&str>,
    accepted_at_ms: Option<i64>,
    ended_at_ms: Option<i64>,
    duration_seconds: Option<i32>,
) {
    let state = Arc::clone(state);
    let fail_reason = fail_reason.map(str::to_string);
    tokio::spawn(async move {
        let update = state.storage.update_call_record(
            call_id,
            status.as_str(),
            fail_reason.as_deref(),
            accepted_at_ms.map(timestamp),
            ended_at_ms.map(timestamp),
            duration_seconds,
        );
        match timeout(RECORD_WRITE_TIMEOUT, update).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                warn!(call_id, status = status.as_str(), %error, "call record update failed");
            }
            Err(_) => {
                warn!(call_id, status = status.as_str(), "call record update timed out");
            }
        }
    });
}

fn timestamp(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(call_id: i64, caller: i64, callee: i64) -> CallSession {
        CallSession {
            call_id,
            caller_id: caller,
            callee_id: callee,
            kind: "video".to_string(),
            state: CallState::Ringing,
            started_at_ms: 1_000,
            accepted_at_ms: None,
        }
    }

    #[tokio::test]
    async fn registry_rejects_busy_parties() {
        let registry = CallRegistry::new();
        assert!(registry.begin(session(1, 10, 20)).await);
        assert!(!registry.begin(session(2, 10, 30)).await);
        assert!(!registry.begin(session(3, 40, 20)).await);
        assert!(registry.begin(session(4, 40, 50)).await);
    }

    #[tokio::test]
    async fn finish_frees_both_users() {
        let registry = CallRegistry::new();
        assert!(registry.begin(session(1, 10, 20)).await);
        let finished = registry.finish(1).await.expect("active call");
        assert_eq!(finished.caller_id, 10);
        assert!(registry.call_of_user(10).await.is_none());
        assert!(registry.call_of_user(20).await.is_none());
        assert!(registry.begin(session(2, 10, 20)).await);
    }

    #[tokio::test]
    async fn timeout_skips_accepted_calls() {
        let registry = CallRegistry::new();
        assert!(registry.begin(session(1, 10, 20)).await);
        registry.accept(1, 5_000).await.expect("ringing call");
        assert!(registry.timeout_if_ringing(1).await.is_none());
        let active = registry.call_of_user(10).await.expect("still active");
        assert_eq!(active.state, CallState::Accepted);
        assert_eq!(active.accepted_at_ms, Some(5_000));
    }

    #[tokio::test]
    async fn accept_only_moves_ringing_calls() {
        let registry = CallRegistry::new();
        assert!(registry.begin(session(1, 10, 20)).await);
        assert!(registry.accept(1, 5_000).await.is_some());
        assert!(registry.accept(1, 6_000).await.is_none());
        assert!(registry.accept(99, 5_000).await.is_none());
    }

    #[test]
    fn call_ids_are_time_ordered_and_distinct() {
        let first = generate_call_id();
        let second = generate_call_id();
        assert!(first > 0);
        assert!(second >= first & !0x3ff);
    }
}
