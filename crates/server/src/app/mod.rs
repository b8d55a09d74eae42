mod ack;
mod call;
mod cluster;
mod coalesce;
mod friend;
mod group_chat;
mod handshake;
mod resend;
mod revoke;
mod session;
mod single_chat;
mod twophase;

pub use call::CallRegistry;
pub use cluster::run_control_listener;
pub use coalesce::{run_flusher, Coalescer};
pub use session::{ConnectionEntry, SessionRegistry};
pub use twophase::{run_deliver_worker, run_save_worker, spawn_local_pipeline};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::transport::{
    self, BackpressureGuard, ChannelWriter, Inbound, Outbound, SerialQueue, DEFAULT_QUEUE_DEPTH,
};
use crate::util::{generate_id, now_millis};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant};
use tracing::{debug, info, warn};
use wiregate_proto::{reason, CodecError, Envelope, FrameType};
use wiregate_storage::{AcceptedEvent, MessageRecord, Storage, EPOCH_UNKNOWN};

/// Close codes in the private-use range the clients understand.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_AUTH_FAILED: u16 = 4401;
const CLOSE_KICKED: u16 = 4402;
const CLOSE_OVERLOADED: u16 = 4429;

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Codec,
    Transport,
    Invalid,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Transport => write!(f, "transport failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<wiregate_storage::StorageError> for ServerError {
    fn from(_: wiregate_storage::StorageError) -> Self {
        Self::Storage
    }
}

impl From<CodecError> for ServerError {
    fn from(_: CodecError) -> Self {
        Self::Codec
    }
}

impl From<transport::TransportError> for ServerError {
    fn from(_: transport::TransportError) -> Self {
        Self::Transport
    }
}

impl From<std::io::Error> for ServerError {
    fn from(_: std::io::Error) -> Self {
        Self::Io
    }
}

/// How accepted single-chat sends move on from the ingress connection.
pub enum Pipeline {
    /// Persist and deliver inline.
    Direct,
    /// Hand off through the shared Redis log.
    Stream,
    /// Hand off through an in-process queue.
    Local(mpsc::Sender<AcceptedEvent>),
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub sessions: SessionRegistry,
    pub calls: CallRegistry,
    pub coalescer: Coalescer,
    pub pipeline: Pipeline,
}

impl AppState {
    /// Hands pre-encoded wire text to one local connection without
    /// waiting. A full channel marks the connection blocked; the
    /// maintenance loop evicts it when the peer never drains.
    pub fn deliver_local_text(&self, entry: &ConnectionEntry, text: &str) -> bool {
        match entry.sender.try_send(Outbound::Text(text.to_string())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.backpressure.mark_blocked(now_millis());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Hands an envelope to every connection a user holds on this
    /// instance, serializing it once. Returns true when at least one
    /// connection accepted it.
    pub async fn deliver_local(&self, user_id: i64, envelope: &Envelope) -> bool {
        let entries = self.sessions.get_all(user_id).await;
        if entries.is_empty() {
            return false;
        }
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(_) => return false,
        };
        let mut delivered = false;
        for entry in &entries {
            delivered |= self.deliver_local_text(entry, &text);
        }
        delivered
    }

    /// Routes an envelope to wherever the user is connected in the
    /// cluster. Returns true when a local connection accepted the frame
    /// or a remote instance was asked to push it.
    pub async fn deliver_to_user(&self, user_id: i64, envelope: &Envelope) -> bool {
        if self.sessions.contains(user_id).await {
            return self.deliver_local(user_id, envelope).await;
        }
        match self.storage.route_of(user_id).await {
            Ok(Some(route)) if route.instance_id != self.config.instance_id => {
                let value = match serde_json::to_value(envelope) {
                    Ok(value) => value,
                    Err(_) => return false,
                };
                self.storage
                    .publish_push(&route.instance_id, &[user_id], &value, now_millis())
                    .await
                    .is_ok()
            }
            // A route pointing here with no live entry is leftover from
            // an unclean close; the user is offline.
            Ok(_) => false,
            Err(_) => false,
        }
    }

}

/// Per-connection handle the frame handlers work against.
pub(crate) struct ConnectionContext {
    pub state: Arc<AppState>,
    pub user_id: i64,
    pub connection_id: String,
    pub sender: mpsc::Sender<Outbound>,
}

impl ConnectionContext {
    /// Sends a reply on the connection's own socket. Waits for channel
    /// room, so a slow client throttles its own request stream only.
    pub async fn send(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.encode() {
            let _ = self.sender.send(Outbound::Text(text)).await;
        }
    }

    pub async fn send_error(&self, code: &str, request: Option<&Envelope>) {
        self.send(&error_frame(code, request)).await;
    }
}

pub(crate) fn error_frame(code: &str, request: Option<&Envelope>) -> Envelope {
    let mut frame = Envelope::of(FrameType::Error);
    frame.reason = Some(code.to_string());
    frame.ts = Some(now_millis());
    if let Some(request) = request {
        frame.client_msg_id = request.client_msg_id.clone();
        frame.call_id = request.call_id;
    }
    frame
}

/// Rebuilds the wire form of a stored message for delivery or replay.
pub(crate) fn message_envelope(record: &MessageRecord) -> Envelope {
    let mut frame = Envelope::of(if record.group_id.is_some() {
        FrameType::GroupChat
    } else {
        FrameType::SingleChat
    });
    frame.server_msg_id = Some(record.server_msg_id.clone());
    frame.client_msg_id = record.client_msg_id.clone();
    frame.from = Some(record.sender_id);
    frame.to = record.recipient_id;
    frame.group_id = record.group_id;
    frame.msg_seq = Some(record.msg_seq);
    frame.msg_type = Some(record.msg_type.clone());
    frame.body = record.body.clone();
    frame.status = Some(record.status.clone());
    frame.ts = Some(record.created_at.timestamp_millis());
    frame
}

/// Drives one client socket from upgrade to teardown.
pub async fn handle_connection(state: Arc<AppState>, socket: TcpStream) {
    let (mut reader, writer, query_token) = match transport::accept(socket).await {
        Ok(parts) => parts,
        Err(error) => {
            debug!(%error, "websocket upgrade failed");
            return;
        }
    };
    let connection_id = generate_id("conn");
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(DEFAULT_QUEUE_DEPTH);
    let backpressure = Arc::new(BackpressureGuard::new());
    let mut writer_task = spawn_writer(
        writer,
        out_rx,
        Arc::clone(&backpressure),
        Arc::clone(&state.metrics),
    );

    let claims = match handshake::authenticate(&state, &mut reader, &out_tx, query_token).await {
        Ok(claims) => claims,
        Err(code) => {
            let mut fail = Envelope::of(FrameType::AuthFail);
            fail.reason = Some(code.to_string());
            fail.ts = Some(now_millis());
            if let Ok(text) = fail.encode() {
                let _ = out_tx.send(Outbound::Text(text)).await;
            }
            let _ = out_tx
                .send(Outbound::Close {
                    code: CLOSE_AUTH_FAILED,
                    reason: code.to_string(),
                })
                .await;
            drop(out_tx);
            let _ = writer_task.await;
            return;
        }
    };
    let user_id = claims.user_id;

    // Claim the cluster route; the newest connection owns presence.
    // Earlier devices stay bound and keep serving, they just stop
    // owning the route. Only an epoch bump evicts them.
    match state
        .storage
        .set_route_and_get_old(
            user_id,
            &state.config.instance_id,
            &connection_id,
            state.config.route_ttl_seconds,
        )
        .await
    {
        Ok(Some(previous)) if previous.instance_id != state.config.instance_id => {
            debug!(user_id, from = %previous.instance_id, "route moved to this instance");
        }
        Ok(_) => {}
        Err(error) => {
            warn!(user_id, %error, "route claim failed");
            let _ = out_tx
                .send(Outbound::Close {
                    code: CLOSE_OVERLOADED,
                    reason: reason::INTERNAL_ERROR.to_string(),
                })
                .await;
            drop(out_tx);
            let _ = writer_task.await;
            return;
        }
    }

    let entry = Arc::new(ConnectionEntry::with_backpressure(
        user_id,
        connection_id.clone(),
        out_tx.clone(),
        claims.session_epoch,
        Arc::clone(&backpressure),
    ));
    state.sessions.bind(Arc::clone(&entry)).await;
    state.metrics.incr_connections();
    info!(user_id, connection = %connection_id, "connection authenticated");

    let mut ok = Envelope::of(FrameType::AuthOk);
    ok.to = Some(user_id);
    ok.ts = Some(now_millis());
    if let Ok(text) = ok.encode() {
        let _ = out_tx.send(Outbound::Text(text)).await;
    }

    let ctx = Arc::new(ConnectionContext {
        state: Arc::clone(&state),
        user_id,
        connection_id: connection_id.clone(),
        sender: out_tx.clone(),
    });

    // Backlog replay happens off the read path so a large resend never
    // delays the first inbound frame.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            resend::replay_pending(&ctx).await;
        });
    }

    let maintenance = spawn_maintenance(Arc::clone(&state), Arc::clone(&entry));
    let queue = SerialQueue::new(DEFAULT_QUEUE_DEPTH);
    let mut graceful = true;

    loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Ok(Inbound::Text(payload)) => {
                    state.metrics.mark_ingress();
                    let envelope = match Envelope::decode(&payload) {
                        Ok(envelope) => envelope,
                        Err(CodecError::MissingType) => {
                            ctx.send_error(reason::MISSING_TYPE, None).await;
                            continue;
                        }
                        Err(_) => {
                            ctx.send_error(reason::BAD_JSON, None).await;
                            continue;
                        }
                    };
                    let job_ctx = Arc::clone(&ctx);
                    if !queue.enqueue(async move { dispatch(job_ctx, envelope).await }) {
                        ctx.send_error(reason::SERVER_BUSY, None).await;
                        let _ = out_tx
                            .send(Outbound::Close {
                                code: CLOSE_OVERLOADED,
                                reason: reason::SERVER_BUSY.to_string(),
                            })
                            .await;
                        break;
                    }
                }
                Ok(Inbound::Ping(payload)) => {
                    let _ = out_tx.send(Outbound::Pong(payload)).await;
                }
                Ok(Inbound::Pong) => {}
                Ok(Inbound::Closed) => break,
                Err(error) => {
                    debug!(user_id, %error, "read failed");
                    break;
                }
            },
            _ = entry.closed() => {
                graceful = false;
                break;
            }
        }
    }

    maintenance.abort();
    drop(queue);
    state.sessions.unbind_if(user_id, &connection_id).await;
    if let Err(error) = state
        .storage
        .delete_route_if_owner(user_id, &state.config.instance_id, &connection_id)
        .await
    {
        warn!(user_id, %error, "route release failed");
    }
    call::handle_disconnect(&state, user_id).await;
    state.metrics.decr_connections();
    if graceful {
        let _ = out_tx
            .send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: String::new(),
            })
            .await;
    } else {
        let _ = out_tx.try_send(Outbound::Close {
            code: CLOSE_KICKED,
            reason: String::new(),
        });
    }
    drop(ctx);
    drop(out_tx);
    // The writer may be wedged on a peer that stopped reading.
    if timeout(Duration::from_secs(5), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    info!(user_id, connection = %connection_id, "connection closed");
}

fn spawn_writer(
    mut writer: ChannelWriter,
    mut out_rx: mpsc::Receiver<Outbound>,
    backpressure: Arc<BackpressureGuard>,
    metrics: Arc<Metrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, Outbound::Close { .. });
            if writer.write(frame).await.is_err() {
                break;
            }
            backpressure.mark_drained();
            metrics.mark_egress();
            if closing {
                break;
            }
        }
        let _ = writer.close().await;
    })
}

fn spawn_maintenance(state: Arc<AppState>, entry: Arc<ConnectionEntry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let keepalive = Duration::from_secs(state.config.connection_keepalive.max(1));
        let renew_every = Duration::from_secs(((state.config.route_ttl_seconds as u64) / 3).max(1));
        let epoch_every = Duration::from_secs(state.config.epoch_recheck_seconds.max(1));
        let grace_ms = (state.config.backpressure_grace_seconds as i64) * 1000;
        let mut ticker = interval(Duration::from_secs(1));
        let mut last_ping = Instant::now();
        let mut last_renew = Instant::now();
        let mut last_epoch = Instant::now();
        loop {
            ticker.tick().await;
            if entry.backpressure.exceeded(now_millis(), grace_ms) {
                warn!(user_id = entry.user_id, "peer stopped draining, closing");
                state.metrics.mark_backpressure_close();
                entry.request_close();
                break;
            }
            let now = Instant::now();
            if now.duration_since(last_ping) >= keepalive {
                last_ping = now;
                let _ = entry.sender.try_send(Outbound::Ping(Vec::new()));
            }
            if now.duration_since(last_renew) >= renew_every {
                last_renew = now;
                match state
                    .storage
                    .renew_route_if_owner(
                        entry.user_id,
                        &state.config.instance_id,
                        &entry.connection_id,
                        state.config.route_ttl_seconds,
                    )
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        // A newer device owns the route. Take it back
                        // only if that owner has since lapsed, so the
                        // user stays reachable from other instances.
                        let _ = state
                            .storage
                            .claim_route_if_vacant(
                                entry.user_id,
                                &state.config.instance_id,
                                &entry.connection_id,
                                state.config.route_ttl_seconds,
                            )
                            .await;
                    }
                    Err(error) => {
                        warn!(user_id = entry.user_id, %error, "route renew failed");
                    }
                }
            }
            if now.duration_since(last_epoch) >= epoch_every {
                last_epoch = now;
                let current = state.storage.current_epoch(entry.user_id).await;
                if current != EPOCH_UNKNOWN && current > entry.session_epoch() {
                    let mut frame = Envelope::of(FrameType::Error);
                    frame.reason = Some(reason::SESSION_INVALID.to_string());
                    frame.ts = Some(now_millis());
                    if let Ok(text) = frame.encode() {
                        let _ = entry.sender.try_send(Outbound::Text(text));
                    }
                    state.metrics.mark_kick();
                    entry.request_close();
                    break;
                }
            }
        }
    })
}

async fn dispatch(ctx: Arc<ConnectionContext>, envelope: Envelope) {
    match envelope.frame_type() {
        FrameType::Ping => {
            let mut pong = Envelope::of(FrameType::Pong);
            pong.ts = Some(now_millis());
            ctx.send(&pong).await;
            // A pinging client is alive; refresh its route alongside the
            // periodic renewal.
            let _ = ctx
                .state
                .storage
                .renew_route_if_owner(
                    ctx.user_id,
                    &ctx.state.config.instance_id,
                    &ctx.connection_id,
                    ctx.state.config.route_ttl_seconds,
                )
                .await;
        }
        FrameType::Pong => {}
        FrameType::Auth | FrameType::Reauth => handshake::handle_reauth(&ctx, &envelope).await,
        FrameType::SingleChat => single_chat::handle(&ctx, envelope).await,
        FrameType::GroupChat => group_chat::handle(&ctx, envelope).await,
        FrameType::Ack => ack::handle(&ctx, &envelope).await,
        FrameType::FriendRequest => friend::handle(&ctx, &envelope).await,
        FrameType::MessageRevoke => revoke::handle(&ctx, &envelope).await,
        FrameType::CallInvite => call::handle_invite(&ctx, &envelope).await,
        FrameType::CallAccept => call::handle_accept(&ctx, &envelope).await,
        FrameType::CallReject => call::handle_reject(&ctx, &envelope).await,
        FrameType::CallCancel => call::handle_cancel(&ctx, &envelope).await,
        FrameType::CallEnd => call::handle_end(&ctx, &envelope).await,
        FrameType::CallIce => call::handle_ice(&ctx, &envelope).await,
        _ => ctx.send_error(reason::NOT_IMPLEMENTED, Some(&envelope)).await,
    }
}
