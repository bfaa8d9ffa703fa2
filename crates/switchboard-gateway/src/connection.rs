use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_db::Database;
use switchboard_types::api::Claims;
use switchboard_types::events::{ChangeEvent, GatewayCommand, GatewayEvent, Topic};
use switchboard_types::models::Role;

use crate::dispatcher::Dispatcher;
use crate::visibility::Visibility;

/// Ping cadence. Two unanswered pings in a row close the session.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket may take to send Identify.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Subscriptions = Arc<std::sync::RwLock<HashSet<Topic>>>;

/// Handle a single WebSocket connection: Identify handshake, then the
/// change relay loop until either side goes away.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Nothing else is accepted before a valid Identify
    let Some(claims) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} ({}, {}) connected to gateway", claims.username, claims.sub, claims.role);

    let ready = GatewayEvent::Ready {
        user_id: claims.sub,
        role: claims.role,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, db, claims).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    claims: Claims,
) {
    let conn_id = dispatcher.register_session(claims.sub, claims.role).await;

    let mut change_rx = dispatcher.subscribe();

    // Acks produced by the command reader, relayed by the send task
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    // Per-connection topic subscriptions (shared between send and recv tasks).
    let subscriptions: Subscriptions = Arc::new(std::sync::RwLock::new(HashSet::new()));
    let send_subscriptions = subscriptions.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut visibility = Visibility::new(claims.sub, claims.role);
    let lookup_db = db;
    let viewer_id = claims.sub;

    // Forward matching changes + acks -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = change_rx.recv() => {
                    let Some(change) = relayable(result) else { break };

                    let wanted = match send_subscriptions.read() {
                        Ok(subs) => subs.iter().any(|topic| topic.matches(&change)),
                        Err(_) => break,
                    };
                    if !wanted {
                        continue;
                    }

                    let own = if visibility.needs_lookup(&change) {
                        let db = lookup_db.clone();
                        tokio::task::spawn_blocking(move || {
                            db.find_conversation_by_end_user(viewer_id)
                                .ok()
                                .flatten()
                                .map(|c| c.id)
                        })
                        .await
                        .ok()
                        .flatten()
                    } else {
                        None
                    };
                    let allowed = visibility.allows(&change, |_| own);
                    if !allowed {
                        continue;
                    }

                    if send_event(&mut sender, &GatewayEvent::Change(change)).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Topic commands and pongs from the client
    let username = claims.username.clone();
    let user_id = claims.sub;
    let role = claims.role;
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if !handle_command(role, cmd, &subscriptions, &reply_tx) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever side ends first takes the other down
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_session(conn_id).await;
    info!("{} ({}) disconnected from gateway", claims.username, claims.sub);
}

/// A lagged receiver has lost changes it cannot get back, so the session is
/// ended instead; the client reconnects and resyncs from the API.
fn relayable(result: Result<ChangeEvent, RecvError>) -> Option<ChangeEvent> {
    match result {
        Ok(change) => Some(change),
        Err(RecvError::Lagged(n)) => {
            warn!("Change receiver lagged by {} events, closing session", n);
            None
        }
        Err(RecvError::Closed) => None,
    }
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Claims> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Apply one client command. Returns `false` when the reply channel is gone.
fn handle_command(
    role: Role,
    cmd: GatewayCommand,
    subscriptions: &Subscriptions,
    reply_tx: &mpsc::UnboundedSender<GatewayEvent>,
) -> bool {
    match cmd {
        GatewayCommand::Identify { .. } => true, // Already handled

        GatewayCommand::Subscribe { topic } => {
            debug!("{} subscribing to {:?}", role, topic);
            match subscriptions.write() {
                Ok(mut subs) => {
                    subs.insert(topic);
                }
                Err(_) => return false,
            }
            reply_tx.send(GatewayEvent::Subscribed { topic }).is_ok()
        }

        GatewayCommand::Unsubscribe { topic } => {
            debug!("{} unsubscribing from {:?}", role, topic);
            match subscriptions.write() {
                Ok(mut subs) => {
                    subs.remove(&topic);
                    true
                }
                Err(_) => false,
            }
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}
