use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ems_types::events::{GatewayCommand, GatewayEvent};

use crate::error::HubError;
use crate::hub::{Actor, Hub};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection.
/// The bearer token was validated at the HTTP upgrade layer, so the client is
/// registered straight away; `Ready` means it is reachable.
pub async fn handle_connection(socket: WebSocket, hub: Hub, actor: Actor) {
    let (sender, receiver) = socket.split();

    info!("{} ({}) connected to gateway", actor.username, actor.user_id);

    run_connection_loop(sender, receiver, hub, actor).await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Ready, then one PresenceUpdate per user already online.
async fn send_greeting(
    sender: &mut SplitSink<WebSocket, Message>,
    hub: &Hub,
    actor: &Actor,
) -> Result<(), ()> {
    let ready = GatewayEvent::Ready {
        user_id: actor.user_id,
        username: actor.username.clone(),
        role: actor.role,
    };
    send_event(sender, &ready).await?;

    for user in hub.presence().await {
        if user.user_id == actor.user_id {
            continue;
        }
        let event = GatewayEvent::PresenceUpdate {
            user_id: user.user_id,
            username: user.username,
            online: true,
        };
        send_event(sender, &event).await?;
    }
    Ok(())
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    hub: Hub,
    actor: Actor,
) {
    let dispatcher = hub.dispatcher().clone();

    // Subscribe before registering so no presence change slips between the
    // snapshot and the live stream
    let mut broadcast_rx = dispatcher.subscribe();

    let (conn_id, mut user_rx) = dispatcher
        .register_user_channel(actor.user_id, actor.username.clone())
        .await;

    // Announce ourselves (broadcasts to everyone, including us)
    dispatcher.user_online(actor.user_id, actor.username.clone());

    if send_greeting(&mut sender, &hub, &actor).await.is_err() {
        dispatcher.user_offline(actor.user_id, conn_id).await;
        return;
    }

    // Replies to this connection's own commands (errors, presence lists)
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events + replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let event = tokio::select! {
                result = broadcast_rx.recv() => match result {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast receiver lagged by {} messages", n);
                        continue;
                    }
                    Err(_) => break,
                },
                result = user_rx.recv() => match result {
                    Some(event) => event,
                    // Registry dropped our sender: superseded by a newer connection
                    None => break,
                },
                Some(event) = reply_rx.recv() => event,
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
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    // Read commands from client
    let recv_hub = hub.clone();
    let recv_actor = actor.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if let Some(reply) = handle_command(&recv_hub, &recv_actor, cmd).await {
                            let _ = reply_tx.send(reply);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_actor.username,
                            recv_actor.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let _ = reply_tx.send(GatewayEvent::Error {
                            op: "parse".into(),
                            code: "bad_command".into(),
                            message: e.to_string(),
                        });
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

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.user_offline(actor.user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", actor.username, actor.user_id);
}

/// Run one client command. Returns the reply for this connection, if any.
pub async fn handle_command(hub: &Hub, actor: &Actor, cmd: GatewayCommand) -> Option<GatewayEvent> {
    let op = cmd.op();
    debug!("{} ({}) -> {}", actor.username, actor.user_id, op);

    let result = match cmd {
        GatewayCommand::SendMessage { to, content, client_ref } => hub
            .send_direct(actor, &to, &content, client_ref)
            .await
            .map(|_| None),

        GatewayCommand::Typing { to, is_typing } => {
            hub.typing(actor, &to, is_typing).await.map(|_| None)
        }

        GatewayCommand::MarkRead { message_id } => {
            hub.mark_read(actor, message_id).await.map(|_| None)
        }

        GatewayCommand::MarkConversationRead { with } => hub
            .mark_conversation_read(actor, &with)
            .await
            .map(|_| None),

        GatewayCommand::Broadcast { kind, title, message } => hub
            .broadcast_notification(actor, kind, &title, &message)
            .await
            .map(|_| None),

        GatewayCommand::MarkNotificationRead { notification_id } => hub
            .mark_notification_read(actor, notification_id)
            .await
            .map(|_| None),

        GatewayCommand::QueryPresence => Ok(Some(GatewayEvent::PresenceList {
            users: hub.presence().await,
        })),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => Some(error_event(op, actor, &e)),
    }
}

fn error_event(op: &str, actor: &Actor, err: &HubError) -> GatewayEvent {
    let message = match err {
        HubError::Storage(cause) => {
            error!("{} ({}) {} failed: {:#}", actor.username, actor.user_id, op, cause);
            "internal error".to_string()
        }
        other => {
            debug!("{} ({}) {} rejected: {}", actor.username, actor.user_id, op, other);
            other.to_string()
        }
    };
    GatewayEvent::Error {
        op: op.to_string(),
        code: err.code().to_string(),
        message,
    }
}
