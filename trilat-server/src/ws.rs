//! Anchor WebSocket endpoint
//!
//! One task per connection. Frames to the anchor go through a single writer
//! task fed by the connection's outbound queue; the reader loop drives the
//! session state machine and waits on three things at once: the next frame,
//! the identity grace timer and a close request from the coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use trilat_core::protocol::parse_frame;
use trilat_core::{
    fallback_hardware_id, Action, HardwareId, Outbound, ReplyStyle, ServiceMessage, Session,
    SessionEvent,
};

use crate::service::{Connection, ConnectionHandle, Coordinator};

/// Upgrade handler for `/ws`
pub async fn ws_handler(
    State(coordinator): State<Arc<Coordinator>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, coordinator))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, coordinator: Arc<Coordinator>) {
    let Connection {
        id,
        handle,
        mut outbound_rx,
        closed,
    } = coordinator.open_connection();

    info!("New WebSocket connection {} from {}", id, remote);

    let mut session = Session::new(id, fallback_hardware_id(&remote.ip()));
    let (mut sender, mut receiver) = socket.split();

    // Writer task: sole owner of the sink
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode frame: {}", e);
                    continue;
                }
            };

            debug!("Sending to connection {}: {}", id, text);
            if let Err(e) = sender.send(Message::Text(text)).await {
                debug!("Write to connection {} failed: {}", id, e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    if let Err(e) = session.handle_event(SessionEvent::TransportReady) {
        warn!("{}", e);
    }

    let grace = tokio::time::sleep(coordinator.config().identity_grace);
    tokio::pin!(grace);
    let mut grace_pending = true;

    loop {
        tokio::select! {
            _ = closed.notified() => {
                info!("Connection {} superseded, closing", id);
                break;
            }

            _ = &mut grace, if grace_pending => {
                grace_pending = false;
                if session.is_awaiting_identity() {
                    debug!(
                        "Connection {} did not register in time, using {}",
                        id, session.fallback_hardware_id
                    );
                    let hardware_id = session.fallback_hardware_id.clone();
                    confirm_identity(&coordinator, &mut session, hardware_id, ReplyStyle::Legacy);
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from connection {}: {}", id, text.as_str());
                        handle_text(&coordinator, &mut session, &handle, text.as_str());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session.frames_discarded += 1;
                        debug!("Ignoring binary frame on connection {}", id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read error on connection {}: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = session.handle_event(SessionEvent::TransportClosed) {
        warn!("{}", e);
    }
    coordinator.close_connection(id, session.anchor_id.as_deref());

    // Writer exits once every sender is gone
    drop(handle);
    if let Err(e) = writer.await {
        error!("Writer task for connection {} failed: {}", id, e);
    }
}

fn handle_text(
    coordinator: &Coordinator,
    session: &mut Session,
    handle: &ConnectionHandle,
    text: &str,
) {
    if let Some(anchor_id) = session.anchor_id.as_deref() {
        coordinator.touch(anchor_id);
    }

    let inbound = match parse_frame(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            session.frames_discarded += 1;
            warn!(
                "Discarding frame on connection {}: {}",
                session.connection, e
            );
            return;
        }
    };

    let target_filter = coordinator.config().target_filter.as_deref();

    match session.dispatch(inbound, target_filter) {
        Action::Register { hardware_id, style } => {
            confirm_identity(coordinator, session, hardware_id, style);
        }
        Action::Pong(style) => {
            handle.send(match style {
                ReplyStyle::Json => Outbound::Message(ServiceMessage::Pong),
                ReplyStyle::Legacy => Outbound::LegacyPong,
            });
        }
        Action::Measurement { rssi, distance } => {
            if let Some(anchor_id) = session.anchor_id.as_deref() {
                if let Err(e) = coordinator.record_measurement(anchor_id, rssi, distance) {
                    warn!("Failed to record measurement: {}", e);
                }
            }
        }
        Action::SetPosition(position) => {
            if let Some(anchor_id) = session.anchor_id.as_deref() {
                if let Err(e) = coordinator.set_anchor_position(anchor_id, position) {
                    warn!("Failed to set position: {}", e);
                }
            }
        }
        Action::SetCalibration(calibration) => {
            if let Some(anchor_id) = session.anchor_id.as_deref() {
                if let Err(e) = coordinator.set_anchor_calibration(anchor_id, calibration) {
                    warn!("Failed to set calibration: {}", e);
                }
            }
        }
        Action::Discard(_) => {}
    }
}

fn confirm_identity(
    coordinator: &Coordinator,
    session: &mut Session,
    hardware_id: HardwareId,
    style: ReplyStyle,
) {
    let registration = coordinator.register(
        session.connection,
        &hardware_id,
        session.anchor_id.as_deref(),
        style,
    );

    if let Err(e) = session.handle_event(SessionEvent::IdentityConfirmed {
        anchor_id: registration.anchor_id,
        hardware_id,
    }) {
        warn!("{}", e);
    }
}
