//! Websocket chat endpoint
//!
//! Upgrades the connection and runs the socket loop. Inbound frames go
//! to the [`ConnectionDriver`]; outbound events leave through a channel
//! drained by a writer task, so event order on the wire is exactly
//! emission order. Finished query tasks are reaped from the same select
//! loop that reads the socket, which keeps terminal events interleaved
//! correctly with everything the driver emits.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use docpilot_common::metrics::record_connection;

use crate::middleware::rate_limit::RateGuard;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::state::AppState;
use crate::stream::ConnectionDriver;

/// Upgrade handler for `/v1/chat`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    record_connection(true);
    info!(client = %addr, "chat connection opened");

    let (mut sink, mut inbound) = socket.split();

    let capacity = state.config.stream.channel_capacity.max(1);
    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(capacity);

    // Writer task: events leave in the order they were emitted.
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(error) => {
                    warn!(%error, "failed to serialize outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let guard = RateGuard::new(
        &state.config.rate_limit,
        state.identity_limiter.clone(),
        addr.ip(),
    );
    let mut driver = ConnectionDriver::new(state.services.clone(), events_tx, guard);

    loop {
        tokio::select! {
            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => driver.on_message(message).await,
                            Err(error) => {
                                debug!(client = %addr, %error, "unparseable client frame");
                                driver
                                    .on_unparseable(format!("unrecognized message: {error}"))
                                    .await;
                            }
                        }
                    }
                    // Pings are answered by axum; binary frames are not
                    // part of the protocol.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        driver.shutdown();
                        break;
                    }
                    Some(Err(error)) => {
                        debug!(client = %addr, %error, "socket error");
                        driver.shutdown();
                        break;
                    }
                }
            }
            joined = driver.wait_in_flight() => {
                driver.finish_in_flight(joined).await;
            }
        }
    }

    // Dropping the driver releases the last event sender once aborted
    // tasks unwind, which lets the writer drain and exit.
    drop(driver);
    writer.await.ok();

    record_connection(false);
    info!(client = %addr, "chat connection closed");
}
