//! HTTP / WebSocket 표면과 메시지 디스패치

use crate::error::SfuError;
use crate::handlers;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::SignalingState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use mediasoup::prelude::MediaKind;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn app(state: Arc<SignalingState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>SFU Signaling Server</h1><p>WebSocket endpoint: /ws</p>")
}

async fn health_handler(State(state): State<Arc<SignalingState>>) -> Json<serde_json::Value> {
    let routers = state
        .rooms
        .iter()
        .filter(|room| room.router.initialized())
        .count();
    let status = if state.worker.closed() { "degraded" } else { "ok" };

    Json(serde_json::json!({
        "status": status,
        "server": env!("CARGO_PKG_NAME"),
        "worker": state.worker.id().to_string(),
        "rooms": state.rooms.len(),
        "routers": routers,
        "peers": state.peers.len(),
        "timestamp": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let (peer_id, shutdown) = handlers::handle_connection(state.clone(), tx).await;

    // 송신 태스크
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize message"),
            }
        }
    });

    // 수신 처리
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!(peer_id = %peer_id, "Closing idle connection");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&state, &peer_id, &text).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    handlers::touch(&state, &peer_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    handlers::send_to_peer(
                        &state,
                        &peer_id,
                        ServerMessage::error(&SfuError::InvalidRequest(
                            "binary frames are not supported".to_string(),
                        )),
                    );
                }
                Some(Err(e)) => {
                    tracing::debug!(peer_id = %peer_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    // 연결 해제
    handlers::handle_disconnect(state, &peer_id).await;
    send_task.abort();
}

/// 텍스트 프레임 하나를 파싱하고 처리한다. 실패는 `error` 이벤트로 돌려준다.
pub async fn handle_text_frame(state: &Arc<SignalingState>, peer_id: &str, text: &str) {
    handlers::touch(state, peer_id);

    let result = match ClientMessage::parse(text) {
        Ok(msg) => handle_client_message(state, peer_id, msg).await,
        Err(e) => Err(SfuError::InvalidRequest(e.to_string())),
    };

    if let Err(err) = result {
        tracing::warn!(peer_id = %peer_id, code = err.code(), error = %err, "Request failed");
        handlers::send_to_peer(state, peer_id, ServerMessage::error(&err));
    }
}

async fn handle_client_message(
    state: &Arc<SignalingState>,
    peer_id: &str,
    msg: ClientMessage,
) -> Result<(), SfuError> {
    match msg {
        ClientMessage::Heartbeat => {
            handlers::handle_heartbeat(state, peer_id);
            Ok(())
        }
        ClientMessage::JoinRoom { room_name } => {
            handlers::handle_join_room(state.clone(), peer_id, &room_name).await
        }
        ClientMessage::LeaveRoom => handlers::handle_leave_room(state.clone(), peer_id).await,
        ClientMessage::RouterRtpCapabilities => {
            handlers::handle_router_rtp_capabilities(state.clone(), peer_id)
        }
        ClientMessage::CreateTransports { sender } => {
            handlers::handle_create_transports(state.clone(), peer_id, sender).await
        }
        ClientMessage::TransportSendConnect {
            transport_id,
            dtls_parameters,
        } => {
            handlers::handle_transport_connect(
                state.clone(),
                peer_id,
                &transport_id,
                dtls_parameters,
                false,
            )
            .await
        }
        ClientMessage::TransportRecvConnect {
            transport_id,
            dtls_parameters,
        } => {
            handlers::handle_transport_connect(
                state.clone(),
                peer_id,
                &transport_id,
                dtls_parameters,
                true,
            )
            .await
        }
        ClientMessage::TransportProduce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            handlers::handle_produce(
                state.clone(),
                peer_id,
                &transport_id,
                kind,
                rtp_parameters,
                app_data,
            )
            .await
        }
        ClientMessage::CreateConsumer {
            transport_id,
            producer_id,
            device_rtp_capabilities,
        } => {
            handlers::handle_create_consumer(
                state.clone(),
                peer_id,
                transport_id.as_deref(),
                producer_id.as_deref(),
                device_rtp_capabilities,
            )
            .await
        }
        ClientMessage::ConsumerResume { consumer_id } => {
            handlers::handle_consumer_resume(state.clone(), peer_id, consumer_id.as_deref()).await
        }
        ClientMessage::StopCamera => {
            handlers::handle_stop_media(state.clone(), peer_id, MediaKind::Video).await
        }
        ClientMessage::StopSound => {
            handlers::handle_stop_media(state.clone(), peer_id, MediaKind::Audio).await
        }
    }
}
