//! 연결 핸들러

use crate::handlers::room::{leave_room_internal, release_peer_media};
use crate::handlers::signaling::send_to_peer;
use crate::protocol::ServerMessage;
use crate::state::{Peer, SignalingState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc::UnboundedSender, Notify};
use uuid::Uuid;

/// 새 연결 처리. 피어 id 와 유휴 종료 신호를 돌려준다.
pub async fn handle_connection(
    state: Arc<SignalingState>,
    sender: UnboundedSender<ServerMessage>,
) -> (String, Arc<Notify>) {
    let peer_id = Uuid::new_v4().to_string();
    let peer = Peer::new(peer_id.clone(), sender.clone());
    let shutdown = peer.shutdown.clone();

    state.peers.insert(peer_id.clone(), peer);

    let _ = sender.send(ServerMessage::Connected {
        peer_id: peer_id.clone(),
    });

    tracing::info!(peer_id = %peer_id, "New connection established");
    (peer_id, shutdown)
}

/// 연결 해제 처리
///
/// 트랜스포트(와 그 위의 프로듀서/컨슈머)를 모두 닫고 레지스트리에서 지운 뒤 방에서 뺀다.
/// 방이 비면 라우터를 닫고 방을 삭제한다.
pub async fn handle_disconnect(state: Arc<SignalingState>, peer_id: &str) {
    if let Some((_, peer)) = state.peers.remove(peer_id) {
        release_peer_media(&state, &peer.transports, &peer.producers, &peer.consumers);
        if let Some(room_name) = peer.room {
            leave_room_internal(&state, peer_id, &room_name);
        }

        tracing::info!(
            peer_id = %peer_id,
            connected_ms = peer.connected_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

/// 수신한 메시지마다 호출된다
pub fn touch(state: &SignalingState, peer_id: &str) {
    if let Some(mut peer) = state.peers.get_mut(peer_id) {
        peer.last_seen = Instant::now();
    }
}

/// Heartbeat 처리
pub fn handle_heartbeat(state: &SignalingState, peer_id: &str) {
    touch(state, peer_id);
    send_to_peer(state, peer_id, ServerMessage::HeartbeatAck);
}

/// 유휴 피어의 소켓 태스크에 종료를 알린다. 실제 정리는 `handle_disconnect` 가 한다.
pub fn cleanup_idle_peers(state: &SignalingState) -> usize {
    let timeout = Duration::from_millis(state.config.peer.idle_timeout_ms);
    let now = Instant::now();

    let idle: Vec<(String, Arc<Notify>)> = state
        .peers
        .iter()
        .filter(|peer| now.duration_since(peer.last_seen) > timeout)
        .map(|peer| (peer.id.clone(), peer.shutdown.clone()))
        .collect();

    for (peer_id, shutdown) in &idle {
        tracing::info!(peer_id = %peer_id, "Idle peer timed out");
        shutdown.notify_one();
    }

    if !idle.is_empty() {
        tracing::info!(idle_peers = idle.len(), "Idle cleanup completed");
    }
    idle.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::{
        handle_create_consumer, handle_create_transports, handle_join_room, handle_produce,
        joined_router,
    };
    use crate::state::test_support::{
        connect, device_caps, drain, on_close_flag, state, state_with, vp8_parameters,
    };
    use mediasoup::prelude::MediaKind;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn connection_announces_peer_id() {
        let state = state().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (peer_id, _) = handle_connection(state.clone(), tx).await;

        assert!(state.peers.contains_key(&peer_id));
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Connected { peer_id: announced }) if announced == peer_id
        ));
    }

    #[tokio::test]
    async fn disconnect_releases_everything() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_join_room(state.clone(), &b, "room").await.unwrap();

        handle_create_transports(state.clone(), &a, true).await.unwrap();
        let send = drain(&mut rx_a)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::TransportCreated { params, .. } => Some(params.id),
                _ => None,
            })
            .unwrap();
        handle_produce(
            state.clone(),
            &a,
            &send,
            MediaKind::Video,
            vp8_parameters(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();
        handle_create_transports(state.clone(), &b, false).await.unwrap();
        handle_create_consumer(state.clone(), &b, None, None, device_caps())
            .await
            .unwrap();
        let router_closed = on_close_flag(&joined_router(&state, &a).unwrap().1);
        drain(&mut rx_b);

        handle_disconnect(state.clone(), &a).await;

        assert!(!state.peers.contains_key(&a));
        assert!(state.producers.is_empty());
        assert!(state.consumers.is_empty());
        assert!(state.transports.iter().all(|e| e.peer_id != a));
        assert!(state.peers.get(&b).unwrap().consumers.is_empty());
        assert!(!router_closed.load(Ordering::SeqCst));

        let messages = drain(&mut rx_b);
        assert!(matches!(messages.first(), Some(ServerMessage::ConsumerClosed { .. })));
        assert!(matches!(
            messages.last(),
            Some(ServerMessage::PeerLeft { peer_id }) if peer_id == &a
        ));

        // 마지막 피어가 나가면 라우터가 닫히고 방이 사라진다
        handle_disconnect(state.clone(), &b).await;
        assert!(router_closed.load(Ordering::SeqCst));
        assert!(state.rooms.is_empty());
        assert!(state.transports.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        handle_heartbeat(&state, &a);
        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::HeartbeatAck)));
    }

    #[tokio::test]
    async fn idle_peers_are_signalled() {
        let mut config = Config::default();
        config.peer.idle_timeout_ms = 0;
        let state = state_with(config).await;
        let (a, _rx_a) = connect(&state).await;
        let shutdown = state.peers.get(&a).unwrap().shutdown.clone();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cleanup_idle_peers(&state), 1);

        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .expect("idle peer should be signalled");
    }

    #[tokio::test]
    async fn active_peers_are_left_alone() {
        let state = state().await;
        let (a, _rx_a) = connect(&state).await;
        touch(&state, &a);
        assert_eq!(cleanup_idle_peers(&state), 0);
    }
}
