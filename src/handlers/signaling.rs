//! 방 안 피어들에게 이벤트를 전달하는 헬퍼와 미디어 중지 브로드캐스트

use crate::error::SfuError;
use crate::handlers::producer::close_producer;
use crate::protocol::{kind_name, ServerMessage};
use crate::state::SignalingState;
use mediasoup::prelude::MediaKind;
use std::sync::Arc;

/// 특정 피어에게 메시지 전송
pub fn send_to_peer(state: &SignalingState, peer_id: &str, message: ServerMessage) -> bool {
    match state.peers.get(peer_id) {
        Some(peer) => peer.sender.send(message).is_ok(),
        None => false,
    }
}

/// 방의 다른 모든 피어에게 브로드캐스트. 전달한 피어 수를 반환한다.
pub fn broadcast_to_room_except(
    state: &SignalingState,
    room_name: &str,
    except_peer_id: &str,
    message: ServerMessage,
) -> usize {
    let Some(room) = state.room(room_name) else {
        return 0;
    };

    room.peer_ids()
        .iter()
        .filter(|peer_id| peer_id.as_str() != except_peer_id)
        .filter(|peer_id| send_to_peer(state, peer_id, message.clone()))
        .count()
}

/// stop-camera / stop-sound 처리
///
/// 해당 종류의 프로듀서를 모두 닫고(소비자 측에는 `consumer-closed` 전달)
/// 방의 다른 피어들에게 `stop-camera` 또는 `stop-sound` 를 알린다.
pub async fn handle_stop_media(
    state: Arc<SignalingState>,
    peer_id: &str,
    kind: MediaKind,
) -> Result<(), SfuError> {
    let room_name = state.peer_room(peer_id).ok_or(SfuError::NotInRoom)?;

    let producer_ids: Vec<String> = state
        .peers
        .get(peer_id)
        .map(|peer| peer.producers.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|producer_id| {
            state
                .producers
                .get(producer_id)
                .map(|entry| entry.producer.kind() == kind)
                .unwrap_or(false)
        })
        .collect();

    for producer_id in &producer_ids {
        close_producer(&state, producer_id);
    }

    let message = match kind {
        MediaKind::Video => ServerMessage::StopCamera {
            peer_id: peer_id.to_string(),
        },
        MediaKind::Audio => ServerMessage::StopSound {
            peer_id: peer_id.to_string(),
        },
    };
    let notified = broadcast_to_room_except(&state, &room_name, peer_id, message);

    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        kind = kind_name(kind),
        closed_producers = producer_ids.len(),
        notified = notified,
        "Media stopped"
    );
    Ok(())
}
