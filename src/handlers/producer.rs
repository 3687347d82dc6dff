//! 프로듀서 등록과 알림

use crate::error::SfuError;
use crate::handlers::room::joined_router;
use crate::handlers::signaling::send_to_peer;
use crate::protocol::{kind_name, ProducerInfo, ServerMessage};
use crate::state::{ProducerEntry, SignalingState};
use mediasoup::prelude::*;
use std::sync::Arc;

/// 프로듀서를 레지스트리, 피어, 방 인덱스에 등록
pub fn add_producer(
    state: &SignalingState,
    producer: Producer,
    room_name: &str,
    peer_id: &str,
    transport_id: &str,
) {
    let producer_id = producer.id().to_string();

    if let Some(mut peer) = state.peers.get_mut(peer_id) {
        peer.producers.push(producer_id.clone());
    }
    if let Some(room) = state.room(room_name) {
        room.members().producers.insert(producer_id.clone());
    }
    state.producers.insert(
        producer_id,
        ProducerEntry {
            producer,
            room: room_name.to_string(),
            peer_id: peer_id.to_string(),
            transport_id: transport_id.to_string(),
        },
    );
}

/// 방의 다른 모든 피어에게 `new-producer` 를 한 번씩 보낸다
pub fn inform_consumers(
    state: &SignalingState,
    room_name: &str,
    peer_id: &str,
    producer_id: &str,
) -> usize {
    let Some(kind) = state.producers.get(producer_id).map(|e| e.producer.kind()) else {
        return 0;
    };
    let Some(room) = state.room(room_name) else {
        return 0;
    };

    let mut informed = 0;
    for other in room.peer_ids().iter().filter(|p| p.as_str() != peer_id) {
        let message = ServerMessage::NewProducer {
            producer_id: producer_id.to_string(),
            peer_id: peer_id.to_string(),
            kind,
        };
        if send_to_peer(state, other, message) {
            informed += 1;
        }
    }

    tracing::debug!(
        room_name = %room_name,
        producer_id = %producer_id,
        informed = informed,
        "Informed consumers of new producer"
    );
    informed
}

/// 방에 있는 다른 피어들의 프로듀서 목록
pub fn room_producers(state: &SignalingState, room_name: &str, except_peer_id: &str) -> Vec<ProducerInfo> {
    let Some(room) = state.room(room_name) else {
        return Vec::new();
    };

    room.producer_ids()
        .iter()
        .filter_map(|producer_id| {
            let entry = state.producers.get(producer_id)?;
            (entry.peer_id != except_peer_id).then(|| ProducerInfo {
                producer_id: producer_id.clone(),
                peer_id: entry.peer_id.clone(),
                kind: entry.producer.kind(),
            })
        })
        .collect()
}

/// 프로듀서를 닫고 모든 레지스트리에서 제거한다.
/// 이 프로듀서를 받던 컨슈머 소유자에게 `consumer-closed` 를 보낸다.
///
/// 방 인덱스에서 먼저 빼고 나서 컨슈머를 훑는다. `add_consumer` 는 같은 잠금 아래에서
/// 인덱스를 확인하므로, 훑기에서 빠진 컨슈머는 등록되지 않는다.
pub fn close_producer(state: &SignalingState, producer_id: &str) {
    let Some((_, entry)) = state.producers.remove(producer_id) else {
        return;
    };

    if let Some(room) = state.room(&entry.room) {
        room.members().producers.remove(producer_id);
    }
    if let Some(mut peer) = state.peers.get_mut(&entry.peer_id) {
        peer.producers.retain(|p| p != producer_id);
    }
    // 마지막 핸들. 워커 쪽 프로듀서가 닫힌다.
    drop(entry.producer);

    let orphaned: Vec<(String, String)> = state
        .consumers
        .iter()
        .filter(|c| c.producer_id == producer_id)
        .map(|c| (c.key().clone(), c.peer_id.clone()))
        .collect();

    for (consumer_id, owner) in orphaned {
        state.consumers.remove(&consumer_id);
        if let Some(mut peer) = state.peers.get_mut(&owner) {
            peer.consumers.retain(|c| c != &consumer_id);
        }
        send_to_peer(
            state,
            &owner,
            ServerMessage::ConsumerClosed {
                consumer_id,
                producer_id: producer_id.to_string(),
            },
        );
    }

    tracing::info!(
        producer_id = %producer_id,
        peer_id = %entry.peer_id,
        "Producer closed"
    );
}

/// transport-produce 처리
pub async fn handle_produce(
    state: Arc<SignalingState>,
    peer_id: &str,
    transport_id: &str,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: serde_json::Value,
) -> Result<(), SfuError> {
    let (room_name, _) = joined_router(&state, peer_id)?;

    let transport = {
        let entry = state
            .transports
            .get(transport_id)
            .filter(|e| e.peer_id == peer_id && e.room == room_name)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;
        if entry.consumer {
            return Err(SfuError::InvalidRequest(format!(
                "transport {} is not a send transport",
                transport_id
            )));
        }
        entry.transport.clone()
    };

    tracing::debug!(peer_id = %peer_id, app_data = %app_data, "Producer app data");
    let mut options = ProducerOptions::new(kind, rtp_parameters);
    options.app_data = AppData::new(app_data);

    let producer = transport.produce(options).await.map_err(|e| {
        tracing::warn!(peer_id = %peer_id, transport_id = %transport_id, error = %e, "Produce failed");
        SfuError::InvalidRequest(e.to_string())
    })?;
    let producer_id = producer.id().to_string();

    add_producer(&state, producer, &room_name, peer_id, transport_id);
    send_to_peer(
        &state,
        peer_id,
        ServerMessage::Produced {
            id: producer_id.clone(),
        },
    );
    let informed = inform_consumers(&state, &room_name, peer_id, &producer_id);

    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        producer_id = %producer_id,
        kind = kind_name(kind),
        informed = informed,
        "Producer created"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{handle_create_transports, handle_join_room, handle_stop_media};
    use crate::state::test_support::{connect, drain, opus_parameters, state, vp8_parameters};
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn send_transport(
        state: &Arc<SignalingState>,
        peer_id: &str,
        rx: &mut UnboundedReceiver<ServerMessage>,
    ) -> String {
        handle_create_transports(state.clone(), peer_id, true).await.unwrap();
        drain(rx)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::TransportCreated { params, .. } => Some(params.id),
                _ => None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn every_other_member_hears_about_new_producer_once() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        let (c, mut rx_c) = connect(&state).await;
        let (outsider, mut rx_out) = connect(&state).await;
        for peer in [&a, &b, &c] {
            handle_join_room(state.clone(), peer, "room").await.unwrap();
        }
        handle_join_room(state.clone(), &outsider, "elsewhere").await.unwrap();
        for rx in [&mut rx_b, &mut rx_c, &mut rx_out] {
            drain(rx);
        }

        let transport_id = send_transport(&state, &a, &mut rx_a).await;
        handle_produce(
            state.clone(),
            &a,
            &transport_id,
            MediaKind::Video,
            vp8_parameters(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();

        let produced = drain(&mut rx_a);
        assert!(matches!(produced.as_slice(), [ServerMessage::Produced { .. }]));

        for rx in [&mut rx_b, &mut rx_c] {
            let messages = drain(rx);
            assert_eq!(messages.len(), 1);
            assert!(matches!(
                &messages[0],
                ServerMessage::NewProducer { peer_id, kind: MediaKind::Video, .. } if peer_id == &a
            ));
        }
        assert!(drain(&mut rx_out).is_empty());
    }

    #[tokio::test]
    async fn produce_rejects_foreign_transport() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_join_room(state.clone(), &b, "room").await.unwrap();

        let transport_id = send_transport(&state, &a, &mut rx_a).await;
        let err = handle_produce(
            state.clone(),
            &b,
            &transport_id,
            MediaKind::Audio,
            opus_parameters(),
            serde_json::Value::Null,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "transport_not_found");
    }

    #[tokio::test]
    async fn late_joiner_receives_producer_list() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        let transport_id = send_transport(&state, &a, &mut rx_a).await;
        handle_produce(
            state.clone(),
            &a,
            &transport_id,
            MediaKind::Audio,
            opus_parameters(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();

        let (b, mut rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &b, "room").await.unwrap();
        let list = drain(&mut rx_b)
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::ProducerList { producers } => Some(producers),
                _ => None,
            })
            .unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].peer_id, a);
        assert_eq!(list[0].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn stop_camera_closes_video_producers_only() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_join_room(state.clone(), &b, "room").await.unwrap();

        let transport_id = send_transport(&state, &a, &mut rx_a).await;
        for (kind, params) in [
            (MediaKind::Video, vp8_parameters()),
            (MediaKind::Audio, opus_parameters()),
        ] {
            handle_produce(state.clone(), &a, &transport_id, kind, params, serde_json::Value::Null)
                .await
                .unwrap();
        }
        drain(&mut rx_b);

        handle_stop_media(state.clone(), &a, MediaKind::Video).await.unwrap();

        let remaining = state.peers.get(&a).unwrap().producers.clone();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            state.producers.get(&remaining[0]).unwrap().producer.kind(),
            MediaKind::Audio
        );
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::StopCamera { peer_id }] if peer_id == &a
        ));
    }
}
