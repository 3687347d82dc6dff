//! 방 관리 핸들러

use crate::codecs::media_codecs;
use crate::error::SfuError;
use crate::handlers::producer::{close_producer, room_producers};
use crate::handlers::signaling::{broadcast_to_room_except, send_to_peer};
use crate::protocol::ServerMessage;
use crate::state::{Room, SignalingState};
use mediasoup::prelude::*;
use mediasoup::worker::RequestError;
use std::sync::Arc;

/// 방의 라우터를 가져오거나 만들고 피어를 멤버로 등록한다.
///
/// 같은 방 이름으로 동시에 들어와도 라우터는 하나만 만들어진다.
/// 마지막 피어가 나가 정리 중인 방을 만나면 새 방으로 다시 시도한다.
pub async fn create_room(
    state: &SignalingState,
    room_name: &str,
    peer_id: &str,
) -> Result<Router, SfuError> {
    loop {
        let room = state
            .rooms
            .entry(room_name.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_name.to_string())))
            .clone();

        if let Some(router) = try_enter_room(state, &room, peer_id).await? {
            return Ok(router);
        }
    }
}

/// 이미 꺼낸 방에 입장을 시도한다. 그 사이 방이 닫혔으면 `None`.
pub async fn try_enter_room(
    state: &SignalingState,
    room: &Arc<Room>,
    peer_id: &str,
) -> Result<Option<Router>, SfuError> {
    let room_name = room.name.as_str();
    let router = room
        .router
        .get_or_try_init(|| async {
            let router = state
                .worker
                .create_router(RouterOptions::new(media_codecs()))
                .await?;
            let router_id = router.id();
            let closed_room = room_name.to_string();
            router
                .on_close(move || {
                    tracing::info!(room_name = %closed_room, router_id = %router_id, "Router closed");
                })
                .detach();
            tracing::info!(room_name = %room_name, router_id = %router.id(), "Room created");
            Ok::<_, RequestError>(router)
        })
        .await;

    let router = match router {
        Ok(router) => router.clone(),
        Err(e) => {
            tracing::error!(room_name = %room_name, error = %e, "Failed to create router");
            state
                .rooms
                .remove_if(room_name, |_, r| Arc::ptr_eq(r, room) && r.router.get().is_none());
            return Err(e.into());
        }
    };

    let mut members = room.members();
    if members.closed {
        return Ok(None);
    }

    if !members.peers.iter().any(|p| p == peer_id) {
        let max_size = state.config.room.max_size;
        if max_size > 0 && members.peers.len() >= max_size {
            tracing::warn!(room_name = %room_name, peer_id = %peer_id, "Room full, rejected join");
            return Err(SfuError::RoomFull(room_name.to_string()));
        }
        members.peers.push(peer_id.to_string());
    }

    Ok(Some(router))
}

/// 피어가 속한 방 이름과 라우터
pub fn joined_router(state: &SignalingState, peer_id: &str) -> Result<(String, Router), SfuError> {
    let room_name = state.peer_room(peer_id).ok_or(SfuError::NotInRoom)?;
    let room = state
        .room(&room_name)
        .ok_or_else(|| SfuError::RoomNotFound(room_name.clone()))?;
    let router = room
        .router
        .get()
        .cloned()
        .ok_or(SfuError::WorkerUnavailable)?;
    Ok((room_name, router))
}

/// 방 참여 처리
pub async fn handle_join_room(
    state: Arc<SignalingState>,
    peer_id: &str,
    room_name: &str,
) -> Result<(), SfuError> {
    let room_name = room_name.trim();
    if room_name.is_empty() {
        return Err(SfuError::InvalidRequest("room name must not be empty".to_string()));
    }

    let current = state
        .peers
        .get(peer_id)
        .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?
        .room
        .clone();
    let rejoin = current.as_deref() == Some(room_name);

    // 새 방에 자리를 먼저 확보한다. 실패하면 기존 방은 그대로 남는다.
    let router = create_room(&state, room_name, peer_id).await?;

    if current.is_some() && !rejoin {
        if let Err(e) = handle_leave_room(state.clone(), peer_id).await {
            tracing::debug!(peer_id = %peer_id, error = %e, "Previous room already left");
        }
    }

    match state.peers.get_mut(peer_id) {
        Some(mut peer) => peer.room = Some(room_name.to_string()),
        None => {
            // 라우터를 기다리는 동안 연결이 끊겼다
            leave_room_internal(&state, peer_id, room_name);
            return Err(SfuError::PeerNotFound(peer_id.to_string()));
        }
    }

    let peers = state
        .room(room_name)
        .map(|room| room.peer_ids())
        .unwrap_or_default();
    let peer_count = peers.len();

    send_to_peer(
        &state,
        peer_id,
        ServerMessage::JoinedRoom {
            room_name: room_name.to_string(),
            peer_id: peer_id.to_string(),
            peers,
            rtp_capabilities: router.rtp_capabilities().clone(),
        },
    );

    let producers = room_producers(&state, room_name, peer_id);
    if !producers.is_empty() {
        send_to_peer(&state, peer_id, ServerMessage::ProducerList { producers });
    }

    if !rejoin {
        broadcast_to_room_except(
            &state,
            room_name,
            peer_id,
            ServerMessage::PeerJoined {
                peer_id: peer_id.to_string(),
                room_name: room_name.to_string(),
            },
        );
    }

    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        peer_count = peer_count,
        "Peer joined room"
    );
    Ok(())
}

/// 방 나가기 처리. 피어의 미디어 자원을 모두 정리한다.
pub async fn handle_leave_room(state: Arc<SignalingState>, peer_id: &str) -> Result<(), SfuError> {
    let (room_name, transports, producers, consumers) = {
        let mut peer = state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        let room_name = peer.room.take().ok_or(SfuError::NotInRoom)?;
        (
            room_name,
            std::mem::take(&mut peer.transports),
            std::mem::take(&mut peer.producers),
            std::mem::take(&mut peer.consumers),
        )
    };

    release_peer_media(&state, &transports, &producers, &consumers);
    leave_room_internal(&state, peer_id, &room_name);
    Ok(())
}

/// 프로듀서를 먼저 닫아 소비자에게 알리고, 컨슈머와 트랜스포트를 레지스트리에서 뺀다.
/// 레지스트리가 마지막 핸들을 갖고 있으므로 drop 과 함께 워커 쪽에서도 닫힌다.
pub fn release_peer_media(
    state: &SignalingState,
    transports: &[String],
    producers: &[String],
    consumers: &[String],
) {
    for producer_id in producers {
        close_producer(state, producer_id);
    }
    for consumer_id in consumers {
        state.consumers.remove(consumer_id);
    }
    for transport_id in transports {
        state.transports.remove(transport_id);
    }
}

/// 방 멤버에서 제거. 마지막 피어였으면 방을 닫는다.
/// 방이 맵에서 빠지면 라우터의 마지막 핸들도 사라져 닫힌다.
pub fn leave_room_internal(state: &SignalingState, peer_id: &str, room_name: &str) {
    let Some(room) = state.room(room_name) else {
        return;
    };

    let remaining = {
        let mut members = room.members();
        members.peers.retain(|p| p != peer_id);
        if members.peers.is_empty() {
            members.closed = true;
            // members 를 잡은 채로 제거해야 재입장 시 닫힌 방을 다시 만나지 않는다
            state.rooms.remove_if(room_name, |_, r| Arc::ptr_eq(r, &room));
        }
        members.peers.len()
    };

    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        remaining = remaining,
        "Peer left room"
    );

    if remaining == 0 {
        tracing::info!(
            room_name = %room.name,
            age_ms = room.created_at.elapsed().as_millis() as u64,
            "Room closed"
        );
    } else {
        broadcast_to_room_except(
            state,
            room_name,
            peer_id,
            ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );
    }
}

/// router-rtp-capabilities 처리
pub fn handle_router_rtp_capabilities(
    state: Arc<SignalingState>,
    peer_id: &str,
) -> Result<(), SfuError> {
    let (_, router) = joined_router(&state, peer_id)?;
    send_to_peer(
        &state,
        peer_id,
        ServerMessage::RouterRtpCapabilities {
            rtp_capabilities: router.rtp_capabilities().clone(),
        },
    );
    Ok(())
}
