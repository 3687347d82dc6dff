//! 컨슈머 생성과 재개

use crate::error::SfuError;
use crate::handlers::room::joined_router;
use crate::handlers::signaling::send_to_peer;
use crate::handlers::transport::get_recv_transport;
use crate::protocol::{kind_name, ConsumerParams, ConsumerParamsByKind, ServerMessage};
use crate::state::{ConsumerEntry, SignalingState};
use mediasoup::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

/// 컨슈머를 레지스트리와 피어에 등록한다.
///
/// 방 잠금 아래에서 프로듀서가 아직 방 인덱스에 있는지 확인한다. 이미 닫혔으면
/// 등록하지 않고 `false` 를 돌려주며, 컨슈머는 drop 되어 닫힌다.
pub fn add_consumer(
    state: &SignalingState,
    consumer: Consumer,
    room_name: &str,
    peer_id: &str,
    transport_id: &str,
) -> bool {
    let consumer_id = consumer.id().to_string();
    let producer_id = consumer.producer_id().to_string();
    let Some(room) = state.room(room_name) else {
        return false;
    };

    let members = room.members();
    if members.closed || !members.producers.contains(&producer_id) {
        tracing::debug!(
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Producer gone before consumer registered"
        );
        return false;
    }

    if let Some(mut peer) = state.peers.get_mut(peer_id) {
        peer.consumers.push(consumer_id.clone());
    }
    state.consumers.insert(
        consumer_id.clone(),
        ConsumerEntry {
            consumer,
            peer_id: peer_id.to_string(),
            producer_id: producer_id.clone(),
            transport_id: transport_id.to_string(),
        },
    );
    drop(members);

    tracing::debug!(
        room_name = %room_name,
        peer_id = %peer_id,
        consumer_id = %consumer_id,
        producer_id = %producer_id,
        "Consumer registered"
    );
    true
}

struct Candidate {
    producer: ProducerId,
    producer_id: String,
    owner: String,
    kind: MediaKind,
}

/// 이 피어가 아직 받지 않은, 방 안 다른 피어들의 프로듀서
fn unconsumed_producers(state: &SignalingState, room_name: &str, peer_id: &str) -> Vec<Candidate> {
    let consumed: HashSet<String> = state
        .consumers
        .iter()
        .filter(|e| e.peer_id == peer_id)
        .map(|e| e.producer_id.clone())
        .collect();
    let Some(room) = state.room(room_name) else {
        return Vec::new();
    };

    room.producer_ids()
        .into_iter()
        .filter(|producer_id| !consumed.contains(producer_id))
        .filter_map(|producer_id| {
            let entry = state.producers.get(&producer_id)?;
            (entry.peer_id != peer_id).then(|| Candidate {
                producer: entry.producer.id(),
                owner: entry.peer_id.clone(),
                kind: entry.producer.kind(),
                producer_id: producer_id.clone(),
            })
        })
        .collect()
}

/// create-consumer 처리
///
/// `producer_id` 가 있으면 그 프로듀서 하나만, 없으면 아직 받지 않은 모든 프로듀서를 대상으로 한다.
/// 디코딩할 수 없는 프로듀서는 컨슈머를 만들지 않고 `cannot-consume` 으로 알린다.
/// 명시적으로 요청한 프로듀서를 받을 수 없으면 `capability_mismatch` 에러가 된다.
/// 컨슈머는 일시정지 상태로 생성되며 `consumer-resume` 으로 재개한다.
pub async fn handle_create_consumer(
    state: Arc<SignalingState>,
    peer_id: &str,
    transport_id: Option<&str>,
    producer_id: Option<&str>,
    device_rtp_capabilities: RtpCapabilities,
) -> Result<(), SfuError> {
    let (room_name, router) = joined_router(&state, peer_id)?;

    let transport = match transport_id {
        Some(transport_id) => state
            .transports
            .get(transport_id)
            .filter(|e| e.peer_id == peer_id && e.room == room_name && e.consumer)
            .map(|e| e.transport.clone())
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?,
        None => get_recv_transport(&state, peer_id)
            .ok_or_else(|| SfuError::TransportNotFound("no receive transport".to_string()))?,
    };
    let transport_id = transport.id().to_string();

    let explicit = producer_id.is_some();
    let candidates = match producer_id {
        Some(producer_id) => {
            let entry = state
                .producers
                .get(producer_id)
                .filter(|e| e.room == room_name)
                .ok_or_else(|| SfuError::ProducerNotFound(producer_id.to_string()))?;
            if entry.peer_id == peer_id {
                return Err(SfuError::InvalidRequest(
                    "cannot consume own producer".to_string(),
                ));
            }
            vec![Candidate {
                producer: entry.producer.id(),
                producer_id: producer_id.to_string(),
                owner: entry.peer_id.clone(),
                kind: entry.producer.kind(),
            }]
        }
        None => unconsumed_producers(&state, &room_name, peer_id),
    };

    let mut params = ConsumerParamsByKind::default();
    for candidate in candidates {
        if !router.can_consume(&candidate.producer, &device_rtp_capabilities) {
            let reason = format!("device cannot decode {} producer", kind_name(candidate.kind));
            tracing::warn!(
                peer_id = %peer_id,
                producer_id = %candidate.producer_id,
                "Cannot consume producer"
            );
            if explicit {
                return Err(SfuError::CapabilityMismatch {
                    producer_id: candidate.producer_id,
                    reason,
                });
            }
            send_to_peer(
                &state,
                peer_id,
                ServerMessage::CannotConsume {
                    producer_id: candidate.producer_id,
                    reason,
                },
            );
            continue;
        }

        let mut options = ConsumerOptions::new(candidate.producer, device_rtp_capabilities.clone());
        options.paused = true;
        let consumer = match transport.consume(options).await {
            Ok(consumer) => consumer,
            Err(e) if explicit => {
                tracing::warn!(producer_id = %candidate.producer_id, error = %e, "Consume failed");
                return Err(SfuError::ProvisioningFailed(e.to_string()));
            }
            Err(e) => {
                // 그 사이 프로듀서가 닫혔을 수 있다
                tracing::warn!(producer_id = %candidate.producer_id, error = %e, "Consume failed");
                continue;
            }
        };

        let consumer_params = ConsumerParams {
            id: consumer.id().to_string(),
            producer_id: candidate.producer_id.clone(),
            peer_id: candidate.owner.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        };
        if !add_consumer(&state, consumer, &room_name, peer_id, &transport_id) {
            if explicit {
                return Err(SfuError::ProducerNotFound(candidate.producer_id));
            }
            continue;
        }
        params.push(consumer_params);
    }

    if params.is_empty() {
        tracing::debug!(peer_id = %peer_id, room_name = %room_name, "Nothing new to consume");
    }
    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        video = params.video.len(),
        audio = params.audio.len(),
        "Consumers created"
    );
    send_to_peer(&state, peer_id, ServerMessage::ConsumerCreated { params });
    Ok(())
}

/// consumer-resume 처리. id 가 없으면 피어의 일시정지된 컨슈머 전부를 재개한다.
pub async fn handle_consumer_resume(
    state: Arc<SignalingState>,
    peer_id: &str,
    consumer_id: Option<&str>,
) -> Result<(), SfuError> {
    let owned = state
        .peers
        .get(peer_id)
        .map(|peer| peer.consumers.clone())
        .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

    let targets: Vec<String> = match consumer_id {
        Some(consumer_id) => {
            if !owned.iter().any(|c| c == consumer_id) {
                return Err(SfuError::ConsumerNotFound(consumer_id.to_string()));
            }
            vec![consumer_id.to_string()]
        }
        None => owned,
    };

    // 맵 가드를 잡은 채 await 하지 않도록 핸들만 복제해 둔다
    let consumers: Vec<(String, Consumer)> = targets
        .into_iter()
        .filter_map(|consumer_id| {
            let consumer = state.consumers.get(&consumer_id)?.consumer.clone();
            Some((consumer_id, consumer))
        })
        .collect();

    let mut resumed = Vec::new();
    for (consumer_id, consumer) in consumers {
        if consumer.paused() {
            if let Err(e) = consumer.resume().await {
                tracing::warn!(consumer_id = %consumer_id, error = %e, "Consumer resume failed");
                continue;
            }
        }
        resumed.push(consumer_id);
    }

    tracing::debug!(peer_id = %peer_id, resumed = resumed.len(), "Consumers resumed");
    send_to_peer(
        &state,
        peer_id,
        ServerMessage::ConsumerResumed {
            consumer_ids: resumed,
        },
    );
    Ok(())
}
