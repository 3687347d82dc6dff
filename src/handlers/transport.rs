//! WebRTC 트랜스포트 생성, 등록, 연결

use crate::config::RtcConfig;
use crate::error::SfuError;
use crate::handlers::ice::ice_servers;
use crate::handlers::producer::close_producer;
use crate::handlers::room::joined_router;
use crate::handlers::signaling::send_to_peer;
use crate::protocol::{ServerMessage, TransportParams};
use crate::state::{SignalingState, TransportEntry};
use mediasoup::data_structures::DtlsState;
use mediasoup::prelude::*;
use std::sync::{Arc, Weak};

/// 설정된 IP, 포트 범위, 프로토콜로 트랜스포트 옵션을 만든다
pub fn transport_options(rtc: &RtcConfig) -> WebRtcTransportOptions {
    let listen_info = |protocol| ListenInfo {
        protocol,
        ip: rtc.listen_ip,
        announced_address: rtc.announced_ip.clone(),
        port: None,
        port_range: Some(rtc.min_port..=rtc.max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    };

    // UDP/TCP 가 모두 꺼져 있으면 UDP 로 연다
    let enable_udp = rtc.enable_udp || !rtc.enable_tcp;
    let mut protocols = Vec::new();
    if enable_udp {
        protocols.push(Protocol::Udp);
    }
    if rtc.enable_tcp {
        protocols.push(Protocol::Tcp);
    }

    let mut listen_infos = WebRtcTransportListenInfos::new(listen_info(protocols[0]));
    for protocol in protocols.into_iter().skip(1) {
        listen_infos = listen_infos.insert(listen_info(protocol));
    }

    let mut options = WebRtcTransportOptions::new(listen_infos);
    options.enable_udp = enable_udp;
    options.enable_tcp = rtc.enable_tcp;
    options.prefer_udp = rtc.prefer_udp;
    options.initial_available_outgoing_bitrate = rtc.initial_outgoing_bitrate;
    options
}

/// 라우터에 트랜스포트를 만든다.
/// DTLS 가 closed/failed 가 되면 레지스트리에서 지워 닫는다.
pub async fn create_transport(
    state: &Arc<SignalingState>,
    router: &Router,
    options: WebRtcTransportOptions,
) -> Result<WebRtcTransport, SfuError> {
    let transport = router.create_webrtc_transport(options).await.map_err(|e| {
        tracing::error!(router_id = %router.id(), error = %e, "Failed to create transport");
        SfuError::from(e)
    })?;

    let transport_id = transport.id().to_string();
    transport
        .on_close({
            let transport_id = transport_id.clone();
            Box::new(move || {
                tracing::info!(transport_id = %transport_id, "Transport closed");
            })
        })
        .detach();

    // 이벤트는 워커 스레드에서 오므로 정리는 런타임에 넘긴다
    let runtime = tokio::runtime::Handle::current();
    let weak_state: Weak<SignalingState> = Arc::downgrade(state);
    transport
        .on_dtls_state_change(move |dtls_state| {
            if !matches!(dtls_state, DtlsState::Closed | DtlsState::Failed) {
                return;
            }
            tracing::info!(transport_id = %transport_id, dtls_state = ?dtls_state, "DTLS ended, closing transport");
            let weak_state = weak_state.clone();
            let transport_id = transport_id.clone();
            runtime.spawn(async move {
                if let Some(state) = weak_state.upgrade() {
                    close_transport(&state, &transport_id);
                }
            });
        })
        .detach();

    Ok(transport)
}

/// 트랜스포트를 레지스트리와 피어에 등록
pub fn add_transport(
    state: &SignalingState,
    transport: WebRtcTransport,
    room_name: &str,
    consumer: bool,
    peer_id: &str,
) {
    let transport_id = transport.id().to_string();

    if let Some(mut peer) = state.peers.get_mut(peer_id) {
        peer.transports.push(transport_id.clone());
    }
    state.transports.insert(
        transport_id,
        TransportEntry {
            transport,
            room: room_name.to_string(),
            peer_id: peer_id.to_string(),
            consumer,
        },
    );
}

fn find_transport(state: &SignalingState, peer_id: &str, consumer: bool) -> Option<WebRtcTransport> {
    let transport_ids = state.peers.get(peer_id)?.transports.clone();
    transport_ids.iter().find_map(|transport_id| {
        let entry = state.transports.get(transport_id)?;
        (entry.consumer == consumer && !entry.transport.closed()).then(|| entry.transport.clone())
    })
}

/// 피어의 송신 트랜스포트. 없으면 None.
pub fn get_transport(state: &SignalingState, peer_id: &str) -> Option<WebRtcTransport> {
    find_transport(state, peer_id, false)
}

/// 피어의 수신 트랜스포트. 없으면 None.
pub fn get_recv_transport(state: &SignalingState, peer_id: &str) -> Option<WebRtcTransport> {
    find_transport(state, peer_id, true)
}

/// 트랜스포트와 그 위의 프로듀서/컨슈머를 레지스트리에서 지운다.
/// 마지막 핸들이 drop 되면서 워커 쪽 객체도 닫힌다.
pub fn close_transport(state: &SignalingState, transport_id: &str) {
    let Some((_, entry)) = state.transports.remove(transport_id) else {
        return;
    };
    if let Some(mut peer) = state.peers.get_mut(&entry.peer_id) {
        peer.transports.retain(|t| t != transport_id);
    }

    let producer_ids: Vec<String> = state
        .producers
        .iter()
        .filter(|e| e.transport_id == transport_id)
        .map(|e| e.key().clone())
        .collect();
    for producer_id in &producer_ids {
        close_producer(state, producer_id);
    }

    let consumers: Vec<(String, String)> = state
        .consumers
        .iter()
        .filter(|e| e.transport_id == transport_id)
        .map(|e| (e.key().clone(), e.peer_id.clone()))
        .collect();
    for (consumer_id, owner) in &consumers {
        state.consumers.remove(consumer_id);
        if let Some(mut peer) = state.peers.get_mut(owner) {
            peer.consumers.retain(|c| c != consumer_id);
        }
    }

    tracing::info!(
        transport_id = %transport_id,
        peer_id = %entry.peer_id,
        producers = producer_ids.len(),
        consumers = consumers.len(),
        "Transport released"
    );
}

/// create-transports 처리
pub async fn handle_create_transports(
    state: Arc<SignalingState>,
    peer_id: &str,
    sender: bool,
) -> Result<(), SfuError> {
    let (room_name, router) = joined_router(&state, peer_id)?;

    let transport = create_transport(&state, &router, transport_options(&state.config.rtc)).await?;

    // 기다리는 동안 방을 떠났으면 버린다
    if state.peer_room(peer_id).as_deref() != Some(room_name.as_str()) {
        return Err(SfuError::NotInRoom);
    }

    let params = TransportParams {
        id: transport.id().to_string(),
        ice_parameters: transport.ice_parameters().clone(),
        ice_candidates: transport.ice_candidates().clone(),
        dtls_parameters: transport.dtls_parameters().clone(),
        ice_servers: ice_servers(&state.config.turn),
    };
    let transport_id = params.id.clone();
    let ports: Vec<u16> = params.ice_candidates.iter().map(|c| c.port).collect();

    add_transport(&state, transport, &room_name, !sender, peer_id);
    send_to_peer(&state, peer_id, ServerMessage::TransportCreated { sender, params });

    tracing::info!(
        peer_id = %peer_id,
        room_name = %room_name,
        transport_id = %transport_id,
        sender = sender,
        ports = ?ports,
        "Transport created"
    );
    Ok(())
}

/// transport-send-connect / transport-recv-connect 처리
pub async fn handle_transport_connect(
    state: Arc<SignalingState>,
    peer_id: &str,
    transport_id: &str,
    dtls_parameters: DtlsParameters,
    consumer: bool,
) -> Result<(), SfuError> {
    let transport = state
        .transports
        .get(transport_id)
        .filter(|e| e.peer_id == peer_id && e.consumer == consumer)
        .map(|e| e.transport.clone())
        .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

    transport
        .connect(WebRtcTransportRemoteParameters { dtls_parameters })
        .await
        .map_err(|e| {
            tracing::warn!(peer_id = %peer_id, transport_id = %transport_id, error = %e, "Transport connect failed");
            SfuError::from(e)
        })?;

    send_to_peer(
        &state,
        peer_id,
        ServerMessage::TransportConnected {
            transport_id: transport_id.to_string(),
        },
    );
    tracing::info!(
        peer_id = %peer_id,
        transport_id = %transport_id,
        consumer = consumer,
        dtls_state = ?transport.dtls_state(),
        "Transport connected"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::{handle_create_consumer, handle_join_room, handle_produce};
    use crate::state::test_support::{
        connect, device_caps, drain, state, state_with, vp8_parameters,
    };
    use serde_json::json;

    fn dtls() -> DtlsParameters {
        serde_json::from_value(json!({
            "role": "client",
            "fingerprints": [{
                "algorithm": "sha-256",
                "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:\
                          AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD"
            }]
        }))
        .unwrap()
    }

    fn created(messages: Vec<ServerMessage>) -> TransportParams {
        messages
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::TransportCreated { params, .. } => Some(params),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn options_follow_rtc_config() {
        let mut rtc = Config::default().rtc;
        rtc.enable_tcp = false;
        rtc.initial_outgoing_bitrate = 600_000;
        let options = transport_options(&rtc);
        assert!(options.enable_udp);
        assert!(!options.enable_tcp);
        assert_eq!(options.initial_available_outgoing_bitrate, 600_000);
    }

    #[tokio::test]
    async fn get_transport_is_none_without_send_transport() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();

        assert!(get_transport(&state, &a).is_none());
        assert!(get_transport(&state, "nobody").is_none());

        handle_create_transports(state.clone(), &a, false).await.unwrap();
        assert!(get_transport(&state, &a).is_none());
        assert!(get_recv_transport(&state, &a).is_some());

        handle_create_transports(state.clone(), &a, true).await.unwrap();
        let sent = get_transport(&state, &a).unwrap();
        let params = drain(&mut rx_a)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::TransportCreated { sender: true, params } => Some(params),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(sent.id().to_string(), params.id);
        assert!(!params.ice_candidates.is_empty());
        assert!(params.ice_servers.is_none());
    }

    #[tokio::test]
    async fn create_transports_requires_room() {
        let state = state().await;
        let (a, _rx_a) = connect(&state).await;
        let err = handle_create_transports(state.clone(), &a, true).await.unwrap_err();
        assert_eq!(err.code(), "not_in_room");
    }

    #[tokio::test]
    async fn provisioning_failure_is_reported_and_connection_survives() {
        let mut config = Config::default();
        config.rtc.min_port = 42000;
        config.rtc.max_port = 42000;
        let state = state_with(config).await;
        let (a, mut rx_a) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();

        handle_create_transports(state.clone(), &a, true).await.unwrap();
        let err = handle_create_transports(state.clone(), &a, false).await.unwrap_err();
        assert_eq!(err.code(), "provisioning_failed");

        // 피어는 여전히 방에 남아 있다
        assert_eq!(state.peer_room(&a).as_deref(), Some("room"));
        drain(&mut rx_a);
        crate::handlers::handle_heartbeat(&state, &a);
        assert!(matches!(drain(&mut rx_a).as_slice(), [ServerMessage::HeartbeatAck]));
    }

    #[tokio::test]
    async fn connect_checks_direction_and_ownership() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_join_room(state.clone(), &b, "room").await.unwrap();

        handle_create_transports(state.clone(), &a, true).await.unwrap();
        let params = created(drain(&mut rx_a));

        // 수신용으로 연결 시도
        let err = handle_transport_connect(state.clone(), &a, &params.id, dtls(), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transport_not_found");
        // 다른 피어
        let err = handle_transport_connect(state.clone(), &b, &params.id, dtls(), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transport_not_found");

        handle_transport_connect(state.clone(), &a, &params.id, dtls(), false)
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::TransportConnected { transport_id }] if transport_id == &params.id
        ));

        // 두 번째 연결은 워커가 거절한다
        let err = handle_transport_connect(state.clone(), &a, &params.id, dtls(), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "provisioning_failed");
    }

    #[tokio::test]
    async fn closing_transport_releases_its_media() {
        let state = state().await;
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_join_room(state.clone(), &b, "room").await.unwrap();

        handle_create_transports(state.clone(), &a, true).await.unwrap();
        let send = created(drain(&mut rx_a));
        handle_produce(
            state.clone(),
            &a,
            &send.id,
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
        drain(&mut rx_b);

        close_transport(&state, &send.id);

        assert!(state.transports.get(&send.id).is_none());
        assert!(state.peers.get(&a).unwrap().transports.is_empty());
        assert!(state.producers.is_empty());
        assert!(state.consumers.is_empty());
        assert!(get_transport(&state, &a).is_none());
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::ConsumerClosed { .. }]
        ));
    }

    #[tokio::test]
    async fn turn_servers_attached_when_configured() {
        let mut config = Config::default();
        config.turn.url = "turn.example.org".into();
        config.turn.secret = "secret".into();
        let state = state_with(config).await;
        let (a, mut rx_a) = connect(&state).await;
        handle_join_room(state.clone(), &a, "room").await.unwrap();
        handle_create_transports(state.clone(), &a, true).await.unwrap();

        let params = created(drain(&mut rx_a));
        assert!(!params.ice_servers.unwrap().is_empty());
    }
}
