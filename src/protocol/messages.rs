//! 클라이언트-서버 메시지 프로토콜 정의
//!
//! 모든 프레임은 `{ "type": "<event>", "payload": { ... } }` 형태이다.
//! 이벤트 이름은 kebab-case, 페이로드 필드는 camelCase.

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// payload 를 생략할 수 있는 이벤트
const OPTIONAL_PAYLOAD_EVENTS: &[&str] = &["consumer-resume"];

/// 클라이언트 → 서버 메시지
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    // Connection
    Heartbeat,

    // Room Management
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_name: String },
    LeaveRoom,

    // Media Signaling
    RouterRtpCapabilities,
    CreateTransports { sender: bool },
    #[serde(rename_all = "camelCase")]
    TransportSendConnect {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    TransportRecvConnect {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    TransportProduce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    CreateConsumer {
        #[serde(default)]
        transport_id: Option<String>,
        #[serde(default)]
        producer_id: Option<String>,
        device_rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResume {
        #[serde(default)]
        consumer_id: Option<String>,
    },
    StopCamera,
    StopSound,
}

impl ClientMessage {
    /// 텍스트 프레임 파싱. payload 를 생략할 수 있는 이벤트는 빈 payload 로 채운다.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let mut frame: serde_json::Value = serde_json::from_str(text)?;
        if let Some(fields) = frame.as_object_mut() {
            let optional = fields
                .get("type")
                .and_then(|t| t.as_str())
                .map_or(false, |t| OPTIONAL_PAYLOAD_EVENTS.contains(&t));
            if optional && fields.get("payload").map_or(true, |p| p.is_null()) {
                fields.insert("payload".to_string(), serde_json::json!({}));
            }
        }
        serde_json::from_value(frame)
    }
}

/// 서버 → 클라이언트 메시지
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    // Connection
    #[serde(rename_all = "camelCase")]
    Connected { peer_id: String },
    HeartbeatAck,
    Error { code: String, message: String },

    // Room Events
    #[serde(rename_all = "camelCase")]
    JoinedRoom {
        room_name: String,
        peer_id: String,
        peers: Vec<String>,
        rtp_capabilities: RtpCapabilitiesFinalized,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String, room_name: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    ProducerList { producers: Vec<ProducerInfo> },

    // Media Signaling
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: RtpCapabilitiesFinalized },
    TransportCreated { sender: bool, params: TransportParams },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    Produced { id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },
    ConsumerCreated { params: ConsumerParamsByKind },
    #[serde(rename_all = "camelCase")]
    CannotConsume { producer_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: String,
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StopCamera { peer_id: String },
    #[serde(rename_all = "camelCase")]
    StopSound { peer_id: String },
}

impl ServerMessage {
    pub fn error(err: &crate::error::SfuError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// 로그와 사유 문자열용 종류 이름
pub fn kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

/// 트랜스포트 생성 응답 파라미터
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServer>>,
}

/// 컨슈머 생성 응답 파라미터
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerParamsByKind {
    pub video: Vec<ConsumerParams>,
    pub audio: Vec<ConsumerParams>,
}

impl ConsumerParamsByKind {
    pub fn push(&mut self, params: ConsumerParams) {
        match params.kind {
            MediaKind::Video => self.video.push(params),
            MediaKind::Audio => self.audio.push(params),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

/// 방에 이미 존재하는 프로듀서 정보
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
}

/// ICE 서버 설정
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
}
