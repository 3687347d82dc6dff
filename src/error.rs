//! 시그널링 에러 분류

use mediasoup::worker::RequestError;

#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error("cannot consume producer {producer_id}: {reason}")]
    CapabilityMismatch { producer_id: String, reason: String },
    #[error("media worker unavailable")]
    WorkerUnavailable,
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("peer has not joined a room")]
    NotInRoom,
    #[error("room is full: {0}")]
    RoomFull(String),
    #[error("transport not found: {0}")]
    TransportNotFound(String),
    #[error("producer not found: {0}")]
    ProducerNotFound(String),
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SfuError {
    /// 클라이언트에 전달되는 고정 에러 코드
    pub fn code(&self) -> &'static str {
        match self {
            SfuError::ProvisioningFailed(_) => "provisioning_failed",
            SfuError::CapabilityMismatch { .. } => "capability_mismatch",
            SfuError::WorkerUnavailable => "worker_unavailable",
            SfuError::RoomNotFound(_) => "room_not_found",
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::NotInRoom => "not_in_room",
            SfuError::RoomFull(_) => "room_full",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// 워커 채널이 닫혔으면 워커를 쓸 수 없는 상태
impl From<RequestError> for SfuError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::ChannelClosed => SfuError::WorkerUnavailable,
            other => SfuError::ProvisioningFailed(other.to_string()),
        }
    }
}
