//! 애플리케이션 상태 관리
//!
//! 모든 레지스트리는 `SignalingState` 하나에 모여 핸들러에 명시적으로 전달된다.
//! 락 순서: `Room::members` 를 잡은 채로 `rooms` 맵에 접근할 수 있지만,
//! 그 반대(맵 가드를 잡은 채 `members` 잠금)는 금지. 맵에서는 항상 `Arc<Room>` 을 복제해 꺼낸다.

use crate::config::Config;
use crate::protocol::ServerMessage;
use dashmap::DashMap;
use mediasoup::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Notify, OnceCell};

/// 전역 시그널링 상태
pub struct SignalingState {
    /// 방 정보 (room_name -> Room)
    pub rooms: DashMap<String, Arc<Room>>,
    /// 피어 세션 (peer_id -> Peer)
    pub peers: DashMap<String, Peer>,
    /// 트랜스포트 (transport_id -> TransportEntry)
    pub transports: DashMap<String, TransportEntry>,
    /// 프로듀서 (producer_id -> ProducerEntry)
    pub producers: DashMap<String, ProducerEntry>,
    /// 컨슈머 (consumer_id -> ConsumerEntry)
    pub consumers: DashMap<String, ConsumerEntry>,
    /// 워커 실행기. 워커보다 먼저 내려가지 않게 보관한다.
    pub worker_manager: WorkerManager,
    /// 미디어 워커
    pub worker: Worker,
    /// 설정
    pub config: Arc<Config>,
}

impl SignalingState {
    pub fn new(config: Config, worker_manager: WorkerManager, worker: Worker) -> Self {
        Self {
            rooms: DashMap::new(),
            peers: DashMap::new(),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            worker_manager,
            worker,
            config: Arc::new(config),
        }
    }

    /// 맵 가드를 잡지 않도록 `Arc<Room>` 복제본을 반환
    pub fn room(&self, room_name: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_name).map(|room| room.value().clone())
    }

    pub fn peer_room(&self, peer_id: &str) -> Option<String> {
        self.peers.get(peer_id).and_then(|peer| peer.room.clone())
    }
}

/// 방 정보
pub struct Room {
    pub name: String,
    /// 방 하나에 라우터 하나. 동시 첫 입장은 같은 초기화를 기다린다.
    /// 마지막 복제본이 drop 되면 라우터가 닫힌다.
    pub router: OnceCell<Router>,
    members: Mutex<RoomMembers>,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct RoomMembers {
    /// 입장 순서 유지
    pub peers: Vec<String>,
    /// 방 단위 프로듀서 인덱스
    pub producers: HashSet<String>,
    /// 비워져서 정리된 방. 다시 사용하지 않는다.
    pub closed: bool,
}

impl Room {
    pub fn new(name: String) -> Self {
        Self {
            name,
            router: OnceCell::new(),
            members: Mutex::new(RoomMembers::default()),
            created_at: Instant::now(),
        }
    }

    /// await 지점을 넘겨 잡지 말 것
    pub fn members(&self) -> MutexGuard<'_, RoomMembers> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.members().peers.clone()
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.members().producers.iter().cloned().collect()
    }
}

/// 피어 세션 정보
pub struct Peer {
    pub id: String,
    pub sender: UnboundedSender<ServerMessage>,
    pub room: Option<String>,
    pub transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    pub last_seen: Instant,
    pub connected_at: Instant,
    /// 유휴 정리 시 소켓 태스크를 깨운다
    pub shutdown: Arc<Notify>,
}

impl Peer {
    pub fn new(id: String, sender: UnboundedSender<ServerMessage>) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            room: None,
            transports: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            last_seen: now,
            connected_at: now,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// 레지스트리가 mediasoup 객체의 소유자다. 항목이 제거되어 drop 되면 닫힌다.
pub struct TransportEntry {
    pub transport: WebRtcTransport,
    pub room: String,
    pub peer_id: String,
    /// true 면 수신(컨슈머)용
    pub consumer: bool,
}

pub struct ProducerEntry {
    pub producer: Producer,
    pub room: String,
    pub peer_id: String,
    pub transport_id: String,
}

pub struct ConsumerEntry {
    pub consumer: Consumer,
    pub peer_id: String,
    pub producer_id: String,
    pub transport_id: String,
}
