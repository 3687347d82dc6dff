//! 환경 변수 기반 설정 관리

use std::env;
use std::net::IpAddr;
use std::str::FromStr;

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub room: RoomConfig,
    pub peer: PeerConfig,
    pub rtc: RtcConfig,
    pub worker: WorkerConfig,
    pub turn: TurnConfig,
    pub log_level: String,
}

/// 방 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// 0 이면 제한 없음
    pub max_size: usize,
}

/// 피어 유휴 정리 설정
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
}

/// WebRTC 트랜스포트 설정
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub min_port: u16,
    pub max_port: u16,
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_outgoing_bitrate: u32,
}

/// 미디어 워커 설정
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 워커가 죽은 뒤 프로세스 종료까지의 유예 시간
    pub death_grace_ms: u64,
}

/// TURN 서버 설정
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub url: String,
    pub secret: String,
    pub enable_tls: bool,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub ports: TurnPorts,
    pub credential_ttl: u64,
}

/// TURN 포트 설정
#[derive(Debug, Clone)]
pub struct TurnPorts {
    pub udp: u16,
    pub tcp: u16,
    pub tls: u16,
}

impl TurnConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.secret.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3016,
            host: "0.0.0.0".to_string(),
            room: RoomConfig { max_size: 16 },
            peer: PeerConfig {
                idle_timeout_ms: 60_000,
                reap_interval_ms: 15_000,
            },
            rtc: RtcConfig {
                min_port: 40000,
                max_port: 49999,
                listen_ip: IpAddr::from([0, 0, 0, 0]),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_outgoing_bitrate: 1_000_000,
            },
            worker: WorkerConfig {
                death_grace_ms: 2000,
            },
            turn: TurnConfig {
                url: String::new(),
                secret: String::new(),
                enable_tls: false,
                enable_udp: true,
                enable_tcp: true,
                ports: TurnPorts {
                    udp: 3478,
                    tcp: 3478,
                    tls: 443,
                },
                credential_ttl: 3600,
            },
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Self {
            port: parse_or("PORT", defaults.port),
            host: env::var("HOST").unwrap_or(defaults.host),
            room: RoomConfig {
                max_size: parse_or("MAX_ROOM_SIZE", defaults.room.max_size),
            },
            peer: PeerConfig {
                idle_timeout_ms: parse_or("PEER_IDLE_TIMEOUT", defaults.peer.idle_timeout_ms),
                reap_interval_ms: parse_or("PEER_REAP_INTERVAL", defaults.peer.reap_interval_ms),
            },
            rtc: RtcConfig {
                min_port: parse_or("RTC_MIN_PORT", defaults.rtc.min_port),
                max_port: parse_or("RTC_MAX_PORT", defaults.rtc.max_port),
                listen_ip: parse_or("RTC_LISTEN_IP", defaults.rtc.listen_ip),
                announced_ip: env::var("RTC_ANNOUNCED_IP")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                enable_udp: flag_or("RTC_ENABLE_UDP", defaults.rtc.enable_udp),
                enable_tcp: flag_or("RTC_ENABLE_TCP", defaults.rtc.enable_tcp),
                prefer_udp: flag_or("RTC_PREFER_UDP", defaults.rtc.prefer_udp),
                initial_outgoing_bitrate: parse_or(
                    "RTC_INITIAL_OUTGOING_BITRATE",
                    defaults.rtc.initial_outgoing_bitrate,
                ),
            },
            worker: WorkerConfig {
                death_grace_ms: parse_or("WORKER_DEATH_GRACE_MS", defaults.worker.death_grace_ms),
            },
            turn: TurnConfig {
                url: env::var("TURN_SERVER_URL").unwrap_or_default(),
                secret: env::var("TURN_SECRET").unwrap_or_default(),
                enable_tls: flag_or("TURN_ENABLE_TLS", defaults.turn.enable_tls),
                enable_udp: flag_or("TURN_ENABLE_UDP", defaults.turn.enable_udp),
                enable_tcp: flag_or("TURN_ENABLE_TCP", defaults.turn.enable_tcp),
                ports: TurnPorts {
                    udp: parse_or("TURN_PORT_UDP", defaults.turn.ports.udp),
                    tcp: parse_or("TURN_PORT_TCP", defaults.turn.ports.tcp),
                    tls: parse_or("TURN_PORT_TLS", defaults.turn.ports.tls),
                },
                credential_ttl: parse_or("TURN_CREDENTIAL_TTL", defaults.turn.credential_ttl),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

/// 값이 없거나 파싱에 실패하면 기본값 사용
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) if default => v != "false",
        Ok(v) => v == "true",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_numbers_fall_back_to_default() {
        env::set_var("SFU_TEST_BAD_PORT", "not-a-port");
        assert_eq!(parse_or("SFU_TEST_BAD_PORT", 4000u16), 4000);

        env::set_var("SFU_TEST_GOOD_PORT", " 4100 ");
        assert_eq!(parse_or("SFU_TEST_GOOD_PORT", 4000u16), 4100);
    }

    #[test]
    fn flags_only_flip_on_explicit_opposite() {
        env::set_var("SFU_TEST_FLAG_ON", "yes");
        // 기본값이 true 인 플래그는 "false" 일 때만 꺼진다
        assert!(flag_or("SFU_TEST_FLAG_ON", true));
        // 기본값이 false 인 플래그는 "true" 일 때만 켜진다
        assert!(!flag_or("SFU_TEST_FLAG_ON", false));
        assert!(!flag_or("SFU_TEST_FLAG_MISSING", false));
    }

    #[test]
    fn turn_needs_url_and_secret() {
        let mut config = Config::default();
        assert!(!config.turn.is_configured());
        config.turn.url = "turn.example.org".to_string();
        assert!(!config.turn.is_configured());
        config.turn.secret = "s3cret".to_string();
        assert!(config.turn.is_configured());
    }
}
