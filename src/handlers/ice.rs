//! TURN 자격증명과 ICE 서버 목록 (RFC 5766 REST 방식 HMAC-SHA1)

use crate::config::TurnConfig;
use crate::protocol::IceServer;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 트랜스포트 응답에 실을 ICE 서버 목록. TURN 이 설정되지 않았으면 None.
pub fn ice_servers(config: &TurnConfig) -> Option<Vec<IceServer>> {
    if !config.is_configured() {
        return None;
    }

    let expiry = unix_now() + config.credential_ttl;
    let random: u64 = rand::random();
    let username = format!("{}:{:x}", expiry, random);
    let credential = generate_hmac_hash(&username, &config.secret)?;

    Some(build_ice_servers(config, &username, &credential))
}

fn generate_hmac_hash(username: &str, secret: &str) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(username.as_bytes());
    Some(BASE64.encode(mac.finalize().into_bytes()))
}

fn build_ice_servers(config: &TurnConfig, username: &str, credential: &str) -> Vec<IceServer> {
    let mut turn_urls = Vec::new();
    if config.enable_udp {
        turn_urls.push(format!("turn:{}:{}", config.url, config.ports.udp));
    }
    if config.enable_tcp {
        turn_urls.push(format!(
            "turn:{}:{}?transport=tcp",
            config.url, config.ports.tcp
        ));
    }
    if config.enable_tls {
        turn_urls.push(format!(
            "turns:{}:{}?transport=tcp",
            config.url, config.ports.tls
        ));
    }

    let mut servers: Vec<IceServer> = turn_urls
        .into_iter()
        .map(|url| IceServer {
            urls: vec![url],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
            credential_type: Some("password".to_string()),
        })
        .collect();

    // STUN 은 인증 불필요
    if config.enable_udp {
        servers.push(IceServer {
            urls: vec![format!("stun:{}:{}", config.url, config.ports.udp)],
            username: None,
            credential: None,
            credential_type: None,
        });
    }

    servers
}
