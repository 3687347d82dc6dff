//! 라우터에 광고하는 고정 코덱 목록

use mediasoup::prelude::*;
use std::num::{NonZeroU32, NonZeroU8};

const AUDIO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(48_000) {
    Some(rate) => rate,
    None => unreachable!(),
};

const VIDEO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90_000) {
    Some(rate) => rate,
    None => unreachable!(),
};

const STEREO: NonZeroU8 = match NonZeroU8::new(2) {
    Some(channels) => channels,
    None => unreachable!(),
};

/// 모든 라우터가 사용하는 오디오/비디오 코덱.
/// 페이로드 타입은 라우터가 할당한다.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: AUDIO_CLOCK_RATE,
            channels: STEREO,
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_rtcp_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([("profile-id", 2_u32.into())]),
            rtcp_feedback: video_rtcp_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
                ("level-asymmetry-allowed", 1_u32.into()),
            ]),
            rtcp_feedback: video_rtcp_feedback(),
        },
    ]
}

fn video_rtcp_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::Nack,
        RtcpFeedback::NackPli,
        RtcpFeedback::CcmFir,
        RtcpFeedback::GoogRemb,
        RtcpFeedback::TransportCc,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_covered() {
        let codecs = media_codecs();
        assert!(codecs
            .iter()
            .any(|c| matches!(c, RtpCodecCapability::Audio { mime_type: MimeTypeAudio::Opus, .. })));
        assert!(codecs
            .iter()
            .any(|c| matches!(c, RtpCodecCapability::Video { mime_type: MimeTypeVideo::Vp8, .. })));
    }

    #[test]
    fn payload_types_are_left_to_the_router() {
        assert!(media_codecs().iter().all(|c| match c {
            RtpCodecCapability::Audio { preferred_payload_type, .. }
            | RtpCodecCapability::Video { preferred_payload_type, .. } => {
                preferred_payload_type.is_none()
            }
        }));
    }
}
