use serde::{Deserialize, Serialize};

use crate::bins::MediaKind;

/// Wire-level constants shared with the remote peer. Both sides must agree on
/// every value here, so the defaults are the ones legacy peers use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireProfile {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    // theoraenc kbps
    pub video_bitrate: u32,
    // theoraenc speed-level, 0 = slowest/best
    pub video_speed_level: u32,
    pub video_port: u16,
    pub audio_port: u16,
    /// RTP clock-rate the receiver expects for speex. The sender does not pin
    /// its capture rate, so speexenc runs at whatever the audio source
    /// negotiates and rtpspeexpay advertises that rate. Legacy senders capture
    /// at 44100 Hz; set 8000/16000/32000 here when talking to a peer that
    /// resamples to a native speex mode first.
    pub audio_clock_rate: u32,
}

impl Default for WireProfile {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            framerate: 15,
            video_bitrate: 50,
            video_speed_level: 2,
            video_port: 5004,
            audio_port: 5005,
            audio_clock_rate: 44100,
        }
    }
}

impl WireProfile {
    /// Caps forced on the capture branch, e.g. `video/x-raw,width=320,height=240,framerate=15/1`.
    pub fn capture_caps(&self) -> String {
        format!(
            "video/x-raw,width={},height={},framerate={}/1",
            self.width, self.height, self.framerate
        )
    }

    pub fn port(&self, kind: MediaKind) -> u16 {
        match kind {
            MediaKind::Video => self.video_port,
            MediaKind::Audio => self.audio_port,
        }
    }

    /// Caps the receiving UDP source announces for incoming RTP.
    pub fn rtp_caps(&self, kind: MediaKind) -> String {
        match kind {
            MediaKind::Video => {
                "application/x-rtp,media=video,clock-rate=90000,encoding-name=THEORA".to_string()
            }
            MediaKind::Audio => format!(
                "application/x-rtp,media=audio,clock-rate={},encoding-name=SPEEX",
                self.audio_clock_rate
            ),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.video_port == self.audio_port {
            return Err(anyhow::anyhow!(
                "video and audio share port {}",
                self.video_port
            ));
        }
        if self.video_port == 0 || self.audio_port == 0 {
            return Err(anyhow::anyhow!("media ports must be non-zero"));
        }
        if !(6000..=48000).contains(&self.audio_clock_rate) {
            return Err(anyhow::anyhow!(
                "speex cannot run at {} Hz",
                self.audio_clock_rate
            ));
        }
        if self.width == 0 || self.height == 0 || self.framerate == 0 {
            return Err(anyhow::anyhow!(
                "invalid capture geometry {}x{}@{}",
                self.width,
                self.height,
                self.framerate
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_matches_legacy_wire() {
        let profile = WireProfile::default();
        assert_eq!(
            profile.capture_caps(),
            "video/x-raw,width=320,height=240,framerate=15/1"
        );
        assert_eq!(profile.port(MediaKind::Video), 5004);
        assert_eq!(profile.port(MediaKind::Audio), 5005);
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shared_port() {
        let profile = WireProfile {
            audio_port: 5004,
            ..WireProfile::default()
        };
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_audio_clock_rate_reaches_receive_caps() {
        let profile = WireProfile {
            audio_clock_rate: 16000,
            ..WireProfile::default()
        };
        assert!(profile.validate().is_ok());
        assert_eq!(
            profile.rtp_caps(MediaKind::Audio),
            "application/x-rtp,media=audio,clock-rate=16000,encoding-name=SPEEX"
        );
        assert!(
            WireProfile::default()
                .rtp_caps(MediaKind::Audio)
                .contains("clock-rate=44100")
        );

        let profile = WireProfile {
            audio_clock_rate: 96000,
            ..WireProfile::default()
        };
        assert!(profile.validate().is_err());
    }
}
