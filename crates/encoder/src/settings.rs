use serde::{Deserialize, Serialize};

/// Video codec requested from the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Codec name as CloudConvert's convert task expects it
    pub fn cloudconvert_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "x264",
            VideoCodec::H265 => "x265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }

    /// Value for Cloudinary's `vc_` transformation parameter
    pub fn cloudinary_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
        }
    }
}

/// Audio codec requested from the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    /// Keep the source audio stream as-is
    Copy,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Copy => "copy",
        }
    }
}

/// Quality tier. Cloudinary maps it onto `q_auto:<tier>`; CloudConvert onto a CRF
/// when no explicit CRF is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Eco,
    Good,
    Best,
}

impl QualityTier {
    pub fn cloudinary_name(&self) -> &'static str {
        match self {
            QualityTier::Low => "auto:low",
            QualityTier::Eco => "auto:eco",
            QualityTier::Good => "auto:good",
            QualityTier::Best => "auto:best",
        }
    }

    pub fn default_crf(&self) -> u8 {
        match self {
            QualityTier::Low => 30,
            QualityTier::Eco => 27,
            QualityTier::Good => 23,
            QualityTier::Best => 19,
        }
    }
}

/// Named presets for the transcode settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionProfile {
    /// 720p, 600k, 30 fps
    #[default]
    Standard,
    /// 480p, 300k, 24 fps
    Extreme,
}

/// Settings sent along with each transcode request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSettings {
    /// Output container/extension, e.g. "mp4"
    pub output_format: String,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub quality: QualityTier,
    /// Target video bitrate, e.g. "600k"
    pub bitrate: Option<String>,
    /// Constant rate factor; overrides the tier's default CRF
    pub crf: Option<u8>,
    /// Encoder speed preset (CloudConvert only)
    pub preset: Option<String>,
    pub fps: Option<u32>,
    /// Resolution cap; the source is never upscaled
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// Cloudinary `f_` value; `None` keeps `output_format`
    pub delivery_format: Option<String>,
}

impl TranscodeSettings {
    pub fn for_profile(profile: CompressionProfile) -> Self {
        match profile {
            CompressionProfile::Standard => Self {
                output_format: "mp4".to_string(),
                video_codec: VideoCodec::H265,
                audio_codec: AudioCodec::Aac,
                quality: QualityTier::Good,
                bitrate: Some("600k".to_string()),
                crf: None,
                preset: Some("medium".to_string()),
                fps: Some(30),
                max_width: Some(1280),
                max_height: Some(720),
                delivery_format: None,
            },
            CompressionProfile::Extreme => Self {
                output_format: "mp4".to_string(),
                video_codec: VideoCodec::H265,
                audio_codec: AudioCodec::Aac,
                quality: QualityTier::Low,
                bitrate: Some("300k".to_string()),
                crf: None,
                preset: Some("medium".to_string()),
                fps: Some(24),
                max_width: Some(854),
                max_height: Some(480),
                delivery_format: None,
            },
        }
    }

    /// CRF to request, falling back to the quality tier's default
    pub fn effective_crf(&self) -> u8 {
        self.crf.unwrap_or_else(|| self.quality.default_crf())
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self::for_profile(CompressionProfile::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extreme_profile_is_smaller_than_standard() {
        let standard = TranscodeSettings::for_profile(CompressionProfile::Standard);
        let extreme = TranscodeSettings::for_profile(CompressionProfile::Extreme);
        assert!(extreme.max_height < standard.max_height);
        assert!(extreme.fps < standard.fps);
        assert_eq!(extreme.quality, QualityTier::Low);
    }

    #[test]
    fn explicit_crf_wins_over_tier() {
        let mut settings = TranscodeSettings::default();
        assert_eq!(settings.effective_crf(), 23);
        settings.crf = Some(18);
        assert_eq!(settings.effective_crf(), 18);
    }

    #[test]
    fn settings_deserialize_from_lowercase_names() {
        let settings: TranscodeSettings = serde_json::from_str(
            r#"{
                "output_format": "mp4",
                "video_codec": "h264",
                "audio_codec": "opus",
                "quality": "best",
                "bitrate": null,
                "crf": 20,
                "preset": "slow",
                "fps": null,
                "max_width": 1920,
                "max_height": 1080,
                "delivery_format": null
            }"#,
        )
        .unwrap();
        assert_eq!(settings.video_codec, VideoCodec::H264);
        assert_eq!(settings.audio_codec, AudioCodec::Opus);
        assert_eq!(settings.video_codec.cloudconvert_name(), "x264");
        assert_eq!(settings.quality.cloudinary_name(), "auto:best");
    }
}
