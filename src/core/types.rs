use crate::core::AudioFormat;
use serde::{Deserialize, Serialize};

/// 流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

/// 播放方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// 容器中一条流的描述（由后端在打开文件时探测）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    /// 时间基：pts * num / den = 秒
    pub time_base: (i32, i32),
    /// 流时长（秒）
    pub duration: f64,
    pub frame_rate: Option<f64>,
    pub codec_name: String,
    pub language: Option<String>,
    pub title: Option<String>,
    /// 音频流的原始格式
    pub audio_format: Option<AudioFormat>,
    pub width: u32,
    pub height: u32,
}

impl StreamInfo {
    /// 时间戳（时间基单位）转换为秒
    pub fn ts_to_secs(&self, ts: i64) -> f64 {
        let (num, den) = self.time_base;
        if den == 0 {
            return 0.0;
        }
        ts as f64 * num as f64 / den as f64
    }

    /// 秒转换为时间戳（时间基单位）
    pub fn secs_to_ts(&self, secs: f64) -> i64 {
        let (num, den) = self.time_base;
        if num == 0 {
            return 0;
        }
        (secs * den as f64 / num as f64).round() as i64
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == MediaKind::Audio
    }
}

/// 音轨描述（供 UI 显示和切换）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// 在音轨列表中的序号
    pub track: usize,
    /// 容器中的流索引
    pub stream_index: usize,
    pub codec_name: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackInfo {
    /// 从流列表中收集所有音轨
    pub fn collect(streams: &[StreamInfo]) -> Vec<TrackInfo> {
        streams
            .iter()
            .filter(|s| s.is_audio())
            .enumerate()
            .map(|(track, s)| TrackInfo {
                track,
                stream_index: s.index,
                codec_name: s.codec_name.clone(),
                language: s.language.clone(),
                title: s.title.clone(),
                sample_rate: s.audio_format.map(|f| f.sample_rate).unwrap_or(0),
                channels: s.audio_format.map(|f| f.channels).unwrap_or(0),
            })
            .collect()
    }

    /// 显示名称
    pub fn label(&self) -> String {
        match (&self.title, &self.language) {
            (Some(title), Some(lang)) => format!("{} ({})", title, lang),
            (Some(title), None) => title.clone(),
            (None, Some(lang)) => format!("音轨 {} ({})", self.track + 1, lang),
            (None, None) => format!("音轨 {} [{}]", self.track + 1, self.codec_name),
        }
    }
}

/// 带显示时间戳的帧
pub trait Timed {
    /// 显示时间戳（秒）
    fn pts(&self) -> f64;
}

/// 视频帧数据（RGBA）
///
/// `data` 为 `None` 表示占位帧：没有新画面，保持上一帧，不是错误。
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub pts: f64,           // 显示时间戳（秒）
    pub width: u32,
    pub height: u32,
    pub data: Option<Vec<u8>>,
}

impl VideoFrame {
    pub fn new(pts: f64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            pts,
            width,
            height,
            data: Some(data),
        }
    }

    /// 占位帧（没有视频轨时使用）
    pub fn placeholder() -> Self {
        Self {
            pts: f64::NAN,
            width: 0,
            height: 0,
            data: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_same_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

impl Timed for VideoFrame {
    fn pts(&self) -> f64 {
        self.pts
    }
}

/// 音频帧数据（已转换为输出格式的交错 PCM）
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pts: f64,           // 显示时间戳（秒）
    pub duration: f64,      // 帧时长（秒）
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Timed for AudioFrame {
    fn pts(&self) -> f64 {
        self.pts
    }
}

/// 打开文件的结果（映射到 UI 提示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFileResult {
    Success,
    Failed,
    AlreadyOpen,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: f64,          // 总时长（秒）
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    /// 根据流列表汇总媒体信息（使用第一条视频流和第一条音频流）
    pub fn from_streams(streams: Vec<StreamInfo>) -> Self {
        let video = streams.iter().find(|s| s.is_video());
        let audio = streams.iter().find(|s| s.is_audio());
        let duration = streams.iter().map(|s| s.duration).fold(0.0, f64::max);

        Self {
            duration,
            width: video.map(|s| s.width).unwrap_or(0),
            height: video.map(|s| s.height).unwrap_or(0),
            fps: video.and_then(|s| s.frame_rate).unwrap_or(0.0),
            video_codec: video.map(|s| s.codec_name.clone()).unwrap_or_else(|| "none".to_string()),
            audio_codec: audio.map(|s| s.codec_name.clone()).unwrap_or_else(|| "none".to_string()),
            sample_rate: audio.and_then(|s| s.audio_format).map(|f| f.sample_rate).unwrap_or(0),
            channels: audio.and_then(|s| s.audio_format).map(|f| f.channels).unwrap_or(0),
            streams,
        }
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.is_video())
    }

    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(|s| s.is_audio())
    }
}

/// 播放器状态信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub direction: Direction,
    pub position: f64,          // 当前位置（秒）
    pub duration: f64,          // 总时长（秒）
    pub volume: f64,            // 音量 0.0 - 1.0
    pub speed: f64,
    pub media_info: Option<MediaInfo>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            direction: Direction::Forward,
            position: 0.0,
            duration: 0.0,
            volume: 1.0,
            speed: 1.0,
            media_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleKind;

    fn audio_stream(index: usize, lang: Option<&str>) -> StreamInfo {
        StreamInfo {
            index,
            kind: MediaKind::Audio,
            time_base: (1, 44100),
            duration: 10.0,
            frame_rate: None,
            codec_name: "pcm".to_string(),
            language: lang.map(str::to_string),
            title: None,
            audio_format: Some(AudioFormat::new(SampleKind::I16, 44100, 2)),
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_timestamp_conversion_is_exact_for_frame_rates() {
        let mut stream = audio_stream(0, None);
        stream.time_base = (1, 30);
        assert_eq!(stream.ts_to_secs(150), 5.0);
        assert_eq!(stream.secs_to_ts(5.0), 150);
    }

    #[test]
    fn test_collect_tracks_skips_non_audio() {
        let mut video = audio_stream(0, None);
        video.kind = MediaKind::Video;
        let streams = vec![video, audio_stream(1, Some("jpn")), audio_stream(2, None)];
        let tracks = TrackInfo::collect(&streams);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].stream_index, 1);
        assert_eq!(tracks[1].track, 1);
        assert_eq!(tracks[0].label(), "音轨 1 (jpn)");
    }

    #[test]
    fn test_placeholder_frame() {
        let frame = VideoFrame::placeholder();
        assert!(frame.is_placeholder());
        assert!(!VideoFrame::new(0.0, 2, 2, vec![0; 16]).is_placeholder());
    }
}
