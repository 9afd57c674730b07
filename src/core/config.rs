use crate::core::{AudioFormat, PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 播放核心的可调参数
///
/// 所有字段都有默认值，JSON 中只需写需要覆盖的项。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 倒放分段长度（秒）
    pub reverse_interval_secs: f64,
    /// Seek 后首帧允许早于目标的误差（秒）
    pub seek_tolerance_secs: f64,
    /// 视频帧队列软上限（帧）
    pub video_queue_capacity: usize,
    /// 音频帧队列软上限（帧）
    pub audio_queue_capacity: usize,
    /// 开始播放前预先写入的音频帧数
    pub prefill_audio_batch: usize,
    /// 每显示一帧视频补充的音频帧数
    pub audio_batch: usize,
    /// 单个音频帧的最大字节数，环形缓冲区剩余空间低于此值时停止写入
    pub max_audio_frame_bytes: usize,
    /// 没有视频轨时占位帧的节奏（帧/秒）
    pub placeholder_fps: f64,
    /// 阻塞读帧时检查中断标志的间隔（毫秒）
    pub consumer_poll_ms: u64,
    /// 同步睡眠超过该时长时输出警告（秒）
    pub long_sleep_warn_secs: f64,
    /// 音频输出格式
    pub output_format: AudioFormat,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            reverse_interval_secs: 5.0,
            seek_tolerance_secs: 1e-6,
            video_queue_capacity: 16,
            audio_queue_capacity: 64,
            prefill_audio_batch: 5,
            audio_batch: 10,
            max_audio_frame_bytes: 192_000,
            placeholder_fps: 30.0,
            consumer_poll_ms: 20,
            long_sleep_warn_secs: 1.0,
            output_format: AudioFormat::default(),
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文本解析
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// 检查参数范围
    pub fn validate(&self) -> Result<()> {
        if !(self.reverse_interval_secs.is_finite() && self.reverse_interval_secs > 0.0) {
            return Err(PlayerError::ConfigError(format!(
                "reverse_interval_secs 必须为正数: {}",
                self.reverse_interval_secs
            )));
        }
        if !(self.seek_tolerance_secs >= 0.0) {
            return Err(PlayerError::ConfigError(format!(
                "seek_tolerance_secs 不能为负: {}",
                self.seek_tolerance_secs
            )));
        }
        if self.video_queue_capacity == 0 || self.audio_queue_capacity == 0 {
            return Err(PlayerError::ConfigError("帧队列容量不能为 0".to_string()));
        }
        if self.audio_batch == 0 {
            return Err(PlayerError::ConfigError("audio_batch 不能为 0".to_string()));
        }
        if !(self.placeholder_fps > 0.0) {
            return Err(PlayerError::ConfigError(format!(
                "placeholder_fps 必须为正数: {}",
                self.placeholder_fps
            )));
        }
        let format = &self.output_format;
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(PlayerError::ConfigError(format!("无效的输出格式: {:?}", format)));
        }
        Ok(())
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms.max(1))
    }

    /// 音频输出环形缓冲区容量：至少容纳两个最大音频帧
    pub fn ring_buffer_bytes(&self, speed: f64) -> usize {
        self.output_format
            .suggested_ring_buffer(speed)
            .max(2 * self.max_audio_frame_bytes)
    }
}
