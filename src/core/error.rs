use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开文件: {0}")]
    OpenError(String),

    #[error("没有可解码的音视频流")]
    NoStreams,

    #[error("找不到流: {0}")]
    StreamNotFound(usize),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("配置解析失败: {0}")]
    ConfigParseError(#[from] serde_json::Error),

    #[error("非法状态: {0}")]
    IllegalState(String),

    #[error("线程已退出: {0}")]
    Disconnected(&'static str),

    #[error("其他错误: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;

/// 调用方违反前置条件：记录错误日志，debug 构建下直接断言失败
#[macro_export]
macro_rules! illegal_state {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("非法状态: {}", message);
        debug_assert!(false, "非法状态: {}", message);
        $crate::core::PlayerError::IllegalState(message)
    }};
}
