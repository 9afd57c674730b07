use crate::core::{AudioFormat, Result, StreamInfo};
use bytes::Bytes;

/// 压缩数据包（可跨线程传递）
///
/// 时间戳使用所属流的时间基。
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key: bool,
    pub data: Bytes,
}

/// 编解码器输出的原始帧
///
/// 视频已转换为 RGBA，音频已转换为输出格式的交错 PCM。`pts` 使用流时间基。
#[derive(Debug, Clone)]
pub enum RawFrame {
    Video {
        pts: Option<i64>,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    Audio {
        pts: Option<i64>,
        samples: usize,
        data: Vec<u8>,
    },
}

/// `receive_frame` 的结果
#[derive(Debug)]
pub enum Received {
    Frame(RawFrame),
    /// 需要更多输入（EAGAIN）
    Again,
    /// 解码器已完全排空
    Eof,
}

/// 一条流的编解码上下文
pub trait Codec: Send {
    /// 送入数据包；`None` 表示输入结束，之后 `receive_frame` 会排空缓存的帧
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<()>;

    fn receive_frame(&mut self) -> Result<Received>;

    /// 丢弃内部缓存（seek 后调用）
    fn flush(&mut self);

    /// 重建重采样器，视频编解码器忽略
    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()>;
}

/// 容器数据源抽象接口
///
/// 不同的后端（FFmpeg、测试图样等）实现这个接口。
pub trait MediaSource: Send {
    fn streams(&self) -> &[StreamInfo];

    /// 读取下一个数据包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(e): 读取错误
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// 定位到不晚于 `secs` 的关键帧
    fn seek(&mut self, secs: f64) -> Result<()>;

    /// 为指定流创建编解码器，音频输出转换为 `output`
    fn open_codec(&self, stream_index: usize, output: &AudioFormat) -> Result<Box<dyn Codec>>;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 打开媒体源
///
/// Demuxer 为正放和倒放各打开一个独立的数据源。
pub trait MediaOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn MediaSource>>;
}
