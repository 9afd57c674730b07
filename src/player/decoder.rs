use crate::core::{AudioFormat, AudioFrame, Result, StreamInfo, Timed, VideoFrame};
use crate::player::source::{Codec, MediaSource, Packet, RawFrame, Received};
use log::{debug, error, warn};

/// 一次送包之后解码器的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// 已取出所有就绪帧，需要下一个包
    NeedInput,
    /// 解码器已排空
    EndOfStream,
    /// 编解码器出错，按流结束处理
    Failed,
}

/// 单条流的解码器
///
/// 音频和视频共享同一个送包/取帧骨架，只在输出转换上不同。
pub trait TrackDecoder: Send {
    type Frame: Timed + Send;

    fn stream(&self) -> &StreamInfo;

    /// 送入数据包（`None` 表示输入结束）并取出所有就绪帧
    fn decode(&mut self, packet: Option<&Packet>, out: &mut Vec<Self::Frame>) -> DecodeStatus;

    /// 丢弃编解码器内部缓存
    fn flush(&mut self);
}

/// 送包并循环取帧，`convert` 处理每个原始帧
fn pump(
    codec: &mut dyn Codec,
    stream: &StreamInfo,
    packet: Option<&Packet>,
    mut convert: impl FnMut(RawFrame),
) -> DecodeStatus {
    if let Err(e) = codec.send_packet(packet) {
        error!("❌ 流 #{} 送包失败: {}", stream.index, e);
        return DecodeStatus::Failed;
    }

    loop {
        match codec.receive_frame() {
            Ok(Received::Frame(frame)) => convert(frame),
            Ok(Received::Again) => return DecodeStatus::NeedInput,
            Ok(Received::Eof) => return DecodeStatus::EndOfStream,
            Err(e) => {
                error!("❌ 流 #{} 解码错误: {}", stream.index, e);
                return DecodeStatus::Failed;
            }
        }
    }
}

/// 视频解码器：输出 RGBA 帧
pub struct VideoDecoder {
    codec: Box<dyn Codec>,
    stream: StreamInfo,
    frame_duration: f64,
    next_pts: f64,
}

impl VideoDecoder {
    pub fn open(
        source: &dyn MediaSource,
        stream_index: usize,
        output: &AudioFormat,
    ) -> Result<Self> {
        let codec = source.open_codec(stream_index, output)?;
        let stream = source
            .streams()
            .get(stream_index)
            .cloned()
            .ok_or(crate::core::PlayerError::StreamNotFound(stream_index))?;
        let frame_duration = match stream.frame_rate {
            Some(fps) if fps > 0.0 => 1.0 / fps,
            _ => 1.0 / 25.0,
        };
        debug!(
            "视频解码器: 流 #{} {}x{} {}",
            stream.index, stream.width, stream.height, stream.codec_name
        );
        Ok(Self {
            codec,
            stream,
            frame_duration,
            next_pts: 0.0,
        })
    }
}

impl TrackDecoder for VideoDecoder {
    type Frame = VideoFrame;

    fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    fn decode(&mut self, packet: Option<&Packet>, out: &mut Vec<VideoFrame>) -> DecodeStatus {
        let stream = &self.stream;
        let frame_duration = self.frame_duration;
        let next_pts = &mut self.next_pts;
        pump(self.codec.as_mut(), stream, packet, |raw| match raw {
            RawFrame::Video {
                pts,
                width,
                height,
                data,
            } => {
                // 缺少时间戳时按帧率外推
                let pts = pts.map(|ts| stream.ts_to_secs(ts)).unwrap_or(*next_pts);
                *next_pts = pts + frame_duration;
                out.push(VideoFrame::new(pts, width, height, data));
            }
            RawFrame::Audio { .. } => warn!("⚠️ 视频流 #{} 收到音频帧，已忽略", stream.index),
        })
    }

    fn flush(&mut self) {
        self.codec.flush();
    }
}

/// 音频解码器：输出转换为当前输出格式的交错 PCM
pub struct AudioDecoder {
    codec: Box<dyn Codec>,
    stream: StreamInfo,
    output: AudioFormat,
    next_pts: f64,
}

impl AudioDecoder {
    pub fn open(
        source: &dyn MediaSource,
        stream_index: usize,
        output: &AudioFormat,
    ) -> Result<Self> {
        let codec = source.open_codec(stream_index, output)?;
        let stream = source
            .streams()
            .get(stream_index)
            .cloned()
            .ok_or(crate::core::PlayerError::StreamNotFound(stream_index))?;
        debug!(
            "音频解码器: 流 #{} {:?} → {:?}",
            stream.index, stream.audio_format, output
        );
        Ok(Self {
            codec,
            stream,
            output: *output,
            next_pts: 0.0,
        })
    }

    /// 流的原始音频格式
    pub fn input_format(&self) -> Option<AudioFormat> {
        self.stream.audio_format
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// 重建重采样器
    ///
    /// 调用方保证分发器已暂停且队列为空。
    pub fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        self.codec.set_output_format(format)?;
        self.output = *format;
        Ok(())
    }
}

impl TrackDecoder for AudioDecoder {
    type Frame = AudioFrame;

    fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    fn decode(&mut self, packet: Option<&Packet>, out: &mut Vec<AudioFrame>) -> DecodeStatus {
        let stream = &self.stream;
        let output = self.output;
        let next_pts = &mut self.next_pts;
        pump(self.codec.as_mut(), stream, packet, |raw| match raw {
            RawFrame::Audio { pts, samples, data } => {
                let duration = samples as f64 / output.sample_rate.max(1) as f64;
                let pts = pts.map(|ts| stream.ts_to_secs(ts)).unwrap_or(*next_pts);
                *next_pts = pts + duration;
                out.push(AudioFrame { pts, duration, data });
            }
            RawFrame::Video { .. } => warn!("⚠️ 音频流 #{} 收到视频帧，已忽略", stream.index),
        })
    }

    fn flush(&mut self) {
        self.codec.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleKind;
    use crate::player::test_pattern::TestPatternSource;

    #[test]
    fn test_video_decoder_converts_timestamps() {
        let mut source = TestPatternSource::new("testsrc?duration=1").unwrap();
        let mut decoder = VideoDecoder::open(&source, 0, &AudioFormat::default()).unwrap();
        let mut frames = Vec::new();
        while let Some(packet) = source.read_packet().unwrap() {
            if packet.stream_index == 0 {
                assert_eq!(decoder.decode(Some(&packet), &mut frames), DecodeStatus::NeedInput);
            }
        }
        assert_eq!(decoder.decode(None, &mut frames), DecodeStatus::EndOfStream);
        assert_eq!(frames.len(), 30);
        assert_eq!(frames[3].pts, 0.1);
        assert!(frames.iter().all(|f| f.data.as_ref().map(Vec::len) == Some(64 * 36 * 4)));
    }

    #[test]
    fn test_audio_decoder_output_format_change() {
        let mut source = TestPatternSource::new("testsrc?video=0").unwrap();
        let mut decoder = AudioDecoder::open(&source, 0, &AudioFormat::default()).unwrap();
        assert_eq!(decoder.input_format().map(|f| f.sample_kind), Some(SampleKind::F32));

        let mono = AudioFormat::new(SampleKind::F32, 44100, 1);
        decoder.set_output_format(&mono).unwrap();

        let packet = source.read_packet().unwrap().unwrap();
        let mut frames = Vec::new();
        decoder.decode(Some(&packet), &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), 1024 * 4);
        assert!((frames[0].duration - 1024.0 / 44100.0).abs() < 1e-12);
    }

    #[test]
    fn test_send_after_drain_is_stream_failure() {
        let mut source = TestPatternSource::new("testsrc?video=0").unwrap();
        let mut decoder = AudioDecoder::open(&source, 0, &AudioFormat::default()).unwrap();
        let packet = source.read_packet().unwrap().unwrap();
        let mut frames = Vec::new();
        assert_eq!(decoder.decode(None, &mut frames), DecodeStatus::EndOfStream);
        assert_eq!(decoder.decode(Some(&packet), &mut frames), DecodeStatus::Failed);
        decoder.flush();
        assert_eq!(decoder.decode(Some(&packet), &mut frames), DecodeStatus::NeedInput);
        assert_eq!(frames.len(), 1);
    }
}
