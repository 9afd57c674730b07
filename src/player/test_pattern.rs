//! 测试图样媒体后端
//!
//! 地址格式：`testsrc?duration=10&fps=30&sample_rate=44100&channels=2&audio_tracks=1&gop=15&video=1`
//! 另有 `audio_duration` 让音轨比视频短，`width`/`height` 指定画面尺寸。
//!
//! 生成按时间交错的数据包：视频时间基为 1/fps，音频每包 1024 个采样、时间基为
//! 1/sample_rate。编解码器模拟关键帧依赖：flush 之后直到下一个关键帧之前的包不产生输出。

use crate::core::{AudioFormat, MediaKind, PlayerError, Result, SampleKind, StreamInfo};
use crate::player::source::{Codec, MediaOpener, MediaSource, Packet, RawFrame, Received};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, info};
use std::collections::VecDeque;
use std::str::FromStr;

const SCHEME: &str = "testsrc";
const AUDIO_PACKET_SAMPLES: i64 = 1024;
const TONE_HZ: f64 = 440.0;
const TONE_LEVEL: f64 = 0.25;
const LANGUAGES: [&str; 3] = ["chi", "eng", "jpn"];

/// 测试图样参数
#[derive(Debug, Clone, PartialEq)]
pub struct PatternParams {
    pub duration: f64,
    /// 音轨时长，缺省与 `duration` 相同
    pub audio_duration: Option<f64>,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_tracks: usize,
    pub gop: u32,
    pub video: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self {
            duration: 10.0,
            audio_duration: None,
            fps: 30,
            sample_rate: 44100,
            channels: 2,
            audio_tracks: 1,
            gop: 15,
            video: true,
            width: 64,
            height: 36,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PlayerError::OpenError(format!("参数 {} 的值无效: {}", key, value)))
}

impl PatternParams {
    /// 解析 `testsrc?...` 地址
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix(SCHEME)
            .ok_or_else(|| PlayerError::OpenError(format!("不是测试图样地址: {}", path)))?;
        let query = if rest.is_empty() {
            rest
        } else {
            rest.strip_prefix('?')
                .ok_or_else(|| PlayerError::OpenError(format!("不是测试图样地址: {}", path)))?
        };

        let mut params = Self::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PlayerError::OpenError(format!("参数格式错误: {}", pair)))?;
            match key {
                "duration" => params.duration = parse_value(key, value)?,
                "audio_duration" => params.audio_duration = Some(parse_value(key, value)?),
                "fps" => params.fps = parse_value(key, value)?,
                "sample_rate" => params.sample_rate = parse_value(key, value)?,
                "channels" => params.channels = parse_value(key, value)?,
                "audio_tracks" => params.audio_tracks = parse_value(key, value)?,
                "gop" => params.gop = parse_value(key, value)?,
                "video" => params.video = parse_value::<u8>(key, value)? != 0,
                "width" => params.width = parse_value(key, value)?,
                "height" => params.height = parse_value(key, value)?,
                _ => return Err(PlayerError::OpenError(format!("未知参数: {}", key))),
            }
        }

        if !(params.duration.is_finite() && params.duration > 0.0) {
            return Err(PlayerError::OpenError(format!("时长无效: {}", params.duration)));
        }
        if let Some(secs) = params.audio_duration {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(PlayerError::OpenError(format!("音轨时长无效: {}", secs)));
            }
        }
        if params.fps == 0 || params.sample_rate == 0 || params.channels == 0 || params.gop == 0 {
            return Err(PlayerError::OpenError(format!("参数无效: {}", path)));
        }
        if params.width == 0 || params.height == 0 {
            return Err(PlayerError::OpenError(format!("画面尺寸无效: {}", path)));
        }
        Ok(params)
    }

    fn video_frames(&self) -> i64 {
        if self.video {
            (self.duration * self.fps as f64).round() as i64
        } else {
            0
        }
    }

    fn audio_duration(&self) -> f64 {
        self.audio_duration.unwrap_or(self.duration)
    }

    fn audio_samples(&self) -> i64 {
        (self.audio_duration() * self.sample_rate as f64).round() as i64
    }

    fn stream_infos(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if self.video {
            streams.push(StreamInfo {
                index: 0,
                kind: MediaKind::Video,
                time_base: (1, self.fps as i32),
                duration: self.duration,
                frame_rate: Some(self.fps as f64),
                codec_name: "testsrc".to_string(),
                language: None,
                title: None,
                audio_format: None,
                width: self.width,
                height: self.height,
            });
        }
        for track in 0..self.audio_tracks {
            streams.push(StreamInfo {
                index: streams.len(),
                kind: MediaKind::Audio,
                time_base: (1, self.sample_rate as i32),
                duration: self.audio_duration(),
                frame_rate: None,
                codec_name: "pcm_f32le".to_string(),
                language: Some(LANGUAGES[track % LANGUAGES.len()].to_string()),
                title: None,
                audio_format: Some(AudioFormat::new(
                    SampleKind::F32,
                    self.sample_rate,
                    self.channels,
                )),
                width: 0,
                height: 0,
            });
        }
        streams
    }
}

/// 测试图样数据源
pub struct TestPatternSource {
    params: PatternParams,
    streams: Vec<StreamInfo>,
    next_video: i64,
    next_audio: Vec<i64>,
    path: String,
}

impl TestPatternSource {
    pub fn new(path: &str) -> Result<Self> {
        let params = PatternParams::parse(path)?;
        let streams = params.stream_infos();
        if streams.is_empty() {
            return Err(PlayerError::NoStreams);
        }
        Ok(Self {
            next_audio: vec![0; params.audio_tracks],
            params,
            streams,
            next_video: 0,
            path: path.to_string(),
        })
    }

    fn audio_stream_index(&self, track: usize) -> usize {
        track + usize::from(self.params.video)
    }

    fn video_packet(&mut self) -> Packet {
        let index = self.next_video;
        self.next_video += 1;
        let mut data = BytesMut::with_capacity(8);
        data.put_i64_le(index);
        Packet {
            stream_index: 0,
            pts: Some(index),
            dts: Some(index),
            duration: 1,
            key: index % self.params.gop as i64 == 0,
            data: data.freeze(),
        }
    }

    fn audio_packet(&mut self, track: usize) -> Packet {
        let start = self.next_audio[track];
        let count = AUDIO_PACKET_SAMPLES.min(self.params.audio_samples() - start);
        self.next_audio[track] = start + count;
        let mut data = BytesMut::with_capacity(12);
        data.put_i64_le(start);
        data.put_u32_le(count as u32);
        Packet {
            stream_index: self.audio_stream_index(track),
            pts: Some(start),
            dts: Some(start),
            duration: count,
            key: true,
            data: data.freeze(),
        }
    }
}

enum NextPacket {
    Video,
    Audio(usize),
}

impl MediaSource for TestPatternSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut best: Option<(f64, NextPacket)> = None;

        if self.next_video < self.params.video_frames() {
            best = Some((self.next_video as f64 / self.params.fps as f64, NextPacket::Video));
        }
        let total = self.params.audio_samples();
        for (track, next) in self.next_audio.iter().enumerate() {
            if *next >= total {
                continue;
            }
            let secs = *next as f64 / self.params.sample_rate as f64;
            if best.as_ref().map_or(true, |(t, _)| secs < *t) {
                best = Some((secs, NextPacket::Audio(track)));
            }
        }

        Ok(best.map(|(_, next)| match next {
            NextPacket::Video => self.video_packet(),
            NextPacket::Audio(track) => self.audio_packet(track),
        }))
    }

    fn seek(&mut self, secs: f64) -> Result<()> {
        let secs = secs.max(0.0);
        let frames = self.params.video_frames();
        let fps = self.params.fps as f64;

        // 视频回退到目标之前最近的关键帧，音频跟随到同一位置
        let anchor = if frames > 0 {
            let target = ((secs * fps) + 1e-9).floor() as i64;
            let target = target.clamp(0, frames - 1);
            let key = target - target % self.params.gop as i64;
            self.next_video = key;
            key as f64 / fps
        } else {
            secs
        };

        let total = self.params.audio_samples();
        let rate = self.params.sample_rate as f64;
        for next in self.next_audio.iter_mut() {
            let sample = ((anchor * rate) + 1e-9).floor() as i64;
            let sample = sample.clamp(0, total);
            *next = sample - sample % AUDIO_PACKET_SAMPLES;
        }

        debug!("测试图样 seek: {:.3}s -> 关键帧 {:.3}s", secs, anchor);
        Ok(())
    }

    fn open_codec(&self, stream_index: usize, output: &AudioFormat) -> Result<Box<dyn Codec>> {
        let stream = self
            .streams
            .get(stream_index)
            .ok_or(PlayerError::StreamNotFound(stream_index))?;
        let kind = match stream.kind {
            MediaKind::Video => PatternKind::Video {
                width: stream.width,
                height: stream.height,
            },
            MediaKind::Audio => PatternKind::Audio {
                source_rate: self.params.sample_rate,
            },
            MediaKind::Other => return Err(PlayerError::StreamNotFound(stream_index)),
        };
        Ok(Box::new(TestPatternCodec::new(kind, *output)))
    }

    fn description(&self) -> String {
        format!("TestPattern: {}", self.path)
    }
}

enum PatternKind {
    Video { width: u32, height: u32 },
    Audio { source_rate: u32 },
}

/// 测试图样编解码器：视频渲染纯色 RGBA，音频生成正弦波
pub struct TestPatternCodec {
    kind: PatternKind,
    output: AudioFormat,
    pending: VecDeque<RawFrame>,
    draining: bool,
    need_key: bool,
}

impl TestPatternCodec {
    fn new(kind: PatternKind, output: AudioFormat) -> Self {
        Self {
            kind,
            output,
            pending: VecDeque::new(),
            draining: false,
            need_key: true,
        }
    }

    fn decode_video(index: i64, width: u32, height: u32) -> RawFrame {
        let pixel = [(index % 256) as u8, ((index / 256) % 256) as u8, 0x80, 0xff];
        let mut data = vec![0u8; width as usize * height as usize * 4];
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
        RawFrame::Video {
            pts: Some(index),
            width,
            height,
            data,
        }
    }

    fn decode_audio(&self, start: i64, count: i64, source_rate: u32) -> RawFrame {
        let out_rate = self.output.sample_rate as i64;
        let src_rate = source_rate as i64;
        let out_start = (start * out_rate + src_rate / 2) / src_rate;
        let out_end = ((start + count) * out_rate + src_rate / 2) / src_rate;
        let samples = (out_end - out_start).max(0) as usize;

        let channels = self.output.channels as usize;
        let mut data = Vec::with_capacity(samples * self.output.bytes_per_frame());
        for n in 0..samples {
            let t = (out_start + n as i64) as f64 / out_rate as f64;
            let value = (2.0 * std::f64::consts::PI * TONE_HZ * t).sin() * TONE_LEVEL;
            for _ in 0..channels {
                write_sample(&mut data, self.output.sample_kind, value);
            }
        }

        RawFrame::Audio {
            pts: Some(start),
            samples,
            data,
        }
    }
}

fn write_sample(data: &mut Vec<u8>, kind: SampleKind, value: f64) {
    match kind {
        SampleKind::U8 => data.push((value * 127.0 + 128.0).round() as u8),
        SampleKind::I16 => {
            data.extend_from_slice(&((value * i16::MAX as f64) as i16).to_ne_bytes())
        }
        SampleKind::I32 => {
            data.extend_from_slice(&((value * i32::MAX as f64) as i32).to_ne_bytes())
        }
        SampleKind::F32 => data.extend_from_slice(&(value as f32).to_ne_bytes()),
    }
}

impl Codec for TestPatternCodec {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<()> {
        let packet = match packet {
            Some(packet) => packet,
            None => {
                self.draining = true;
                return Ok(());
            }
        };
        if self.draining {
            return Err(PlayerError::DecodeError("输入已结束，需要先 flush".to_string()));
        }
        if self.need_key && !packet.key {
            // 缺少参考帧，丢弃
            return Ok(());
        }
        self.need_key = false;

        let mut payload: Bytes = packet.data.clone();
        let frame = match self.kind {
            PatternKind::Video { width, height } => {
                if payload.remaining() < 8 {
                    return Err(PlayerError::DecodeError("视频包长度不足".to_string()));
                }
                Self::decode_video(payload.get_i64_le(), width, height)
            }
            PatternKind::Audio { source_rate } => {
                if payload.remaining() < 12 {
                    return Err(PlayerError::DecodeError("音频包长度不足".to_string()));
                }
                let start = payload.get_i64_le();
                let count = payload.get_u32_le() as i64;
                self.decode_audio(start, count, source_rate)
            }
        };
        self.pending.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Received> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Received::Frame(frame));
        }
        if self.draining {
            Ok(Received::Eof)
        } else {
            Ok(Received::Again)
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
        self.need_key = true;
    }

    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        self.output = *format;
        Ok(())
    }
}

/// 测试图样打开器
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPatternOpener;

impl MediaOpener for TestPatternOpener {
    fn open(&self, path: &str) -> Result<Box<dyn MediaSource>> {
        let source = TestPatternSource::new(path)?;
        info!("✅ 打开测试图样: {:?}", source.params);
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(path: &str) -> TestPatternSource {
        TestPatternSource::new(path).unwrap()
    }

    #[test]
    fn test_parse_defaults_and_overrides() {
        let params = PatternParams::parse("testsrc").unwrap();
        assert_eq!(params, PatternParams::default());

        let params =
            PatternParams::parse("testsrc?duration=2.5&fps=25&audio_tracks=2&video=0").unwrap();
        assert_eq!(params.duration, 2.5);
        assert_eq!(params.fps, 25);
        assert_eq!(params.audio_tracks, 2);
        assert!(!params.video);

        let params = PatternParams::parse("testsrc?duration=2&audio_duration=0.5").unwrap();
        assert_eq!(params.audio_samples(), 22050);
        assert_eq!(params.video_frames(), 60);
        assert!(PatternParams::parse("testsrc?audio_duration=0").is_err());
    }

    #[test]
    fn test_unknown_path_fails() {
        assert!(matches!(
            TestPatternOpener.open("/tmp/movie.mkv"),
            Err(PlayerError::OpenError(_))
        ));
        assert!(matches!(
            TestPatternOpener.open("testsrc?bogus=1"),
            Err(PlayerError::OpenError(_))
        ));
        assert!(matches!(
            TestPatternOpener.open("testsrc?video=0&audio_tracks=0"),
            Err(PlayerError::NoStreams)
        ));
    }

    #[test]
    fn test_packets_are_interleaved_by_time() {
        let mut source = open("testsrc?duration=1");
        let mut last_secs = f64::NEG_INFINITY;
        let mut video = 0;
        let mut audio = 0;
        while let Some(packet) = source.read_packet().unwrap() {
            let stream = &source.streams()[packet.stream_index];
            let secs = stream.ts_to_secs(packet.pts.unwrap());
            assert!(secs >= last_secs);
            last_secs = secs;
            if stream.is_video() {
                video += 1;
            } else {
                audio += 1;
            }
        }
        assert_eq!(video, 30);
        // 44100 / 1024 向上取整
        assert_eq!(audio, 44);
    }

    #[test]
    fn test_seek_lands_on_previous_key_frame() {
        let mut source = open("testsrc?gop=15");
        source.seek(5.3).unwrap();
        let packet = source.read_packet().unwrap().unwrap();
        assert_eq!(packet.stream_index, 0);
        assert_eq!(packet.pts, Some(150));
        assert!(packet.key);
    }

    #[test]
    fn test_codec_waits_for_key_frame_after_flush() {
        let mut source = open("testsrc?gop=15");
        let mut codec = source.open_codec(0, &AudioFormat::default()).unwrap();
        source.seek(1.0).unwrap();
        let key = source.read_packet().unwrap().unwrap();
        assert_eq!(key.pts, Some(30));

        codec.flush();
        let mut later = key.clone();
        later.pts = Some(31);
        later.key = false;
        codec.send_packet(Some(&later)).unwrap();
        assert!(matches!(codec.receive_frame().unwrap(), Received::Again));

        codec.send_packet(Some(&key)).unwrap();
        assert!(matches!(
            codec.receive_frame().unwrap(),
            Received::Frame(RawFrame::Video { pts: Some(30), .. })
        ));
        codec.send_packet(None).unwrap();
        assert!(matches!(codec.receive_frame().unwrap(), Received::Eof));
    }

    #[test]
    fn test_audio_rendered_in_output_format() {
        let mut source = open("testsrc?video=0");
        let output = AudioFormat::new(SampleKind::I16, 48000, 2);
        let mut codec = source.open_codec(0, &output).unwrap();
        let packet = source.read_packet().unwrap().unwrap();
        codec.send_packet(Some(&packet)).unwrap();
        match codec.receive_frame().unwrap() {
            Received::Frame(RawFrame::Audio { samples, data, .. }) => {
                assert_eq!(samples, 1115);
                assert_eq!(data.len(), samples * output.bytes_per_frame());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
