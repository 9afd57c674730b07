//! FFmpeg 容器 / 编解码后端

use crate::core::{AudioFormat, MediaKind, PlayerError, Result, SampleKind, StreamInfo};
use crate::player::source::{Codec, MediaOpener, MediaSource, Packet, RawFrame, Received};
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};

/// FFmpeg 时间基（微秒）
const AV_TIME_BASE: f64 = 1_000_000.0;

fn sample_kind(sample: util::format::Sample) -> SampleKind {
    match sample {
        util::format::Sample::U8(_) => SampleKind::U8,
        util::format::Sample::I16(_) => SampleKind::I16,
        util::format::Sample::I32(_) => SampleKind::I32,
        _ => SampleKind::F32,
    }
}

fn packed_sample(kind: SampleKind) -> util::format::Sample {
    use util::format::sample::Type::Packed;
    match kind {
        SampleKind::U8 => util::format::Sample::U8(Packed),
        SampleKind::I16 => util::format::Sample::I16(Packed),
        SampleKind::I32 => util::format::Sample::I32(Packed),
        SampleKind::F32 => util::format::Sample::F32(Packed),
    }
}

/// 使用 FFmpeg 打开本地文件
pub struct FfmpegOpener;

impl FfmpegOpener {
    pub fn new() -> Result<Self> {
        ffmpeg::init()?;
        Ok(Self)
    }
}

impl MediaOpener for FfmpegOpener {
    fn open(&self, path: &str) -> Result<Box<dyn MediaSource>> {
        Ok(Box::new(FfmpegSource::open(path)?))
    }
}

pub struct FfmpegSource {
    input: format::context::Input,
    streams: Vec<StreamInfo>,
    path: String,
}

impl FfmpegSource {
    pub fn open(path: &str) -> Result<Self> {
        info!("正在打开文件: {}", path);
        let input = format::input(&path)
            .map_err(|e| PlayerError::OpenError(format!("无法打开文件 {}: {}", path, e)))?;

        let container_duration = if input.duration() > 0 {
            input.duration() as f64 / AV_TIME_BASE
        } else {
            0.0
        };
        let streams = input
            .streams()
            .map(|stream| Self::describe(&stream, container_duration))
            .collect::<Result<Vec<_>>>()?;

        if !streams.iter().any(|s| s.is_video() || s.is_audio()) {
            return Err(PlayerError::NoStreams);
        }
        for stream in &streams {
            debug!(
                "流 #{}: {:?} {}，时间基 {}/{}",
                stream.index, stream.kind, stream.codec_name, stream.time_base.0, stream.time_base.1
            );
        }

        Ok(Self {
            input,
            streams,
            path: path.to_string(),
        })
    }

    fn describe(stream: &format::stream::Stream, container_duration: f64) -> Result<StreamInfo> {
        let parameters = stream.parameters();
        let kind = match parameters.medium() {
            media::Type::Video => MediaKind::Video,
            media::Type::Audio => MediaKind::Audio,
            _ => MediaKind::Other,
        };
        let tb = stream.time_base();
        let time_base = (tb.numerator(), tb.denominator());
        let mut info = StreamInfo {
            index: stream.index(),
            kind,
            time_base,
            duration: container_duration,
            frame_rate: None,
            codec_name: parameters.id().name().to_string(),
            language: stream.metadata().get("language").map(str::to_string),
            title: stream.metadata().get("title").map(str::to_string),
            audio_format: None,
            width: 0,
            height: 0,
        };
        if stream.duration() > 0 {
            info.duration = info.ts_to_secs(stream.duration());
        }

        match kind {
            MediaKind::Video => {
                let rate = stream.avg_frame_rate();
                if rate.numerator() > 0 && rate.denominator() > 0 {
                    info.frame_rate = Some(rate.numerator() as f64 / rate.denominator() as f64);
                }
                let decoder = codec::context::Context::from_parameters(parameters)?
                    .decoder()
                    .video()?;
                info.width = decoder.width();
                info.height = decoder.height();
            }
            MediaKind::Audio => {
                let decoder = codec::context::Context::from_parameters(parameters)?
                    .decoder()
                    .audio()?;
                info.audio_format = Some(AudioFormat::new(
                    sample_kind(decoder.format()),
                    decoder.rate(),
                    decoder.channels(),
                ));
            }
            MediaKind::Other => {}
        }
        Ok(info)
    }
}

impl MediaSource for FfmpegSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        match self.input.packets().next() {
            Some((stream, packet)) => Ok(Some(Packet {
                stream_index: stream.index(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                key: packet.is_key(),
                data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
            })),
            None => Ok(None),
        }
    }

    fn seek(&mut self, secs: f64) -> Result<()> {
        let timestamp = (secs.max(0.0) * AV_TIME_BASE) as i64;
        self.input.seek(timestamp, ..timestamp)?;
        Ok(())
    }

    fn open_codec(&self, stream_index: usize, output: &AudioFormat) -> Result<Box<dyn Codec>> {
        let info = self
            .streams
            .get(stream_index)
            .ok_or(PlayerError::StreamNotFound(stream_index))?;
        let stream = self
            .input
            .stream(stream_index)
            .ok_or(PlayerError::StreamNotFound(stream_index))?;
        let context = codec::context::Context::from_parameters(stream.parameters())?;

        let state = match info.kind {
            MediaKind::Video => CodecState::Video {
                decoder: context.decoder().video()?,
                scaler: None,
            },
            MediaKind::Audio => CodecState::Audio {
                decoder: context.decoder().audio()?,
                resampler: None,
                output: *output,
            },
            MediaKind::Other => {
                return Err(PlayerError::DecodeError(format!(
                    "流 #{} 不是音视频流",
                    stream_index
                )))
            }
        };
        debug!("创建解码器: 流 #{} {}", stream_index, info.codec_name);
        Ok(Box::new(FfmpegCodec { state }))
    }

    fn description(&self) -> String {
        format!("FFmpeg: {}", self.path)
    }
}

enum CodecState {
    Video {
        decoder: codec::decoder::Video,
        scaler: Option<software::scaling::Context>,
    },
    Audio {
        decoder: codec::decoder::Audio,
        resampler: Option<software::resampling::Context>,
        output: AudioFormat,
    },
}

pub struct FfmpegCodec {
    state: CodecState,
}

// 缩放 / 重采样上下文不是 Send；编解码器只在 Demuxer 协调锁内被访问
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
    fn decoder(&mut self) -> &mut codec::decoder::Opened {
        match &mut self.state {
            CodecState::Video { decoder, .. } => &mut **decoder,
            CodecState::Audio { decoder, .. } => &mut **decoder,
        }
    }

    /// 转换帧格式为 RGBA
    fn convert_video(
        scaler: &mut Option<software::scaling::Context>,
        frame: &util::frame::Video,
    ) -> Result<RawFrame> {
        let width = frame.width();
        let height = frame.height();

        let rebuild = scaler.as_ref().map_or(true, |s| {
            s.input().width != width
                || s.input().height != height
                || s.input().format != frame.format()
        });
        if rebuild {
            *scaler = Some(software::scaling::Context::get(
                frame.format(),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
        }

        let mut rgba = util::frame::Video::empty();
        if let Some(scaler) = scaler.as_mut() {
            scaler.run(frame, &mut rgba)?;
        }

        // 去掉行对齐填充，复制到连续内存
        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data(0);
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            data.extend_from_slice(&plane[y * stride..y * stride + row]);
        }

        Ok(RawFrame::Video {
            pts: frame.timestamp().or(frame.pts()),
            width,
            height,
            data,
        })
    }

    /// 重采样为输出格式的交错 PCM
    fn convert_audio(
        resampler: &mut Option<software::resampling::Context>,
        output: &AudioFormat,
        frame: &util::frame::Audio,
    ) -> Result<RawFrame> {
        if resampler.is_none() {
            let source_layout = if frame.channel_layout().is_empty() {
                util::channel_layout::ChannelLayout::default(frame.channels() as i32)
            } else {
                frame.channel_layout()
            };
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                frame.rate(),
                frame.channels(),
                output.sample_rate,
                output.channels
            );
            *resampler = Some(software::resampling::Context::get(
                frame.format(),
                source_layout,
                frame.rate(),
                packed_sample(output.sample_kind),
                util::channel_layout::ChannelLayout::default(output.channels as i32),
                output.sample_rate,
            )?);
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some(resampler) = resampler.as_mut() {
            resampler.run(frame, &mut resampled)?;
        }

        let samples = resampled.samples();
        let bytes = samples * output.bytes_per_frame();
        let data = if samples == 0 {
            Vec::new()
        } else {
            resampled.data(0)[..bytes].to_vec()
        };

        Ok(RawFrame::Audio {
            pts: frame.timestamp().or(frame.pts()),
            samples,
            data,
        })
    }
}

impl Codec for FfmpegCodec {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<()> {
        let result = match packet {
            Some(packet) => {
                let mut av = ffmpeg::Packet::copy(&packet.data);
                av.set_stream(packet.stream_index);
                av.set_pts(packet.pts);
                av.set_dts(packet.dts);
                av.set_duration(packet.duration);
                if packet.key {
                    av.set_flags(ffmpeg::packet::Flags::KEY);
                }
                self.decoder().send_packet(&av)
            }
            None => self.decoder().send_eof(),
        };

        match result {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Eof) => {
                debug!("解码器已收到 EOF，忽略本次包");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn receive_frame(&mut self) -> Result<Received> {
        match &mut self.state {
            CodecState::Video { decoder, scaler } => {
                let mut frame = util::frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Received::Frame(Self::convert_video(scaler, &frame)?)),
                    Err(ffmpeg::Error::Other { errno: 11 }) => Ok(Received::Again), // EAGAIN
                    Err(ffmpeg::Error::Eof) => Ok(Received::Eof),
                    Err(e) => Err(e.into()),
                }
            }
            CodecState::Audio {
                decoder,
                resampler,
                output,
            } => {
                let mut frame = util::frame::Audio::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => Ok(Received::Frame(Self::convert_audio(resampler, output, &frame)?)),
                    Err(ffmpeg::Error::Other { errno: 11 }) => Ok(Received::Again), // EAGAIN
                    Err(ffmpeg::Error::Eof) => Ok(Received::Eof),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn flush(&mut self) {
        self.decoder().flush();
    }

    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        match &mut self.state {
            CodecState::Audio {
                resampler, output, ..
            } => {
                *output = *format;
                // 下一帧到达时按新格式重建
                *resampler = None;
                Ok(())
            }
            CodecState::Video { .. } => {
                warn!("⚠️ 视频解码器忽略音频输出格式");
                Ok(())
            }
        }
    }
}
