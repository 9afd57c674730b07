use crate::core::{
    AudioFormat, AudioFrame, PlayerConfig, PlayerError, Result, StreamInfo, TrackInfo, VideoFrame,
};
use crate::player::decoder::{AudioDecoder, DecodeStatus, TrackDecoder, VideoDecoder};
use crate::player::frame_queue::FrameQueue;
use crate::player::source::{MediaSource, Packet};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// 分发器单步推进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Eof,
}

/// 解码分发器（正放 / 倒放）
///
/// 所有方法都在 Demuxer 的协调锁内调用。
pub trait Dispatcher: Send {
    fn tracks(&self) -> &Tracks;

    fn video_queue(&self) -> &Arc<FrameQueue<VideoFrame>>;

    fn audio_queue(&self) -> &Arc<FrameQueue<AudioFrame>>;

    /// 读取并处理一个数据包
    fn step(&mut self) -> StepResult;

    /// 重新定位；返回时每条流的下一帧都不早于目标
    fn seek(&mut self, secs: f64) -> Result<()>;

    /// 禁用并清空队列，丢弃编解码器缓存
    fn flush(&mut self);

    /// 重新启用队列
    fn resume(&mut self);

    /// 切换音轨，前置条件：已暂停且已 flush
    fn set_audio_track(&mut self, track: usize) -> Result<()>;

    /// 切换音频输出格式，前置条件：已暂停且队列为空
    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()>;
}

/// 被选中的视频流和音频流及其解码器
pub struct Tracks {
    source: Box<dyn MediaSource>,
    video: Option<VideoDecoder>,
    audio: Option<AudioDecoder>,
    audio_streams: Vec<usize>,
    audio_track: Option<usize>,
    output: AudioFormat,
}

/// 数据包路由结果
pub(crate) enum Routed {
    Video(DecodeStatus),
    Audio(DecodeStatus),
    Ignored,
}

impl Tracks {
    pub fn open(source: Box<dyn MediaSource>, output: &AudioFormat) -> Result<Self> {
        let video_stream = source.streams().iter().find(|s| s.is_video()).map(|s| s.index);
        let audio_streams: Vec<usize> = source
            .streams()
            .iter()
            .filter(|s| s.is_audio())
            .map(|s| s.index)
            .collect();

        if video_stream.is_none() && audio_streams.is_empty() {
            return Err(PlayerError::NoStreams);
        }

        let video = match video_stream {
            Some(index) => Some(VideoDecoder::open(source.as_ref(), index, output)?),
            None => None,
        };
        let audio = match audio_streams.first() {
            Some(&index) => Some(AudioDecoder::open(source.as_ref(), index, output)?),
            None => None,
        };

        debug!(
            "选中流: 视频 {:?}，音频 {:?}（共 {} 条音轨）",
            video_stream,
            audio_streams.first(),
            audio_streams.len()
        );

        Ok(Self {
            audio_track: audio.as_ref().map(|_| 0),
            source,
            video,
            audio,
            audio_streams,
            output: *output,
        })
    }

    pub fn streams(&self) -> &[StreamInfo] {
        self.source.streams()
    }

    pub fn description(&self) -> String {
        self.source.description()
    }

    /// 音轨序号对应的容器流索引
    pub fn audio_stream(&self, track: usize) -> Option<usize> {
        self.audio_streams.get(track).copied()
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn video_duration(&self) -> f64 {
        self.video.as_ref().map(|d| d.stream().duration).unwrap_or(0.0)
    }

    pub fn audio_duration(&self) -> f64 {
        self.audio.as_ref().map(|d| d.stream().duration).unwrap_or(0.0)
    }

    pub fn audio_track(&self) -> Option<usize> {
        self.audio_track
    }

    pub fn track_infos(&self) -> Vec<TrackInfo> {
        TrackInfo::collect(self.source.streams())
    }

    pub fn input_format(&self) -> Option<AudioFormat> {
        self.audio.as_ref().and_then(|d| d.input_format())
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// 关闭旧的音频解码器并为新音轨打开解码器，容器位置不变
    pub fn set_audio_track(&mut self, track: usize) -> Result<()> {
        let stream_index = self
            .audio_stream(track)
            .ok_or(PlayerError::StreamNotFound(track))?;
        let decoder = AudioDecoder::open(self.source.as_ref(), stream_index, &self.output)?;
        self.audio = Some(decoder);
        self.audio_track = Some(track);
        info!("🔊 切换到音轨 {}（流 #{}）", track, stream_index);
        Ok(())
    }

    pub fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        if let Some(audio) = self.audio.as_mut() {
            audio.set_output_format(format)?;
        }
        self.output = *format;
        Ok(())
    }

    pub(crate) fn read_packet(&mut self) -> Result<Option<Packet>> {
        self.source.read_packet()
    }

    pub(crate) fn seek_source(&mut self, secs: f64) -> Result<()> {
        self.source.seek(secs)
    }

    pub(crate) fn flush_codecs(&mut self) {
        if let Some(video) = self.video.as_mut() {
            video.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.flush();
        }
    }

    /// 把数据包交给对应流的解码器；`want_*` 为 false 的流直接忽略
    pub(crate) fn route(
        &mut self,
        packet: &Packet,
        want_video: bool,
        want_audio: bool,
        videos: &mut Vec<VideoFrame>,
        audios: &mut Vec<AudioFrame>,
    ) -> Routed {
        if want_video {
            if let Some(video) = self.video.as_mut() {
                if video.stream().index == packet.stream_index {
                    return Routed::Video(video.decode(Some(packet), videos));
                }
            }
        }
        if want_audio {
            if let Some(audio) = self.audio.as_mut() {
                if audio.stream().index == packet.stream_index {
                    return Routed::Audio(audio.decode(Some(packet), audios));
                }
            }
        }
        Routed::Ignored
    }

    /// 输入结束后排空解码器
    pub(crate) fn drain_video(&mut self, videos: &mut Vec<VideoFrame>) -> DecodeStatus {
        match self.video.as_mut() {
            Some(video) => video.decode(None, videos),
            None => DecodeStatus::EndOfStream,
        }
    }

    pub(crate) fn drain_audio(&mut self, audios: &mut Vec<AudioFrame>) -> DecodeStatus {
        match self.audio.as_mut() {
            Some(audio) => audio.decode(None, audios),
            None => DecodeStatus::EndOfStream,
        }
    }
}

/// 单条流在正放中的进度
#[derive(Debug, Clone, Copy)]
struct TrackProgress {
    /// 早于该时间的帧被丢弃（seek 之后生效，接受第一帧后取消）
    skip_before: f64,
    done: bool,
}

impl TrackProgress {
    fn new(present: bool) -> Self {
        Self {
            skip_before: f64::NEG_INFINITY,
            done: !present,
        }
    }
}

/// 正放分发器：按容器顺序把数据包分发给选中的音视频解码器
pub struct ForwardDispatcher {
    tracks: Tracks,
    video_queue: Arc<FrameQueue<VideoFrame>>,
    audio_queue: Arc<FrameQueue<AudioFrame>>,
    video: TrackProgress,
    audio: TrackProgress,
    seek_tolerance: f64,
    eof: bool,
}

impl ForwardDispatcher {
    pub fn new(source: Box<dyn MediaSource>, config: &PlayerConfig) -> Result<Self> {
        let tracks = Tracks::open(source, &config.output_format)?;
        let dispatcher = Self {
            video: TrackProgress::new(tracks.has_video()),
            audio: TrackProgress::new(tracks.has_audio()),
            tracks,
            video_queue: Arc::new(FrameQueue::new(config.video_queue_capacity)),
            audio_queue: Arc::new(FrameQueue::new(config.audio_queue_capacity)),
            seek_tolerance: config.seek_tolerance_secs,
            eof: false,
        };
        dispatcher.mark_finished_tracks();
        Ok(dispatcher)
    }

    /// 没有或已经结束的流，其队列保持流结束标记
    fn mark_finished_tracks(&self) {
        if self.video.done {
            self.video_queue.mark_eof();
        }
        if self.audio.done {
            self.audio_queue.mark_eof();
        }
    }

    /// seek 之后从头计算进度；flush 留下的结束标记随之撤销
    fn reset_progress(&mut self, skip_before: f64) {
        self.video = TrackProgress::new(self.tracks.has_video());
        self.audio = TrackProgress::new(self.tracks.has_audio());
        self.video.skip_before = skip_before;
        self.audio.skip_before = skip_before;
        self.eof = false;
        self.video_queue.clear();
        self.audio_queue.clear();
        self.mark_finished_tracks();
    }

    fn deliver_video(&mut self, frames: Vec<VideoFrame>, status: DecodeStatus) {
        for frame in frames {
            if frame.pts < self.video.skip_before {
                continue;
            }
            self.video.skip_before = f64::NEG_INFINITY;
            self.video_queue.push(frame);
        }
        if status != DecodeStatus::NeedInput && !self.video.done {
            self.video.done = true;
            self.video_queue.mark_eof();
        }
    }

    fn deliver_audio(&mut self, frames: Vec<AudioFrame>, status: DecodeStatus) {
        for frame in frames {
            if frame.pts < self.audio.skip_before {
                continue;
            }
            self.audio.skip_before = f64::NEG_INFINITY;
            self.audio_queue.push(frame);
        }
        if status != DecodeStatus::NeedInput && !self.audio.done {
            self.audio.done = true;
            self.audio_queue.mark_eof();
        }
    }

    /// 到达文件末尾：排空解码器并标记流结束
    fn finish(&mut self) {
        if !self.video.done {
            let mut frames = Vec::new();
            let status = self.tracks.drain_video(&mut frames);
            let status = if status == DecodeStatus::NeedInput {
                DecodeStatus::EndOfStream
            } else {
                status
            };
            self.deliver_video(frames, status);
        }
        if !self.audio.done {
            let mut frames = Vec::new();
            let status = self.tracks.drain_audio(&mut frames);
            let status = if status == DecodeStatus::NeedInput {
                DecodeStatus::EndOfStream
            } else {
                status
            };
            self.deliver_audio(frames, status);
        }
        self.eof = true;
        debug!("📄 正放到达文件末尾");
    }

    /// seek 完成条件：每条活动流都已有一帧或已结束
    fn seek_settled(&self) -> bool {
        (self.video.done || !self.video_queue.is_empty())
            && (self.audio.done || !self.audio_queue.is_empty())
    }
}

impl Dispatcher for ForwardDispatcher {
    fn tracks(&self) -> &Tracks {
        &self.tracks
    }

    fn video_queue(&self) -> &Arc<FrameQueue<VideoFrame>> {
        &self.video_queue
    }

    fn audio_queue(&self) -> &Arc<FrameQueue<AudioFrame>> {
        &self.audio_queue
    }

    fn step(&mut self) -> StepResult {
        if self.eof {
            return StepResult::Eof;
        }

        match self.tracks.read_packet() {
            Ok(Some(packet)) => {
                let mut videos = Vec::new();
                let mut audios = Vec::new();
                let routed = self.tracks.route(
                    &packet,
                    !self.video.done,
                    !self.audio.done,
                    &mut videos,
                    &mut audios,
                );
                match routed {
                    Routed::Video(status) => self.deliver_video(videos, status),
                    Routed::Audio(status) => self.deliver_audio(audios, status),
                    Routed::Ignored => {}
                }
                if self.video.done && self.audio.done {
                    self.eof = true;
                    return StepResult::Eof;
                }
                StepResult::Continue
            }
            Ok(None) => {
                self.finish();
                StepResult::Eof
            }
            Err(e) => {
                error!("❌ 读取包失败: {}", e);
                self.finish();
                StepResult::Eof
            }
        }
    }

    fn seek(&mut self, secs: f64) -> Result<()> {
        let target = secs.max(0.0);
        info!("⏩ 正放 seek 到 {:.3}s", target);

        self.flush();
        self.tracks.seek_source(target)?;
        self.reset_progress(target - self.seek_tolerance);
        self.resume();

        // 解码到每条流都产出不早于目标的第一帧
        while !self.seek_settled() {
            if self.step() == StepResult::Eof {
                break;
            }
        }

        debug!(
            "✅ seek 完成: 视频队列 {} 帧，音频队列 {} 帧",
            self.video_queue.len(),
            self.audio_queue.len()
        );
        Ok(())
    }

    fn flush(&mut self) {
        self.video_queue.set_enabled(false);
        self.audio_queue.set_enabled(false);
        let dropped = self.video_queue.clear() + self.audio_queue.clear();
        self.mark_finished_tracks();
        self.tracks.flush_codecs();
        if dropped > 0 {
            debug!("🧹 正放分发器丢弃 {} 帧", dropped);
        }
    }

    fn resume(&mut self) {
        self.video_queue.set_enabled(true);
        self.audio_queue.set_enabled(true);
    }

    fn set_audio_track(&mut self, track: usize) -> Result<()> {
        if !self.audio_queue.is_empty() {
            warn!("⚠️ 切换音轨时音频队列非空，已清空");
        }
        self.tracks.set_audio_track(track)?;
        self.audio_queue.clear();
        self.audio = TrackProgress::new(true);
        self.eof = false;
        Ok(())
    }

    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        self.tracks.set_output_format(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::source::MediaOpener;
    use crate::player::test_pattern::TestPatternOpener;

    fn dispatcher(path: &str) -> ForwardDispatcher {
        let source = TestPatternOpener.open(path).unwrap();
        ForwardDispatcher::new(source, &PlayerConfig::default()).unwrap()
    }

    fn run_to_end(dispatcher: &mut ForwardDispatcher) {
        while dispatcher.step() == StepResult::Continue {}
    }

    #[test]
    fn test_seek_first_frames_not_earlier_than_target() {
        let mut d = dispatcher("testsrc?duration=10&fps=30&sample_rate=44100&channels=2");
        d.seek(5.0).unwrap();

        let video = d.video_queue().remove(false).unwrap();
        assert!(video.pts >= 5.0 && video.pts < 5.0 + 1.0 / 30.0, "video pts {}", video.pts);

        let audio = d.audio_queue().remove(false).unwrap();
        assert!(
            audio.pts >= 5.0 && audio.pts < 5.0 + audio.duration,
            "audio pts {}",
            audio.pts
        );
    }

    #[test]
    fn test_seek_between_key_frames() {
        let mut d = dispatcher("testsrc?gop=15");
        for target in [0.0, 1.234, 7.77, 9.9] {
            d.seek(target).unwrap();
            let video = d.video_queue().remove(false).unwrap();
            assert!(video.pts >= target - 1e-6, "{} < {}", video.pts, target);
            assert!(video.pts < target + 1.0 / 30.0);
        }
    }

    #[test]
    fn test_forward_playback_is_fifo() {
        let mut d = dispatcher("testsrc?duration=1");
        run_to_end(&mut d);
        assert!(d.video_queue().len() >= 30);

        let mut last = f64::NEG_INFINITY;
        let mut count = 0;
        while let Some(frame) = d.video_queue().remove(true) {
            assert!(frame.pts > last);
            last = frame.pts;
            count += 1;
        }
        assert_eq!(count, 30);
        assert!(d.video_queue().is_finished());
        assert!(d.audio_queue().len() > 0);
    }

    #[test]
    fn test_seek_past_end_reports_eof() {
        let mut d = dispatcher("testsrc?duration=2");
        d.seek(30.0).unwrap();
        assert_eq!(d.video_queue().remove(true), None);
        assert_eq!(d.audio_queue().remove(true), None);
        assert_eq!(d.step(), StepResult::Eof);
    }

    #[test]
    fn test_audio_only_source() {
        let mut d = dispatcher("testsrc?video=0&duration=1");
        assert!(!d.tracks().has_video());
        assert!(d.video_queue().is_finished());
        run_to_end(&mut d);
        assert_eq!(d.audio_queue().len(), 44);
    }

    #[test]
    fn test_set_audio_track() {
        let mut d = dispatcher("testsrc?audio_tracks=2");
        assert_eq!(d.tracks().track_infos().len(), 2);
        d.flush();
        d.set_audio_track(1).unwrap();
        assert_eq!(d.tracks().audio_track(), Some(1));
        assert!(matches!(d.set_audio_track(5), Err(PlayerError::StreamNotFound(5))));

        d.seek(2.0).unwrap();
        let audio = d.audio_queue().remove(false).unwrap();
        assert!(audio.pts >= 2.0);
    }

    #[test]
    fn test_flush_disables_queues_until_resume() {
        let mut d = dispatcher("testsrc?duration=1");
        d.step();
        d.flush();
        assert!(d.video_queue().is_empty());
        assert!(!d.video_queue().is_enabled());
        d.resume();
        assert!(d.video_queue().is_enabled());
    }

    #[test]
    fn test_seek_after_eof_reopens_queues() {
        let mut d = dispatcher("testsrc?duration=1");
        while d.step() == StepResult::Continue {}
        assert!(d.video_queue().is_eof());
        assert!(d.audio_queue().is_eof());

        // 结束之后的 flush 保持结束标记，seek 才撤销
        d.flush();
        assert!(d.video_queue().is_eof());

        d.seek(0.0).unwrap();
        assert!(!d.video_queue().is_eof());
        assert!(!d.audio_queue().is_eof());
        assert_eq!(d.video_queue().front(false, |f| f.pts), Some(0.0));
        assert_eq!(d.step(), StepResult::Continue);
    }
}
