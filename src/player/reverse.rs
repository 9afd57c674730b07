//! 倒放分发器
//!
//! 按固定长度的时间窗口倒放：对结束于 `from` 的窗口，容器定位到 `from - interval`，
//! 向前解码，把窗口内的帧压栈，两条流都越过 `from` 后按后进先出写入输出队列，
//! 然后窗口前移一个 `interval`。窗口起点到达 0 即为结束。

use crate::core::{AudioFormat, AudioFrame, PlayerConfig, Result, Timed, VideoFrame};
use crate::player::decoder::DecodeStatus;
use crate::player::dispatcher::{Dispatcher, Routed, StepResult, Tracks};
use crate::player::frame_queue::FrameQueue;
use crate::player::source::MediaSource;
use log::{debug, error, info};
use std::sync::Arc;

/// 单条流在当前窗口内的解码栈
struct SegmentStack<T> {
    frames: Vec<T>,
    last_pts: f64,
    /// 已越过窗口终点或流已结束
    reached: bool,
    present: bool,
}

impl<T: Timed> SegmentStack<T> {
    fn new(present: bool) -> Self {
        Self {
            frames: Vec::new(),
            last_pts: -1.0,
            reached: !present,
            present,
        }
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.last_pts = -1.0;
        self.reached = !self.present;
    }

    /// 窗口为 `[horizon, from)`，边界统一减去 `eps`，相邻窗口不重叠
    fn accept(&mut self, frame: T, horizon: f64, from: f64, eps: f64) {
        if self.reached {
            return;
        }
        let pts = frame.pts();
        if pts < horizon - eps {
            // 预热解码器的前导帧
            return;
        }
        if pts >= from - eps {
            self.reached = true;
            return;
        }
        self.last_pts = pts;
        self.frames.push(frame);
    }

    fn finish_stream(&mut self, status: DecodeStatus) {
        if status != DecodeStatus::NeedInput {
            self.reached = true;
        }
    }
}

/// 倒放分发器
pub struct ReverseDispatcher {
    tracks: Tracks,
    video_queue: Arc<FrameQueue<VideoFrame>>,
    audio_queue: Arc<FrameQueue<AudioFrame>>,
    interval: f64,
    eps: f64,
    from: f64,
    video: SegmentStack<VideoFrame>,
    audio: SegmentStack<AudioFrame>,
    needs_seek: bool,
    finished: bool,
    next_segment: Option<f64>,
    segments: usize,
}

impl ReverseDispatcher {
    pub fn new(source: Box<dyn MediaSource>, config: &PlayerConfig) -> Result<Self> {
        let tracks = Tracks::open(source, &config.output_format)?;
        let dispatcher = Self {
            video: SegmentStack::new(tracks.has_video()),
            audio: SegmentStack::new(tracks.has_audio()),
            tracks,
            video_queue: Arc::new(FrameQueue::new(config.video_queue_capacity)),
            audio_queue: Arc::new(FrameQueue::new(config.audio_queue_capacity)),
            interval: config.reverse_interval_secs,
            eps: config.seek_tolerance_secs,
            from: 0.0,
            needs_seek: true,
            finished: false,
            next_segment: None,
            segments: 0,
        };
        dispatcher.mark_absent_tracks();
        Ok(dispatcher)
    }

    fn mark_absent_tracks(&self) {
        if !self.tracks.has_video() {
            self.video_queue.mark_eof();
        }
        if !self.tracks.has_audio() {
            self.audio_queue.mark_eof();
        }
    }

    /// 当前窗口的解码起点
    fn horizon(&self) -> f64 {
        (self.from - self.interval).max(0.0)
    }

    /// 倒放从 `secs` 开始，丢弃已缓存的栈、已输出的帧和结束标记
    pub fn set_start(&mut self, secs: f64) {
        self.from = secs.max(0.0);
        self.video.reset();
        self.audio.reset();
        self.video_queue.clear();
        self.audio_queue.clear();
        self.mark_absent_tracks();
        self.needs_seek = true;
        self.finished = false;
        self.next_segment = None;
        debug!("⏪ 倒放起点: {:.3}s", self.from);
    }

    /// 下一个窗口的终点，每个窗口只返回一次
    pub fn next_segment(&mut self) -> Option<f64> {
        self.next_segment.take()
    }

    /// 解码直到输出一个完整窗口或到达开头
    pub fn step_segment(&mut self) -> StepResult {
        let target = self.segments + 1;
        while self.segments < target {
            if self.step() == StepResult::Eof {
                return if self.segments >= target {
                    StepResult::Continue
                } else {
                    StepResult::Eof
                };
            }
        }
        StepResult::Continue
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.video_queue.mark_eof();
            self.audio_queue.mark_eof();
            info!("⏮ 倒放到达开头");
        }
    }

    /// 定位到当前窗口的解码起点
    fn begin_segment(&mut self) -> StepResult {
        if self.from <= self.eps {
            self.finish();
            return StepResult::Eof;
        }
        let horizon = self.horizon();
        if let Err(e) = self.tracks.seek_source(horizon) {
            error!("❌ 倒放定位到 {:.3}s 失败: {}", horizon, e);
            self.finish();
            return StepResult::Eof;
        }
        self.tracks.flush_codecs();
        self.video.reset();
        self.audio.reset();
        self.needs_seek = false;
        StepResult::Continue
    }

    fn accept_frames(&mut self, videos: Vec<VideoFrame>, audios: Vec<AudioFrame>) {
        let (horizon, from, eps) = (self.horizon(), self.from, self.eps);
        for frame in videos {
            self.video.accept(frame, horizon, from, eps);
        }
        for frame in audios {
            self.audio.accept(frame, horizon, from, eps);
        }
    }

    /// 两条流都越过窗口终点后按后进先出写入输出队列
    fn flush_segment(&mut self) {
        let horizon = self.horizon();
        let format: AudioFormat = self.tracks.output_format();
        debug!(
            "⏪ 输出窗口 [{:.3}, {:.3}): 视频 {} 帧（末帧 {:.3}），音频 {} 帧（末帧 {:.3}）",
            horizon,
            self.from,
            self.video.frames.len(),
            self.video.last_pts,
            self.audio.frames.len(),
            self.audio.last_pts
        );

        while let Some(frame) = self.video.frames.pop() {
            self.video_queue.push(frame);
        }
        while let Some(mut frame) = self.audio.frames.pop() {
            // 采样倒序后，帧的起点是原帧的结束时刻
            format.reverse_frames(&mut frame.data);
            frame.pts += frame.duration;
            self.audio_queue.push(frame);
        }

        self.segments += 1;
        self.from = horizon;
        self.next_segment = Some(horizon);
        if horizon <= self.eps {
            self.finish();
        } else {
            self.needs_seek = true;
        }
    }
}

impl Dispatcher for ReverseDispatcher {
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
        if self.finished {
            return StepResult::Eof;
        }
        if self.needs_seek {
            return self.begin_segment();
        }

        let mut videos = Vec::new();
        let mut audios = Vec::new();
        match self.tracks.read_packet() {
            Ok(Some(packet)) => {
                let routed = self.tracks.route(
                    &packet,
                    !self.video.reached,
                    !self.audio.reached,
                    &mut videos,
                    &mut audios,
                );
                self.accept_frames(videos, audios);
                match routed {
                    Routed::Video(status) => self.video.finish_stream(status),
                    Routed::Audio(status) => self.audio.finish_stream(status),
                    Routed::Ignored => {}
                }
            }
            other => {
                if let Err(e) = other {
                    error!("❌ 倒放读取包失败: {}", e);
                }
                if !self.video.reached {
                    self.tracks.drain_video(&mut videos);
                }
                if !self.audio.reached {
                    self.tracks.drain_audio(&mut audios);
                }
                self.accept_frames(videos, audios);
                self.video.reached = true;
                self.audio.reached = true;
            }
        }

        if self.video.reached && self.audio.reached {
            self.flush_segment();
        }
        if self.finished {
            StepResult::Eof
        } else {
            StepResult::Continue
        }
    }

    /// 倒放模式下 seek 即从目标位置重新开始倒放，返回时已输出第一个窗口
    fn seek(&mut self, secs: f64) -> Result<()> {
        info!("⏪ 倒放 seek 到 {:.3}s", secs);
        self.flush();
        self.set_start(secs);
        self.resume();
        self.step_segment();
        Ok(())
    }

    fn flush(&mut self) {
        self.video_queue.set_enabled(false);
        self.audio_queue.set_enabled(false);
        let dropped = self.video_queue.clear() + self.audio_queue.clear();
        self.tracks.flush_codecs();
        self.video.reset();
        self.audio.reset();
        self.needs_seek = true;
        if self.finished {
            self.video_queue.mark_eof();
            self.audio_queue.mark_eof();
        } else {
            self.mark_absent_tracks();
        }
        if dropped > 0 {
            debug!("🧹 倒放分发器丢弃 {} 帧", dropped);
        }
    }

    fn resume(&mut self) {
        self.video_queue.set_enabled(true);
        self.audio_queue.set_enabled(true);
    }

    fn set_audio_track(&mut self, track: usize) -> Result<()> {
        self.tracks.set_audio_track(track)?;
        self.audio_queue.clear();
        if self.finished {
            self.audio_queue.mark_eof();
        }
        self.video.reset();
        self.audio.reset();
        self.needs_seek = true;
        Ok(())
    }

    fn set_output_format(&mut self, format: &AudioFormat) -> Result<()> {
        self.tracks.set_output_format(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::dispatcher::ForwardDispatcher;
    use crate::player::source::MediaOpener;
    use crate::player::test_pattern::TestPatternOpener;

    fn config(interval: f64) -> PlayerConfig {
        PlayerConfig {
            reverse_interval_secs: interval,
            ..PlayerConfig::default()
        }
    }

    fn reverse(path: &str, interval: f64) -> ReverseDispatcher {
        let source = TestPatternOpener.open(path).unwrap();
        ReverseDispatcher::new(source, &config(interval)).unwrap()
    }

    fn drain<T>(queue: &FrameQueue<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = queue.remove(false) {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_backward_from_zero_yields_nothing() {
        let mut d = reverse("testsrc", 5.0);
        d.set_start(0.0);
        assert_eq!(d.step(), StepResult::Eof);
        assert!(d.video_queue().is_finished());
        assert!(d.audio_queue().is_finished());
        assert_eq!(d.video_queue().remove(true), None);
    }

    #[test]
    fn test_reverse_round_trip_matches_forward_pass() {
        let path = "testsrc?duration=5";
        let source = TestPatternOpener.open(path).unwrap();
        let mut forward = ForwardDispatcher::new(source, &config(1.0)).unwrap();
        forward.seek(2.0).unwrap();
        let mut forward_pts = Vec::new();
        loop {
            match forward.video_queue().remove(false) {
                Some(frame) if frame.pts < 4.0 => forward_pts.push(frame.pts),
                Some(_) => break,
                None => {
                    if forward.step() == StepResult::Eof {
                        break;
                    }
                }
            }
        }

        let mut backward = reverse(path, 1.0);
        backward.set_start(4.0);
        let mut backward_pts = Vec::new();
        'outer: while backward.step_segment() == StepResult::Continue {
            for frame in drain(backward.video_queue()) {
                if frame.pts < 2.0 - 1e-9 {
                    break 'outer;
                }
                backward_pts.push(frame.pts);
            }
        }

        backward_pts.reverse();
        assert_eq!(forward_pts.len(), 60);
        assert_eq!(backward_pts, forward_pts);
    }

    #[test]
    fn test_windows_advance_until_start() {
        let mut d = reverse("testsrc?duration=10&fps=30", 1.0);
        d.set_start(2.5);

        assert_eq!(d.step_segment(), StepResult::Continue);
        assert_eq!(d.next_segment(), Some(1.5));
        assert_eq!(d.next_segment(), None);

        let mut video = drain(d.video_queue());
        while d.step_segment() == StepResult::Continue {
            video.extend(drain(d.video_queue()));
        }
        video.extend(drain(d.video_queue()));

        assert!(d.is_finished());
        assert_eq!(video.len(), 75);
        assert!(video.windows(2).all(|w| w[0].pts > w[1].pts));
        assert_eq!(video.last().map(|f| f.pts), Some(0.0));
    }

    #[test]
    fn test_audio_and_video_stay_within_one_window() {
        let interval = 1.0;
        let mut d = reverse("testsrc?duration=6", interval);
        d.set_start(6.0);

        let mut last_audio = f64::INFINITY;
        while d.step_segment() == StepResult::Continue || !d.video_queue().is_empty() {
            let video = drain(d.video_queue());
            let audio = drain(d.audio_queue());
            for frame in &audio {
                assert!(frame.pts < last_audio, "音频时间戳必须递减");
                last_audio = frame.pts;
            }
            if let (Some(v), Some(a)) = (video.last(), audio.last()) {
                assert!((v.pts - a.pts).abs() <= interval, "v={} a={}", v.pts, a.pts);
            }
            if d.is_finished() && d.video_queue().is_empty() {
                break;
            }
        }
        assert!(last_audio < 0.05);
    }

    #[test]
    fn test_seek_restarts_reverse_segment() {
        let mut d = reverse("testsrc", 5.0);
        d.seek(7.0).unwrap();
        let first = d.video_queue().remove(false).unwrap();
        assert!(first.pts < 7.0 && first.pts >= 7.0 - 1.0 / 30.0 - 1e-9);
        assert_eq!(d.next_segment(), Some(2.0));
    }

    #[test]
    fn test_seek_after_reaching_start_reopens_queues() {
        let mut d = reverse("testsrc?duration=10", 5.0);
        d.set_start(5.0);
        while d.step_segment() == StepResult::Continue {}
        assert!(d.is_finished());
        assert!(d.video_queue().is_eof());

        d.seek(10.0).unwrap();
        assert!(!d.is_finished());
        assert!(!d.video_queue().is_eof());
        assert!(!d.audio_queue().is_eof());
        assert_eq!(d.video_queue().len(), 150);
        assert_eq!(d.next_segment(), Some(5.0));
    }
}
