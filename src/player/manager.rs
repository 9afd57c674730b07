use crate::core::{
    Direction, MediaInfo, OpenFileResult, PlaybackState, PlayerConfig, PlayerError, PlayerState,
    Result, TrackInfo,
};
use crate::player::audio_sink::{AudioSink, VirtualSink};
use crate::player::demuxer::Demuxer;
use crate::player::log_ctx;
use crate::player::playback::{Playback, PlaybackEvent, VideoSink};
use crate::player::source::MediaOpener;
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// 播放器 - 把解封装门面和音画同步器组合成完整的控制流程
///
/// 所有多步操作（seek、切换方向、切换音轨）都遵循同一顺序：
/// 暂停同步器 → 暂停解码 → 定位 → 清空音频输出 → 设置起点 → 按需恢复。
pub struct Player {
    playback: Playback,
    demuxer: Arc<Demuxer>,
    events: Receiver<PlaybackEvent>,
    state: Mutex<PlayerState>,
}

impl Player {
    pub fn new(
        config: PlayerConfig,
        opener: Arc<dyn MediaOpener>,
        sink: Arc<dyn AudioSink>,
        video_sink: Arc<dyn VideoSink>,
    ) -> Result<Self> {
        info!("{} 🎮 创建播放器...", log_ctx());
        let demuxer = Arc::new(Demuxer::new(config, opener)?);
        // 解码输出与音频设备实际使用的格式保持一致
        demuxer.set_output_format(sink.format())?;
        let playback = Playback::new(demuxer.clone(), sink, video_sink)?;
        let events = playback.events();

        info!("{} ✅ 播放器创建完成", log_ctx());
        Ok(Self {
            playback,
            demuxer,
            events,
            state: Mutex::new(PlayerState::default()),
        })
    }

    /// 使用虚拟音频输出（无头运行）
    pub fn headless(
        config: PlayerConfig,
        opener: Arc<dyn MediaOpener>,
        video_sink: Arc<dyn VideoSink>,
    ) -> Result<Self> {
        let sink = Arc::new(VirtualSink::from_config(&config));
        Self::new(config, opener, sink, video_sink)
    }

    // ========================================================================
    // 文件
    // ========================================================================

    pub fn open_file(&self, path: &str) -> OpenFileResult {
        let result = self.demuxer.open_file(path);
        if result == OpenFileResult::Success {
            self.playback.clear();
            self.playback.set_start_point(0.0);
            let mut state = self.state.lock();
            *state = PlayerState {
                state: PlaybackState::Paused,
                volume: state.volume,
                speed: state.speed,
                media_info: self.demuxer.media_info(),
                duration: self.duration(),
                ..PlayerState::default()
            };
        }
        result
    }

    pub fn close(&self) {
        if !self.demuxer.is_file_open() {
            warn!("⚠️ close(): 没有打开的文件");
            return;
        }
        self.playback.stop();
        self.demuxer.close();

        let mut state = self.state.lock();
        state.state = PlaybackState::Idle;
        state.direction = Direction::Forward;
        state.position = 0.0;
        state.duration = 0.0;
        state.media_info = None;
    }

    pub fn is_file_open(&self) -> bool {
        self.demuxer.is_file_open()
    }

    // ========================================================================
    // 播放控制
    // ========================================================================

    /// 开始 / 继续播放；播放完毕后从头（倒放时从结尾）重新开始
    pub fn start(&self) -> Result<()> {
        if !self.demuxer.is_file_open() {
            return Err(PlayerError::IllegalState("没有打开的文件，无法播放".to_string()));
        }
        if self.state.lock().state == PlaybackState::Stopped {
            let origin = if self.demuxer.is_backward() { self.duration() } else { 0.0 };
            info!("{} 从停止状态恢复播放，回到 {:.3}s", log_ctx(), origin);
            self.seek(origin)?;
        }

        info!("{} 🎬 播放", log_ctx());
        self.demuxer.start();
        self.playback.start();
        self.state.lock().state = PlaybackState::Playing;
        Ok(())
    }

    /// 暂停；返回时同步器和解码循环都已空闲
    pub fn pause(&self) {
        info!("{} 🎬 暂停", log_ctx());
        self.playback.pause();
        self.demuxer.pause();

        let mut state = self.state.lock();
        if state.state == PlaybackState::Playing {
            state.state = PlaybackState::Paused;
        }
        state.position = self.playback.position();
    }

    /// 跳转到指定位置（秒）
    pub fn seek(&self, secs: f64) -> Result<()> {
        info!("{} 🎯 Seek 到: {:.3}s", log_ctx(), secs);
        self.reposition(|demuxer| demuxer.seek(secs), secs)
    }

    /// 切换为正放
    pub fn forward(&self) -> Result<()> {
        self.switch_direction(Direction::Forward)
    }

    /// 切换为倒放，从当前位置开始向前播放
    pub fn backward(&self) -> Result<()> {
        self.switch_direction(Direction::Backward)
    }

    fn switch_direction(&self, direction: Direction) -> Result<()> {
        let backward = direction == Direction::Backward;
        if self.demuxer.is_backward() == backward {
            return Ok(());
        }
        let position = self.playback.position();
        self.reposition(
            |demuxer| {
                if backward {
                    demuxer.backward();
                } else {
                    demuxer.forward();
                }
                demuxer.seek(position)
            },
            position,
        )?;
        self.state.lock().direction = direction;
        Ok(())
    }

    /// 按音轨序号切换音轨，保持当前位置
    pub fn set_track(&self, track: usize) -> Result<()> {
        let position = self.playback.position();
        self.reposition(
            |demuxer| {
                demuxer.set_track(track)?;
                demuxer.seek(position)
            },
            position,
        )
    }

    /// 按容器流索引切换音轨
    pub fn set_audio_index(&self, stream_index: usize) -> Result<()> {
        let track = self
            .get_tracks()
            .iter()
            .find(|t| t.stream_index == stream_index)
            .map(|t| t.track)
            .ok_or(PlayerError::StreamNotFound(stream_index))?;
        self.set_track(track)
    }

    /// 多步操作的公共流程：暂停两条线程后执行 `action`，再按队首帧重设起点
    fn reposition(&self, action: impl FnOnce(&Demuxer) -> Result<()>, fallback: f64) -> Result<()> {
        let was_playing = self.playback.is_playing()
            || self.state.lock().state == PlaybackState::Playing;

        self.playback.pause();
        self.demuxer.pause();
        if let Err(e) = action(&self.demuxer) {
            warn!("⚠️ 操作失败，恢复原状态: {}", e);
            if was_playing {
                self.resume();
            }
            return Err(e);
        }
        self.playback.clear();

        let start = self
            .demuxer
            .front_sample(false)
            .or_else(|| self.demuxer.front_picture(false).filter(|pts| !pts.is_nan()))
            .unwrap_or(fallback);
        self.playback.set_start_point(start);
        debug!("起点 {:.3}s（目标 {:.3}s）", start, fallback);

        {
            let mut state = self.state.lock();
            state.position = start;
            if state.state == PlaybackState::Stopped {
                state.state = PlaybackState::Paused;
            }
        }
        if was_playing {
            self.resume();
        }
        Ok(())
    }

    fn resume(&self) {
        self.demuxer.start();
        self.playback.start();
        self.state.lock().state = PlaybackState::Playing;
    }

    pub fn set_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        self.playback.set_volume(volume);
        self.state.lock().volume = volume;
    }

    pub fn set_speed(&self, speed: f64) {
        if !(speed.is_finite() && speed > 0.0) {
            warn!("⚠️ 忽略无效的播放速度: {}", speed);
            return;
        }
        self.playback.set_speed(speed);
        self.state.lock().speed = speed;
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn get_tracks(&self) -> Vec<TrackInfo> {
        self.demuxer.get_tracks()
    }

    pub fn audio_track(&self) -> Option<usize> {
        self.demuxer.audio_track()
    }

    pub fn has_video(&self) -> bool {
        self.demuxer.has_video()
    }

    pub fn has_audio(&self) -> bool {
        self.demuxer.has_audio()
    }

    pub fn is_backward(&self) -> bool {
        self.demuxer.is_backward()
    }

    pub fn audio_duration(&self) -> f64 {
        self.demuxer.audio_duration()
    }

    pub fn video_duration(&self) -> f64 {
        self.demuxer.video_duration()
    }

    pub fn duration(&self) -> f64 {
        self.video_duration().max(self.audio_duration())
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.demuxer.media_info()
    }

    pub fn position(&self) -> f64 {
        self.playback.position()
    }

    /// 处理同步器发出的事件并更新状态，返回收到的事件
    pub fn poll_events(&self) -> Vec<PlaybackEvent> {
        let events: Vec<_> = self.events.try_iter().collect();
        for event in &events {
            if *event == PlaybackEvent::ResourcesEnd {
                info!("{} 📄 播放结束", log_ctx());
                self.demuxer.pause();
                self.state.lock().state = PlaybackState::Stopped;
            }
        }
        events
    }

    /// 获取当前状态
    pub fn get_state(&self) -> PlayerState {
        let mut state = self.state.lock();
        if self.demuxer.is_file_open() {
            state.position = self.playback.position();
            state.direction = if self.demuxer.is_backward() {
                Direction::Backward
            } else {
                Direction::Forward
            };
        }
        state.clone()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if self.demuxer.is_file_open() {
            self.close();
        }
    }
}
