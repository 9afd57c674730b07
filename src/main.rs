use anyhow::{anyhow, Result};
use log::info;
use parking_lot::Mutex;
use reel_core::core::{PlaybackState, PlayerConfig, VideoFrame};
use reel_core::player::{AudioSink, MediaOpener, Player, TestPatternOpener, VideoSink, VirtualSink};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const USAGE: &str =
    "用法: reel <文件|testsrc?...> [--config 配置.json] [--seek 秒] [--speed 倍率] [--backward]";

struct Options {
    path: String,
    config: Option<String>,
    seek: Option<f64>,
    speed: Option<f64>,
    backward: bool,
}

impl Options {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut options = Options {
            path: String::new(),
            config: None,
            seek: None,
            speed: None,
            backward: false,
        };
        while let Some(arg) = args.next() {
            let mut value = || args.next().ok_or_else(|| anyhow!(USAGE));
            match arg.as_str() {
                "--config" => options.config = Some(value()?),
                "--seek" => options.seek = Some(value()?.parse()?),
                "--speed" => options.speed = Some(value()?.parse()?),
                "--backward" => options.backward = true,
                _ if options.path.is_empty() => options.path = arg,
                _ => return Err(anyhow!("未知参数: {}\n{}", arg, USAGE)),
            }
        }
        if options.path.is_empty() {
            return Err(anyhow!(USAGE));
        }
        Ok(options)
    }
}

/// 无界面渲染端：只统计帧数
#[derive(Default)]
struct FrameCounter {
    shown: Mutex<(usize, f64)>,
}

impl VideoSink for FrameCounter {
    fn set_video_frame(&self, frame: VideoFrame) {
        let mut shown = self.shown.lock();
        shown.0 += 1;
        shown.1 = frame.pts;
    }
}

fn opener_for(path: &str) -> Result<Arc<dyn MediaOpener>> {
    if path.starts_with("testsrc") {
        return Ok(Arc::new(TestPatternOpener));
    }
    #[cfg(feature = "ffmpeg")]
    {
        let opener = reel_core::player::FfmpegOpener::new()
            .map_err(|e| anyhow!("FFmpeg 初始化失败: {}", e))?;
        info!("✅ FFmpeg 初始化成功");
        Ok(Arc::new(opener))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Err(anyhow!("播放媒体文件需要启用 ffmpeg 特性: {}", path))
    }
}

fn audio_sink(config: &PlayerConfig) -> Arc<dyn AudioSink> {
    #[cfg(feature = "audio-device")]
    {
        match reel_core::player::CpalSink::new(config) {
            Ok(sink) => return Arc::new(sink),
            Err(e) => log::warn!("⚠️ 音频设备不可用，使用虚拟输出: {}", e),
        }
    }
    Arc::new(VirtualSink::from_config(config))
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let options = Options::parse()?;
    let config = match &options.config {
        Some(path) => PlayerConfig::from_file(path)?,
        None => PlayerConfig::default(),
    };
    info!("🎬 reel 启动: {}", options.path);

    let counter = Arc::new(FrameCounter::default());
    let player = Player::new(
        config.clone(),
        opener_for(&options.path)?,
        audio_sink(&config),
        counter.clone(),
    )?;

    let result = player.open_file(&options.path);
    if result != reel_core::core::OpenFileResult::Success {
        return Err(anyhow!("打开失败 ({:?}): {}", result, options.path));
    }
    if let Some(secs) = options.seek {
        player.seek(secs)?;
    }
    if options.backward {
        player.backward()?;
    }
    if let Some(speed) = options.speed {
        player.set_speed(speed);
    }

    player.start()?;
    let started = Instant::now();
    let mut last_report = Instant::now();
    while player.get_state().state == PlaybackState::Playing {
        player.poll_events();
        if last_report.elapsed() >= Duration::from_secs(1) {
            let (shown, pts) = *counter.shown.lock();
            info!(
                "⏱ 位置 {:.2}s，已显示 {} 帧（最后一帧 {:.3}s）",
                player.position(),
                shown,
                pts
            );
            last_report = Instant::now();
        }
        thread::sleep(Duration::from_millis(50));
    }

    let (shown, _) = *counter.shown.lock();
    info!(
        "✅ 播放结束：{} 帧，用时 {:.2}s",
        shown,
        started.elapsed().as_secs_f64()
    );
    player.close();
    Ok(())
}
