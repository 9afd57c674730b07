use serde::{Deserialize, Serialize};

/// 环形缓冲区上限（256 MiB）
const RING_BUFFER_MAX_BYTES: usize = 256 << 20;

/// 音频采样格式（交错存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    U8,
    I16,
    I32,
    F32,
}

impl SampleKind {
    /// 每个采样占用的字节数
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleKind::U8 => 1,
            SampleKind::I16 => 2,
            SampleKind::I32 => 4,
            SampleKind::F32 => 4,
        }
    }

    /// 按倍率原地缩放音量
    ///
    /// `data` 末尾不足一个采样的字节会被忽略。
    pub fn scale_volume(self, data: &mut [u8], factor: f64) {
        if (factor - 1.0).abs() < f64::EPSILON {
            return;
        }
        match self {
            SampleKind::U8 => {
                for b in data.iter_mut() {
                    let centered = (*b as f64 - 128.0) * factor;
                    *b = (centered + 128.0).round().clamp(0.0, 255.0) as u8;
                }
            }
            SampleKind::I16 => {
                for chunk in data.chunks_exact_mut(2) {
                    let v = i16::from_ne_bytes([chunk[0], chunk[1]]) as f64 * factor;
                    let v = v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            }
            SampleKind::I32 => {
                for chunk in data.chunks_exact_mut(4) {
                    let raw = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let v = raw as f64 * factor;
                    let v = v.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            }
            SampleKind::F32 => {
                for chunk in data.chunks_exact_mut(4) {
                    let raw = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let v = raw * factor as f32;
                    chunk.copy_from_slice(&v.to_ne_bytes());
                }
            }
        }
    }
}

/// 音频格式描述：采样格式 + 采样率 + 声道数
///
/// 构造后不可变，格式变化时整体替换。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_kind: SampleKind,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_kind: SampleKind, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_kind,
            sample_rate,
            channels,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.sample_kind.bytes_per_sample()
    }

    /// 一个采样帧（所有声道）占用的字节数
    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// 每秒字节数
    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// 字节数对应的播放时长（秒）
    pub fn duration_of_bytes(&self, bytes: usize) -> f64 {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return 0.0;
        }
        bytes as f64 / per_second as f64
    }

    /// 时长对应的字节数，向下对齐到采样帧
    pub fn bytes_of_duration(&self, secs: f64) -> usize {
        if secs <= 0.0 {
            return 0;
        }
        self.align_down((secs * self.bytes_per_second() as f64) as usize)
    }

    /// 向下对齐到完整采样帧
    pub fn align_down(&self, bytes: usize) -> usize {
        let frame = self.bytes_per_frame();
        if frame == 0 {
            return 0;
        }
        bytes - bytes % frame
    }

    /// 按播放速度估算环形缓冲区大小：约 0.2 秒数据，
    /// 下限 2048 个采样帧，上限 256 MiB
    pub fn suggested_ring_buffer(&self, speed: f64) -> usize {
        let lower = 2 * 1024 * self.bytes_per_frame();
        let wanted = self.bytes_of_duration(0.2 * speed.max(0.0));
        wanted.clamp(lower, RING_BUFFER_MAX_BYTES.max(lower))
    }

    /// 原地反转采样帧顺序（倒放音频使用），声道内部字节顺序保持不变
    pub fn reverse_frames(&self, data: &mut [u8]) {
        let frame = self.bytes_per_frame();
        if frame == 0 {
            return;
        }
        let usable = self.align_down(data.len());
        let data = &mut data[..usable];
        let count = usable / frame;
        for i in 0..count / 2 {
            let j = count - 1 - i;
            let (head, tail) = data.split_at_mut(j * frame);
            head[i * frame..(i + 1) * frame].swap_with_slice(&mut tail[..frame]);
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::new(SampleKind::I16, 44100, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_duration_conversion() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.bytes_per_second(), 176_400);
        assert_eq!(format.bytes_of_duration(1.0), 176_400);
        assert!((format.duration_of_bytes(88_200) - 0.5).abs() < 1e-9);
        // 非整帧时长向下对齐
        assert_eq!(format.bytes_of_duration(0.00001) % 4, 0);
    }

    #[test]
    fn test_suggested_ring_buffer_bounds() {
        let format = AudioFormat::new(SampleKind::F32, 48000, 2);
        let lower = 2 * 1024 * 8;
        assert_eq!(format.suggested_ring_buffer(0.0), lower);
        assert_eq!(format.suggested_ring_buffer(1.0), format.bytes_of_duration(0.2));
        assert!(format.suggested_ring_buffer(4.0) > format.suggested_ring_buffer(1.0));
        assert_eq!(format.suggested_ring_buffer(1e9), 256 << 20);
    }

    #[test]
    fn test_reverse_frames_keeps_channels_together() {
        let format = AudioFormat::new(SampleKind::I16, 44100, 2);
        let mut data: Vec<u8> = (0u8..12).collect();
        format.reverse_frames(&mut data);
        assert_eq!(data, vec![8, 9, 10, 11, 4, 5, 6, 7, 0, 1, 2, 3]);
    }

    #[test]
    fn test_scale_volume_i16() {
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_ne_bytes());
        data.extend_from_slice(&(-30000i16).to_ne_bytes());
        SampleKind::I16.scale_volume(&mut data, 2.0);
        assert_eq!(i16::from_ne_bytes([data[0], data[1]]), 2000);
        assert_eq!(i16::from_ne_bytes([data[2], data[3]]), i16::MIN);
    }

    #[test]
    fn test_scale_volume_u8_centered() {
        let mut data = vec![128u8, 228, 28];
        SampleKind::U8.scale_volume(&mut data, 0.5);
        assert_eq!(data, vec![128, 178, 78]);
    }
}
