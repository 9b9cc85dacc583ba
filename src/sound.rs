//! Apple II サウンドエミュレーション (1bit Speaker)
//!
//! コアが出力するスピーカートグルのサイクルタイムスタンプ列を、
//! サンプル窓ごとの面積平均（矩形波の時間加重平均）でホストのPCMへ
//! リサンプルする。窓内のトグルはサブサンプル精度で反映されるため
//! 追加のローパスは不要で、直流成分は1次のDCブロッカーで除去する。

use std::collections::VecDeque;

#[cfg(feature = "audio")]
use std::sync::{Arc, Mutex};

/// サンプルレート (Hz)
pub const SAMPLE_RATE: u32 = 44100;

/// DCブロッカーの帰還係数
const DC_FEEDBACK: f32 = 0.9995;

/// DC成分が減衰しきったとみなす閾値
const SETTLE_THRESHOLD: f32 = 1e-4;

/// 保持するトグルイベントの上限（1フレーム分の最悪ケースを超える余裕）
const EVENT_LIMIT: usize = 32768;

/// 再生キューに保持する最大サンプル数（約100ms）
#[cfg(feature = "audio")]
const MAX_QUEUED_SAMPLES: usize = 4410;

/// Apple IIスピーカーのPCM合成器
///
/// トグルイベント列をクロック周波数に応じたサンプル数のPCMへ変換する
pub struct Speaker {
    /// 未消費のトグルイベント（サイクルタイムスタンプ）
    events: VecDeque<u64>,
    enabled: bool,
    /// ボリューム (0.0 - 1.0)
    volume: f32,
    /// 現在のDACレベル (+1.0 / -1.0)
    level: f32,
    /// DCブロッカーの前回入力/出力
    dc_in: f32,
    dc_out: f32,
    /// サンプル生成用バッファ（再利用）
    buffer: Vec<f32>,
}

impl Default for Speaker {
    fn default() -> Self {
        Self::new()
    }
}

impl Speaker {
    pub fn new() -> Self {
        Speaker {
            events: VecDeque::with_capacity(4096),
            enabled: true,
            volume: 0.3,
            level: -1.0,
            dc_in: 0.0,
            dc_out: 0.0,
            buffer: Vec::new(),
        }
    }

    /// コアから取り出したトグルイベントを投入する
    pub fn push_events(&mut self, events: &[u64]) {
        for &cycle in events {
            self.events.push_back(cycle);
        }
        while self.events.len() > EVENT_LIMIT {
            self.events.pop_front();
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// base_cycleからcyclesサイクル分のPCMサンプルを生成する
    /// サンプル数はクロック周波数(kHz)から決まる。無音が整定していればNone
    pub fn generate_samples(&mut self, base_cycle: u64, cycles: u64, khz: u32) -> Option<&[f32]> {
        if !self.enabled || cycles == 0 || khz == 0 {
            return None;
        }
        if self.events.is_empty() && self.dc_out.abs() < SETTLE_THRESHOLD {
            return None;
        }

        let cycles_per_sample = (khz as f64 * 1000.0) / SAMPLE_RATE as f64;
        let count = (cycles as f64 / cycles_per_sample) as usize;
        if count == 0 {
            return None;
        }

        self.buffer.clear();
        self.buffer.reserve(count);
        let mut window_start = base_cycle as f64;

        for _ in 0..count {
            let window_end = window_start + cycles_per_sample;

            // 窓内のトグルを時間加重で平均する
            let mut edge = window_start;
            let mut area = 0.0f64;
            while let Some(&event) = self.events.front() {
                let event = event as f64;
                if event >= window_end {
                    break;
                }
                if event > edge {
                    area += self.level as f64 * (event - edge);
                    edge = event;
                }
                // 窓より前のイベントはレベル反転のみ
                self.level = -self.level;
                self.events.pop_front();
            }
            area += self.level as f64 * (window_end - edge);
            let raw = (area / cycles_per_sample) as f32;

            // 1次DCブロッカー: y[n] = x[n] - x[n-1] + R*y[n-1]
            let out = raw - self.dc_in + DC_FEEDBACK * self.dc_out;
            self.dc_in = raw;
            self.dc_out = out;
            self.buffer.push(out * self.volume);

            window_start = window_end;
        }

        Some(&self.buffer)
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.level = -1.0;
        self.dc_in = 0.0;
        self.dc_out = 0.0;
    }
}

// ============================================================
// オーディオ出力（rodioが有効な場合のみ）
// ============================================================

#[cfg(feature = "audio")]
use rodio::{OutputStream, Sink, Source};

/// rodioへサンプルを送る共有キュー
/// 生成側がpush、再生スレッドがpopし、枯渇時は無音を出す
#[cfg(feature = "audio")]
pub struct AudioOutput {
    _stream: OutputStream,
    _sink: Sink,
    queue: Arc<Mutex<VecDeque<f32>>>,
}

#[cfg(feature = "audio")]
struct QueueSource {
    queue: Arc<Mutex<VecDeque<f32>>>,
}

#[cfg(feature = "audio")]
impl Iterator for QueueSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = match self.queue.lock() {
            Ok(mut queue) => queue.pop_front().unwrap_or(0.0),
            Err(_) => 0.0,
        };
        Some(sample)
    }
}

#[cfg(feature = "audio")]
impl Source for QueueSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        1
    }
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
    fn total_duration(&self) -> Option<std::time::Duration> {
        None
    }
}

#[cfg(feature = "audio")]
impl AudioOutput {
    pub fn new() -> Result<Self, String> {
        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to create audio output: {}", e))?;

        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| format!("Failed to create audio sink: {}", e))?;

        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_QUEUED_SAMPLES)));
        sink.append(QueueSource {
            queue: Arc::clone(&queue),
        });

        Ok(AudioOutput {
            _stream: stream,
            _sink: sink,
            queue,
        })
    }

    /// 生成済みサンプルを再生キューへ送る
    /// キューが溜まりすぎた場合は古いサンプルから捨てる
    pub fn play_samples(&mut self, samples: Option<&[f32]>) {
        let samples = match samples {
            Some(samples) => samples,
            None => return,
        };
        if let Ok(mut queue) = self.queue.lock() {
            for &sample in samples {
                queue.push_back(sample);
            }
            while queue.len() > MAX_QUEUED_SAMPLES {
                queue.pop_front();
            }
        }
    }
}

// ============================================================
// スタブ実装（rodioが無効な場合）
// ============================================================

#[cfg(not(feature = "audio"))]
pub struct AudioOutput {
    _dummy: (),
}

#[cfg(not(feature = "audio"))]
impl AudioOutput {
    pub fn new() -> Result<Self, String> {
        Ok(AudioOutput { _dummy: () })
    }
    pub fn play_samples(&mut self, _samples: Option<&[f32]>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_without_events() {
        let mut speaker = Speaker::new();
        assert!(speaker.generate_samples(0, 17030, 1023).is_none());
    }

    #[test]
    fn test_sample_count_follows_clock() {
        let mut speaker = Speaker::new();
        speaker.push_events(&[10]);
        // 102300サイクル @ 1023kHz = 0.1秒 -> 約4410サンプル
        let samples = speaker.generate_samples(0, 102_300, 1023).expect("no samples");
        assert!((4409..=4410).contains(&samples.len()));
        // 高速クロックでは同じサイクル数が短い実時間になる
        let mut speaker2 = Speaker::new();
        speaker2.push_events(&[10]);
        let samples2 = speaker2
            .generate_samples(0, 102_300, 4092)
            .expect("no samples");
        assert!((1101..=1103).contains(&samples2.len()));
    }

    #[test]
    fn test_toggle_produces_nonzero_output() {
        let mut speaker = Speaker::new();
        // 約1kHzの矩形波相当のトグル列
        let events: Vec<u64> = (0..32).map(|i| 1000 + i * 500).collect();
        speaker.push_events(&events);
        let samples = speaker.generate_samples(0, 17030, 1023).expect("no samples");
        assert!(samples.iter().any(|&s| s.abs() > 0.01));
        // ボリュームで振幅は抑えられている
        assert!(samples.iter().all(|&s| s.abs() <= 1.0));
    }

    #[test]
    fn test_events_consumed_across_windows() {
        let mut speaker = Speaker::new();
        speaker.push_events(&[100, 20000]);
        speaker.generate_samples(0, 17030, 1023);
        // 2個目のイベントは次のフレームまで残る
        assert_eq!(speaker.events.len(), 1);
        speaker.generate_samples(17030, 17030, 1023);
        assert!(speaker.events.is_empty());
    }

    #[test]
    fn test_dc_blocker_settles_to_silence() {
        let mut speaker = Speaker::new();
        speaker.push_events(&[10]);
        // イベント消費後、定常レベルはDCブロッカーで減衰して無音に戻る
        let mut base = 0u64;
        let mut settled = false;
        for _ in 0..120 {
            if speaker.generate_samples(base, 17030, 1023).is_none() {
                settled = true;
                break;
            }
            base += 17030;
        }
        assert!(settled);
    }
}
