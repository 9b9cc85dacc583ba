//! I/Oペリフェラル状態
//!
//! キーボード、スピーカー、パドル、アナンシエータ、カセットと
//! スロットカードのインターフェースを保持する。アドレスデコードはMMU側。

use std::collections::VecDeque;

/// パドルタイマー: 1カウントあたりのCPUサイクル数
/// フルスケール256カウントで約2816サイクル（実測値）
pub const PADDLE_CYCLES_PER_COUNT: u64 = 11;

/// スピーカーイベントバッファの上限（1フレーム分の最悪ケースを超える余裕）
const SPEAKER_EVENT_LIMIT: usize = 32768;

/// 標準クロック (kHz)
pub const KHZ_DEFAULT: u32 = 1023;
/// 高速クロック (kHz)
pub const KHZ_ACCELERATED: u32 = 4092;

/// 周辺スロットカードのインターフェース
///
/// $C090-$C0FFのデバイスセレクトI/Oと$Cn00-$CnFFのスロットROMを提供する
pub trait Card {
    /// デバイスセレクト領域の読み取り（offsetはスロット内0-15）
    fn io_read(&mut self, offset: u8, cycles: u64) -> u8;
    /// デバイスセレクト領域への書き込み
    fn io_write(&mut self, offset: u8, value: u8, cycles: u64);
    /// スロットROM ($Cn00-$CnFF) の読み取り
    fn rom_read(&mut self, offset: u8) -> u8;
}

/// I/Oペリフェラルの状態
pub struct Io {
    /// キーボードラッチ（bit7 = ストローブ）
    pub keyboard_latch: u8,
    /// キーが押下されたままか（$C010のbit7）
    pub any_key_down: bool,
    /// ペーストバッファ
    key_buffer: VecDeque<u8>,
    /// スピーカートグルのサイクルタイムスタンプ
    speaker_events: Vec<u64>,
    /// パドル位置 (0-255, 128が中央)
    pub paddles: [u8; 4],
    /// パドルタイマーのトリガーサイクル
    pub paddle_trigger_cycle: u64,
    /// ボタン0-2 (Open-Apple / Closed-Apple / Shift mod)
    pub buttons: [bool; 3],
    /// アナンシエータ出力
    pub annunciators: [bool; 4],
    /// カセット出力トグル
    pub cassette_out: bool,
    /// カセット入力レベル
    pub cassette_in: bool,
    /// 目標クロック周波数 (kHz)
    pub khz: u32,
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

impl Io {
    pub fn new() -> Self {
        Io {
            keyboard_latch: 0,
            any_key_down: false,
            key_buffer: VecDeque::new(),
            speaker_events: Vec::with_capacity(4096),
            paddles: [128; 4],
            paddle_trigger_cycle: 0,
            buttons: [false; 3],
            annunciators: [false; 4],
            cassette_out: false,
            cassette_in: false,
            khz: KHZ_DEFAULT,
        }
    }

    /// キー押下（bit7を立ててラッチに格納）
    pub fn key_down(&mut self, code: u8) {
        self.keyboard_latch = code | 0x80;
        self.any_key_down = true;
    }

    /// キー解放
    pub fn key_up(&mut self) {
        self.any_key_down = false;
    }

    /// テキストをキーストロークとしてキューに積む
    /// 改行はキャリッジリターンに変換される
    pub fn set_key_buffer(&mut self, text: &str) {
        for ch in text.chars() {
            let code = match ch {
                '\n' | '\r' => 0x0D,
                c if c.is_ascii() => c as u8,
                _ => continue,
            };
            self.key_buffer.push_back(code);
        }
        // 前のキーが消費済みなら即座に最初のキーを供給
        if self.keyboard_latch & 0x80 == 0 {
            self.pump_key_buffer();
        }
    }

    /// ストローブ消費後にバッファから次のキーを供給
    pub fn pump_key_buffer(&mut self) {
        if let Some(code) = self.key_buffer.pop_front() {
            self.keyboard_latch = code | 0x80;
        }
    }

    /// $C000: キーボードデータ読み取り
    pub fn read_keyboard(&self) -> u8 {
        self.keyboard_latch
    }

    /// $C010: ストローブクリア
    /// IIeではbit7にany-key-down、下位に最後のキーを返す
    pub fn clear_strobe(&mut self) -> u8 {
        let result = (self.keyboard_latch & 0x7F) | if self.any_key_down { 0x80 } else { 0x00 };
        self.keyboard_latch &= 0x7F;
        self.pump_key_buffer();
        result
    }

    /// $C030: スピーカートグル
    /// アクセスごとに1bit DACが反転し、サイクルスタンプ付きイベントを記録
    pub fn toggle_speaker(&mut self, cycles: u64) {
        if self.speaker_events.len() < SPEAKER_EVENT_LIMIT {
            self.speaker_events.push(cycles);
        }
    }

    /// 蓄積したスピーカーイベントを取り出してクリア
    pub fn drain_speaker_events(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.speaker_events)
    }

    /// パドル位置を設定 (0.0 - 1.0)
    pub fn set_paddle(&mut self, n: usize, value: f32) {
        if n < 4 {
            self.paddles[n] = (value.clamp(0.0, 1.0) * 255.0) as u8;
        }
    }

    /// ボタン状態を設定
    pub fn set_button(&mut self, n: usize, pressed: bool) {
        if n < 3 {
            self.buttons[n] = pressed;
        }
    }

    /// $C070: パドルタイマーをトリガー
    pub fn trigger_paddles(&mut self, cycles: u64) {
        self.paddle_trigger_cycle = cycles;
    }

    /// $C064-$C067: パドルタイマー読み取り
    /// トリガーから位置×11サイクル経過するまでbit7=1
    pub fn read_paddle(&self, n: usize, cycles: u64) -> u8 {
        let timeout = self.paddles[n & 3] as u64 * PADDLE_CYCLES_PER_COUNT;
        let elapsed = cycles.saturating_sub(self.paddle_trigger_cycle);
        if elapsed < timeout {
            0x80
        } else {
            0x00
        }
    }

    /// $C061-$C063: ボタン読み取り
    pub fn read_button(&self, n: usize) -> u8 {
        if self.buttons[n % 3] {
            0x80
        } else {
            0x00
        }
    }

    /// $C058-$C05F: アナンシエータ設定（アドレスの偶奇がoff/on）
    pub fn set_annunciator(&mut self, n: usize, on: bool) {
        self.annunciators[n & 3] = on;
    }

    /// アナンシエータ状態を取得
    pub fn annunciator(&self, n: usize) -> bool {
        self.annunciators[n & 3]
    }

    /// 目標クロック周波数を設定 (kHz)
    pub fn update_khz(&mut self, khz: u32) {
        if khz > 0 {
            self.khz = khz;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strobe() {
        let mut io = Io::new();
        io.key_down(0x41); // 'A'
        assert_eq!(io.read_keyboard(), 0xC1);
        io.clear_strobe();
        assert_eq!(io.read_keyboard(), 0x41); // bit7クリア
    }

    #[test]
    fn test_key_buffer_pump() {
        let mut io = Io::new();
        io.set_key_buffer("AB\n");
        assert_eq!(io.read_keyboard(), 0xC1); // 'A'
        io.clear_strobe();
        assert_eq!(io.read_keyboard(), 0xC2); // 'B'
        io.clear_strobe();
        assert_eq!(io.read_keyboard(), 0x8D); // CR
        io.clear_strobe();
        assert_eq!(io.read_keyboard(), 0x0D); // バッファ空
    }

    #[test]
    fn test_paddle_timer() {
        let mut io = Io::new();
        io.set_paddle(0, 1.0); // 255 -> 2805サイクル
        io.trigger_paddles(1000);
        assert_eq!(io.read_paddle(0, 1000), 0x80);
        assert_eq!(io.read_paddle(0, 1000 + 2804), 0x80);
        assert_eq!(io.read_paddle(0, 1000 + 2805), 0x00);

        io.set_paddle(0, 0.0);
        io.trigger_paddles(5000);
        assert_eq!(io.read_paddle(0, 5000), 0x00); // 即タイムアウト
    }

    #[test]
    fn test_speaker_events() {
        let mut io = Io::new();
        io.toggle_speaker(100);
        io.toggle_speaker(200);
        let events = io.drain_speaker_events();
        assert_eq!(events, vec![100, 200]);
        assert!(io.drain_speaker_events().is_empty());
    }

    #[test]
    fn test_update_khz() {
        let mut io = Io::new();
        assert_eq!(io.khz, 1023);
        io.update_khz(4092);
        assert_eq!(io.khz, 4092);
        io.update_khz(0); // 不正値は無視
        assert_eq!(io.khz, 4092);
    }
}
