//! セーブステート機能
//!
//! エミュレータの状態を保存・復元する。バージョン不一致の復元は拒否され、
//! 直前の状態が維持される。

use serde::{Deserialize, Serialize};

/// CPUレジスタと割り込みラインの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CpuState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,
    pub total_cycles: u64,
    pub irq_pending: bool,
    pub nmi_pending: bool,
    /// 保留中のRESETライン（次の命令境界で処理される）
    pub reset_pending: bool,
    /// NMIエッジ検出の内部状態
    pub nmi_edge_detected: bool,
    pub prev_nmi: bool,
}

/// MMUの状態（セーブ用）
/// バンクラッチは16ビットのラッチベクターで完全に復元できる
#[derive(Serialize, Deserialize, Clone)]
pub struct MmuState {
    /// ソフトスイッチのラッチベクター
    pub switches: u16,
    pub main_ram: Vec<u8>,
    pub aux_ram: Vec<u8>,
    pub lc_ram: Vec<u8>,
    pub lc_bank2: Vec<u8>,
    pub aux_lc_ram: Vec<u8>,
    pub aux_lc_bank2: Vec<u8>,
    pub scanline: u16,
}

/// I/Oペリフェラルの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone)]
pub struct IoState {
    pub keyboard_latch: u8,
    pub any_key_down: bool,
    pub paddles: [u8; 4],
    pub paddle_trigger_cycle: u64,
    pub buttons: [bool; 3],
    pub annunciators: [bool; 4],
    pub cassette_out: bool,
    pub khz: u32,
}

/// ディスクドライブの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone)]
pub struct DriveState {
    pub loaded: bool,
    pub write_protected: bool,
    /// ヘッド位置（クォータートラック）
    pub quarter_track: i32,
    /// 現トラック内のニブル位置
    pub head: usize,
    pub dirty: bool,
    /// 変更されている場合のみトラックデータを含む
    pub tracks: Option<Vec<Vec<u8>>>,
}

/// Disk IIコントローラの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone)]
pub struct DiskState {
    pub curr_drive: usize,
    pub motor_on: bool,
    pub latch: u8,
    pub write_mode: bool,
    pub magnet_states: u8,
    pub drives: [DriveState; 2],
}

/// ビデオの状態（セーブ用）
#[derive(Serialize, Deserialize, Clone)]
pub struct VideoState {
    pub flash_state: bool,
    pub flash_counter: u32,
    pub monochrome: bool,
}

/// 完全なエミュレータ状態
#[derive(Serialize, Deserialize, Clone)]
pub struct SaveState {
    /// セーブフォーマットのバージョン
    pub version: u32,
    pub cpu: CpuState,
    pub mmu: MmuState,
    pub io: IoState,
    pub disk: DiskState,
    pub video: VideoState,
    pub frames: u64,
    pub rendered_frames: u64,
}

impl SaveState {
    pub const CURRENT_VERSION: u32 = 1;
}
