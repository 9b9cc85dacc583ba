//! Apple II Disk II ドライブエミュレーション
//!
//! Disk II hardware emulation based on "Beneath Apple DOS" documentation
//! DSK/DO/PO/NIB/2MG/WOZ形式のディスクイメージをサポート。
//! セクターイメージは挿入時に6-and-2ニブルストリームへ変換し、
//! 書き込みはストリームへ直接反映してダーティフラグを立てる。

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::io::Card;
use crate::savestate::{DiskState, DriveState};

/// ディスクの定数
pub const TRACKS: usize = 35;
pub const SECTORS_PER_TRACK: usize = 16;
pub const BYTES_PER_SECTOR: usize = 256;
pub const BYTES_PER_TRACK: usize = SECTORS_PER_TRACK * BYTES_PER_SECTOR;
pub const DSK_SIZE: usize = TRACKS * BYTES_PER_TRACK; // 143360 bytes

/// NIBフォーマットの定数
pub const NIB_TRACK_SIZE: usize = 6656;
pub const NIB_SIZE: usize = TRACKS * NIB_TRACK_SIZE;

/// クォータートラック分解能のヘッド位置範囲
pub const QUARTER_TRACKS: usize = 140;

/// モーターON時のニブル送り: 1ニブルあたりのCPUサイクル
/// (4マイクロ秒/ビット x 8ビット)
const CYCLES_PER_NIBBLE: u64 = 32;

/// WOZビットストリームの送り: 1ビットあたりのCPUサイクル
const CYCLES_PER_BIT: u64 = 4;

/// モーターOFF後の惰性回転サイクル数（約1秒）
const SPINNING_CYCLES: u32 = 1_023_000;

/// アドレスフィールドのデフォルトボリューム番号
const DEFAULT_VOLUME: u8 = 254;

/// 6-and-2エンコーディングテーブル
const WRITE_TABLE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// 物理セクター位置 -> 論理セクターのインターリーブ
const DOS_SECTOR_ORDER: [usize; 16] = [0, 7, 14, 6, 13, 5, 12, 4, 11, 3, 10, 2, 9, 1, 8, 15];
const PRODOS_SECTOR_ORDER: [usize; 16] = [0, 8, 1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15];

/// ステッパー移動テーブル（ハーフトラック単位）
/// PHASE_DELTA[現在フェーズ][励磁フェーズ] x 2 = クォータートラック移動量
const PHASE_DELTA: [[i32; 4]; 4] = [
    [0, 1, 2, -1],
    [-1, 0, 1, 2],
    [-2, -1, 0, 1],
    [1, -2, -1, 0],
];

/// ディスクイメージ形式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiskFormat {
    /// DOS 3.3セクター順 (.dsk/.do)
    Dsk,
    /// ProDOSセクター順 (.po)
    Po,
    /// 生ニブルトラック (.nib)
    Nib,
    /// ビットストリームトラックマップ (.woz)
    Woz,
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskFormat::Dsk => write!(f, "dsk"),
            DiskFormat::Po => write!(f, "po"),
            DiskFormat::Nib => write!(f, "nib"),
            DiskFormat::Woz => write!(f, "woz"),
        }
    }
}

/// 1トラック分のデータ
#[derive(Clone)]
enum TrackData {
    /// ニブル列（DSK/PO/NIB由来）
    Nibbles(Vec<u8>),
    /// ビット列（WOZ由来）
    Bits { data: Vec<u8>, bit_count: u32 },
    /// 未フォーマット
    Empty,
}

impl TrackData {
    fn len_nibbles(&self) -> usize {
        match self {
            TrackData::Nibbles(n) => n.len(),
            TrackData::Bits { bit_count, .. } => (*bit_count as usize) / 8,
            TrackData::Empty => 0,
        }
    }
}

/// シーケンサー機能（Q6/Q7の2ビットステートマシン）
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencerFunction {
    /// Q6L Q7L: 読み取りシーケンス
    ReadSequencing,
    /// Q6H Q7L: ライトプロテクト検出
    CheckWriteProtAndInitWrite,
    /// Q6L Q7H: データシフト書き込み
    DataShiftWrite,
    /// Q6H Q7H: データロード書き込み
    DataLoadWrite,
}

/// ドライブメタデータ（ホスト表示用）
#[derive(Debug, Clone, PartialEq)]
pub struct DiskMetadata {
    pub name: String,
    pub ext: String,
    pub read_only: bool,
    pub dirty: bool,
}

/// JSONディスク記述子
/// dataはbase64文字列、または tracks[track][sector] = [256バイト] のネスト配列
#[derive(Serialize, Deserialize)]
pub struct DiskDescriptor {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub encoding: String,
    pub data: serde_json::Value,
}

/// フロッピーディスクの状態
#[derive(Clone)]
pub struct FloppyDisk {
    pub name: String,
    pub ext: String,
    format: DiskFormat,
    /// トラックデータ（track_map経由で参照）
    tracks: Vec<TrackData>,
    /// クォータートラック -> トラックインデックス (0xFFFFは空)
    track_map: Vec<u16>,
    pub write_protected: bool,
    pub loaded: bool,
    pub dirty: bool,
    /// WOZ原本（エクスポート用にそのまま保持）
    raw: Option<Vec<u8>>,
}

impl FloppyDisk {
    fn empty() -> Self {
        FloppyDisk {
            name: String::new(),
            ext: String::new(),
            format: DiskFormat::Dsk,
            tracks: Vec::new(),
            track_map: vec![0xFFFF; QUARTER_TRACKS],
            write_protected: false,
            loaded: false,
            dirty: false,
            raw: None,
        }
    }

    /// 全トラックがニブル形式のトラックマップを構築
    fn nibble_track_map() -> Vec<u16> {
        let mut map = vec![0xFFFF; QUARTER_TRACKS];
        for (qt, entry) in map.iter_mut().enumerate() {
            let track = (qt / 4).min(TRACKS - 1);
            *entry = track as u16;
        }
        map
    }
}

/// フロッピードライブの状態
#[derive(Clone)]
pub struct FloppyDrive {
    pub disk: FloppyDisk,
    /// ヘッド位置（クォータートラック、0-139）
    pub quarter_track: i32,
    /// 最後に励磁されたフェーズ (0-3)
    phase: usize,
    /// 現トラック内のニブル位置
    pub head: usize,
    /// WOZトラック内のビット位置
    bit_pos: usize,
    /// 惰性回転カウンタ
    spinning: u32,
}

impl Default for FloppyDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl FloppyDrive {
    pub fn new() -> Self {
        FloppyDrive {
            disk: FloppyDisk::empty(),
            quarter_track: 0,
            phase: 0,
            head: 0,
            bit_pos: 0,
            spinning: 0,
        }
    }

    /// 現在の丸トラック番号 (0-34)
    pub fn current_track(&self) -> usize {
        (self.quarter_track as usize / 4).min(TRACKS - 1)
    }

    /// 現在のクォータートラックに対応するトラックデータ
    fn track(&self) -> &TrackData {
        static EMPTY: TrackData = TrackData::Empty;
        match self.track_index() {
            Some(idx) => &self.disk.tracks[idx],
            None => &EMPTY,
        }
    }

    fn track_index(&self) -> Option<usize> {
        let idx = self.disk.track_map[self.quarter_track as usize];
        if idx == 0xFFFF || idx as usize >= self.disk.tracks.len() {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// トラック変更後にヘッド位置を現トラック長に収める
    fn clamp_head(&mut self) {
        let len = self.track().len_nibbles();
        if len > 0 {
            self.head %= len;
            self.bit_pos %= len * 8;
        } else {
            self.head = 0;
            self.bit_pos = 0;
        }
    }
}

/// Disk IIインターフェースカード
pub struct Disk2 {
    pub drives: [FloppyDrive; 2],
    pub curr_drive: usize,
    /// データラッチ
    pub latch: u8,
    pub motor_on: bool,
    /// フェーズマグネット状態 (bit 0-3)
    pub magnet_states: u8,
    pub write_mode: bool,
    pub load_mode: bool,
    seq_func: SequencerFunction,
    /// 最後のラッチアクセスサイクル（ニブル送りの計時に使用）
    last_access_cycle: u64,
    /// Disk II P5ブートROM（外部ロード）
    pub boot_rom: [u8; 256],
}

impl Default for Disk2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk2 {
    pub fn new() -> Self {
        Disk2 {
            drives: [FloppyDrive::new(), FloppyDrive::new()],
            curr_drive: 0,
            latch: 0,
            motor_on: false,
            magnet_states: 0,
            write_mode: false,
            load_mode: false,
            seq_func: SequencerFunction::ReadSequencing,
            last_access_cycle: 0,
            boot_rom: [0; 256],
        }
    }

    /// リセット（ドライブのヘッド位置は保持、コントローラ状態のみ初期化）
    pub fn reset(&mut self) {
        self.latch = 0;
        self.motor_on = false;
        self.magnet_states = 0;
        self.write_mode = false;
        self.load_mode = false;
        self.seq_func = SequencerFunction::ReadSequencing;
        self.curr_drive = 0;
        self.last_access_cycle = 0;
        for drive in &mut self.drives {
            drive.spinning = 0;
        }
    }

    /// 外部ファイルからブートROMをロード
    pub fn load_boot_rom(&mut self, data: &[u8]) -> Result<(), &'static str> {
        if data.len() != 256 {
            return Err("Boot ROM must be exactly 256 bytes");
        }
        // Disk II P5 ROMは 0xA2 0x20 (LDX #$20) で始まる
        if data[0] != 0xA2 || data[1] != 0x20 {
            return Err("Invalid Disk II ROM signature");
        }
        self.boot_rom.copy_from_slice(data);
        Ok(())
    }

    pub fn is_rom_loaded(&self) -> bool {
        self.boot_rom[0] == 0xA2 && self.boot_rom[1] == 0x20
    }

    // ========================================
    // イメージの挿入と取り出し
    // ========================================

    /// ディスクイメージを挿入
    /// 認識できないレイアウトはエラーになり、ドライブは変更されない
    pub fn insert(
        &mut self,
        drive: usize,
        name: &str,
        ext: &str,
        data: &[u8],
    ) -> Result<(), &'static str> {
        if drive > 1 {
            return Err("Invalid drive number");
        }
        let disk = Self::build_disk(name, ext, data)?;
        self.drives[drive].disk = disk;
        self.drives[drive].head = 0;
        self.drives[drive].bit_pos = 0;
        log::info!("Drive {}: inserted {} ({})", drive + 1, name, ext);
        Ok(())
    }

    /// バイト列からFloppyDiskを構築（検証込み）
    fn build_disk(name: &str, ext: &str, data: &[u8]) -> Result<FloppyDisk, &'static str> {
        match ext {
            "dsk" | "do" => Self::build_sector_disk(name, ext, data, &DOS_SECTOR_ORDER, DiskFormat::Dsk),
            "po" => Self::build_sector_disk(name, ext, data, &PRODOS_SECTOR_ORDER, DiskFormat::Po),
            "nib" => {
                if data.len() != NIB_SIZE {
                    return Err("Invalid NIB file size");
                }
                let tracks = data
                    .chunks(NIB_TRACK_SIZE)
                    .map(|t| TrackData::Nibbles(t.to_vec()))
                    .collect();
                Ok(FloppyDisk {
                    name: name.to_string(),
                    ext: ext.to_string(),
                    format: DiskFormat::Nib,
                    tracks,
                    track_map: FloppyDisk::nibble_track_map(),
                    write_protected: false,
                    loaded: true,
                    dirty: false,
                    raw: None,
                })
            }
            "2mg" => {
                let (inner_ext, payload, locked) = parse_2mg(data)?;
                let mut disk = Self::build_disk(name, inner_ext, payload)?;
                disk.ext = "2mg".to_string();
                disk.write_protected |= locked;
                Ok(disk)
            }
            "woz" => {
                let (tracks, track_map, _info_protected) = parse_woz(data)?;
                Ok(FloppyDisk {
                    name: name.to_string(),
                    ext: ext.to_string(),
                    format: DiskFormat::Woz,
                    tracks,
                    track_map,
                    // WOZはビットストリームをそのまま保持するため書き込み禁止
                    write_protected: true,
                    loaded: true,
                    dirty: false,
                    raw: Some(data.to_vec()),
                })
            }
            _ => Err("Unknown disk image extension"),
        }
    }

    fn build_sector_disk(
        name: &str,
        ext: &str,
        data: &[u8],
        order: &[usize; 16],
        format: DiskFormat,
    ) -> Result<FloppyDisk, &'static str> {
        if data.len() != DSK_SIZE {
            return Err("Invalid sector image size");
        }
        let mut tracks = Vec::with_capacity(TRACKS);
        for track in 0..TRACKS {
            tracks.push(TrackData::Nibbles(nibblize_track(
                data,
                track,
                DEFAULT_VOLUME,
                order,
            )));
        }
        Ok(FloppyDisk {
            name: name.to_string(),
            ext: ext.to_string(),
            format,
            tracks,
            track_map: FloppyDisk::nibble_track_map(),
            write_protected: false,
            loaded: true,
            dirty: false,
            raw: None,
        })
    }

    /// ディスクをイジェクト
    pub fn eject(&mut self, drive: usize) {
        if drive <= 1 {
            self.drives[drive].disk = FloppyDisk::empty();
            self.drives[drive].head = 0;
            self.drives[drive].bit_pos = 0;
        }
    }

    /// ドライブのメタデータを取得
    pub fn metadata(&self, drive: usize) -> Option<DiskMetadata> {
        let disk = &self.drives.get(drive)?.disk;
        if !disk.loaded {
            return None;
        }
        Some(DiskMetadata {
            name: disk.name.clone(),
            ext: disk.ext.clone(),
            read_only: disk.write_protected,
            dirty: disk.dirty,
        })
    }

    /// ライトプロテクトを設定
    pub fn set_write_protected(&mut self, drive: usize, protected: bool) {
        if drive <= 1 && self.drives[drive].disk.format != DiskFormat::Woz {
            self.drives[drive].disk.write_protected = protected;
        }
    }

    /// 現在のディスク内容を元のイメージ形式で取り出す
    pub fn export(&self, drive: usize) -> Option<Vec<u8>> {
        let disk = &self.drives.get(drive)?.disk;
        if !disk.loaded {
            return None;
        }
        match disk.format {
            DiskFormat::Dsk => self.export_sectors(disk, &DOS_SECTOR_ORDER),
            DiskFormat::Po => self.export_sectors(disk, &PRODOS_SECTOR_ORDER),
            DiskFormat::Nib => {
                let mut out = Vec::with_capacity(NIB_SIZE);
                for track in &disk.tracks {
                    match track {
                        TrackData::Nibbles(n) => out.extend_from_slice(n),
                        _ => return None,
                    }
                }
                Some(out)
            }
            DiskFormat::Woz => disk.raw.clone(),
        }
    }

    /// ニブルストリームをデニブライズしてセクター順イメージへ戻す
    fn export_sectors(&self, disk: &FloppyDisk, order: &[usize; 16]) -> Option<Vec<u8>> {
        let mut out = vec![0u8; DSK_SIZE];
        for (track_no, track) in disk.tracks.iter().enumerate().take(TRACKS) {
            let nibbles = match track {
                TrackData::Nibbles(n) => n,
                _ => return None,
            };
            for physical in 0..SECTORS_PER_TRACK {
                let sector = denibblize_sector(nibbles, physical)?;
                let logical = order[physical];
                let offset = track_no * BYTES_PER_TRACK + logical * BYTES_PER_SECTOR;
                out[offset..offset + BYTES_PER_SECTOR].copy_from_slice(&sector);
            }
        }
        Some(out)
    }

    // ========================================
    // JSONディスク記述子
    // ========================================

    /// JSON記述子からディスクをロード
    pub fn insert_json(&mut self, drive: usize, json: &str) -> Result<(), &'static str> {
        let desc: DiskDescriptor =
            serde_json::from_str(json).map_err(|_| "Malformed disk descriptor")?;
        let ext = desc.disk_type.as_str();
        match desc.encoding.as_str() {
            "base64" => {
                let text = desc.data.as_str().ok_or("Descriptor data is not a string")?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map_err(|_| "Invalid base64 disk data")?;
                self.insert(drive, &desc.name, ext, &bytes)
            }
            "json" => {
                // tracks[track][sector] = [256バイト]
                let tracks: Vec<Vec<Vec<u8>>> =
                    serde_json::from_value(desc.data).map_err(|_| "Malformed track array")?;
                if tracks.len() != TRACKS {
                    return Err("Track array must contain 35 tracks");
                }
                let mut bytes = Vec::with_capacity(DSK_SIZE);
                for track in &tracks {
                    if track.len() != SECTORS_PER_TRACK {
                        return Err("Each track must contain 16 sectors");
                    }
                    for sector in track {
                        if sector.len() != BYTES_PER_SECTOR {
                            return Err("Each sector must contain 256 bytes");
                        }
                        bytes.extend_from_slice(sector);
                    }
                }
                self.insert(drive, &desc.name, ext, &bytes)
            }
            _ => Err("Unknown descriptor encoding"),
        }
    }

    /// 現在のディスクをJSON記述子として取り出す
    pub fn export_json(&self, drive: usize, pretty: bool) -> Option<String> {
        let disk = &self.drives.get(drive)?.disk;
        if !disk.loaded {
            return None;
        }
        let bytes = self.export(drive)?;
        let desc = DiskDescriptor {
            disk_type: disk.format.to_string(),
            name: disk.name.clone(),
            category: None,
            encoding: "base64".to_string(),
            data: serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(&bytes),
            ),
        };
        let result = if pretty {
            serde_json::to_string_pretty(&desc)
        } else {
            serde_json::to_string(&desc)
        };
        result.ok()
    }

    // ========================================
    // ソフトスイッチ ($C0E0-$C0EF相対)
    // ========================================

    /// シーケンサー機能を更新（Q6/Q7）
    fn update_sequencer_function(&mut self, reg: u8) {
        match reg {
            0x0C => self.load_mode = false,
            0x0D => self.load_mode = true,
            0x0E => self.write_mode = false,
            0x0F => self.write_mode = true,
            _ => return,
        }
        self.seq_func = match (self.write_mode, self.load_mode) {
            (false, false) => SequencerFunction::ReadSequencing,
            (false, true) => SequencerFunction::CheckWriteProtAndInitWrite,
            (true, false) => SequencerFunction::DataShiftWrite,
            (true, true) => SequencerFunction::DataLoadWrite,
        };
    }

    /// モーター制御
    fn control_motor(&mut self, on: bool) {
        if !on && self.motor_on {
            // 惰性回転（即座には止まらない）
            self.drives[self.curr_drive].spinning = SPINNING_CYCLES;
        }
        self.motor_on = on;
        if !on {
            self.magnet_states = 0;
        }
    }

    /// ドライブ選択
    fn enable_drive(&mut self, drive: usize) {
        if drive != self.curr_drive {
            self.drives[self.curr_drive].spinning = 0;
            self.curr_drive = drive;
        }
    }

    /// ステッパーモーター制御
    /// 隣接フェーズの励磁でハーフトラック（2クォータートラック）移動する
    fn control_stepper(&mut self, reg: u8) {
        let phase = ((reg >> 1) & 3) as usize;
        let on = (reg & 1) != 0;
        let bit = 1u8 << phase;

        if on {
            self.magnet_states |= bit;
        } else {
            self.magnet_states &= !bit;
        }

        if !on {
            return;
        }
        let drive = &mut self.drives[self.curr_drive];
        let delta = PHASE_DELTA[drive.phase][phase] * 2;
        if delta != 0 {
            drive.quarter_track =
                (drive.quarter_track + delta).clamp(0, QUARTER_TRACKS as i32 - 1);
            drive.clamp_head();
        }
        drive.phase = phase;
    }

    /// ライトプロテクト状態をラッチへロード (Q6H)
    fn sense_write_protect(&mut self) {
        if self.drives[self.curr_drive].disk.write_protected {
            self.latch |= 0x80;
        } else {
            self.latch &= 0x7F;
        }
    }

    /// データラッチの読み書き (Q6L)
    /// モーターON時、経過サイクルに応じてニブルストリームを送る
    fn read_write_nibble(&mut self, cycles: u64) {
        let elapsed = cycles.saturating_sub(self.last_access_cycle);
        self.last_access_cycle = cycles;

        let drive = &mut self.drives[self.curr_drive];
        if !drive.disk.loaded {
            self.latch = 0xFF;
            return;
        }
        if !self.motor_on && drive.spinning == 0 {
            return;
        }
        if drive.spinning > 0 {
            drive.spinning = drive.spinning.saturating_sub(elapsed.min(u32::MAX as u64) as u32);
        }

        if !self.write_mode {
            if matches!(drive.track(), TrackData::Bits { .. }) {
                self.latch = Self::read_woz_nibble(drive, elapsed);
                return;
            }
            let len = drive.track().len_nibbles();
            if len == 0 {
                self.latch = 0xFF;
                return;
            }
            // 32サイクルごとに1ニブル送る（最低1ニブル）
            let advance = ((elapsed / CYCLES_PER_NIBBLE).max(1) as usize).min(len);
            drive.head = (drive.head + advance) % len;
            if let TrackData::Nibbles(data) = drive.track() {
                self.latch = data[drive.head];
            }
        } else {
            // 書き込みモード
            if drive.disk.write_protected {
                return;
            }
            let head = drive.head;
            let latch = self.latch;
            if let Some(idx) = drive.track_index() {
                if let TrackData::Nibbles(data) = &mut drive.disk.tracks[idx] {
                    if !data.is_empty() {
                        data[head] = latch;
                        drive.head = (head + 1) % data.len();
                        drive.disk.dirty = true;
                    }
                }
            }
        }
    }

    /// WOZビットストリームから次のニブルを読む
    /// MSBが立つまでビットをシフトレジスタへ送る簡易シーケンサー
    fn read_woz_nibble(drive: &mut FloppyDrive, elapsed: u64) -> u8 {
        let idx = match drive.track_index() {
            Some(idx) => idx,
            None => return 0xFF,
        };
        let (data, bit_count) = match &drive.disk.tracks[idx] {
            TrackData::Bits { data, bit_count } => (data, *bit_count as usize),
            _ => return 0xFF,
        };
        if bit_count == 0 {
            return 0xFF;
        }

        // 経過時間ぶんビット位置を進める
        let skip = (elapsed / CYCLES_PER_BIT) as usize;
        let mut pos = (drive.bit_pos + skip) % bit_count;

        let mut shift: u8 = 0;
        for _ in 0..bit_count {
            let bit = (data[pos / 8] >> (7 - (pos % 8))) & 1;
            pos = (pos + 1) % bit_count;
            shift = (shift << 1) | bit;
            if shift & 0x80 != 0 {
                break;
            }
        }
        drive.bit_pos = pos;
        shift
    }

    /// 現在選択中ドライブのステータス（ホスト表示用）
    pub fn drive_status(&self, drive: usize) -> (bool, bool, usize) {
        let d = &self.drives[drive];
        (
            d.disk.loaded,
            self.motor_on && self.curr_drive == drive,
            d.current_track(),
        )
    }

    // ========================================
    // セーブステート
    // ========================================

    pub fn save_state(&self) -> DiskState {
        let drive_state = |d: &FloppyDrive| DriveState {
            loaded: d.disk.loaded,
            write_protected: d.disk.write_protected,
            quarter_track: d.quarter_track,
            head: d.head,
            dirty: d.disk.dirty,
            // 変更されたニブルデータのみスナップショットに含める
            tracks: if d.disk.dirty {
                Some(
                    d.disk
                        .tracks
                        .iter()
                        .map(|t| match t {
                            TrackData::Nibbles(n) => n.clone(),
                            _ => Vec::new(),
                        })
                        .collect(),
                )
            } else {
                None
            },
        };
        DiskState {
            curr_drive: self.curr_drive,
            motor_on: self.motor_on,
            latch: self.latch,
            write_mode: self.write_mode,
            magnet_states: self.magnet_states,
            drives: [drive_state(&self.drives[0]), drive_state(&self.drives[1])],
        }
    }

    pub fn load_state(&mut self, state: &DiskState) {
        self.curr_drive = state.curr_drive;
        self.motor_on = state.motor_on;
        self.latch = state.latch;
        self.write_mode = state.write_mode;
        self.magnet_states = state.magnet_states;
        for (drive, saved) in self.drives.iter_mut().zip(state.drives.iter()) {
            drive.quarter_track = saved.quarter_track.clamp(0, QUARTER_TRACKS as i32 - 1);
            drive.head = saved.head;
            drive.disk.write_protected = saved.write_protected;
            drive.disk.dirty = saved.dirty;
            if let Some(tracks) = &saved.tracks {
                for (slot, data) in drive.disk.tracks.iter_mut().zip(tracks.iter()) {
                    if !data.is_empty() {
                        *slot = TrackData::Nibbles(data.clone());
                    }
                }
            }
            drive.clamp_head();
        }
    }
}

impl Card for Disk2 {
    fn io_read(&mut self, offset: u8, cycles: u64) -> u8 {
        let reg = offset & 0x0F;
        if reg >= 0x0C {
            self.update_sequencer_function(reg);
        }

        match reg {
            0x00..=0x07 => self.control_stepper(reg),
            0x08 => self.control_motor(false),
            0x09 => self.control_motor(true),
            0x0A => self.enable_drive(0),
            0x0B => self.enable_drive(1),
            0x0C => self.read_write_nibble(cycles),
            0x0D => self.sense_write_protect(),
            0x0E => self.read_write_nibble(cycles),
            0x0F => {}
            _ => {}
        }

        // 偶数レジスタのみラッチが見える
        if reg & 1 == 0 {
            self.latch
        } else {
            0xFF
        }
    }

    fn io_write(&mut self, offset: u8, value: u8, cycles: u64) {
        let reg = offset & 0x0F;
        if reg >= 0x0C {
            self.update_sequencer_function(reg);
        }

        match reg {
            0x00..=0x07 => self.control_stepper(reg),
            0x08 => self.control_motor(false),
            0x09 => self.control_motor(true),
            0x0A => self.enable_drive(0),
            0x0B => self.enable_drive(1),
            0x0C => self.read_write_nibble(cycles),
            0x0D => self.sense_write_protect(),
            0x0E => self.read_write_nibble(cycles),
            0x0F => {}
            _ => {}
        }

        if self.seq_func == SequencerFunction::DataLoadWrite {
            self.latch = value;
        }
    }

    fn rom_read(&mut self, offset: u8) -> u8 {
        self.boot_rom[offset as usize]
    }
}

// ========================================
// 6-and-2ニブライズ
// ========================================

/// 4-and-4エンコード（奇数ビット、偶数ビットの2バイト）
fn encode_44(value: u8) -> (u8, u8) {
    ((value >> 1) | 0xAA, value | 0xAA)
}

/// 1物理セクターをニブルストリームへ展開する
/// アドレスフィールド、データフィールド、エピローグ、シンクギャップを含む
pub fn explode_sector16(volume: u8, track: u8, sector: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(400);

    // アドレスフィールド
    out.extend_from_slice(&[0xD5, 0xAA, 0x96]);
    let (v1, v2) = encode_44(volume);
    out.extend_from_slice(&[v1, v2]);
    let (t1, t2) = encode_44(track);
    out.extend_from_slice(&[t1, t2]);
    let (s1, s2) = encode_44(sector);
    out.extend_from_slice(&[s1, s2]);
    let (c1, c2) = encode_44(volume ^ track ^ sector);
    out.extend_from_slice(&[c1, c2]);
    out.extend_from_slice(&[0xDE, 0xAA, 0xEB]);

    // GAP2
    out.extend_from_slice(&[0xFF; 6]);

    // データフィールド
    out.extend_from_slice(&[0xD5, 0xAA, 0xAD]);
    out.extend_from_slice(&encode_6and2(data));
    out.extend_from_slice(&[0xDE, 0xAA, 0xEB]);

    // GAP3
    out.extend_from_slice(&[0xFF; 27]);

    out
}

/// 1トラックをニブライズする
fn nibblize_track(dsk: &[u8], track: usize, volume: u8, order: &[usize; 16]) -> Vec<u8> {
    let mut nib = Vec::with_capacity(NIB_TRACK_SIZE);

    // GAP1 - トラック先頭の同期バイト
    nib.extend_from_slice(&[0xFF; 48]);

    for physical in 0..SECTORS_PER_TRACK {
        let logical = order[physical];
        let offset = track * BYTES_PER_TRACK + logical * BYTES_PER_SECTOR;
        nib.extend_from_slice(&explode_sector16(
            volume,
            track as u8,
            physical as u8,
            &dsk[offset..offset + BYTES_PER_SECTOR],
        ));
    }

    // トラック長を揃える（残りはシンクバイト）
    nib.resize(NIB_TRACK_SIZE, 0xFF);
    nib
}

/// 6-and-2エンコーディング
/// 256バイト -> 342バイト + チェックサム1バイト
fn encode_6and2(data: &[u8]) -> Vec<u8> {
    let mut nib = [0u8; 0x156];

    // 下位2ビットを86バイトの補助バッファへ集める（D1,D0はスワップされて入る）
    let mut idx2 = 0x55usize;
    for idx6 in (0..0x102usize).rev() {
        let mut val6 = data[idx6 % 0x100];
        let mut val2 = nib[idx2];
        val2 = (val2 << 1) | (val6 & 1);
        val6 >>= 1;
        val2 = (val2 << 1) | (val6 & 1);
        val6 >>= 1;
        nib[0x56 + idx6 % 0x100] = val6;
        nib[idx2] = val2;
        idx2 = if idx2 == 0 { 0x55 } else { idx2 - 1 };
    }

    // XORチェーンをかけてディスクニブルへ変換
    let mut out = Vec::with_capacity(343);
    let mut last = 0u8;
    for &val in nib.iter() {
        out.push(WRITE_TABLE[((val ^ last) & 0x3F) as usize]);
        last = val;
    }
    out.push(WRITE_TABLE[(last & 0x3F) as usize]);
    out
}

/// 6-and-2デコードテーブル（WRITE_TABLEの逆引き）
fn build_detrans() -> [u8; 256] {
    let mut table = [0xFFu8; 256];
    for (i, &code) in WRITE_TABLE.iter().enumerate() {
        table[code as usize] = i as u8;
    }
    table
}

/// 343バイトのニブル列を256バイトへデコードする
fn decode_6and2(stream: &[u8]) -> Option<[u8; 256]> {
    if stream.len() < 343 {
        return None;
    }
    let detrans = build_detrans();

    let mut nib = [0u8; 0x156];
    let mut last = 0u8;
    for (i, slot) in nib.iter_mut().enumerate() {
        let code = detrans[stream[i] as usize];
        if code == 0xFF {
            return None;
        }
        *slot = code ^ last;
        last = *slot;
    }
    // チェックサム照合
    let checksum = detrans[stream[0x156] as usize];
    if checksum == 0xFF || checksum != (last & 0x3F) {
        return None;
    }

    let mut sector = [0u8; 256];
    for j in 0..0x56 {
        let bits = nib[j];
        sector[j] = (nib[0x56 + j] << 2) | ((bits & 0x01) << 1) | ((bits & 0x02) >> 1);
        let k = j + 0x56;
        sector[k] = (nib[0x56 + k] << 2) | ((bits & 0x04) >> 1) | ((bits & 0x08) >> 3);
        let k = j + 0xAC;
        if k < 0x100 {
            sector[k] = (nib[0x56 + k] << 2) | ((bits & 0x10) >> 3) | ((bits & 0x20) >> 5);
        }
    }
    Some(sector)
}

/// トラックのニブル列から指定物理セクターのデータをデコードする
fn denibblize_sector(nibbles: &[u8], target_sector: usize) -> Option<[u8; 256]> {
    let len = nibbles.len();
    let mut pos = 0;
    while pos + 10 < len {
        // アドレスフィールドマーカー (D5 AA 96)
        if nibbles[pos] == 0xD5 && nibbles[pos + 1] == 0xAA && nibbles[pos + 2] == 0x96 {
            let sector_odd = nibbles[pos + 7];
            let sector_even = nibbles[pos + 8];
            let sector = ((sector_odd << 1) | 0x01) & sector_even;
            if sector as usize == target_sector {
                // データフィールドマーカー (D5 AA AD) を探す
                let mut data_pos = pos + 10;
                while data_pos + 346 <= len {
                    if nibbles[data_pos] == 0xD5
                        && nibbles[data_pos + 1] == 0xAA
                        && nibbles[data_pos + 2] == 0xAD
                    {
                        return decode_6and2(&nibbles[data_pos + 3..]);
                    }
                    data_pos += 1;
                }
                return None;
            }
        }
        pos += 1;
    }
    None
}

// ========================================
// コンテナ形式
// ========================================

/// 2IMGコンテナをパースして内側のフォーマットとペイロードを返す
fn parse_2mg(data: &[u8]) -> Result<(&'static str, &[u8], bool), &'static str> {
    if data.len() < 64 || &data[0..4] != b"2IMG" {
        return Err("Not a 2IMG container");
    }
    let format = u32::from_le_bytes([data[0x0C], data[0x0D], data[0x0E], data[0x0F]]);
    let flags = u32::from_le_bytes([data[0x10], data[0x11], data[0x12], data[0x13]]);
    let offset = u32::from_le_bytes([data[0x18], data[0x19], data[0x1A], data[0x1B]]) as usize;
    let length = u32::from_le_bytes([data[0x1C], data[0x1D], data[0x1E], data[0x1F]]) as usize;

    if offset + length > data.len() {
        return Err("2IMG data range out of bounds");
    }
    let ext = match format {
        0 => "do",
        1 => "po",
        2 => "nib",
        _ => return Err("Unknown 2IMG format code"),
    };
    let locked = flags & 0x8000_0000 != 0;
    Ok((ext, &data[offset..offset + length], locked))
}

/// WOZイメージをパースしてトラックデータとTMAPを返す
/// WOZ1/WOZ2のINFO/TMAP/TRKSチャンクに対応
fn parse_woz(data: &[u8]) -> Result<(Vec<TrackData>, Vec<u16>, bool), &'static str> {
    if data.len() < 12 {
        return Err("WOZ image truncated");
    }
    let woz2 = match &data[0..4] {
        b"WOZ1" => false,
        b"WOZ2" => true,
        _ => return Err("Not a WOZ image"),
    };
    if data[4..8] != [0xFF, 0x0A, 0x0D, 0x0A] {
        return Err("Malformed WOZ header");
    }

    let mut write_protected = false;
    let mut tmap: Option<&[u8]> = None;
    let mut trks: Option<&[u8]> = None;

    let mut pos = 12;
    while pos + 8 <= data.len() {
        let id = &data[pos..pos + 4];
        let size =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;
        let start = pos + 8;
        if start + size > data.len() {
            return Err("Malformed WOZ chunk");
        }
        let chunk = &data[start..start + size];
        match id {
            b"INFO" => {
                if chunk.len() >= 3 {
                    write_protected = chunk[2] != 0;
                }
            }
            b"TMAP" => tmap = Some(chunk),
            b"TRKS" => trks = Some(chunk),
            _ => {} // META等は読み飛ばす
        }
        pos = start + size;
    }

    let tmap = tmap.ok_or("WOZ image has no TMAP chunk")?;
    let trks = trks.ok_or("WOZ image has no TRKS chunk")?;
    if tmap.len() < QUARTER_TRACKS {
        return Err("WOZ TMAP chunk too short");
    }

    let mut track_map = vec![0xFFFFu16; QUARTER_TRACKS];
    let mut max_index = 0usize;
    for qt in 0..QUARTER_TRACKS {
        if tmap[qt] != 0xFF {
            track_map[qt] = tmap[qt] as u16;
            max_index = max_index.max(tmap[qt] as usize);
        }
    }

    let mut tracks = vec![TrackData::Empty; max_index + 1];
    if woz2 {
        // TRKS: 160エントリ x 8バイト {start_block, block_count, bit_count}
        for (i, slot) in tracks.iter_mut().enumerate() {
            let entry = i * 8;
            if entry + 8 > trks.len() {
                return Err("WOZ TRKS chunk too short");
            }
            let start_block = u16::from_le_bytes([trks[entry], trks[entry + 1]]) as usize;
            let bit_count = u32::from_le_bytes([
                trks[entry + 4],
                trks[entry + 5],
                trks[entry + 6],
                trks[entry + 7],
            ]);
            if bit_count == 0 {
                continue;
            }
            let byte_len = bit_count.div_ceil(8) as usize;
            let file_offset = start_block * 512;
            if file_offset + byte_len > data.len() {
                return Err("WOZ track data out of bounds");
            }
            *slot = TrackData::Bits {
                data: data[file_offset..file_offset + byte_len].to_vec(),
                bit_count,
            };
        }
    } else {
        // WOZ1 TRKS: 各トラック6656バイト (6646データ + bytes_used + bit_count + ...)
        for (i, slot) in tracks.iter_mut().enumerate() {
            let entry = i * 6656;
            if entry + 6656 > trks.len() {
                return Err("WOZ TRKS chunk too short");
            }
            let track = &trks[entry..entry + 6656];
            let bit_count = u16::from_le_bytes([track[6648], track[6649]]) as u32;
            if bit_count == 0 {
                continue;
            }
            *slot = TrackData::Bits {
                data: track[..6646].to_vec(),
                bit_count,
            };
        }
    }

    Ok((tracks, track_map, write_protected))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// パターンで埋めたテストイメージ
    fn test_image() -> Vec<u8> {
        let mut data = vec![0u8; DSK_SIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = ((i * 7) ^ (i >> 8)) as u8;
        }
        data
    }

    #[test]
    fn test_explode_sector_layout() {
        let sector = [0u8; 256];
        let nib = explode_sector16(254, 0, 0, &sector);
        // アドレス14 + GAP2 6 + データ349 + GAP3 27
        assert_eq!(nib.len(), 396);
        assert_eq!(&nib[0..3], &[0xD5, 0xAA, 0x96]);
        assert_eq!(&nib[14..20], &[0xFF; 6]);
        assert_eq!(&nib[20..23], &[0xD5, 0xAA, 0xAD]);
        // すべてのニブルはMSBが立つ
        assert!(nib.iter().all(|&b| b & 0x80 != 0));
    }

    #[test]
    fn test_encode_decode_6and2() {
        let mut data = [0u8; 256];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i ^ 0x5A) as u8;
        }
        let encoded = encode_6and2(&data);
        assert_eq!(encoded.len(), 343);
        let decoded = decode_6and2(&encoded).expect("decode failed");
        assert_eq!(decoded[..], data[..]);
    }

    #[test]
    fn test_nibblize_denibblize_roundtrip() {
        let image = test_image();
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &image).unwrap();
        let exported = disk2.export(0).expect("export failed");
        assert_eq!(exported.len(), DSK_SIZE);
        assert_eq!(exported, image);
    }

    #[test]
    fn test_prodos_order_roundtrip() {
        let image = test_image();
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "po", &image).unwrap();
        let exported = disk2.export(0).expect("export failed");
        assert_eq!(exported, image);
    }

    #[test]
    fn test_invalid_image_leaves_drive_unchanged() {
        let image = test_image();
        let mut disk2 = Disk2::new();
        disk2.insert(0, "good", "dsk", &image).unwrap();
        let err = disk2.insert(0, "bad", "dsk", &[0u8; 1000]);
        assert!(err.is_err());
        assert_eq!(disk2.metadata(0).unwrap().name, "good");
        let err2 = disk2.insert(0, "bad", "xyz", &image);
        assert!(err2.is_err());
        assert_eq!(disk2.metadata(0).unwrap().name, "good");
    }

    #[test]
    fn test_nib_image() {
        let mut nib = vec![0xFFu8; NIB_SIZE];
        nib[0] = 0xD5;
        let mut disk2 = Disk2::new();
        disk2.insert(0, "raw", "nib", &nib).unwrap();
        let exported = disk2.export(0).unwrap();
        assert_eq!(exported, nib);
    }

    #[test]
    fn test_stepper_quarter_tracks() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        disk2.io_read(0x09, 0); // motor on
        // フェーズ0 -> 1 -> 2 -> 3 と順に励磁すると内周へ3ハーフトラック移動
        disk2.io_read(0x01, 0); // phase0 on
        disk2.io_read(0x03, 10); // phase1 on
        disk2.io_read(0x00, 20); // phase0 off
        disk2.io_read(0x05, 30); // phase2 on
        disk2.io_read(0x02, 40); // phase1 off
        disk2.io_read(0x07, 50); // phase3 on
        assert_eq!(disk2.drives[0].quarter_track, 6);
        assert_eq!(disk2.drives[0].current_track(), 1);
        // 逆方向
        disk2.io_read(0x05, 60); // phase2 on
        assert_eq!(disk2.drives[0].quarter_track, 4);
    }

    #[test]
    fn test_stepper_clamped_at_track0() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        disk2.io_read(0x09, 0);
        // 外周方向へ動かし続けてもトラック0で止まる
        disk2.io_read(0x01, 0); // phase0
        disk2.io_read(0x07, 10); // phase3 (逆方向)
        disk2.io_read(0x05, 20); // phase2
        assert_eq!(disk2.drives[0].quarter_track, 0);
    }

    #[test]
    fn test_read_nibbles_with_motor() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        disk2.io_read(0x09, 0); // motor on
        // 最初の読み取りはGAP1のシンクバイト
        let nibble = disk2.io_read(0x0C, 100);
        assert_eq!(nibble, 0xFF);
        // 読み続ければアドレスマーカーが現れる
        let mut seen_d5 = false;
        let mut cycles = 100;
        for _ in 0..NIB_TRACK_SIZE {
            cycles += 32;
            if disk2.io_read(0x0C, cycles) == 0xD5 {
                seen_d5 = true;
                break;
            }
        }
        assert!(seen_d5);
    }

    #[test]
    fn test_motor_off_no_data() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        let before = disk2.drives[0].head;
        disk2.io_read(0x0C, 100);
        assert_eq!(disk2.drives[0].head, before); // モーターOFFでは進まない
    }

    #[test]
    fn test_write_nibble_marks_dirty() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        disk2.io_read(0x09, 0); // motor on
        disk2.io_read(0x0D, 10); // Q6H
        disk2.io_read(0x0F, 20); // Q7H: write mode
        disk2.io_write(0x0D, 0xD5, 30); // ラッチへロード
        disk2.io_write(0x0C, 0x00, 62); // 書き込み実行
        assert!(disk2.drives[0].disk.dirty);
        assert!(disk2.metadata(0).unwrap().dirty);
    }

    #[test]
    fn test_write_protect_sense() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        disk2.set_write_protected(0, true);
        disk2.io_read(0x09, 0);
        let status = disk2.io_read(0x0D, 10); // Q6H: WPセンス
        // 奇数レジスタなのでラッチは見えないが、ラッチのbit7は立っている
        assert_eq!(status, 0xFF);
        assert_eq!(disk2.latch & 0x80, 0x80);
        disk2.set_write_protected(0, false);
        disk2.io_read(0x0D, 20);
        assert_eq!(disk2.latch & 0x80, 0x00);
    }

    #[test]
    fn test_2mg_container() {
        let image = test_image();
        let mut container = vec![0u8; 64];
        container[0..4].copy_from_slice(b"2IMG");
        container[0x0C] = 0; // DOS order
        container[0x18..0x1C].copy_from_slice(&64u32.to_le_bytes());
        container[0x1C..0x20].copy_from_slice(&(DSK_SIZE as u32).to_le_bytes());
        container.extend_from_slice(&image);

        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "2mg", &container).unwrap();
        let meta = disk2.metadata(0).unwrap();
        assert_eq!(meta.ext, "2mg");
        let exported = disk2.export(0).unwrap();
        assert_eq!(exported, image);
    }

    #[test]
    fn test_woz_rejected_when_malformed() {
        let mut disk2 = Disk2::new();
        assert!(disk2.insert(0, "bad", "woz", b"WOZ2xxxx").is_err());
        assert!(disk2.metadata(0).is_none());
    }

    #[test]
    fn test_json_descriptor_base64() {
        let image = test_image();
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &image).unwrap();
        let json = disk2.export_json(0, false).unwrap();

        let mut disk2b = Disk2::new();
        disk2b.insert_json(1, &json).unwrap();
        assert_eq!(disk2b.export(1).unwrap(), image);
    }

    #[test]
    fn test_json_descriptor_nested_arrays() {
        let image = test_image();
        let tracks: Vec<Vec<Vec<u8>>> = (0..TRACKS)
            .map(|t| {
                (0..SECTORS_PER_TRACK)
                    .map(|s| {
                        let offset = t * BYTES_PER_TRACK + s * BYTES_PER_SECTOR;
                        image[offset..offset + BYTES_PER_SECTOR].to_vec()
                    })
                    .collect()
            })
            .collect();
        let desc = DiskDescriptor {
            disk_type: "dsk".to_string(),
            name: "nested".to_string(),
            category: None,
            encoding: "json".to_string(),
            data: serde_json::to_value(&tracks).unwrap(),
        };
        let json = serde_json::to_string(&desc).unwrap();

        let mut disk2 = Disk2::new();
        disk2.insert_json(0, &json).unwrap();
        assert_eq!(disk2.export(0).unwrap(), image);
    }

    #[test]
    fn test_save_state_includes_dirty_tracks() {
        let mut disk2 = Disk2::new();
        disk2.insert(0, "test", "dsk", &test_image()).unwrap();
        let clean = disk2.save_state();
        assert!(clean.drives[0].tracks.is_none());

        disk2.io_read(0x09, 0);
        disk2.io_read(0x0F, 10);
        disk2.io_write(0x0D, 0xAB, 20);
        disk2.io_write(0x0C, 0x00, 52);
        let dirty = disk2.save_state();
        assert!(dirty.drives[0].tracks.is_some());
    }
}
