//! Apple II / IIe メモリ管理ユニット
//!
//! 全256ページを担当する単一のページハンドラとして実装する。
//! テーブルの書き換えではなく、アクセスごとにラッチ状態で内部分岐するため、
//! 状態スナップショットは16ビットのラッチベクターだけで復元できる。

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::bus::PageHandler;
use crate::io::{Card, Io};
use crate::video::VideoDirty;

bitflags! {
    /// バンク切り替えソフトスイッチのラッチベクター
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Switches: u16 {
        const TEXT        = 1 << 0;
        const MIXED       = 1 << 1;
        const PAGE2       = 1 << 2;
        const HIRES       = 1 << 3;
        const COL80       = 1 << 4;
        const ALTCHAR     = 1 << 5;
        const STORE80     = 1 << 6;
        const RAMRD       = 1 << 7;
        const RAMWRT      = 1 << 8;
        const ALTZP       = 1 << 9;
        const INTCXROM    = 1 << 10;
        const SLOTC3ROM   = 1 << 11;
        const LC_BANK2    = 1 << 12;
        const LC_READ     = 1 << 13;
        const LC_WRITE    = 1 << 14;
        const LC_PREWRITE = 1 << 15;
    }
}

impl Default for Switches {
    fn default() -> Self {
        // 起動時はテキストモード、言語カードはROM読み取り
        Switches::TEXT
    }
}

/// Apple IIのモデル
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppleModel {
    AppleII,
    AppleIIPlus,
    AppleIIe,
    AppleIIeEnhanced,
}

impl AppleModel {
    pub fn is_iie(self) -> bool {
        matches!(self, AppleModel::AppleIIe | AppleModel::AppleIIeEnhanced)
    }
}

/// VBL期間の開始スキャンライン
const VBL_SCANLINE: u16 = 192;

/// メモリ管理ユニット（メインボード）
///
/// メイン/補助RAM、言語カード、ROM、I/O、スロットカードへの
/// ルーティングをすべて担当する
pub struct Mmu {
    pub model: AppleModel,
    main_ram: Box<[u8; 65536]>,
    aux_ram: Box<[u8; 65536]>,
    /// 言語カードRAM（$D000バンク1 + $E000-$FFFF）
    lc_ram: Box<[u8; 16384]>,
    /// 言語カード $D000 バンク2
    lc_bank2: Box<[u8; 4096]>,
    /// 補助バンクの言語カード（ALTZP選択時）
    aux_lc_ram: Box<[u8; 16384]>,
    aux_lc_bank2: Box<[u8; 4096]>,
    /// $C000-$FFFFをカバーする16KB ROMイメージ
    rom: Vec<u8>,
    pub switches: Switches,
    pub io: Io,
    slots: Vec<Option<Rc<RefCell<dyn Card>>>>,
    /// 現在のCPUサイクル（マシンが命令境界ごとに更新）
    pub cycles: u64,
    /// 現在のスキャンライン（VBL検出用）
    pub scanline: u16,
    pub dirty: VideoDirty,
}

impl Mmu {
    pub fn new(model: AppleModel) -> Self {
        Mmu {
            model,
            main_ram: Box::new([0; 65536]),
            aux_ram: Box::new([0; 65536]),
            lc_ram: Box::new([0; 16384]),
            lc_bank2: Box::new([0; 4096]),
            aux_lc_ram: Box::new([0; 16384]),
            aux_lc_bank2: Box::new([0; 4096]),
            rom: Vec::new(),
            switches: Switches::default(),
            io: Io::new(),
            slots: vec![None; 8],
            cycles: 0,
            scanline: 0,
            dirty: VideoDirty::new(),
        }
    }

    pub fn is_iie(&self) -> bool {
        self.model.is_iie()
    }

    /// スロットにカードを装着（slot 1-7）
    pub fn set_slot(&mut self, slot: usize, card: Rc<RefCell<dyn Card>>) {
        if (1..8).contains(&slot) {
            self.slots[slot] = Some(card);
        }
    }

    /// ソフトスイッチをリセット（電源投入状態）
    pub fn reset_switches(&mut self) {
        self.switches = Switches::default();
        self.dirty.mark_mode();
    }

    /// ラッチベクターを取得（セーブステート用）
    pub fn latch_vector(&self) -> u16 {
        self.switches.bits()
    }

    /// ラッチベクターから復元
    pub fn set_latch_vector(&mut self, bits: u16) {
        self.switches = Switches::from_bits_truncate(bits);
        self.dirty.mark_mode();
    }

    /// フレーム境界でランループから呼ばれる
    pub fn reset_vbl(&mut self) {
        self.scanline = VBL_SCANLINE;
    }

    pub fn main_ram(&self) -> &[u8] {
        &self.main_ram[..]
    }

    pub fn aux_ram(&self) -> &[u8] {
        &self.aux_ram[..]
    }

    pub fn main_ram_mut(&mut self) -> &mut [u8] {
        &mut self.main_ram[..]
    }

    pub fn aux_ram_mut(&mut self) -> &mut [u8] {
        &mut self.aux_ram[..]
    }

    /// 言語カードの全バンクをセーブステート用に取り出す
    pub fn lc_banks(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        (
            self.lc_ram.to_vec(),
            self.lc_bank2.to_vec(),
            self.aux_lc_ram.to_vec(),
            self.aux_lc_bank2.to_vec(),
        )
    }

    /// 言語カードの全バンクを復元
    pub fn restore_lc_banks(&mut self, lc: &[u8], bank2: &[u8], aux_lc: &[u8], aux_bank2: &[u8]) {
        if lc.len() == 16384 {
            self.lc_ram.copy_from_slice(lc);
        }
        if bank2.len() == 4096 {
            self.lc_bank2.copy_from_slice(bank2);
        }
        if aux_lc.len() == 16384 {
            self.aux_lc_ram.copy_from_slice(aux_lc);
        }
        if aux_bank2.len() == 4096 {
            self.aux_lc_bank2.copy_from_slice(aux_bank2);
        }
    }

    /// ROMをロード
    /// サイズに応じて$C000-$FFFFの16KBスペースに配置する
    /// 2KB:  $F800-$FFFF (ミニROM)
    /// 12KB: $D000-$FFFF (Apple II/II+ ROM)
    /// 16KB: $C000-$FFFF (フルROM)
    /// 20KB: Apple II Plus ROMパッケージ (Disk II Boot ROM + Autostart Monitor)
    /// 32KB: Apple IIe ROM (後半16KBがメインROM)
    pub fn load_rom(&mut self, rom_data: &[u8]) {
        match rom_data.len() {
            2048 => {
                self.rom = vec![0xFF; 16384];
                self.rom[0x3800..].copy_from_slice(rom_data);
            }
            12288 => {
                self.rom = vec![0xFF; 16384];
                self.rom[0x1000..].copy_from_slice(rom_data);
            }
            16384 => {
                self.rom = rom_data.to_vec();
            }
            20480 => {
                // $0600-$06FF: Disk II P5 Boot ROM → $C600
                // $2000-$4FFF: Autostart Monitor ROM (12KB) → $D000-$FFFF
                self.rom = vec![0xFF; 16384];
                self.rom[0x0600..0x0700].copy_from_slice(&rom_data[0x0600..0x0700]);
                self.rom[0x1000..].copy_from_slice(&rom_data[0x2000..0x5000]);
                log::info!("Loaded 20KB Apple II Plus ROM package");
            }
            32768 => {
                // 後半16KB ($4000-$7FFF) がメインROM
                self.rom = rom_data[0x4000..0x8000].to_vec();
                if self.rom[0x0600] != 0xA2 && rom_data[0x0600] == 0xA2 {
                    // Disk II Boot ROMが前半にしかない場合はコピー
                    self.rom[0x0600..0x0700].copy_from_slice(&rom_data[0x0600..0x0700]);
                }
                log::info!("Loaded 32KB Apple IIe ROM");
            }
            _ => {
                log::warn!("Unknown ROM size: {} bytes", rom_data.len());
                self.rom = rom_data.to_vec();
            }
        }
        if self.rom.len() == 16384 {
            log::info!(
                "Reset vector: ${:02X}{:02X}",
                self.rom[0x3FFD],
                self.rom[0x3FFC]
            );
        }
    }

    /// 内部ROM読み取り（$C000-$FFFF相当のオフセット）
    fn rom_read(&self, address: u16) -> u8 {
        let offset = (address - 0xC000) as usize;
        if offset < self.rom.len() {
            self.rom[offset]
        } else {
            0xFF
        }
    }

    /// アドレスからメモリを読み取り
    pub fn read_addr(&mut self, address: u16) -> u8 {
        match address {
            0x0000..=0x01FF => {
                if self.is_iie() && self.switches.contains(Switches::ALTZP) {
                    self.aux_ram[address as usize]
                } else {
                    self.main_ram[address as usize]
                }
            }
            0x0200..=0xBFFF => {
                let aux = self.read_goes_aux(address);
                if aux {
                    self.aux_ram[address as usize]
                } else {
                    self.main_ram[address as usize]
                }
            }
            0xC000..=0xC0FF => self.read_c0xx(address as u8),
            0xC100..=0xCFFF => self.read_cx_rom(address),
            0xD000..=0xFFFF => self.read_high(address),
        }
    }

    /// アドレスへメモリ書き込み
    pub fn write_addr(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x01FF => {
                if self.is_iie() && self.switches.contains(Switches::ALTZP) {
                    self.aux_ram[address as usize] = value;
                } else {
                    self.main_ram[address as usize] = value;
                }
            }
            0x0200..=0xBFFF => {
                let aux = self.write_goes_aux(address);
                if aux {
                    self.aux_ram[address as usize] = value;
                } else {
                    self.main_ram[address as usize] = value;
                }
                self.dirty.mark_write(address);
            }
            0xC000..=0xC0FF => self.write_c0xx(address as u8, value),
            0xC100..=0xCFFF => {} // スロット/内部ROMへの書き込みは破棄
            0xD000..=0xFFFF => self.write_high(address, value),
        }
    }

    /// $0200-$BFFFの読み取りが補助バンクへ向かうか
    fn read_goes_aux(&self, address: u16) -> bool {
        if !self.is_iie() {
            return false;
        }
        // 80STOREセット時、表示ページはPAGE2が直接バンクを選ぶ
        if self.switches.contains(Switches::STORE80) {
            if (0x0400..=0x07FF).contains(&address) {
                return self.switches.contains(Switches::PAGE2);
            }
            if self.switches.contains(Switches::HIRES) && (0x2000..=0x3FFF).contains(&address) {
                return self.switches.contains(Switches::PAGE2);
            }
        }
        self.switches.contains(Switches::RAMRD)
    }

    /// $0200-$BFFFの書き込みが補助バンクへ向かうか
    fn write_goes_aux(&self, address: u16) -> bool {
        if !self.is_iie() {
            return false;
        }
        if self.switches.contains(Switches::STORE80) {
            if (0x0400..=0x07FF).contains(&address) {
                return self.switches.contains(Switches::PAGE2);
            }
            if self.switches.contains(Switches::HIRES) && (0x2000..=0x3FFF).contains(&address) {
                return self.switches.contains(Switches::PAGE2);
            }
        }
        self.switches.contains(Switches::RAMWRT)
    }

    /// $D000-$FFFFの読み取り（言語カード/ROM）
    fn read_high(&self, address: u16) -> u8 {
        if !self.switches.contains(Switches::LC_READ) {
            return self.rom_read(address);
        }
        let alt = self.is_iie() && self.switches.contains(Switches::ALTZP);
        match address {
            0xD000..=0xDFFF => {
                if self.switches.contains(Switches::LC_BANK2) {
                    let bank = if alt { &self.aux_lc_bank2 } else { &self.lc_bank2 };
                    bank[(address - 0xD000) as usize]
                } else {
                    let lc = if alt { &self.aux_lc_ram } else { &self.lc_ram };
                    lc[(address - 0xD000) as usize]
                }
            }
            _ => {
                let lc = if alt { &self.aux_lc_ram } else { &self.lc_ram };
                lc[(address - 0xD000) as usize]
            }
        }
    }

    /// $D000-$FFFFへの書き込み（言語カードRAMのみ）
    fn write_high(&mut self, address: u16, value: u8) {
        if !self.switches.contains(Switches::LC_WRITE) {
            return;
        }
        let alt = self.is_iie() && self.switches.contains(Switches::ALTZP);
        match address {
            0xD000..=0xDFFF => {
                if self.switches.contains(Switches::LC_BANK2) {
                    let bank = if alt {
                        &mut self.aux_lc_bank2
                    } else {
                        &mut self.lc_bank2
                    };
                    bank[(address - 0xD000) as usize] = value;
                } else {
                    let lc = if alt { &mut self.aux_lc_ram } else { &mut self.lc_ram };
                    lc[(address - 0xD000) as usize] = value;
                }
            }
            _ => {
                let lc = if alt { &mut self.aux_lc_ram } else { &mut self.lc_ram };
                lc[(address - 0xD000) as usize] = value;
            }
        }
    }

    /// $C100-$CFFF: スロットROM / 内部ROM
    fn read_cx_rom(&mut self, address: u16) -> u8 {
        let page = (address >> 8) as u8;
        if self.is_iie() {
            if self.switches.contains(Switches::INTCXROM) {
                return self.rom_read(address);
            }
            if page == 0xC3 && !self.switches.contains(Switches::SLOTC3ROM) {
                return self.rom_read(address);
            }
            if page >= 0xC8 {
                // 拡張ROM領域は内部ROMで近似
                return self.rom_read(address);
            }
        }
        let slot = (page - 0xC0) as usize;
        if slot < 8 {
            if let Some(card) = self.slots[slot].clone() {
                return card.borrow_mut().rom_read(address as u8);
            }
        }
        if !self.is_iie() && self.rom.len() == 16384 {
            // II+の20KBパッケージROMはスロットROMも内包する
            return self.rom_read(address);
        }
        0xFF
    }

    /// 言語カードソフトスイッチ ($C080-$C08F)
    /// 奇数アドレスへの連続読み取り2回で書き込みが有効になる
    fn language_card(&mut self, off: u8, is_read: bool) {
        let x = off & 0x0F;
        self.switches.set(Switches::LC_BANK2, x & 0x08 == 0);
        let low = x & 0x03;
        self.switches
            .set(Switches::LC_READ, low == 0x00 || low == 0x03);
        if x & 0x01 == 0 {
            self.switches.remove(Switches::LC_WRITE);
            self.switches.remove(Switches::LC_PREWRITE);
        } else if is_read {
            if self.switches.contains(Switches::LC_PREWRITE) {
                self.switches.insert(Switches::LC_WRITE);
            }
            self.switches.insert(Switches::LC_PREWRITE);
        } else {
            self.switches.remove(Switches::LC_PREWRITE);
        }
    }

    /// ビデオモードラッチ ($C050-$C05F)
    /// アドレスの偶奇がoff/onに対応する
    fn video_switch(&mut self, off: u8) {
        let old = self.switches;
        match off {
            0x50 => self.switches.remove(Switches::TEXT),
            0x51 => self.switches.insert(Switches::TEXT),
            0x52 => self.switches.remove(Switches::MIXED),
            0x53 => self.switches.insert(Switches::MIXED),
            0x54 => self.switches.remove(Switches::PAGE2),
            0x55 => self.switches.insert(Switches::PAGE2),
            0x56 => self.switches.remove(Switches::HIRES),
            0x57 => self.switches.insert(Switches::HIRES),
            0x58..=0x5F => {
                let n = ((off - 0x58) >> 1) as usize;
                let on = off & 1 != 0;
                if self.io.annunciator(n) != on {
                    self.io.set_annunciator(n, on);
                    // AN0は補助スクリーンのレンダーヒント
                    if n == 0 {
                        self.dirty.mark_mode();
                    }
                }
            }
            _ => {}
        }
        if self.switches != old {
            self.dirty.mark_mode();
        }
    }

    /// ラッチ状態をbit7に、最後のキーを下位7ビットに載せる
    fn status_bit(&self, on: bool) -> u8 {
        let low = self.io.keyboard_latch & 0x7F;
        if on {
            0x80 | low
        } else {
            low
        }
    }

    /// $C000-$C0FFの読み取り
    fn read_c0xx(&mut self, off: u8) -> u8 {
        let iie = self.is_iie();
        match off {
            0x00..=0x0F => self.io.read_keyboard(),
            0x10 => self.io.clear_strobe(),
            0x11 if iie => self.status_bit(self.switches.contains(Switches::LC_BANK2)),
            0x12 if iie => self.status_bit(self.switches.contains(Switches::LC_READ)),
            0x13 if iie => self.status_bit(self.switches.contains(Switches::RAMRD)),
            0x14 if iie => self.status_bit(self.switches.contains(Switches::RAMWRT)),
            0x15 if iie => self.status_bit(self.switches.contains(Switches::INTCXROM)),
            0x16 if iie => self.status_bit(self.switches.contains(Switches::ALTZP)),
            0x17 if iie => self.status_bit(self.switches.contains(Switches::SLOTC3ROM)),
            0x18 if iie => self.status_bit(self.switches.contains(Switches::STORE80)),
            0x19 if iie => {
                // RDVBL: 表示期間中はbit7=1、VBL期間中は0
                if self.scanline >= VBL_SCANLINE {
                    0x00
                } else {
                    0x80
                }
            }
            0x1A if iie => self.status_bit(self.switches.contains(Switches::TEXT)),
            0x1B if iie => self.status_bit(self.switches.contains(Switches::MIXED)),
            0x1C if iie => self.status_bit(self.switches.contains(Switches::PAGE2)),
            0x1D if iie => self.status_bit(self.switches.contains(Switches::HIRES)),
            0x1E if iie => self.status_bit(self.switches.contains(Switches::ALTCHAR)),
            0x1F if iie => self.status_bit(self.switches.contains(Switches::COL80)),
            0x11..=0x1F => self.io.clear_strobe(),
            0x20..=0x2F => {
                self.io.cassette_out = !self.io.cassette_out;
                0x00
            }
            0x30..=0x3F => {
                self.io.toggle_speaker(self.cycles);
                0x00
            }
            0x40..=0x4F => 0x00,
            0x50..=0x5F => {
                self.video_switch(off);
                0x00
            }
            0x60 | 0x68 => {
                if self.io.cassette_in {
                    0x80
                } else {
                    0x00
                }
            }
            0x61..=0x63 => self.io.read_button((off - 0x61) as usize),
            0x64..=0x67 => self.io.read_paddle((off - 0x64) as usize, self.cycles),
            0x69..=0x6B => self.io.read_button((off - 0x69) as usize),
            0x6C..=0x6F => self.io.read_paddle((off - 0x6C) as usize, self.cycles),
            0x70..=0x7F => {
                self.io.trigger_paddles(self.cycles);
                0x00
            }
            0x80..=0x8F => {
                self.language_card(off, true);
                0x00
            }
            0x90..=0xFF => {
                let slot = ((off >> 4) - 8) as usize;
                if let Some(card) = self.slots[slot].clone() {
                    card.borrow_mut().io_read(off & 0x0F, self.cycles)
                } else {
                    0xFF
                }
            }
        }
    }

    /// $C000-$C0FFへの書き込み
    fn write_c0xx(&mut self, off: u8, value: u8) {
        let iie = self.is_iie();
        match off {
            // IIe 80列カード/バンクスイッチ（書き込みで動作）
            0x00 if iie => self.set_bank_switch(Switches::STORE80, false),
            0x01 if iie => self.set_bank_switch(Switches::STORE80, true),
            0x02 if iie => self.switches.remove(Switches::RAMRD),
            0x03 if iie => self.switches.insert(Switches::RAMRD),
            0x04 if iie => self.switches.remove(Switches::RAMWRT),
            0x05 if iie => self.switches.insert(Switches::RAMWRT),
            0x06 if iie => self.switches.remove(Switches::INTCXROM),
            0x07 if iie => self.switches.insert(Switches::INTCXROM),
            0x08 if iie => self.switches.remove(Switches::ALTZP),
            0x09 if iie => self.switches.insert(Switches::ALTZP),
            0x0A if iie => self.switches.remove(Switches::SLOTC3ROM),
            0x0B if iie => self.switches.insert(Switches::SLOTC3ROM),
            0x0C if iie => self.set_bank_switch(Switches::COL80, false),
            0x0D if iie => self.set_bank_switch(Switches::COL80, true),
            0x0E if iie => self.set_bank_switch(Switches::ALTCHAR, false),
            0x0F if iie => self.set_bank_switch(Switches::ALTCHAR, true),
            0x10..=0x1F => {
                let _ = self.io.clear_strobe();
            }
            0x20..=0x2F => self.io.cassette_out = !self.io.cassette_out,
            0x30..=0x3F => self.io.toggle_speaker(self.cycles),
            0x50..=0x5F => self.video_switch(off),
            0x70..=0x7F => self.io.trigger_paddles(self.cycles),
            0x80..=0x8F => self.language_card(off, false),
            0x90..=0xFF => {
                let slot = ((off >> 4) - 8) as usize;
                if let Some(card) = self.slots[slot].clone() {
                    card.borrow_mut().io_write(off & 0x0F, value, self.cycles);
                }
            }
            _ => {}
        }
    }

    /// 表示にも影響するバンクスイッチの更新
    fn set_bank_switch(&mut self, flag: Switches, on: bool) {
        let old = self.switches;
        self.switches.set(flag, on);
        if self.switches != old {
            self.dirty.mark_mode();
        }
    }
}

impl PageHandler for Mmu {
    fn start(&self) -> u8 {
        0x00
    }

    fn end(&self) -> u8 {
        0xFF
    }

    fn read(&mut self, page: u8, offset: u8) -> u8 {
        self.read_addr(((page as u16) << 8) | offset as u16)
    }

    fn write(&mut self, page: u8, offset: u8, value: u8) {
        self.write_addr(((page as u16) << 8) | offset as u16, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iie() -> Mmu {
        Mmu::new(AppleModel::AppleIIe)
    }

    #[test]
    fn test_ram_roundtrip() {
        let mut mmu = iie();
        mmu.write_addr(0x1234, 0x42);
        assert_eq!(mmu.read_addr(0x1234), 0x42);
    }

    #[test]
    fn test_video_switch_parity() {
        let mut mmu = iie();
        for off in [0x50u8, 0x52, 0x54, 0x56] {
            mmu.read_c0xx(off);
        }
        assert!(!mmu.switches.contains(Switches::TEXT));
        assert!(!mmu.switches.contains(Switches::MIXED));
        assert!(!mmu.switches.contains(Switches::PAGE2));
        assert!(!mmu.switches.contains(Switches::HIRES));
        for off in [0x51u8, 0x53, 0x55, 0x57] {
            mmu.read_c0xx(off);
        }
        assert!(mmu.switches.contains(Switches::TEXT));
        assert!(mmu.switches.contains(Switches::MIXED));
        assert!(mmu.switches.contains(Switches::PAGE2));
        assert!(mmu.switches.contains(Switches::HIRES));
    }

    #[test]
    fn test_language_card_double_read() {
        let mut mmu = iie();
        // $C089を2回読むとバンク1の読み書きが有効になる
        mmu.read_c0xx(0x89);
        assert!(!mmu.switches.contains(Switches::LC_WRITE));
        mmu.read_c0xx(0x89);
        assert!(mmu.switches.contains(Switches::LC_WRITE));
        assert!(!mmu.switches.contains(Switches::LC_READ));
        assert!(!mmu.switches.contains(Switches::LC_BANK2));

        // 書き込みが効くこと
        mmu.write_addr(0xD000, 0x99);
        mmu.read_c0xx(0x88); // 読み取りRAM有効、書き込み無効
        assert!(mmu.switches.contains(Switches::LC_READ));
        assert!(!mmu.switches.contains(Switches::LC_WRITE));
        assert_eq!(mmu.read_addr(0xD000), 0x99);
    }

    #[test]
    fn test_language_card_write_access_blocks_prewrite() {
        let mut mmu = iie();
        // 書き込みアクセスはprewriteをクリアするため、読み書き交互では有効化されない
        mmu.read_c0xx(0x81);
        mmu.write_c0xx(0x81, 0x00);
        assert!(!mmu.switches.contains(Switches::LC_WRITE));
    }

    #[test]
    fn test_lc_bank2_separate() {
        let mut mmu = iie();
        mmu.read_c0xx(0x8B);
        mmu.read_c0xx(0x8B); // bank1 読み書き有効
        mmu.write_addr(0xD000, 0x11);
        assert_eq!(mmu.read_addr(0xD000), 0x11);
        mmu.read_c0xx(0x83);
        mmu.read_c0xx(0x83); // bank2 読み書き有効
        mmu.write_addr(0xD000, 0x22);
        assert_eq!(mmu.read_addr(0xD000), 0x22);
        mmu.read_c0xx(0x88); // bank1 読み取り専用
        assert_eq!(mmu.read_addr(0xD000), 0x11);
        // $E000-$FFFFはバンクによらず共通
        mmu.read_c0xx(0x8B);
        mmu.read_c0xx(0x8B);
        mmu.write_addr(0xE000, 0x33);
        mmu.read_c0xx(0x83);
        mmu.read_c0xx(0x83);
        assert_eq!(mmu.read_addr(0xE000), 0x33);
    }

    #[test]
    fn test_ramrd_ramwrt_routing() {
        let mut mmu = iie();
        mmu.write_addr(0x2000, 0xAA); // main
        mmu.write_c0xx(0x05, 0); // RAMWRT on
        mmu.write_addr(0x2000, 0xBB); // aux
        assert_eq!(mmu.read_addr(0x2000), 0xAA); // 読み取りはまだmain
        mmu.write_c0xx(0x03, 0); // RAMRD on
        assert_eq!(mmu.read_addr(0x2000), 0xBB);
        // ゼロページはRAMRD/RAMWRTの影響を受けない
        mmu.write_addr(0x0080, 0x12);
        assert_eq!(mmu.read_addr(0x0080), 0x12);
    }

    #[test]
    fn test_altzp_routing() {
        let mut mmu = iie();
        mmu.write_addr(0x0080, 0x11);
        mmu.write_c0xx(0x09, 0); // ALTZP on
        mmu.write_addr(0x0080, 0x22);
        assert_eq!(mmu.read_addr(0x0080), 0x22);
        mmu.write_c0xx(0x08, 0); // ALTZP off
        assert_eq!(mmu.read_addr(0x0080), 0x11);
    }

    #[test]
    fn test_80store_page2_text_banking() {
        let mut mmu = iie();
        mmu.write_addr(0x0400, 0x41); // main text page1
        mmu.write_c0xx(0x01, 0); // 80STORE on
        mmu.read_c0xx(0x55); // PAGE2 on -> 表示ページがauxへ
        mmu.write_addr(0x0400, 0x42); // aux text page1
        assert_eq!(mmu.read_addr(0x0400), 0x42);
        mmu.read_c0xx(0x54); // PAGE2 off
        assert_eq!(mmu.read_addr(0x0400), 0x41);
        // 80STOREなしではPAGE2は表示選択のみ
        mmu.write_c0xx(0x00, 0);
        mmu.read_c0xx(0x55);
        assert_eq!(mmu.read_addr(0x0400), 0x41);
    }

    #[test]
    fn test_status_reads_bit7() {
        let mut mmu = iie();
        assert_eq!(mmu.read_c0xx(0x13) & 0x80, 0x00); // RAMRD off
        mmu.write_c0xx(0x03, 0);
        assert_eq!(mmu.read_c0xx(0x13) & 0x80, 0x80);
        assert_eq!(mmu.read_c0xx(0x1A) & 0x80, 0x80); // TEXT on起動
    }

    #[test]
    fn test_keyboard_strobe_clear() {
        let mut mmu = iie();
        mmu.io.key_down(0x41);
        assert_eq!(mmu.read_c0xx(0x00), 0xC1);
        mmu.read_c0xx(0x10);
        assert_eq!(mmu.read_c0xx(0x00), 0x41);
    }

    #[test]
    fn test_vbl_read() {
        let mut mmu = iie();
        mmu.scanline = 0;
        assert_eq!(mmu.read_c0xx(0x19), 0x80); // 表示期間
        mmu.reset_vbl();
        assert_eq!(mmu.read_c0xx(0x19), 0x00); // VBL期間
    }

    #[test]
    fn test_latch_vector_roundtrip() {
        let mut mmu = iie();
        mmu.write_c0xx(0x03, 0);
        mmu.write_c0xx(0x09, 0);
        mmu.read_c0xx(0x57);
        let bits = mmu.latch_vector();
        let mut mmu2 = iie();
        mmu2.set_latch_vector(bits);
        assert_eq!(mmu2.switches, mmu.switches);
    }

    #[test]
    fn test_rom_fallback_when_lc_off() {
        let mut mmu = iie();
        let mut rom = vec![0x00; 16384];
        rom[0x1000] = 0x5A; // $D000
        mmu.load_rom(&rom);
        assert_eq!(mmu.read_addr(0xD000), 0x5A);
        // ROMへの書き込みは破棄される
        mmu.write_addr(0xD000, 0x77);
        assert_eq!(mmu.read_addr(0xD000), 0x5A);
    }

    #[test]
    fn test_iiplus_has_no_aux() {
        let mut mmu = Mmu::new(AppleModel::AppleIIPlus);
        mmu.write_c0xx(0x03, 0); // IIeスイッチは無視される
        mmu.write_addr(0x2000, 0xAA);
        assert_eq!(mmu.read_addr(0x2000), 0xAA);
        assert!(!mmu.switches.contains(Switches::RAMRD));
    }
}
