//! ページハンドラバス
//!
//! 64KBのアドレス空間を256バイトのページ単位でハンドラに割り当てる。
//! 上位バイトをインデックスとする256エントリのテーブルでO(1)ディスパッチ。

use std::cell::RefCell;
use std::rc::Rc;

use crate::cpu::MemoryBus;

/// 未割り当てページの読み取り値（フローティングバスの近似）
const FLOATING_BUS: u8 = 0xFF;

/// 256バイトページ範囲を所有するハンドラ
///
/// 不変条件: バス上の各ページは常に高々1つのハンドラに割り当てられる。
pub trait PageHandler {
    /// 担当範囲の先頭ページ番号
    fn start(&self) -> u8;
    /// 担当範囲の末尾ページ番号（含む）
    fn end(&self) -> u8;
    /// ページ内オフセットから1バイト読み取り
    fn read(&mut self, page: u8, offset: u8) -> u8;
    /// ページ内オフセットへ1バイト書き込み
    fn write(&mut self, page: u8, offset: u8, value: u8);
}

/// ページ範囲を持つ素のRAM（副作用なし）
pub struct Ram {
    start: u8,
    end: u8,
    data: Vec<u8>,
}

impl Ram {
    pub fn new(start: u8, end: u8) -> Self {
        let pages = (end as usize - start as usize) + 1;
        Ram {
            start,
            end,
            data: vec![0; pages * 256],
        }
    }

    /// バイト列を先頭ページからのオフセットに書き込む（初期化用）
    pub fn load(&mut self, offset: usize, bytes: &[u8]) {
        let end = (offset + bytes.len()).min(self.data.len());
        self.data[offset..end].copy_from_slice(&bytes[..end - offset]);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PageHandler for Ram {
    fn start(&self) -> u8 {
        self.start
    }

    fn end(&self) -> u8 {
        self.end
    }

    fn read(&mut self, page: u8, offset: u8) -> u8 {
        let idx = (page as usize - self.start as usize) * 256 + offset as usize;
        self.data[idx]
    }

    fn write(&mut self, page: u8, offset: u8, value: u8) {
        let idx = (page as usize - self.start as usize) * 256 + offset as usize;
        self.data[idx] = value;
    }
}

/// ページ範囲を持つROM（書き込みは黙って破棄）
pub struct Rom {
    start: u8,
    end: u8,
    data: Vec<u8>,
}

impl Rom {
    pub fn new(start: u8, end: u8, data: Vec<u8>) -> Result<Self, &'static str> {
        let pages = (end as usize - start as usize) + 1;
        if data.len() != pages * 256 {
            return Err("ROM data length does not match page range");
        }
        Ok(Rom { start, end, data })
    }
}

impl PageHandler for Rom {
    fn start(&self) -> u8 {
        self.start
    }

    fn end(&self) -> u8 {
        self.end
    }

    fn read(&mut self, page: u8, offset: u8) -> u8 {
        let idx = (page as usize - self.start as usize) * 256 + offset as usize;
        self.data[idx]
    }

    fn write(&mut self, _page: u8, _offset: u8, _value: u8) {}
}

/// ページハンドラテーブルによるバス
pub struct PagedBus {
    pages: Vec<Option<Rc<RefCell<dyn PageHandler>>>>,
}

impl Default for PagedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PagedBus {
    pub fn new() -> Self {
        PagedBus {
            pages: vec![None; 256],
        }
    }

    /// リトルエンディアンの16ビット読み取り
    pub fn read_word(&mut self, address: u16) -> u16 {
        let low = self.read(address) as u16;
        let high = self.read(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    /// ハンドラをそのstart..=endページに割り当てる
    /// 既に割り当て済みのページと重なる場合は構築時エラー
    pub fn add_page_handler(
        &mut self,
        handler: Rc<RefCell<dyn PageHandler>>,
    ) -> Result<(), &'static str> {
        let (start, end) = {
            let h = handler.borrow();
            (h.start(), h.end())
        };
        if start > end {
            return Err("Page handler range is inverted");
        }
        for page in start..=end {
            if self.pages[page as usize].is_some() {
                return Err("Page handler range overlaps an existing handler");
            }
        }
        for page in start..=end {
            self.pages[page as usize] = Some(Rc::clone(&handler));
        }
        Ok(())
    }
}

impl MemoryBus for PagedBus {
    fn read(&mut self, address: u16) -> u8 {
        let page = (address >> 8) as u8;
        match &self.pages[page as usize] {
            Some(handler) => handler.borrow_mut().read(page, address as u8),
            None => FLOATING_BUS,
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        let page = (address >> 8) as u8;
        if let Some(handler) = &self.pages[page as usize] {
            handler.borrow_mut().write(page, address as u8, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_read_write() {
        let mut bus = PagedBus::new();
        bus.add_page_handler(Rc::new(RefCell::new(Ram::new(0x00, 0x0F))))
            .unwrap();
        bus.write(0x0123, 0x42);
        assert_eq!(bus.read(0x0123), 0x42);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut bus = PagedBus::new();
        bus.add_page_handler(Rc::new(RefCell::new(Ram::new(0x00, 0x7F))))
            .unwrap();
        let result = bus.add_page_handler(Rc::new(RefCell::new(Ram::new(0x7F, 0x80))));
        assert!(result.is_err());
        // 失敗後も既存の割り当ては維持され、新しい範囲は未割り当てのまま
        bus.write(0x7F00, 0x55);
        assert_eq!(bus.read(0x7F00), 0x55);
        assert_eq!(bus.read(0x8000), 0xFF);
    }

    #[test]
    fn test_unmapped_reads_floating() {
        let mut bus = PagedBus::new();
        assert_eq!(bus.read(0x1234), 0xFF);
        bus.write(0x1234, 0x00); // 書き込みは破棄される
        assert_eq!(bus.read(0x1234), 0xFF);
    }

    #[test]
    fn test_rom_swallows_writes() {
        let mut bus = PagedBus::new();
        let rom = Rom::new(0xF0, 0xF0, vec![0xAB; 256]).unwrap();
        bus.add_page_handler(Rc::new(RefCell::new(rom))).unwrap();
        assert_eq!(bus.read(0xF010), 0xAB);
        bus.write(0xF010, 0x00);
        assert_eq!(bus.read(0xF010), 0xAB);
    }

    #[test]
    fn test_rom_length_validated() {
        assert!(Rom::new(0xF0, 0xF1, vec![0; 256]).is_err());
        assert!(Rom::new(0xF0, 0xF1, vec![0; 512]).is_ok());
    }
}
