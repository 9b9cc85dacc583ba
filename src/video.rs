//! Apple II ビデオエミュレーション
//!
//! テキスト40/80桁、Lo-Res、Hi-Res各モードのレンダリング。
//! ページごとの行ダーティビットマップを消費し、変化があった場合のみ
//! フレームバッファを更新する。

use crate::mmu::{Mmu, Switches};

/// 画面サイズ
pub const SCREEN_WIDTH: usize = 560; // 280 * 2 for double width
pub const SCREEN_HEIGHT: usize = 384; // 192 * 2 for double height

/// Apple IIのカラーパレット（NTSC artifact colors）
pub const COLORS: [u32; 16] = [
    0x000000, // 0: Black
    0xDD0033, // 1: Magenta
    0x604EBD, // 2: Dark Blue
    0xFF44FD, // 3: Purple (NTSC artifact)
    0x00A360, // 4: Dark Green
    0x9C9C9C, // 5: Gray 1
    0x14CFFD, // 6: Medium Blue (NTSC artifact)
    0xD0C3FF, // 7: Light Blue
    0x607203, // 8: Brown
    0xFF6A3C, // 9: Orange (NTSC artifact)
    0x9C9C9C, // 10: Gray 2
    0xFFA0D0, // 11: Pink
    0x14F53C, // 12: Light Green (NTSC artifact)
    0xD0DD8D, // 13: Yellow
    0x72FFD0, // 14: Aqua
    0xFFFFFF, // 15: White
];

/// モノクロ緑
pub const MONO_GREEN: u32 = 0x33FF33;

/// ビデオページごとの行ダーティビットマップ
///
/// テキスト/Lo-Resページは24行、Hi-Resページは192行。
/// ページハンドラが書き込み時にマークし、blitが消費してクリアする。
#[derive(Debug, Clone, Copy)]
pub struct VideoDirty {
    /// テキストページ1/2の行ビット (bit 0-23)
    pub text: [u32; 2],
    /// Hi-Resページ1/2の行ビット (192ビットを3ワードで)
    pub hires: [[u64; 3]; 2],
    /// ビデオモードラッチが変化した
    pub mode: bool,
}

impl VideoDirty {
    pub fn new() -> Self {
        VideoDirty {
            text: [0; 2],
            hires: [[0; 3]; 2],
            mode: true, // 初回は全描画
        }
    }

    /// テキスト行オフセットから行番号を逆算
    /// 行0-7: +$000,... 配置は group*0x28 + line*0x80
    fn text_row(offset: u16) -> Option<usize> {
        let line = (offset >> 7) as usize; // 0-7
        let rem = (offset & 0x7F) as usize;
        let group = rem / 0x28;
        if group < 3 {
            Some(group * 8 + line)
        } else {
            None // スクリーンホール
        }
    }

    /// Hi-Res行オフセットから行番号を逆算
    fn hires_row(offset: u16) -> Option<usize> {
        let line = (offset >> 10) as usize; // 0-7
        let rem = offset & 0x3FF;
        let group = (rem >> 7) as usize; // 0-7
        let rem2 = (rem & 0x7F) as usize;
        let section = rem2 / 0x28;
        if section < 3 {
            Some(section * 64 + group * 8 + line)
        } else {
            None
        }
    }

    /// 表示領域への書き込みをマークする
    pub fn mark_write(&mut self, address: u16) {
        match address {
            0x0400..=0x07FF => {
                if let Some(row) = Self::text_row(address - 0x0400) {
                    self.text[0] |= 1 << row;
                }
            }
            0x0800..=0x0BFF => {
                if let Some(row) = Self::text_row(address - 0x0800) {
                    self.text[1] |= 1 << row;
                }
            }
            0x2000..=0x3FFF => {
                if let Some(row) = Self::hires_row(address - 0x2000) {
                    self.hires[0][row / 64] |= 1 << (row % 64);
                }
            }
            0x4000..=0x5FFF => {
                if let Some(row) = Self::hires_row(address - 0x4000) {
                    self.hires[1][row / 64] |= 1 << (row % 64);
                }
            }
            _ => {}
        }
    }

    /// モード変化をマーク（次のblitは全描画）
    pub fn mark_mode(&mut self) {
        self.mode = true;
    }

    /// 何かダーティか
    pub fn any(&self) -> bool {
        self.mode
            || self.text[0] != 0
            || self.text[1] != 0
            || self.hires[0] != [0; 3]
            || self.hires[1] != [0; 3]
    }

    pub fn clear(&mut self) {
        self.text = [0; 2];
        self.hires = [[0; 3]; 2];
        self.mode = false;
    }
}

impl Default for VideoDirty {
    fn default() -> Self {
        Self::new()
    }
}

const ALL_TEXT_ROWS: u32 = 0x00FF_FFFF;
const ALL_HIRES_ROWS: [u64; 3] = [u64::MAX, u64::MAX, u64::MAX];

/// ビデオレンダラ
///
/// ソフトスイッチの状態はblit時にまとめて参照する（ピクセル単位ではない）
pub struct Video {
    /// フレームバッファ (ARGB形式)
    /// 通常は1面、マルチスクリーン時は4面
    framebuffers: Vec<Vec<u32>>,
    multi_screen: bool,
    /// 文字ROM（フォントデータ）
    char_rom: [u8; 2048],
    /// モノクロモード
    monochrome: bool,
    mono_color: u32,
    /// 点滅状態
    flash_state: bool,
    flash_counter: u32,
}

impl Default for Video {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Video {
    pub fn new(multi_screen: bool) -> Self {
        let surfaces = if multi_screen { 4 } else { 1 };
        let mut video = Video {
            framebuffers: vec![vec![0; SCREEN_WIDTH * SCREEN_HEIGHT]; surfaces],
            multi_screen,
            char_rom: [0; 2048],
            monochrome: false,
            mono_color: MONO_GREEN,
            flash_state: false,
            flash_counter: 0,
        };
        video.init_char_rom();
        video
    }

    /// 選択中のフレームバッファ
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffers[0]
    }

    /// 全フレームバッファ（マルチスクリーン時は4面）
    pub fn framebuffers(&self) -> &[Vec<u32>] {
        &self.framebuffers
    }

    /// カラー/モノクロの切り替え
    pub fn mono(&mut self, enabled: bool) {
        self.monochrome = enabled;
    }

    pub fn is_mono(&self) -> bool {
        self.monochrome
    }

    /// 4ページ同時レンダリングの切り替え（デバッグ用）
    pub fn multi_screen(&mut self, enabled: bool) {
        if enabled == self.multi_screen {
            return;
        }
        self.multi_screen = enabled;
        let surfaces = if enabled { 4 } else { 1 };
        self.framebuffers = vec![vec![0; SCREEN_WIDTH * SCREEN_HEIGHT]; surfaces];
    }

    /// 外部文字ROMをロード（ホストから提供された場合）
    pub fn load_char_rom(&mut self, data: &[u8]) {
        if data.len() >= 2048 {
            self.char_rom.copy_from_slice(&data[..2048]);
            log::info!("Loaded external character ROM");
        }
    }

    pub fn flash_state(&self) -> (bool, u32) {
        (self.flash_state, self.flash_counter)
    }

    pub fn restore_flash(&mut self, state: bool, counter: u32) {
        self.flash_state = state;
        self.flash_counter = counter;
    }

    /// 現在のモードでフレームバッファを合成する
    /// 何かピクセルが変化した場合にtrueを返し、ダーティビットはクリアされる
    pub fn blit(&mut self, mmu: &mut Mmu) -> bool {
        // 点滅カウンターを更新（約4Hz）
        self.flash_counter += 1;
        let mut flash_toggled = false;
        if self.flash_counter >= 15 {
            self.flash_state = !self.flash_state;
            self.flash_counter = 0;
            flash_toggled = true;
        }

        let switches = mmu.switches;
        let text_visible =
            switches.contains(Switches::TEXT) || switches.contains(Switches::MIXED);

        let mut dirty = mmu.dirty;
        mmu.dirty.clear();

        if flash_toggled && text_visible {
            // 点滅文字のある可能性がある行をすべて再描画
            dirty.text = [ALL_TEXT_ROWS; 2];
        }

        if !dirty.any() {
            return false;
        }

        let full = dirty.mode;

        if self.multi_screen {
            // 4ページをそれぞれのサーフェスへ全描画
            self.render_page(mmu, 0, false);
            self.render_page(mmu, 1, true);
            self.render_hires_page(mmu, 2, false);
            self.render_hires_page(mmu, 3, true);
            return true;
        }

        // アナンシエータ0は補助スクリーンのレンダーヒント
        let aux_hint = mmu.io.annunciator(0);

        // 80STOREセット時はPAGE2が表示ページを選ばない
        let page2 = switches.contains(Switches::PAGE2) && !switches.contains(Switches::STORE80);
        let page_idx = if page2 { 1 } else { 0 };

        let text_mask = if full { ALL_TEXT_ROWS } else { dirty.text[page_idx] };
        let hires_mask = if full {
            ALL_HIRES_ROWS
        } else {
            dirty.hires[page_idx]
        };

        if switches.contains(Switches::TEXT) {
            if switches.contains(Switches::COL80) && mmu.is_iie() {
                self.render_text80(mmu, 0, page2, text_mask, 0, 24);
            } else {
                self.render_text40(mmu, 0, page2, aux_hint, text_mask, 0, 24);
            }
        } else if switches.contains(Switches::HIRES) {
            let max_row = if switches.contains(Switches::MIXED) { 160 } else { 192 };
            self.render_hires(mmu, 0, page2, aux_hint, hires_mask, max_row);
            if switches.contains(Switches::MIXED) {
                self.render_mixed_text(mmu, page2, aux_hint, text_mask);
            }
        } else {
            let max_row = if switches.contains(Switches::MIXED) { 20 } else { 24 };
            self.render_lores(mmu, 0, page2, aux_hint, text_mask, max_row);
            if switches.contains(Switches::MIXED) {
                self.render_mixed_text(mmu, page2, aux_hint, text_mask);
            }
        }

        true
    }

    /// mixedモードの下部4行テキスト
    fn render_mixed_text(&mut self, mmu: &Mmu, page2: bool, aux: bool, mask: u32) {
        if mmu.switches.contains(Switches::COL80) && mmu.is_iie() {
            self.render_text80(mmu, 0, page2, mask, 20, 24);
        } else {
            self.render_text40(mmu, 0, page2, aux, mask, 20, 24);
        }
    }

    /// マルチスクリーン用: テキスト/Lo-Resページの全描画
    fn render_page(&mut self, mmu: &Mmu, fb: usize, page2: bool) {
        if mmu.switches.contains(Switches::TEXT) {
            self.render_text40(mmu, fb, page2, false, ALL_TEXT_ROWS, 0, 24);
        } else {
            self.render_lores(mmu, fb, page2, false, ALL_TEXT_ROWS, 24);
        }
    }

    /// マルチスクリーン用: Hi-Resページの全描画
    fn render_hires_page(&mut self, mmu: &Mmu, fb: usize, page2: bool) {
        self.render_hires(mmu, fb, page2, false, ALL_HIRES_ROWS, 192);
    }

    /// テキスト行のメモリオフセットを計算
    /// Apple IIのテキスト画面は特殊なインターリーブ構造
    fn text_row_offset(row: usize) -> usize {
        let group = row / 8;
        let line = row % 8;
        group * 0x28 + line * 0x80
    }

    /// Hi-Res行のメモリオフセットを計算
    fn hires_row_offset(row: usize) -> usize {
        let section = row / 64;
        let group = (row % 64) / 8;
        let line = row % 8;
        section * 0x28 + group * 0x80 + line * 0x400
    }

    /// テキストモードのレンダリング（40桁）
    fn render_text40(
        &mut self,
        mmu: &Mmu,
        fb: usize,
        page2: bool,
        aux: bool,
        mask: u32,
        from_row: usize,
        to_row: usize,
    ) {
        let base = if page2 { 0x0800 } else { 0x0400 };
        let ram = if aux && mmu.is_iie() {
            mmu.aux_ram()
        } else {
            mmu.main_ram()
        };
        let alt_char = mmu.switches.contains(Switches::ALTCHAR);

        for row in from_row..to_row {
            if mask & (1 << row) == 0 {
                continue;
            }
            let row_addr = base + Self::text_row_offset(row);
            for col in 0..40 {
                let ch = ram[row_addr + col];
                self.draw_char(fb, col, row, ch, alt_char);
            }
        }
    }

    /// 80桁テキストモードのレンダリング（偶数列はAux、奇数列はMain）
    fn render_text80(
        &mut self,
        mmu: &Mmu,
        fb: usize,
        page2: bool,
        mask: u32,
        from_row: usize,
        to_row: usize,
    ) {
        let base = if page2 { 0x0800 } else { 0x0400 };
        let alt_char = mmu.switches.contains(Switches::ALTCHAR);

        for row in from_row..to_row {
            if mask & (1 << row) == 0 {
                continue;
            }
            let row_addr = base + Self::text_row_offset(row);
            for col in 0..80 {
                let ch = if col & 1 == 0 {
                    mmu.aux_ram()[row_addr + col / 2]
                } else {
                    mmu.main_ram()[row_addr + col / 2]
                };
                self.draw_char80(fb, col, row, ch, alt_char);
            }
        }
    }

    /// 1文字を描画 (14x16ピクセル、40桁モード)
    /// 文字コード: $00-$3F反転、$40-$7F点滅、$80-$FF通常
    fn draw_char(&mut self, fb: usize, col: usize, row: usize, ch: u8, alt_char: bool) {
        let mode = ch >> 6;
        let inverse = mode == 0;
        // ALTCHARセット時は点滅の代わりに反転小文字セット
        let flash = mode == 1 && !alt_char;
        let alt_inverse = mode == 1 && alt_char;

        let char_index = if ch >= 0xE0 {
            // 小文字: フォントの$40-$5F部分
            0x40 + (ch & 0x1F) as usize
        } else {
            (ch & 0x3F) as usize
        };
        let font_offset = char_index * 8;

        let fg = if self.monochrome { self.mono_color } else { 0xFFFFFF };
        let bg = 0x000000;
        let do_inverse = inverse || alt_inverse || (flash && self.flash_state);

        let framebuffer = &mut self.framebuffers[fb];
        for y in 0..8 {
            let font_byte = self.char_rom[font_offset + y];
            for x in 0..7 {
                let pixel_on = (font_byte & (0x40 >> x)) != 0;
                let color = if do_inverse ^ pixel_on { fg } else { bg };

                let screen_x = col * 14 + x * 2;
                let screen_y = row * 16 + y * 2;
                let idx = screen_y * SCREEN_WIDTH + screen_x;
                framebuffer[idx] = color;
                framebuffer[idx + 1] = color;
                framebuffer[idx + SCREEN_WIDTH] = color;
                framebuffer[idx + SCREEN_WIDTH + 1] = color;
            }
        }
    }

    /// 80桁モード用の文字描画（7x16ピクセル、半分の幅）
    fn draw_char80(&mut self, fb: usize, col: usize, row: usize, ch: u8, alt_char: bool) {
        let mode = ch >> 6;
        let inverse = mode == 0;
        let flash = mode == 1 && !alt_char;
        let alt_inverse = mode == 1 && alt_char;

        let char_index = if ch >= 0xE0 {
            0x40 + (ch & 0x1F) as usize
        } else {
            (ch & 0x3F) as usize
        };
        let font_offset = char_index * 8;

        let fg = if self.monochrome { self.mono_color } else { 0xFFFFFF };
        let bg = 0x000000;
        let do_inverse = inverse || alt_inverse || (flash && self.flash_state);

        let framebuffer = &mut self.framebuffers[fb];
        for y in 0..8 {
            let font_byte = self.char_rom[font_offset + y];
            for x in 0..7 {
                let pixel_on = (font_byte & (0x40 >> x)) != 0;
                let color = if do_inverse ^ pixel_on { fg } else { bg };

                let screen_x = col * 7 + x;
                let screen_y = row * 16 + y * 2;
                let idx = screen_y * SCREEN_WIDTH + screen_x;
                framebuffer[idx] = color;
                framebuffer[idx + SCREEN_WIDTH] = color;
            }
        }
    }

    /// Lo-Resグラフィックスのレンダリング（40x48、16色）
    fn render_lores(
        &mut self,
        mmu: &Mmu,
        fb: usize,
        page2: bool,
        aux: bool,
        mask: u32,
        max_row: usize,
    ) {
        let base = if page2 { 0x0800 } else { 0x0400 };
        let ram = if aux && mmu.is_iie() {
            mmu.aux_ram()
        } else {
            mmu.main_ram()
        };

        for row in 0..max_row {
            if mask & (1 << row) == 0 {
                continue;
            }
            let row_addr = base + Self::text_row_offset(row);
            for col in 0..40 {
                let byte = ram[row_addr + col];
                let top = self.lores_color(byte & 0x0F);
                let bottom = self.lores_color(byte >> 4);
                self.draw_lores_block(fb, col, row, top, bottom);
            }
        }
    }

    fn lores_color(&self, nibble: u8) -> u32 {
        if self.monochrome {
            if nibble == 0 {
                0x000000
            } else {
                self.mono_color
            }
        } else {
            COLORS[nibble as usize]
        }
    }

    /// Lo-Resブロックを描画（14x16ピクセル、上下2色）
    fn draw_lores_block(&mut self, fb: usize, col: usize, row: usize, top: u32, bottom: u32) {
        let x_start = col * 14;
        let y_start = row * 16;
        let framebuffer = &mut self.framebuffers[fb];

        for y in 0..8 {
            for x in 0..14 {
                framebuffer[(y_start + y) * SCREEN_WIDTH + x_start + x] = top;
            }
        }
        for y in 8..16 {
            for x in 0..14 {
                framebuffer[(y_start + y) * SCREEN_WIDTH + x_start + x] = bottom;
            }
        }
    }

    /// Hi-Resグラフィックスのレンダリング
    /// 前後のバイトを含む11ビット窓でNTSCアーティファクトカラーを決定する
    fn render_hires(
        &mut self,
        mmu: &Mmu,
        fb: usize,
        page2: bool,
        aux: bool,
        mask: [u64; 3],
        max_row: usize,
    ) {
        let base = if page2 { 0x4000 } else { 0x2000 };
        let ram = if aux && mmu.is_iie() {
            mmu.aux_ram()
        } else {
            mmu.main_ram()
        };

        // カラールックアップ
        // 0=black, 1/4=purple, 2/3=green, 5/8=blue, 6/7=orange, 9=white
        let hires_colors: [u32; 10] = [
            COLORS[0],
            COLORS[3],
            COLORS[12],
            COLORS[12],
            COLORS[3],
            COLORS[6],
            COLORS[9],
            COLORS[9],
            COLORS[6],
            COLORS[15],
        ];

        for y in 0..max_row {
            if mask[y / 64] & (1 << (y % 64)) == 0 {
                continue;
            }
            let row_addr = base + Self::hires_row_offset(y);

            let mut b0: u8 = 0;
            let mut b1: u8 = ram[row_addr];

            for x in 0..40 {
                let b2: u8 = if x == 39 { 0 } else { ram[row_addr + x + 1] };

                // 直前2ピクセル + 現在の7ピクセル + 直後2ピクセル
                let run: u16 = ((b0 as u16 & 0x60) >> 5)
                    | ((b1 as u16 & 0x7F) << 2)
                    | ((b2 as u16 & 0x03) << 9);

                let odd = ((x & 1) << 1) as usize;
                let offset = ((b1 & 0x80) >> 5) as usize;

                for i in 0..7 {
                    let left = (run >> (1 + i)) & 1;
                    let pixel = (run >> (2 + i)) & 1;
                    let right = (run >> (3 + i)) & 1;

                    let idx = if self.monochrome {
                        if pixel != 0 { 9 } else { 0 }
                    } else if pixel != 0 {
                        if left != 0 || right != 0 {
                            9 // 隣接ピクセルがあれば白
                        } else {
                            offset + odd + (i & 1) + 1
                        }
                    } else if left != 0 && right != 0 {
                        offset + odd + 1 - (i & 1) + 1
                    } else {
                        0
                    };

                    let color = if self.monochrome && idx == 9 {
                        self.mono_color
                    } else {
                        hires_colors[idx]
                    };

                    let screen_x = x * 14 + i * 2;
                    let screen_y = y * 2;
                    let fb_idx = screen_y * SCREEN_WIDTH + screen_x;
                    let framebuffer = &mut self.framebuffers[fb];
                    framebuffer[fb_idx] = color;
                    framebuffer[fb_idx + 1] = color;
                    framebuffer[fb_idx + SCREEN_WIDTH] = color;
                    framebuffer[fb_idx + SCREEN_WIDTH + 1] = color;
                }

                b0 = b1;
                b1 = b2;
            }
        }
    }

    /// テキスト画面の内容をプレーン文字列で取得（クリップボードコピー用）
    pub fn get_text(&self, mmu: &Mmu) -> String {
        let switches = mmu.switches;
        let page2 = switches.contains(Switches::PAGE2) && !switches.contains(Switches::STORE80);
        let base = if page2 { 0x0800 } else { 0x0400 };
        let col80 = switches.contains(Switches::COL80) && mmu.is_iie();
        let cols = if col80 { 80 } else { 40 };

        let mut out = String::with_capacity(25 * (cols + 1));
        for row in 0..24 {
            let row_addr = base + Self::text_row_offset(row);
            for col in 0..cols {
                let byte = if col80 {
                    if col & 1 == 0 {
                        mmu.aux_ram()[row_addr + col / 2]
                    } else {
                        mmu.main_ram()[row_addr + col / 2]
                    }
                } else {
                    mmu.main_ram()[row_addr + col]
                };
                let low = byte & 0x7F;
                let ch = match low {
                    0x20..=0x7E => low as char,
                    0x00..=0x1F => (low + 0x40) as char, // 反転大文字
                    _ => ' ',
                };
                out.push(ch);
            }
            out.push('\n');
        }
        out
    }

    /// デフォルトの文字ROMを初期化
    /// 128文字 x 8バイト: $00-$3F 大文字・記号、$40-$5F 小文字
    fn init_char_rom(&mut self) {
        let font_upper: [[u8; 8]; 64] = [
            // $00: @
            [0x1C, 0x22, 0x2A, 0x2E, 0x2C, 0x20, 0x1E, 0x00],
            // $01: A
            [0x08, 0x14, 0x22, 0x22, 0x3E, 0x22, 0x22, 0x00],
            // $02: B
            [0x3C, 0x22, 0x22, 0x3C, 0x22, 0x22, 0x3C, 0x00],
            // $03: C
            [0x1C, 0x22, 0x20, 0x20, 0x20, 0x22, 0x1C, 0x00],
            // $04: D
            [0x3C, 0x22, 0x22, 0x22, 0x22, 0x22, 0x3C, 0x00],
            // $05: E
            [0x3E, 0x20, 0x20, 0x3C, 0x20, 0x20, 0x3E, 0x00],
            // $06: F
            [0x3E, 0x20, 0x20, 0x3C, 0x20, 0x20, 0x20, 0x00],
            // $07: G
            [0x1E, 0x20, 0x20, 0x2E, 0x22, 0x22, 0x1E, 0x00],
            // $08: H
            [0x22, 0x22, 0x22, 0x3E, 0x22, 0x22, 0x22, 0x00],
            // $09: I
            [0x1C, 0x08, 0x08, 0x08, 0x08, 0x08, 0x1C, 0x00],
            // $0A: J
            [0x02, 0x02, 0x02, 0x02, 0x02, 0x22, 0x1C, 0x00],
            // $0B: K
            [0x22, 0x24, 0x28, 0x30, 0x28, 0x24, 0x22, 0x00],
            // $0C: L
            [0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x3E, 0x00],
            // $0D: M
            [0x22, 0x36, 0x2A, 0x2A, 0x22, 0x22, 0x22, 0x00],
            // $0E: N
            [0x22, 0x32, 0x2A, 0x26, 0x22, 0x22, 0x22, 0x00],
            // $0F: O
            [0x1C, 0x22, 0x22, 0x22, 0x22, 0x22, 0x1C, 0x00],
            // $10: P
            [0x3C, 0x22, 0x22, 0x3C, 0x20, 0x20, 0x20, 0x00],
            // $11: Q
            [0x1C, 0x22, 0x22, 0x22, 0x2A, 0x24, 0x1A, 0x00],
            // $12: R
            [0x3C, 0x22, 0x22, 0x3C, 0x28, 0x24, 0x22, 0x00],
            // $13: S
            [0x1C, 0x22, 0x20, 0x1C, 0x02, 0x22, 0x1C, 0x00],
            // $14: T
            [0x3E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00],
            // $15: U
            [0x22, 0x22, 0x22, 0x22, 0x22, 0x22, 0x1C, 0x00],
            // $16: V
            [0x22, 0x22, 0x22, 0x22, 0x14, 0x14, 0x08, 0x00],
            // $17: W
            [0x22, 0x22, 0x22, 0x2A, 0x2A, 0x36, 0x22, 0x00],
            // $18: X
            [0x22, 0x22, 0x14, 0x08, 0x14, 0x22, 0x22, 0x00],
            // $19: Y
            [0x22, 0x22, 0x14, 0x08, 0x08, 0x08, 0x08, 0x00],
            // $1A: Z
            [0x3E, 0x02, 0x04, 0x08, 0x10, 0x20, 0x3E, 0x00],
            // $1B: [
            [0x1E, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1E, 0x00],
            // $1C: backslash
            [0x00, 0x20, 0x10, 0x08, 0x04, 0x02, 0x00, 0x00],
            // $1D: ]
            [0x1E, 0x02, 0x02, 0x02, 0x02, 0x02, 0x1E, 0x00],
            // $1E: ^
            [0x08, 0x14, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00],
            // $1F: _
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x3F, 0x00],
            // $20: Space
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            // $21: !
            [0x08, 0x08, 0x08, 0x08, 0x08, 0x00, 0x08, 0x00],
            // $22: "
            [0x14, 0x14, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00],
            // $23: #
            [0x14, 0x14, 0x3E, 0x14, 0x3E, 0x14, 0x14, 0x00],
            // $24: $
            [0x08, 0x1E, 0x28, 0x1C, 0x0A, 0x3C, 0x08, 0x00],
            // $25: %
            [0x30, 0x32, 0x04, 0x08, 0x10, 0x26, 0x06, 0x00],
            // $26: &
            [0x10, 0x28, 0x28, 0x10, 0x2A, 0x24, 0x1A, 0x00],
            // $27: '
            [0x08, 0x08, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00],
            // $28: (
            [0x04, 0x08, 0x10, 0x10, 0x10, 0x08, 0x04, 0x00],
            // $29: )
            [0x10, 0x08, 0x04, 0x04, 0x04, 0x08, 0x10, 0x00],
            // $2A: *
            [0x00, 0x08, 0x2A, 0x1C, 0x2A, 0x08, 0x00, 0x00],
            // $2B: +
            [0x00, 0x08, 0x08, 0x3E, 0x08, 0x08, 0x00, 0x00],
            // $2C: ,
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x08, 0x10],
            // $2D: -
            [0x00, 0x00, 0x00, 0x3E, 0x00, 0x00, 0x00, 0x00],
            // $2E: .
            [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00],
            // $2F: /
            [0x00, 0x02, 0x04, 0x08, 0x10, 0x20, 0x00, 0x00],
            // $30: 0
            [0x1C, 0x22, 0x26, 0x2A, 0x32, 0x22, 0x1C, 0x00],
            // $31: 1
            [0x08, 0x18, 0x08, 0x08, 0x08, 0x08, 0x1C, 0x00],
            // $32: 2
            [0x1C, 0x22, 0x02, 0x0C, 0x10, 0x20, 0x3E, 0x00],
            // $33: 3
            [0x1C, 0x22, 0x02, 0x0C, 0x02, 0x22, 0x1C, 0x00],
            // $34: 4
            [0x04, 0x0C, 0x14, 0x24, 0x3E, 0x04, 0x04, 0x00],
            // $35: 5
            [0x3E, 0x20, 0x3C, 0x02, 0x02, 0x22, 0x1C, 0x00],
            // $36: 6
            [0x0E, 0x10, 0x20, 0x3C, 0x22, 0x22, 0x1C, 0x00],
            // $37: 7
            [0x3E, 0x02, 0x04, 0x08, 0x10, 0x10, 0x10, 0x00],
            // $38: 8
            [0x1C, 0x22, 0x22, 0x1C, 0x22, 0x22, 0x1C, 0x00],
            // $39: 9
            [0x1C, 0x22, 0x22, 0x1E, 0x02, 0x04, 0x38, 0x00],
            // $3A: :
            [0x00, 0x00, 0x08, 0x00, 0x00, 0x08, 0x00, 0x00],
            // $3B: ;
            [0x00, 0x00, 0x08, 0x00, 0x00, 0x08, 0x08, 0x10],
            // $3C: <
            [0x04, 0x08, 0x10, 0x20, 0x10, 0x08, 0x04, 0x00],
            // $3D: =
            [0x00, 0x00, 0x3E, 0x00, 0x3E, 0x00, 0x00, 0x00],
            // $3E: >
            [0x10, 0x08, 0x04, 0x02, 0x04, 0x08, 0x10, 0x00],
            // $3F: ?
            [0x1C, 0x22, 0x02, 0x04, 0x08, 0x00, 0x08, 0x00],
        ];

        // 小文字フォント（$40-$5F、画面コード$E0-$FFから参照）
        let font_lower: [[u8; 8]; 32] = [
            // $40: `
            [0x10, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            // $41: a
            [0x00, 0x00, 0x1C, 0x02, 0x1E, 0x22, 0x1E, 0x00],
            // $42: b
            [0x20, 0x20, 0x3C, 0x22, 0x22, 0x22, 0x3C, 0x00],
            // $43: c
            [0x00, 0x00, 0x1C, 0x20, 0x20, 0x20, 0x1C, 0x00],
            // $44: d
            [0x02, 0x02, 0x1E, 0x22, 0x22, 0x22, 0x1E, 0x00],
            // $45: e
            [0x00, 0x00, 0x1C, 0x22, 0x3E, 0x20, 0x1C, 0x00],
            // $46: f
            [0x0C, 0x10, 0x10, 0x3C, 0x10, 0x10, 0x10, 0x00],
            // $47: g
            [0x00, 0x00, 0x1E, 0x22, 0x22, 0x1E, 0x02, 0x1C],
            // $48: h
            [0x20, 0x20, 0x3C, 0x22, 0x22, 0x22, 0x22, 0x00],
            // $49: i
            [0x08, 0x00, 0x18, 0x08, 0x08, 0x08, 0x1C, 0x00],
            // $4A: j
            [0x04, 0x00, 0x04, 0x04, 0x04, 0x04, 0x24, 0x18],
            // $4B: k
            [0x20, 0x20, 0x24, 0x28, 0x30, 0x28, 0x24, 0x00],
            // $4C: l
            [0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x1C, 0x00],
            // $4D: m
            [0x00, 0x00, 0x36, 0x2A, 0x2A, 0x2A, 0x22, 0x00],
            // $4E: n
            [0x00, 0x00, 0x3C, 0x22, 0x22, 0x22, 0x22, 0x00],
            // $4F: o
            [0x00, 0x00, 0x1C, 0x22, 0x22, 0x22, 0x1C, 0x00],
            // $50: p
            [0x00, 0x00, 0x3C, 0x22, 0x22, 0x3C, 0x20, 0x20],
            // $51: q
            [0x00, 0x00, 0x1E, 0x22, 0x22, 0x1E, 0x02, 0x02],
            // $52: r
            [0x00, 0x00, 0x2C, 0x32, 0x20, 0x20, 0x20, 0x00],
            // $53: s
            [0x00, 0x00, 0x1E, 0x20, 0x1C, 0x02, 0x3C, 0x00],
            // $54: t
            [0x10, 0x10, 0x3C, 0x10, 0x10, 0x10, 0x0C, 0x00],
            // $55: u
            [0x00, 0x00, 0x22, 0x22, 0x22, 0x22, 0x1E, 0x00],
            // $56: v
            [0x00, 0x00, 0x22, 0x22, 0x22, 0x14, 0x08, 0x00],
            // $57: w
            [0x00, 0x00, 0x22, 0x2A, 0x2A, 0x2A, 0x14, 0x00],
            // $58: x
            [0x00, 0x00, 0x22, 0x14, 0x08, 0x14, 0x22, 0x00],
            // $59: y
            [0x00, 0x00, 0x22, 0x22, 0x22, 0x1E, 0x02, 0x1C],
            // $5A: z
            [0x00, 0x00, 0x3E, 0x04, 0x08, 0x10, 0x3E, 0x00],
            // $5B: {
            [0x04, 0x08, 0x08, 0x10, 0x08, 0x08, 0x04, 0x00],
            // $5C: |
            [0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x00],
            // $5D: }
            [0x10, 0x08, 0x08, 0x04, 0x08, 0x08, 0x10, 0x00],
            // $5E: ~
            [0x00, 0x00, 0x10, 0x2A, 0x04, 0x00, 0x00, 0x00],
            // $5F: (block)
            [0x3E, 0x3E, 0x3E, 0x3E, 0x3E, 0x3E, 0x3E, 0x00],
        ];

        for (idx, char_data) in font_upper.iter().enumerate() {
            for (row, &byte) in char_data.iter().enumerate() {
                self.char_rom[idx * 8 + row] = byte;
            }
        }
        for (idx, char_data) in font_lower.iter().enumerate() {
            for (row, &byte) in char_data.iter().enumerate() {
                self.char_rom[(idx + 64) * 8 + row] = byte;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::AppleModel;

    fn machine() -> (Video, Mmu) {
        (Video::new(false), Mmu::new(AppleModel::AppleIIPlus))
    }

    /// 論理座標(280x192)からフレームバッファの色を取得
    fn pixel(video: &Video, x: usize, y: usize) -> u32 {
        video.framebuffer()[(y * 2) * SCREEN_WIDTH + x * 2]
    }

    #[test]
    fn test_dirty_row_mapping() {
        let mut dirty = VideoDirty::new();
        dirty.clear();
        dirty.mark_write(0x0400); // text1 行0
        dirty.mark_write(0x07D0); // text1 行23 ($7D0 = 0x400 + 0x3D0)
        assert_eq!(dirty.text[0] & 1, 1);
        assert_eq!(dirty.text[0] >> 23 & 1, 1);
        dirty.mark_write(0x2000); // hires1 行0
        assert_eq!(dirty.hires[0][0] & 1, 1);
        dirty.mark_write(0x2400); // hires1 行1
        assert_eq!(dirty.hires[0][0] >> 1 & 1, 1);
    }

    #[test]
    fn test_screen_hole_not_marked() {
        let mut dirty = VideoDirty::new();
        dirty.clear();
        dirty.mark_write(0x0478); // スクリーンホール
        assert_eq!(dirty.text[0], 0);
    }

    #[test]
    fn test_lores_color_bars() {
        let (mut video, mut mmu) = machine();
        mmu.read_addr(0xC050); // GRAPHICS
        // 行0の各カラムに 0x00,0x11,...,0xFF を書き込む
        for i in 0..16u16 {
            mmu.write_addr(0x0400 + i, (i * 0x11) as u8);
        }
        assert!(video.blit(&mut mmu));
        for i in 0..16usize {
            assert_eq!(pixel(&video, i * 7, 0), COLORS[i], "column {}", i);
        }
    }

    #[test]
    fn test_blit_reports_change_once() {
        let (mut video, mut mmu) = machine();
        assert!(video.blit(&mut mmu)); // 初回は全描画
        assert!(!video.blit(&mut mmu)); // 変化なし
        mmu.write_addr(0x0400, 0xC1);
        assert!(video.blit(&mut mmu));
        assert!(!video.blit(&mut mmu));
    }

    #[test]
    fn test_get_text() {
        let (video, mut mmu) = machine();
        // 行0に "HELLO" (通常文字 = ASCII | 0x80)
        for (i, &b) in b"HELLO".iter().enumerate() {
            mmu.write_addr(0x0400 + i as u16, b | 0x80);
        }
        let text = video.get_text(&mmu);
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("HELLO"));
    }

    #[test]
    fn test_text_rendering_sets_pixels() {
        let (mut video, mut mmu) = machine();
        // 行0桁0に反転'@' ($00) -> 前景で塗られるピクセルが多い
        mmu.write_addr(0x0400, 0x00);
        video.blit(&mut mmu);
        let lit = (0..14)
            .flat_map(|x| (0..16).map(move |y| (x, y)))
            .filter(|&(x, y)| video.framebuffer()[y * SCREEN_WIDTH + x] != 0)
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn test_page2_display_selection() {
        let (mut video, mut mmu) = machine();
        mmu.read_addr(0xC050); // GRAPHICS (Lores)
        mmu.write_addr(0x0400, 0x00); // page1: 黒
        mmu.write_addr(0x0800, 0x0F); // page2: 白
        mmu.read_addr(0xC055); // PAGE2
        video.blit(&mut mmu);
        assert_eq!(pixel(&video, 0, 0), COLORS[15]);
        mmu.read_addr(0xC054); // PAGE1
        video.blit(&mut mmu);
        assert_eq!(pixel(&video, 0, 0), COLORS[0]);
    }

    #[test]
    fn test_mixed_mode_bottom_text() {
        let (mut video, mut mmu) = machine();
        mmu.read_addr(0xC050); // GRAPHICS
        mmu.read_addr(0xC053); // MIXED
        // Lores行20はテキストとして描画される
        mmu.write_addr(0x0400 + 0x0650 - 0x0400, 0x00); // 行20の先頭 ($650)
        video.blit(&mut mmu);
        // 下部はテキスト描画なので、Loresブロック一色にはならない
        let y0 = 20 * 16;
        let block: Vec<u32> = (0..14).map(|x| video.framebuffer()[y0 * SCREEN_WIDTH + x]).collect();
        assert!(block.iter().any(|&c| c != block[0]));
    }

    #[test]
    fn test_hires_white_run() {
        let (mut video, mut mmu) = machine();
        mmu.read_addr(0xC050); // GRAPHICS
        mmu.read_addr(0xC057); // HIRES
        mmu.write_addr(0x2000, 0x7F); // 7ピクセル連続 -> 白
        video.blit(&mut mmu);
        // 中央のピクセルは隣接があるため白
        assert_eq!(pixel(&video, 2, 0), COLORS[15]);
    }

    #[test]
    fn test_multi_screen_surfaces() {
        let mut video = Video::new(true);
        let mut mmu = Mmu::new(AppleModel::AppleIIPlus);
        assert_eq!(video.framebuffers().len(), 4);
        mmu.write_addr(0x0400, 0xC1);
        mmu.write_addr(0x0800, 0xC2);
        assert!(video.blit(&mut mmu));
    }
}
