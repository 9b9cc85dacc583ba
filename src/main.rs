//! A2CORE - Apple II / IIe Emulator
//!
//! Version 0.1
//!
//! コアライブラリを駆動する薄いホスト。
//! ウィンドウ表示、キーボード変換、オーディオ出力、スクリーンショットのみを担当する。
//!
//! # 使用方法
//! ```text
//! a2core --rom apple2e.rom -1 dos33.dsk
//! ```

use a2core::apple2::{self, Apple2, Options};
use a2core::config::Config;
use a2core::sound::{AudioOutput, Speaker};
use a2core::test_cpu;
use a2core::video::{SCREEN_HEIGHT, SCREEN_WIDTH};

use clap::Parser;
use minifb::{Key, KeyRepeat, Window, WindowOptions};
use std::fs;
use std::path::Path;
use std::time::Instant;

/// A2CORE - Apple II Emulator in Rust
#[derive(Parser, Debug)]
#[command(name = "a2core")]
#[command(version = "0.1.0")]
#[command(about = "Apple II / IIe emulator core", long_about = None)]
struct Args {
    /// ディスクイメージファイル（ドライブ1）
    #[arg(short = '1', long)]
    disk1: Option<String>,

    /// ディスクイメージファイル（ドライブ2）
    #[arg(short = '2', long)]
    disk2: Option<String>,

    /// Apple IIモデル (auto, ii+, iie, iie-enhanced)
    /// autoの場合はROMサイズから判定
    #[arg(short, long, default_value = "auto")]
    model: String,

    /// ROMファイル
    #[arg(short, long)]
    rom: Option<String>,

    /// Disk II Boot ROM (256 bytes)
    #[arg(long)]
    disk_rom: Option<String>,

    /// 文字ROMファイル (2KB)
    #[arg(long)]
    char_rom: Option<String>,

    /// ヘッドレスモード（ウィンドウなしで実行してテキスト画面を出力）
    #[arg(long)]
    headless: bool,

    /// 実行するサイクル数（ヘッドレスモード用）
    #[arg(long, default_value = "1000000")]
    cycles: u64,

    /// クロック周波数 (kHz、1023=標準、4092=高速)
    #[arg(long)]
    khz: Option<u32>,

    /// モノクロ表示
    #[arg(long)]
    mono: bool,

    /// キーボードペーストバッファへ流すテキスト
    #[arg(long)]
    key_buffer: Option<String>,

    /// Klaus2m5 6502機能テストを実行
    #[arg(long)]
    test_cpu: Option<String>,

    /// Klaus2m5 65C02拡張テストを実行
    #[arg(long)]
    test_65c02: Option<String>,
}

/// スクリーンショットをPNGで保存
fn save_screenshot(
    filename: &str,
    fb: &[u32],
    width: usize,
    height: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let file = fs::File::create(filename)?;
    let w = std::io::BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, width as u32, height as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder.write_header()?;

    let mut rgb_data = Vec::with_capacity(width * height * 3);
    for pixel in fb.iter() {
        rgb_data.push(((pixel >> 16) & 0xFF) as u8);
        rgb_data.push(((pixel >> 8) & 0xFF) as u8);
        rgb_data.push((pixel & 0xFF) as u8);
    }

    writer.write_image_data(&rgb_data)?;
    Ok(())
}

/// パスからディスクイメージをロード
fn load_disk(apple2: &mut Apple2, drive: usize, path: &str) -> bool {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Cannot read {}: {}", path, e);
            return false;
        }
    };
    let p = Path::new(path);
    let name = p
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "disk".to_string());
    let ext = p
        .extension()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    // JSON記述子はそのまま渡す
    if ext == "json" {
        if let Ok(text) = String::from_utf8(data) {
            return apple2.set_json(drive, &text);
        }
        return false;
    }
    apple2.set_binary(drive, &name, &ext, &data)
}

/// minifbのキーコードをAppleキーコードへ変換
fn translate_key(key: Key, shift: bool, ctrl: bool) -> Option<u8> {
    let code = match key {
        Key::A => 0x41,
        Key::B => 0x42,
        Key::C => 0x43,
        Key::D => 0x44,
        Key::E => 0x45,
        Key::F => 0x46,
        Key::G => 0x47,
        Key::H => 0x48,
        Key::I => 0x49,
        Key::J => 0x4A,
        Key::K => 0x4B,
        Key::L => 0x4C,
        Key::M => 0x4D,
        Key::N => 0x4E,
        Key::O => 0x4F,
        Key::P => 0x50,
        Key::Q => 0x51,
        Key::R => 0x52,
        Key::S => 0x53,
        Key::T => 0x54,
        Key::U => 0x55,
        Key::V => 0x56,
        Key::W => 0x57,
        Key::X => 0x58,
        Key::Y => 0x59,
        Key::Z => 0x5A,
        Key::Key0 => {
            if shift {
                0x29
            } else {
                0x30
            }
        }
        Key::Key1 => {
            if shift {
                0x21
            } else {
                0x31
            }
        }
        Key::Key2 => {
            if shift {
                0x40
            } else {
                0x32
            }
        }
        Key::Key3 => {
            if shift {
                0x23
            } else {
                0x33
            }
        }
        Key::Key4 => {
            if shift {
                0x24
            } else {
                0x34
            }
        }
        Key::Key5 => {
            if shift {
                0x25
            } else {
                0x35
            }
        }
        Key::Key6 => {
            if shift {
                0x5E
            } else {
                0x36
            }
        }
        Key::Key7 => {
            if shift {
                0x26
            } else {
                0x37
            }
        }
        Key::Key8 => {
            if shift {
                0x2A
            } else {
                0x38
            }
        }
        Key::Key9 => {
            if shift {
                0x28
            } else {
                0x39
            }
        }
        Key::Space => 0x20,
        Key::Enter => 0x0D,
        Key::Backspace | Key::Left => 0x08,
        Key::Right => 0x15,
        Key::Up => 0x0B,
        Key::Down => 0x0A,
        Key::Escape => 0x1B,
        Key::Minus => {
            if shift {
                0x5F
            } else {
                0x2D
            }
        }
        Key::Equal => {
            if shift {
                0x2B
            } else {
                0x3D
            }
        }
        Key::Comma => {
            if shift {
                0x3C
            } else {
                0x2C
            }
        }
        Key::Period => {
            if shift {
                0x3E
            } else {
                0x2E
            }
        }
        Key::Slash => {
            if shift {
                0x3F
            } else {
                0x2F
            }
        }
        Key::Semicolon => {
            if shift {
                0x3A
            } else {
                0x3B
            }
        }
        Key::Apostrophe => {
            if shift {
                0x22
            } else {
                0x27
            }
        }
        _ => return None,
    };

    // Ctrl+A..Z -> $01-$1A
    if ctrl && (0x41..=0x5A).contains(&code) {
        return Some(code & 0x1F);
    }
    Some(code)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // CPUテストモード
    if let Some(path) = &args.test_cpu {
        match test_cpu::run_functional_test(path) {
            Ok(passed) => std::process::exit(if passed { 0 } else { 1 }),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        }
    }
    if let Some(path) = &args.test_65c02 {
        match test_cpu::run_65c02_test(path) {
            Ok(passed) => std::process::exit(if passed { 0 } else { 1 }),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        }
    }

    let mut config = Config::load();
    config.ensure_directories();

    // ROMをロードしてモデルを決定
    let rom_path = args.rom.clone().or_else(|| config.last_rom.clone());
    let rom_data = rom_path.and_then(|path| match fs::read(&path) {
        Ok(data) => {
            println!("Loaded ROM: {} ({} bytes)", path, data.len());
            config.last_rom = Some(path);
            Some(data)
        }
        Err(e) => {
            eprintln!("Cannot read ROM {}: {}", path, e);
            None
        }
    });

    let (e, enhanced) = match args.model.as_str() {
        "ii+" => (false, false),
        "iie" => (true, false),
        "iie-enhanced" => (true, true),
        _ => {
            // ROMサイズから判定: 32KBはIIe、それ以外はII+
            match rom_data.as_ref().map(|r| r.len()) {
                Some(32768) => (true, false),
                _ => (false, false),
            }
        }
    };

    let character_rom = args.char_rom.as_ref().and_then(|path| fs::read(path).ok());

    let mut apple2 = match Apple2::new(Options {
        e,
        enhanced,
        multi_screen: false,
        character_rom,
        rom: rom_data.or_else(|| Some(apple2::create_test_rom())),
    }) {
        Ok(apple2) => apple2,
        Err(e) => {
            eprintln!("Failed to construct machine: {}", e);
            std::process::exit(2);
        }
    };

    if let Some(path) = &args.disk_rom {
        match fs::read(path) {
            Ok(data) => {
                if let Err(e) = apple2.load_disk_rom(&data) {
                    eprintln!("Disk ROM rejected: {}", e);
                }
            }
            Err(e) => eprintln!("Cannot read disk ROM {}: {}", path, e),
        }
    }

    if let Some(path) = &args.disk1 {
        if load_disk(&mut apple2, 1, path) {
            println!("Drive 1: {}", path);
            config.last_disk1 = Some(path.clone());
        }
    }
    if let Some(path) = &args.disk2 {
        if load_disk(&mut apple2, 2, path) {
            println!("Drive 2: {}", path);
            config.last_disk2 = Some(path.clone());
        }
    }

    if let Some(khz) = args.khz {
        apple2.update_khz(khz);
    } else {
        apple2.update_khz(config.khz);
    }
    apple2.video_mut().mono(args.mono || config.monochrome);

    if let Some(text) = &args.key_buffer {
        apple2.set_key_buffer(text);
    }

    apple2.reset();
    let _ = config.save();

    if args.headless {
        run_headless(&mut apple2, args.cycles);
        return;
    }

    run_window(&mut apple2, &config);
}

/// ヘッドレス実行: 指定サイクルを回してテキスト画面を出力
fn run_headless(apple2: &mut Apple2, cycles: u64) {
    apple2.run();
    apple2.step_cycles(cycles);
    print!("{}", apple2.get_text());
    let stats = apple2.stats();
    log::info!(
        "Executed {} cycles, frames={}",
        apple2.cpu().total_cycles,
        stats.frames
    );
}

/// ウィンドウ付き実行
fn run_window(apple2: &mut Apple2, config: &Config) {
    let mut window = match Window::new(
        "A2CORE - Apple II",
        SCREEN_WIDTH,
        SCREEN_HEIGHT,
        WindowOptions::default(),
    ) {
        Ok(window) => window,
        Err(e) => {
            eprintln!("Cannot open window: {}", e);
            std::process::exit(2);
        }
    };
    window.set_target_fps(60);

    let mut speaker = Speaker::new();
    let mut audio = match AudioOutput::new() {
        Ok(audio) => Some(audio),
        Err(e) => {
            eprintln!("Audio disabled: {}", e);
            None
        }
    };

    apple2.run();
    let mut last = Instant::now();

    while window.is_open() && !window.is_key_down(Key::F10) {
        let elapsed_ms = last.elapsed().as_millis() as u64;
        last = Instant::now();

        let base_cycle = apple2.cpu().total_cycles;
        apple2.tick(elapsed_ms);
        let executed = apple2.cpu().total_cycles - base_cycle;

        // オーディオ: トグルイベントをPCMへ変換して出力
        let events = apple2.drain_audio();
        speaker.push_events(&events);
        if let Some(audio) = audio.as_mut() {
            let samples = speaker.generate_samples(base_cycle, executed.max(1), apple2.khz());
            audio.play_samples(samples);
        }

        // キーボード
        let shift = window.is_key_down(Key::LeftShift) || window.is_key_down(Key::RightShift);
        let ctrl = window.is_key_down(Key::LeftCtrl) || window.is_key_down(Key::RightCtrl);
        for key in window.get_keys_pressed(KeyRepeat::Yes) {
            match key {
                Key::F3 => apple2.reset(),
                Key::F12 => {
                    let ts = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let path = config.screenshot_path(ts);
                    match save_screenshot(
                        &path,
                        apple2.video().framebuffer(),
                        SCREEN_WIDTH,
                        SCREEN_HEIGHT,
                    ) {
                        Ok(()) => println!("Screenshot saved: {}", path),
                        Err(e) => eprintln!("Screenshot failed: {}", e),
                    }
                }
                _ => {
                    if let Some(code) = translate_key(key, shift, ctrl) {
                        apple2.key_down(code);
                    }
                }
            }
        }
        if !window.get_keys_released().is_empty() {
            apple2.key_up();
        }

        // Open-Apple / Closed-Apple ボタン
        let alt = window.is_key_down(Key::LeftAlt);
        let altgr = window.is_key_down(Key::RightAlt);
        if alt {
            apple2.button_down(0);
        } else {
            apple2.button_up(0);
        }
        if altgr {
            apple2.button_down(1);
        } else {
            apple2.button_up(1);
        }

        let _ = window.update_with_buffer(apple2.video().framebuffer(), SCREEN_WIDTH, SCREEN_HEIGHT);
    }

    apple2.stop();
}
