//! 設定ファイル管理モジュール
//!
//! エミュレータの設定をJSON形式で永続化

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 設定ファイルのデフォルトパス
const CONFIG_FILE: &str = "a2core_config.json";

/// エミュレータ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 最後に使用したディスク1のパス
    pub last_disk1: Option<String>,
    /// 最後に使用したディスク2のパス
    pub last_disk2: Option<String>,
    /// 最後に使用したROMのパス
    pub last_rom: Option<String>,
    /// クロック周波数 (kHz)
    pub khz: u32,
    /// サウンド有効
    pub sound_enabled: bool,
    /// モノクロ表示
    pub monochrome: bool,
    /// ウィンドウサイズ（幅）
    pub window_width: usize,
    /// ウィンドウサイズ（高さ）
    pub window_height: usize,
    /// ROMディレクトリ
    #[serde(default = "default_rom_dir")]
    pub rom_dir: String,
    /// ディスクイメージディレクトリ
    #[serde(default = "default_disk_dir")]
    pub disk_dir: String,
    /// スクリーンショットディレクトリ
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,
}

fn default_rom_dir() -> String {
    "roms".to_string()
}
fn default_disk_dir() -> String {
    "disks".to_string()
}
fn default_screenshot_dir() -> String {
    "screenshots".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            last_disk1: None,
            last_disk2: None,
            last_rom: None,
            khz: 1023,
            sound_enabled: true,
            monochrome: false,
            window_width: 560,
            window_height: 384,
            rom_dir: default_rom_dir(),
            disk_dir: default_disk_dir(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

impl Config {
    /// 設定ファイルを読み込む
    pub fn load() -> Self {
        Self::load_from(CONFIG_FILE)
    }

    /// 指定したパスから設定を読み込む
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to parse config: {}, using defaults", e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// 設定ファイルを保存する
    pub fn save(&self) -> Result<(), String> {
        self.save_to(CONFIG_FILE)
    }

    /// 指定したパスに保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// ディレクトリが存在しなければ作成
    pub fn ensure_directories(&self) {
        for dir in [&self.rom_dir, &self.disk_dir, &self.screenshot_dir] {
            if !dir.is_empty() && !Path::new(dir).exists() {
                let _ = fs::create_dir_all(dir);
            }
        }
    }

    /// スクリーンショットのパスを取得
    pub fn screenshot_path(&self, timestamp: u64) -> String {
        let filename = format!("screenshot_{}.png", timestamp);
        if self.screenshot_dir.is_empty() {
            filename
        } else {
            format!("{}/{}", self.screenshot_dir, filename)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.khz, 1023);
        assert_eq!(parsed.window_width, 560);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        // 古い設定ファイルにディレクトリ項目がなくてもロードできる
        let json = r#"{
            "last_disk1": null, "last_disk2": null, "last_rom": null,
            "khz": 4092, "sound_enabled": false, "monochrome": false,
            "window_width": 1120, "window_height": 768
        }"#;
        let parsed: Config = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.khz, 4092);
        assert_eq!(parsed.rom_dir, "roms");
    }
}
