//! リフター設定
//!
//! JSONファイル → 環境変数 → CLI引数 の順に上書きされる。

use crate::error::{LiftError, Result};
use crate::lifter::stream::NotificationOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ログレベルを上書きする環境変数
pub const ENV_LOG: &str = "ASMLIFT_LOG";
/// アーキテクチャを上書きする環境変数
pub const ENV_ARCH: &str = "ASMLIFT_ARCH";

/// 対象アーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    X86,
}

impl std::str::FromStr for Architecture {
    type Err = LiftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Ok(Architecture::X86_64),
            "x86" | "i386" | "i686" => Ok(Architecture::X86),
            other => Err(LiftError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::X86 => write!(f, "x86"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiftConfig {
    /// Noneの場合はローダーが判定したアーキテクチャを使う
    pub arch: Option<Architecture>,
    /// プッシュストリームの通知順
    pub notification_order: NotificationOrder,
    /// 1関数あたりのデコード命令数上限
    pub max_instructions: usize,
    pub log_level: String,
}

impl Default for LiftConfig {
    fn default() -> Self {
        Self {
            arch: None,
            notification_order: NotificationOrder::Lifo,
            max_instructions: 100_000,
            log_level: "info".to_string(),
        }
    }
}

impl LiftConfig {
    /// JSONファイルから設定を読み込む
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// 環境変数で上書き
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var(ENV_LOG) {
            self.log_level = level;
        }
        if let Ok(arch) = std::env::var(ENV_ARCH) {
            self.arch = Some(arch.parse()?);
        }
        Ok(())
    }

    /// log_levelをtracingのレベルに変換（不明な値はINFO）
    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level
            .parse::<tracing::Level>()
            .unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LiftConfig::default();
        assert_eq!(config.arch, None);
        assert_eq!(config.notification_order, NotificationOrder::Lifo);
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_partial_json() {
        let config = LiftConfig::from_json(r#"{"arch": "x86", "notification_order": "fifo"}"#).unwrap();
        assert_eq!(config.arch, Some(Architecture::X86));
        assert_eq!(config.notification_order, NotificationOrder::Fifo);
        assert_eq!(config.max_instructions, 100_000);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            LiftConfig::from_json("{\"max_instructions\": \"many\"}"),
            Err(LiftError::Config(_))
        ));
    }

    #[test]
    fn test_architecture_parse() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("i386".parse::<Architecture>().unwrap(), Architecture::X86);
        assert!("mips".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_log_level_fallback() {
        let config = LiftConfig {
            log_level: "verbose".to_string(),
            ..LiftConfig::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::INFO);

        let config = LiftConfig {
            log_level: "debug".to_string(),
            ..LiftConfig::default()
        };
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }
}
