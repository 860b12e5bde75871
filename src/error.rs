//! リフターのエラー型
//!
//! デコード失敗やオペランド解析失敗はエラーではない（データ欠損として扱う）。
//! ここに並ぶのはセッションを作れない、あるいは対象が見つからない場合のみ。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LiftError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed binary: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("unsupported binary format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// シンボルがセクション外を指している
    #[error("no code for symbol {name} at 0x{address:x}")]
    NoCode { name: String, address: u64 },

    /// ファイル上のアドレスを足すとu64を超える
    #[error("address overflow in {name}: 0x{base:x} + 0x{offset:x}")]
    AddressOverflow { name: String, base: u64, offset: u64 },

    #[error("decoder initialization failed: {0}")]
    Decoder(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LiftError>;
