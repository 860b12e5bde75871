//! asmlift ライブラリ
//!
//! ELF/PEバイナリの関数をシンボリックIRへリフトする

pub mod config;
pub mod error;
pub mod loader;
pub mod lifter;

pub use config::{Architecture, LiftConfig};
pub use error::{LiftError, Result};
pub use loader::{AsmSymbol, LoadedBinary, SymbolId};
pub use lifter::{LiftSession, FunctionLift};
