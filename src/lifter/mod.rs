//! x86機械語 → シンボリックIR のリフター
//!
//! 分割: 関数を基本ブロックに切り、命令をストリームへ流す
//! 解析: 命令テキストをオペランド木に分解
//! リフト: ファクトリで命令パターンを認識してIRを生成

pub mod stream;
pub mod registers;
pub mod node;
pub mod symbols;
pub mod decoder;
pub mod segment;
pub mod operand;
pub mod factory;
pub mod mapper;
pub mod printer;
pub mod session;

pub use crate::error::{LiftError, Result};
pub use stream::{NotificationOrder, Observer, Subject, Subscription, SubscriptionId};
pub use node::{Instruction, InstructionKind, InstructionRef, InstructionVisitor, Operand, OperandRef, OperandVisitor};
pub use symbols::{SymbolKey, SymbolTable};
pub use decoder::{CapstoneDecoder, Decoded, Decoder, ScriptedDecoder};
pub use segment::{BasicBlock, BlockArena, BlockBatch, BlockGrouper, BlockId, BlockInstruction, RawInstruction, Segmenter, Segmentation, StopReason};
pub use operand::{parse_standalone, OperandParser, ParsedInstruction};
pub use factory::{InstructionFactory, LiftContext};
pub use mapper::{Mapper, MapperObserver};
pub use printer::IrPrinter;
pub use session::{FunctionLift, FunctionReport, LiftSession};
