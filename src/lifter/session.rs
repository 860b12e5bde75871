//! リフトセッション
//!
//! 1つのバイナリに対するシンボルテーブル・ブロックアリーナ・マッパーを持ち、
//! 関数ごとに 分割 → グルーピング → リフト のストリームを組み立てる。

use super::decoder::Decoder;
use super::factory::InstructionFactory;
use super::mapper::{Mapper, MapperObserver};
use super::node::InstructionRef;
use super::printer::{render, IrPrinter};
use super::segment::{
    BlockArena, BlockBatch, BlockGrouper, BlockId, BlockInstruction, Segmentation, Segmenter,
    StopReason,
};
use super::stream::Subject;
use super::symbols::SymbolTable;
use crate::config::LiftConfig;
use crate::error::{LiftError, Result};
use crate::loader::{LoadedBinary, SymbolId};
use serde::Serialize;
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use tracing::{info, warn};

/// 1関数のリフト結果
#[derive(Debug, Clone)]
pub struct FunctionLift {
    pub function: SymbolId,
    pub name: String,
    pub address: u64,
    pub segmentation: Segmentation,
    pub batches: Vec<BlockBatch>,
    pub instructions: Vec<InstructionRef>,
}

impl FunctionLift {
    /// C言語風の出力
    pub fn pseudocode(&self) -> String {
        IrPrinter::new().print_function(&self.name, &self.batches, &self.instructions)
    }

    pub fn listing(&self) -> String {
        IrPrinter::new().print_blocks(&self.batches)
    }
}

pub struct LiftSession<'b> {
    binary: &'b LoadedBinary,
    config: LiftConfig,
    arena: BlockArena,
    mapper: Rc<RefCell<Mapper>>,
    segmenter: Segmenter,
}

impl<'b> LiftSession<'b> {
    pub fn new(binary: &'b LoadedBinary, config: LiftConfig) -> Self {
        let symbols = SymbolTable::from_binary(binary);
        info!(
            "Session: {} sections, {} symbols, {} seeded nodes",
            binary.sections().len(),
            binary.symbols().len(),
            symbols.len()
        );
        let mapper = Mapper::with_default_factories(symbols, config.notification_order);
        let segmenter = Segmenter::new(config.max_instructions);
        Self {
            binary,
            config,
            arena: BlockArena::new(),
            mapper: Rc::new(RefCell::new(mapper)),
            segmenter,
        }
    }

    /// 追加のファクトリを登録
    pub fn register_factory(&mut self, factory: Box<dyn InstructionFactory>) {
        self.mapper.borrow_mut().register(factory);
    }

    /// 関数を1つリフト
    pub fn lift_function(&mut self, id: SymbolId, decoder: &mut dyn Decoder) -> Result<FunctionLift> {
        let binary = self.binary;
        let symbol = binary
            .symbol(id)
            .ok_or_else(|| LiftError::SymbolNotFound(format!("#{}", id.0)))?;
        let code = binary.symbol_code(id)?;
        let order = self.config.notification_order;

        let stream: Subject<BlockInstruction> = Subject::with_order(order);
        let grouped: Subject<BlockBatch> = Subject::with_order(order);

        let batches = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&batches);
        grouped.subscribe(move |batch: &BlockBatch| sink.borrow_mut().push(batch.clone()));

        let lifted = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lifted);
        let collector = self
            .mapper
            .borrow()
            .output()
            .subscribe(move |node: &InstructionRef| sink.borrow_mut().push(Rc::clone(node)));

        stream.subscribe_observer(BlockGrouper::new(grouped.clone()));
        stream.subscribe_observer(MapperObserver::new(Rc::clone(&self.mapper)));

        let segmentation = self
            .segmenter
            .segment(&mut self.arena, id, symbol, code, decoder, &stream);
        stream.complete();
        collector.unsubscribe();

        let batches = std::mem::take(&mut *batches.borrow_mut());
        let instructions = std::mem::take(&mut *lifted.borrow_mut());

        info!(
            "{}: {} blocks, {} instructions, {} IR nodes ({:?})",
            symbol.name,
            segmentation.blocks.len(),
            segmentation.instruction_count,
            instructions.len(),
            segmentation.stop
        );

        Ok(FunctionLift {
            function: id,
            name: symbol.name.clone(),
            address: symbol.address,
            segmentation,
            batches,
            instructions,
        })
    }

    /// 名前で関数を探してリフト
    pub fn lift_named(&mut self, name: &str, decoder: &mut dyn Decoder) -> Result<FunctionLift> {
        let id = self
            .binary
            .find_symbol(name)
            .ok_or_else(|| LiftError::SymbolNotFound(name.to_string()))?;
        self.lift_function(id, decoder)
    }

    /// 全関数をリフト
    ///
    /// コードを持たないシンボルは警告して読み飛ばす。
    pub fn lift_all(&mut self, decoder: &mut dyn Decoder) -> Result<Vec<FunctionLift>> {
        let functions: Vec<SymbolId> = self.binary.functions().map(|(id, _)| id).collect();
        let mut lifts = Vec::with_capacity(functions.len());
        for id in functions {
            match self.lift_function(id, decoder) {
                Ok(lift) => lifts.push(lift),
                Err(LiftError::NoCode { name, address }) => {
                    warn!("Skipping {} at 0x{:x}: no code", name, address);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(lifts)
    }

    /// セッションのシンボルテーブル
    pub fn symbols(&self) -> Ref<'_, SymbolTable> {
        Ref::map(self.mapper.borrow(), Mapper::symbols)
    }

    pub fn blocks(&self) -> &BlockArena {
        &self.arena
    }
}

/// JSON出力用の関数レポート
#[derive(Debug, Clone, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub address: u64,
    pub stop: StopReason,
    pub instruction_count: usize,
    pub blocks: Vec<BlockReport>,
    pub ir: Vec<IrLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReport {
    pub id: BlockId,
    pub start_address: u64,
    pub instructions: Vec<InstructionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstructionReport {
    pub address: u64,
    pub bytes: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrLine {
    pub address: Option<u64>,
    pub block: Option<BlockId>,
    pub text: String,
}

impl From<&FunctionLift> for FunctionReport {
    fn from(lift: &FunctionLift) -> Self {
        let blocks = lift
            .batches
            .iter()
            .map(|batch| BlockReport {
                id: batch.block.id,
                start_address: batch.block.start_address,
                instructions: batch
                    .instructions
                    .iter()
                    .map(|raw| InstructionReport {
                        address: raw.address,
                        bytes: raw.bytes.iter().map(|b| format!("{:02x}", b)).collect(),
                        text: raw.text.clone(),
                    })
                    .collect(),
            })
            .collect();

        let ir = lift
            .instructions
            .iter()
            .map(|inst| IrLine {
                address: inst.address(),
                block: inst.sources.first().map(|raw| raw.block),
                text: render(inst),
            })
            .collect();

        Self {
            name: lift.name.clone(),
            address: lift.address,
            stop: lift.segmentation.stop,
            instruction_count: lift.segmentation.instruction_count,
            blocks,
            ir,
        }
    }
}
