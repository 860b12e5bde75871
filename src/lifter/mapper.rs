//! 機械語命令 → IR のマッパー
//!
//! ストリームから届いた命令をパースし、登録された全ファクトリに渡す。
//! 同じアドレスは一度しかリフトしない。

use super::factory::{default_factories, InstructionFactory, LiftContext};
use super::node::{InstructionKind, InstructionRef, Operand};
use super::operand::OperandParser;
use super::segment::{BlockId, BlockInstruction, RawInstruction};
use super::stream::{NotificationOrder, Observer, Subject};
use super::symbols::SymbolTable;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::trace;

pub struct Mapper {
    factories: Vec<Box<dyn InstructionFactory>>,
    lifted: HashSet<u64>,
    symbols: SymbolTable,
    /// 現在のブロックで最後にリフトしたcmp
    pending_compare: Option<(BlockId, InstructionRef)>,
    output: Subject<InstructionRef>,
}

impl Mapper {
    /// ファクトリ無しで作成
    pub fn new(symbols: SymbolTable, order: NotificationOrder) -> Self {
        Self {
            factories: Vec::new(),
            lifted: HashSet::new(),
            symbols,
            pending_compare: None,
            output: Subject::with_order(order),
        }
    }

    pub fn with_default_factories(symbols: SymbolTable, order: NotificationOrder) -> Self {
        let mut mapper = Self::new(symbols, order);
        mapper.factories = default_factories();
        mapper
    }

    /// ファクトリを末尾に追加
    pub fn register(&mut self, factory: Box<dyn InstructionFactory>) {
        self.factories.push(factory);
    }

    pub fn factory_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|factory| factory.name()).collect()
    }

    /// IRの出力ストリーム
    pub fn output(&self) -> &Subject<InstructionRef> {
        &self.output
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn is_lifted(&self, address: u64) -> bool {
        self.lifted.contains(&address)
    }

    pub fn lifted_count(&self) -> usize {
        self.lifted.len()
    }

    /// 1命令をリフトして出力ストリームへ流す
    ///
    /// リフト済みのアドレスは何もせず空を返す。どのファクトリも一致しなくても
    /// アドレスはリフト済みとして記録する。
    pub fn lift(&mut self, raw: &Rc<RawInstruction>) -> Vec<InstructionRef> {
        if self.lifted.contains(&raw.address) {
            trace!("0x{:x}: already lifted, skipping", raw.address);
            return Vec::new();
        }

        if self
            .pending_compare
            .as_ref()
            .is_some_and(|(block, _)| *block != raw.block)
        {
            self.pending_compare = None;
        }

        let parsed = OperandParser::new(&mut self.symbols).parse(&raw.text);

        let mut nodes = Vec::new();
        {
            let ctx = LiftContext {
                raw,
                parsed: &parsed,
                pending_compare: self.pending_compare.as_ref().map(|(_, cmp)| cmp),
            };
            for factory in &self.factories {
                if let Some(instruction) = factory.build(&ctx) {
                    trace!("0x{:x}: {} -> {}", raw.address, factory.name(), instruction);
                    nodes.push(Rc::new(instruction));
                }
            }
        }

        if let Some(cmp) = nodes.iter().rev().find(|node| node.as_cmp().is_some()) {
            self.pending_compare = Some((raw.block, Rc::clone(cmp)));
        } else if !preserves_flags(&nodes) {
            self.pending_compare = None;
        }

        self.lifted.insert(raw.address);
        for node in &nodes {
            self.output.update(node);
        }
        nodes
    }

    /// 関数ノードを名前で探す
    pub fn function_named(&self, name: &str) -> Option<Rc<Operand>> {
        self.symbols
            .iter()
            .map(|(_, node)| node)
            .find(|node| matches!(&***node, Operand::Function(f) if f.symbol.matches(name)))
            .cloned()
    }
}

/// フラグを書き換えないと分かっている命令か
///
/// 何もリフトされなかった命令はフラグを書き換えたものとみなす。
fn preserves_flags(nodes: &[InstructionRef]) -> bool {
    !nodes.is_empty()
        && nodes.iter().all(|node| {
            matches!(
                node.kind,
                InstructionKind::Assignment(_) | InstructionKind::Jump(_) | InstructionKind::Branch(_)
            )
        })
}

/// 命令ストリームをマッパーへつなぐ購読者
///
/// 出力ストリームの購読者はマッパーを借用してはならない。
pub struct MapperObserver {
    mapper: Rc<RefCell<Mapper>>,
}

impl MapperObserver {
    pub fn new(mapper: Rc<RefCell<Mapper>>) -> Self {
        Self { mapper }
    }
}

impl Observer<BlockInstruction> for MapperObserver {
    fn on_next(&mut self, event: &BlockInstruction) {
        self.mapper.borrow_mut().lift(&event.instruction);
    }
}
