//! 基本ブロック分割
//!
//! 関数の先頭からデコーダーを繰り返し呼び、分岐命令のリテラル分岐先と
//! フォールスルー先をブロック境界として集める。走査後に境界を昇順に
//! 命令列へ当てはめてブロックを切り、命令を1つずつストリームへ流す。

use super::decoder::Decoder;
use super::stream::{Observer, Subject};
use crate::loader::{AsmSymbol, SymbolId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, trace};

/// 分岐・ジャンプ命令テーブル
pub const JUMP_MNEMONICS: &[&str] = &[
    "jmp", "je", "jz", "jne", "jnz", "jg", "jnle", "jge", "jnl", "jl", "jnge", "jle", "jng", "ja",
    "jnbe", "jae", "jnb", "jnc", "jb", "jc", "jnae", "jbe", "jna", "js", "jns", "jo", "jno", "jp",
    "jpe", "jnp", "jpo", "jcxz", "jecxz", "jrcxz", "loop", "loope", "loopz", "loopne", "loopnz",
];

pub fn is_jump(mnemonic: &str) -> bool {
    JUMP_MNEMONICS.contains(&mnemonic)
}

/// 分岐命令に付く接頭辞（MPX/CET）
const BRANCH_PREFIXES: &[&str] = &["bnd", "notrack"];

/// "bnd jmp 0x401020" → "jmp 0x401020"
pub fn strip_branch_prefixes(text: &str) -> &str {
    let mut text = text.trim_start();
    while let Some((first, rest)) = text.split_once(char::is_whitespace) {
        if !BRANCH_PREFIXES.contains(&first) {
            break;
        }
        text = rest.trim_start();
    }
    text
}

/// 命令テキストからリテラルの分岐先を取り出す
///
/// "0x"付き16進と10進のみ。レジスタ間接やメモリ参照は対象外。
pub fn literal_target(text: &str) -> Option<u64> {
    let mut tokens = strip_branch_prefixes(text).split_whitespace();
    tokens.next()?;
    let operand = tokens.next()?.trim_end_matches(',');
    parse_literal(operand)
}

/// "0x..." または10進数を解析
pub fn parse_literal(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return u64::from_str_radix(hex, 16).ok();
        }
        return None;
    }
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        return text.parse().ok();
    }
    None
}

/// 基本ブロックID（セッション内で単調増加）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(pub usize);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// 基本ブロック
///
/// 命令列はブロック自身ではなくグルーパー側（BlockBatch）が持つ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    pub id: BlockId,
    /// 所属する関数
    pub function: SymbolId,
    pub start_address: u64,
}

/// デコード済み機械語命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub text: String,
    pub block: BlockId,
}

impl RawInstruction {
    pub fn mnemonic(&self) -> &str {
        strip_branch_prefixes(&self.text)
            .split_whitespace()
            .next()
            .unwrap_or("")
    }

    /// 次の命令のアドレス
    pub fn next_address(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }
}

/// セッション全体の基本ブロックを保持するアリーナ
///
/// 縮まないので BlockId が無効になることはない。
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<BasicBlock>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, function: SymbolId, start_address: u64) -> BasicBlock {
        let block = BasicBlock {
            id: BlockId(self.blocks.len()),
            function,
            start_address,
        };
        self.blocks.push(block);
        block
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// 指定関数のブロック
    pub fn blocks_of(&self, function: SymbolId) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().filter(move |block| block.function == function)
    }
}

/// ストリームに流す1命令分のイベント
#[derive(Debug, Clone)]
pub struct BlockInstruction {
    pub block: BasicBlock,
    pub instruction: Rc<RawInstruction>,
}

/// グルーパーが出力する (ブロック, 命令列)
#[derive(Debug, Clone)]
pub struct BlockBatch {
    pub block: BasicBlock,
    pub instructions: Vec<Rc<RawInstruction>>,
}

/// 同じブロックの連続する命令をまとめる購読者
pub struct BlockGrouper {
    current: Option<BasicBlock>,
    pending: Vec<Rc<RawInstruction>>,
    output: Subject<BlockBatch>,
}

impl BlockGrouper {
    pub fn new(output: Subject<BlockBatch>) -> Self {
        Self {
            current: None,
            pending: Vec::new(),
            output,
        }
    }

    fn flush(&mut self) {
        if let Some(block) = self.current.take() {
            let batch = BlockBatch {
                block,
                instructions: std::mem::take(&mut self.pending),
            };
            self.output.update(&batch);
        }
    }
}

impl Observer<BlockInstruction> for BlockGrouper {
    fn on_next(&mut self, event: &BlockInstruction) {
        if self.current.map(|block| block.id) != Some(event.block.id) {
            self.flush();
            self.current = Some(event.block);
        }
        self.pending.push(Rc::clone(&event.instruction));
    }

    fn on_complete(&mut self) {
        self.flush();
    }
}

/// 走査の終了理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// デコーダーが失敗した
    DecodeFailed,
    /// デコーダーが長さ0を返した
    ZeroLength,
    /// シンボルのサイズ上限に達した
    SizeExhausted,
    /// 命令数上限に達した
    InstructionLimit,
}

/// 1関数の分割結果
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub function: SymbolId,
    pub blocks: Vec<BlockId>,
    pub instruction_count: usize,
    pub stop: StopReason,
}

struct Scanned {
    address: u64,
    bytes: Vec<u8>,
    text: String,
}

/// 基本ブロック分割器
pub struct Segmenter {
    max_instructions: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl Segmenter {
    pub fn new(max_instructions: usize) -> Self {
        Self { max_instructions }
    }

    /// 関数を分割して命令イベントを流す
    ///
    /// codeはシンボル先頭からのバイト列。ストリームの終端通知は呼び出し側が行う。
    pub fn segment(
        &self,
        arena: &mut BlockArena,
        function: SymbolId,
        symbol: &AsmSymbol,
        code: &[u8],
        decoder: &mut dyn Decoder,
        output: &Subject<BlockInstruction>,
    ) -> Segmentation {
        let entry = symbol.address;
        let size = symbol.size;

        // Step 1: 線形にデコードして境界を集める
        let mut decoded = Vec::new();
        let mut boundaries = BTreeSet::new();
        boundaries.insert(entry);

        let mut offset = 0usize;
        let stop = loop {
            if offset as u64 >= size {
                break StopReason::SizeExhausted;
            }
            if decoded.len() >= self.max_instructions {
                break StopReason::InstructionLimit;
            }
            let address = entry + offset as u64;
            let remaining = code.get(offset..).unwrap_or(&[]);
            let insn = match decoder.decode(address, remaining) {
                Some(insn) => insn,
                None => break StopReason::DecodeFailed,
            };
            if insn.length == 0 {
                break StopReason::ZeroLength;
            }

            let mnemonic = strip_branch_prefixes(&insn.text)
                .split_whitespace()
                .next()
                .unwrap_or("");
            if is_jump(mnemonic) {
                if let Some(target) = literal_target(&insn.text) {
                    boundaries.insert(target);
                }
                boundaries.insert(address + insn.length as u64);
            }

            let end = (offset + insn.length).min(code.len());
            decoded.push(Scanned {
                address,
                bytes: code.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default(),
                text: insn.text,
            });
            offset += insn.length;
        };

        // 範囲外の境界は使わない
        let pending: Vec<u64> = boundaries
            .range(entry..entry.saturating_add(size))
            .copied()
            .collect();

        debug!(
            "{}: {} instructions, {} boundaries, stop={:?}",
            symbol.name,
            decoded.len(),
            pending.len(),
            stop
        );

        // Step 2: 境界を昇順に当てはめてブロックを切る
        let mut cursor = pending.iter().peekable();
        let mut current: Option<BasicBlock> = None;
        let mut blocks = Vec::new();
        let instruction_count = decoded.len();

        for insn in decoded {
            // 命令の途中を指す境界は読み飛ばす
            while cursor.next_if(|&&boundary| boundary < insn.address).is_some() {}
            if cursor.next_if(|&&boundary| boundary == insn.address).is_some() {
                let block = arena.push(function, insn.address);
                trace!("{} starts at 0x{:x}", block.id, insn.address);
                blocks.push(block.id);
                current = Some(block);
            }
            // 先頭命令は必ずentry境界に一致する
            let Some(block) = current else { continue };

            let event = BlockInstruction {
                block,
                instruction: Rc::new(RawInstruction {
                    address: insn.address,
                    bytes: insn.bytes,
                    text: insn.text,
                    block: block.id,
                }),
            };
            output.update(&event);
        }

        Segmentation {
            function,
            blocks,
            instruction_count,
            stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifter::decoder::ScriptedDecoder;
    use crate::loader::SymbolFlags;
    use std::cell::RefCell;

    fn symbol(address: u64, size: u64) -> AsmSymbol {
        AsmSymbol {
            name: "f".to_string(),
            address,
            size,
            flags: SymbolFlags::FUNCTION,
            section: crate::loader::SectionId(0),
            aliases: Vec::new(),
        }
    }

    struct Run {
        segmentation: Segmentation,
        events: Vec<BlockInstruction>,
        batches: Vec<BlockBatch>,
    }

    fn run(decoder: &mut ScriptedDecoder, entry: u64, size: u64) -> Run {
        let mut arena = BlockArena::new();
        let stream = Subject::new();
        let batches_out = Subject::new();

        let events = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&events);
        stream.subscribe(move |event: &BlockInstruction| e.borrow_mut().push(event.clone()));
        stream.subscribe_observer(BlockGrouper::new(batches_out.clone()));

        let batches = Rc::new(RefCell::new(Vec::new()));
        let b = Rc::clone(&batches);
        batches_out.subscribe(move |batch: &BlockBatch| b.borrow_mut().push(batch.clone()));

        let code = vec![0u8; size as usize];
        let segmentation = Segmenter::default().segment(
            &mut arena,
            SymbolId(0),
            &symbol(entry, size),
            &code,
            decoder,
            &stream,
        );
        stream.complete();

        let events = events.borrow().clone();
        let batches = batches.borrow().clone();
        Run {
            segmentation,
            events,
            batches,
        }
    }

    #[test]
    fn test_straight_line_single_block() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x1000, 1, "push rbp")
            .with(0x1001, 3, "mov rbp, rsp")
            .with(0x1004, 2, "mov eax, ebx")
            .with(0x1006, 1, "pop rbp")
            .with(0x1007, 1, "ret");
        let result = run(&mut decoder, 0x1000, 8);

        assert_eq!(result.segmentation.blocks.len(), 1);
        assert_eq!(result.segmentation.stop, StopReason::SizeExhausted);
        assert_eq!(result.batches.len(), 1);
        let addresses: Vec<u64> = result.batches[0].instructions.iter().map(|i| i.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x1001, 0x1004, 0x1006, 0x1007]);
    }

    #[test]
    fn test_branch_splits_blocks() {
        // 0x1000: cmp / 0x1002: jle 0x100a / 0x1004: mov / 0x1006: jmp 0x100c
        // 0x1008: nop(到達不能) / 0x100a: mov / 0x100c: ret
        let mut decoder = ScriptedDecoder::new()
            .with(0x1000, 2, "cmp edi, esi")
            .with(0x1002, 2, "jle 0x100a")
            .with(0x1004, 2, "mov eax, edi")
            .with(0x1006, 2, "jmp 0x100c")
            .with(0x1008, 2, "nop")
            .with(0x100a, 2, "mov eax, esi")
            .with(0x100c, 1, "ret");
        let result = run(&mut decoder, 0x1000, 0xd);

        // 境界: 0x1000(entry), 0x100a, 0x1004, 0x100c, 0x1008
        assert_eq!(result.segmentation.blocks.len(), 5);
        let starts: Vec<u64> = result.batches.iter().map(|b| b.block.start_address).collect();
        assert_eq!(starts, vec![0x1000, 0x1004, 0x1008, 0x100a, 0x100c]);

        // ブロックIDは単調増加
        let ids: Vec<usize> = result.batches.iter().map(|b| b.block.id.0).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        // 各命令はちょうど1つのブロックに属する
        let grouped: usize = result.batches.iter().map(|b| b.instructions.len()).sum();
        assert_eq!(grouped, result.segmentation.instruction_count);
        for batch in &result.batches {
            assert!(batch.instructions.iter().all(|i| i.block == batch.block.id));
        }
    }

    #[test]
    fn test_events_tagged_individually() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x2000, 2, "je 0x2004")
            .with(0x2002, 2, "inc eax")
            .with(0x2004, 1, "ret");
        let result = run(&mut decoder, 0x2000, 5);

        assert_eq!(result.events.len(), 3);
        assert_eq!(result.events[0].block.id, result.events[0].instruction.block);
        assert_ne!(result.events[0].block.id, result.events[1].block.id);
        assert_ne!(result.events[1].block.id, result.events[2].block.id);
    }

    #[test]
    fn test_targets_outside_range_ignored() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x3000, 5, "jmp 0x9000")
            .with(0x3005, 2, "jne rax")
            .with(0x3007, 1, "ret");
        let result = run(&mut decoder, 0x3000, 8);

        // 0x9000は範囲外、レジスタ間接は分岐先なし、フォールスルー 0x3005 と 0x3007
        assert_eq!(result.segmentation.blocks.len(), 3);
    }

    #[test]
    fn test_decoder_failure_keeps_partial_results() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x4000, 1, "push rbp")
            .with(0x4001, 3, "mov rbp, rsp");
        let result = run(&mut decoder, 0x4000, 0x20);

        assert_eq!(result.segmentation.stop, StopReason::DecodeFailed);
        assert_eq!(result.segmentation.instruction_count, 2);
        assert_eq!(result.batches.len(), 1);
        assert_eq!(result.batches[0].instructions.len(), 2);
    }

    #[test]
    fn test_zero_length_stops() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x5000, 1, "nop")
            .with(0x5001, 0, "bad");
        let result = run(&mut decoder, 0x5000, 0x10);
        assert_eq!(result.segmentation.stop, StopReason::ZeroLength);
        assert_eq!(result.segmentation.instruction_count, 1);
    }

    #[test]
    fn test_instruction_limit() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x6000, 1, "nop")
            .with(0x6001, 1, "nop")
            .with(0x6002, 1, "nop");
        let mut arena = BlockArena::new();
        let stream: Subject<BlockInstruction> = Subject::new();
        let result = Segmenter::new(2).segment(
            &mut arena,
            SymbolId(0),
            &symbol(0x6000, 3),
            &[0x90; 3],
            &mut decoder,
            &stream,
        );
        assert_eq!(result.stop, StopReason::InstructionLimit);
        assert_eq!(result.instruction_count, 2);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.blocks_of(SymbolId(0)).count(), 1);
    }

    #[test]
    fn test_boundary_inside_instruction_discarded() {
        // 0x1003 は mov の途中を指す
        let mut decoder = ScriptedDecoder::new()
            .with(0x1000, 2, "jmp 0x1003")
            .with(0x1002, 3, "mov eax, 0x1")
            .with(0x1005, 1, "ret");
        let result = run(&mut decoder, 0x1000, 6);

        let starts: Vec<u64> = result.batches.iter().map(|b| b.block.start_address).collect();
        assert_eq!(starts, vec![0x1000, 0x1002]);
        assert_eq!(result.segmentation.blocks.len(), 2);
        assert_eq!(result.batches[1].instructions.len(), 2);
    }

    #[test]
    fn test_boundary_past_decoded_code_discarded() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x2000, 2, "je 0x2010")
            .with(0x2002, 1, "nop");
        let result = run(&mut decoder, 0x2000, 0x20);

        assert_eq!(result.segmentation.stop, StopReason::DecodeFailed);
        let starts: Vec<u64> = result.batches.iter().map(|b| b.block.start_address).collect();
        assert_eq!(starts, vec![0x2000, 0x2002]);
    }

    #[test]
    fn test_prefixed_jump_splits_blocks() {
        let mut decoder = ScriptedDecoder::new()
            .with(0x3000, 2, "bnd jmp 0x3004")
            .with(0x3002, 2, "nop")
            .with(0x3004, 1, "ret");
        let result = run(&mut decoder, 0x3000, 5);

        let starts: Vec<u64> = result.batches.iter().map(|b| b.block.start_address).collect();
        assert_eq!(starts, vec![0x3000, 0x3002, 0x3004]);
        assert_eq!(result.batches[0].instructions[0].mnemonic(), "jmp");
    }

    #[test]
    fn test_strip_branch_prefixes() {
        assert_eq!(strip_branch_prefixes("bnd jmp 0x10"), "jmp 0x10");
        assert_eq!(strip_branch_prefixes("notrack jmp rax"), "jmp rax");
        assert_eq!(strip_branch_prefixes("jmp rax"), "jmp rax");
        assert_eq!(strip_branch_prefixes("bnd"), "bnd");
        assert_eq!(literal_target("bnd jmp 0x10"), Some(0x10));
    }

    #[test]
    fn test_literal_target() {
        assert_eq!(literal_target("jmp 0x401020"), Some(0x401020));
        assert_eq!(literal_target("je 4096"), Some(4096));
        assert_eq!(literal_target("jmp rax"), None);
        assert_eq!(literal_target("jmp QWORD PTR [rip+0x2fe2]"), None);
        assert_eq!(literal_target("ret"), None);
        assert_eq!(parse_literal("0x"), None);
    }
}
