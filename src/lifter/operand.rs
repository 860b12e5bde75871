//! オペランド解析
//!
//! "mov eax, DWORD PTR [rbx+0x4]" のような命令テキストを
//! ニーモニックと型付きオペランド木に分解する。
//!
//! 各オペランド候補は次の順に試し、最初に一致したものを採用する:
//! 1. レジスタ名（完全一致）
//! 2. 0x付き16進数
//! 3. 10進数
//! 4. SIZE PTR [EXPR]（EXPRが解析できなければ候補ごと捨てる）
//! 5. LHS op RHS（最も左の演算子で分割）
//! 6. どれにも一致しない → 命令名のテキストに連結する

use super::node::{ExprOp, Immediate, Operand, OperandRef, PtrSize, Register, SizedTemporary, Temporary};
use super::registers;
use super::segment::{parse_literal, strip_branch_prefixes};
use super::symbols::{SymbolKey, SymbolTable};
use std::rc::Rc;

/// 解析済み命令
#[derive(Debug, Clone)]
pub struct ParsedInstruction {
    /// 先頭トークン（ファクトリの照合に使う）
    pub opcode: String,
    /// 解析できなかった候補を連結した命令名
    pub name: String,
    pub operands: Vec<OperandRef>,
    /// メモリ参照内が解析できず捨てた候補の数
    pub dropped: usize,
}

/// 呼び出し系ニーモニック
pub fn is_call(mnemonic: &str) -> bool {
    matches!(mnemonic, "call" | "callq")
}

/// 候補が解析できなかった理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// どの規則にも一致しない（命令名へ連結）
    Unmatched,
    /// メモリ参照の中身が解析できない（捨てる）
    Dropped,
}

#[derive(Debug, Clone, Copy, Default)]
struct Context {
    /// callのリテラル分岐先
    call_target: bool,
    /// メモリ参照の内側
    in_deref: bool,
}

/// オペランドパーサー
///
/// レジスタと即値はシンボルテーブル経由で作るので、同じセッション内で
/// 繰り返し現れる値は同じノードを共有する。
pub struct OperandParser<'t> {
    symbols: &'t mut SymbolTable,
}

impl<'t> OperandParser<'t> {
    pub fn new(symbols: &'t mut SymbolTable) -> Self {
        Self { symbols }
    }

    /// 命令テキストを解析
    pub fn parse(&mut self, text: &str) -> ParsedInstruction {
        let (opcode, candidates) = tokenize(text);
        let call = is_call(opcode);

        let mut name = opcode.to_string();
        let mut operands = Vec::new();
        let mut dropped = 0;

        for candidate in candidates {
            let context = Context {
                call_target: call,
                in_deref: false,
            };
            match self.parse_operand(candidate, context) {
                Ok(operand) => operands.push(operand),
                Err(Failure::Unmatched) => {
                    name.push(' ');
                    name.push_str(candidate);
                }
                Err(Failure::Dropped) => dropped += 1,
            }
        }

        ParsedInstruction {
            opcode: opcode.to_string(),
            name,
            operands,
            dropped,
        }
    }

    fn parse_operand(&mut self, text: &str, context: Context) -> Result<OperandRef, Failure> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Failure::Unmatched);
        }

        // 1. レジスタ
        if let Some(info) = registers::lookup(text) {
            return Ok(self.symbols.get_or_create(SymbolKey::name(info.name), || {
                Operand::Register(Register {
                    name: info.name.to_string(),
                    size: info.size,
                })
            }));
        }

        // 2, 3. 即値
        if let Some(value) = parse_literal(text) {
            return Ok(self.literal(value, context));
        }

        // 4. SIZE PTR [EXPR]
        if let Some((size, expr)) = split_sized(text) {
            let inner_context = Context {
                call_target: false,
                in_deref: true,
            };
            let inner = self
                .parse_operand(expr, inner_context)
                .map_err(|_| Failure::Dropped)?;
            return Ok(Rc::new(Operand::SizedTemporary(SizedTemporary { size, inner })));
        }

        // 4a. サイズ無しの [EXPR]（leaのアドレス式）
        if let Some(expr) = strip_brackets(text) {
            let inner_context = Context {
                call_target: false,
                in_deref: true,
            };
            return self
                .parse_operand(expr, inner_context)
                .map_err(|_| Failure::Dropped);
        }

        // 5. LHS op RHS
        if let Some((lhs, op, rhs)) = split_binary(text) {
            let side_context = Context {
                call_target: false,
                ..context
            };
            let lhs = self.parse_operand(lhs, side_context)?;
            let rhs = self.parse_operand(rhs, side_context)?;
            return Ok(Rc::new(Operand::Temporary(Temporary { lhs, op, rhs })));
        }

        Err(Failure::Unmatched)
    }

    /// リテラルを解決
    ///
    /// callの分岐先はアドレスキーで関数を探す。メモリ参照内のアドレスは
    /// データシンボル（Variable）に解決できればそれを使う。それ以外は即値。
    fn literal(&mut self, value: u64, context: Context) -> OperandRef {
        if context.call_target || context.in_deref {
            if let Some(node) = self.symbols.find(&SymbolKey::Address(value)) {
                let usable = match &*node {
                    Operand::Function(_) => context.call_target,
                    Operand::Variable(_) => context.in_deref,
                    _ => false,
                };
                if usable {
                    return node;
                }
            }
        }
        self.symbols.get_or_create(SymbolKey::Value(value), || {
            Operand::Immediate(Immediate { value })
        })
    }
}

/// シンボルテーブル無しで解析（使い捨てのテーブルを使う）
pub fn parse_standalone(text: &str) -> ParsedInstruction {
    let mut symbols = SymbolTable::new();
    OperandParser::new(&mut symbols).parse(text)
}

/// ニーモニックと、括弧の外側のカンマで区切ったオペランド候補に分ける
///
/// 分岐の接頭辞（bnd/notrack）は読み飛ばす。
pub fn tokenize(text: &str) -> (&str, Vec<&str>) {
    let text = strip_branch_prefixes(text.trim());
    let (opcode, rest) = match text.find(char::is_whitespace) {
        Some(index) => (&text[..index], text[index..].trim()),
        None => (text, ""),
    };

    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                candidates.push(rest[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    let last = rest[start..].trim();
    if !last.is_empty() {
        candidates.push(last);
    }
    candidates.retain(|candidate| !candidate.is_empty());

    (opcode, candidates)
}

/// "DWORD PTR [EXPR]" → (Dword, "EXPR")
fn split_sized(text: &str) -> Option<(PtrSize, &str)> {
    let (keyword, rest) = text.split_once(' ')?;
    let size = PtrSize::from_keyword(keyword)?;
    let rest = rest.trim_start().strip_prefix("PTR")?;
    let expr = strip_brackets(rest.trim())?;
    Some((size, expr))
}

/// "[EXPR]" → "EXPR"（外側の括弧が対応している場合のみ）
fn strip_brackets(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('[')?.strip_suffix(']')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

/// 括弧の外側で最も左の演算子で分割（先頭文字は符号とみなして対象外）
fn split_binary(text: &str) -> Option<(&str, ExprOp, &str)> {
    let mut depth = 0usize;
    for (index, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 && index > 0 => {
                if let Some(op) = ExprOp::from_char(c) {
                    return Some((&text[..index], op, &text[index + c.len_utf8()..]));
                }
            }
            _ => {}
        }
    }
    None
}
