//! 命令ファクトリ
//!
//! 1つのファクトリは1種類の命令パターンを認識してIRノードを作る。
//! 認識できない命令には None を返す。マッパーは全ファクトリを順に呼ぶ。

use super::node::{
    Assignment, BinaryOp, BinaryOperator, BranchInstruction, CallInstruction, CmpInstruction,
    CmpKind, Instruction, InstructionKind, InstructionRef, JumpInstruction, UnaryInstruction,
    UnaryOp,
};
use super::operand::{is_call, ParsedInstruction};
use super::segment::{is_jump, RawInstruction};
use std::rc::Rc;

/// ファクトリへの入力
pub struct LiftContext<'a> {
    pub raw: &'a Rc<RawInstruction>,
    pub parsed: &'a ParsedInstruction,
    /// 同じブロック内で直前にリフトされたcmp
    pub pending_compare: Option<&'a InstructionRef>,
}

impl LiftContext<'_> {
    fn opcode(&self) -> &str {
        &self.parsed.opcode
    }

    fn arity(&self) -> usize {
        self.parsed.operands.len()
    }

    fn emit(&self, kind: InstructionKind) -> Instruction {
        Instruction::new(Rc::clone(self.raw), kind)
    }
}

/// 命令パターンの認識器
pub trait InstructionFactory {
    fn name(&self) -> &'static str;

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction>;
}

/// 条件分岐ニーモニックの比較種類（"jle" → Le）
pub fn condition_kind(mnemonic: &str) -> Option<CmpKind> {
    if mnemonic == "jmp" {
        return None;
    }
    mnemonic.strip_prefix('j').and_then(CmpKind::from_suffix)
}

pub struct CallFactory;

impl InstructionFactory for CallFactory {
    fn name(&self) -> &'static str {
        "call"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        if !is_call(ctx.opcode()) || ctx.arity() != 1 {
            return None;
        }
        Some(ctx.emit(InstructionKind::Call(CallInstruction {
            target: Rc::clone(&ctx.parsed.operands[0]),
        })))
    }
}

pub struct CompareFactory;

impl InstructionFactory for CompareFactory {
    fn name(&self) -> &'static str {
        "cmp"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        if ctx.opcode() != "cmp" || ctx.arity() != 2 {
            return None;
        }
        let operands = &ctx.parsed.operands;
        Some(ctx.emit(InstructionKind::Cmp(CmpInstruction {
            lhs: Rc::clone(&operands[0]),
            kind: CmpKind::Eq,
            rhs: Rc::clone(&operands[1]),
        })))
    }
}

pub struct JumpFactory;

impl InstructionFactory for JumpFactory {
    fn name(&self) -> &'static str {
        "jump"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        if !is_jump(ctx.opcode()) || ctx.arity() != 1 {
            return None;
        }
        let target = Rc::clone(&ctx.parsed.operands[0]);

        let fused = condition_kind(ctx.opcode()).zip(ctx.pending_compare);
        if let Some((kind, pending)) = fused {
            if let Some(cmp) = pending.as_cmp() {
                // 分岐のサフィックスで比較を作り直す
                let mut condition = ctx.emit(InstructionKind::Cmp(CmpInstruction {
                    lhs: Rc::clone(&cmp.lhs),
                    kind,
                    rhs: Rc::clone(&cmp.rhs),
                }));
                condition.sources = pending.sources.clone();

                let mut branch = ctx.emit(InstructionKind::Branch(BranchInstruction {
                    condition: Rc::new(condition),
                    target,
                }));
                branch.sources.extend(pending.sources.iter().cloned());
                return Some(branch);
            }
        }

        Some(ctx.emit(InstructionKind::Jump(JumpInstruction {
            mnemonic: ctx.opcode().to_string(),
            target,
        })))
    }
}

const ASSIGNMENT_MNEMONICS: &[&str] = &[
    "mov", "movabs", "movzx", "movsx", "movsxd", "lea", "movaps", "movups", "movss", "movsd",
    "movq", "movd",
];

pub struct AssignmentFactory;

impl InstructionFactory for AssignmentFactory {
    fn name(&self) -> &'static str {
        "assignment"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        if !ASSIGNMENT_MNEMONICS.contains(&ctx.opcode()) || ctx.arity() != 2 {
            return None;
        }
        let operands = &ctx.parsed.operands;
        Some(ctx.emit(InstructionKind::Assignment(Assignment {
            dst: Rc::clone(&operands[0]),
            src: Rc::clone(&operands[1]),
        })))
    }
}

fn binary_op(mnemonic: &str) -> Option<BinaryOp> {
    match mnemonic {
        "add" => Some(BinaryOp::Add),
        "sub" => Some(BinaryOp::Sub),
        "imul" => Some(BinaryOp::Mul),
        "and" => Some(BinaryOp::And),
        "or" => Some(BinaryOp::Or),
        "xor" => Some(BinaryOp::Xor),
        "shl" | "sal" => Some(BinaryOp::Shl),
        "shr" => Some(BinaryOp::Shr),
        "sar" => Some(BinaryOp::Sar),
        _ => None,
    }
}

pub struct BinaryOperatorFactory;

impl InstructionFactory for BinaryOperatorFactory {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        let op = binary_op(ctx.opcode())?;
        let operands = &ctx.parsed.operands;
        let (dst, lhs, rhs) = match (op, operands.as_slice()) {
            (_, [dst, src]) => (dst, dst, src),
            // imul dst, lhs, rhs
            (BinaryOp::Mul, [dst, lhs, rhs]) => (dst, lhs, rhs),
            _ => return None,
        };
        Some(ctx.emit(InstructionKind::Binary(BinaryOperator {
            op,
            dst: Rc::clone(dst),
            lhs: Rc::clone(lhs),
            rhs: Rc::clone(rhs),
        })))
    }
}

pub struct UnaryFactory;

impl InstructionFactory for UnaryFactory {
    fn name(&self) -> &'static str {
        "unary"
    }

    fn build(&self, ctx: &LiftContext<'_>) -> Option<Instruction> {
        let op = match ctx.opcode() {
            "inc" => UnaryOp::Inc,
            "dec" => UnaryOp::Dec,
            "neg" => UnaryOp::Neg,
            "not" => UnaryOp::Not,
            _ => return None,
        };
        if ctx.arity() != 1 {
            return None;
        }
        Some(ctx.emit(InstructionKind::Unary(UnaryInstruction {
            op,
            operand: Rc::clone(&ctx.parsed.operands[0]),
        })))
    }
}

/// 標準のファクトリ一式
pub fn default_factories() -> Vec<Box<dyn InstructionFactory>> {
    vec![
        Box::new(AssignmentFactory),
        Box::new(BinaryOperatorFactory),
        Box::new(UnaryFactory),
        Box::new(CallFactory),
        Box::new(CompareFactory),
        Box::new(JumpFactory),
    ]
}
