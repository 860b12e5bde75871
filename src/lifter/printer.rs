//! IRのC言語風出力
//! 訪問者でIR命令を1行ずつ文字列にする

use super::node::{
    Assignment, BinaryOperator, BranchInstruction, CallInstruction, CmpInstruction, Instruction,
    InstructionRef, InstructionVisitor, JumpInstruction, UnaryInstruction, UnaryOp,
};
use super::segment::BlockBatch;
use std::fmt;

/// 1命令を描画する訪問者
#[derive(Default)]
struct LineRenderer {
    line: String,
}

impl InstructionVisitor for LineRenderer {
    fn visit_assignment(&mut self, _inst: &Instruction, node: &Assignment) {
        self.line = format!("{} = {}", node.dst, node.src);
    }

    fn visit_unary(&mut self, _inst: &Instruction, node: &UnaryInstruction) {
        let operand = &node.operand;
        self.line = match node.op {
            UnaryOp::Inc => format!("{} = {} + 1", operand, operand),
            UnaryOp::Dec => format!("{} = {} - 1", operand, operand),
            UnaryOp::Neg => format!("{} = -{}", operand, operand),
            UnaryOp::Not => format!("{} = ~{}", operand, operand),
        };
    }

    fn visit_binary(&mut self, _inst: &Instruction, node: &BinaryOperator) {
        self.line = format!("{} = {} {} {}", node.dst, node.lhs, node.op.symbol(), node.rhs);
    }

    fn visit_call(&mut self, _inst: &Instruction, node: &CallInstruction) {
        self.line = format!("call {}()", node.target);
    }

    fn visit_cmp(&mut self, _inst: &Instruction, node: &CmpInstruction) {
        self.line = format!("cmp {}, {}", node.lhs, node.rhs);
    }

    fn visit_jump(&mut self, _inst: &Instruction, node: &JumpInstruction) {
        self.line = if node.mnemonic == "jmp" {
            format!("goto {}", node.target)
        } else {
            // 条件が分からない分岐
            format!("{} {}", node.mnemonic, node.target)
        };
    }

    fn visit_branch(&mut self, _inst: &Instruction, node: &BranchInstruction) {
        self.line = match node.compare() {
            Some(cmp) => format!(
                "if ({} {} {}) goto {}",
                cmp.lhs,
                cmp.kind.symbol(),
                cmp.rhs,
                node.target
            ),
            None => format!("if (?) goto {}", node.target),
        };
    }
}

/// IR命令を1行に描画
pub fn render(inst: &Instruction) -> String {
    let mut renderer = LineRenderer::default();
    inst.accept(&mut renderer);
    renderer.line
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(self))
    }
}

/// 関数単位のIRプリンター
pub struct IrPrinter {
    indent_level: usize,
}

impl Default for IrPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl IrPrinter {
    pub fn new() -> Self {
        Self { indent_level: 0 }
    }

    /// インデント文字列を生成
    fn indent(&self) -> String {
        "  ".repeat(self.indent_level)
    }

    /// ブロックごとにIRを出力
    ///
    /// IRは先頭の元命令が属するブロックの下に並べる。
    pub fn print_function(
        &mut self,
        name: &str,
        batches: &[BlockBatch],
        instructions: &[InstructionRef],
    ) -> String {
        let mut output = String::new();
        output.push_str(&format!("{}void {}() {{\n", self.indent(), name));
        self.indent_level += 1;

        for batch in batches {
            output.push_str(&format!(
                "{}// {} @ 0x{:x}\n",
                self.indent(),
                batch.block.id,
                batch.block.start_address
            ));
            for inst in instructions
                .iter()
                .filter(|inst| inst.sources.first().map(|raw| raw.block) == Some(batch.block.id))
            {
                let address = inst.address().unwrap_or_default();
                output.push_str(&format!("{}{};  // 0x{:x}\n", self.indent(), inst, address));
            }
        }

        self.indent_level -= 1;
        output.push_str(&format!("{}}}\n", self.indent()));
        output
    }

    /// ブロックの機械語命令を出力
    pub fn print_blocks(&mut self, batches: &[BlockBatch]) -> String {
        let mut output = String::new();
        for batch in batches {
            output.push_str(&format!(
                "{}{} @ 0x{:x}:\n",
                self.indent(),
                batch.block.id,
                batch.block.start_address
            ));
            self.indent_level += 1;
            for raw in &batch.instructions {
                output.push_str(&format!("{}0x{:x}  {}\n", self.indent(), raw.address, raw.text));
            }
            self.indent_level -= 1;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifter::factory::default_factories;
    use crate::lifter::factory::LiftContext;
    use crate::lifter::operand::parse_standalone;
    use crate::lifter::segment::{BasicBlock, BlockId, RawInstruction};
    use crate::loader::SymbolId;
    use std::rc::Rc;

    fn raw(address: u64, text: &str) -> Rc<RawInstruction> {
        Rc::new(RawInstruction {
            address,
            bytes: vec![0x90; 2],
            text: text.to_string(),
            block: BlockId(0),
        })
    }

    fn lift(text: &str, pending: Option<&InstructionRef>) -> InstructionRef {
        let raw = raw(0x1000, text);
        let parsed = parse_standalone(text);
        let ctx = LiftContext {
            raw: &raw,
            parsed: &parsed,
            pending_compare: pending,
        };
        let node = default_factories()
            .iter()
            .find_map(|factory| factory.build(&ctx))
            .unwrap();
        Rc::new(node)
    }

    #[test]
    fn test_render_lines() {
        assert_eq!(lift("mov eax, ebx", None).to_string(), "eax = ebx");
        assert_eq!(lift("add eax, 0x1", None).to_string(), "eax = eax + 0x1");
        assert_eq!(lift("inc ecx", None).to_string(), "ecx = ecx + 1");
        assert_eq!(lift("cmp eax, ebx", None).to_string(), "cmp eax, ebx");
        assert_eq!(lift("jmp 0x401020", None).to_string(), "goto 0x401020");
        assert_eq!(lift("js 0x401020", None).to_string(), "js 0x401020");
        assert_eq!(lift("call rax", None).to_string(), "call rax()");
    }

    #[test]
    fn test_render_branch() {
        let cmp = lift("cmp eax, ebx", None);
        let branch = lift("jl 0x401020", Some(&cmp));
        assert_eq!(render(&branch), "if (eax < ebx) goto 0x401020");
    }

    #[test]
    fn test_print_function() {
        let block = BasicBlock {
            id: BlockId(0),
            function: SymbolId(0),
            start_address: 0x1000,
        };
        let batch = BlockBatch {
            block,
            instructions: vec![raw(0x1000, "mov eax, ebx")],
        };
        let ir = vec![lift("mov eax, ebx", None)];

        let mut printer = IrPrinter::new();
        let output = printer.print_function("main", &[batch.clone()], &ir);
        assert!(output.starts_with("void main() {\n"));
        assert!(output.contains("  // bb0 @ 0x1000\n"));
        assert!(output.contains("  eax = ebx;  // 0x1000\n"));
        assert!(output.ends_with("}\n"));

        let listing = printer.print_blocks(&[batch]);
        assert_eq!(listing, "bb0 @ 0x1000:\n  0x1000  mov eax, ebx\n");
    }
}
