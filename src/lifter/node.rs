//! シンボリックIRのノード型
//!
//! オペランド（Register/Immediate/Temporary/SizedTemporary/Function/Variable）と
//! IR命令（Assignment/Unary/Binary/Call/Cmp/Jump/Branch）はどちらも閉じた列挙型。
//! accept() はmatchで一度だけディスパッチする。訪問者トレイトは全メソッドに
//! 空のデフォルト実装を持つので、必要な種類だけ実装すればよい。

use super::segment::RawInstruction;
use crate::loader::AsmSymbol;
use std::fmt;
use std::rc::Rc;

/// オペランドノードへの共有参照。Rc::ptr_eq で同一性を比較できる
pub type OperandRef = Rc<Operand>;

/// IR命令への共有参照
pub type InstructionRef = Rc<Instruction>;

/// レジスタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    /// バイト数
    pub size: u8,
}

/// 即値（表記は常に0x付き16進）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Immediate {
    pub value: u64,
}

/// アドレス式の演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprOp {
    Add,
    Sub,
    Mul,
}

impl ExprOp {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(ExprOp::Add),
            '-' => Some(ExprOp::Sub),
            '*' => Some(ExprOp::Mul),
            _ => None,
        }
    }

    pub fn symbol(self) -> char {
        match self {
            ExprOp::Add => '+',
            ExprOp::Sub => '-',
            ExprOp::Mul => '*',
        }
    }
}

/// 一時値 lhs op rhs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Temporary {
    pub lhs: OperandRef,
    pub op: ExprOp,
    pub rhs: OperandRef,
}

/// メモリアクセス幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtrSize {
    Byte,
    Word,
    Dword,
    Qword,
    Xmmword,
}

impl PtrSize {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "BYTE" => Some(PtrSize::Byte),
            "WORD" => Some(PtrSize::Word),
            "DWORD" => Some(PtrSize::Dword),
            "QWORD" => Some(PtrSize::Qword),
            "XMMWORD" => Some(PtrSize::Xmmword),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            PtrSize::Byte => "BYTE",
            PtrSize::Word => "WORD",
            PtrSize::Dword => "DWORD",
            PtrSize::Qword => "QWORD",
            PtrSize::Xmmword => "XMMWORD",
        }
    }
}

/// サイズ付きメモリ参照 SIZE PTR [inner]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedTemporary {
    pub size: PtrSize,
    pub inner: OperandRef,
}

/// 呼び出し先の関数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub symbol: AsmSymbol,
}

/// データシンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// オペランドノード（閉じた集合）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Immediate(Immediate),
    Temporary(Temporary),
    SizedTemporary(SizedTemporary),
    Function(Function),
    Variable(Variable),
}

/// オペランドの訪問者
#[allow(unused_variables)]
pub trait OperandVisitor {
    fn visit_register(&mut self, node: &Register) {}
    fn visit_immediate(&mut self, node: &Immediate) {}
    fn visit_temporary(&mut self, node: &Temporary) {}
    fn visit_sized_temporary(&mut self, node: &SizedTemporary) {}
    fn visit_function(&mut self, node: &Function) {}
    fn visit_variable(&mut self, node: &Variable) {}
}

impl Operand {
    pub fn accept<V: OperandVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            Operand::Register(node) => visitor.visit_register(node),
            Operand::Immediate(node) => visitor.visit_immediate(node),
            Operand::Temporary(node) => visitor.visit_temporary(node),
            Operand::SizedTemporary(node) => visitor.visit_sized_temporary(node),
            Operand::Function(node) => visitor.visit_function(node),
            Operand::Variable(node) => visitor.visit_variable(node),
        }
    }

    pub fn as_register(&self) -> Option<&Register> {
        match self {
            Operand::Register(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Operand::Function(node) => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(node) => write!(f, "{}", node.name),
            Operand::Immediate(node) => write!(f, "0x{:x}", node.value),
            Operand::Temporary(node) => write!(f, "{}{}{}", node.lhs, node.op.symbol(), node.rhs),
            Operand::SizedTemporary(node) => {
                write!(f, "{} PTR [{}]", node.size.keyword(), node.inner)
            }
            Operand::Function(node) => write!(f, "@{}", node.symbol.name),
            Operand::Variable(node) => write!(f, "{}", node.name),
        }
    }
}

/// 単項演算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Inc,
    Dec,
    Neg,
    Not,
}

/// 二項演算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Sar => ">>>",
        }
    }
}

/// 比較の種類（符号なし比較は同じ値にまとめる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpKind {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CmpKind {
    /// 条件分岐ニーモニックのサフィックスから比較種類を取得
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "e" | "z" => Some(CmpKind::Eq),
            "ne" | "nz" => Some(CmpKind::Ne),
            "g" | "nle" | "a" | "nbe" => Some(CmpKind::Gt),
            "ge" | "nl" | "ae" | "nb" | "nc" => Some(CmpKind::Ge),
            "l" | "nge" | "b" | "c" | "nae" => Some(CmpKind::Lt),
            "le" | "ng" | "be" | "na" => Some(CmpKind::Le),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpKind::Gt => ">",
            CmpKind::Ge => ">=",
            CmpKind::Lt => "<",
            CmpKind::Le => "<=",
            CmpKind::Eq => "==",
            CmpKind::Ne => "!=",
        }
    }
}

impl fmt::Display for CmpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmpKind::Gt => "GT",
            CmpKind::Ge => "GE",
            CmpKind::Lt => "LT",
            CmpKind::Le => "LE",
            CmpKind::Eq => "EQ",
            CmpKind::Ne => "NE",
        };
        write!(f, "{}", name)
    }
}

/// dst = src
#[derive(Debug, Clone)]
pub struct Assignment {
    pub dst: OperandRef,
    pub src: OperandRef,
}

/// operand = op operand
#[derive(Debug, Clone)]
pub struct UnaryInstruction {
    pub op: UnaryOp,
    pub operand: OperandRef,
}

/// dst = lhs op rhs
#[derive(Debug, Clone)]
pub struct BinaryOperator {
    pub op: BinaryOp,
    pub dst: OperandRef,
    pub lhs: OperandRef,
    pub rhs: OperandRef,
}

#[derive(Debug, Clone)]
pub struct CallInstruction {
    pub target: OperandRef,
}

#[derive(Debug, Clone)]
pub struct CmpInstruction {
    pub lhs: OperandRef,
    pub kind: CmpKind,
    pub rhs: OperandRef,
}

/// 無条件ジャンプ、または条件が不明な条件ジャンプ
#[derive(Debug, Clone)]
pub struct JumpInstruction {
    pub mnemonic: String,
    pub target: OperandRef,
}

/// 比較結果を条件とする分岐
#[derive(Debug, Clone)]
pub struct BranchInstruction {
    /// 直前のcmpを分岐のサフィックスで再分類したもの
    pub condition: InstructionRef,
    pub target: OperandRef,
}

impl BranchInstruction {
    pub fn compare(&self) -> Option<&CmpInstruction> {
        match &self.condition.kind {
            InstructionKind::Cmp(cmp) => Some(cmp),
            _ => None,
        }
    }
}

/// IR命令の種類（閉じた集合）
#[derive(Debug, Clone)]
pub enum InstructionKind {
    Assignment(Assignment),
    Unary(UnaryInstruction),
    Binary(BinaryOperator),
    Call(CallInstruction),
    Cmp(CmpInstruction),
    Jump(JumpInstruction),
    Branch(BranchInstruction),
}

/// リフト済みIR命令
#[derive(Debug, Clone)]
pub struct Instruction {
    /// 元になった機械語命令
    pub sources: Vec<Rc<RawInstruction>>,
    pub defs: Vec<OperandRef>,
    pub uses: Vec<OperandRef>,
    pub kind: InstructionKind,
}

/// IR命令の訪問者
#[allow(unused_variables)]
pub trait InstructionVisitor {
    fn visit_assignment(&mut self, inst: &Instruction, node: &Assignment) {}
    fn visit_unary(&mut self, inst: &Instruction, node: &UnaryInstruction) {}
    fn visit_binary(&mut self, inst: &Instruction, node: &BinaryOperator) {}
    fn visit_call(&mut self, inst: &Instruction, node: &CallInstruction) {}
    fn visit_cmp(&mut self, inst: &Instruction, node: &CmpInstruction) {}
    fn visit_jump(&mut self, inst: &Instruction, node: &JumpInstruction) {}
    fn visit_branch(&mut self, inst: &Instruction, node: &BranchInstruction) {}
}

impl Instruction {
    pub fn new(source: Rc<RawInstruction>, kind: InstructionKind) -> Self {
        let (defs, uses) = match &kind {
            InstructionKind::Assignment(node) => (vec![node.dst.clone()], vec![node.src.clone()]),
            InstructionKind::Unary(node) => (vec![node.operand.clone()], vec![node.operand.clone()]),
            InstructionKind::Binary(node) => {
                (vec![node.dst.clone()], vec![node.lhs.clone(), node.rhs.clone()])
            }
            InstructionKind::Call(node) => (Vec::new(), vec![node.target.clone()]),
            InstructionKind::Cmp(node) => (Vec::new(), vec![node.lhs.clone(), node.rhs.clone()]),
            InstructionKind::Jump(node) => (Vec::new(), vec![node.target.clone()]),
            InstructionKind::Branch(node) => {
                let mut uses = node.condition.uses.clone();
                uses.push(node.target.clone());
                (Vec::new(), uses)
            }
        };
        Self {
            sources: vec![source],
            defs,
            uses,
            kind,
        }
    }

    pub fn accept<V: InstructionVisitor + ?Sized>(&self, visitor: &mut V) {
        match &self.kind {
            InstructionKind::Assignment(node) => visitor.visit_assignment(self, node),
            InstructionKind::Unary(node) => visitor.visit_unary(self, node),
            InstructionKind::Binary(node) => visitor.visit_binary(self, node),
            InstructionKind::Call(node) => visitor.visit_call(self, node),
            InstructionKind::Cmp(node) => visitor.visit_cmp(self, node),
            InstructionKind::Jump(node) => visitor.visit_jump(self, node),
            InstructionKind::Branch(node) => visitor.visit_branch(self, node),
        }
    }

    /// 先頭の元命令のアドレス
    pub fn address(&self) -> Option<u64> {
        self.sources.first().map(|raw| raw.address)
    }

    pub fn as_cmp(&self) -> Option<&CmpInstruction> {
        match &self.kind {
            InstructionKind::Cmp(node) => Some(node),
            _ => None,
        }
    }
}
