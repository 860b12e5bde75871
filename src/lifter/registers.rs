//! x86/x86-64 レジスタ名テーブル
//!
//! オペランド解析の最優先ルール。名前は大文字小文字を区別して完全一致させる。

/// テーブルの1エントリ
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub name: &'static str,
    /// バイト数
    pub size: u8,
}

const fn reg(name: &'static str, size: u8) -> RegisterInfo {
    RegisterInfo { name, size }
}

static REGISTERS: &[RegisterInfo] = &[
    // 64-bit
    reg("rax", 8),
    reg("rcx", 8),
    reg("rdx", 8),
    reg("rbx", 8),
    reg("rsp", 8),
    reg("rbp", 8),
    reg("rsi", 8),
    reg("rdi", 8),
    reg("r8", 8),
    reg("r9", 8),
    reg("r10", 8),
    reg("r11", 8),
    reg("r12", 8),
    reg("r13", 8),
    reg("r14", 8),
    reg("r15", 8),
    reg("rip", 8),
    // 32-bit
    reg("eax", 4),
    reg("ecx", 4),
    reg("edx", 4),
    reg("ebx", 4),
    reg("esp", 4),
    reg("ebp", 4),
    reg("esi", 4),
    reg("edi", 4),
    reg("r8d", 4),
    reg("r9d", 4),
    reg("r10d", 4),
    reg("r11d", 4),
    reg("r12d", 4),
    reg("r13d", 4),
    reg("r14d", 4),
    reg("r15d", 4),
    reg("eip", 4),
    // 16-bit
    reg("ax", 2),
    reg("cx", 2),
    reg("dx", 2),
    reg("bx", 2),
    reg("sp", 2),
    reg("bp", 2),
    reg("si", 2),
    reg("di", 2),
    reg("r8w", 2),
    reg("r9w", 2),
    reg("r10w", 2),
    reg("r11w", 2),
    reg("r12w", 2),
    reg("r13w", 2),
    reg("r14w", 2),
    reg("r15w", 2),
    // 8-bit
    reg("al", 1),
    reg("cl", 1),
    reg("dl", 1),
    reg("bl", 1),
    reg("ah", 1),
    reg("ch", 1),
    reg("dh", 1),
    reg("bh", 1),
    reg("spl", 1),
    reg("bpl", 1),
    reg("sil", 1),
    reg("dil", 1),
    reg("r8b", 1),
    reg("r9b", 1),
    reg("r10b", 1),
    reg("r11b", 1),
    reg("r12b", 1),
    reg("r13b", 1),
    reg("r14b", 1),
    reg("r15b", 1),
    // SSE
    reg("xmm0", 16),
    reg("xmm1", 16),
    reg("xmm2", 16),
    reg("xmm3", 16),
    reg("xmm4", 16),
    reg("xmm5", 16),
    reg("xmm6", 16),
    reg("xmm7", 16),
    reg("xmm8", 16),
    reg("xmm9", 16),
    reg("xmm10", 16),
    reg("xmm11", 16),
    reg("xmm12", 16),
    reg("xmm13", 16),
    reg("xmm14", 16),
    reg("xmm15", 16),
    // セグメント
    reg("cs", 2),
    reg("ds", 2),
    reg("es", 2),
    reg("fs", 2),
    reg("gs", 2),
    reg("ss", 2),
];

/// 名前からレジスタを検索
pub fn lookup(name: &str) -> Option<&'static RegisterInfo> {
    REGISTERS.iter().find(|info| info.name == name)
}
