//! 命令デコーダー境界
//!
//! (アドレス, バイト列) → (消費長, テキスト) の1命令デコード。
//! Capstone実装はIntel構文の出力をオペランド文法に合わせて正規化する。

use crate::config::Architecture;
use crate::error::{LiftError, Result};
use capstone::prelude::*;
use std::collections::HashMap;

/// 1命令のデコード結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// 消費したバイト数（0なら分割を終了する）
    pub length: usize,
    /// "mov eax, DWORD PTR [rbx+0x4]" 形式のテキスト
    pub text: String,
}

/// 命令デコーダー
pub trait Decoder {
    /// addressにあるcodeの先頭1命令をデコード。失敗時はNone
    fn decode(&mut self, address: u64, code: &[u8]) -> Option<Decoded>;
}

/// 正規化対象のサイズキーワード（長いものから置換する）
const SIZE_KEYWORDS: &[&str] = &[
    "xmmword", "ymmword", "zmmword", "qword", "dword", "tbyte", "fword", "byte", "word",
];

/// Capstoneのオペランド文字列を正規化
///
/// "dword ptr [rbx + 4]" → "DWORD PTR [rbx+4]"
pub fn normalize_intel(mnemonic: &str, op_str: &str) -> String {
    let mut operands = op_str.to_string();
    for keyword in SIZE_KEYWORDS {
        operands = operands.replace(
            &format!("{} ptr", keyword),
            &format!("{} PTR", keyword.to_uppercase()),
        );
    }

    let mut normalized = String::with_capacity(operands.len());
    let mut depth = 0usize;
    for c in operands.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth > 0 => continue,
            _ => {}
        }
        normalized.push(c);
    }

    if normalized.is_empty() {
        mnemonic.to_string()
    } else {
        format!("{} {}", mnemonic, normalized)
    }
}

/// Capstoneによるx86/x86-64デコーダー
pub struct CapstoneDecoder {
    cs: Capstone,
}

impl CapstoneDecoder {
    pub fn new(architecture: Architecture) -> Result<Self> {
        let mode = match architecture {
            Architecture::X86_64 => capstone::arch::x86::ArchMode::Mode64,
            Architecture::X86 => capstone::arch::x86::ArchMode::Mode32,
        };
        let cs = Capstone::new()
            .x86()
            .mode(mode)
            .syntax(capstone::arch::x86::ArchSyntax::Intel)
            .detail(false)
            .build()
            .map_err(|e| LiftError::Decoder(format!("Failed to create Capstone engine: {}", e)))?;
        Ok(Self { cs })
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&mut self, address: u64, code: &[u8]) -> Option<Decoded> {
        if code.is_empty() {
            return None;
        }
        let insns = self.cs.disasm_count(code, address, 1).ok()?;
        let insn = insns.iter().next()?;
        let mnemonic = insn.mnemonic()?;
        Some(Decoded {
            length: insn.bytes().len(),
            text: normalize_intel(mnemonic, insn.op_str().unwrap_or("")),
        })
    }
}

/// アドレス → (長さ, テキスト) の表で動くデコーダー
///
/// 逆アセンブル済みテキストの入力やテストに使う。
#[derive(Debug, Clone, Default)]
pub struct ScriptedDecoder {
    table: HashMap<u64, Decoded>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: u64, length: usize, text: &str) -> Self {
        self.insert(address, length, text);
        self
    }

    pub fn insert(&mut self, address: u64, length: usize, text: &str) {
        self.table.insert(
            address,
            Decoded {
                length,
                text: text.to_string(),
            },
        );
    }

    /// "0x1000 3 mov rbp, rsp" 形式の行を読み込む（'#'以降はコメント）
    pub fn from_listing(listing: &str) -> Self {
        let mut decoder = Self::new();
        for line in listing.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut parts = line.splitn(3, char::is_whitespace);
            let (Some(address), Some(length), Some(text)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let address = address.strip_prefix("0x").unwrap_or(address);
            if let (Ok(address), Ok(length)) = (u64::from_str_radix(address, 16), length.parse()) {
                decoder.insert(address, length, text.trim());
            }
        }
        decoder
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(&mut self, address: u64, _code: &[u8]) -> Option<Decoded> {
        self.table.get(&address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_intel() {
        assert_eq!(
            normalize_intel("mov", "eax, dword ptr [rbx + 4]"),
            "mov eax, DWORD PTR [rbx+4]"
        );
        assert_eq!(
            normalize_intel("movaps", "xmmword ptr [rsp + 0x10], xmm0"),
            "movaps XMMWORD PTR [rsp+0x10], xmm0"
        );
        assert_eq!(normalize_intel("mov", "word ptr [rax], 1"), "mov WORD PTR [rax], 1");
        assert_eq!(normalize_intel("lea", "rdi, [rip + 0xe9c]"), "lea rdi, [rip+0xe9c]");
        assert_eq!(normalize_intel("ret", ""), "ret");
    }

    #[test]
    fn test_capstone_decode() {
        let mut decoder = CapstoneDecoder::new(Architecture::X86_64).unwrap();

        // push rbp
        let push = decoder.decode(0x1000, &[0x55, 0xc3]).unwrap();
        assert_eq!(push.length, 1);
        assert_eq!(push.text, "push rbp");

        // mov eax, dword ptr [rbx + 4]
        let mov = decoder.decode(0x1001, &[0x8b, 0x43, 0x04]).unwrap();
        assert_eq!(mov.length, 3);
        assert_eq!(mov.text, "mov eax, DWORD PTR [rbx+4]");

        // call 0x1005（相対0）
        let call = decoder.decode(0x1000, &[0xe8, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(call.length, 5);
        assert_eq!(call.text, "call 0x1005");

        assert!(decoder.decode(0x1000, &[]).is_none());
    }

    #[test]
    fn test_scripted_listing() {
        let mut decoder = ScriptedDecoder::from_listing(
            "# entry\n0x1000 1 push rbp\n1001 3 mov rbp, rsp\ngarbage\n",
        );
        assert_eq!(decoder.decode(0x1000, &[]).unwrap().text, "push rbp");
        assert_eq!(decoder.decode(0x1001, &[]).unwrap().length, 3);
        assert!(decoder.decode(0x1004, &[]).is_none());
    }
}
