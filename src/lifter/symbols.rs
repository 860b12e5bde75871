//! セッション単位のシンボルテーブル
//!
//! キー（アドレス・名前・値）→ オペランドノード の正規化マップ。
//! 同じキーに対しては常に同じ Rc を返すので、下流の def/use 比較は
//! Rc::ptr_eq で行える。削除操作は無い。

use super::node::{Function, Operand, OperandRef, Variable};
use crate::loader::LoadedBinary;
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

/// シンボルテーブルのキー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolKey {
    /// 関数・データのアドレス（表記は "400800" のような0x無しの16進）
    Address(u64),
    /// レジスタ名など
    Name(String),
    /// 即値
    Value(u64),
}

impl SymbolKey {
    pub fn name(name: impl Into<String>) -> Self {
        SymbolKey::Name(name.into())
    }

    /// "400800" 形式のアドレスキーを解析
    pub fn parse_address(text: &str) -> Option<Self> {
        let digits = text.strip_prefix("0x").unwrap_or(text);
        u64::from_str_radix(digits, 16).ok().map(SymbolKey::Address)
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolKey::Address(address) => write!(f, "{:x}", address),
            SymbolKey::Name(name) => write!(f, "{}", name),
            SymbolKey::Value(value) => write!(f, "#0x{:x}", value),
        }
    }
}

/// 正規化シンボルテーブル
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: IndexMap<SymbolKey, OperandRef>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ローダーのシンボルで初期化
    ///
    /// 関数はFunctionノード、データはVariableノードとしてアドレスキーで登録する。
    pub fn from_binary(binary: &LoadedBinary) -> Self {
        let mut table = Self::new();
        for symbol in binary.symbols() {
            let key = SymbolKey::Address(symbol.address);
            if symbol.is_function() {
                table.get_or_create(key, || {
                    Operand::Function(Function {
                        symbol: symbol.clone(),
                    })
                });
            } else if symbol.is_object() {
                table.get_or_create(key, || {
                    Operand::Variable(Variable {
                        name: symbol.name.clone(),
                        address: symbol.address,
                        size: symbol.size,
                    })
                });
            }
        }
        table
    }

    /// キーに対応するノードを取得
    pub fn find(&self, key: &SymbolKey) -> Option<OperandRef> {
        self.entries.get(key).cloned()
    }

    /// キーに対応するノードを取得、無ければ作成して登録
    ///
    /// ctorは1キーにつき高々1回しか呼ばれない。
    pub fn get_or_create<F>(&mut self, key: SymbolKey, ctor: F) -> OperandRef
    where
        F: FnOnce() -> Operand,
    {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Rc::clone(entry.get()),
            Entry::Vacant(entry) => Rc::clone(entry.insert(Rc::new(ctor()))),
        }
    }

    pub fn contains(&self, key: &SymbolKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 登録順に列挙
    pub fn iter(&self) -> impl Iterator<Item = (&SymbolKey, &OperandRef)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifter::node::{Immediate, Register};
    use crate::loader::{BinaryBuilder, SymbolFlags};

    fn register(name: &str) -> Operand {
        Operand::Register(Register {
            name: name.to_string(),
            size: 4,
        })
    }

    #[test]
    fn test_get_or_create_identity() {
        let mut table = SymbolTable::new();
        let first = table.get_or_create(SymbolKey::name("eax"), || register("eax"));
        let second = table.get_or_create(SymbolKey::name("eax"), || register("eax"));
        let other = table.get_or_create(SymbolKey::name("ebx"), || register("ebx"));

        assert!(Rc::ptr_eq(&first, &second));
        assert!(!Rc::ptr_eq(&first, &other));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ctor_called_once() {
        let mut table = SymbolTable::new();
        let mut calls = 0;
        for _ in 0..3 {
            table.get_or_create(SymbolKey::Value(4), || {
                calls += 1;
                Operand::Immediate(Immediate { value: 4 })
            });
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_find() {
        let mut table = SymbolTable::new();
        assert!(table.find(&SymbolKey::name("eax")).is_none());
        let eax = table.get_or_create(SymbolKey::name("eax"), || register("eax"));
        let found = table.find(&SymbolKey::name("eax")).unwrap();
        assert!(Rc::ptr_eq(&eax, &found));
    }

    #[test]
    fn test_address_key_text() {
        let key = SymbolKey::parse_address("400800").unwrap();
        assert_eq!(key, SymbolKey::Address(0x400800));
        assert_eq!(key.to_string(), "400800");
        assert_eq!(SymbolKey::parse_address("0x10"), Some(SymbolKey::Address(0x10)));
        assert_eq!(SymbolKey::parse_address("main"), None);
    }

    #[test]
    fn test_seeded_from_binary() {
        let mut builder = BinaryBuilder::new(None);
        builder.add_section(".text", 0x400000, vec![0xc3; 0x1000], true);
        builder.add_symbol("printf", 0x400800, 0x10, SymbolFlags::FUNCTION);
        builder.add_symbol("table", 0x400900, 0x40, SymbolFlags::OBJECT);
        let table = SymbolTable::from_binary(&builder.build());

        let printf = table.find(&SymbolKey::Address(0x400800)).unwrap();
        assert_eq!(printf.as_function().unwrap().symbol.name, "printf");
        let data = table.find(&SymbolKey::Address(0x400900)).unwrap();
        assert!(matches!(&*data, Operand::Variable(v) if v.name == "table"));
    }
}
