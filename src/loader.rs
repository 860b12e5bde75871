//! バイナリローダー
//!
//! goblinでELF/PEを開き、セクションとシンボルを取り出す。
//! セクション・シンボルはアリーナ（Vec）に格納し、SectionId/SymbolId で参照する。
//! 構築後は不変なので、IDが無効になることはない。

use crate::config::Architecture;
use crate::error::{LiftError, Result};
use bitflags::bitflags;
use goblin::Object;
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// セクションのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SectionId(pub usize);

/// シンボルのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SymbolId(pub usize);

bitflags! {
    /// シンボル属性
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SymbolFlags: u32 {
        const FUNCTION = 1 << 0;
        const OBJECT = 1 << 1;
        const GLOBAL = 1 << 2;
        const WEAK = 1 << 3;
        const EXPORT = 1 << 4;
    }
}

/// ロード済みセクション
#[derive(Debug, Clone)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub executable: bool,
    data: Vec<u8>,
}

impl Section {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 終端アドレス（u64::MAXで頭打ち）
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// base + offset を検査付きで計算
fn checked_address(name: &str, base: u64, offset: u64) -> Result<u64> {
    base.checked_add(offset).ok_or_else(|| LiftError::AddressOverflow {
        name: name.to_string(),
        base,
        offset,
    })
}

/// 名前付きのアドレス範囲（主に関数）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmSymbol {
    pub name: String,
    pub address: u64,
    /// サイズの上限。シンボルテーブルにサイズが無い場合は次のシンボルかセクション終端まで
    pub size: u64,
    pub flags: SymbolFlags,
    pub section: SectionId,
    /// 同じアドレスを持つ別名
    pub aliases: Vec<String>,
}

impl AsmSymbol {
    pub fn is_function(&self) -> bool {
        self.flags.contains(SymbolFlags::FUNCTION)
    }

    pub fn is_object(&self) -> bool {
        self.flags.contains(SymbolFlags::OBJECT)
    }

    /// 名前または別名が一致するか
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| alias == name)
    }
}

/// ローダーが返すバイナリ全体
#[derive(Debug, Clone)]
pub struct LoadedBinary {
    pub arch: Option<Architecture>,
    sections: Vec<Section>,
    symbols: Vec<AsmSymbol>,
}

impl LoadedBinary {
    /// ファイルを開いて解析
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let binary = Self::parse(&bytes)?;
        info!(
            "Loaded {}: {} sections, {} symbols",
            path.display(),
            binary.sections.len(),
            binary.symbols.len()
        );
        Ok(binary)
    }

    /// メモリ上のバイト列を解析
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match Object::parse(bytes)? {
            Object::Elf(elf) => Self::from_elf(&elf, bytes),
            Object::PE(pe) => Self::from_pe(&pe, bytes),
            Object::Mach(_) => Err(LiftError::UnsupportedFormat("Mach-O".to_string())),
            Object::Archive(_) => Err(LiftError::UnsupportedFormat("archive".to_string())),
            _ => Err(LiftError::UnsupportedFormat("unknown".to_string())),
        }
    }

    fn from_elf(elf: &goblin::elf::Elf, bytes: &[u8]) -> Result<Self> {
        use goblin::elf::header::{EM_386, EM_X86_64};
        use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR};
        use goblin::elf::sym::{STB_GLOBAL, STB_WEAK, STT_FUNC, STT_OBJECT};

        let arch = match elf.header.e_machine {
            EM_X86_64 => Some(Architecture::X86_64),
            EM_386 => Some(Architecture::X86),
            _ => None,
        };
        let mut builder = BinaryBuilder::new(arch);

        for sh in &elf.section_headers {
            if sh.sh_flags & u64::from(SHF_ALLOC) == 0 || sh.sh_addr == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            checked_address(name, sh.sh_addr, sh.sh_size)?;
            // NOBITS(.bss)はファイル上にデータが無い
            let data = sh
                .file_range()
                .and_then(|range| bytes.get(range))
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            builder.add_section_sized(
                name,
                sh.sh_addr,
                sh.sh_size,
                data,
                sh.sh_flags & u64::from(SHF_EXECINSTR) != 0,
            );
        }

        // .symtabが無ければ（strip済み）.dynsymを使う
        let (syms, strtab) = if elf.syms.is_empty() {
            (&elf.dynsyms, &elf.dynstrtab)
        } else {
            (&elf.syms, &elf.strtab)
        };

        for sym in syms.iter() {
            let mut flags = match sym.st_type() {
                STT_FUNC => SymbolFlags::FUNCTION,
                STT_OBJECT => SymbolFlags::OBJECT,
                _ => continue,
            };
            if sym.st_value == 0 {
                continue;
            }
            let name = match strtab.get_at(sym.st_name) {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            match sym.st_bind() {
                STB_GLOBAL => flags |= SymbolFlags::GLOBAL,
                STB_WEAK => flags |= SymbolFlags::WEAK,
                _ => {}
            }
            builder.add_symbol(name, sym.st_value, sym.st_size, flags);
        }

        Ok(builder.build())
    }

    fn from_pe(pe: &goblin::pe::PE, bytes: &[u8]) -> Result<Self> {
        use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
        use goblin::pe::section_table::IMAGE_SCN_MEM_EXECUTE;

        let arch = match pe.header.coff_header.machine {
            COFF_MACHINE_X86_64 => Some(Architecture::X86_64),
            COFF_MACHINE_X86 => Some(Architecture::X86),
            _ => None,
        };
        let image_base = pe.image_base as u64;
        let mut builder = BinaryBuilder::new(arch);

        for section in &pe.sections {
            let name = section.name().unwrap_or("");
            let start = section.pointer_to_raw_data as usize;
            let raw_size = section.size_of_raw_data.min(section.virtual_size) as usize;
            let data = bytes
                .get(start..start.saturating_add(raw_size))
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            let address = checked_address(name, image_base, u64::from(section.virtual_address))?;
            let size = u64::from(section.virtual_size);
            checked_address(name, address, size)?;
            builder.add_section_sized(
                name,
                address,
                size,
                data,
                section.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
            );
        }

        for export in &pe.exports {
            if let Some(name) = export.name {
                builder.add_symbol(
                    name,
                    checked_address(name, image_base, export.rva as u64)?,
                    0,
                    SymbolFlags::FUNCTION | SymbolFlags::EXPORT | SymbolFlags::GLOBAL,
                );
            }
        }

        Ok(builder.build())
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(id.0)
    }

    pub fn symbols(&self) -> &[AsmSymbol] {
        &self.symbols
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&AsmSymbol> {
        self.symbols.get(id.0)
    }

    /// 関数シンボルをアドレス順に列挙
    pub fn functions(&self) -> impl Iterator<Item = (SymbolId, &AsmSymbol)> {
        self.symbols
            .iter()
            .enumerate()
            .filter(|(_, symbol)| symbol.is_function())
            .map(|(index, symbol)| (SymbolId(index), symbol))
    }

    /// 名前（別名を含む）でシンボルを検索
    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbols
            .iter()
            .position(|symbol| symbol.matches(name))
            .map(SymbolId)
    }

    /// アドレスでシンボルを検索
    pub fn symbol_at(&self, address: u64) -> Option<SymbolId> {
        self.symbols
            .binary_search_by_key(&address, |symbol| symbol.address)
            .ok()
            .map(SymbolId)
    }

    /// シンボル先頭からセクション終端までのバイト列
    pub fn symbol_code(&self, id: SymbolId) -> Result<&[u8]> {
        let symbol = self
            .symbol(id)
            .ok_or_else(|| LiftError::SymbolNotFound(format!("#{}", id.0)))?;
        let no_code = || LiftError::NoCode {
            name: symbol.name.clone(),
            address: symbol.address,
        };
        let section = self.section(symbol.section).ok_or_else(no_code)?;
        let offset = usize::try_from(symbol.address - section.address).map_err(|_| no_code())?;
        section.data().get(offset..).ok_or_else(no_code)
    }
}

struct PendingSymbol {
    name: String,
    address: u64,
    size: u64,
    flags: SymbolFlags,
}

/// LoadedBinaryの組み立て
///
/// シンボルはbuild()でアドレス順に並べ替え、同一アドレスは別名としてまとめる。
pub struct BinaryBuilder {
    arch: Option<Architecture>,
    sections: Vec<Section>,
    symbols: Vec<PendingSymbol>,
}

impl BinaryBuilder {
    pub fn new(arch: Option<Architecture>) -> Self {
        Self {
            arch,
            sections: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// データ長をそのままサイズとするセクションを追加
    pub fn add_section(&mut self, name: &str, address: u64, data: Vec<u8>, executable: bool) -> SectionId {
        let size = data.len() as u64;
        self.add_section_sized(name, address, size, data, executable)
    }

    pub fn add_section_sized(
        &mut self,
        name: &str,
        address: u64,
        size: u64,
        data: Vec<u8>,
        executable: bool,
    ) -> SectionId {
        let id = SectionId(self.sections.len());
        self.sections.push(Section {
            id,
            name: name.to_string(),
            address,
            size,
            executable,
            data,
        });
        id
    }

    pub fn add_symbol(&mut self, name: &str, address: u64, size: u64, flags: SymbolFlags) {
        self.symbols.push(PendingSymbol {
            name: name.to_string(),
            address,
            size,
            flags,
        });
    }

    pub fn build(self) -> LoadedBinary {
        let BinaryBuilder {
            arch,
            sections,
            mut symbols,
        } = self;

        symbols.sort_by_key(|symbol| symbol.address);

        let mut merged: Vec<AsmSymbol> = Vec::new();
        for pending in symbols {
            if let Some(last) = merged.last_mut() {
                if last.address == pending.address {
                    if !last.matches(&pending.name) {
                        last.aliases.push(pending.name);
                    }
                    last.flags |= pending.flags;
                    last.size = last.size.max(pending.size);
                    continue;
                }
            }
            // どのセクションにも属さないシンボルは捨てる
            let section = match sections.iter().find(|s| s.contains(pending.address)) {
                Some(section) => section,
                None => continue,
            };
            merged.push(AsmSymbol {
                name: pending.name,
                address: pending.address,
                size: pending.size,
                flags: pending.flags,
                section: section.id,
                aliases: Vec::new(),
            });
        }

        // サイズ不明のシンボルは次のシンボル（同一セクション内）かセクション終端で区切る
        let bounds: Vec<u64> = (0..merged.len())
            .map(|index| {
                let symbol = &merged[index];
                let section_end = sections[symbol.section.0].end();
                let next = merged
                    .get(index + 1)
                    .filter(|next| next.section == symbol.section)
                    .map_or(section_end, |next| next.address);
                next.min(section_end).saturating_sub(symbol.address)
            })
            .collect();
        for (symbol, bound) in merged.iter_mut().zip(bounds) {
            if symbol.size == 0 {
                symbol.size = bound;
            }
        }

        LoadedBinary {
            arch,
            sections,
            symbols: merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_binary() -> LoadedBinary {
        let mut builder = BinaryBuilder::new(Some(Architecture::X86_64));
        builder.add_section(".text", 0x1000, vec![0x90; 0x40], true);
        builder.add_section(".data", 0x2000, vec![0; 0x10], false);
        builder.add_symbol("second", 0x1020, 0, SymbolFlags::FUNCTION);
        builder.add_symbol("main", 0x1000, 0x10, SymbolFlags::FUNCTION | SymbolFlags::GLOBAL);
        builder.add_symbol("_start_alias", 0x1000, 0, SymbolFlags::FUNCTION);
        builder.add_symbol("counter", 0x2008, 4, SymbolFlags::OBJECT);
        builder.add_symbol("nowhere", 0x9000, 4, SymbolFlags::FUNCTION);
        builder.build()
    }

    #[test]
    fn test_symbols_sorted_and_merged() {
        let binary = sample_binary();
        let names: Vec<_> = binary.symbols().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["main", "second", "counter"]);

        let main = binary.symbol(SymbolId(0)).unwrap();
        assert_eq!(main.aliases, vec!["_start_alias".to_string()]);
        assert_eq!(main.size, 0x10);
        assert!(main.flags.contains(SymbolFlags::GLOBAL));
    }

    #[test]
    fn test_size_bound_inferred() {
        let binary = sample_binary();
        let second = binary.symbol(binary.find_symbol("second").unwrap()).unwrap();
        // 次のシンボルは別セクションなのでセクション終端まで
        assert_eq!(second.size, 0x20);
    }

    #[test]
    fn test_find_by_alias_and_address() {
        let binary = sample_binary();
        assert_eq!(binary.find_symbol("_start_alias"), Some(SymbolId(0)));
        assert_eq!(binary.symbol_at(0x1020), Some(SymbolId(1)));
        assert_eq!(binary.symbol_at(0x1021), None);
        assert_eq!(binary.functions().count(), 2);
    }

    #[test]
    fn test_symbol_code() {
        let binary = sample_binary();
        let code = binary.symbol_code(SymbolId(1)).unwrap();
        assert_eq!(code.len(), 0x20);

        let counter = binary.find_symbol("counter").unwrap();
        assert_eq!(binary.symbol_code(counter).unwrap().len(), 8);
        assert!(matches!(
            binary.symbol_code(SymbolId(42)),
            Err(LiftError::SymbolNotFound(_))
        ));
    }

    #[test]
    fn test_section_at_top_of_address_space() {
        let mut builder = BinaryBuilder::new(Some(Architecture::X86_64));
        builder.add_section(".text", u64::MAX - 0x10, vec![0xc3; 0x40], true);
        builder.add_symbol("top", u64::MAX - 0x8, 0, SymbolFlags::FUNCTION);
        let binary = builder.build();

        let section = binary.section(SectionId(0)).unwrap();
        assert_eq!(section.end(), u64::MAX);
        assert!(section.contains(u64::MAX - 1));

        let top = binary.symbol(SymbolId(0)).unwrap();
        assert_eq!(top.size, 8);
        assert_eq!(binary.symbol_code(SymbolId(0)).unwrap().len(), 0x38);
    }

    #[test]
    fn test_checked_address_overflow() {
        assert_eq!(checked_address(".text", 0x40_0000, 0x1000).unwrap(), 0x40_1000);
        match checked_address(".text", u64::MAX - 0x10, 0x40) {
            Err(LiftError::AddressOverflow { name, base, offset }) => {
                assert_eq!(name, ".text");
                assert_eq!(base, u64::MAX - 0x10);
                assert_eq!(offset, 0x40);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(LoadedBinary::parse(b"definitely not an object file").is_err());
    }
}
