//! シンボルテーブル

use object::{Object, ObjectSymbol};
use std::collections::HashMap;

/// シンボルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// 関数（コード）
    Text,
    /// データ
    Data,
    /// その他
    Other,
}

/// シンボル情報
///
/// アドレスはリンク時の仮想アドレスです。実行時アドレスにはロードバイアスを加えます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64, kind: SymbolKind) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
            kind,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボルテーブル（.symtab と .dynsym を統合したもの）
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートしたシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolTable {
    /// オブジェクトファイルから定義済みシンボルを集める
    ///
    /// 同名のシンボルが両方のテーブルにある場合は、サイズ情報を持つ方を優先します。
    pub fn new(object_file: &object::File<'_>) -> Self {
        let mut table = Self::default();
        for symbol in object_file.symbols().chain(object_file.dynamic_symbols()) {
            if !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let kind = match symbol.kind() {
                object::SymbolKind::Text => SymbolKind::Text,
                object::SymbolKind::Data | object::SymbolKind::Tls => SymbolKind::Data,
                _ => SymbolKind::Other,
            };
            table.insert(Symbol::new(name.to_string(), symbol.address(), symbol.size(), kind));
        }
        table.symbols_by_address.sort_by_key(|s| s.address);
        table
    }

    /// シンボル一覧から作成する
    pub fn from_symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        let mut table = Self::default();
        for symbol in symbols {
            table.insert(symbol);
        }
        table.symbols_by_address.sort_by_key(|s| s.address);
        table
    }

    fn insert(&mut self, symbol: Symbol) {
        match self.symbols_by_name.get(&symbol.name) {
            Some(existing) if existing.size >= symbol.size => return,
            Some(_) => self.symbols_by_address.retain(|s| s.name != symbol.name),
            None => {}
        }
        self.symbols_by_name.insert(symbol.name.clone(), symbol.clone());
        self.symbols_by_address.push(symbol);
    }

    /// シンボル名からシンボルを取得する
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols_by_name.get(name)
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.get(name).map(|s| s.address)
    }

    /// アドレスを含むシンボルを返す
    ///
    /// サイズ情報がないシンボルは、直前のシンボルとして最も近いものを返します。
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.symbols_by_address.partition_point(|s| s.address <= addr);
        let sym = self.symbols_by_address.get(idx.checked_sub(1)?)?;
        if sym.size == 0 || addr < sym.address + sym.size {
            Some(sym)
        } else {
            None
        }
    }

    /// すべてのシンボルを取得する（アドレス順）
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// シンボルの数
    pub fn len(&self) -> usize {
        self.symbols_by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols_by_address.is_empty()
    }

    /// パターンにマッチするシンボルを検索する
    /// マングル名とデマングル名の両方で検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.symbols_by_address
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::from_symbols([
            Symbol::new("banner_get".into(), 0x1100, 0x20, SymbolKind::Text),
            Symbol::new("banner_set".into(), 0x1120, 0x30, SymbolKind::Text),
            Symbol::new("BANNER".into(), 0x4000, 8, SymbolKind::Data),
            Symbol::new("_start".into(), 0x1000, 0, SymbolKind::Text),
        ])
    }

    #[test]
    fn test_resolve() {
        let t = table();
        assert_eq!(t.resolve("banner_set"), Some(0x1120));
        assert_eq!(t.resolve("missing"), None);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn test_reverse_resolve() {
        let t = table();
        assert_eq!(t.reverse_resolve(0x1125).unwrap().name, "banner_set");
        assert_eq!(t.reverse_resolve(0x1100).unwrap().name, "banner_get");
        // サイズ不明のシンボルは最寄りとして返る
        assert_eq!(t.reverse_resolve(0x1050).unwrap().name, "_start");
        // banner_set の終端の外
        assert!(t.reverse_resolve(0x1150).is_none());
        assert!(t.reverse_resolve(0x10).is_none());
    }

    #[test]
    fn test_duplicate_prefers_sized() {
        let t = SymbolTable::from_symbols([
            Symbol::new("f".into(), 0x10, 0, SymbolKind::Text),
            Symbol::new("f".into(), 0x10, 16, SymbolKind::Text),
        ]);
        assert_eq!(t.get("f").unwrap().size, 16);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_find_symbols() {
        let t = table();
        let found: Vec<&str> = t.find_symbols("banner").iter().map(|s| s.name.as_str()).collect();
        assert_eq!(found, vec!["banner_get", "banner_set"]);
    }
}
