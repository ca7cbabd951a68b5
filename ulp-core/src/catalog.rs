//! ロード済みモジュールのカタログ
//!
//! ターゲットのメモリマップからファイル由来のイメージを列挙し、ロードバイアス、
//! ビルドID、シンボルテーブル、マップ済みセグメントをまとめます。
//! アタッチした時点のスナップショットであり、その後の変化は追跡しません。

use crate::errors::PatchError;
use crate::target::Target;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use ulp_elf::{BuildId, ElfImage, LoadSegment, SymbolKind, SymbolTable};
use ulp_target::MemoryMapping;

/// ロード済みモジュール
#[derive(Debug, Clone)]
pub struct LoadedModule {
    /// モジュール名（ファイル名）
    pub name: String,
    /// ターゲットから見たファイルパス
    pub path: PathBuf,
    /// ロードバイアス（実行時アドレス - リンク時アドレス）
    pub bias: u64,
    /// ビルドID（20バイトのノートがなければ None）
    pub build_id: Option<BuildId>,
    /// ディスク上のファイルがロード済みイメージと一致しない
    pub stale: bool,
    /// シンボルテーブル（リンク時アドレス）
    pub symbols: SymbolTable,
    /// このモジュールのマッピング
    pub segments: Vec<MemoryMapping>,
}

/// 実行時アドレスに解決されたシンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub module: String,
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

impl LoadedModule {
    /// モジュール名またはフルパスが一致するか
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.path == Path::new(name)
    }

    /// シンボルを実行時アドレスで取得する
    pub fn symbol(&self, name: &str) -> Option<ResolvedSymbol> {
        self.symbols.get(name).map(|s| ResolvedSymbol {
            module: self.name.clone(),
            name: s.name.clone(),
            address: s.address.wrapping_add(self.bias),
            size: s.size,
            kind: s.kind,
        })
    }

    /// [addr, addr+len) がいずれか1つのマッピングに完全に含まれるか
    pub fn contains_span(&self, addr: u64, len: u64) -> bool {
        self.segments.iter().any(|m| m.contains_span(addr, len))
    }

    /// 実行時アドレスを含むシンボル名
    pub fn symbolize(&self, addr: u64) -> Option<&str> {
        if !self.segments.iter().any(|m| addr >= m.start && addr < m.end) {
            return None;
        }
        self.symbols
            .reverse_resolve(addr.wrapping_sub(self.bias))
            .map(|s| s.display_name())
    }
}

/// モジュールカタログ
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: Vec<LoadedModule>,
}

impl ModuleCatalog {
    /// 既に解析済みのモジュールからカタログを作成する
    pub fn from_modules(modules: Vec<LoadedModule>) -> Self {
        Self { modules }
    }

    /// ターゲットのメモリマップからモジュールを列挙する
    pub fn discover<T: Target>(target: &T) -> Result<Self, PatchError> {
        let mappings = target.mappings().map_err(PatchError::MemoryAccess)?;

        // パスごとにマッピングをまとめる（アドレス順を保つ）
        let mut by_path: BTreeMap<u64, (PathBuf, Vec<MemoryMapping>)> = BTreeMap::new();
        let mut first_start: BTreeMap<PathBuf, u64> = BTreeMap::new();
        let mut anonymous = Vec::new();
        for mapping in mappings {
            let Some(path) = mapping.path.clone() else {
                anonymous.push(mapping);
                continue;
            };
            let key = *first_start.entry(path.clone()).or_insert(mapping.start);
            by_path
                .entry(key)
                .or_insert_with(|| (path, Vec::new()))
                .1
                .push(mapping);
        }

        let mut modules = Vec::new();
        for (_, (path, segments)) in by_path {
            if path.to_string_lossy().ends_with(" (deleted)") {
                tracing::warn!("skipping {:?}: file was deleted after loading", path);
                continue;
            }
            match load_module(target, &path, segments, &anonymous) {
                Some(module) => modules.push(module),
                None => tracing::trace!("{:?} is not a loadable ELF image", path),
            }
        }

        tracing::debug!(pid = target.pid(), modules = modules.len(), "module catalog built");
        Ok(Self { modules })
    }

    /// 全モジュール
    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    /// 名前（ファイル名またはパス）でモジュールを取得する
    pub fn module(&self, name: &str) -> Result<&LoadedModule, PatchError> {
        self.modules
            .iter()
            .find(|m| m.matches(name))
            .ok_or_else(|| PatchError::ModuleNotFound(name.to_string()))
    }

    /// モジュール内のシンボルを実行時アドレスに解決する
    pub fn resolve(&self, module: &str, symbol: &str) -> Result<ResolvedSymbol, PatchError> {
        self.module(module)?
            .symbol(symbol)
            .ok_or_else(|| PatchError::SymbolNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })
    }

    /// モジュールの観測されたビルドID
    pub fn build_id_of(&self, module: &str) -> Result<Option<BuildId>, PatchError> {
        Ok(self.module(module)?.build_id)
    }

    /// 実行時アドレスを "module!symbol" 形式で表す（診断用）
    pub fn symbolize(&self, addr: u64) -> String {
        for module in &self.modules {
            if let Some(name) = module.symbolize(addr) {
                return format!("{}!{}", module.name, name);
            }
        }
        format!("{:#x}", addr)
    }
}

/// 1つのモジュールを解析する。ELFでないファイルのマッピングは None
fn load_module<T: Target>(
    target: &T,
    path: &Path,
    mut segments: Vec<MemoryMapping>,
    anonymous: &[MemoryMapping],
) -> Option<LoadedModule> {
    // ターゲットのマウント名前空間から見たパスを優先する
    let in_root = PathBuf::from(format!("/proc/{}/root{}", target.pid(), path.display()));
    let image = ElfImage::load(&in_root)
        .or_else(|_| ElfImage::load(path))
        .ok()?;

    let base = segments.iter().find(|m| m.offset == 0)?.start;
    let bias = base.wrapping_sub(image.first_load_address());
    adopt_zero_fill(&mut segments, anonymous, image.segments(), bias);

    let mut stale = false;
    let build_id = image.build_id_note().and_then(|note| {
        let live = note
            .address
            .and_then(|addr| target.read(addr.wrapping_add(bias), note.bytes.len()).ok());
        match live {
            Some(live) if live != note.bytes => {
                tracing::warn!(
                    "{:?} on disk differs from the loaded image; using the loaded build id",
                    path
                );
                stale = true;
                BuildId::from_slice(&live)
            }
            _ => BuildId::from_slice(&note.bytes),
        }
    });

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Some(LoadedModule {
        name,
        path: path.to_path_buf(),
        bias,
        build_id,
        stale,
        symbols: image.symbols().clone(),
        segments,
    })
}

/// PT_LOAD のうちファイルに無い部分（.bss）は匿名マッピングになるので、
/// メモリ上の範囲と重なる匿名マッピングをモジュールのものとして加える
fn adopt_zero_fill(
    segments: &mut Vec<MemoryMapping>,
    anonymous: &[MemoryMapping],
    loads: &[LoadSegment],
    bias: u64,
) {
    for mapping in anonymous {
        let overlaps = loads.iter().any(|load| {
            let start = load.address.wrapping_add(bias);
            let end = start.saturating_add(load.size);
            mapping.start < end && mapping.end > start
        });
        if overlaps && !segments.contains(mapping) {
            segments.push(mapping.clone());
        }
    }
    segments.sort_by_key(|m| m.start);
}
