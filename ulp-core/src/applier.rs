//! パッチの適用と取り消し
//!
//! 1回のセッションは次の状態を辿ります。
//!
//! ```text
//! Idle → Attached → Verified → Quiesced → Applying → {Applied | RolledBack} → Detached
//! ```
//!
//! 検証と静止確認が終わるまではターゲットのメモリに一切書き込みません。
//! 書き込みが途中で失敗した場合は、それまでの書き換えを逆順に元へ戻してから
//! エラーを返します。元へ戻すこと自体に失敗した場合だけ、ターゲットが
//! 不整合な状態に残ったことを報告します。

use crate::branch::{encode_jump, ABS_JUMP_LEN, REL32_JUMP_LEN};
use crate::catalog::ModuleCatalog;
use crate::consistency::ConsistencyChecker;
use crate::container::{PatchContainer, RedirectionKind};
use crate::disasm::entry_span;
use crate::errors::{PatchError, VerifyFailure};
use crate::options::PatchOptions;
use crate::revert::{find_records, PatchRecord, RevertLog, RevertRecord, MAX_LABEL_LEN};
use crate::target::Target;
use ulp_target::remote::page_align;
use ulp_target::TargetError;

/// 入口のサイズが分からない関数について逆アセンブルするバイト数
const ENTRY_PROBE_LEN: u64 = 32;
/// 置き換えコードの配置境界
const CODE_ALIGN: u64 = 16;

fn align_code(offset: u64) -> u64 {
    (offset + CODE_ALIGN - 1) & !(CODE_ALIGN - 1)
}

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    Attached,
    Verified,
    Quiesced,
    Applying,
    /// 書き換えが完了した
    Applied,
    /// 書き換えが元に戻された（失敗時の巻き戻し、または revert の完了）
    RolledBack,
    Detached,
}

/// 検証済みの書き換え1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRedirection {
    pub module: String,
    pub symbol: String,
    pub kind: RedirectionKind,
    /// 書き換え先の実行時アドレス
    pub address: u64,
    /// 関数は入口から命令境界まで、データはシンボルのサイズ
    pub capacity: u64,
    /// 関数入口に置ける分岐命令の最大長
    pub max_branch: u64,
    pub payload: Vec<u8>,
}

/// 検証を通過した適用計画
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    redirections: Vec<PlannedRedirection>,
    /// 置き換えコードを確保するときのアドレスのヒント
    near: u64,
}

impl Plan {
    pub fn redirections(&self) -> &[PlannedRedirection] {
        &self.redirections
    }

    /// 関数の書き換え範囲を保護する静止確認
    pub fn checker(&self) -> ConsistencyChecker {
        let mut checker = ConsistencyChecker::new();
        for r in self
            .redirections
            .iter()
            .filter(|r| r.kind == RedirectionKind::Function)
        {
            checker.guard(
                r.address,
                r.capacity.max(REL32_JUMP_LEN as u64),
                format!("{}!{}", r.module, r.symbol),
            );
        }
        checker
    }
}

/// ターゲットへ書き込む1件
struct PendingWrite {
    address: u64,
    kind: RedirectionKind,
    bytes: Vec<u8>,
}

/// パッチ適用エンジン
pub struct PatchApplier<T: Target> {
    target: T,
    options: PatchOptions,
    state: ApplyState,
}

impl<T: Target> PatchApplier<T> {
    /// アタッチ済みのターゲットからエンジンを作成する
    pub fn new(target: T, options: PatchOptions) -> Self {
        tracing::debug!(pid = target.pid(), "{:?} -> {:?}", ApplyState::Idle, ApplyState::Attached);
        Self {
            target,
            options,
            state: ApplyState::Attached,
        }
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    fn transition(&mut self, next: ApplyState) {
        tracing::debug!(pid = self.target.pid(), "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// コンテナがロード済みのコードに適用できるか確かめる
    ///
    /// 依存モジュールのビルドIDをすべて照合し、各リダイレクションのシンボルを
    /// 解決して、書き換え範囲がモジュールのマッピングに収まり、関数の入口が
    /// 分岐命令を置ける大きさであることを確認します。
    pub fn verify(
        &mut self,
        catalog: &ModuleCatalog,
        container: &PatchContainer,
    ) -> Result<Plan, PatchError> {
        for (module, expected) in container.dependencies() {
            let loaded = catalog.module(module)?;
            if loaded.build_id != Some(expected) {
                return Err(PatchError::Verification {
                    module: module.to_string(),
                    reason: VerifyFailure::BuildIdMismatch {
                        expected,
                        found: loaded.build_id,
                    },
                });
            }
            if loaded.stale {
                return Err(PatchError::Verification {
                    module: module.to_string(),
                    reason: VerifyFailure::StaleImage,
                });
            }
        }

        let mut redirections = Vec::with_capacity(container.redirections().len());
        let mut near = None;
        for r in container.redirections() {
            let loaded = catalog.module(&r.module)?;
            let symbol = catalog.resolve(&r.module, &r.symbol)?;
            let fail = |reason| PatchError::Verification {
                module: r.module.clone(),
                reason,
            };

            let (capacity, max_branch) = match r.kind {
                RedirectionKind::Function => {
                    let capacity = self.entry_capacity(symbol.address, symbol.size, loaded)?;
                    if capacity < REL32_JUMP_LEN as u64 {
                        return Err(fail(VerifyFailure::FunctionTooSmall {
                            symbol: r.symbol.clone(),
                            size: capacity,
                            needed: REL32_JUMP_LEN as u64,
                        }));
                    }
                    if !loaded.contains_span(symbol.address, REL32_JUMP_LEN as u64) {
                        return Err(fail(VerifyFailure::OutsideSegment {
                            symbol: r.symbol.clone(),
                            address: symbol.address,
                            len: REL32_JUMP_LEN as u64,
                        }));
                    }
                    let max_branch = if capacity >= ABS_JUMP_LEN as u64
                        && loaded.contains_span(symbol.address, ABS_JUMP_LEN as u64)
                    {
                        ABS_JUMP_LEN as u64
                    } else {
                        REL32_JUMP_LEN as u64
                    };
                    if near.is_none() {
                        near = loaded.segments.iter().map(|m| m.end).max();
                    }
                    (capacity, max_branch)
                }
                RedirectionKind::Data => {
                    let len = r.payload.len() as u64;
                    if len > symbol.size {
                        return Err(fail(VerifyFailure::PayloadTooLarge {
                            symbol: r.symbol.clone(),
                            size: symbol.size,
                            payload: len,
                        }));
                    }
                    if !loaded.contains_span(symbol.address, len) {
                        return Err(fail(VerifyFailure::OutsideSegment {
                            symbol: r.symbol.clone(),
                            address: symbol.address,
                            len,
                        }));
                    }
                    (symbol.size, 0)
                }
            };

            tracing::debug!(
                "verified {}!{} at {:#x} ({:?}, capacity {})",
                r.module,
                r.symbol,
                symbol.address,
                r.kind,
                capacity
            );
            redirections.push(PlannedRedirection {
                module: r.module.clone(),
                symbol: r.symbol.clone(),
                kind: r.kind,
                address: symbol.address,
                capacity,
                max_branch,
                payload: r.payload.clone(),
            });
        }

        let near = near
            .or_else(|| redirections.first().map(|r| r.address))
            .unwrap_or(0);
        self.transition(ApplyState::Verified);
        Ok(Plan { redirections, near })
    }

    /// 関数の入口で書き換えてよいバイト数
    fn entry_capacity(
        &self,
        address: u64,
        size: u64,
        loaded: &crate::catalog::LoadedModule,
    ) -> Result<u64, PatchError> {
        if size > 0 {
            return Ok(size);
        }

        // サイズ情報がなければ、マッピングの終端を越えない範囲で逆アセンブルする
        let available = loaded
            .segments
            .iter()
            .find(|m| address >= m.start && address < m.end)
            .map(|m| (m.end - address).min(ENTRY_PROBE_LEN))
            .unwrap_or(0);
        if available == 0 {
            return Ok(0);
        }
        let code = self
            .target
            .read(address, available as usize)
            .map_err(PatchError::MemoryAccess)?;

        let span = entry_span(&code, address, ABS_JUMP_LEN)
            .or_else(|| entry_span(&code, address, REL32_JUMP_LEN))
            .unwrap_or(0);
        Ok(span as u64)
    }

    /// 書き換える関数を実行中のスレッドがいなくなるのを待つ
    pub fn quiesce(&mut self, plan: &Plan) -> Result<(), PatchError> {
        plan.checker().wait_quiescent(&mut self.target, &self.options)?;
        self.transition(ApplyState::Quiesced);
        Ok(())
    }

    /// 検証、静止確認、書き換えを続けて行う
    pub fn apply(
        &mut self,
        catalog: &ModuleCatalog,
        container: &PatchContainer,
        label: &str,
    ) -> Result<PatchRecord, PatchError> {
        let plan = self.verify(catalog, container)?;
        self.quiesce(&plan)?;
        self.write_plan(&plan, label)
    }

    /// 静止済みのターゲットに計画を書き込む
    pub fn write_plan(&mut self, plan: &Plan, label: &str) -> Result<PatchRecord, PatchError> {
        if label.len() > MAX_LABEL_LEN {
            return Err(PatchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "patch label is {} bytes, at most {} are recorded",
                    label.len(),
                    MAX_LABEL_LEN
                ),
            )));
        }

        let sequence = find_records(&self.target)?
            .last()
            .map_or(1, |r| r.sequence.wrapping_add(1));

        // 領域の先頭にレコード、その後ろに置き換えコードを並べる
        let record_len = PatchRecord::encoded_len(
            label,
            plan.redirections.iter().map(|r| match r.kind {
                RedirectionKind::Function => r.max_branch as usize,
                RedirectionKind::Data => r.payload.len(),
            }),
        ) as u64;
        let code_offset = align_code(record_len);
        let mut cursor = code_offset;
        let mut blob_offsets = Vec::with_capacity(plan.redirections.len());
        for r in &plan.redirections {
            if r.kind == RedirectionKind::Function {
                blob_offsets.push(Some(cursor));
                cursor = align_code(cursor + r.payload.len() as u64);
            } else {
                blob_offsets.push(None);
            }
        }
        let region_len = page_align(cursor);

        let region = self
            .target
            .allocate(region_len, plan.near)
            .map_err(PatchError::MemoryAccess)?;
        let code_start = region + code_offset;
        let code_end = region + cursor;
        tracing::debug!(
            "patch region {:#x}..{:#x}, code {:#x}..{:#x}",
            region,
            region + region_len,
            code_start,
            code_end
        );

        let mut writes = Vec::with_capacity(plan.redirections.len());
        for (r, offset) in plan.redirections.iter().zip(&blob_offsets) {
            let bytes = match offset {
                Some(offset) => {
                    let branch = encode_jump(r.address, region + offset);
                    if branch.len() as u64 > r.max_branch {
                        self.release_region(region, region_len);
                        return Err(PatchError::Verification {
                            module: r.module.clone(),
                            reason: VerifyFailure::FunctionTooSmall {
                                symbol: r.symbol.clone(),
                                size: r.capacity,
                                needed: branch.len() as u64,
                            },
                        });
                    }
                    branch
                }
                None => r.payload.clone(),
            };
            writes.push(PendingWrite {
                address: r.address,
                kind: r.kind,
                bytes,
            });
        }

        // 置き換えコードの書き込みもこの段階に含む。失敗してもモジュールは未変更
        self.transition(ApplyState::Applying);
        for (r, offset) in plan.redirections.iter().zip(&blob_offsets) {
            let Some(offset) = offset else { continue };
            if let Err(source) = self.target.write(region + offset, &r.payload) {
                tracing::warn!("writing replacement code for {} failed ({})", r.symbol, source);
                self.release_region(region, region_len);
                self.transition(ApplyState::RolledBack);
                return Err(PatchError::PartialWrite {
                    index: 0,
                    rolled_back: 0,
                    source,
                });
            }
        }

        let mut log = RevertLog::new();
        for (index, w) in writes.iter().enumerate() {
            let original = match self.target.read(w.address, w.bytes.len()) {
                Ok(original) => original,
                Err(e) => return Err(self.abort(&log, region, region_len, index, e)),
            };
            log.push(RevertRecord {
                address: w.address,
                kind: w.kind,
                original,
            });
            if let Err(e) = self.target.write(w.address, &w.bytes) {
                return Err(self.abort(&log, region, region_len, index, e));
            }
            tracing::debug!("wrote {} bytes at {:#x}", w.bytes.len(), w.address);
        }

        let record = PatchRecord {
            sequence,
            label: label.to_string(),
            region,
            region_len,
            code_start,
            code_end,
            log,
        };
        if let Err(e) = self.target.write(region, &record.encode()) {
            return Err(self.abort(&record.log, region, region_len, writes.len(), e));
        }

        self.transition(ApplyState::Applied);
        tracing::info!(
            pid = self.target.pid(),
            sequence,
            redirections = writes.len(),
            "patch applied"
        );
        Ok(record)
    }

    /// 途中で失敗した適用を巻き戻す
    fn abort(
        &mut self,
        log: &RevertLog,
        region: u64,
        region_len: u64,
        index: usize,
        source: TargetError,
    ) -> PatchError {
        tracing::warn!("write {} failed ({}), rolling back", index + 1, source);
        if let Err(fatal) = self.rollback(log) {
            return fatal;
        }
        self.release_region(region, region_len);
        self.transition(ApplyState::RolledBack);
        PatchError::PartialWrite {
            index: index + 1,
            rolled_back: index,
            source,
        }
    }

    /// ログを逆順に書き戻す。1件でも失敗すればターゲットは不整合
    fn rollback(&mut self, log: &RevertLog) -> Result<(), PatchError> {
        for record in log.iter_rev() {
            self.target
                .write(record.address, &record.original)
                .map_err(|e| PatchError::FatalInconsistentState {
                    pid: self.target.pid(),
                    reason: format!(
                        "failed to restore {} bytes at {:#x}: {}",
                        record.len(),
                        record.address,
                        e
                    ),
                })?;
        }
        Ok(())
    }

    fn release_region(&mut self, region: u64, len: u64) {
        if let Err(e) = self.target.release(region, len) {
            tracing::warn!("leaking patch region at {:#x}: {}", region, e);
        }
    }

    /// 適用済みのパッチを取り消す
    ///
    /// 既定では最も新しいパッチだけを、`all` なら全てを新しい順に取り消します。
    /// 対象の関数と置き換えコードを実行中のスレッドがあれば何もせずに失敗します。
    pub fn revert(
        &mut self,
        catalog: &ModuleCatalog,
        all: bool,
    ) -> Result<Vec<PatchRecord>, PatchError> {
        let mut records = find_records(&self.target)?;
        if records.is_empty() {
            return Err(PatchError::NotPatched(self.target.pid()));
        }
        records.reverse();
        if !all {
            records.truncate(1);
        }
        self.transition(ApplyState::Verified);

        let mut checker = ConsistencyChecker::new();
        for record in &records {
            for r in record
                .log
                .records()
                .iter()
                .filter(|r| r.kind == RedirectionKind::Function)
            {
                checker.guard(r.address, r.len() as u64, catalog.symbolize(r.address));
            }
            checker.guard(
                record.code_start,
                record.code_end - record.code_start,
                format!("patch #{} replacement code", record.sequence),
            );
        }
        checker.wait_quiescent(&mut self.target, &self.options)?;
        self.transition(ApplyState::Quiesced);

        self.transition(ApplyState::Applying);
        for record in &records {
            self.rollback(&record.log)?;
            if let Err(e) = self.target.write(record.region, &[0u8; 8]) {
                tracing::warn!("could not clear patch record at {:#x}: {}", record.region, e);
            }
            self.release_region(record.region, record.region_len);
            tracing::info!(
                pid = self.target.pid(),
                sequence = record.sequence,
                "patch reverted"
            );
        }

        self.transition(ApplyState::RolledBack);
        Ok(records)
    }

    /// 適用済みのパッチを古い順に列挙する
    pub fn status(&self) -> Result<Vec<PatchRecord>, PatchError> {
        find_records(&self.target)
    }

    /// ターゲットを再開して制御を手放す
    pub fn detach(&mut self) -> Result<(), PatchError> {
        if self.state == ApplyState::Detached {
            return Ok(());
        }
        self.target.detach().map_err(PatchError::MemoryAccess)?;
        self.transition(ApplyState::Detached);
        Ok(())
    }
}
