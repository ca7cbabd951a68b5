//! 取り消しと適用済みパッチの列挙の統合テスト

mod common;

use common::*;
use ulp_core::revert::find_records;
use ulp_core::{PatchApplier, PatchError, PatchRecord, RedirectionKind, RevertLog, RevertRecord};
use ulp_target::MemoryMapping;

/// 1セッション分の適用を行い、ターゲットを返す
fn apply_session(fake: FakeTarget, patch: &ulp_core::PatchContainer, label: &str) -> (FakeTarget, PatchRecord) {
    let catalog = catalog(&fake);
    let mut applier = PatchApplier::new(fake, options());
    let record = applier.apply(&catalog, patch, label).unwrap();
    applier.detach().unwrap();
    (applier.into_target(), record)
}

#[test]
fn test_stacked_patches_revert_newest_first() {
    let fake = FakeTarget::new();
    let before = fake.module_image();

    let (fake, first) = apply_session(fake, &container(vec![function("banner_set", &[0xc3])]), "a");
    let after_first = fake.module_image();
    let (fake, second) = apply_session(
        fake,
        &container(vec![
            function("banner_set", &[0x31, 0xc0, 0xc3]),
            data("BANNER", &99u64.to_le_bytes()),
        ]),
        "b",
    );
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    // 2つ目が保存した元のバイト列は1つ目の分岐命令
    assert_eq!(
        second.log.records()[0].original,
        after_first[1].1[0x120..0x125].to_vec()
    );

    let catalog = catalog(&fake);
    let mut applier = PatchApplier::new(fake, options());
    let status = applier.status().unwrap();
    let labels: Vec<&str> = status.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["a", "b"]);

    let reverted = applier.revert(&catalog, false).unwrap();
    assert_eq!(reverted.len(), 1);
    assert_eq!(reverted[0].sequence, 2);
    assert_eq!(applier.target().module_image(), after_first);
    assert_eq!(applier.status().unwrap().len(), 1);

    let reverted = applier.revert(&catalog, false).unwrap();
    assert_eq!(reverted[0].sequence, 1);
    assert_eq!(applier.target().module_image(), before);
    assert!(applier.target().regions().is_empty());

    let err = applier.revert(&catalog, false).unwrap_err();
    assert_eq!(err.code(), 267);
    assert!(matches!(err, PatchError::NotPatched(PID)));
}

#[test]
fn test_revert_all() {
    let fake = FakeTarget::new();
    let before = fake.module_image();
    let (fake, _) = apply_session(fake, &container(vec![function("banner_set", &[0xc3])]), "a");
    let (fake, _) = apply_session(fake, &container(vec![data("FLAG", &0u32.to_le_bytes())]), "b");
    let (fake, _) = apply_session(fake, &container(vec![function("banner_set", &[0x90, 0xc3])]), "c");

    let catalog = catalog(&fake);
    let mut applier = PatchApplier::new(fake, options());
    let reverted = applier.revert(&catalog, true).unwrap();
    let order: Vec<u32> = reverted.iter().map(|r| r.sequence).collect();
    assert_eq!(order, vec![3, 2, 1]);
    assert_eq!(applier.target().module_image(), before);
    assert!(applier.status().unwrap().is_empty());
}

#[test]
fn test_revert_waits_for_replacement_code() {
    let fake = FakeTarget::new();
    let before = fake.module_image();
    let (mut fake, record) =
        apply_session(fake, &container(vec![function("banner_set", &[0x90, 0x90, 0xc3])]), "a");
    let patched = fake.module_image();

    // 置き換えコードの中で止まっているスレッド
    fake.schedule = vec![vec![thread_at(9, record.code_start + 1, &[])]].into();
    let catalog = catalog(&fake);
    let mut applier = PatchApplier::new(fake, options());
    let err = applier.revert(&catalog, false).unwrap_err();
    match err {
        PatchError::BusyTarget { symbol, tid, .. } => {
            assert_eq!(tid, 9);
            assert!(symbol.contains("replacement code"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(applier.target().module_image(), patched);

    // 分岐命令の上にいる場合はシンボル名で報告される
    applier.target_mut().schedule = vec![vec![thread_at(9, BANNER_SET + 1, &[])]].into();
    let err = applier.revert(&catalog, false).unwrap_err();
    assert!(matches!(err, PatchError::BusyTarget { ref symbol, .. } if symbol == "banner!banner_set"));

    applier.target_mut().schedule = vec![vec![idle_thread(9)]].into();
    applier.revert(&catalog, false).unwrap();
    assert_eq!(applier.target().module_image(), before);
}

#[test]
fn test_revert_restore_failure_is_fatal() {
    let fake = FakeTarget::new();
    let (mut fake, _) = apply_session(fake, &container(vec![function("banner_set", &[0xc3])]), "a");
    fake.fail_after_writes = Some(fake.writes);

    let catalog = catalog(&fake);
    let mut applier = PatchApplier::new(fake, options());
    let err = applier.revert(&catalog, false).unwrap_err();
    assert!(matches!(err, PatchError::FatalInconsistentState { .. }));
}

#[test]
fn test_records_in_merged_mapping_are_all_found() {
    let mut fake = FakeTarget::new();
    let base = 0x6000_0000_0000u64;
    let mut bytes = vec![0u8; 0x3000];

    for (i, sequence) in [(0usize, 4u32), (2, 5)] {
        let region = base + (i as u64) * 0x1000;
        let mut log = RevertLog::new();
        log.push(RevertRecord {
            address: BANNER,
            kind: RedirectionKind::Data,
            original: vec![sequence as u8; 8],
        });
        let record = PatchRecord {
            sequence,
            label: format!("p{}", sequence),
            region,
            region_len: 0x1000,
            code_start: region + 0x80,
            code_end: region + 0x80,
            log,
        };
        let encoded = record.encode();
        let off = i * 0x1000;
        bytes[off..off + encoded.len()].copy_from_slice(&encoded);
    }

    fake.segments.push(Segment {
        mapping: MemoryMapping {
            start: base,
            end: base + 0x3000,
            readable: true,
            writable: false,
            executable: true,
            offset: 0,
            path: None,
        },
        bytes,
    });

    let records = find_records(&fake).unwrap();
    let found: Vec<(u32, u64)> = records.iter().map(|r| (r.sequence, r.region)).collect();
    assert_eq!(found, vec![(4, base), (5, base + 0x2000)]);
    assert_eq!(records[1].label, "p5");
}
