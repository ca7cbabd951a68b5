//! ELFローダーとシンボルテーブルのテスト

use ulp_elf::{BuildId, ElfImage, SymbolKind};

#[no_mangle]
#[inline(never)]
pub extern "C" fn ulp_elf_test_marker(x: u64) -> u64 {
    std::hint::black_box(x) + 1
}

#[test]
fn test_load_self() {
    // テストバイナリ自身を解析する
    let image = ElfImage::load("/proc/self/exe").expect("Failed to load test binary");

    assert!(!image.segments().is_empty(), "Should have PT_LOAD segments");
    assert!(!image.symbols().is_empty(), "Should have symbols");

    let marker = image
        .symbols()
        .get("ulp_elf_test_marker")
        .expect("Should find exported marker function");
    assert_eq!(marker.kind, SymbolKind::Text);
    assert!(marker.size > 0);
    assert_eq!(ulp_elf_test_marker(1), 2);

    // 逆引きで同じシンボルに戻る
    let back = image.symbols().reverse_resolve(marker.address + 1).unwrap();
    assert_eq!(back.name, "ulp_elf_test_marker");

    println!(
        "loaded {:?}: pie={} segments={} symbols={}",
        image.path(),
        image.is_pie(),
        image.segments().len(),
        image.symbols().len()
    );
}

#[test]
fn test_build_id_matches_object_crate_view() {
    let image = ElfImage::load("/proc/self/exe").expect("Failed to load test binary");

    // ビルドIDを持たないツールチェーンもあるので、ある場合だけ形式を確認する
    if let Some(note) = image.build_id_note() {
        assert!(!note.bytes.is_empty());
        if note.bytes.len() == 20 {
            let id = BuildId::from_slice(&note.bytes).unwrap();
            assert_eq!(id.to_string().len(), 40);
        }
        if let Some(addr) = note.address {
            // ノートはいずれかのPT_LOADに含まれる
            assert!(image
                .segments()
                .iter()
                .any(|s| addr >= s.address && addr < s.address + s.size));
        }
    }
}

#[test]
fn test_load_missing_file() {
    let err = ElfImage::load("/nonexistent/ulp/binary").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/ulp/binary"));
}
