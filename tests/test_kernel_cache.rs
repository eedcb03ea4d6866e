//! 内核编译缓存键测试

mod common;

use common::write_file;
use seed_recovery_cl::config::{BruteTarget, SeedMode};
use seed_recovery_cl::kernel_loader::{BuildOptions, KernelCache, compute_content_hash, kernel_files, load_kernel_source};

fn kernel_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "main.cl", b"#include \"sha.h\"\n#define BIG_ENDIAN_PASSWORD\n__kernel void verify() {}\n");
    write_file(dir.path(), "sha.h", b"// sha\n");
    write_file(dir.path(), "notes.txt", b"ignored\n");
    dir
}

fn bip39_options() -> BuildOptions {
    BuildOptions {
        wnaf_window: 2,
        seed_mode: SeedMode::Bip39,
        combinational: false,
        brute_target: BruteTarget::Seed,
        cache_bust: false,
    }
}

#[test]
fn test_hash_is_stable() {
    let dir = kernel_dir();
    let env = dir.path().join(".env");
    let a = compute_content_hash(dir.path(), &env, "").unwrap();
    let b = compute_content_hash(dir.path(), &env, "").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
}

#[test]
fn test_hash_changes_with_kernel_source() {
    let dir = kernel_dir();
    let env = dir.path().join(".env");
    let before = compute_content_hash(dir.path(), &env, "").unwrap();
    write_file(dir.path(), "sha.h", b"// sha v2\n");
    let after = compute_content_hash(dir.path(), &env, "").unwrap();
    assert_ne!(before, after);
}

#[test]
fn test_hash_ignores_other_files() {
    let dir = kernel_dir();
    let env = dir.path().join(".env");
    let before = compute_content_hash(dir.path(), &env, "").unwrap();
    write_file(dir.path(), "notes.txt", b"changed\n");
    assert_eq!(before, compute_content_hash(dir.path(), &env, "").unwrap());
    assert_eq!(kernel_files(dir.path()).len(), 2);
}

#[test]
fn test_hash_depends_on_env_file() {
    let dir = kernel_dir();
    let env = dir.path().join(".env");
    let missing = compute_content_hash(dir.path(), &env, "").unwrap();
    write_file(dir.path(), ".env", b"SEED=abc\n");
    let present = compute_content_hash(dir.path(), &env, "").unwrap();
    assert_ne!(missing, present);
}

#[test]
fn test_password_substituted_into_source() {
    let dir = kernel_dir();
    let plain = load_kernel_source(dir.path(), "").unwrap();
    assert!(plain.contains("#define BIG_ENDIAN_PASSWORD"));
    let with_password = load_kernel_source(dir.path(), "hunter2").unwrap();
    assert!(!with_password.contains("#define BIG_ENDIAN_PASSWORD"));
    assert!(with_password.contains("inner_data[31]"));
}

#[test]
fn test_cache_path_layout() {
    let dir = kernel_dir();
    let cache = KernelCache::new(dir.path(), &dir.path().join(".env"), "").unwrap();
    let options = bip39_options();
    let path = cache.cache_path("NVIDIA GeForce RTX 4090", 1, &options);
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(
        name,
        format!("main.NVIDIA_GeForce_RTX_4090.1-{}.clbin", cache.binary_hash(&options))
    );
    assert_eq!(cache.binary_hash(&options).len(), 64);
    assert_eq!(path.parent().unwrap(), dir.path().join("cache"));
}

#[test]
fn test_cache_path_depends_on_build_options() {
    let dir = kernel_dir();
    let cache = KernelCache::new(dir.path(), &dir.path().join(".env"), "").unwrap();
    let base = bip39_options();
    let base_path = cache.cache_path("GPU", 0, &base);

    let variants = [
        BuildOptions { wnaf_window: 4, ..base.clone() },
        BuildOptions { seed_mode: SeedMode::Electrum, ..base.clone() },
        BuildOptions { combinational: true, ..base.clone() },
        BuildOptions { brute_target: BruteTarget::Password, ..base.clone() },
    ];
    for options in &variants {
        assert_ne!(cache.cache_path("GPU", 0, options), base_path, "{:?}", options);
    }
    for (i, a) in variants.iter().enumerate() {
        for b in &variants[i + 1..] {
            assert_ne!(cache.cache_path("GPU", 0, a), cache.cache_path("GPU", 0, b));
        }
    }
}

#[test]
fn test_cache_bust_does_not_change_cache_path() {
    let dir = kernel_dir();
    let cache = KernelCache::new(dir.path(), &dir.path().join(".env"), "").unwrap();
    let base = bip39_options();
    let busted = BuildOptions { cache_bust: true, ..base.clone() };
    assert_eq!(cache.cache_path("GPU", 0, &base), cache.cache_path("GPU", 0, &busted));
    assert!(busted.args().len() > busted.stable_args().len());
}
