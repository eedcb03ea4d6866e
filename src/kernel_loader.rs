//! OpenCL 内核源代码加载与编译缓存
//!
//! 内核源码是外部产物 (`kernel/*.cl`, `kernel/*.h`)。编译产物按
//! (设备名标签, 设备序号, 内容哈希) 缓存为二进制文件，内容哈希覆盖所有内核
//! 文件以及 `.env` 配置 (密码先经过宏替换再参与哈希，不直接哈希原文)。

use log::{info, warn};
use ocl::enums::{ProgramInfo, ProgramInfoResult};
use ocl::{Device, Program};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BruteTarget, SeedMode};
use crate::opencl::OpenCLContext;

/// 主内核文件名
pub const MAIN_KERNEL: &str = "main.cl";
/// 源码中被替换为密码常量的占位行
pub const PASSWORD_PLACEHOLDER: &str = "#define BIG_ENDIAN_PASSWORD";

/// 生成 PBKDF2 内层块中密码部分的赋值语句
///
/// 密码字节后接 `00 00 00 01 80`，补零到 8 字节对齐，按大端 u64 写入
/// `inner_data[17..]`，`inner_data[31]` 为总位长。
pub fn password_macro(password: &str) -> String {
    let mut padded = password.as_bytes().to_vec();
    padded.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x80]);
    while padded.len() % 8 != 0 {
        padded.push(0);
    }

    let mut lines: Vec<String> = padded
        .chunks_exact(8)
        .enumerate()
        .map(|(i, chunk)| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            format!("inner_data[{}] = 0x{:016X}UL;", i + 17, u64::from_be_bytes(word))
        })
        .collect();
    lines.push(format!(
        "inner_data[31] = {}UL;",
        password.len() * 8 + 140 * 8
    ));
    lines.join("\n")
}

/// 密码非空时替换占位行
pub fn substitute_password(source: &str, password: &str) -> String {
    if password.is_empty() {
        source.to_string()
    } else {
        source.replace(PASSWORD_PLACEHOLDER, &password_macro(password))
    }
}

/// 加载主内核源码 (已做密码替换)
pub fn load_kernel_source(kernel_dir: &Path, password: &str) -> anyhow::Result<String> {
    let path = kernel_dir.join(MAIN_KERNEL);
    let source = fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("failed to read kernel {}: {}", path.display(), e))?;
    Ok(substitute_password(&source, password))
}

/// 参与哈希的内核文件，按路径排序
pub fn kernel_files(kernel_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(kernel_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext == "cl" || ext == "h")
                })
                .collect()
        })
        .unwrap_or_default();
    let main = kernel_dir.join(MAIN_KERNEL);
    if main.is_file() && !files.contains(&main) {
        files.push(main);
    }
    files.sort();
    files
}

/// 内容哈希: 所有内核文件 + `.env` 内容哈希 (十六进制)
pub fn compute_content_hash(kernel_dir: &Path, env_file: &Path, password: &str) -> anyhow::Result<String> {
    let env_hash = match fs::read(env_file) {
        Ok(bytes) => {
            let content = String::from_utf8_lossy(&bytes);
            let content = substitute_password(&content, password);
            hex::encode(Sha256::digest(content.as_bytes()))
        }
        Err(_) => String::from("no_env"),
    };

    let mut hasher = Sha256::new();
    for path in kernel_files(kernel_dir) {
        hasher.update(fs::read(&path)?);
    }
    hasher.update(env_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// 将设备名中连续的非法字符替换为单个 `_`
pub fn sanitize_device_tag(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

pub fn cache_file_name(device_tag: &str, device_index: usize, hash: &str) -> String {
    format!("main.{}.{}-{}.clbin", device_tag, device_index, hash)
}

/// 内核编译选项
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub wnaf_window: u32,
    pub seed_mode: SeedMode,
    pub combinational: bool,
    pub brute_target: BruteTarget,
    /// 加入时间戳宏，强制每次运行得到不同的二进制
    pub cache_bust: bool,
}

impl BuildOptions {
    /// 影响二进制内容的选项 (不含时间戳)，参与缓存键
    pub fn stable_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-DWNAF_W={}", self.wnaf_window),
            String::from("-cl-fast-relaxed-math"),
        ];
        if self.seed_mode.is_electrum() {
            args.push(String::from("-DELECTRUM_SEED=1"));
        }
        if self.combinational {
            args.push(String::from("-DCOMBINATIONAL=1"));
        }
        if self.brute_target == BruteTarget::Password {
            args.push(String::from("-DBRUTE_PASSWORD_NOT_SEED=1"));
        }
        args
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = self.stable_args();
        if self.cache_bust {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            args.push(format!("-DCACHE={}", now));
        }
        args
    }

    pub fn to_cmplr_opts(&self) -> String {
        self.args().join(" ")
    }
}

/// 编译缓存
#[derive(Debug, Clone)]
pub struct KernelCache {
    pub kernel_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub password: String,
    /// 启动时计算一次的内容哈希
    pub content_hash: String,
}

impl KernelCache {
    pub fn new(kernel_dir: &Path, env_file: &Path, password: &str) -> anyhow::Result<Self> {
        let content_hash = compute_content_hash(kernel_dir, env_file, password)?;
        info!("Kernel content hash: {}", content_hash);
        Ok(Self {
            kernel_dir: kernel_dir.to_path_buf(),
            cache_dir: kernel_dir.join("cache"),
            password: password.to_string(),
            content_hash,
        })
    }

    /// 二进制哈希: 内容哈希 + 编译选项
    pub fn binary_hash(&self, options: &BuildOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content_hash.as_bytes());
        for arg in options.stable_args() {
            hasher.update(b"\0");
            hasher.update(arg.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn cache_path(&self, device_name: &str, device_index: usize, options: &BuildOptions) -> PathBuf {
        self.cache_dir.join(cache_file_name(
            &sanitize_device_tag(device_name),
            device_index,
            &self.binary_hash(options),
        ))
    }

    /// 读取缓存的二进制，失败时从源码编译并写回缓存
    ///
    /// `cache_bust` 开启时总是重新编译。
    pub fn build_or_load(&self, ctx: &OpenCLContext, options: &BuildOptions) -> anyhow::Result<Program> {
        let device_name = ctx.device_name();
        let cache_path = self.cache_path(&device_name, ctx.index, options);
        let opts = options.to_cmplr_opts();
        info!("Building program for GPU#{} ({})", ctx.index, opts);

        if !options.cache_bust && cache_path.exists() {
            match load_binary(ctx, ctx.device, &cache_path, &opts) {
                Ok(program) => {
                    info!("Loaded cached kernel: {}", cache_path.display());
                    return Ok(program);
                }
                Err(e) => warn!("Failed to load cached kernel, recompiling... ({})", e),
            }
        }

        let source = load_kernel_source(&self.kernel_dir, &self.password)?;
        let program = Program::builder()
            .devices(ctx.device)
            .src(source)
            .cmplr_opt(opts)
            .build(&ctx.context)?;

        if let Err(e) = self.save_binary(&program, &cache_path) {
            warn!("Failed to save kernel cache: {}", e);
        }
        Ok(program)
    }

    fn save_binary(&self, program: &Program, path: &Path) -> anyhow::Result<()> {
        let binaries = match program
            .info(ProgramInfo::Binaries)
            .map_err(|e| anyhow::anyhow!("{}", e))?
        {
            ProgramInfoResult::Binaries(bins) => bins,
            other => anyhow::bail!("unexpected program info: {}", other),
        };
        let Some(binary) = binaries.into_iter().find(|b| !b.is_empty()) else {
            anyhow::bail!("driver returned no program binary");
        };
        fs::create_dir_all(&self.cache_dir)?;
        fs::write(path, binary)?;
        info!("Saved kernel cache: {}", path.display());
        Ok(())
    }
}

fn load_binary(ctx: &OpenCLContext, device: Device, path: &Path, opts: &str) -> anyhow::Result<Program> {
    let binary = fs::read(path)?;
    let binaries = [binary.as_slice()];
    let program = Program::builder()
        .devices(device)
        .binaries(&binaries)
        .cmplr_opt(opts)
        .build(&ctx.context)?;
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_device_tag() {
        assert_eq!(sanitize_device_tag(" NVIDIA GeForce RTX 4090 "), "NVIDIA_GeForce_RTX_4090");
        assert_eq!(sanitize_device_tag("gfx1100 (AMD)"), "gfx1100_AMD_");
        assert_eq!(sanitize_device_tag("a.b-c_d"), "a.b-c_d");
    }

    #[test]
    fn test_cache_file_name() {
        assert_eq!(cache_file_name("dev", 2, "abc"), "main.dev.2-abc.clbin");
    }

    #[test]
    fn test_password_macro_layout() {
        let m = password_macro("abc");
        let lines: Vec<&str> = m.lines().collect();
        // "abc" + 00 00 00 01 80 = 8 字节
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "inner_data[17] = 0x6162630000000180UL;");
        assert_eq!(lines[1], format!("inner_data[31] = {}UL;", 3 * 8 + 140 * 8));
    }

    #[test]
    fn test_password_macro_padding() {
        let m = password_macro("password");
        let lines: Vec<&str> = m.lines().collect();
        // 8 + 5 = 13 → 16 字节，两个 u64
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "inner_data[18] = 0x0000000180000000UL;");
    }

    #[test]
    fn test_substitute_password() {
        let src = "#define BIG_ENDIAN_PASSWORD\nint x;";
        assert_eq!(substitute_password(src, ""), src);
        assert!(substitute_password(src, "abc").contains("inner_data[17]"));
    }

    #[test]
    fn test_build_options() {
        let opts = BuildOptions {
            wnaf_window: 2,
            seed_mode: SeedMode::Electrum,
            combinational: true,
            brute_target: BruteTarget::Seed,
            cache_bust: false,
        };
        assert_eq!(
            opts.to_cmplr_opts(),
            "-DWNAF_W=2 -cl-fast-relaxed-math -DELECTRUM_SEED=1 -DCOMBINATIONAL=1"
        );

        let busted = BuildOptions {
            cache_bust: true,
            brute_target: BruteTarget::Password,
            ..opts
        };
        let args = busted.args();
        assert!(args.contains(&String::from("-DBRUTE_PASSWORD_NOT_SEED=1")));
        assert!(args.last().unwrap().starts_with("-DCACHE="));
    }
}
