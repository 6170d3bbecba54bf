use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use zcad_config::BlockConfig;

const BLOCK_PATHS_ENV: &str = "ZCAD_BLOCK_PATHS";

/// 把用户给出的文件路径解析为绝对路径。
pub trait FileLocator: Send + Sync {
    /// 在搜索路径中查找已存在的文件。
    fn locate(&self, path: &str) -> Option<PathBuf>;

    /// 转为绝对路径，不检查文件是否存在（导出目标可能尚未创建）。
    fn full_path(&self, path: &str) -> PathBuf;
}

#[derive(Debug, Clone, Default)]
pub struct SearchPathLocator {
    search_roots: Vec<PathBuf>,
}

impl SearchPathLocator {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        // 去重，保持靠前优先级。
        let mut deduped: Vec<PathBuf> = Vec::new();
        for root in roots.into_iter().filter(|path| path.is_dir()) {
            if !deduped.iter().any(|existing| existing == &root) {
                deduped.push(root);
            }
        }
        Self {
            search_roots: deduped,
        }
    }

    /// 按优先级组合：`base_dir`、配置中的 `search_paths`、环境变量 `ZCAD_BLOCK_PATHS`。
    pub fn from_config(base_dir: Option<&Path>, config: &BlockConfig) -> Self {
        Self::from_sources(base_dir, config, env::var_os(BLOCK_PATHS_ENV).as_deref())
    }

    fn from_sources(base_dir: Option<&Path>, config: &BlockConfig, env_paths: Option<&OsStr>) -> Self {
        let mut roots: Vec<PathBuf> = Vec::new();

        if let Some(dir) = base_dir {
            roots.push(dir.to_path_buf());
        }

        roots.extend(config.search_paths.iter().cloned());

        if let Some(env_paths) = env_paths {
            roots.extend(env::split_paths(env_paths));
        }

        Self::new(roots)
    }

    #[inline]
    pub fn search_roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    fn canonicalize_or_clone(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }
}

impl FileLocator for SearchPathLocator {
    fn locate(&self, path: &str) -> Option<PathBuf> {
        if path.is_empty() {
            return None;
        }
        let raw_path = Path::new(path);
        if raw_path.is_absolute() {
            if raw_path.is_file() {
                return Some(Self::canonicalize_or_clone(raw_path));
            }
            debug!(path = %raw_path.display(), "块文件为绝对路径但未找到对应文件");
            return None;
        }

        for root in &self.search_roots {
            let candidate = root.join(raw_path);
            trace!(candidate = %candidate.display(), "block locator candidate");
            if candidate.is_file() {
                return Some(Self::canonicalize_or_clone(&candidate));
            }
        }

        // 最后回退到当前工作目录。
        if raw_path.is_file() {
            return Some(Self::canonicalize_or_clone(raw_path));
        }
        None
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let raw_path = Path::new(path);
        if raw_path.is_absolute() {
            return raw_path.to_path_buf();
        }
        match env::current_dir() {
            Ok(cwd) => cwd.join(raw_path),
            Err(err) => {
                debug!(error = %err, "获取当前工作目录失败，保留相对路径");
                raw_path.to_path_buf()
            }
        }
    }
}
