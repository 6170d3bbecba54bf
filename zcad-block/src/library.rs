use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use zcad_config::AppConfig;
use zcad_core::document::Entity;
use zcad_core::frame::{CoordinateFrame, DEFAULT_SHEAR_TOLERANCE};
use zcad_core::geometry::Point3;

use crate::backend::GeometryBackend;
use crate::definition::Block;
use crate::errors::BlockError;
use crate::locator::{FileLocator, SearchPathLocator};

/// 块操作的入口：绑定几何后端与文件定位器。
///
/// 克隆代价很低（内部均为 `Arc`），[`Block`] 会持有一份副本以便后续操作。
#[derive(Clone)]
pub struct BlockLibrary {
    backend: Option<Arc<dyn GeometryBackend>>,
    locator: Arc<dyn FileLocator>,
    shear_tolerance: f64,
}

impl BlockLibrary {
    pub fn new(backend: Arc<dyn GeometryBackend>, locator: impl FileLocator + 'static) -> Self {
        Self {
            backend: Some(backend),
            locator: Arc::new(locator),
            shear_tolerance: DEFAULT_SHEAR_TOLERANCE,
        }
    }

    /// 未绑定后端的库，所有需要后端的操作都会返回 `BackendUnavailable`。
    pub fn unbound(locator: impl FileLocator + 'static) -> Self {
        Self {
            backend: None,
            locator: Arc::new(locator),
            shear_tolerance: DEFAULT_SHEAR_TOLERANCE,
        }
    }

    /// 依据应用配置构建：搜索路径取自 `[blocks]`，`base_dir` 优先级最高。
    pub fn from_config(
        backend: Arc<dyn GeometryBackend>,
        base_dir: Option<&Path>,
        config: &AppConfig,
    ) -> Self {
        let locator = SearchPathLocator::from_config(base_dir, &config.blocks);
        debug!(roots = ?locator.search_roots(), "块搜索路径");
        Self::new(backend, locator).with_shear_tolerance(config.blocks.shear_tolerance)
    }

    pub fn with_shear_tolerance(mut self, tolerance: f64) -> Self {
        if tolerance.is_finite() && tolerance >= 0.0 {
            self.shear_tolerance = tolerance;
        } else {
            warn!(tolerance, "忽略非法的错切容差");
        }
        self
    }

    #[inline]
    pub fn shear_tolerance(&self) -> f64 {
        self.shear_tolerance
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.backend.is_some()
    }

    /// 以给定坐标系、名称和世界坐标图元登记新块。后端拒绝（如重名）时返回 `Ok(None)`。
    pub fn define_from_geometry(
        &self,
        name: &str,
        reference_frame: &CoordinateFrame,
        geometries: &[Entity],
    ) -> Result<Option<Block>, BlockError> {
        const OPERATION: &str = "Block::define_from_geometry";
        self.check_frame(reference_frame, OPERATION, "reference_frame")?;
        require_name(name, OPERATION, "name")?;
        if geometries.is_empty() {
            return Err(BlockError::InvalidArgument {
                operation: OPERATION,
                parameter: "geometries",
            });
        }

        let backend = self.backend(OPERATION)?;
        if backend.define_block(reference_frame, name, geometries) {
            info!(block = name, count = geometries.len(), "已定义块");
            Ok(Some(Block::local(self, name)))
        } else {
            warn!(block = name, "后端拒绝定义块");
            Ok(None)
        }
    }

    /// 以参考点为基准定义块，坐标轴与世界坐标系一致。
    pub fn define_from_point(
        &self,
        name: &str,
        reference_point: Point3,
        geometries: &[Entity],
    ) -> Result<Option<Block>, BlockError> {
        self.define_from_geometry(name, &CoordinateFrame::from_origin(reference_point), geometries)
    }

    /// 从外部文档导入单个块定义。当前文档中的同名定义会被覆盖。
    pub fn import(&self, name: &str, file_path: &str) -> Result<Block, BlockError> {
        const OPERATION: &str = "Block::import";
        require_name(name, OPERATION, "name")?;
        let resolved = self.resolve_existing(file_path, OPERATION)?;
        let backend = self.backend(OPERATION)?;

        backend.import_one_from_file(&resolved, name);
        info!(block = name, source = %resolved.display(), "已导入块定义");
        Ok(Block::sourced(self, name, resolved))
    }

    /// 导入外部文档中的全部块，每个块都标记同一来源文档。
    pub fn import_all(&self, file_path: &str) -> Result<Vec<Block>, BlockError> {
        const OPERATION: &str = "Block::import_all";
        let resolved = self.resolve_existing(file_path, OPERATION)?;
        let backend = self.backend(OPERATION)?;

        let names = backend.import_all_from_file(&resolved);
        info!(count = names.len(), source = %resolved.display(), "已导入全部块定义");
        Ok(names
            .into_iter()
            .map(|name| Block::sourced(self, name, resolved.clone()))
            .collect())
    }

    /// 列出当前文档中可用的块定义。
    pub fn available_definitions(&self) -> Result<Vec<Block>, BlockError> {
        let backend = self.backend("Block::available_definitions")?;
        Ok(backend
            .list_in_current_document()
            .into_iter()
            .map(|name| Block::local(self, name))
            .collect())
    }

    pub fn exists(&self, name: &str) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::exists";
        require_name(name, OPERATION, "name")?;
        Ok(self.backend(OPERATION)?.exists_in_current_document(name))
    }

    /// 删除未被引用的块定义。仍有参照或块不存在时返回 `Ok(false)`。
    pub fn purge(&self, name: &str) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::purge";
        require_name(name, OPERATION, "name")?;
        let purged = self.backend(OPERATION)?.purge(name);
        if purged {
            info!(block = name, "已清理块定义");
        } else {
            warn!(block = name, "块定义未被清理");
        }
        Ok(purged)
    }

    pub(crate) fn backend(&self, operation: &'static str) -> Result<&dyn GeometryBackend, BlockError> {
        self.backend
            .as_deref()
            .ok_or(BlockError::BackendUnavailable { operation })
    }

    pub(crate) fn check_frame(
        &self,
        frame: &CoordinateFrame,
        operation: &'static str,
        parameter: &'static str,
    ) -> Result<(), BlockError> {
        if frame.is_sheared_with(self.shear_tolerance) {
            return Err(BlockError::ShearedFrame {
                operation,
                parameter,
            });
        }
        Ok(())
    }

    /// 解析必须已存在的源文件。
    pub(crate) fn resolve_existing(
        &self,
        file_path: &str,
        operation: &'static str,
    ) -> Result<PathBuf, BlockError> {
        require_name(file_path, operation, "file_path")?;
        self.locator
            .locate(file_path)
            .ok_or_else(|| BlockError::FileNotFound(file_path.to_string()))
    }

    /// 解析导出/放置目标，不要求文件已存在。
    pub(crate) fn resolve_target(
        &self,
        file_path: &str,
        operation: &'static str,
        parameter: &'static str,
    ) -> Result<PathBuf, BlockError> {
        require_name(file_path, operation, parameter)?;
        Ok(self.locator.full_path(file_path))
    }
}

impl fmt::Debug for BlockLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockLibrary")
            .field("bound", &self.backend.is_some())
            .field("shear_tolerance", &self.shear_tolerance)
            .finish()
    }
}

pub(crate) fn require_name(
    value: &str,
    operation: &'static str,
    parameter: &'static str,
) -> Result<(), BlockError> {
    if value.is_empty() {
        Err(BlockError::InvalidArgument {
            operation,
            parameter,
        })
    } else {
        Ok(())
    }
}
