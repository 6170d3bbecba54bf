use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use tracing::{debug, info, warn};
use zcad_core::frame::CoordinateFrame;

use crate::errors::BlockError;
use crate::instance::BlockInstance;
use crate::library::{BlockLibrary, require_name};

/// 块在当前文档中的就绪方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// 当前文档中已存在同名定义。
    Local,
    /// 刚从来源文档导入。
    Imported,
}

/// 块定义句柄。
///
/// 克隆共享同一份身份：多个 [`BlockInstance`] 指向同一个定义，
/// [`Block::rename`] 修改后所有克隆都会看到新名称。
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

struct BlockInner {
    name: RwLock<String>,
    source_document: Option<PathBuf>,
    library: BlockLibrary,
}

impl Block {
    pub(crate) fn local(library: &BlockLibrary, name: impl Into<String>) -> Self {
        Self::with_source(library, name.into(), None)
    }

    pub(crate) fn sourced(library: &BlockLibrary, name: impl Into<String>, source: PathBuf) -> Self {
        Self::with_source(library, name.into(), Some(source))
    }

    fn with_source(library: &BlockLibrary, name: String, source_document: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                name: RwLock::new(name),
                source_document,
                library: library.clone(),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> String {
        self.read_name().clone()
    }

    /// 导入来源文档；本地定义或列举得到的定义为 `None`。
    #[inline]
    pub fn source_document(&self) -> Option<&Path> {
        self.inner.source_document.as_deref()
    }

    #[inline]
    pub fn library(&self) -> &BlockLibrary {
        &self.inner.library
    }

    /// 当前存活的句柄数量（定义克隆与实例）。
    #[inline]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 判断两个句柄是否指向同一个定义对象。
    #[inline]
    pub fn same_definition(&self, other: &Block) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 重命名后端记录，成功后同步本句柄的名称。后端拒绝时返回 `Ok(false)`。
    pub fn rename(&self, new_name: &str) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::rename";
        // 持有写锁直到后端返回，保证记录与句柄同步更新。
        let mut name = self.inner.name.write().unwrap_or_else(PoisonError::into_inner);
        require_name(&name, OPERATION, "old_name")?;
        require_name(new_name, OPERATION, "new_name")?;
        let backend = self.library().backend(OPERATION)?;

        if backend.rename(&name, new_name) {
            info!(from = %*name, to = new_name, "已重命名块");
            *name = new_name.to_string();
            Ok(true)
        } else {
            warn!(from = %*name, to = new_name, "后端拒绝重命名块");
            Ok(false)
        }
    }

    /// 列出块内包含的图元类型。
    pub fn contained_geometry_types(&self) -> Result<Vec<String>, BlockError> {
        const OPERATION: &str = "Block::contained_geometry_types";
        let name = self.read_name();
        require_name(&name, OPERATION, "name")?;
        Ok(self.library().backend(OPERATION)?.list_contents(&name))
    }

    /// 仅导出定义记录，不在目标文档中放置实例；目标中的同名块会被覆盖。
    pub fn export(&self, file_path: &str) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::export";
        let target = self.library().resolve_target(file_path, OPERATION, "file_path")?;
        let name = self.read_name();
        require_name(&name, OPERATION, "name")?;

        let exported = self.library().backend(OPERATION)?.export_definition(&target, &name);
        debug!(block = %*name, target = %target.display(), exported, "导出块定义");
        Ok(exported)
    }

    /// 把块内全部几何写入外部文档。
    pub fn export_geometry(&self, file_path: &str) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::export_geometry";
        let target = self.library().resolve_target(file_path, OPERATION, "file_path")?;
        let name = self.read_name();
        require_name(&name, OPERATION, "name")?;

        let exported = self.library().backend(OPERATION)?.export_geometry(&target, &name);
        debug!(block = %*name, target = %target.display(), exported, "导出块几何");
        Ok(exported)
    }

    /// 在当前文档中按坐标系放置块。
    ///
    /// 分两步：先 [`Block::ensure_available`]（缺失时从来源文档导入），
    /// 再 [`Block::insert_local`]。
    pub fn place(&self, frame: &CoordinateFrame) -> Result<BlockInstance, BlockError> {
        self.library()
            .check_frame(frame, "Block::place", "frame")?;
        self.ensure_available()?;
        self.insert_local(frame)
    }

    /// 确保当前文档中存在该块，必要时从来源文档导入一次。
    pub fn ensure_available(&self) -> Result<Availability, BlockError> {
        const OPERATION: &str = "Block::ensure_available";
        let name = self.read_name();
        require_name(&name, OPERATION, "name")?;
        let backend = self.library().backend(OPERATION)?;

        if backend.exists_in_current_document(&name) {
            return Ok(Availability::Local);
        }
        let Some(source) = self.source_document() else {
            return Err(BlockError::DoesNotExist {
                name: name.clone(),
            });
        };
        backend.import_one_from_file(source, &name);
        info!(block = %*name, source = %source.display(), "放置前导入块定义");
        Ok(Availability::Imported)
    }

    /// 直接从当前文档放置，不做导入。
    ///
    /// 单独调用时自行校验坐标系；经由 [`Block::place`] 调用时错误由 `place` 先行报告。
    pub fn insert_local(&self, frame: &CoordinateFrame) -> Result<BlockInstance, BlockError> {
        const OPERATION: &str = "Block::insert_local";
        self.library().check_frame(frame, OPERATION, "frame")?;
        let handle = {
            let name = self.read_name();
            require_name(&name, OPERATION, "name")?;
            self.library()
                .backend(OPERATION)?
                .insert_from_current_document(frame, &name)
                .ok_or(BlockError::OperationFailed {
                    operation: OPERATION,
                })?
        };
        debug!(block = %self.name(), handle = handle.get(), "已放置块");
        Ok(BlockInstance::new(self.clone(), *frame, handle))
    }

    /// 在外部目标文档中放置块；目标缺少该块时先写入，已存在则替换。
    pub fn place_into_document(
        &self,
        frame: &CoordinateFrame,
        target_file_path: &str,
    ) -> Result<bool, BlockError> {
        const OPERATION: &str = "Block::place_into_document";
        self.library().check_frame(frame, OPERATION, "frame")?;
        let target = self
            .library()
            .resolve_target(target_file_path, OPERATION, "target_file_path")?;
        let name = self.read_name();
        require_name(&name, OPERATION, "name")?;

        let placed = self
            .library()
            .backend(OPERATION)?
            .insert_into_target_file(frame, &name, &target);
        if placed {
            info!(block = %*name, target = %target.display(), "已在目标文档中放置块");
        } else {
            warn!(block = %*name, target = %target.display(), "目标文档放置失败");
        }
        Ok(placed)
    }

    fn read_name(&self) -> RwLockReadGuard<'_, String> {
        self.inner.name.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &*self.read_name())
            .field("source_document", &self.inner.source_document)
            .finish()
    }
}
