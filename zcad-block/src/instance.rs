use tracing::{debug, trace};
use zcad_core::document::{Entity, EntityId};
use zcad_core::frame::CoordinateFrame;

use crate::definition::Block;
use crate::errors::BlockError;
use crate::library::{BlockLibrary, require_name};

/// 已放置的块实例：共享的定义、创建时的坐标系以及后端实体句柄。
///
/// 坐标系在创建后不可修改，重新放置需创建新实例。几何提取每次都转发给后端。
#[derive(Debug, Clone)]
pub struct BlockInstance {
    definition: Block,
    placement_frame: CoordinateFrame,
    handle: EntityId,
}

impl BlockInstance {
    pub(crate) fn new(definition: Block, placement_frame: CoordinateFrame, handle: EntityId) -> Self {
        Self {
            definition,
            placement_frame,
            handle,
        }
    }

    /// 从外部文档导入并放置，一次后端调用完成。返回实例的定义标记该来源文档。
    pub fn from_file(
        library: &BlockLibrary,
        frame: &CoordinateFrame,
        file_path: &str,
        name: &str,
    ) -> Result<Self, BlockError> {
        const OPERATION: &str = "BlockInstance::from_file";
        library.check_frame(frame, OPERATION, "frame")?;
        require_name(name, OPERATION, "name")?;
        let resolved = library.resolve_existing(file_path, OPERATION)?;

        let handle = library
            .backend(OPERATION)?
            .insert_from_file(frame, &resolved, name)
            .ok_or(BlockError::OperationFailed {
                operation: OPERATION,
            })?;
        debug!(block = name, source = %resolved.display(), handle = handle.get(), "已从外部文档放置块");
        Ok(Self::new(
            Block::sourced(library, name, resolved),
            *frame,
            handle,
        ))
    }

    #[inline]
    pub fn definition(&self) -> &Block {
        &self.definition
    }

    #[inline]
    pub fn placement_frame(&self) -> &CoordinateFrame {
        &self.placement_frame
    }

    #[inline]
    pub fn handle(&self) -> EntityId {
        self.handle
    }

    /// 以世界坐标提取实例内的图元，后端返回的无效条目直接跳过。
    pub fn extract_geometry(&self) -> Result<Vec<Entity>, BlockError> {
        let backend = self
            .definition
            .library()
            .backend("BlockInstance::extract_geometry")?;
        let raw = backend.extract_geometry(self.handle);
        let total = raw.len();
        let geometries: Vec<Entity> = raw.into_iter().flatten().collect();
        if geometries.len() != total {
            trace!(
                handle = self.handle.get(),
                skipped = total - geometries.len(),
                "跳过无效图元"
            );
        }
        Ok(geometries)
    }
}
