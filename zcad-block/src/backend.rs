use std::path::Path;

use zcad_core::document::{Entity, EntityId};
use zcad_core::frame::CoordinateFrame;

/// 几何后端需要提供的块能力。
///
/// 后端持有真实的文档状态（块表、实体存储），本层从不缓存名称表，
/// 每次查询都直接转发。名称冲突、仍被引用等拒绝情形以 `false`/`None`
/// 返回，不视为错误。
///
/// 传入的路径均已由 [`crate::FileLocator`] 解析完毕。
pub trait GeometryBackend: Send + Sync {
    /// 以 `frame` 为基准登记新块，`entities` 为世界坐标，由后端转换到块局部坐标。
    fn define_block(&self, frame: &CoordinateFrame, name: &str, entities: &[Entity]) -> bool;

    /// 从外部文档导入块并在当前文档中放置一次。
    fn insert_from_file(
        &self,
        frame: &CoordinateFrame,
        file_path: &Path,
        name: &str,
    ) -> Option<EntityId>;

    fn insert_from_current_document(&self, frame: &CoordinateFrame, name: &str)
    -> Option<EntityId>;

    /// 在目标文档中放置块；目标中缺少该块时先写入，已存在则替换。
    fn insert_into_target_file(
        &self,
        frame: &CoordinateFrame,
        name: &str,
        target_file_path: &Path,
    ) -> bool;

    /// 仅导入定义，同名定义被覆盖。
    fn import_one_from_file(&self, file_path: &Path, name: &str);

    fn import_all_from_file(&self, file_path: &Path) -> Vec<String>;

    fn list_in_current_document(&self) -> Vec<String>;

    fn exists_in_current_document(&self, name: &str) -> bool;

    /// 仅当块不再被任何参照使用时才删除。
    fn purge(&self, name: &str) -> bool;

    fn rename(&self, old_name: &str, new_name: &str) -> bool;

    /// 块内图元的类型标签，去重。
    fn list_contents(&self, name: &str) -> Vec<String>;

    fn export_definition(&self, file_path: &Path, name: &str) -> bool;

    /// 把块内几何写成目标文档的模型空间（类似 WBLOCK）。
    fn export_geometry(&self, file_path: &Path, name: &str) -> bool;

    /// 以世界坐标返回块参照内的图元；无法解析的条目为 `None`。
    fn extract_geometry(&self, instance: EntityId) -> Vec<Option<Entity>>;
}
