use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use zcad_core::document::{BlockDefinition, Document, Entity, EntityId};
use zcad_core::frame::CoordinateFrame;

use crate::backend::GeometryBackend;

const INSERT_LAYER: &str = "0";

/// 纯内存的几何后端：一个当前文档，加上按路径索引的外部文档集合。
///
/// 外部文档只存在于内存中，`export_*` 与 `insert_into_target_file`
/// 写入的目标会在集合中新建或替换，不落盘。
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Debug)]
struct MemoryState {
    current: Document,
    documents: HashMap<PathBuf, Document>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_current_document(Document::new())
    }

    pub fn with_current_document(document: Document) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                current: document,
                documents: HashMap::new(),
            }),
        }
    }

    /// 注册外部文档，返回被替换的旧文档。
    pub fn insert_document(&self, path: impl Into<PathBuf>, document: Document) -> Option<Document> {
        self.lock().documents.insert(path.into(), document)
    }

    /// 外部文档快照。
    pub fn document(&self, path: &Path) -> Option<Document> {
        self.lock().documents.get(path).cloned()
    }

    /// 当前文档快照。
    pub fn current_document(&self) -> Document {
        self.lock().current.clone()
    }

    /// 模拟宿主删除当前文档中的实体（例如用户擦除了块参照）。
    pub fn erase_entity(&self, id: EntityId) -> bool {
        self.lock().current.remove_entity(id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// 将块及其依赖的嵌套块复制到目标文档，同名定义被覆盖。
fn copy_block(source: &Document, target: &mut Document, name: &str) -> bool {
    let Some(definition) = source.block(name) else {
        return false;
    };
    for dependency in source.block_dependencies(name) {
        if let Some(nested) = source.block(&dependency) {
            target.add_block_definition(nested.clone());
        }
    }
    if target.add_block_definition(definition.clone()).is_some() {
        debug!(block = name, "覆盖目标文档中的同名块");
    }
    true
}

impl GeometryBackend for MemoryBackend {
    fn define_block(&self, frame: &CoordinateFrame, name: &str, entities: &[Entity]) -> bool {
        let mut state = self.lock();
        if entities.is_empty() || state.current.contains_block(name) {
            return false;
        }
        let Some(inverse) = frame.inverse() else {
            warn!(block = name, "参考坐标系不可逆");
            return false;
        };
        let local: Vec<Entity> = entities
            .iter()
            .map(|entity| entity.transformed(&inverse))
            .collect();
        state
            .current
            .add_block_definition(BlockDefinition::new(name, local));
        true
    }

    fn insert_from_file(
        &self,
        frame: &CoordinateFrame,
        file_path: &Path,
        name: &str,
    ) -> Option<EntityId> {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        let source = documents.get(file_path)?;
        if !copy_block(source, current, name) {
            debug!(block = name, source = %file_path.display(), "外部文档中没有该块");
            return None;
        }
        Some(current.add_block_reference(name, *frame, INSERT_LAYER))
    }

    fn insert_from_current_document(
        &self,
        frame: &CoordinateFrame,
        name: &str,
    ) -> Option<EntityId> {
        let mut state = self.lock();
        if !state.current.contains_block(name) {
            return None;
        }
        Some(state.current.add_block_reference(name, *frame, INSERT_LAYER))
    }

    fn insert_into_target_file(
        &self,
        frame: &CoordinateFrame,
        name: &str,
        target_file_path: &Path,
    ) -> bool {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        if !current.contains_block(name) {
            return false;
        }
        let target = documents
            .entry(target_file_path.to_path_buf())
            .or_insert_with(Document::new);
        copy_block(current, target, name);
        target.add_block_reference(name, *frame, INSERT_LAYER);
        true
    }

    fn import_one_from_file(&self, file_path: &Path, name: &str) {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        let imported = documents
            .get(file_path)
            .is_some_and(|source| copy_block(source, current, name));
        if !imported {
            warn!(block = name, source = %file_path.display(), "外部文档中没有可导入的块");
        }
    }

    fn import_all_from_file(&self, file_path: &Path) -> Vec<String> {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        let Some(source) = documents.get(file_path) else {
            warn!(source = %file_path.display(), "外部文档未注册");
            return Vec::new();
        };
        let names = source.block_names();
        for definition in source.blocks() {
            current.add_block_definition(definition.clone());
        }
        names
    }

    fn list_in_current_document(&self) -> Vec<String> {
        self.lock().current.block_names()
    }

    fn exists_in_current_document(&self, name: &str) -> bool {
        self.lock().current.contains_block(name)
    }

    fn purge(&self, name: &str) -> bool {
        let mut state = self.lock();
        if state.current.reference_count(name) > 0 {
            return false;
        }
        state.current.remove_block(name).is_some()
    }

    fn rename(&self, old_name: &str, new_name: &str) -> bool {
        self.lock().current.rename_block(old_name, new_name)
    }

    fn list_contents(&self, name: &str) -> Vec<String> {
        let state = self.lock();
        let mut kinds: Vec<String> = Vec::new();
        if let Some(definition) = state.current.block(name) {
            for entity in &definition.entities {
                if !kinds.iter().any(|kind| kind == entity.kind()) {
                    kinds.push(entity.kind().to_string());
                }
            }
        }
        kinds
    }

    fn export_definition(&self, file_path: &Path, name: &str) -> bool {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        if !current.contains_block(name) {
            return false;
        }
        let target = documents
            .entry(file_path.to_path_buf())
            .or_insert_with(Document::new);
        copy_block(current, target, name)
    }

    fn export_geometry(&self, file_path: &Path, name: &str) -> bool {
        let mut state = self.lock();
        let MemoryState { current, documents } = &mut *state;
        let Some(definition) = current.block(name) else {
            return false;
        };
        let mut exported = Document::new();
        for dependency in current.block_dependencies(name) {
            if let Some(nested) = current.block(&dependency) {
                exported.add_block_definition(nested.clone());
            }
        }
        for entity in &definition.entities {
            exported.add_entity(entity.clone());
        }
        documents.insert(file_path.to_path_buf(), exported);
        true
    }

    fn extract_geometry(&self, instance: EntityId) -> Vec<Option<Entity>> {
        let state = self.lock();
        let Some(Entity::BlockReference(reference)) = state.current.entity(instance) else {
            return Vec::new();
        };
        let Some(definition) = state.current.block(&reference.name) else {
            return Vec::new();
        };
        definition
            .entities
            .iter()
            .map(|entity| {
                let placed = entity.transformed(&reference.frame);
                let resolvable = match &placed {
                    Entity::BlockReference(nested) => state.current.contains_block(&nested.name),
                    _ => true,
                };
                (resolvable && placed.is_finite()).then_some(placed)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use zcad_core::document::{BlockReference, Line, PointEntity};
    use zcad_core::geometry::Point3;

    use super::*;

    fn point(x: f64) -> Entity {
        Entity::Point(PointEntity {
            position: Point3::new(x, 0.0, 0.0),
            layer: "0".to_string(),
        })
    }

    fn reference(name: &str) -> Entity {
        Entity::BlockReference(BlockReference {
            name: name.to_string(),
            frame: CoordinateFrame::identity(),
            layer: "0".to_string(),
        })
    }

    #[test]
    fn purge_refuses_referenced_blocks() {
        let backend = MemoryBackend::new();
        let frame = CoordinateFrame::identity();
        assert!(backend.define_block(&frame, "Bolt", &[point(1.0)]));
        backend
            .insert_from_current_document(&frame, "Bolt")
            .expect("insert");

        assert!(!backend.purge("Bolt"));
        assert!(backend.exists_in_current_document("Bolt"));
        assert!(!backend.purge("Missing"));
    }

    #[test]
    fn nested_reference_blocks_purge() {
        let backend = MemoryBackend::new();
        let frame = CoordinateFrame::identity();
        assert!(backend.define_block(&frame, "Nut", &[point(0.0)]));
        assert!(backend.define_block(&frame, "Assembly", &[reference("Nut")]));
        assert!(!backend.purge("Nut"));
        assert!(backend.purge("Assembly"));
        assert!(backend.purge("Nut"));
        assert!(backend.list_in_current_document().is_empty());
    }

    #[test]
    fn list_contents_returns_distinct_kinds_in_order() {
        let backend = MemoryBackend::new();
        let line = Entity::Line(Line {
            start: Point3::ORIGIN,
            end: Point3::new(1.0, 1.0, 0.0),
            layer: "0".to_string(),
        });
        backend.define_block(&CoordinateFrame::identity(), "Nut", &[point(0.0)]);
        backend.define_block(
            &CoordinateFrame::identity(),
            "Mixed",
            &[line.clone(), point(1.0), line, reference("Nut")],
        );
        assert_eq!(
            backend.list_contents("Mixed"),
            vec![
                "Line".to_string(),
                "Point".to_string(),
                "BlockReference".to_string()
            ]
        );
        assert!(backend.list_contents("Missing").is_empty());
    }

    #[test]
    fn import_overwrites_existing_definition() {
        let backend = MemoryBackend::new();
        backend.define_block(&CoordinateFrame::identity(), "Bolt", &[point(1.0)]);

        let mut external = Document::new();
        external.add_block_definition(BlockDefinition::new("Bolt", vec![point(7.0), point(8.0)]));
        backend.insert_document("/lib/bolts.blk", external);

        backend.import_one_from_file(Path::new("/lib/bolts.blk"), "Bolt");
        let current = backend.current_document();
        assert_eq!(current.block("Bolt").unwrap().entities.len(), 2);
    }

    #[test]
    fn import_copies_nested_dependencies() {
        let backend = MemoryBackend::new();
        let mut external = Document::new();
        external.add_block_definition(BlockDefinition::new("Nut", vec![point(0.0)]));
        external.add_block_definition(BlockDefinition::new("Assembly", vec![reference("Nut")]));
        backend.insert_document("/lib/assembly.blk", external);

        backend.import_one_from_file(Path::new("/lib/assembly.blk"), "Assembly");
        assert_eq!(
            backend.list_in_current_document(),
            vec!["Assembly".to_string(), "Nut".to_string()]
        );
    }

    #[test]
    fn insert_into_target_replaces_definition() {
        let backend = MemoryBackend::new();
        let frame = CoordinateFrame::identity();
        backend.define_block(&frame, "Bolt", &[point(1.0), point(2.0)]);

        let mut target = Document::new();
        target.add_block_definition(BlockDefinition::new("Bolt", vec![point(9.0)]));
        backend.insert_document("/out/target.blk", target);

        assert!(backend.insert_into_target_file(&frame, "Bolt", Path::new("/out/target.blk")));
        let target = backend.document(Path::new("/out/target.blk")).unwrap();
        assert_eq!(target.block("Bolt").unwrap().entities.len(), 2);
        assert_eq!(target.reference_count("Bolt"), 1);

        assert!(backend.insert_into_target_file(&frame, "Bolt", Path::new("/out/fresh.blk")));
        assert!(backend.document(Path::new("/out/fresh.blk")).is_some());
        assert!(!backend.insert_into_target_file(&frame, "Missing", Path::new("/out/fresh.blk")));
    }

    #[test]
    fn export_geometry_writes_model_space() {
        let backend = MemoryBackend::new();
        let frame = CoordinateFrame::from_origin(Point3::new(100.0, 0.0, 0.0));
        backend.define_block(&frame, "Nut", &[point(100.0)]);
        backend.define_block(&frame, "Assembly", &[point(101.0), reference("Nut")]);

        assert!(backend.export_geometry(Path::new("/out/assembly.blk"), "Assembly"));
        let exported = backend.document(Path::new("/out/assembly.blk")).unwrap();
        assert_eq!(exported.entities().count(), 2);
        assert!(exported.contains_block("Nut"));
        assert!(!exported.contains_block("Assembly"));

        let first = exported.entities().next().map(|(_, entity)| entity.clone());
        match first {
            Some(Entity::Point(point)) => assert!(point.position.distance(Point3::new(1.0, 0.0, 0.0)) < 1e-9),
            other => panic!("unexpected entity: {other:?}"),
        }
    }

    #[test]
    fn extract_geometry_skips_unresolvable_entries() {
        let mut current = Document::new();
        current.add_block_definition(BlockDefinition::new(
            "Broken",
            vec![
                point(1.0),
                reference("Gone"),
                Entity::Point(PointEntity {
                    position: Point3::new(f64::INFINITY, 0.0, 0.0),
                    layer: "0".to_string(),
                }),
            ],
        ));
        let handle = current.add_block_reference(
            "Broken",
            CoordinateFrame::from_origin(Point3::new(0.0, 3.0, 0.0)),
            "0",
        );
        let backend = MemoryBackend::with_current_document(current);

        let extracted = backend.extract_geometry(handle);
        assert_eq!(extracted.len(), 3);
        assert_eq!(extracted.iter().filter(|entry| entry.is_some()).count(), 1);
        match &extracted[0] {
            Some(Entity::Point(point)) => {
                assert!(point.position.distance(Point3::new(1.0, 3.0, 0.0)) < 1e-9)
            }
            other => panic!("unexpected entry: {other:?}"),
        }

        assert!(backend.extract_geometry(EntityId::new(999)).is_empty());
    }
}
