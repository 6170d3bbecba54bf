use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;
use zcad_block::{
    Availability, BlockError, BlockInstance, BlockLibrary, GeometryBackend, MemoryBackend,
    SearchPathLocator,
};
use zcad_core::document::{
    BlockDefinition, BlockReference, Document, Entity, EntityId, Line, PointEntity,
};
use zcad_core::frame::CoordinateFrame;
use zcad_core::geometry::{Point3, Vector3};

/// 统计导入调用次数的后端包装。
struct CountingBackend {
    inner: MemoryBackend,
    imports: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            imports: AtomicUsize::new(0),
        }
    }

    fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }
}

impl GeometryBackend for CountingBackend {
    fn define_block(&self, frame: &CoordinateFrame, name: &str, entities: &[Entity]) -> bool {
        self.inner.define_block(frame, name, entities)
    }

    fn insert_from_file(
        &self,
        frame: &CoordinateFrame,
        file_path: &Path,
        name: &str,
    ) -> Option<EntityId> {
        self.inner.insert_from_file(frame, file_path, name)
    }

    fn insert_from_current_document(
        &self,
        frame: &CoordinateFrame,
        name: &str,
    ) -> Option<EntityId> {
        self.inner.insert_from_current_document(frame, name)
    }

    fn insert_into_target_file(
        &self,
        frame: &CoordinateFrame,
        name: &str,
        target_file_path: &Path,
    ) -> bool {
        self.inner.insert_into_target_file(frame, name, target_file_path)
    }

    fn import_one_from_file(&self, file_path: &Path, name: &str) {
        self.imports.fetch_add(1, Ordering::SeqCst);
        self.inner.import_one_from_file(file_path, name)
    }

    fn import_all_from_file(&self, file_path: &Path) -> Vec<String> {
        self.inner.import_all_from_file(file_path)
    }

    fn list_in_current_document(&self) -> Vec<String> {
        self.inner.list_in_current_document()
    }

    fn exists_in_current_document(&self, name: &str) -> bool {
        self.inner.exists_in_current_document(name)
    }

    fn purge(&self, name: &str) -> bool {
        self.inner.purge(name)
    }

    fn rename(&self, old_name: &str, new_name: &str) -> bool {
        self.inner.rename(old_name, new_name)
    }

    fn list_contents(&self, name: &str) -> Vec<String> {
        self.inner.list_contents(name)
    }

    fn export_definition(&self, file_path: &Path, name: &str) -> bool {
        self.inner.export_definition(file_path, name)
    }

    fn export_geometry(&self, file_path: &Path, name: &str) -> bool {
        self.inner.export_geometry(file_path, name)
    }

    fn extract_geometry(&self, instance: EntityId) -> Vec<Option<Entity>> {
        self.inner.extract_geometry(instance)
    }
}

fn point(x: f64, y: f64, z: f64) -> Entity {
    Entity::Point(PointEntity {
        position: Point3::new(x, y, z),
        layer: "0".to_string(),
    })
}

fn segment(start: Point3, end: Point3) -> Entity {
    Entity::Line(Line {
        start,
        end,
        layer: "GEOM".to_string(),
    })
}

/// 在临时目录中创建一个占位文件，并把外部文档注册到后端。
fn register_library_file(
    dir: &TempDir,
    file_name: &str,
    document: Document,
    register: impl FnOnce(PathBuf, Document),
) -> PathBuf {
    let path = dir.path().join(file_name);
    fs::write(&path, b"").expect("write placeholder file");
    let resolved = path.canonicalize().expect("canonicalize placeholder");
    register(resolved.clone(), document);
    resolved
}

fn library_with_blocks(names: &[&str]) -> Document {
    let mut document = Document::new();
    for (index, name) in names.iter().enumerate() {
        document.add_block_definition(BlockDefinition::new(
            *name,
            vec![point(index as f64, 0.0, 0.0)],
        ));
    }
    document
}

#[test]
fn defined_block_exists() {
    let library = BlockLibrary::new(Arc::new(MemoryBackend::new()), SearchPathLocator::default());
    for name in ["A", "Window frame", "门"] {
        let frame = CoordinateFrame::from_origin(Point3::new(1.0, 2.0, 3.0)).scaled(2.0, 1.0, 0.5);
        let block = library
            .define_from_geometry(name, &frame, &[point(0.0, 0.0, 0.0)])
            .expect("define should not error")
            .expect("define should succeed");
        assert_eq!(block.name(), name);
        assert!(library.exists(name).unwrap());
    }
}

#[test]
fn placing_sourced_definition_imports_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(CountingBackend::new());
    register_library_file(&dir, "doors.blk", library_with_blocks(&["Door"]), |path, doc| {
        backend.inner.insert_document(path, doc);
    });

    let library = BlockLibrary::new(
        backend.clone(),
        SearchPathLocator::new([dir.path().to_path_buf()]),
    );
    let door = library.import("Door", "doors.blk").unwrap();
    assert_eq!(backend.imports(), 1);

    // 导入后被清理，定义句柄仍记得来源文档。
    assert!(library.purge("Door").unwrap());
    assert!(!library.exists("Door").unwrap());

    let first = door.place(&CoordinateFrame::identity()).unwrap();
    assert_eq!(backend.imports(), 2);
    assert!(library.exists("Door").unwrap());

    assert_eq!(door.ensure_available().unwrap(), Availability::Local);
    let second = door
        .place(&CoordinateFrame::from_origin(Point3::new(3.0, 0.0, 0.0)))
        .unwrap();
    assert_eq!(backend.imports(), 2);
    assert_ne!(first.handle(), second.handle());
    assert!(first.definition().same_definition(second.definition()));
}

#[test]
fn purge_waits_for_instances_to_disappear() {
    let backend = Arc::new(MemoryBackend::new());
    let library = BlockLibrary::new(backend.clone(), SearchPathLocator::default());
    let bolt = library
        .define_from_geometry("Bolt", &CoordinateFrame::identity(), &[point(0.0, 0.0, 0.0)])
        .unwrap()
        .unwrap();
    let first = bolt.place(&CoordinateFrame::identity()).unwrap();
    let second = bolt
        .place(&CoordinateFrame::from_origin(Point3::new(0.0, 0.0, 4.0)))
        .unwrap();

    assert!(!library.purge("Bolt").unwrap());
    assert!(backend.erase_entity(first.handle()));
    assert!(!library.purge("Bolt").unwrap());
    assert!(library.exists("Bolt").unwrap());

    assert!(backend.erase_entity(second.handle()));
    assert!(library.purge("Bolt").unwrap());
    assert!(!library.exists("Bolt").unwrap());
}

#[test]
fn rename_moves_identity_to_new_name() {
    let library = BlockLibrary::new(Arc::new(MemoryBackend::new()), SearchPathLocator::default());
    let block = library
        .define_from_geometry("old", &CoordinateFrame::identity(), &[point(0.0, 0.0, 0.0)])
        .unwrap()
        .unwrap();
    let instance = block.place(&CoordinateFrame::identity()).unwrap();

    assert!(block.rename("new").unwrap());
    assert_eq!(block.name(), "new");
    assert_eq!(instance.definition().name(), "new");
    assert!(!library.exists("old").unwrap());
    assert!(library.exists("new").unwrap());

    // 改名后的实例仍能解析定义。
    assert_eq!(instance.extract_geometry().unwrap().len(), 1);
}

#[test]
fn frame_validation_accepts_scale_and_rejects_shear() {
    let library = BlockLibrary::new(Arc::new(MemoryBackend::new()), SearchPathLocator::default());
    let block = library
        .define_from_geometry("Beam", &CoordinateFrame::identity(), &[point(1.0, 1.0, 1.0)])
        .unwrap()
        .unwrap();

    let scaled = CoordinateFrame::new(
        Point3::ORIGIN,
        Vector3::new(10.0, 0.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, 0.0, 1.0),
    );
    let instance = block.place(&scaled).expect("non-uniform scale is allowed");
    match instance.extract_geometry().unwrap().as_slice() {
        [Entity::Point(p)] => assert!(p.position.distance(Point3::new(10.0, 1.0, 1.0)) < 1e-9),
        other => panic!("unexpected geometry: {other:?}"),
    }

    let sheared = CoordinateFrame::new(
        Point3::ORIGIN,
        Vector3::new(1.0, 0.2, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(0.0, 0.0, 1.0),
    );
    let err = block.place(&sheared).unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("frame"));
}

#[test]
fn extraction_skips_invalid_backend_entities() {
    let mut current = Document::new();
    current.add_block_definition(BlockDefinition::new(
        "Panel",
        vec![
            segment(Point3::ORIGIN, Point3::new(1.0, 0.0, 0.0)),
            Entity::BlockReference(BlockReference {
                name: "Missing".to_string(),
                frame: CoordinateFrame::identity(),
                layer: "0".to_string(),
            }),
            point(f64::NAN, 0.0, 0.0),
            point(0.0, 1.0, 0.0),
        ],
    ));
    let library = BlockLibrary::new(
        Arc::new(MemoryBackend::with_current_document(current)),
        SearchPathLocator::default(),
    );

    let panel = library
        .available_definitions()
        .unwrap()
        .into_iter()
        .find(|block| block.name() == "Panel")
        .expect("panel listed");
    assert!(panel.source_document().is_none());

    let instance = panel
        .place(&CoordinateFrame::from_origin(Point3::new(0.0, 0.0, 2.0)))
        .unwrap();
    let geometry = instance.extract_geometry().unwrap();
    assert_eq!(geometry.len(), 2);
    assert!(geometry.iter().all(Entity::is_finite));
}

#[test]
fn import_all_tags_every_definition_with_source() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let resolved = register_library_file(&dir, "set.blk", library_with_blocks(&["B", "A"]), |path, doc| {
        backend.insert_document(path, doc);
    });

    let library = BlockLibrary::new(
        backend.clone(),
        SearchPathLocator::new([dir.path().to_path_buf()]),
    );
    let blocks = library.import_all("set.blk").unwrap();
    let names: Vec<String> = blocks.iter().map(|block| block.name()).collect();
    assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    assert!(blocks
        .iter()
        .all(|block| block.source_document() == Some(resolved.as_path())));
    assert!(library.exists("A").unwrap());
    assert!(library.exists("B").unwrap());

    let err = library.import_all("absent.blk").unwrap_err();
    assert!(matches!(err, BlockError::FileNotFound(_)));
}

#[test]
fn reimport_overwrites_local_definition() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let mut external = Document::new();
    external.add_block_definition(BlockDefinition::new(
        "Sign",
        vec![point(0.0, 0.0, 0.0), point(1.0, 0.0, 0.0)],
    ));
    register_library_file(&dir, "signs.blk", external, |path, doc| {
        backend.insert_document(path, doc);
    });
    let library = BlockLibrary::new(
        backend.clone(),
        SearchPathLocator::new([dir.path().to_path_buf()]),
    );

    library
        .define_from_geometry("Sign", &CoordinateFrame::identity(), &[point(5.0, 5.0, 5.0)])
        .unwrap()
        .unwrap();
    let sign = library.import("Sign", "signs.blk").unwrap();
    assert!(sign.source_document().is_some());
    assert_eq!(
        backend.current_document().block("Sign").unwrap().entities.len(),
        2
    );
}

#[test]
fn export_and_place_into_other_documents() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let library = BlockLibrary::new(backend.clone(), SearchPathLocator::default());
    let block = library
        .define_from_geometry(
            "Table",
            &CoordinateFrame::identity(),
            &[
                segment(Point3::ORIGIN, Point3::new(2.0, 0.0, 0.0)),
                point(1.0, 1.0, 0.0),
            ],
        )
        .unwrap()
        .unwrap();

    let definition_target = dir.path().join("definitions.blk");
    assert!(block.export(&definition_target.to_string_lossy()).unwrap());
    let exported = backend.document(&definition_target).unwrap();
    assert!(exported.contains_block("Table"));
    assert_eq!(exported.entities().count(), 0);

    let geometry_target = dir.path().join("table.blk");
    assert!(block.export_geometry(&geometry_target.to_string_lossy()).unwrap());
    assert_eq!(backend.document(&geometry_target).unwrap().entities().count(), 2);

    let placement_target = dir.path().join("layout.blk");
    let frame = CoordinateFrame::from_origin(Point3::new(0.0, 10.0, 0.0)).rotated_about_z(0.5);
    assert!(block
        .place_into_document(&frame, &placement_target.to_string_lossy())
        .unwrap());
    assert!(block
        .place_into_document(&frame, &placement_target.to_string_lossy())
        .unwrap());
    let layout = backend.document(&placement_target).unwrap();
    assert!(layout.contains_block("Table"));
    assert_eq!(layout.reference_count("Table"), 2);

    // 当前文档中没有实例，仍可清理。
    assert!(library.purge("Table").unwrap());
    assert!(!block
        .place_into_document(&frame, &placement_target.to_string_lossy())
        .unwrap());
}

#[test]
fn place_directly_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let resolved = register_library_file(&dir, "chairs.blk", library_with_blocks(&["Chair"]), |path, doc| {
        backend.insert_document(path, doc);
    });
    let library = BlockLibrary::new(
        backend.clone(),
        SearchPathLocator::new([dir.path().to_path_buf()]),
    );

    let instance =
        BlockInstance::from_file(&library, &CoordinateFrame::identity(), "chairs.blk", "Chair")
            .unwrap();
    assert_eq!(instance.definition().source_document(), Some(resolved.as_path()));
    assert_eq!(
        instance.definition().contained_geometry_types().unwrap(),
        vec!["Point".to_string()]
    );
    assert!(!library.purge("Chair").unwrap());

    let err = BlockInstance::from_file(&library, &CoordinateFrame::identity(), "nope.blk", "Chair")
        .unwrap_err();
    assert!(matches!(err, BlockError::FileNotFound(_)));
}

#[test]
fn nested_instances_extract_composed_references() {
    let library = BlockLibrary::new(Arc::new(MemoryBackend::new()), SearchPathLocator::default());
    let leg = library
        .define_from_geometry(
            "Leg",
            &CoordinateFrame::identity(),
            &[segment(Point3::ORIGIN, Point3::new(0.0, 0.0, 1.0))],
        )
        .unwrap()
        .unwrap();
    let leg_instance = leg
        .place(&CoordinateFrame::from_origin(Point3::new(1.0, 0.0, 0.0)))
        .unwrap();
    assert_eq!(leg.contained_geometry_types().unwrap(), vec!["Line".to_string()]);

    let nested = Entity::BlockReference(BlockReference {
        name: "Leg".to_string(),
        frame: *leg_instance.placement_frame(),
        layer: "0".to_string(),
    });
    let stool = library
        .define_from_geometry("Stool", &CoordinateFrame::identity(), &[nested])
        .unwrap()
        .unwrap();
    let placed = stool
        .place(&CoordinateFrame::from_origin(Point3::new(0.0, 5.0, 0.0)).scaled(2.0, 2.0, 2.0))
        .unwrap();

    match placed.extract_geometry().unwrap().as_slice() {
        [Entity::BlockReference(reference)] => {
            assert_eq!(reference.name, "Leg");
            assert!(reference.frame.origin.distance(Point3::new(2.0, 5.0, 0.0)) < 1e-9);
            assert!((reference.frame.scale_factors()[2] - 2.0).abs() < 1e-9);
        }
        other => panic!("unexpected geometry: {other:?}"),
    }

    // Leg 被 Stool 引用，不能清理。
    assert!(!library.purge("Leg").unwrap());
}
