use std::f64::consts::FRAC_PI_2;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use zcad_block::{BlockError, BlockLibrary, MemoryBackend};
use zcad_config::AppConfig;
use zcad_core::document::{Entity, Line, Polyline};
use zcad_core::frame::CoordinateFrame;
use zcad_core::geometry::Point3;

/// 基于内存后端走一遍块的定义、放置、提取、重命名与清理流程，并打印概览。
pub fn run(config: &AppConfig, library_dir: Option<&Path>) -> Result<(), BlockError> {
    let backend = Arc::new(MemoryBackend::new());
    let library = BlockLibrary::from_config(backend.clone(), library_dir, config);

    let outline = Entity::Polyline(Polyline {
        vertices: vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(120.0, 0.0, 0.0),
            Point3::new(120.0, 60.0, 0.0),
            Point3::new(0.0, 60.0, 0.0),
        ],
        is_closed: true,
        layer: "FURNITURE".to_string(),
    });
    let leg = Entity::Line(Line {
        start: Point3::new(5.0, 5.0, 0.0),
        end: Point3::new(5.0, 5.0, -72.0),
        layer: "FURNITURE".to_string(),
    });

    let Some(desk) =
        library.define_from_geometry("Desk", &CoordinateFrame::identity(), &[outline, leg])?
    else {
        println!("后端拒绝定义块 Desk");
        return Ok(());
    };

    let frames = [
        CoordinateFrame::identity(),
        CoordinateFrame::from_origin(Point3::new(200.0, 0.0, 0.0)).rotated_about_z(FRAC_PI_2),
        CoordinateFrame::from_origin(Point3::new(0.0, 150.0, 0.0)).scaled(1.5, 1.0, 1.0),
    ];
    let mut instances = Vec::with_capacity(frames.len());
    for frame in &frames {
        instances.push(desk.place(frame)?);
    }
    info!(block = %desk.name(), instances = instances.len(), "已放置演示实例");

    println!("Rust 版 ZCAD 块管理演示");
    println!("块 {} 包含图元类型: {}", desk.name(), desk.contained_geometry_types()?.join(", "));
    for instance in &instances {
        let [sx, sy, sz] = instance.placement_frame().scale_factors();
        let origin = instance.placement_frame().origin;
        println!(
            "  - 实例 #{}，原点=({:.2}, {:.2}, {:.2})，缩放=({:.2}, {:.2}, {:.2})",
            instance.handle().get(),
            origin.x(),
            origin.y(),
            origin.z(),
            sx,
            sy,
            sz
        );
        for entity in instance.extract_geometry()? {
            if let Some(bounds) = entity.bounds() {
                println!(
                    "      {} 范围 ({:.2}, {:.2}, {:.2}) - ({:.2}, {:.2}, {:.2})",
                    entity.kind(),
                    bounds.min().x(),
                    bounds.min().y(),
                    bounds.min().z(),
                    bounds.max().x(),
                    bounds.max().y(),
                    bounds.max().z()
                );
            }
        }
    }

    let renamed = desk.rename("WritingDesk")?;
    println!("重命名为 WritingDesk: {renamed}");
    println!("存在实例时清理结果: {}", library.purge(&desk.name())?);

    let names: Vec<String> = library
        .available_definitions()?
        .iter()
        .map(|block| block.name())
        .collect();
    println!("当前文档块定义: {}", names.join(", "));
    let document = backend.current_document();
    println!("当前文档实体数量: {}", document.entities().count());
    if let Some(extents) = document.bounds() {
        println!(
            "当前文档范围 ({:.2}, {:.2}, {:.2}) - ({:.2}, {:.2}, {:.2})",
            extents.min().x(),
            extents.min().y(),
            extents.min().z(),
            extents.max().x(),
            extents.max().y(),
            extents.max().z()
        );
    }
    Ok(())
}
