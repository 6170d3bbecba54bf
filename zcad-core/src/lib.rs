pub mod geometry {
    use glam::DVec3;
    use serde::{Deserialize, Serialize};

    /// 三维点，内部以 `glam::DVec3` 表示，保持双精度。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point3(pub DVec3);

    impl Point3 {
        pub const ORIGIN: Point3 = Point3(DVec3::ZERO);

        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn z(self) -> f64 {
            self.0.z
        }

        #[inline]
        pub fn translate(self, offset: Vector3) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn distance(self, other: Point3) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn is_finite(self) -> bool {
            self.0.is_finite()
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }
    }

    impl From<DVec3> for Point3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 三维向量，用作坐标系基轴与位移。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector3(pub DVec3);

    impl Vector3 {
        pub const X: Vector3 = Vector3(DVec3::X);
        pub const Y: Vector3 = Vector3(DVec3::Y);
        pub const Z: Vector3 = Vector3(DVec3::Z);

        #[inline]
        pub fn new(x: f64, y: f64, z: f64) -> Self {
            Self(DVec3::new(x, y, z))
        }

        #[inline]
        pub fn as_vec3(self) -> DVec3 {
            self.0
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn normalize(self) -> Option<Self> {
            let len = self.0.length();
            if len == 0.0 || !len.is_finite() {
                return None;
            }
            let unit = self.0 / len;
            unit.is_finite().then_some(Self(unit))
        }

        #[inline]
        pub fn scale(self, factor: f64) -> Self {
            Self(self.0 * factor)
        }

        #[inline]
        pub fn dot(self, other: Vector3) -> f64 {
            self.0.dot(other.0)
        }
    }

    impl From<DVec3> for Vector3 {
        fn from(value: DVec3) -> Self {
            Self(value)
        }
    }

    /// 三维轴对齐边界框，用于估算文档/实体范围。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds3D {
        min: Point3,
        max: Point3,
    }

    impl Bounds3D {
        #[inline]
        pub fn new(min: Point3, max: Point3) -> Self {
            Self { min, max }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
                max: Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y() || self.min.z() > self.max.z()
        }

        #[inline]
        pub fn min(&self) -> Point3 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point3 {
            self.max
        }

        pub fn include_point(&mut self, point: Point3) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            self.min = Point3(self.min.as_vec3().min(point.as_vec3()));
            self.max = Point3(self.max.as_vec3().max(point.as_vec3()));
        }

        pub fn include_bounds(&mut self, other: &Bounds3D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }
    }
}

pub mod frame {
    use glam::{DMat3, DVec3};
    use serde::{Deserialize, Serialize};

    use crate::geometry::{Point3, Vector3};

    /// 基轴两两夹角余弦允许的偏差。超出即视为错切。
    pub const DEFAULT_SHEAR_TOLERANCE: f64 = 1e-6;

    /// 行列式与三轴长度乘积之比低于该值时视为奇异，与坐标系的绝对尺度无关。
    const SINGULAR_TOLERANCE: f64 = 1e-12;

    /// 块放置使用的坐标系：原点加三根基轴。
    ///
    /// 基轴必须两两正交，但长度可以各不相同（非均匀缩放）。
    /// 构造本身不做校验，是否错切由 [`CoordinateFrame::is_sheared`] 在使用处判断。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct CoordinateFrame {
        pub origin: Point3,
        pub x_axis: Vector3,
        pub y_axis: Vector3,
        pub z_axis: Vector3,
    }

    impl CoordinateFrame {
        #[inline]
        pub fn new(origin: Point3, x_axis: Vector3, y_axis: Vector3, z_axis: Vector3) -> Self {
            Self {
                origin,
                x_axis,
                y_axis,
                z_axis,
            }
        }

        #[inline]
        pub fn identity() -> Self {
            Self::from_origin(Point3::ORIGIN)
        }

        /// 世界坐标轴平移到指定原点。
        #[inline]
        pub fn from_origin(origin: Point3) -> Self {
            Self::new(origin, Vector3::X, Vector3::Y, Vector3::Z)
        }

        #[inline]
        pub fn translated(self, offset: Vector3) -> Self {
            Self {
                origin: self.origin.translate(offset),
                ..self
            }
        }

        /// 按轴缩放基向量，原点保持不变。
        pub fn scaled(self, sx: f64, sy: f64, sz: f64) -> Self {
            Self {
                x_axis: self.x_axis.scale(sx),
                y_axis: self.y_axis.scale(sy),
                z_axis: self.z_axis.scale(sz),
                ..self
            }
        }

        /// 绕世界 Z 轴旋转基轴（弧度），原点不动。
        pub fn rotated_about_z(self, angle: f64) -> Self {
            let rotation = DMat3::from_rotation_z(angle);
            Self {
                x_axis: Vector3(rotation * self.x_axis.0),
                y_axis: Vector3(rotation * self.y_axis.0),
                z_axis: Vector3(rotation * self.z_axis.0),
                ..self
            }
        }

        /// 各基轴长度，即该坐标系携带的缩放系数。
        pub fn scale_factors(&self) -> [f64; 3] {
            [
                self.x_axis.length(),
                self.y_axis.length(),
                self.z_axis.length(),
            ]
        }

        #[inline]
        pub fn is_sheared(&self) -> bool {
            self.is_sheared_with(DEFAULT_SHEAR_TOLERANCE)
        }

        /// 归一化后两两点积都必须落在容差内；长度差异不参与判断。
        /// 零长度基轴无法确定夹角，同样按错切处理。
        pub fn is_sheared_with(&self, tolerance: f64) -> bool {
            let (Some(x), Some(y), Some(z)) = (
                self.x_axis.normalize(),
                self.y_axis.normalize(),
                self.z_axis.normalize(),
            ) else {
                return true;
            };
            [x.dot(y), y.dot(z), z.dot(x)]
                .iter()
                .any(|cosine| cosine.abs() > tolerance)
        }

        #[inline]
        pub fn basis(&self) -> DMat3 {
            DMat3::from_cols(self.x_axis.0, self.y_axis.0, self.z_axis.0)
        }

        /// 局部坐标映射到世界坐标。
        #[inline]
        pub fn to_world(&self, local: Point3) -> Point3 {
            Point3(self.origin.0 + self.basis() * local.0)
        }

        /// 世界坐标映射回局部坐标；退化坐标系返回 `None`。
        pub fn to_local(&self, world: Point3) -> Option<Point3> {
            self.inverse().map(|inverse| inverse.to_world(world))
        }

        /// 逆变换对应的坐标系。
        pub fn inverse(&self) -> Option<CoordinateFrame> {
            let basis = self.basis();
            let determinant = basis.determinant();
            let [sx, sy, sz] = self.scale_factors();
            let volume = sx * sy * sz;
            if !determinant.is_finite()
                || !volume.is_finite()
                || volume == 0.0
                || determinant.abs() <= volume * SINGULAR_TOLERANCE
            {
                return None;
            }
            let inverse = basis.inverse();
            let origin: DVec3 = -(inverse * self.origin.0);
            Some(Self::new(
                Point3(origin),
                Vector3(inverse.x_axis),
                Vector3(inverse.y_axis),
                Vector3(inverse.z_axis),
            ))
        }

        /// 把以本坐标系为父级的 `inner` 展开成世界坐标系。
        pub fn compose(&self, inner: &CoordinateFrame) -> CoordinateFrame {
            let basis = self.basis();
            Self::new(
                self.to_world(inner.origin),
                Vector3(basis * inner.x_axis.0),
                Vector3(basis * inner.y_axis.0),
                Vector3(basis * inner.z_axis.0),
            )
        }
    }

    impl Default for CoordinateFrame {
        fn default() -> Self {
            Self::identity()
        }
    }

}

pub mod document {
    use std::collections::{BTreeSet, HashMap};

    use serde::{Deserialize, Serialize};

    use crate::frame::CoordinateFrame;
    use crate::geometry::{Bounds3D, Point3};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        /// 提供原始数值，便于序列化或日志输出。
        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Layer {
        pub name: String,
        pub is_visible: bool,
    }

    impl Layer {
        #[inline]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                is_visible: true,
            }
        }
    }

    /// 文档实体。仅收录在正交（可非均匀缩放）仿射变换下保持类型不变的图元。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub enum Entity {
        Point(PointEntity),
        Line(Line),
        Polyline(Polyline),
        Face3D(ThreeDFace),
        BlockReference(BlockReference),
    }

    impl Entity {
        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Point(point) => &point.layer,
                Entity::Line(line) => &line.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Face3D(face) => &face.layer,
                Entity::BlockReference(reference) => &reference.layer,
            }
        }

        /// 类型标签，供块内容查询使用。
        #[inline]
        pub fn kind(&self) -> &'static str {
            match self {
                Entity::Point(_) => "Point",
                Entity::Line(_) => "Line",
                Entity::Polyline(_) => "Polyline",
                Entity::Face3D(_) => "Face3D",
                Entity::BlockReference(_) => "BlockReference",
            }
        }

        /// 将实体从 `frame` 的局部坐标映射到其父坐标。
        /// 块参照不展开，只把自身坐标系与 `frame` 组合。
        pub fn transformed(&self, frame: &CoordinateFrame) -> Entity {
            match self {
                Entity::Point(point) => Entity::Point(PointEntity {
                    position: frame.to_world(point.position),
                    layer: point.layer.clone(),
                }),
                Entity::Line(line) => Entity::Line(Line {
                    start: frame.to_world(line.start),
                    end: frame.to_world(line.end),
                    layer: line.layer.clone(),
                }),
                Entity::Polyline(polyline) => Entity::Polyline(Polyline {
                    vertices: polyline
                        .vertices
                        .iter()
                        .map(|vertex| frame.to_world(*vertex))
                        .collect(),
                    is_closed: polyline.is_closed,
                    layer: polyline.layer.clone(),
                }),
                Entity::Face3D(face) => Entity::Face3D(ThreeDFace {
                    vertices: face.vertices.map(|vertex| frame.to_world(vertex)),
                    invisible_edges: face.invisible_edges,
                    layer: face.layer.clone(),
                }),
                Entity::BlockReference(reference) => Entity::BlockReference(BlockReference {
                    name: reference.name.clone(),
                    frame: frame.compose(&reference.frame),
                    layer: reference.layer.clone(),
                }),
            }
        }

        /// 所有坐标（以及块参照的坐标系分量）均为有限值。
        pub fn is_finite(&self) -> bool {
            match self {
                Entity::Point(point) => point.position.is_finite(),
                Entity::Line(line) => line.start.is_finite() && line.end.is_finite(),
                Entity::Polyline(polyline) => {
                    polyline.vertices.iter().all(|vertex| vertex.is_finite())
                }
                Entity::Face3D(face) => face.vertices.iter().all(|vertex| vertex.is_finite()),
                Entity::BlockReference(reference) => {
                    let frame = &reference.frame;
                    frame.origin.is_finite()
                        && frame.x_axis.0.is_finite()
                        && frame.y_axis.0.is_finite()
                        && frame.z_axis.0.is_finite()
                }
            }
        }

        /// 计算实体的 3D 轴对齐范围，块参照退化为插入点。
        pub fn bounds(&self) -> Option<Bounds3D> {
            let mut bounds = Bounds3D::empty();
            match self {
                Entity::Point(point) => bounds.include_point(point.position),
                Entity::Line(line) => {
                    bounds.include_point(line.start);
                    bounds.include_point(line.end);
                }
                Entity::Polyline(polyline) => {
                    for vertex in &polyline.vertices {
                        bounds.include_point(*vertex);
                    }
                }
                Entity::Face3D(face) => {
                    for vertex in &face.vertices {
                        bounds.include_point(*vertex);
                    }
                }
                Entity::BlockReference(reference) => bounds.include_point(reference.frame.origin),
            }
            if bounds.is_empty() { None } else { Some(bounds) }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct PointEntity {
        pub position: Point3,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Line {
        pub start: Point3,
        pub end: Point3,
        pub layer: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<Point3>,
        pub is_closed: bool,
        pub layer: String,
    }

    /// 3D 面（3DFACE）实体。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ThreeDFace {
        pub layer: String,
        pub vertices: [Point3; 4],
        /// 依次表示边 1-4 是否隐藏。
        pub invisible_edges: [bool; 4],
    }

    /// 块参照：按名称引用块定义，并携带放置坐标系。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BlockReference {
        pub name: String,
        pub frame: CoordinateFrame,
        pub layer: String,
    }

    /// 块定义。`entities` 以块局部坐标储存。
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct BlockDefinition {
        pub name: String,
        pub entities: Vec<Entity>,
    }

    impl BlockDefinition {
        pub fn new(name: impl Into<String>, entities: Vec<Entity>) -> Self {
            Self {
                name: name.into(),
                entities,
            }
        }

        /// 直接引用的嵌套块名称。
        pub fn referenced_blocks(&self) -> impl Iterator<Item = &str> {
            self.entities.iter().filter_map(|entity| match entity {
                Entity::BlockReference(reference) => Some(reference.name.as_str()),
                _ => None,
            })
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Document {
        layers: HashMap<String, Layer>,
        entities: Vec<(EntityId, Entity)>,
        next_entity_id: u64,
        blocks: HashMap<String, BlockDefinition>,
    }

    impl Document {
        pub fn new() -> Self {
            let mut doc = Self::default();
            doc.ensure_layer("0");
            doc
        }

        pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
            let key = name.as_ref();
            self.layers
                .entry(key.to_string())
                .or_insert_with(|| Layer::new(key));
        }

        pub fn add_entity(&mut self, entity: Entity) -> EntityId {
            self.ensure_layer(entity.layer_name());
            let id = self.next_id();
            self.entities.push((id, entity));
            id
        }

        pub fn add_block_reference(
            &mut self,
            name: impl Into<String>,
            frame: CoordinateFrame,
            layer: impl Into<String>,
        ) -> EntityId {
            self.add_entity(Entity::BlockReference(BlockReference {
                name: name.into(),
                frame,
                layer: layer.into(),
            }))
        }

        /// 写入块定义，同名定义被覆盖并返回旧值。
        pub fn add_block_definition(&mut self, definition: BlockDefinition) -> Option<BlockDefinition> {
            for entity in &definition.entities {
                self.ensure_layer(entity.layer_name());
            }
            self.blocks.insert(definition.name.clone(), definition)
        }

        #[inline]
        pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
            self.blocks.get(name)
        }

        #[inline]
        pub fn contains_block(&self, name: &str) -> bool {
            self.blocks.contains_key(name)
        }

        #[inline]
        pub fn blocks(&self) -> impl Iterator<Item = &BlockDefinition> {
            self.blocks.values()
        }

        /// 按字典序返回全部块名，保证输出稳定。
        pub fn block_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.blocks.keys().cloned().collect();
            names.sort();
            names
        }

        pub fn remove_block(&mut self, name: &str) -> Option<BlockDefinition> {
            self.blocks.remove(name)
        }

        /// 重命名块定义并同步改写模型空间及其他块内的所有参照。
        /// 旧名不存在或新名已被占用时返回 `false`。
        pub fn rename_block(&mut self, old_name: &str, new_name: &str) -> bool {
            if old_name == new_name || self.blocks.contains_key(new_name) {
                return false;
            }
            let Some(mut definition) = self.blocks.remove(old_name) else {
                return false;
            };
            definition.name = new_name.to_string();
            self.blocks.insert(new_name.to_string(), definition);

            let model_space = self.entities.iter_mut().map(|(_, entity)| entity);
            let nested = self
                .blocks
                .values_mut()
                .flat_map(|definition| definition.entities.iter_mut());
            for entity in model_space.chain(nested) {
                if let Entity::BlockReference(reference) = entity {
                    if reference.name == old_name {
                        reference.name = new_name.to_string();
                    }
                }
            }
            true
        }

        /// 统计模型空间与其他块定义中对 `name` 的参照数量。
        pub fn reference_count(&self, name: &str) -> usize {
            let is_reference =
                |entity: &Entity| matches!(entity, Entity::BlockReference(reference) if reference.name == name);
            let model_space = self
                .entities
                .iter()
                .filter(|(_, entity)| is_reference(entity))
                .count();
            let nested = self
                .blocks
                .values()
                .filter(|definition| definition.name != name)
                .flat_map(|definition| definition.entities.iter())
                .filter(|entity| is_reference(entity))
                .count();
            model_space + nested
        }

        /// 递归收集 `name` 依赖的嵌套块（不含自身），按字典序返回。
        pub fn block_dependencies(&self, name: &str) -> Vec<String> {
            let mut found = BTreeSet::new();
            let mut pending = vec![name.to_string()];
            while let Some(current) = pending.pop() {
                let Some(definition) = self.blocks.get(&current) else {
                    continue;
                };
                for nested in definition.referenced_blocks() {
                    if nested != name && found.insert(nested.to_string()) {
                        pending.push(nested.to_string());
                    }
                }
            }
            found.into_iter().collect()
        }

        #[inline]
        pub fn layers(&self) -> impl Iterator<Item = &Layer> {
            self.layers.values()
        }

        #[inline]
        pub fn entities(&self) -> impl Iterator<Item = &(EntityId, Entity)> {
            self.entities.iter()
        }

        pub fn remove_entity(&mut self, id: EntityId) -> Option<Entity> {
            let index = self
                .entities
                .iter()
                .position(|(entity_id, _)| *entity_id == id)?;
            Some(self.entities.remove(index).1)
        }

        #[inline]
        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.entities
                .iter()
                .find_map(|(entity_id, entity)| (*entity_id == id).then_some(entity))
        }

        pub fn bounds(&self) -> Option<Bounds3D> {
            let mut bounds = Bounds3D::empty();
            for (_, entity) in &self.entities {
                if let Some(entity_bounds) = entity.bounds() {
                    bounds.include_bounds(&entity_bounds);
                }
            }
            if bounds.is_empty() { None } else { Some(bounds) }
        }

        fn next_id(&mut self) -> EntityId {
            self.next_entity_id += 1;
            EntityId::new(self.next_entity_id)
        }
    }

}
