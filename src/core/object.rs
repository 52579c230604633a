//! Dataset object model: tagged-variant shapes built from shared-memory
//! vectors, with metadata, ordered string attributes, named attachments and
//! a closed capability-interface table instead of an inheritance hierarchy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::meta::Meta;
use crate::core::shm::{Arena, BlockRef};
use crate::core::shmvec::{ShmPod, ShmVector};
use crate::Result;

/// Unique identifier for objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered string attribute map, last-write-wins.
///
/// Writes to an existing key update the value in place so the original
/// insertion order is stable for consumers that iterate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMap {
    entries: Vec<(String, String)>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Object type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Points,
    Lines,
    Triangles,
    UnstructuredGrid,
    UniformGrid,
    ScalarField,
    Vector3Field,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Points => "Points",
            ObjectType::Lines => "Lines",
            ObjectType::Triangles => "Triangles",
            ObjectType::UnstructuredGrid => "UnstructuredGrid",
            ObjectType::UniformGrid => "UniformGrid",
            ObjectType::ScalarField => "ScalarField",
            ObjectType::Vector3Field => "Vector3Field",
        }
    }
}

/// A coordinate set: one shared vector per axis.
#[derive(Debug, Clone)]
pub struct Coords {
    pub x: ShmVector<f32>,
    pub y: ShmVector<f32>,
    pub z: ShmVector<f32>,
}

impl Coords {
    pub fn new(arena: &Arena, num_vertices: usize) -> Result<Self> {
        Ok(Self {
            x: ShmVector::new(arena, num_vertices)?,
            y: ShmVector::new(arena, num_vertices)?,
            z: ShmVector::new(arena, num_vertices)?,
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.x.len()
    }
}

/// Geometry-specific payload of an object.
///
/// Mapped-data variants reference their grid through a counted handle; the
/// dependency is strictly one-way (data to grid, never back).
#[derive(Debug, Clone)]
pub enum Shape {
    Points {
        coords: Coords,
    },
    Lines {
        /// Start of each line in the corner list.
        el: ShmVector<u64>,
        /// Vertex indices.
        cl: ShmVector<u64>,
        coords: Coords,
    },
    Triangles {
        cl: ShmVector<u64>,
        coords: Coords,
    },
    UnstructuredGrid {
        el: ShmVector<u64>,
        cl: ShmVector<u64>,
        /// Cell type per element.
        tl: ShmVector<u8>,
        coords: Coords,
    },
    UniformGrid {
        dims: [u32; 3],
        min: [f64; 3],
        max: [f64; 3],
    },
    ScalarField {
        data: ShmVector<f32>,
        grid: Option<Box<Object>>,
    },
    Vector3Field {
        x: ShmVector<f32>,
        y: ShmVector<f32>,
        z: ShmVector<f32>,
        grid: Option<Box<Object>>,
        normals: Option<Box<Object>>,
    },
}

impl Shape {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Shape::Points { .. } => ObjectType::Points,
            Shape::Lines { .. } => ObjectType::Lines,
            Shape::Triangles { .. } => ObjectType::Triangles,
            Shape::UnstructuredGrid { .. } => ObjectType::UnstructuredGrid,
            Shape::UniformGrid { .. } => ObjectType::UniformGrid,
            Shape::ScalarField { .. } => ObjectType::ScalarField,
            Shape::Vector3Field { .. } => ObjectType::Vector3Field,
        }
    }
}

/// A dataset object. Handles have value semantics; the bulk data behind the
/// shape's vectors is shared and reference counted in the arena.
#[derive(Debug, Clone)]
pub struct Object {
    pub id: ObjectId,
    pub meta: Meta,
    attributes: AttributeMap,
    attachments: Vec<(String, Object)>,
    pub shape: Shape,
}

impl Object {
    pub fn new(shape: Shape) -> Self {
        Self {
            id: ObjectId::new(),
            meta: Meta::default(),
            attributes: AttributeMap::new(),
            attachments: Vec::new(),
            shape,
        }
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn object_type(&self) -> ObjectType {
        self.shape.object_type()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.set(key, value);
    }

    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Attach a named sub-object (e.g. per-cell data, ghost layers).
    pub fn add_attachment(&mut self, name: impl Into<String>, obj: Object) {
        self.attachments.push((name.into(), obj));
    }

    pub fn attachment(&self, name: &str) -> Option<&Object> {
        self.attachments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, o)| o)
    }

    /// Capability query: `None` when this variant does not implement `I`.
    pub fn interface<I: Interface>(&self) -> Option<I> {
        I::probe(self)
    }

    /// Serialize for a cross-host hop (array contents inline).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let record = self.to_record(TransferMode::Inline);
        Ok(bincode::serialize(&record)?)
    }

    /// Rebuild from a cross-host transfer, allocating fresh storage.
    pub fn from_bytes(arena: &Arena, bytes: &[u8]) -> Result<Self> {
        let record: ObjectRecord = bincode::deserialize(bytes)?;
        Self::from_record(arena, record)
    }

    /// Build a transfer record. `Handle` mode exports one arena reference per
    /// array for the receiver to adopt; `Inline` copies the contents.
    pub fn to_record(&self, mode: TransferMode) -> ObjectRecord {
        ObjectRecord {
            id: self.id,
            meta: self.meta.clone(),
            attributes: self.attributes.clone(),
            attachments: self
                .attachments
                .iter()
                .map(|(n, o)| (n.clone(), o.to_record(mode)))
                .collect(),
            shape: ShapeRecord::from_shape(&self.shape, mode),
        }
    }

    pub fn from_record(arena: &Arena, record: ObjectRecord) -> Result<Self> {
        let mut attachments = Vec::with_capacity(record.attachments.len());
        for (name, rec) in record.attachments {
            attachments.push((name, Self::from_record(arena, rec)?));
        }
        Ok(Self {
            id: record.id,
            meta: record.meta,
            attributes: record.attributes,
            attachments,
            shape: ShapeRecord::into_shape(record.shape, arena)?,
        })
    }
}

/// How array payloads travel in an [`ObjectRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Same arena: pass block handles, transfer one reference each.
    Handle,
    /// Different host: serialize contents.
    Inline,
}

/// One array slot of a transfer record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub enum ArrayRef<T: ShmPod> {
    Handle(BlockRef),
    Inline(Vec<T>),
}

impl<T: ShmPod + Serialize + serde::de::DeserializeOwned> ArrayRef<T> {
    fn export(v: &ShmVector<T>, mode: TransferMode) -> Self {
        match mode {
            TransferMode::Handle => ArrayRef::Handle(v.export_handle()),
            TransferMode::Inline => ArrayRef::Inline(v.to_vec()),
        }
    }

    fn import(self, arena: &Arena) -> Result<ShmVector<T>> {
        match self {
            ArrayRef::Handle(block) => ShmVector::adopt_block(arena, block),
            ArrayRef::Inline(data) => ShmVector::from_slice(arena, &data),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordsRecord {
    x: ArrayRef<f32>,
    y: ArrayRef<f32>,
    z: ArrayRef<f32>,
}

impl CoordsRecord {
    fn export(c: &Coords, mode: TransferMode) -> Self {
        Self {
            x: ArrayRef::export(&c.x, mode),
            y: ArrayRef::export(&c.y, mode),
            z: ArrayRef::export(&c.z, mode),
        }
    }

    fn import(self, arena: &Arena) -> Result<Coords> {
        Ok(Coords {
            x: self.x.import(arena)?,
            y: self.y.import(arena)?,
            z: self.z.import(arena)?,
        })
    }
}

/// Serializable mirror of [`Shape`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShapeRecord {
    Points {
        coords: CoordsRecord,
    },
    Lines {
        el: ArrayRef<u64>,
        cl: ArrayRef<u64>,
        coords: CoordsRecord,
    },
    Triangles {
        cl: ArrayRef<u64>,
        coords: CoordsRecord,
    },
    UnstructuredGrid {
        el: ArrayRef<u64>,
        cl: ArrayRef<u64>,
        tl: ArrayRef<u8>,
        coords: CoordsRecord,
    },
    UniformGrid {
        dims: [u32; 3],
        min: [f64; 3],
        max: [f64; 3],
    },
    ScalarField {
        data: ArrayRef<f32>,
        grid: Option<Box<ObjectRecord>>,
    },
    Vector3Field {
        x: ArrayRef<f32>,
        y: ArrayRef<f32>,
        z: ArrayRef<f32>,
        grid: Option<Box<ObjectRecord>>,
        normals: Option<Box<ObjectRecord>>,
    },
}

impl ShapeRecord {
    fn from_shape(shape: &Shape, mode: TransferMode) -> Self {
        match shape {
            Shape::Points { coords } => ShapeRecord::Points {
                coords: CoordsRecord::export(coords, mode),
            },
            Shape::Lines { el, cl, coords } => ShapeRecord::Lines {
                el: ArrayRef::export(el, mode),
                cl: ArrayRef::export(cl, mode),
                coords: CoordsRecord::export(coords, mode),
            },
            Shape::Triangles { cl, coords } => ShapeRecord::Triangles {
                cl: ArrayRef::export(cl, mode),
                coords: CoordsRecord::export(coords, mode),
            },
            Shape::UnstructuredGrid { el, cl, tl, coords } => ShapeRecord::UnstructuredGrid {
                el: ArrayRef::export(el, mode),
                cl: ArrayRef::export(cl, mode),
                tl: ArrayRef::export(tl, mode),
                coords: CoordsRecord::export(coords, mode),
            },
            Shape::UniformGrid { dims, min, max } => ShapeRecord::UniformGrid {
                dims: *dims,
                min: *min,
                max: *max,
            },
            Shape::ScalarField { data, grid } => ShapeRecord::ScalarField {
                data: ArrayRef::export(data, mode),
                grid: grid
                    .as_ref()
                    .map(|g| Box::new(g.to_record(mode))),
            },
            Shape::Vector3Field {
                x,
                y,
                z,
                grid,
                normals,
            } => ShapeRecord::Vector3Field {
                x: ArrayRef::export(x, mode),
                y: ArrayRef::export(y, mode),
                z: ArrayRef::export(z, mode),
                grid: grid.as_ref().map(|g| Box::new(g.to_record(mode))),
                normals: normals.as_ref().map(|n| Box::new(n.to_record(mode))),
            },
        }
    }

    fn into_shape(self, arena: &Arena) -> Result<Shape> {
        Ok(match self {
            ShapeRecord::Points { coords } => Shape::Points {
                coords: coords.import(arena)?,
            },
            ShapeRecord::Lines { el, cl, coords } => Shape::Lines {
                el: el.import(arena)?,
                cl: cl.import(arena)?,
                coords: coords.import(arena)?,
            },
            ShapeRecord::Triangles { cl, coords } => Shape::Triangles {
                cl: cl.import(arena)?,
                coords: coords.import(arena)?,
            },
            ShapeRecord::UnstructuredGrid { el, cl, tl, coords } => Shape::UnstructuredGrid {
                el: el.import(arena)?,
                cl: cl.import(arena)?,
                tl: tl.import(arena)?,
                coords: coords.import(arena)?,
            },
            ShapeRecord::UniformGrid { dims, min, max } => Shape::UniformGrid { dims, min, max },
            ShapeRecord::ScalarField { data, grid } => Shape::ScalarField {
                data: data.import(arena)?,
                grid: match grid {
                    Some(g) => Some(Box::new(Object::from_record(arena, *g)?)),
                    None => None,
                },
            },
            ShapeRecord::Vector3Field {
                x,
                y,
                z,
                grid,
                normals,
            } => Shape::Vector3Field {
                x: x.import(arena)?,
                y: y.import(arena)?,
                z: z.import(arena)?,
                grid: match grid {
                    Some(g) => Some(Box::new(Object::from_record(arena, *g)?)),
                    None => None,
                },
                normals: match normals {
                    Some(n) => Some(Box::new(Object::from_record(arena, *n)?)),
                    None => None,
                },
            },
        })
    }
}

/// Serializable transfer form of an [`Object`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub meta: Meta,
    pub attributes: AttributeMap,
    pub attachments: Vec<(String, ObjectRecord)>,
    pub shape: ShapeRecord,
}

/// Closed capability table: each interface knows which shape variants carry
/// it. Probing returns cheap handle clones, never copies of the data.
pub trait Interface: Sized {
    fn probe(obj: &Object) -> Option<Self>;
}

/// Vertex coordinates of any geometric variant.
pub struct Geometry {
    pub coords: Coords,
}

impl Geometry {
    /// Axis-aligned bounds over all vertices.
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let mut min = [f32::INFINITY; 3];
        let mut max = [f32::NEG_INFINITY; 3];
        for (axis, v) in [&self.coords.x, &self.coords.y, &self.coords.z]
            .into_iter()
            .enumerate()
        {
            for &val in v.as_slice() {
                min[axis] = min[axis].min(val);
                max[axis] = max[axis].max(val);
            }
        }
        (min, max)
    }
}

impl Interface for Geometry {
    fn probe(obj: &Object) -> Option<Self> {
        let coords = match &obj.shape {
            Shape::Points { coords } => coords,
            Shape::Lines { coords, .. } => coords,
            Shape::Triangles { coords, .. } => coords,
            Shape::UnstructuredGrid { coords, .. } => coords,
            _ => return None,
        };
        Some(Geometry {
            coords: coords.clone(),
        })
    }
}

/// Element/corner structure of grid-like variants.
pub struct GridTopology {
    pub num_elements: usize,
    pub num_corners: usize,
    pub num_vertices: usize,
}

impl Interface for GridTopology {
    fn probe(obj: &Object) -> Option<Self> {
        match &obj.shape {
            Shape::Lines { el, cl, coords } => Some(GridTopology {
                num_elements: el.len(),
                num_corners: cl.len(),
                num_vertices: coords.num_vertices(),
            }),
            Shape::Triangles { cl, coords } => Some(GridTopology {
                num_elements: cl.len() / 3,
                num_corners: cl.len(),
                num_vertices: coords.num_vertices(),
            }),
            Shape::UnstructuredGrid { el, cl, coords, .. } => Some(GridTopology {
                num_elements: el.len(),
                num_corners: cl.len(),
                num_vertices: coords.num_vertices(),
            }),
            Shape::UniformGrid { dims, .. } => {
                let vertices = dims.iter().map(|&d| d as usize).product();
                let cells = dims
                    .iter()
                    .map(|&d| (d as usize).saturating_sub(1).max(1))
                    .product();
                Some(GridTopology {
                    num_elements: cells,
                    num_corners: 0,
                    num_vertices: vertices,
                })
            }
            _ => None,
        }
    }
}

/// Values of a mapped-data variant plus the grid it maps onto.
pub struct FieldData {
    pub values: FieldValues,
    pub grid: Option<Object>,
}

pub enum FieldValues {
    Scalar(ShmVector<f32>),
    Vector3 {
        x: ShmVector<f32>,
        y: ShmVector<f32>,
        z: ShmVector<f32>,
    },
}

impl FieldValues {
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Scalar(v) => v.len(),
            FieldValues::Vector3 { x, .. } => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Interface for FieldData {
    fn probe(obj: &Object) -> Option<Self> {
        match &obj.shape {
            Shape::ScalarField { data, grid } => Some(FieldData {
                values: FieldValues::Scalar(data.clone()),
                grid: grid.as_deref().cloned(),
            }),
            Shape::Vector3Field { x, y, z, grid, .. } => Some(FieldData {
                values: FieldValues::Vector3 {
                    x: x.clone(),
                    y: y.clone(),
                    z: z.clone(),
                },
                grid: grid.as_deref().cloned(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shm::ArenaConfig;

    fn test_arena() -> Arena {
        Arena::create(ArenaConfig::private("object_test", 256 * 1024)).unwrap()
    }

    fn triangle(arena: &Arena) -> Object {
        let coords = Coords {
            x: ShmVector::from_slice(arena, &[0.0, 1.0, 0.0]).unwrap(),
            y: ShmVector::from_slice(arena, &[0.0, 0.0, 1.0]).unwrap(),
            z: ShmVector::from_slice(arena, &[0.0, 0.0, 0.0]).unwrap(),
        };
        let cl = ShmVector::from_slice(arena, &[0u64, 1, 2]).unwrap();
        Object::new(Shape::Triangles { cl, coords })
    }

    #[test]
    fn attributes_keep_order_and_overwrite() {
        let arena = test_arena();
        let mut obj = triangle(&arena);
        obj.set_attribute("species", "pressure");
        obj.set_attribute("unit", "Pa");
        obj.set_attribute("species", "temperature");

        let keys: Vec<_> = obj.attributes().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["species", "unit"]);
        assert_eq!(obj.get_attribute("species"), Some("temperature"));
    }

    #[test]
    fn interface_table_is_closed() {
        let arena = test_arena();
        let tri = triangle(&arena);
        assert!(tri.interface::<Geometry>().is_some());
        assert!(tri.interface::<GridTopology>().is_some());
        assert!(tri.interface::<FieldData>().is_none());

        let topo = tri.interface::<GridTopology>().unwrap();
        assert_eq!(topo.num_elements, 1);
        assert_eq!(topo.num_vertices, 3);

        let (min, max) = tri.interface::<Geometry>().unwrap().bounds();
        assert_eq!(min, [0.0, 0.0, 0.0]);
        assert_eq!(max, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn field_references_grid_one_way() {
        let arena = test_arena();
        let grid = triangle(&arena);
        let field = Object::new(Shape::ScalarField {
            data: ShmVector::from_slice(&arena, &[0.5, 1.5, 2.5]).unwrap(),
            grid: Some(Box::new(grid.clone())),
        });

        let fd = field.interface::<FieldData>().unwrap();
        assert_eq!(fd.values.len(), 3);
        assert_eq!(fd.grid.as_ref().unwrap().id, grid.id);
        // The grid's coordinate blocks are shared, not copied.
        if let Shape::Triangles { coords, .. } = &grid.shape {
            assert!(coords.x.refcount() >= 2);
        } else {
            panic!("expected triangles");
        }
    }

    #[test]
    fn handles_release_storage_on_drop() {
        let arena = test_arena();
        {
            let obj = triangle(&arena);
            let copy = obj.clone();
            drop(obj);
            assert!(arena.live_blocks() > 0);
            drop(copy);
        }
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn inline_record_roundtrip() {
        let arena = test_arena();
        let mut obj = triangle(&arena);
        obj.meta = Meta::new().with_timestep(2, 5).with_creator(7);
        obj.set_attribute("name", "tri");

        let bytes = obj.to_bytes().unwrap();
        let back = Object::from_bytes(&arena, &bytes).unwrap();
        assert_eq!(back.id, obj.id);
        assert_eq!(back.meta, obj.meta);
        assert_eq!(back.get_attribute("name"), Some("tri"));
        match (&back.shape, &obj.shape) {
            (Shape::Triangles { cl: a, .. }, Shape::Triangles { cl: b, .. }) => {
                assert_eq!(a.as_slice(), b.as_slice());
            }
            _ => panic!("shape changed in roundtrip"),
        }
    }

    #[test]
    fn handle_record_transfers_references() {
        let arena = test_arena();
        let obj = triangle(&arena);
        let blocks_before = arena.live_blocks();

        let record = obj.to_record(TransferMode::Handle);
        let received = Object::from_record(&arena, record).unwrap();

        // Zero-copy: no new blocks were allocated for the transfer.
        assert_eq!(arena.live_blocks(), blocks_before);
        drop(obj);
        // The receiver's references keep the storage alive.
        assert_eq!(arena.live_blocks(), blocks_before);
        drop(received);
        assert_eq!(arena.live_blocks(), 0);
    }
}
