//! Decoder for the Mapbox Vector Tile binary format.
//!
//! A tile is decoded in one pass from a complete protobuf buffer into
//! [`VectorTile`]: an ordered list of named layers, each owning a sequence
//! of features with tile-local geometry (normalized by the layer extent to
//! `[0, 1]`) and metadata resolved through the layer key/value dictionaries.
//! Decoded tiles are immutable; the decoder never mutates them afterwards.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use bytes::Buf;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::MvtError;
use crate::pb::tile::GeomType;

pub mod error;
mod pb;

const MOVE_TO: u32 = 1;
const LINE_TO: u32 = 2;
const CLOSE_PATH: u32 = 7;

/// A point in tile-local coordinates, normalized by the layer extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TilePoint {
    pub x: f32,
    pub y: f32,
}

impl TilePoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A vector tile decoded from its protobuf encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorTile {
    pub layers: Vec<TileLayer>,
}

/// A single named layer of a tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileLayer {
    pub name: String,
    pub extent: u32,
    pub features: Vec<Feature>,
}

/// One feature of a layer: geometry plus tag metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Option<u64>,
    pub metadata: HashMap<String, MetaValue>,
    pub geometry: Geometry,
}

impl Feature {
    pub fn kind(&self) -> GeometryKind {
        match self.geometry {
            Geometry::Points(_) => GeometryKind::Point,
            Geometry::Lines(_) => GeometryKind::Line,
            Geometry::Polygons(_) => GeometryKind::Polygon,
        }
    }
}

/// A scalar attached to a feature through the layer tag tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Null,
}

impl Display for MetaValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::String(v) => write!(f, "{v}"),
            MetaValue::Int(v) => write!(f, "{v}"),
            MetaValue::Double(v) => write!(f, "{v}"),
            MetaValue::Bool(v) => write!(f, "{v}"),
            MetaValue::Null => write!(f, "<null>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

impl GeometryKind {
    /// Name used by the `$type` pseudo-property of style filters.
    pub fn type_name(&self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::Line => "LineString",
            GeometryKind::Polygon => "Polygon",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Geometry {
    Points(Vec<TilePoint>),
    Lines(Vec<Vec<TilePoint>>),
    Polygons(Vec<PolygonGeometry>),
}

/// A polygon with its exterior ring first and any holes after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolygonGeometry {
    pub rings: Vec<Vec<TilePoint>>,
}

impl PolygonGeometry {
    pub fn exterior(&self) -> &[TilePoint] {
        &self.rings[0]
    }
}

impl VectorTile {
    /// Decodes a tile from a complete byte buffer.
    pub fn decode<B: Buf>(buffer: B) -> Result<VectorTile, MvtError> {
        let pb = pb::Tile::decode(buffer)?;

        let mut layers = Vec::with_capacity(pb.layers.len());
        for layer in pb.layers {
            layers.push(TileLayer::decode(layer)?);
        }

        if layers.is_empty() {
            return Err(MvtError::Malformed("tile contains no layers".into()));
        }

        Ok(VectorTile { layers })
    }

    pub fn layer(&self, name: &str) -> Option<&TileLayer> {
        self.layers.iter().find(|layer| layer.name == name)
    }
}

impl TileLayer {
    fn decode(pb_layer: pb::tile::Layer) -> Result<Self, MvtError> {
        if pb_layer.version != 2 {
            return Err(MvtError::Malformed(format!(
                "unsupported layer version {}",
                pb_layer.version
            )));
        }

        let extent = pb_layer.extent.unwrap_or(4096);
        if extent == 0 {
            return Err(MvtError::Malformed("layer has zero extent".into()));
        }

        let values = pb_layer
            .values
            .into_iter()
            .map(MetaValue::decode)
            .collect::<Result<Vec<_>, _>>()?;

        let mut features = Vec::with_capacity(pb_layer.features.len());
        for feature in pb_layer.features {
            features.push(Feature::decode(feature, extent, &pb_layer.keys, &values)?);
        }

        Ok(TileLayer {
            name: pb_layer.name,
            extent,
            features,
        })
    }
}

impl MetaValue {
    fn decode(pb_value: pb::tile::Value) -> Result<MetaValue, MvtError> {
        let pb::tile::Value {
            string_value,
            float_value,
            double_value,
            int_value,
            uint_value,
            sint_value,
            bool_value,
        } = pb_value;

        let mut present = Vec::with_capacity(1);
        if let Some(v) = string_value {
            present.push(MetaValue::String(v));
        }
        if let Some(v) = float_value {
            present.push(MetaValue::Double(v.into()));
        }
        if let Some(v) = double_value {
            present.push(MetaValue::Double(v));
        }
        if let Some(v) = int_value {
            present.push(MetaValue::Int(v));
        }
        if let Some(v) = uint_value {
            // i64 covers every observed tag value; anything larger keeps
            // its magnitude as a double.
            present.push(match i64::try_from(v) {
                Ok(v) => MetaValue::Int(v),
                Err(_) => MetaValue::Double(v as f64),
            });
        }
        if let Some(v) = sint_value {
            present.push(MetaValue::Int(v));
        }
        if let Some(v) = bool_value {
            present.push(MetaValue::Bool(v));
        }

        match present.len() {
            0 => Err(MvtError::Malformed("tag value with no field set".into())),
            1 => Ok(present.remove(0)),
            _ => Err(MvtError::Malformed(
                "tag value with more than one field set".into(),
            )),
        }
    }
}

impl Feature {
    fn decode(
        pb_feature: pb::tile::Feature,
        extent: u32,
        keys: &[String],
        values: &[MetaValue],
    ) -> Result<Feature, MvtError> {
        let metadata = decode_tags(&pb_feature.tags, keys, values)?;
        let geom_type = GeomType::try_from(pb_feature.r#type.unwrap_or_default())
            .unwrap_or(GeomType::Unknown);
        let geometry = decode_geometry(geom_type, &pb_feature.geometry, extent)?;

        Ok(Feature {
            id: pb_feature.id,
            metadata,
            geometry,
        })
    }
}

fn decode_tags(
    tags: &[u32],
    keys: &[String],
    values: &[MetaValue],
) -> Result<HashMap<String, MetaValue>, MvtError> {
    if tags.len() % 2 != 0 {
        return Err(MvtError::Malformed(
            "feature has an odd number of tag indices".into(),
        ));
    }

    let mut metadata = HashMap::with_capacity(tags.len() / 2);
    for pair in tags.chunks_exact(2) {
        let key = keys
            .get(pair[0] as usize)
            .ok_or_else(|| MvtError::Malformed(format!("tag key index {} out of range", pair[0])))?;
        let value = values.get(pair[1] as usize).ok_or_else(|| {
            MvtError::Malformed(format!("tag value index {} out of range", pair[1]))
        })?;
        metadata.insert(key.clone(), value.clone());
    }

    Ok(metadata)
}

fn decode_geometry(
    geom_type: GeomType,
    commands: &[u32],
    extent: u32,
) -> Result<Geometry, MvtError> {
    let mut reader = CommandReader::new(commands, extent);
    match geom_type {
        GeomType::Point => Ok(Geometry::Points(decode_points(&mut reader)?)),
        GeomType::Linestring => Ok(Geometry::Lines(decode_lines(&mut reader)?)),
        GeomType::Polygon => Ok(Geometry::Polygons(decode_polygons(&mut reader)?)),
        GeomType::Unknown => Err(MvtError::Malformed("unknown geometry type".into())),
    }
}

fn decode_points(reader: &mut CommandReader) -> Result<Vec<TilePoint>, MvtError> {
    let mut points = Vec::new();
    while let Some((id, count)) = reader.next_command()? {
        if id != MOVE_TO {
            return Err(MvtError::Malformed(format!(
                "point geometry cannot contain command {id}"
            )));
        }
        for _ in 0..count {
            points.push(reader.read_point()?);
        }
    }
    Ok(points)
}

fn decode_lines(reader: &mut CommandReader) -> Result<Vec<Vec<TilePoint>>, MvtError> {
    let mut lines = Vec::new();
    let mut current: Option<Vec<TilePoint>> = None;

    while let Some((id, count)) = reader.next_command()? {
        match id {
            MOVE_TO => {
                if count != 1 {
                    return Err(MvtError::Malformed(
                        "MoveTo in a linestring must have count 1".into(),
                    ));
                }
                if let Some(line) = current.take() {
                    lines.push(finish_line(line)?);
                }
                current = Some(vec![reader.read_point()?]);
            }
            LINE_TO => {
                let line = current
                    .as_mut()
                    .ok_or_else(|| MvtError::Malformed("line must start with MoveTo".into()))?;
                line.reserve(count as usize);
                for _ in 0..count {
                    line.push(reader.read_point()?);
                }
            }
            _ => {
                return Err(MvtError::Malformed(format!(
                    "linestring geometry cannot contain command {id}"
                )))
            }
        }
    }

    if let Some(line) = current {
        lines.push(finish_line(line)?);
    }

    Ok(lines)
}

fn finish_line(line: Vec<TilePoint>) -> Result<Vec<TilePoint>, MvtError> {
    if line.len() < 2 {
        return Err(MvtError::Malformed(
            "line must contain at least two points".into(),
        ));
    }
    Ok(line)
}

fn decode_polygons(reader: &mut CommandReader) -> Result<Vec<PolygonGeometry>, MvtError> {
    let mut polygons: Vec<PolygonGeometry> = Vec::new();
    let mut current: Option<Vec<TilePoint>> = None;
    // Winding sign of exterior rings; calibrated from the first ring so
    // the split does not depend on the y-axis convention of the encoder.
    let mut exterior_sign: Option<bool> = None;

    while let Some((id, count)) = reader.next_command()? {
        match id {
            MOVE_TO => {
                if count != 1 {
                    return Err(MvtError::Malformed(
                        "MoveTo in a polygon must have count 1".into(),
                    ));
                }
                if current.is_some() {
                    return Err(MvtError::Malformed(
                        "polygon ring left unclosed before MoveTo".into(),
                    ));
                }
                current = Some(vec![reader.read_point()?]);
            }
            LINE_TO => {
                let ring = current
                    .as_mut()
                    .ok_or_else(|| MvtError::Malformed("ring must start with MoveTo".into()))?;
                ring.reserve(count as usize);
                for _ in 0..count {
                    ring.push(reader.read_point()?);
                }
            }
            CLOSE_PATH => {
                if count != 1 {
                    return Err(MvtError::Malformed(format!(
                        "ClosePath must have count 1, found {count}"
                    )));
                }
                let ring = current
                    .take()
                    .ok_or_else(|| MvtError::Malformed("ClosePath without an open ring".into()))?;
                if ring.len() < 3 {
                    return Err(MvtError::Malformed(
                        "polygon ring must contain at least three points".into(),
                    ));
                }

                let positive = signed_area(&ring) >= 0.0;
                match exterior_sign {
                    Some(sign) if sign != positive => match polygons.last_mut() {
                        Some(polygon) => polygon.rings.push(ring),
                        None => {
                            return Err(MvtError::Malformed(
                                "interior ring before any exterior ring".into(),
                            ))
                        }
                    },
                    _ => {
                        exterior_sign.get_or_insert(positive);
                        polygons.push(PolygonGeometry { rings: vec![ring] });
                    }
                }
            }
            _ => {
                return Err(MvtError::Malformed(format!(
                    "polygon geometry cannot contain command {id}"
                )))
            }
        }
    }

    if current.is_some() {
        return Err(MvtError::Malformed("polygon ring left unclosed".into()));
    }

    Ok(polygons)
}

fn signed_area(ring: &[TilePoint]) -> f32 {
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// Cursor over a feature's geometry command stream.
struct CommandReader<'a> {
    commands: &'a [u32],
    pos: usize,
    cursor_x: i32,
    cursor_y: i32,
    inv_extent: f32,
}

impl<'a> CommandReader<'a> {
    fn new(commands: &'a [u32], extent: u32) -> Self {
        Self {
            commands,
            pos: 0,
            cursor_x: 0,
            cursor_y: 0,
            inv_extent: 1.0 / extent as f32,
        }
    }

    /// Next `(command id, repeat count)` pair, or `None` at end of stream.
    fn next_command(&mut self) -> Result<Option<(u32, u32)>, MvtError> {
        let Some(&raw) = self.commands.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;

        let id = raw & 0x7;
        let count = raw >> 3;
        if count == 0 {
            return Err(MvtError::Malformed("command repeat count is zero".into()));
        }
        Ok(Some((id, count)))
    }

    fn read_point(&mut self) -> Result<TilePoint, MvtError> {
        let dx = self.read_param()?;
        let dy = self.read_param()?;
        self.cursor_x = self.cursor_x.wrapping_add(zigzag_decode(dx));
        self.cursor_y = self.cursor_y.wrapping_add(zigzag_decode(dy));
        Ok(TilePoint::new(
            self.cursor_x as f32 * self.inv_extent,
            self.cursor_y as f32 * self.inv_extent,
        ))
    }

    fn read_param(&mut self) -> Result<u32, MvtError> {
        let Some(&value) = self.commands.get(self.pos) else {
            return Err(MvtError::Malformed(
                "geometry ends in the middle of a command".into(),
            ));
        };
        self.pos += 1;
        Ok(value)
    }
}

fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_value(text: &str) -> pb::tile::Value {
        pb::tile::Value {
            string_value: Some(text.into()),
            ..Default::default()
        }
    }

    fn layer_with(features: Vec<pb::tile::Feature>) -> pb::tile::Layer {
        pb::tile::Layer {
            version: 2,
            name: "water".into(),
            features,
            keys: vec!["class".into()],
            values: vec![string_value("lake")],
            extent: Some(4096),
        }
    }

    fn encode(layers: Vec<pb::tile::Layer>) -> Vec<u8> {
        pb::Tile { layers }.encode_to_vec()
    }

    #[test]
    fn zigzag_decode_matches_reference_values() {
        assert_eq!(zigzag_decode(0), 0);
        assert_eq!(zigzag_decode(1), -1);
        assert_eq!(zigzag_decode(2), 1);
        assert_eq!(zigzag_decode(3), -2);
        assert_eq!(zigzag_decode(0xfffffffe), 0x7fffffff);
        assert_eq!(zigzag_decode(0xffffffff), i32::MIN);
    }

    #[test]
    fn decodes_point_feature_with_metadata() {
        let feature = pb::tile::Feature {
            id: Some(7),
            tags: vec![0, 0],
            r#type: Some(GeomType::Point as i32),
            // MoveTo(+2048, +2048)
            geometry: vec![9, 4096, 4096],
        };
        let tile = VectorTile::decode(&encode(vec![layer_with(vec![feature])])[..]).unwrap();

        assert_eq!(tile.layers.len(), 1);
        let layer = tile.layer("water").unwrap();
        assert_eq!(layer.extent, 4096);
        let feature = &layer.features[0];
        assert_eq!(feature.id, Some(7));
        assert_eq!(feature.kind(), GeometryKind::Point);
        assert_eq!(
            feature.metadata.get("class"),
            Some(&MetaValue::String("lake".into()))
        );

        let Geometry::Points(points) = &feature.geometry else {
            panic!("expected point geometry");
        };
        assert_eq!(points.len(), 1);
        assert!((points[0].x - 0.5).abs() < 1e-6);
        assert!((points[0].y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn decodes_multi_segment_line() {
        let feature = pb::tile::Feature {
            id: None,
            tags: vec![],
            r#type: Some(GeomType::Linestring as i32),
            // MoveTo(0, 0), LineTo x2, MoveTo, LineTo
            geometry: vec![9, 0, 0, 18, 8, 0, 0, 8, 9, 2, 1, 10, 8, 8],
        };
        let tile = VectorTile::decode(&encode(vec![layer_with(vec![feature])])[..]).unwrap();

        let Geometry::Lines(lines) = &tile.layers[0].features[0].geometry else {
            panic!("expected line geometry");
        };
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 3);
        assert_eq!(lines[1].len(), 2);
    }

    #[test]
    fn decodes_polygon_with_hole() {
        let feature = pb::tile::Feature {
            id: None,
            tags: vec![],
            r#type: Some(GeomType::Polygon as i32),
            geometry: vec![
                // Exterior: (0,0) -> (100,0) -> (100,100) -> (0,100), closed.
                9, 0, 0, 26, 200, 0, 0, 200, 199, 0, 15,
                // Hole with opposite winding: (25,25) -> (25,75) -> (75,75) -> (75,25).
                9, 50, 149, 26, 0, 100, 100, 0, 0, 99, 15,
            ],
        };
        let tile = VectorTile::decode(&encode(vec![layer_with(vec![feature])])[..]).unwrap();

        let Geometry::Polygons(polygons) = &tile.layers[0].features[0].geometry else {
            panic!("expected polygon geometry");
        };
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].rings.len(), 2);
        assert_eq!(polygons[0].exterior().len(), 4);
    }

    #[test]
    fn rejects_unsupported_layer_version() {
        let mut layer = layer_with(vec![]);
        layer.version = 1;
        assert!(VectorTile::decode(&encode(vec![layer])[..]).is_err());
    }

    #[test]
    fn rejects_tile_without_layers() {
        assert!(VectorTile::decode(&encode(vec![])[..]).is_err());
    }

    #[test]
    fn rejects_truncated_geometry() {
        let feature = pb::tile::Feature {
            id: None,
            tags: vec![],
            r#type: Some(GeomType::Point as i32),
            geometry: vec![9, 4096],
        };
        assert!(VectorTile::decode(&encode(vec![layer_with(vec![feature])])[..]).is_err());
    }

    #[test]
    fn rejects_tag_value_with_no_field() {
        let mut layer = layer_with(vec![pb::tile::Feature {
            id: None,
            tags: vec![0, 0],
            r#type: Some(GeomType::Point as i32),
            geometry: vec![9, 0, 0],
        }]);
        layer.values = vec![pb::tile::Value::default()];
        assert!(VectorTile::decode(&encode(vec![layer])[..]).is_err());
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(VectorTile::decode(&[0xff_u8, 0xff, 0xff][..]).is_err());
    }
}
