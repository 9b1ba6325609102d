//! Protobuf messages exchanged between data nodes.
//!
//! Declared with `prost` derives; there is no `.proto` build step.

use crate::TransportError;
use std::collections::BTreeMap;
use strata_common::{FieldValue, Point};

/// Response code for success. Any other code is an error.
pub const CODE_OK: i32 = 0;
pub const CODE_ERROR: i32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteShardRequest {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, repeated, tag = "2")]
    pub points: Vec<WirePoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteShardResponse {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MapShardRequest {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(string, tag = "2")]
    pub query: String,
    #[prost(int32, tag = "3")]
    pub chunk_size: i32,
}

/// One chunk of a mapper stream. A response without `data` ends the stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MapShardResponse {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WirePoint {
    #[prost(string, tag = "1")]
    pub measurement: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub tags: BTreeMap<String, String>,
    #[prost(message, repeated, tag = "3")]
    pub fields: Vec<WireField>,
    #[prost(int64, tag = "4")]
    pub time: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireField {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(oneof = "wire_field::Value", tags = "2, 3, 4, 5")]
    pub value: Option<wire_field::Value>,
}

pub mod wire_field {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(double, tag = "2")]
        Float(f64),
        #[prost(int64, tag = "3")]
        Integer(i64),
        #[prost(string, tag = "4")]
        String(String),
        #[prost(bool, tag = "5")]
        Boolean(bool),
    }
}

// ---------------------------------------------------------------------------
// Point conversion
// ---------------------------------------------------------------------------

impl From<&Point> for WirePoint {
    fn from(point: &Point) -> Self {
        let fields = point
            .fields
            .iter()
            .map(|(name, value)| WireField {
                name: name.clone(),
                value: Some(match value {
                    FieldValue::Float(f) => wire_field::Value::Float(*f),
                    FieldValue::Integer(i) => wire_field::Value::Integer(*i),
                    FieldValue::String(s) => wire_field::Value::String(s.clone()),
                    FieldValue::Boolean(b) => wire_field::Value::Boolean(*b),
                }),
            })
            .collect();
        Self {
            measurement: point.measurement.clone(),
            tags: point.tags.clone(),
            fields,
            time: point.time,
        }
    }
}

impl TryFrom<WirePoint> for Point {
    type Error = TransportError;

    fn try_from(wire: WirePoint) -> Result<Self, TransportError> {
        let mut fields = BTreeMap::new();
        for field in wire.fields {
            let value = match field.value {
                Some(wire_field::Value::Float(f)) => FieldValue::Float(f),
                Some(wire_field::Value::Integer(i)) => FieldValue::Integer(i),
                Some(wire_field::Value::String(s)) => FieldValue::String(s),
                Some(wire_field::Value::Boolean(b)) => FieldValue::Boolean(b),
                None => {
                    return Err(TransportError::InvalidMessage(format!(
                        "field '{}' has no value",
                        field.name
                    )))
                }
            };
            fields.insert(field.name, value);
        }
        Ok(Point {
            measurement: wire.measurement,
            tags: wire.tags,
            fields,
            time: wire.time,
        })
    }
}

impl WriteShardRequest {
    pub fn new(shard_id: u64, points: &[Point]) -> Self {
        Self {
            shard_id,
            points: points.iter().map(WirePoint::from).collect(),
        }
    }

    /// Decode the carried points.
    pub fn to_points(&self) -> Result<Vec<Point>, TransportError> {
        self.points.iter().cloned().map(Point::try_from).collect()
    }
}
