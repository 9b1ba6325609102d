//! Shard mappers: pull-based readers over a single shard.
//!
//! A mapper is opened once, yields chunks until exhausted, and is then
//! closed. Chunks travel over the wire as JSON, so [`MapperOutput`] is the
//! unit of exchange for both local and remote mappers.

use crate::series::{Fields, Series};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use strata_common::{FieldValue, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapperError {
    #[error("error code {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("{0}")]
    Transport(String),
    #[error("invalid mapper output: {0}")]
    Decode(String),
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),
    #[error("mapper not open")]
    NotOpen,
}

impl From<serde_json::Error> for MapperError {
    fn from(e: serde_json::Error) -> Self {
        MapperError::Decode(e.to_string())
    }
}

/// One timestamped row of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperValue {
    pub time: i64,
    pub value: serde_json::Value,
}

/// A chunk of rows from a single series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperOutput {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub values: Vec<MapperValue>,
}

impl MapperOutput {
    pub fn to_json(&self) -> Result<Vec<u8>, MapperError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, MapperError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Pull-based reader over a shard.
#[async_trait]
pub trait Mapper: Send {
    async fn open(&mut self) -> Result<(), MapperError>;

    /// Next chunk, or `None` once the mapper is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<MapperOutput>, MapperError>;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// LocalMapper
// ---------------------------------------------------------------------------

/// Mapper over series selected from a local shard.
///
/// The query names a measurement; an empty query selects every measurement.
/// Each series is emitted in time order, `chunk_size` rows per chunk, where
/// zero means one chunk per series.
#[derive(Debug)]
pub struct LocalMapper {
    series: Vec<Series>,
    chunk_size: usize,
    pending: Option<VecDeque<MapperOutput>>,
}

impl LocalMapper {
    pub fn new(series: Vec<Series>, chunk_size: usize) -> Self {
        Self {
            series,
            chunk_size,
            pending: None,
        }
    }
}

#[async_trait]
impl Mapper for LocalMapper {
    async fn open(&mut self) -> Result<(), MapperError> {
        let mut chunks = VecDeque::new();
        for series in std::mem::take(&mut self.series) {
            let rows: Vec<MapperValue> = series
                .values
                .iter()
                .map(|(time, fields)| MapperValue {
                    time: *time,
                    value: fields_to_json(fields),
                })
                .collect();
            let chunk_size = if self.chunk_size == 0 {
                rows.len().max(1)
            } else {
                self.chunk_size
            };
            for chunk in rows.chunks(chunk_size) {
                chunks.push_back(MapperOutput {
                    name: series.measurement.clone(),
                    tags: series.tags.clone(),
                    values: chunk.to_vec(),
                });
            }
        }
        self.pending = Some(chunks);
        Ok(())
    }

    async fn next_chunk(&mut self) -> Result<Option<MapperOutput>, MapperError> {
        let pending = self.pending.as_mut().ok_or(MapperError::NotOpen)?;
        Ok(pending.pop_front())
    }

    async fn close(&mut self) {
        self.series.clear();
        self.pending = Some(VecDeque::new());
    }
}

fn fields_to_json(fields: &Fields) -> serde_json::Value {
    let map = fields
        .iter()
        .map(|(k, v)| {
            let value = match v {
                FieldValue::Float(f) => serde_json::Value::from(*f),
                FieldValue::Integer(i) => serde_json::Value::from(*i),
                FieldValue::String(s) => serde_json::Value::from(s.as_str()),
                FieldValue::Boolean(b) => serde_json::Value::from(*b),
            };
            (k.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::SeriesIndex;
    use strata_common::Point;

    fn index() -> SeriesIndex {
        let mut index = SeriesIndex::new();
        for t in 0..5 {
            index.insert(
                &Point::new("cpu", t)
                    .with_tag("host", "a")
                    .with_field("value", FieldValue::Integer(t)),
            );
        }
        index.insert(&Point::new("mem", 0).with_field("used", FieldValue::Boolean(true)));
        index
    }

    async fn drain(mapper: &mut LocalMapper) -> Vec<MapperOutput> {
        let mut out = Vec::new();
        while let Some(chunk) = mapper.next_chunk().await.unwrap() {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_next_chunk_before_open_fails() {
        let mut mapper = LocalMapper::new(Vec::new(), 0);
        assert_eq!(mapper.next_chunk().await.unwrap_err(), MapperError::NotOpen);
    }

    #[tokio::test]
    async fn test_chunks_respect_chunk_size() {
        let index = index();
        let mut mapper = LocalMapper::new(index.select("cpu").cloned().collect(), 2);
        mapper.open().await.unwrap();
        let chunks = drain(&mut mapper).await;

        let sizes: Vec<usize> = chunks.iter().map(|c| c.values.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(chunks.iter().all(|c| c.name == "cpu"));
        assert_eq!(chunks[0].tags["host"], "a");
        assert_eq!(chunks[0].values[0].time, 0);
        assert_eq!(chunks[0].values[0].value["value"], 0);
        assert_eq!(chunks[2].values[0].time, 4);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_emits_one_chunk_per_series() {
        let index = index();
        let mut mapper = LocalMapper::new(index.select("").cloned().collect(), 0);
        mapper.open().await.unwrap();
        let chunks = drain(&mut mapper).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].values.len(), 5);
        assert_eq!(chunks[1].name, "mem");
        assert_eq!(chunks[1].values[0].value["used"], true);
    }

    #[tokio::test]
    async fn test_close_exhausts() {
        let index = index();
        let mut mapper = LocalMapper::new(index.select("").cloned().collect(), 1);
        mapper.open().await.unwrap();
        assert!(mapper.next_chunk().await.unwrap().is_some());
        mapper.close().await;
        assert!(mapper.next_chunk().await.unwrap().is_none());
    }

    #[test]
    fn test_output_json_shape() {
        let out = MapperOutput {
            name: "cpu".into(),
            tags: BTreeMap::new(),
            values: vec![MapperValue {
                time: 7,
                value: serde_json::json!({"value": 1.5}),
            }],
        };
        let json: serde_json::Value = serde_json::from_slice(&out.to_json().unwrap()).unwrap();
        assert_eq!(json["name"], "cpu");
        assert_eq!(json["values"][0]["time"], 7);
        assert_eq!(MapperOutput::from_json(&out.to_json().unwrap()).unwrap(), out);
        assert!(MapperOutput::from_json(b"not json").is_err());
    }
}
