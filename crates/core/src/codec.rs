//! Framed row codec for partition files and shuffle transport
//!
//! A row's serialization is its own compacted region: `encode_row` deep
//! copies the value into a fresh region (root at offset 0) and returns the
//! bytes; `decode_row` rebuilds the region. A partition is a stream of
//! length-prefixed rows, compressed as a whole with the codec named by the
//! manifest (`none`, `gzip`, or `zstd`).

use crate::builder::RegionValueBuilder;
use crate::error::EngineError;
use crate::region::Region;
use crate::types::VType;
use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};
use serde::{Deserialize, Serialize};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    None,
    Gzip,
    Zstd,
}

/// Codec id and parameters, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub id: CodecId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
}

impl CodecSpec {
    pub fn none() -> CodecSpec {
        CodecSpec {
            id: CodecId::None,
            level: None,
        }
    }

    pub fn gzip(level: Option<i32>) -> CodecSpec {
        CodecSpec {
            id: CodecId::Gzip,
            level,
        }
    }

    pub fn zstd(level: Option<i32>) -> CodecSpec {
        CodecSpec {
            id: CodecId::Zstd,
            level,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, EngineError> {
        match self.id {
            CodecId::None => Ok(data.to_vec()),
            CodecId::Gzip => {
                let level = self.level.unwrap_or(6).clamp(0, 9) as u32;
                let mut encoder = GzEncoder::new(data, Compression::new(level));
                let mut out = Vec::new();
                encoder
                    .read_to_end(&mut out)
                    .map_err(|e| EngineError::Codec(format!("gzip compress: {}", e)))?;
                Ok(out)
            }
            CodecId::Zstd => {
                let level = self.level.unwrap_or(3);
                zstd::encode_all(data, level)
                    .map_err(|e| EngineError::Codec(format!("zstd compress: {}", e)))
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, EngineError> {
        match self.id {
            CodecId::None => Ok(data.to_vec()),
            CodecId::Gzip => {
                let mut decoder = GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| EngineError::Codec(format!("gzip decompress: {}", e)))?;
                Ok(out)
            }
            CodecId::Zstd => zstd::decode_all(data)
                .map_err(|e| EngineError::Codec(format!("zstd decompress: {}", e))),
        }
    }
}

impl Default for CodecSpec {
    fn default() -> Self {
        CodecSpec::zstd(None)
    }
}

/// Serialize the value of type `typ` at content offset `off` into
/// self-contained bytes (a compacted region with the root at offset 0).
pub fn encode_row(typ: &VType, region: &Region, off: usize) -> Vec<u8> {
    let mut fresh = Region::new();
    let mut rvb = RegionValueBuilder::new(typ);
    rvb.add_region_value(&mut fresh, typ, region, off);
    debug_assert_eq!(rvb.end(), 0, "compacted row must root at offset 0");
    fresh.into_bytes()
}

/// Rebuild a row serialized by `encode_row`. The value roots at offset 0.
pub fn decode_row(bytes: Vec<u8>) -> Region {
    Region::from_bytes(bytes)
}

/// Accumulates length-prefixed rows and compresses the stream on finish.
#[derive(Debug)]
pub struct PartEncoder {
    spec: CodecSpec,
    buf: Vec<u8>,
    n_rows: usize,
}

impl PartEncoder {
    pub fn new(spec: CodecSpec) -> PartEncoder {
        PartEncoder {
            spec,
            buf: Vec::new(),
            n_rows: 0,
        }
    }

    pub fn push_row(&mut self, row: &[u8]) {
        self.buf
            .extend_from_slice(&(row.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(row);
        self.n_rows += 1;
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn finish(self) -> Result<Vec<u8>, EngineError> {
        self.spec.compress(&self.buf)
    }
}

/// Streams rows back out of a compressed partition image.
#[derive(Debug)]
pub struct PartDecoder {
    data: Vec<u8>,
    pos: usize,
}

impl PartDecoder {
    pub fn new(spec: &CodecSpec, compressed: &[u8]) -> Result<PartDecoder, EngineError> {
        Ok(PartDecoder {
            data: spec.decompress(compressed)?,
            pos: 0,
        })
    }

    pub fn next_row(&mut self) -> Result<Option<&[u8]>, EngineError> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        if self.pos + 4 > self.data.len() {
            return Err(EngineError::Codec("truncated row length".to_string()));
        }
        let len =
            u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        if self.pos + len > self.data.len() {
            return Err(EngineError::Codec("truncated row body".to_string()));
        }
        let row = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Annotation, read_annotation};

    fn sample_row(typ: &VType, a: &Annotation) -> (Region, usize) {
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(typ);
        rvb.add_annotation(&mut region, typ, a);
        let off = rvb.end();
        (region, off)
    }

    #[test]
    fn test_row_encode_decode() {
        let typ = VType::struct_of(vec![
            ("k", VType::int32()),
            ("xs", VType::array_of(VType::str())),
        ]);
        let a = Annotation::Struct(vec![
            Annotation::Int32(3),
            Annotation::Array(vec![Annotation::Str("u".into()), Annotation::Missing]),
        ]);
        let (region, off) = sample_row(&typ, &a);
        let bytes = encode_row(&typ, &region, off);
        let back = decode_row(bytes);
        assert_eq!(read_annotation(&typ, &back, 0), a);
    }

    #[test]
    fn test_part_framing_all_codecs() {
        let rows: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![], vec![9; 100]];
        for spec in [
            CodecSpec::none(),
            CodecSpec::gzip(None),
            CodecSpec::zstd(Some(5)),
        ] {
            let mut enc = PartEncoder::new(spec.clone());
            for row in &rows {
                enc.push_row(row);
            }
            assert_eq!(enc.n_rows(), 3);
            let image = enc.finish().unwrap();
            let mut dec = PartDecoder::new(&spec, &image).unwrap();
            for row in &rows {
                assert_eq!(dec.next_row().unwrap().unwrap(), &row[..]);
            }
            assert!(dec.next_row().unwrap().is_none());
        }
    }

    #[test]
    fn test_codec_spec_json_shape() {
        let spec = CodecSpec::zstd(Some(7));
        let s = serde_json::to_string(&spec).unwrap();
        assert_eq!(s, r#"{"id":"zstd","level":7}"#);
        let back: CodecSpec = serde_json::from_str(&s).unwrap();
        assert_eq!(back, spec);
    }
}
