//! Persisted partition sets
//!
//! A written dataset is a directory of partition files (`part-00000`, ...)
//! plus `metadata.json` recording the dataset type, the codec, the file
//! list (partition index = list position), and the range bounds as JSON
//! intervals with endpoints serialized per the PK point type.

use crate::partitioner::OrderedPartitioner;
use crate::pool::ComputePool;
use crate::rvd::OrderedRvd;
use crate::rvd_type::OrderedRvdType;
use crate::stream::{MemStream, PartSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use strata_core::codec::{CodecSpec, PartDecoder, PartEncoder};
use strata_core::json::{WarnCounter, export_annotation, import_annotation};
use strata_core::{EngineError, Interval};
use tracing::info;

pub const MANIFEST_FILE: &str = "metadata.json";

#[derive(Debug, Serialize, Deserialize)]
struct DatasetManifest {
    #[serde(rename = "type")]
    typ: OrderedRvdType,
    codec: CodecSpec,
    #[serde(rename = "partFiles")]
    part_files: Vec<String>,
    #[serde(rename = "rangeBounds")]
    range_bounds: serde_json::Value,
}

fn export_bounds(partitioner: &OrderedPartitioner) -> serde_json::Value {
    let pk_type = partitioner.pk_type();
    serde_json::Value::Array(
        partitioner
            .range_bounds()
            .iter()
            .map(|bound| {
                json!({
                    "start": export_annotation(pk_type, &bound.start),
                    "end": export_annotation(pk_type, &bound.end),
                    "includeStart": bound.includes_start,
                    "includeEnd": bound.includes_end,
                })
            })
            .collect(),
    )
}

fn import_bounds(
    typ: &OrderedRvdType,
    value: &serde_json::Value,
) -> Result<OrderedPartitioner, EngineError> {
    let pk_type = typ.pk_type();
    let cap = crate::config::EngineConfig::default().warn_cap_per_partition;
    let mut warns = WarnCounter::new("range bounds", cap);
    let entries = value
        .as_array()
        .ok_or_else(|| EngineError::Json("rangeBounds must be an array".to_string()))?;
    let mut bounds = Vec::with_capacity(entries.len());
    for entry in entries {
        let obj = entry
            .as_object()
            .ok_or_else(|| EngineError::Json("range bound must be an object".to_string()))?;
        let get_bool = |name: &str| -> Result<bool, EngineError> {
            obj.get(name).and_then(serde_json::Value::as_bool).ok_or_else(|| {
                EngineError::Json(format!("range bound missing boolean `{}`", name))
            })
        };
        let start = obj
            .get("start")
            .ok_or_else(|| EngineError::Json("range bound missing `start`".to_string()))?;
        let end = obj
            .get("end")
            .ok_or_else(|| EngineError::Json("range bound missing `end`".to_string()))?;
        bounds.push(Interval::new(
            import_annotation(&pk_type, start, &mut warns)?,
            import_annotation(&pk_type, end, &mut warns)?,
            get_bool("includeStart")?,
            get_bool("includeEnd")?,
        ));
    }
    OrderedPartitioner::new(pk_type, bounds)
}

impl OrderedRvd {
    /// Serialize every partition under `path` and record the manifest.
    pub fn write(&self, path: &Path, codec: CodecSpec) -> Result<(), EngineError> {
        std::fs::create_dir_all(path)?;
        let encoded = self.encode_partitions()?;
        let mut part_files = Vec::with_capacity(encoded.len());
        for (idx, rows) in encoded.iter().enumerate() {
            let name = format!("part-{:05}", idx);
            let mut encoder = PartEncoder::new(codec.clone());
            for row in rows {
                encoder.push_row(row);
            }
            std::fs::write(path.join(&name), encoder.finish()?)?;
            part_files.push(name);
        }
        let manifest = DatasetManifest {
            typ: self.typ().clone(),
            codec,
            part_files,
            range_bounds: export_bounds(self.partitioner()),
        };
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| EngineError::Json(e.to_string()))?;
        std::fs::write(path.join(MANIFEST_FILE), text)?;
        info!(
            path = %path.display(),
            partitions = self.num_partitions(),
            "wrote ordered dataset"
        );
        Ok(())
    }

    /// Restore a dataset written by `write`.
    pub fn read(path: &Path, pool: Arc<dyn ComputePool>) -> Result<OrderedRvd, EngineError> {
        let text = std::fs::read_to_string(path.join(MANIFEST_FILE))?;
        let manifest: DatasetManifest =
            serde_json::from_str(&text).map_err(|e| EngineError::Json(e.to_string()))?;
        let partitioner = import_bounds(&manifest.typ, &manifest.range_bounds)?;
        let sources: Vec<PartSource> = manifest
            .part_files
            .iter()
            .map(|name| {
                let file = path.join(name);
                let codec = manifest.codec.clone();
                let source: PartSource = Arc::new(move || {
                    let compressed = std::fs::read(&file)?;
                    let mut decoder = PartDecoder::new(&codec, &compressed)?;
                    let mut rows = Vec::new();
                    while let Some(row) = decoder.next_row()? {
                        rows.push(row.to_vec());
                    }
                    Ok(Box::new(MemStream::new(Arc::new(rows)))
                        as Box<dyn crate::stream::RowStream>)
                });
                Ok(source)
            })
            .collect::<Result<_, EngineError>>()?;
        OrderedRvd::new(manifest.typ, partitioner, sources, pool)
    }
}
