//! Ordered dataset typing
//!
//! An `OrderedRvdType` names the row struct, the full sort key K, and the
//! partition key PK (a prefix of K). Rows within a partition are
//! non-decreasing by K; a row's PK decides its partition.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strata_core::annotation::read_annotation;
use strata_core::{Annotation, EngineError, ExtOrd, Field, Kind, Region, VType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedRvdType {
    pub row_type: VType,
    pub key: Vec<String>,
    pub partition_key: Vec<String>,
}

impl OrderedRvdType {
    pub fn new(
        row_type: VType,
        key: Vec<String>,
        partition_key: Vec<String>,
    ) -> Result<OrderedRvdType, EngineError> {
        let fields = match &row_type.kind {
            Kind::Struct(fields) => fields.clone(),
            other => {
                return Err(EngineError::user(format!(
                    "row type must be a struct, got {:?}",
                    other
                )));
            }
        };
        if partition_key.len() > key.len()
            || partition_key.iter().zip(&key).any(|(pk, k)| pk != k)
        {
            return Err(EngineError::user(format!(
                "partition key {:?} is not a prefix of key {:?}",
                partition_key, key
            )));
        }
        for name in &key {
            if !fields.iter().any(|f| f.name == *name) {
                return Err(EngineError::user(format!(
                    "key field `{}` is not a row field",
                    name
                )));
            }
        }
        Ok(OrderedRvdType {
            row_type,
            key,
            partition_key,
        })
    }

    pub fn row_fields(&self) -> Vec<Field> {
        match &self.row_type.kind {
            Kind::Struct(fields) => fields.clone(),
            _ => unreachable!("validated at construction"),
        }
    }

    pub fn pk_len(&self) -> usize {
        self.partition_key.len()
    }

    pub fn key_indices(&self) -> Vec<usize> {
        let fields = self.row_fields();
        self.key
            .iter()
            .map(|name| {
                fields
                    .iter()
                    .position(|f| f.name == *name)
                    .expect("validated at construction")
            })
            .collect()
    }

    fn selected_type(&self, names: &[String]) -> VType {
        let fields = self.row_fields();
        VType::new(
            Kind::Struct(
                names
                    .iter()
                    .map(|name| {
                        fields
                            .iter()
                            .find(|f| f.name == *name)
                            .expect("validated at construction")
                            .clone()
                    })
                    .collect(),
            ),
            true,
        )
    }

    /// Struct of the full-key fields.
    pub fn k_type(&self) -> VType {
        self.selected_type(&self.key)
    }

    /// Struct of the partition-key fields.
    pub fn pk_type(&self) -> VType {
        self.selected_type(&self.partition_key)
    }

    /// Struct of the non-key fields.
    pub fn value_type(&self) -> VType {
        let fields = self.row_fields();
        VType::new(
            Kind::Struct(
                fields
                    .iter()
                    .filter(|f| !self.key.contains(&f.name))
                    .cloned()
                    .collect(),
            ),
            true,
        )
    }

    pub fn value_indices(&self) -> Vec<usize> {
        self.row_fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !self.key.contains(&f.name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Materialize a row's full key as a K-typed struct annotation.
    pub fn key_annotation(&self, region: &Region, off: usize) -> Annotation {
        let fields = self.row_fields();
        let indices = self.key_indices();
        let mut out = Vec::with_capacity(indices.len());
        for &i in &indices {
            if self.row_type.is_field_defined(region, off, i) {
                let content = self.row_type.load_field(region, off, i);
                out.push(read_annotation(&fields[i].typ, region, content));
            } else {
                out.push(Annotation::Missing);
            }
        }
        Annotation::Struct(out)
    }

    /// Materialize a row's partition key as a PK-typed struct annotation.
    pub fn pk_annotation(&self, region: &Region, off: usize) -> Annotation {
        self.key_annotation(region, off).prefix(self.pk_len())
    }

    /// Compare two packed rows by the first `n` key fields.
    pub fn compare_rows_prefix(
        &self,
        ra: &Region,
        oa: usize,
        rb: &Region,
        ob: usize,
        n: usize,
    ) -> Ordering {
        let ord = ExtOrd::missing_greatest();
        let fields = self.row_fields();
        for &i in self.key_indices().iter().take(n) {
            let da = self.row_type.is_field_defined(ra, oa, i);
            let db = self.row_type.is_field_defined(rb, ob, i);
            let step = match (da, db) {
                (false, false) => Ordering::Equal,
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                (true, true) => {
                    let ca = self.row_type.load_field(ra, oa, i);
                    let cb = self.row_type.load_field(rb, ob, i);
                    ord.compare_raw(&fields[i].typ, ra, ca, rb, cb)
                }
            };
            if step != Ordering::Equal {
                return step;
            }
        }
        Ordering::Equal
    }

    /// Full-key ordering of two packed rows.
    pub fn compare_rows_by_key(
        &self,
        ra: &Region,
        oa: usize,
        rb: &Region,
        ob: usize,
    ) -> Ordering {
        self.compare_rows_prefix(ra, oa, rb, ob, self.key.len())
    }

    /// Partition-key ordering of two packed rows.
    pub fn compare_rows_by_pk(&self, ra: &Region, oa: usize, rb: &Region, ob: usize) -> Ordering {
        self.compare_rows_prefix(ra, oa, rb, ob, self.pk_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typ() -> OrderedRvdType {
        OrderedRvdType::new(
            VType::struct_of(vec![
                ("contig", VType::str()),
                ("position", VType::int32()),
                ("payload", VType::float64()),
            ]),
            vec!["contig".to_string(), "position".to_string()],
            vec!["contig".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_pk_must_prefix_key() {
        let row = VType::struct_of(vec![("a", VType::int32()), ("b", VType::int32())]);
        assert!(
            OrderedRvdType::new(
                row.clone(),
                vec!["a".to_string()],
                vec!["b".to_string()]
            )
            .is_err()
        );
        assert!(
            OrderedRvdType::new(row, vec!["a".to_string()], vec!["a".to_string()]).is_ok()
        );
    }

    #[test]
    fn test_derived_types() {
        let t = typ();
        assert_eq!(t.pk_len(), 1);
        assert_eq!(t.key_indices(), vec![0, 1]);
        let k = t.k_type();
        match &k.kind {
            Kind::Struct(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "contig");
            }
            _ => panic!("expected struct"),
        }
        let v = t.value_type();
        match &v.kind {
            Kind::Struct(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "payload");
            }
            _ => panic!("expected struct"),
        }
    }
}
