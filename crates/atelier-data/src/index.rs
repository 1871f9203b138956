//! Dataset metadata loaded once per run.
//!
//! The index joins the JSON label tables on sample id, checks them against
//! each other, and exposes the ordered id list of one split. It is shared
//! read-only (`Arc`) between loader workers.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use atelier_core::{
    BoundingBox, DataConfig, Error, JointCoords, LandmarkPoint, Result, Sample, SampleId,
    SampleRecord,
};

/// Read a JSON table, failing with [`Error::MissingFile`] when absent
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .map_err(|e| Error::Schema(format!("{}: {e}", path.display())))
}

fn lookup<'a, T>(table: &'a HashMap<SampleId, T>, id: &str, name: &str) -> Result<&'a T> {
    table
        .get(id)
        .ok_or_else(|| Error::Schema(format!("sample {id} missing from {name} table")))
}

fn split_ids<T: Clone>(table: &HashMap<String, Vec<T>>, split: &str, path: &Path) -> Result<Vec<T>> {
    table.get(split).cloned().ok_or_else(|| {
        Error::Schema(format!("split '{split}' not found in {}", path.display()))
    })
}

/// One entry of the attribute vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeEntry {
    Name(String),
    /// Name plus attribute group (texture, fabric, shape, part, style)
    Typed(String, i64),
}

impl AttributeEntry {
    pub fn name(&self) -> &str {
        match self {
            AttributeEntry::Name(name) | AttributeEntry::Typed(name, _) => name,
        }
    }
}

/// Joined metadata of the attribute / designer datasets
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    split: String,
    ids: Vec<SampleId>,
    samples: HashMap<SampleId, Sample>,
    entries: Vec<AttributeEntry>,
}

impl DatasetIndex {
    /// Load and cross-check every table for `split`
    pub fn load(cfg: &DataConfig, split: &str) -> Result<Self> {
        let sample_path = cfg.resolve(&cfg.fn_sample);
        let split_path = cfg.resolve(&cfg.fn_split);

        let records: HashMap<SampleId, SampleRecord> = read_json(&sample_path)?;
        let labels: HashMap<SampleId, Vec<f32>> = read_json(&cfg.resolve(&cfg.fn_label))?;
        let entries: Vec<AttributeEntry> = read_json(&cfg.resolve(&cfg.fn_entry))?;
        let splits: HashMap<String, Vec<SampleId>> = read_json(&split_path)?;
        let landmarks: HashMap<SampleId, Vec<LandmarkPoint>> =
            read_json(&cfg.resolve(&cfg.fn_landmark))?;
        let seg_paths: HashMap<SampleId, PathBuf> = read_json(&cfg.resolve(&cfg.fn_seg_path))?;
        let edge_paths: HashMap<SampleId, PathBuf> = read_json(&cfg.resolve(&cfg.fn_edge_path))?;
        let categories: Option<HashMap<SampleId, u32>> = match &cfg.fn_cat {
            Some(path) => Some(read_json(&cfg.resolve(path))?),
            None => None,
        };

        if entries.len() != cfg.n_attr {
            return Err(Error::AttributeCountMismatch {
                expected: cfg.n_attr,
                actual: entries.len(),
            });
        }

        let mut ids = split_ids(&splits, split, &split_path)?;
        if let Some(max) = cfg.max_dataset_size {
            ids.truncate(max);
        }

        let mut samples = HashMap::with_capacity(ids.len());
        for id in &ids {
            let record = lookup(&records, id, "sample")?;
            let label = lookup(&labels, id, "attribute label")?;
            if label.len() != entries.len() {
                return Err(Error::AttributeCountMismatch {
                    expected: entries.len(),
                    actual: label.len(),
                });
            }
            let category = match &categories {
                Some(table) => Some(*lookup(table, id, "category")?),
                None => None,
            };
            samples.insert(
                id.clone(),
                Sample {
                    id: id.clone(),
                    img_path: cfg.resolve(&record.img_path),
                    cloth_type: record.cloth_type,
                    attr_label: label.clone(),
                    landmarks: lookup(&landmarks, id, "landmark")?.clone(),
                    seg_path: cfg.resolve(lookup(&seg_paths, id, "segmentation path")?),
                    edge_path: cfg.resolve(lookup(&edge_paths, id, "edge path")?),
                    category,
                },
            );
        }

        info!(split, samples = ids.len(), n_attr = entries.len(), "dataset index loaded");
        Ok(Self {
            split: split.to_string(),
            ids,
            samples,
            entries,
        })
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ordered ids of the split
    pub fn ids(&self) -> &[SampleId] {
        &self.ids
    }

    pub fn entries(&self) -> &[AttributeEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Result<&Sample> {
        lookup(&self.samples, id, "index")
    }

    pub fn sample_at(&self, index: usize) -> Result<&Sample> {
        let id = self.ids.get(index).ok_or_else(|| {
            Error::Schema(format!("sample index {index} out of range ({})", self.ids.len()))
        })?;
        self.get(id)
    }

    /// Fraction of positive labels per attribute over the split
    pub fn positive_rates(&self) -> Vec<f32> {
        let mut rates = vec![0.0f32; self.entries.len()];
        if self.ids.is_empty() {
            return rates;
        }
        for sample in self.samples.values() {
            for (rate, &label) in rates.iter_mut().zip(&sample.attr_label) {
                if label > 0.5 {
                    *rate += 1.0;
                }
            }
        }
        let n = self.samples.len() as f32;
        rates.iter_mut().for_each(|r| *r /= n);
        rates
    }
}

/// One side of a pose-transfer pair
#[derive(Debug, Clone, PartialEq)]
pub struct PoseRecord {
    pub id: SampleId,
    pub img_path: PathBuf,
    pub seg_path: PathBuf,
    pub joints: JointCoords,
}

/// Joined metadata of the pose-transfer datasets
#[derive(Debug, Clone)]
pub struct PoseIndex {
    pairs: Vec<(SampleId, SampleId)>,
    records: HashMap<SampleId, PoseRecord>,
}

impl PoseIndex {
    pub fn load(cfg: &DataConfig, split: &str) -> Result<Self> {
        let (pose_file, pair_file) = match (&cfg.fn_pose, &cfg.fn_pair) {
            (Some(pose), Some(pair)) => (cfg.resolve(pose), cfg.resolve(pair)),
            _ => {
                return Err(Error::Config(
                    "pose transfer requires fn_pose and fn_pair".into(),
                ))
            }
        };

        let samples: HashMap<SampleId, SampleRecord> = read_json(&cfg.resolve(&cfg.fn_sample))?;
        let joints: HashMap<SampleId, JointCoords> = read_json(&pose_file)?;
        let seg_paths: HashMap<SampleId, PathBuf> = read_json(&cfg.resolve(&cfg.fn_seg_path))?;
        let pair_table: HashMap<String, Vec<(SampleId, SampleId)>> = read_json(&pair_file)?;

        let mut pairs = split_ids(&pair_table, split, &pair_file)?;
        if let Some(max) = cfg.max_dataset_size {
            pairs.truncate(max);
        }

        let mut records = HashMap::new();
        for (id_1, id_2) in &pairs {
            for id in [id_1, id_2] {
                if records.contains_key(id) {
                    continue;
                }
                let record = PoseRecord {
                    id: id.clone(),
                    img_path: cfg.resolve(&lookup(&samples, id, "sample")?.img_path),
                    seg_path: cfg.resolve(lookup(&seg_paths, id, "segmentation path")?),
                    joints: lookup(&joints, id, "pose")?.clone(),
                };
                records.insert(id.clone(), record);
            }
        }

        info!(split, pairs = pairs.len(), images = records.len(), "pose index loaded");
        Ok(Self { pairs, records })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pair(&self, index: usize) -> Result<(&PoseRecord, &PoseRecord)> {
        let (id_1, id_2) = self.pairs.get(index).ok_or_else(|| {
            Error::Schema(format!("pair index {index} out of range ({})", self.pairs.len()))
        })?;
        Ok((
            lookup(&self.records, id_1, "pose")?,
            lookup(&self.records, id_2, "pose")?,
        ))
    }
}

/// Bounding boxes and original image paths consumed by alignment preprocessing
pub fn load_alignment_table(
    cfg: &DataConfig,
) -> Result<Vec<(SampleId, SampleRecord, PathBuf, BoundingBox)>> {
    let bbox_file = cfg
        .fn_bbox
        .as_ref()
        .ok_or_else(|| Error::Config("alignment requires fn_bbox".into()))?;
    let records: HashMap<SampleId, SampleRecord> = read_json(&cfg.resolve(&cfg.fn_sample))?;
    let boxes: HashMap<SampleId, BoundingBox> = read_json(&cfg.resolve(bbox_file))?;

    let mut ids: Vec<&SampleId> = records.keys().collect();
    ids.sort();
    ids.into_iter()
        .map(|id| {
            let record = &records[id];
            let org = record.img_path_org.as_ref().ok_or_else(|| {
                Error::Schema(format!("sample {id} has no original image path"))
            })?;
            Ok((
                id.clone(),
                record.clone(),
                cfg.resolve(org),
                *lookup(&boxes, id, "bounding box")?,
            ))
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::write_tables;
    use super::*;

    #[test]
    fn test_load_split_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_tables(dir.path(), &["s3", "s1", "s2"], 1, 4);

        let index = DatasetIndex::load(&cfg, "train").unwrap();
        assert_eq!(index.ids(), &["s3", "s1", "s2"]);
        let sample = index.get("s1").unwrap();
        assert_eq!(sample.landmarks.len(), 6);
        assert_eq!(sample.img_path, dir.path().join("img/s1.png"));
        assert_eq!(sample.category, None);

        let test = DatasetIndex::load(&cfg, "test").unwrap();
        assert_eq!(test.len(), 1);
    }

    #[test]
    fn test_max_dataset_size_and_categories() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = write_tables(dir.path(), &["a", "b", "c", "d"], 2, 4);
        cfg.max_dataset_size = Some(2);
        cfg.fn_cat = Some(PathBuf::from("Label/ca_cat_label.json"));

        let index = DatasetIndex::load(&cfg, "train").unwrap();
        assert_eq!(index.ids(), &["a", "b"]);
        assert_eq!(index.get("b").unwrap().category, Some(1));
        assert!(index.get("c").is_err());

        let rates = index.positive_rates();
        assert_eq!(rates, vec![0.5; 4]);
    }

    #[test]
    fn test_attribute_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = write_tables(dir.path(), &["a"], 1, 4);
        cfg.n_attr = 5;
        let err = DatasetIndex::load(&cfg, "train").unwrap_err();
        assert!(matches!(
            err,
            Error::AttributeCountMismatch {
                expected: 5,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_missing_table_and_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = write_tables(dir.path(), &["a"], 1, 4);
        assert!(matches!(
            DatasetIndex::load(&cfg, "val"),
            Err(Error::Schema(_))
        ));
        cfg.fn_edge_path = PathBuf::from("Label/nope.json");
        assert!(matches!(
            DatasetIndex::load(&cfg, "train"),
            Err(Error::MissingFile(_))
        ));
    }

    #[test]
    fn test_entry_formats() {
        let entries: Vec<AttributeEntry> =
            serde_json::from_str(r#"["floral", ["denim", 2]]"#).unwrap();
        assert_eq!(entries[0].name(), "floral");
        assert_eq!(entries[1], AttributeEntry::Typed("denim".into(), 2));
    }
}
