//! Batch-major tensor stacks.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use atelier_core::{Error, Result, SampleId};

/// A per-sample bundle of named tensors that can be stacked into a batch
pub trait Collate {
    fn sample_id(&self) -> &str;

    /// Consume the sample into `(name, tensor)` fields without the batch axis
    fn into_fields(self) -> Vec<(&'static str, Tensor)>;
}

/// Named `(B, ...)` tensors of one batch
#[derive(Debug, Clone)]
pub struct BatchTensorSet {
    ids: Vec<SampleId>,
    fields: BTreeMap<String, Tensor>,
}

impl BatchTensorSet {
    /// Stack per-sample tensors along a new leading axis.
    ///
    /// Every sample must carry the same fields with identical shapes, and
    /// all CHW maps must share one spatial size.
    pub fn collate<T: Collate>(samples: Vec<T>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::ShapeMismatch("cannot collate an empty batch".into()));
        }

        let mut ids = Vec::with_capacity(samples.len());
        let mut columns: BTreeMap<&'static str, Vec<Tensor>> = BTreeMap::new();
        let mut spatial: Option<(usize, usize)> = None;

        for (i, sample) in samples.into_iter().enumerate() {
            ids.push(sample.sample_id().to_string());
            let fields = sample.into_fields();
            if i > 0 && fields.len() != columns.len() {
                return Err(Error::ShapeMismatch(format!(
                    "sample {} has {} fields, expected {}",
                    ids[i],
                    fields.len(),
                    columns.len()
                )));
            }
            for (name, tensor) in fields {
                if let [_, h, w] = tensor.dims() {
                    match spatial {
                        None => spatial = Some((*h, *w)),
                        Some(hw) if hw != (*h, *w) => {
                            return Err(Error::ShapeMismatch(format!(
                                "{name} of sample {} is {h}x{w}, batch maps are {}x{}",
                                ids[i], hw.0, hw.1
                            )))
                        }
                        _ => {}
                    }
                }
                let column = columns.entry(name).or_default();
                if let Some(first) = column.first() {
                    if first.dims() != tensor.dims() {
                        return Err(Error::ShapeMismatch(format!(
                            "{name}: {:?} vs {:?}",
                            first.dims(),
                            tensor.dims()
                        )));
                    }
                } else if i > 0 {
                    return Err(Error::ShapeMismatch(format!(
                        "field {name} missing from earlier samples"
                    )));
                }
                column.push(tensor);
            }
        }

        let fields = columns
            .into_iter()
            .map(|(name, column)| Ok((name.to_string(), Tensor::stack(&column, 0)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self { ids, fields })
    }

    pub fn ids(&self) -> &[SampleId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::Schema(format!("batch has no field '{name}'")))
    }

    pub fn maybe(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Move every field to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.to_device(device)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            ids: self.ids.clone(),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    struct Toy {
        id: String,
        img: Tensor,
        label: Tensor,
    }

    impl Collate for Toy {
        fn sample_id(&self) -> &str {
            &self.id
        }

        fn into_fields(self) -> Vec<(&'static str, Tensor)> {
            vec![("img", self.img), ("label", self.label)]
        }
    }

    fn toy(id: &str, h: usize, w: usize) -> Toy {
        Toy {
            id: id.to_string(),
            img: Tensor::zeros((3, h, w), DType::F32, &Device::Cpu).unwrap(),
            label: Tensor::ones(5, DType::F32, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_collate_stacks_fields() -> Result<()> {
        let batch = BatchTensorSet::collate(vec![toy("a", 8, 8), toy("b", 8, 8)])?;
        assert_eq!(batch.ids(), &["a", "b"]);
        assert_eq!(batch.get("img")?.dims(), &[2, 3, 8, 8]);
        assert_eq!(batch.get("label")?.dims(), &[2, 5]);
        assert!(batch.get("seg_map").is_err());
        Ok(())
    }

    #[test]
    fn test_spatial_mismatch_is_rejected() {
        let err = BatchTensorSet::collate(vec![toy("a", 8, 8), toy("b", 8, 6)]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        assert!(BatchTensorSet::collate(Vec::<Toy>::new()).is_err());
    }
}
