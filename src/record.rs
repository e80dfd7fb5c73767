//! Saving and loading named tensors.

use std::fs;
use std::path::Path;
use std::collections::BTreeMap;

use serde::{ Serialize, Deserialize };

use crate::{
  tensor::Tensor,
  error::{ Error, Result },
};


/// Plain dimensions and row-major values of a tensor.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
  pub shape: Vec<usize>,
  pub data: Vec<f64>,
}

impl From<&Tensor> for TensorRecord {
  fn from(tensor: &Tensor) -> Self {
    Self { shape: tensor.shape().to_vec(), data: tensor.data() }
  }
}

impl TryFrom<TensorRecord> for Tensor {
  type Error = Error;

  fn try_from(record: TensorRecord) -> Result<Self> {
    Tensor::new(&record.shape, record.data)
  }
}


/// Write `tensors` to `path`, replacing any existing file.

pub fn save_tensors(path: impl AsRef<Path>, tensors: &BTreeMap<String, Tensor>) -> Result<()> {
  if tensors.is_empty() {
    return Err(Error::invalid_shape("save_tensors", "no tensors to save"))
  }
  let records: BTreeMap<&str, TensorRecord> = tensors.iter()
    .map(|(name, tensor)| (name.as_str(), TensorRecord::from(tensor)) )
    .collect();
  let bytes = postcard::to_allocvec(&records).map_err(|err| Error::Serialization(err.to_string()) )?;
  fs::write(path, bytes)?;
  Ok(())
}

/// Read tensors written by [save_tensors]. Loaded tensors do not require gradients.

pub fn load_tensors(path: impl AsRef<Path>) -> Result<BTreeMap<String, Tensor>> {
  let bytes = fs::read(path)?;
  let records: BTreeMap<String, TensorRecord> = postcard::from_bytes(&bytes)
    .map_err(|err| Error::Serialization(err.to_string()) )?;
  records.into_iter()
    .map(|(name, record)| Ok((name, Tensor::try_from(record)?)) )
    .collect()
}
