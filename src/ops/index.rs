use num_traits::ToPrimitive;

use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
};


/// Read every value of `index` as a position below `bound`.

fn positions(op: &'static str, index: &Tensor, bound: usize) -> Result<Vec<usize>> {
  index.read(|values| values.iter().map(|&v| {
    v.to_usize()
      .filter(|&i| v.fract() == 0.0 && i < bound )
      .ok_or_else(|| Error::out_of_range(op, format!("index {v} outside 0..{bound}")) )
  }).collect())
}

// Scatter-add gradient values onto the input positions they were read from
fn scatter(dims: &[usize], grad: &Tensor, targets: impl Fn(usize) -> usize) -> Tensor {
  let mut out = vec![0.0; dims.iter().product()];
  grad.read(|g| {
    for (j, &v) in g.iter().enumerate() {
      out[targets(j)] += v;
    }
  });
  Tensor::build(dims, out)
}


impl Tensor {
  /// Pick values along `axis` at the positions held by `index`.
  ///
  /// `index` has the rank of this tensor and matches it on every other axis.
  /// The output takes the shape of `index`.

  pub fn gather(&self, axis: isize, index: &Tensor) -> Result<Tensor> {
    let rank = self.rank();
    let axis = axis_index("gather", axis, rank)?;
    let compatible = index.rank() == rank
      && (0..rank).all(|d| d == axis || index.shape()[d] == self.shape()[d] );
    if !compatible {
      return Err(Error::shape_mismatch("gather",
        format!("index {} does not match input {} outside axis {axis}", fmt_dims(index.shape()), fmt_dims(self.shape()))))
    }
    let (_, len, inner) = split_at_axis(self.shape(), axis);
    let picks = index.shape()[axis];
    let picked = positions("gather", index, len)?;
    // Flat input offset of every output element
    let sources: Vec<usize> = picked.iter().enumerate().map(|(j, &k)| {
      let (o, i) = (j / (picks * inner), j % inner);
      (o * len + k) * inner + i
    }).collect();
    let data = self.read(|src| {
      let mut out = vec![0.0; sources.len()];
      parallel::split(&mut out, 1, |first, chunk| {
        for (k, o) in chunk.iter_mut().enumerate() {
          *o = src[sources[first + k]];
        }
      });
      out
    });
    Ok(Tensor::computed(index.shape(), data, &[self], || Op::Gather { sources }))
  }

  /// Look up rows of this `[rows, ...]` table. The output has the shape
  /// of `index` followed by the shape of one row.

  pub fn embedding(&self, index: &Tensor) -> Result<Tensor> {
    if self.rank() < 2 {
      return Err(Error::shape_mismatch("embedding",
        format!("table needs rank 2 or more, got {}", fmt_dims(self.shape()))))
    }
    let rows = positions("embedding", index, self.shape()[0])?;
    let width = self.numel() / self.shape()[0];
    let data = self.read(|table| {
      let mut out = vec![0.0; rows.len() * width];
      parallel::split(&mut out, width, |first, chunk| {
        for (k, row) in chunk.chunks_mut(width).enumerate() {
          row.copy_from_slice(&table[rows[first + k] * width..][..width]);
        }
      });
      out
    });
    let dims: Vec<usize> = index.shape().iter().chain(&self.shape()[1..]).copied().collect();
    Ok(Tensor::computed(&dims, data, &[self], || Op::Embedding { rows, width }))
  }
}


pub(crate) fn gather_backward(inputs: &[Tensor], grad: &Tensor, sources: &[usize]) -> Vec<Option<Tensor>> {
  vec![Some(scatter(inputs[0].shape(), grad, |j| sources[j] ))]
}

pub(crate) fn embedding_backward(inputs: &[Tensor], grad: &Tensor, rows: &[usize], width: usize) -> Vec<Option<Tensor>> {
  vec![Some(scatter(inputs[0].shape(), grad, |j| rows[j / width] * width + j % width ))]
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn gather_along_columns() {
    let x = Tensor::new(&[2,3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap().trained();
    let index = Tensor::new(&[2,2], vec![2.0, 0.0, 1.0, 1.0]).unwrap();
    let y = x.gather(1, &index).unwrap();
    assert_eq!(y.shape(), &[2,2]);
    assert_eq!(y.data(), vec![3.0, 1.0, 5.0, 5.0]);
    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![1.0, 0.0, 1.0, 0.0, 2.0, 0.0]);
  }

  #[test]
  fn gather_along_rows() {
    let x = Tensor::new(&[2,2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let index = Tensor::new(&[1,2], vec![1.0, 0.0]).unwrap();
    assert_eq!(x.gather(0, &index).unwrap().data(), vec![3.0, 2.0]);
  }

  #[test]
  fn gather_errors() {
    let x = Tensor::zeros(&[2,3]);
    let bad = Tensor::new(&[2,1], vec![0.0, 3.0]).unwrap();
    assert!(matches!(x.gather(1, &bad), Err(Error::IndexOutOfRange { .. })));
    let negative = Tensor::new(&[2,1], vec![0.0, -1.0]).unwrap();
    assert!(matches!(x.gather(1, &negative), Err(Error::IndexOutOfRange { .. })));
    let fractional = Tensor::new(&[2,1], vec![0.5, 1.0]).unwrap();
    assert!(matches!(x.gather(1, &fractional), Err(Error::IndexOutOfRange { .. })));
    assert!(matches!(x.gather(1, &Tensor::zeros(&[3,1])), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.gather(1, &Tensor::zeros(&[2])), Err(Error::ShapeMismatch { .. })));
  }

  #[test]
  fn embedding_rows_accumulate() {
    let table = Tensor::arange(&[3,2], 0.0, 1.0).trained();
    let index = Tensor::new(&[2,2], vec![2.0, 0.0, 2.0, 1.0]).unwrap();
    let y = table.embedding(&index).unwrap();
    assert_eq!(y.shape(), &[2,2,2]);
    assert_eq!(y.data(), vec![4.0, 5.0, 0.0, 1.0, 4.0, 5.0, 2.0, 3.0]);
    y.sum().backward().unwrap();
    assert_eq!(table.grad().unwrap().data(), vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0]);
  }

  #[test]
  fn embedding_errors() {
    let table = Tensor::zeros(&[3,2]);
    assert!(matches!(table.embedding(&Tensor::vec(&[3.0])), Err(Error::IndexOutOfRange { .. })));
    assert!(matches!(Tensor::zeros(&[3]).embedding(&Tensor::vec(&[0.0])), Err(Error::ShapeMismatch { .. })));
  }
}
