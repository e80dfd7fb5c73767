use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
  ops::wants,
};


impl Tensor {
  /// Join tensors along an existing `axis`. All other dimensions must agree.

  pub fn concat(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
    let first = tensors.first()
      .ok_or_else(|| Error::invalid_shape("concat", "nothing to concatenate") )?;
    let rank = first.rank();
    let axis = axis_index("concat", axis, rank)?;
    for t in &tensors[1..] {
      let compatible = t.rank() == rank && (0..rank).all(|d| d == axis || t.shape()[d] == first.shape()[d] );
      if !compatible {
        return Err(Error::shape_mismatch("concat",
          format!("{} does not fit {} along axis {axis}", fmt_dims(t.shape()), fmt_dims(first.shape()))))
      }
    }

    let (outer, _, inner) = split_at_axis(first.shape(), axis);
    let lengths: Vec<usize> = tensors.iter().map(|t| t.shape()[axis] ).collect();
    let total: usize = lengths.iter().sum();
    let parts: Vec<Vec<f64>> = tensors.iter().map(|t| t.data() ).collect();
    let mut data = vec![0.0; outer * total * inner];
    parallel::split(&mut data, total * inner, |first, blocks| {
      for (b, block) in blocks.chunks_mut(total * inner).enumerate() {
        let o = first + b;
        let mut at = 0;
        for (part, &len) in parts.iter().zip(&lengths) {
          let run = len * inner;
          block[at..at + run].copy_from_slice(&part[o * run..][..run]);
          at += run;
        }
      }
    });

    let mut dims = first.shape().to_vec();
    dims[axis] = total;
    Ok(Tensor::computed(&dims, data, tensors, || Op::Concat { axis }))
  }

  /// Join equally shaped tensors along a new `axis`.

  pub fn stack(tensors: &[&Tensor], axis: isize) -> Result<Tensor> {
    let first = tensors.first()
      .ok_or_else(|| Error::invalid_shape("stack", "nothing to stack") )?;
    for t in &tensors[1..] {
      ensure_same_shape("stack", first.shape(), t.shape())?;
    }
    let axis = insert_index("stack", axis, first.rank())? as isize;
    let expanded = tensors.iter()
      .map(|t| t.unsqueeze(axis) )
      .collect::<Result<Vec<_>>>()?;
    let expanded: Vec<&Tensor> = expanded.iter().collect();
    Tensor::concat(&expanded, axis)
  }

  /// Cut into consecutive pieces of the given `sizes` along `axis`.
  /// The sizes must add up to the length of the axis.

  pub fn split(&self, axis: isize, sizes: &[usize]) -> Result<Vec<Tensor>> {
    let axis = axis_index("split", axis, self.rank())?;
    if sizes.is_empty() || sizes.contains(&0) {
      return Err(Error::invalid_shape("split", format!("sizes {sizes:?} must be positive")))
    }
    let len = self.shape()[axis];
    if sizes.iter().sum::<usize>() != len {
      return Err(Error::shape_mismatch("split",
        format!("sizes {sizes:?} do not add up to axis {axis} of {}", fmt_dims(self.shape()))))
    }
    let (outer, _, inner) = split_at_axis(self.shape(), axis);
    let src = self.data();
    let mut start = 0;
    let mut pieces = Vec::with_capacity(sizes.len());
    for &size in sizes {
      let run = size * inner;
      let mut data = vec![0.0; outer * run];
      parallel::split(&mut data, run, |first, blocks| {
        for (b, block) in blocks.chunks_mut(run).enumerate() {
          let o = first + b;
          block.copy_from_slice(&src[(o * len + start) * inner..][..run]);
        }
      });
      let mut dims = self.shape().to_vec();
      dims[axis] = size;
      pieces.push(Tensor::computed(&dims, data, &[self], || Op::Narrow { axis, start }));
      start += size;
    }
    Ok(pieces)
  }

  /// Split into `parts` pieces of near equal length, the first ones
  /// taking one extra element each when the axis does not divide evenly.

  pub fn chunk(&self, axis: isize, parts: usize) -> Result<Vec<Tensor>> {
    if parts == 0 {
      return Err(Error::invalid_shape("chunk", "number of parts must be positive"))
    }
    let len = self.shape()[axis_index("chunk", axis, self.rank())?];
    let (base, extra) = (len / parts, len % parts);
    let sizes: Vec<usize> = (0..parts).map(|i| base + usize::from(i < extra) ).collect();
    self.split(axis, &sizes)
  }
}


pub(crate) fn concat_backward(inputs: &[Tensor], grad: &Tensor, axis: usize) -> Vec<Option<Tensor>> {
  let mut start = 0;
  inputs.iter().enumerate().map(|(i, input)| {
    let len = input.shape()[axis];
    let piece = wants(inputs, i).then(|| {
      let window = grad.restrided(grad.layout().narrow(axis, start, len));
      Tensor::build(input.shape(), window.data())
    });
    start += len;
    piece
  }).collect()
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn concat_rows_and_columns() {
    let a = Tensor::new(&[1,2], vec![1.0, 2.0]).unwrap();
    let b = Tensor::new(&[2,2], vec![3.0, 4.0, 5.0, 6.0]).unwrap();
    let rows = Tensor::concat(&[&a, &b], 0).unwrap();
    assert_eq!(rows.shape(), &[3,2]);
    assert_eq!(rows.data(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let c = Tensor::new(&[2,1], vec![7.0, 8.0]).unwrap();
    let cols = Tensor::concat(&[&b, &c], -1).unwrap();
    assert_eq!(cols.data(), vec![3.0, 4.0, 7.0, 5.0, 6.0, 8.0]);
  }

  #[test]
  fn concat_gradient_splits() {
    let a = Tensor::vec(&[1.0, 2.0]).trained();
    let b = Tensor::vec(&[3.0]);
    let c = Tensor::vec(&[4.0, 5.0]).trained();
    let y = Tensor::concat(&[&a, &b, &c], 0).unwrap();
    y.mul(&Tensor::arange(&[5], 1.0, 1.0)).unwrap().sum().backward().unwrap();
    assert_eq!(a.grad().unwrap().data(), vec![1.0, 2.0]);
    assert!(b.grad().is_none());
    assert_eq!(c.grad().unwrap().data(), vec![4.0, 5.0]);
  }

  #[test]
  fn concat_errors() {
    let a = Tensor::zeros(&[2,2]);
    assert!(matches!(Tensor::concat(&[], 0), Err(Error::InvalidShape { .. })));
    assert!(matches!(Tensor::concat(&[&a, &Tensor::zeros(&[2,3])], 0), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(Tensor::concat(&[&a, &Tensor::zeros(&[4])], 0), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(Tensor::concat(&[&a], 2), Err(Error::IndexOutOfRange { .. })));
  }

  #[test]
  fn split_roundtrip() {
    let x = Tensor::arange(&[2,5], 0.0, 0.5);
    let pieces = x.split(1, &[2, 3]).unwrap();
    assert_eq!(pieces[0].shape(), &[2,2]);
    assert_eq!(pieces[0].data(), vec![0.0, 0.5, 2.5, 3.0]);
    let pieces: Vec<&Tensor> = pieces.iter().collect();
    assert_eq!(Tensor::concat(&pieces, 1).unwrap(), x);
  }

  #[test]
  fn split_gradient_reassembles() {
    let x = Tensor::arange(&[4], 0.0, 1.0).trained();
    let pieces = x.split(0, &[1, 3]).unwrap();
    pieces[1].sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 1.0, 1.0, 1.0]);
    pieces[0].mul_scalar(2.0).sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![2.0, 1.0, 1.0, 1.0]);
  }

  #[test]
  fn split_errors() {
    let x = Tensor::zeros(&[4]);
    assert!(matches!(x.split(0, &[1, 2]), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.split(0, &[4, 0]), Err(Error::InvalidShape { .. })));
    assert!(matches!(x.split(0, &[]), Err(Error::InvalidShape { .. })));
  }

  #[test]
  fn chunk_sizes() {
    let x = Tensor::arange(&[7], 0.0, 1.0);
    let sizes: Vec<usize> = x.chunk(0, 3).unwrap().iter().map(|c| c.numel() ).collect();
    assert_eq!(sizes, vec![3, 2, 2]);
    assert!(matches!(x.chunk(0, 0), Err(Error::InvalidShape { .. })));
    assert!(matches!(x.chunk(0, 8), Err(Error::InvalidShape { .. })));
  }

  #[test]
  fn stack_new_axis() {
    let a = Tensor::vec(&[1.0, 2.0]).trained();
    let b = Tensor::vec(&[3.0, 4.0]).trained();
    let s = Tensor::stack(&[&a, &b], 0).unwrap();
    assert_eq!(s.shape(), &[2,2]);
    assert_eq!(s.data(), vec![1.0, 2.0, 3.0, 4.0]);
    let s = Tensor::stack(&[&a, &b], -1).unwrap();
    assert_eq!(s.shape(), &[2,2]);
    assert_eq!(s.data(), vec![1.0, 3.0, 2.0, 4.0]);

    s.mul(&Tensor::arange(&[2,2], 1.0, 1.0)).unwrap().sum().backward().unwrap();
    assert_eq!(a.grad().unwrap().data(), vec![1.0, 3.0]);
    assert_eq!(b.grad().unwrap().data(), vec![2.0, 4.0]);
    assert!(matches!(Tensor::stack(&[&a, &Tensor::zeros(&[3])], 0), Err(Error::ShapeMismatch { .. })));
  }
}
