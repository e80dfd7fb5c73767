use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::Result,
};


fn reduced_dims(dims: &[usize], axis: usize) -> Vec<usize> {
  let mut dims = dims.to_vec();
  dims.remove(axis);
  if dims.is_empty() { dims.push(1) }
  dims
}

// Fold every run along `axis` into one value with `cb(first_in_run, stride)`
fn collapse<F>(t: &Tensor, axis: usize, cb: F) -> Vec<f64>
where
  F: Fn(&[f64], usize, usize) -> f64 + Sync
{
  let (outer, len, inner) = split_at_axis(t.shape(), axis);
  t.read(|src| {
    let mut out = vec![0.0; outer * inner];
    parallel::split(&mut out, inner, |first, rows| {
      for (r, row) in rows.chunks_mut(inner).enumerate() {
        let base = (first + r) * len * inner;
        for (i, o) in row.iter_mut().enumerate() {
          *o = cb(&src[base + i..], len, inner);
        }
      }
    });
    out
  })
}

// Spread one value per run back over the runs along `axis`
fn uncollapse<F>(grad: &Tensor, dims: &[usize], axis: usize, cb: F) -> Tensor
where
  F: Fn(f64, usize, usize) -> f64 + Sync
{
  let (_, len, inner) = split_at_axis(dims, axis);
  let data = grad.read(|g| {
    let mut out = vec![0.0; dims.iter().product()];
    parallel::split(&mut out, len * inner, |first, runs| {
      for (r, run) in runs.chunks_mut(len * inner).enumerate() {
        let o = first + r;
        for (j, v) in run.iter_mut().enumerate() {
          let (k, i) = (j / inner, j % inner);
          *v = cb(g[o * inner + i], o * inner + i, k);
        }
      }
    });
    out
  });
  Tensor::build(dims, data)
}


impl Tensor {
  /// Sum of all elements, as a `[1]` tensor.

  pub fn sum(&self) -> Tensor {
    let total = self.read(|src| parallel::sum(src.len(), |start, end| src[start..end].iter().sum() ));
    Tensor::computed(&[1], vec![total], &[self], || Op::Sum)
  }

  pub fn mean(&self) -> Tensor {
    let n = self.numel() as f64;
    let total = self.read(|src| parallel::sum(src.len(), |start, end| src[start..end].iter().sum() ));
    Tensor::computed(&[1], vec![total / n], &[self], || Op::Mean)
  }

  /// Sum along `axis`, removing it.

  pub fn sum_axis(&self, axis: isize) -> Result<Tensor> {
    let axis = axis_index("sum_axis", axis, self.rank())?;
    let data = collapse(self, axis, |run, len, stride| {
      (0..len).map(|k| run[k * stride] ).sum()
    });
    Ok(Tensor::computed(&reduced_dims(self.shape(), axis), data, &[self], || Op::SumAxis { axis }))
  }

  pub fn mean_axis(&self, axis: isize) -> Result<Tensor> {
    let axis = axis_index("mean_axis", axis, self.rank())?;
    let data = collapse(self, axis, |run, len, stride| {
      (0..len).map(|k| run[k * stride] ).sum::<f64>() / len as f64
    });
    Ok(Tensor::computed(&reduced_dims(self.shape(), axis), data, &[self], || Op::MeanAxis { axis }))
  }

  /// Greatest value along `axis`, removing it. The gradient flows to the
  /// first occurrence of the maximum.

  pub fn max(&self, axis: isize) -> Result<Tensor> {
    self.extremum("max", axis, |a, b| a > b )
  }

  pub fn min(&self, axis: isize) -> Result<Tensor> {
    self.extremum("min", axis, |a, b| a < b )
  }

  fn extremum(&self, op: &'static str, axis: isize, better: fn(f64, f64) -> bool) -> Result<Tensor> {
    let axis = axis_index(op, axis, self.rank())?;
    let winner = move |run: &[f64], len: usize, stride: usize| {
      let mut best = 0;
      for k in 1..len {
        if better(run[k * stride], run[best * stride]) { best = k }
      }
      best as f64
    };
    let indices: Vec<usize> = collapse(self, axis, winner).into_iter().map(|k| k as usize ).collect();
    let (_, len, inner) = split_at_axis(self.shape(), axis);
    let data = self.read(|src| {
      indices.iter().enumerate().map(|(j, &k)| {
        let (o, i) = (j / inner, j % inner);
        src[o * len * inner + k * inner + i]
      }).collect()
    });
    let dims = reduced_dims(self.shape(), axis);
    Ok(Tensor::computed(&dims, data, &[self], || Op::Extremum { axis, indices }))
  }
}


pub(crate) fn sum_backward(inputs: &[Tensor], grad: &Tensor, scale: f64) -> Vec<Option<Tensor>> {
  let g = grad.read(|g| g[0] );
  vec![Some(Tensor::full(inputs[0].shape(), g * scale))]
}

pub(crate) fn sum_axis_backward(inputs: &[Tensor], grad: &Tensor, axis: usize, mean: bool) -> Vec<Option<Tensor>> {
  let dims = inputs[0].shape();
  let scale = if mean { 1.0 / dims[axis] as f64 } else { 1.0 };
  vec![Some(uncollapse(grad, dims, axis, |g, _, _| g * scale ))]
}

pub(crate) fn extremum_backward(inputs: &[Tensor], grad: &Tensor, axis: usize, indices: &[usize]) -> Vec<Option<Tensor>> {
  let dims = inputs[0].shape();
  vec![Some(uncollapse(grad, dims, axis, |g, j, k| if indices[j] == k { g } else { 0.0 } ))]
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;

  fn matrix() -> Tensor {
    Tensor::new(&[2,3], vec![1.0, 5.0, 3.0, 4.0, 2.0, 6.0]).unwrap()
  }

  #[test]
  fn totals() {
    let x = matrix().trained();
    assert_eq!(x.sum().data(), vec![21.0]);
    assert_eq!(x.mean().data(), vec![3.5]);
    x.mean().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![1.0 / 6.0; 6]);
  }

  #[test]
  fn along_axis() {
    let x = matrix().trained();
    let rows = x.sum_axis(1).unwrap();
    assert_eq!(rows.shape(), &[2]);
    assert_eq!(rows.data(), vec![9.0, 12.0]);
    let cols = x.mean_axis(-2).unwrap();
    assert_eq!(cols.data(), vec![2.5, 3.5, 4.5]);

    cols.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.5; 6]);
  }

  #[test]
  fn sum_axis_of_vector_keeps_one_dim() {
    let x = Tensor::vec(&[1.0, 2.0]);
    let s = x.sum_axis(0).unwrap();
    assert_eq!(s.shape(), &[1]);
    assert_eq!(s.data(), vec![3.0]);
  }

  #[test]
  fn extrema_route_to_winner() {
    let x = matrix().trained();
    let m = x.max(1).unwrap();
    assert_eq!(m.data(), vec![5.0, 6.0]);
    m.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    x.zero_grad();
    let m = x.min(0).unwrap();
    assert_eq!(m.data(), vec![1.0, 2.0, 3.0]);
    m.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
  }

  #[test]
  fn ties_pick_first() {
    let x = Tensor::vec(&[2.0, 7.0, 7.0]).trained();
    x.max(0).unwrap().sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 1.0, 0.0]);
  }

  #[test]
  fn bad_axis() {
    assert!(matches!(matrix().sum_axis(2), Err(Error::IndexOutOfRange { .. })));
    assert!(matches!(matrix().max(-3), Err(Error::IndexOutOfRange { .. })));
  }
}
