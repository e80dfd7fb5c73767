use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
};


fn last_axis(op: &'static str, t: &Tensor, axis: isize) -> Result<usize> {
  let axis = axis_index(op, axis, t.rank())?;
  if axis != t.rank() - 1 {
    return Err(Error::unsupported(op, format!("only the last axis is supported, got axis {axis} of rank {}", t.rank())))
  }
  Ok(t.shape()[axis])
}


impl Tensor {
  /// `x - logsumexp(x)` along the last axis, shifted by the row maximum
  /// to stay finite.

  pub fn log_softmax(&self, axis: isize) -> Result<Tensor> {
    let cols = last_axis("log_softmax", self, axis)?;
    let data = self.read(|x| {
      let mut out = vec![0.0; x.len()];
      parallel::split(&mut out, cols, |first, rows| {
        for (r, row) in rows.chunks_mut(cols).enumerate() {
          let xs = &x[(first + r) * cols..][..cols];
          let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
          let log_sum = max + xs.iter().map(|v| (v - max).exp() ).sum::<f64>().ln();
          for (o, v) in row.iter_mut().zip(xs) { *o = v - log_sum }
        }
      });
      out
    });
    Ok(Tensor::computed_with_output(self.shape(), data, &[self], |output| Op::LogSoftmax { output }))
  }

  /// Differentiates through [log_softmax](Self::log_softmax).

  pub fn softmax(&self, axis: isize) -> Result<Tensor> {
    Ok(self.log_softmax(axis)?.exp())
  }
}


pub(crate) fn log_softmax_backward(grad: &Tensor, output: &Tensor) -> Vec<Option<Tensor>> {
  let cols = *output.shape().last().unwrap_or(&1);
  let data = grad.read(|g| output.read(|y| {
    let mut out = vec![0.0; g.len()];
    parallel::split(&mut out, cols, |first, rows| {
      for (r, row) in rows.chunks_mut(cols).enumerate() {
        let start = (first + r) * cols;
        let gs = &g[start..][..cols];
        let total: f64 = gs.iter().sum();
        for (j, o) in row.iter_mut().enumerate() {
          *o = gs[j] - y[start + j].exp() * total;
        }
      }
    });
    out
  }));
  vec![Some(Tensor::build(output.shape(), data))]
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn rows_sum_to_one() {
    let x = Tensor::new(&[2,3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]).unwrap();
    let s = x.softmax(-1).unwrap().data();
    assert_relative_eq!(s[0..3].iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    for v in &s[3..] { assert_relative_eq!(*v, 1.0 / 3.0, epsilon = 1e-12) }
    assert!(s[2] > s[1] && s[1] > s[0]);
  }

  #[test]
  fn log_softmax_is_stable() {
    let x = Tensor::vec(&[1000.0, 0.0]);
    let y = x.log_softmax(0).unwrap().data();
    assert_relative_eq!(y[0], 0.0, epsilon = 1e-12);
    assert_relative_eq!(y[1], -1000.0, epsilon = 1e-9);
  }

  #[test]
  fn cross_entropy_gradient() {
    let x = Tensor::vec(&[1.0, 0.0, -1.0]).trained();
    let y = x.log_softmax(-1).unwrap();
    let target = Tensor::vec(&[0.0, -1.0, 0.0]);
    y.mul(&target).unwrap().sum().backward().unwrap();
    let s = x.softmax(0).unwrap().data();
    let g = x.grad().unwrap().data();
    assert_relative_eq!(g[0], s[0], epsilon = 1e-12);
    assert_relative_eq!(g[1], s[1] - 1.0, epsilon = 1e-12);
    assert_relative_eq!(g[2], s[2], epsilon = 1e-12);
  }

  #[test]
  fn softmax_gradient_of_sum_vanishes() {
    let x = Tensor::new(&[2,2], vec![0.3, -0.2, 1.5, 0.1]).unwrap().trained();
    x.softmax(1).unwrap().sum().backward().unwrap();
    for g in x.grad().unwrap().data() {
      assert_relative_eq!(g, 0.0, epsilon = 1e-12);
    }
  }

  #[test]
  fn only_last_axis() {
    let x = Tensor::zeros(&[2,3]);
    assert!(matches!(x.log_softmax(0), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(x.softmax(2), Err(Error::IndexOutOfRange { .. })));
  }
}
