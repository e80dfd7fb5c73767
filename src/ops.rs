//! Differentiable operations on [Tensor]s.
//!
//! Every operation is an inherent method of [Tensor] (or an associated
//! function for operations that join several tensors). Outputs of
//! operations whose inputs require gradients record the operation,
//! describing how to propagate gradients back to those inputs.

pub mod elementwise;
pub mod activation;
pub mod reduce;
pub mod broadcast;
pub mod matmul;
pub mod conv;
pub mod pool;
pub mod norm;
pub mod softmax;
pub mod view;
pub mod join;
pub mod index;
pub mod dropout;
pub mod loss;

pub use norm::BatchNormOptions;

use crate::{ parallel, tensor::Tensor };


/// Apply `f` to every element, in parallel.

pub(crate) fn map<F>(t: &Tensor, f: F) -> Vec<f64>
where
  F: Fn(f64) -> f64 + Sync
{
  t.read(|src| {
    let mut out = vec![0.0; src.len()];
    parallel::split(&mut out, 1, |first, chunk| {
      for (o, &a) in chunk.iter_mut().zip(&src[first..]) {
        *o = f(a);
      }
    });
    out
  })
}

/// Combine two tensors of identical size elementwise.

pub(crate) fn zip<F>(lhs: &Tensor, rhs: &Tensor, f: F) -> Vec<f64>
where
  F: Fn(f64, f64) -> f64 + Sync
{
  debug_assert_eq!(lhs.numel(), rhs.numel());
  lhs.read(|a| rhs.read(|b| {
    let mut out = vec![0.0; a.len()];
    parallel::split(&mut out, 1, |first, chunk| {
      for (k, o) in chunk.iter_mut().enumerate() {
        *o = f(a[first + k], b[first + k]);
      }
    });
    out
  }))
}

pub(crate) fn zip3<F>(x: &Tensor, y: &Tensor, z: &Tensor, f: F) -> Vec<f64>
where
  F: Fn(f64, f64, f64) -> f64 + Sync
{
  debug_assert!(x.numel() == y.numel() && y.numel() == z.numel());
  x.read(|a| y.read(|b| z.read(|c| {
    let mut out = vec![0.0; a.len()];
    parallel::split(&mut out, 1, |first, chunk| {
      for (k, o) in chunk.iter_mut().enumerate() {
        let i = first + k;
        *o = f(a[i], b[i], c[i]);
      }
    });
    out
  })))
}

/// Untracked tensor shaped like `like` holding `data`.

pub(crate) fn like(like: &Tensor, data: Vec<f64>) -> Tensor {
  Tensor::build(like.shape(), data)
}

/// Whether the input at `i` wants a gradient.

pub(crate) fn wants(inputs: &[Tensor], i: usize) -> bool {
  inputs.get(i).map_or(false, |input| input.requires_grad() )
}
