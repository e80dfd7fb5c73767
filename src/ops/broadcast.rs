use crate::{
  internal::*,
  shape::Shape,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
};


/// Sum `grad` down to `dims`, which must broadcast to `grad`'s shape.

pub(crate) fn sum_to(grad: &Tensor, dims: &[usize]) -> Vec<f64> {
  let mut out = vec![0.0; dims.iter().product()];
  match Shape::new(dims).broadcast_to(grad.shape()) {
    Some(target) => grad.read(|g| {
      for (&v, pos) in g.iter().zip(target.iter()) {
        out[pos] += v;
      }
    }),
    None => panic!("Cannot reduce gradient of {} to {}", fmt_dims(grad.shape()), fmt_dims(dims)),
  }
  out
}


impl Tensor {
  /// Expand to `dims` without copying. Dimensions are aligned from the right
  /// and each must either match or be 1; missing leading dimensions are added.

  pub fn broadcast_to(&self, dims: &[usize]) -> Result<Tensor> {
    check_dims("broadcast_to", dims)?;
    let shape = self.layout().broadcast_to(dims)
      .ok_or_else(|| Error::shape_mismatch("broadcast_to",
        format!("cannot broadcast {} to {}", fmt_dims(self.shape()), fmt_dims(dims))) )?;
    Ok(self.view_with(shape, || Op::BroadcastTo))
  }

  /// Sum over every axis that broadcasting `dims` would have expanded,
  /// producing a tensor of exactly `dims`.

  pub fn reduce_to_shape(&self, dims: &[usize]) -> Result<Tensor> {
    check_dims("reduce_to_shape", dims)?;
    if Shape::new(dims).broadcast_to(self.shape()).is_none() {
      return Err(Error::shape_mismatch("reduce_to_shape",
        format!("{} does not broadcast to {}", fmt_dims(dims), fmt_dims(self.shape()))))
    }
    Ok(Tensor::computed(dims, sum_to(self, dims), &[self], || Op::ReduceTo))
  }
}


pub(crate) fn broadcast_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let dims = inputs[0].shape();
  vec![Some(Tensor::build(dims, sum_to(grad, dims)))]
}

pub(crate) fn reduce_to_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let dims = inputs[0].shape();
  match grad.layout().broadcast_to(dims) {
    Some(shape) => vec![Some(grad.restrided(shape))],
    None => panic!("Cannot broadcast gradient of {} to {}", fmt_dims(grad.shape()), fmt_dims(dims)),
  }
}
