use crate::{
  internal::*,
  tensor::Tensor,
  error::{ Error, Result },
};


// Check class targets against `[batch, classes]` scores and lay them out as a gather index
fn class_index(op: &'static str, scores: &Tensor, targets: &[usize]) -> Result<Tensor> {
  ensure_rank(op, scores.shape(), 2)?;
  let (batch, classes) = (scores.shape()[0], scores.shape()[1]);
  if targets.len() != batch {
    return Err(Error::shape_mismatch(op, format!("{} targets for a batch of {batch}", targets.len())))
  }
  if let Some(&target) = targets.iter().find(|&&t| t >= classes ) {
    return Err(Error::out_of_range(op, format!("target {target} outside 0..{classes}")))
  }
  Ok(Tensor::build(&[batch, 1], targets.iter().map(|&t| t as f64 ).collect()))
}


impl Tensor {
  /// Negative log likelihood of `[batch, classes]` log-probabilities,
  /// averaged over the batch. `targets` holds one class per row.

  pub fn nll_loss(&self, targets: &[usize]) -> Result<Tensor> {
    let index = class_index("nll_loss", self, targets)?;
    let batch = self.shape()[0] as f64;
    Ok(self.gather(1, &index)?.sum().mul_scalar(-1.0 / batch))
  }

  /// Softmax cross entropy of `[batch, classes]` logits against one
  /// class per row, averaged over the batch.

  pub fn cross_entropy(&self, targets: &[usize]) -> Result<Tensor> {
    class_index("cross_entropy", self, targets)?;
    self.log_softmax(-1)?.nll_loss(targets)
  }

  /// Mean squared error against a `target` of identical dimensions.

  pub fn mse(&self, target: &Tensor) -> Result<Tensor> {
    ensure_same_shape("mse", self.shape(), target.shape())?;
    Ok(self.sub(target)?.pow(2.0).mean())
  }
}
