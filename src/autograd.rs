//! Reverse-mode differentiation over the graph recorded by operations.

mod op;

use std::collections::{ HashMap, HashSet };

use crate::{
  tensor::Tensor,
  error::{ Error, Result },
  ops::zip,
};

pub(crate) use op::Op;


impl Tensor {
  /// Compute gradients of this tensor with respect to every tensor
  /// it was computed from that [requires gradients](Tensor::requires_grad).
  ///
  /// The pass is seeded with ones in the shape of this tensor, which is
  /// usually a single-element loss. Gradients add onto whatever earlier
  /// passes left behind until [zero_grad](Tensor::zero_grad) gets called.
  ///
  /// Fails without touching any gradient if a tensor of the graph was
  /// written to in place after an operation consumed it.

  pub fn backward(&self) -> Result<()> {
    if !self.requires_grad() {
      return Err(Error::invariant("backward", "tensor does not require gradients"))
    }
    let history = self.history();
    log::debug!("Backward pass through {} tensors", history.len());
    for tensor in &history {
      tensor.ensure_unmodified()?;
    }

    // Gradients still waiting to be passed on, by tensor id
    let mut pending: HashMap<usize, Tensor> = HashMap::new();
    pending.insert(self.id(), Tensor::ones(self.shape()));

    for tensor in history.iter().rev() {
      let Some(grad) = pending.remove(&tensor.id()) else { continue };
      tensor.accumulate_grad(&grad);
      let Some(grad_fn) = tensor.grad_fn() else { continue };
      let changes = grad_fn.op.derive(&grad_fn.inputs, &grad);
      for (input, change) in grad_fn.inputs.iter().zip(changes) {
        let Some(change) = change else { continue };
        if !input.requires_grad() { continue }
        assert_eq!(change.shape(), input.shape(),
          "Gradient of {} does not match its input", grad_fn.op.name());
        // Gradients may alias views of each other, so sums are never formed in place
        let total = match pending.remove(&input.id()) {
          Some(previous) => Tensor::build(input.shape(), zip(&previous, &change, |a, b| a + b )),
          None => change,
        };
        pending.insert(input.id(), total);
      }
    }
    Ok(())
  }

  /// Every tensor this one depends on through tensors requiring gradients,
  /// inputs before the operations consuming them.

  fn history(&self) -> Vec<Tensor> {
    let mut history = vec![];
    let mut visited = HashSet::new();
    let mut stack = vec![(self.clone(), false)];
    while let Some((tensor, expanded)) = stack.pop() {
      if expanded {
        history.push(tensor);
        continue
      }
      if !visited.insert(tensor.id()) { continue }
      let inputs: Vec<Tensor> = tensor.grad_fn()
        .map(|grad_fn| grad_fn.inputs.iter()
          .filter(|input| input.requires_grad() && !visited.contains(&input.id()) )
          .cloned()
          .collect() )
        .unwrap_or_default();
      stack.push((tensor, true));
      stack.extend(inputs.into_iter().map(|input| (input, false) ));
    }
    history
  }
}


/// Compare the gradients `backward` computes for `inputs` against
/// central differences with step `eps`.
///
/// `f` gets evaluated once with gradients and twice more per input
/// element while that element is nudged. Its output is summed into a
/// single value. Returns the largest mixed error `|a - n| / max(1, |a|, |n|)`
/// over all elements.
///
/// ```
/// use densegrad::{ Tensor, autograd::check_gradients };
///
/// let x = Tensor::vec(&[0.5, -1.5, 2.0]).trained();
/// let error = check_gradients(&[&x], 1e-6, || Ok(x.tanh().mul(&x)?) ).unwrap();
/// assert!(error < 1e-6);
/// ```

pub fn check_gradients<F>(inputs: &[&Tensor], eps: f64, f: F) -> Result<f64>
where
  F: Fn() -> Result<Tensor>
{
  for input in inputs {
    input.zero_grad();
  }
  f()?.sum().backward()?;
  let mut worst: f64 = 0.0;
  for input in inputs {
    let analytic = input.grad()
      .map(|grad| grad.data() )
      .unwrap_or_else(|| vec![0.0; input.numel()] );
    let original = input.data();
    let mut nudged = original.clone();
    for i in 0..original.len() {
      nudged[i] = original[i] + eps;
      input.set_data(&nudged)?;
      let next = f()?.sum().item()?;
      nudged[i] = original[i] - eps;
      input.set_data(&nudged)?;
      let prev = f()?.sum().item()?;
      nudged[i] = original[i];
      input.set_data(&original)?;
      let numeric = (next - prev) / (2.0 * eps);
      let error = (analytic[i] - numeric).abs() / 1f64.max(analytic[i].abs()).max(numeric.abs());
      worst = worst.max(error);
    }
  }
  Ok(worst)
}
