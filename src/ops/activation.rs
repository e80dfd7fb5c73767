use std::f64::consts::{ FRAC_1_SQRT_2, PI };

use libm::erf;

use crate::{
  tensor::Tensor,
  autograd::Op,
  ops::{ map, zip, zip3, like },
};


fn sigmoid(x: f64) -> f64 {
  if x >= 0.0 {
    1.0 / (1.0 + (-x).exp())
  } else {
    let e = x.exp();
    e / (1.0 + e)
  }
}

// log(1 + e^x) without overflow
fn softplus(x: f64) -> f64 {
  x.max(0.0) + (-x.abs()).exp().ln_1p()
}


impl Tensor {
  pub fn relu(&self) -> Tensor {
    Tensor::computed_with_output(self.shape(), map(self, |a| a.max(0.0) ), &[self],
      |output| Op::Relu { output })
  }

  pub fn sigmoid(&self) -> Tensor {
    Tensor::computed_with_output(self.shape(), map(self, sigmoid), &[self],
      |output| Op::Sigmoid { output })
  }

  pub fn tanh(&self) -> Tensor {
    Tensor::computed_with_output(self.shape(), map(self, f64::tanh), &[self],
      |output| Op::Tanh { output })
  }

  pub fn leaky_relu(&self, alpha: f64) -> Tensor {
    let data = map(self, |a| if a > 0.0 { a } else { alpha * a } );
    Tensor::computed(self.shape(), data, &[self], || Op::LeakyRelu(alpha))
  }

  pub fn elu(&self, alpha: f64) -> Tensor {
    let data = map(self, |a| if a > 0.0 { a } else { alpha * a.exp_m1() } );
    Tensor::computed_with_output(self.shape(), data, &[self], |output| Op::Elu { alpha, output })
  }

  /// Smooth approximation of [relu](Tensor::relu), `log(1 + e^(beta x)) / beta`.
  /// Non-positive `beta` falls back to 1.

  pub fn softplus(&self, beta: f64) -> Tensor {
    let beta = if beta > 0.0 { beta } else {
      log::warn!("softplus: non-positive beta {beta}, using 1");
      1.0
    };
    let data = map(self, |a| softplus(beta * a) / beta );
    Tensor::computed(self.shape(), data, &[self], || Op::Softplus(beta))
  }

  /// Gaussian error linear unit, in its exact `erf` form.

  pub fn gelu(&self) -> Tensor {
    let data = map(self, |a| 0.5 * a * (1.0 + erf(a * FRAC_1_SQRT_2)) );
    Tensor::computed(self.shape(), data, &[self], || Op::Gelu)
  }
}


pub(crate) fn relu_backward(grad: &Tensor, output: &Tensor) -> Vec<Option<Tensor>> {
  vec![Some(like(output, zip(grad, output, |g, y| if y > 0.0 { g } else { 0.0 } )))]
}

pub(crate) fn sigmoid_backward(grad: &Tensor, output: &Tensor) -> Vec<Option<Tensor>> {
  vec![Some(like(output, zip(grad, output, |g, y| g * y * (1.0 - y) )))]
}

pub(crate) fn tanh_backward(grad: &Tensor, output: &Tensor) -> Vec<Option<Tensor>> {
  vec![Some(like(output, zip(grad, output, |g, y| g * (1.0 - y * y) )))]
}

pub(crate) fn leaky_relu_backward(inputs: &[Tensor], grad: &Tensor, alpha: f64) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  vec![Some(like(a, zip(grad, a, |g, a| if a > 0.0 { g } else { alpha * g } )))]
}

pub(crate) fn elu_backward(inputs: &[Tensor], grad: &Tensor, alpha: f64, output: &Tensor) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  vec![Some(like(a, zip3(grad, a, output, |g, a, y| if a > 0.0 { g } else { g * (y + alpha) } )))]
}

pub(crate) fn softplus_backward(inputs: &[Tensor], grad: &Tensor, beta: f64) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  vec![Some(like(a, zip(grad, a, |g, a| g * sigmoid(beta * a) )))]
}

pub(crate) fn gelu_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  let norm = 1.0 / (2.0 * PI).sqrt();
  vec![Some(like(a, zip(grad, a, |g, a| {
    let cdf = 0.5 * (1.0 + erf(a * FRAC_1_SQRT_2));
    let pdf = norm * (-0.5 * a * a).exp();
    g * (cdf + a * pdf)
  })))]
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn relu_masks_non_positive() {
    let x = Tensor::vec(&[-1.0, 0.0, 2.0]).trained();
    let y = x.relu();
    assert_eq!(y.data(), vec![0.0, 0.0, 2.0]);
    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 0.0, 1.0]);
  }

  #[test]
  fn sigmoid_is_stable() {
    let y = Tensor::vec(&[-1000.0, 0.0, 1000.0]).sigmoid().data();
    assert_eq!(y, vec![0.0, 0.5, 1.0]);
  }

  #[test]
  fn sigmoid_and_tanh_reuse_output() {
    let x = Tensor::vec(&[0.3]).trained();
    x.sigmoid().sum().backward().unwrap();
    let s = sigmoid(0.3);
    assert_relative_eq!(x.grad().unwrap().data()[0], s * (1.0 - s));

    x.zero_grad();
    x.tanh().sum().backward().unwrap();
    assert_relative_eq!(x.grad().unwrap().data()[0], 1.0 - 0.3f64.tanh().powi(2));
  }

  #[test]
  fn leaky_and_elu() {
    let x = Tensor::vec(&[-2.0, 3.0]).trained();
    assert_eq!(x.leaky_relu(0.1).data(), vec![-0.2, 3.0]);
    x.leaky_relu(0.1).sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.1, 1.0]);

    x.zero_grad();
    let y = x.elu(1.0);
    assert_relative_eq!(y.data()[0], (-2f64).exp() - 1.0);
    y.sum().backward().unwrap();
    assert_relative_eq!(x.grad().unwrap().data()[0], (-2f64).exp());
  }

  #[test]
  fn softplus_large_inputs() {
    let y = Tensor::vec(&[1000.0, -1000.0]).softplus(1.0).data();
    assert_eq!(y[0], 1000.0);
    assert_eq!(y[1], 0.0);
    let z = Tensor::vec(&[0.0]).softplus(-3.0).data();
    assert_relative_eq!(z[0], 2f64.ln());
  }

  #[test]
  fn gelu_values() {
    let y = Tensor::vec(&[0.0, 1.0, -1.0]).gelu().data();
    assert_eq!(y[0], 0.0);
    assert_relative_eq!(y[1], 0.841344746, epsilon = 1e-8);
    assert_relative_eq!(y[2], -0.158655254, epsilon = 1e-8);
  }
}
