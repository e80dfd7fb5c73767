use crate::{
  internal::*,
  tensor::Tensor,
  autograd::Op,
  error::Result,
  ops::{ map, zip, zip3, like, wants },
};


impl Tensor {
  /// Elementwise sum. Shapes must be identical; use
  /// [broadcast_to](Tensor::broadcast_to) first to combine differing shapes.

  pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
    ensure_same_shape("add", self.shape(), rhs.shape())?;
    Ok(Tensor::computed(self.shape(), zip(self, rhs, |a, b| a + b ), &[self, rhs], || Op::Add))
  }

  pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
    ensure_same_shape("sub", self.shape(), rhs.shape())?;
    Ok(Tensor::computed(self.shape(), zip(self, rhs, |a, b| a - b ), &[self, rhs], || Op::Sub))
  }

  pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
    ensure_same_shape("mul", self.shape(), rhs.shape())?;
    Ok(Tensor::computed(self.shape(), zip(self, rhs, |a, b| a * b ), &[self, rhs], || Op::Mul))
  }

  pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
    ensure_same_shape("div", self.shape(), rhs.shape())?;
    Ok(Tensor::computed(self.shape(), zip(self, rhs, |a, b| a / b ), &[self, rhs], || Op::Div))
  }

  pub fn add_scalar(&self, value: f64) -> Tensor {
    Tensor::computed(self.shape(), map(self, |a| a + value ), &[self], || Op::AddScalar)
  }

  pub fn mul_scalar(&self, factor: f64) -> Tensor {
    Tensor::computed(self.shape(), map(self, |a| a * factor ), &[self], || Op::MulScalar(factor))
  }

  pub fn neg(&self) -> Tensor {
    self.mul_scalar(-1.0)
  }

  /// Raise every element to a constant power.

  pub fn pow(&self, exponent: f64) -> Tensor {
    Tensor::computed(self.shape(), map(self, |a| a.powf(exponent) ), &[self], || Op::Pow(exponent))
  }

  pub fn exp(&self) -> Tensor {
    Tensor::computed_with_output(self.shape(), map(self, f64::exp), &[self], |output| Op::Exp { output })
  }

  /// Natural logarithm.

  pub fn log(&self) -> Tensor {
    Tensor::computed(self.shape(), map(self, f64::ln), &[self], || Op::Log)
  }

  /// Add a `[cols]` bias to every row of a `[rows, cols]` tensor.

  pub fn add_bias(&self, bias: &Tensor) -> Result<Tensor> {
    ensure_rank("add_bias", self.shape(), 2)?;
    ensure_rank("add_bias", bias.shape(), 1)?;
    let cols = self.shape()[1];
    ensure_same_shape("add_bias", &[cols], bias.shape())?;
    let data = self.read(|a| bias.read(|b| {
      a.iter().enumerate().map(|(i, &v)| v + b[i % cols] ).collect()
    }));
    Ok(Tensor::computed(self.shape(), data, &[self, bias], || Op::AddBias))
  }
}


pub(crate) fn add_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  vec![
    wants(inputs, 0).then(|| grad.clone() ),
    wants(inputs, 1).then(|| grad.clone() ),
  ]
}

pub(crate) fn sub_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  vec![
    wants(inputs, 0).then(|| grad.clone() ),
    wants(inputs, 1).then(|| like(grad, map(grad, |g| -g )) ),
  ]
}

pub(crate) fn mul_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let (a, b) = (&inputs[0], &inputs[1]);
  vec![
    wants(inputs, 0).then(|| like(a, zip(grad, b, |g, b| g * b )) ),
    wants(inputs, 1).then(|| like(b, zip(grad, a, |g, a| g * a )) ),
  ]
}

pub(crate) fn div_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let (a, b) = (&inputs[0], &inputs[1]);
  vec![
    wants(inputs, 0).then(|| like(a, zip(grad, b, |g, b| g / b )) ),
    wants(inputs, 1).then(|| like(b, zip3(grad, a, b, |g, a, b| -g * a / (b * b) )) ),
  ]
}

pub(crate) fn scale_backward(grad: &Tensor, factor: f64) -> Vec<Option<Tensor>> {
  vec![Some(like(grad, map(grad, |g| g * factor )))]
}

pub(crate) fn pow_backward(inputs: &[Tensor], grad: &Tensor, exponent: f64) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  vec![Some(like(a, zip(grad, a, |g, a| g * exponent * a.powf(exponent - 1.0) )))]
}

pub(crate) fn exp_backward(grad: &Tensor, output: &Tensor) -> Vec<Option<Tensor>> {
  vec![Some(like(output, zip(grad, output, |g, y| g * y )))]
}

pub(crate) fn log_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let a = &inputs[0];
  vec![Some(like(a, zip(grad, a, |g, a| g / a )))]
}

pub(crate) fn add_bias_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let cols = inputs[1].numel();
  vec![
    wants(inputs, 0).then(|| grad.clone() ),
    wants(inputs, 1).then(|| {
      let sums = grad.read(|g| {
        let mut sums = vec![0.0; cols];
        for row in g.chunks(cols) {
          for (s, &v) in sums.iter_mut().zip(row) { *s += v }
        }
        sums
      });
      Tensor::build(&[cols], sums)
    }),
  ]
}


macro_rules! scalar_operator {
  ($op:ident, $meth:ident, |$t:ident, $v:ident| $body:expr) => {
    impl std::ops::$op<f64> for &Tensor { // &tensor + 1.0
      type Output = Tensor;

      fn $meth(self, $v: f64) -> Tensor {
        let $t = self;
        $body
      }
    }

    impl std::ops::$op<f64> for Tensor { // tensor + 1.0
      type Output = Tensor;

      fn $meth(self, rhs: f64) -> Tensor {
        std::ops::$op::$meth(&self, rhs)
      }
    }
  };
}

scalar_operator!(Add, add, |t, v| t.add_scalar(v) );
scalar_operator!(Sub, sub, |t, v| t.add_scalar(-v) );
scalar_operator!(Mul, mul, |t, v| t.mul_scalar(v) );
scalar_operator!(Div, div, |t, v| t.mul_scalar(1.0 / v) );

impl std::ops::Neg for &Tensor {
  type Output = Tensor;

  fn neg(self) -> Tensor {
    Tensor::neg(self)
  }
}

impl std::ops::Neg for Tensor {
  type Output = Tensor;

  fn neg(self) -> Tensor {
    Tensor::neg(&self)
  }
}
