use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
  ops::wants,
};

const DEFAULT_EPS: f64 = 1e-5;

fn effective_eps(op: &'static str, eps: f64) -> f64 {
  if eps > 0.0 { return eps }
  log::warn!("{op}: non-positive eps {eps}, using {DEFAULT_EPS}");
  DEFAULT_EPS
}

fn ensure_size(op: &'static str, what: &str, t: Option<&Tensor>, size: usize) -> Result<()> {
  match t {
    Some(t) if t.numel() != size => Err(Error::shape_mismatch(op,
      format!("{what} {} should hold {size} elements", fmt_dims(t.shape())))),
    _ => Ok(()),
  }
}


/// Settings of [batch_norm](Tensor::batch_norm).

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormOptions {
  /// Weight of the current batch in the running statistics.
  pub momentum: f64,
  pub eps: f64,
  /// Normalize with batch statistics and update the running ones,
  /// rather than normalizing with the running statistics.
  pub training: bool,
}

impl Default for BatchNormOptions {
  fn default() -> Self {
    Self { momentum: 0.1, eps: DEFAULT_EPS, training: true }
  }
}

impl BatchNormOptions {
  pub fn eval() -> Self {
    Self { training: false, ..Self::default() }
  }
}


// Scale normalized values by optional per-feature weight and bias
fn affine(xhat: &[f64], weight: Option<&Tensor>, bias: Option<&Tensor>, feature: impl Fn(usize) -> usize + Sync) -> Vec<f64> {
  let weight = weight.map(Tensor::data);
  let bias = bias.map(Tensor::data);
  let mut out = vec![0.0; xhat.len()];
  parallel::split(&mut out, 1, |first, chunk| {
    for (k, o) in chunk.iter_mut().enumerate() {
      let i = first + k;
      let f = feature(i);
      let w = weight.as_ref().map_or(1.0, |w| w[f] );
      let b = bias.as_ref().map_or(0.0, |b| b[f] );
      *o = xhat[i] * w + b;
    }
  });
  out
}

fn optional_inputs<'a>(input: &'a Tensor, weight: Option<&'a Tensor>, bias: Option<&'a Tensor>) -> Vec<&'a Tensor> {
  let mut inputs = vec![input];
  inputs.extend(weight);
  inputs.extend(bias);
  inputs
}


impl Tensor {
  /// Normalize over the trailing `normalized_shape` dimensions with biased
  /// variance, then apply the optional elementwise `weight` and `bias`.
  /// Non-positive `eps` falls back to `1e-5`.

  pub fn layer_norm(&self, normalized_shape: &[usize], weight: Option<&Tensor>, bias: Option<&Tensor>, eps: f64) -> Result<Tensor> {
    check_dims("layer_norm", normalized_shape)?;
    let rank = self.rank();
    if normalized_shape.len() > rank || self.shape()[rank - normalized_shape.len()..] != *normalized_shape {
      return Err(Error::shape_mismatch("layer_norm",
        format!("{} does not end in {}", fmt_dims(self.shape()), fmt_dims(normalized_shape))))
    }
    let size: usize = normalized_shape.iter().product();
    ensure_size("layer_norm", "weight", weight, size)?;
    ensure_size("layer_norm", "bias", bias, size)?;
    let eps = effective_eps("layer_norm", eps);
    let groups = self.numel() / size;

    let (xhat, inv_std) = self.read(|x| {
      let mut stats = vec![0.0; groups * 2];
      parallel::split(&mut stats, 2, |first, chunk| {
        for (k, stat) in chunk.chunks_mut(2).enumerate() {
          let xs = &x[(first + k) * size..][..size];
          let mean = xs.iter().sum::<f64>() / size as f64;
          let var = xs.iter().map(|v| (v - mean).powi(2) ).sum::<f64>() / size as f64;
          stat[0] = mean;
          stat[1] = 1.0 / (var + eps).sqrt();
        }
      });
      let mut xhat = vec![0.0; x.len()];
      parallel::split(&mut xhat, size, |first, rows| {
        for (k, row) in rows.chunks_mut(size).enumerate() {
          let group = first + k;
          let (mean, inv_std) = (stats[group * 2], stats[group * 2 + 1]);
          let xs = &x[group * size..][..size];
          for (h, &v) in row.iter_mut().zip(xs) { *h = (v - mean) * inv_std }
        }
      });
      let inv_std: Vec<f64> = stats.chunks(2).map(|stat| stat[1] ).collect();
      (xhat, inv_std)
    });

    let data = affine(&xhat, weight, bias, |i| i % size );
    let inputs = optional_inputs(self, weight, bias);
    Ok(Tensor::computed(self.shape(), data, &inputs, || Op::LayerNorm {
      xhat,
      inv_std,
      has_weight: weight.is_some(),
      has_bias: bias.is_some(),
    }))
  }

  /// Normalize every channel (axis 1) of a `[batch, channels]` or
  /// `[batch, channels, height, width]` tensor.
  ///
  /// In training mode the batch statistics are used and folded into the
  /// running statistics, if given, as `(1 - momentum) * running + momentum * batch`.
  /// Evaluation mode normalizes with the running statistics, which are then required.

  pub fn batch_norm(&self, running_mean: Option<&Tensor>, running_var: Option<&Tensor>, weight: Option<&Tensor>, bias: Option<&Tensor>, options: BatchNormOptions) -> Result<Tensor> {
    let dims = self.shape();
    if dims.len() != 2 && dims.len() != 4 {
      return Err(Error::shape_mismatch("batch_norm", format!("expected rank 2 or 4, got {}", fmt_dims(dims))))
    }
    let (batch, channels) = (dims[0], dims[1]);
    let spatial: usize = dims[2..].iter().product();
    for (what, t) in [("running_mean", running_mean), ("running_var", running_var), ("weight", weight), ("bias", bias)] {
      ensure_size("batch_norm", what, t, channels)?;
    }
    let eps = effective_eps("batch_norm", options.eps);
    let count = (batch * spatial) as f64;

    let (mean, var) = if options.training {
      let stats = self.read(|x| {
        let mut stats = vec![0.0; channels * 2];
        parallel::split(&mut stats, 2, |first, chunk| {
          for (k, stat) in chunk.chunks_mut(2).enumerate() {
            let c = first + k;
            let plane = |n: usize| &x[(n * channels + c) * spatial..][..spatial];
            let mean = (0..batch).map(|n| plane(n).iter().sum::<f64>() ).sum::<f64>() / count;
            let var = (0..batch)
              .map(|n| plane(n).iter().map(|v| (v - mean).powi(2) ).sum::<f64>() )
              .sum::<f64>() / count;
            stat[0] = mean;
            stat[1] = var;
          }
        });
        stats
      });
      let mean: Vec<f64> = stats.iter().step_by(2).copied().collect();
      let var: Vec<f64> = stats.iter().skip(1).step_by(2).copied().collect();
      let momentum = options.momentum;
      if let Some(running) = running_mean {
        running.update(|c, r| (1.0 - momentum) * r + momentum * mean[c] );
      }
      if let Some(running) = running_var {
        running.update(|c, r| (1.0 - momentum) * r + momentum * var[c] );
      }
      (mean, var)
    } else {
      match (running_mean, running_var) {
        (Some(mean), Some(var)) => (mean.data(), var.data()),
        _ => return Err(Error::unsupported("batch_norm", "evaluation mode requires running statistics")),
      }
    };

    let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + eps).sqrt() ).collect();
    let channel = move |i: usize| (i / spatial) % channels;
    let xhat = self.read(|x| {
      let mut xhat = vec![0.0; x.len()];
      parallel::split(&mut xhat, 1, |first, chunk| {
        for (k, h) in chunk.iter_mut().enumerate() {
          let i = first + k;
          let c = channel(i);
          *h = (x[i] - mean[c]) * inv_std[c];
        }
      });
      xhat
    });

    let data = affine(&xhat, weight, bias, channel);
    let inputs = optional_inputs(self, weight, bias);
    Ok(Tensor::computed(dims, data, &inputs, || Op::BatchNorm {
      xhat,
      inv_std,
      spatial,
      training: options.training,
      has_weight: weight.is_some(),
      has_bias: bias.is_some(),
    }))
  }
}


/// Gradients of weight and bias, the inputs following the normalized one.

fn affine_backward(inputs: &[Tensor], g: &[f64], xhat: &[f64], has_weight: bool, has_bias: bool, features: usize, feature: impl Fn(usize) -> usize) -> Vec<Option<Tensor>> {
  let mut grads = vec![];
  let mut slot = 1;
  for (present, with_xhat) in [(has_weight, true), (has_bias, false)] {
    if !present { continue }
    grads.push(wants(inputs, slot).then(|| {
      let mut sums = vec![0.0; features];
      for (i, &gv) in g.iter().enumerate() {
        sums[feature(i)] += if with_xhat { gv * xhat[i] } else { gv };
      }
      Tensor::build(inputs[slot].shape(), sums)
    }));
    slot += 1;
  }
  grads
}

/// `invStd * (s - mean(s) - xhat * mean(s * xhat))` over every group,
/// where `s` is the gradient scaled by the weight.

fn normalized_input_grad(s: &[f64], xhat: &[f64], inv_std: &[f64], group_of: impl Fn(usize) -> usize + Sync, group_size: usize) -> Vec<f64> {
  let groups = inv_std.len();
  let mut sums = vec![0.0; groups * 2];
  for (i, (&sv, &h)) in s.iter().zip(xhat).enumerate() {
    let group = group_of(i);
    sums[group * 2] += sv;
    sums[group * 2 + 1] += sv * h;
  }
  let n = group_size as f64;
  let mut out = vec![0.0; s.len()];
  parallel::split(&mut out, 1, |first, chunk| {
    for (k, o) in chunk.iter_mut().enumerate() {
      let i = first + k;
      let group = group_of(i);
      let (mean_s, mean_sh) = (sums[group * 2] / n, sums[group * 2 + 1] / n);
      *o = inv_std[group] * (s[i] - mean_s - xhat[i] * mean_sh);
    }
  });
  out
}

fn weighted(g: &[f64], weight: Option<&Tensor>, feature: impl Fn(usize) -> usize) -> Vec<f64> {
  match weight {
    Some(weight) => weight.read(|w| g.iter().enumerate().map(|(i, gv)| gv * w[feature(i)] ).collect() ),
    None => g.to_vec(),
  }
}

pub(crate) fn layer_norm_backward(inputs: &[Tensor], grad: &Tensor, xhat: &[f64], inv_std: &[f64], has_weight: bool, has_bias: bool) -> Vec<Option<Tensor>> {
  let size = xhat.len() / inv_std.len();
  let weight = has_weight.then(|| &inputs[1] );
  grad.read(|g| {
    let input = wants(inputs, 0).then(|| {
      let s = weighted(g, weight, |i| i % size );
      Tensor::build(inputs[0].shape(), normalized_input_grad(&s, xhat, inv_std, |i| i / size, size))
    });
    let mut grads = vec![input];
    grads.extend(affine_backward(inputs, g, xhat, has_weight, has_bias, size, |i| i % size ));
    grads
  })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn batch_norm_backward(inputs: &[Tensor], grad: &Tensor, xhat: &[f64], inv_std: &[f64], spatial: usize, training: bool, has_weight: bool, has_bias: bool) -> Vec<Option<Tensor>> {
  let channels = inv_std.len();
  let channel = move |i: usize| (i / spatial) % channels;
  let weight = has_weight.then(|| &inputs[1] );
  grad.read(|g| {
    let input = wants(inputs, 0).then(|| {
      let s = weighted(g, weight, channel);
      let data = if training {
        let group_size = xhat.len() / channels;
        normalized_input_grad(&s, xhat, inv_std, channel, group_size)
      } else {
        // Running statistics are constants
        s.iter().enumerate().map(|(i, sv)| sv * inv_std[channel(i)] ).collect()
      };
      Tensor::build(inputs[0].shape(), data)
    });
    let mut grads = vec![input];
    grads.extend(affine_backward(inputs, g, xhat, has_weight, has_bias, channels, channel));
    grads
  })
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn layer_norm_normalizes_rows() {
    let x = Tensor::new(&[2,4], vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 4.0]).unwrap();
    let y = x.layer_norm(&[4], None, None, 0.0).unwrap().data();
    for row in y.chunks(4) {
      let mean: f64 = row.iter().sum::<f64>() / 4.0;
      let var: f64 = row.iter().map(|v| (v - mean).powi(2) ).sum::<f64>() / 4.0;
      assert_relative_eq!(mean, 0.0, epsilon = 1e-12);
      assert_relative_eq!(var, 1.0, epsilon = 1e-4);
    }
  }

  #[test]
  fn layer_norm_affine() {
    let x = Tensor::new(&[1,2], vec![0.0, 2.0]).unwrap();
    let w = Tensor::vec(&[2.0, 3.0]);
    let b = Tensor::vec(&[1.0, -1.0]);
    let y = x.layer_norm(&[2], Some(&w), Some(&b), 1e-12).unwrap().data();
    assert_relative_eq!(y[0], -1.0, epsilon = 1e-6);
    assert_relative_eq!(y[1], 2.0, epsilon = 1e-6);
  }

  #[test]
  fn layer_norm_gradients_sum_to_zero() {
    let x = Tensor::new(&[2,3], vec![0.5, -1.0, 2.0, 3.0, 1.0, 0.0]).unwrap().trained();
    let w = Tensor::vec(&[1.0, 2.0, 3.0]).trained();
    let b = Tensor::vec(&[0.0, 0.0, 0.0]).trained();
    let y = x.layer_norm(&[3], Some(&w), Some(&b), 1e-5).unwrap();
    y.mul(&Tensor::arange(&[2,3], 1.0, 1.0)).unwrap().sum().backward().unwrap();
    let dx = x.grad().unwrap().data();
    for row in dx.chunks(3) {
      assert_relative_eq!(row.iter().sum::<f64>(), 0.0, epsilon = 1e-9);
    }
    assert_eq!(b.grad().unwrap().data(), vec![5.0, 7.0, 9.0]);
    assert!(w.grad().is_some());
  }

  #[test]
  fn layer_norm_shape_checks() {
    let x = Tensor::zeros(&[2,3]);
    assert!(matches!(x.layer_norm(&[2], None, None, 1e-5), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.layer_norm(&[1,2,3], None, None, 1e-5), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.layer_norm(&[3], Some(&Tensor::ones(&[2])), None, 1e-5), Err(Error::ShapeMismatch { .. })));
  }

  #[test]
  fn batch_norm_training_updates_running_stats() {
    let x = Tensor::new(&[2,2], vec![1.0, 10.0, 3.0, 30.0]).unwrap();
    let mean = Tensor::zeros(&[2]);
    let var = Tensor::ones(&[2]);
    let y = x.batch_norm(Some(&mean), Some(&var), None, None, BatchNormOptions::default()).unwrap().data();
    assert_relative_eq!(y[0], -1.0, epsilon = 1e-4);
    assert_relative_eq!(y[2], 1.0, epsilon = 1e-4);
    assert_relative_eq!(mean.data()[0], 0.2, epsilon = 1e-12);
    assert_relative_eq!(mean.data()[1], 2.0, epsilon = 1e-12);
    assert_relative_eq!(var.data()[0], 0.9 + 0.1 * 1.0, epsilon = 1e-12);
    assert_relative_eq!(var.data()[1], 0.9 + 0.1 * 100.0, epsilon = 1e-12);
  }

  #[test]
  fn batch_norm_spatial_channels() {
    let x = Tensor::arange(&[2,2,1,2], 0.0, 1.0);
    let y = x.batch_norm(None, None, None, None, BatchNormOptions::default()).unwrap().data();
    // Channel 0 holds 0, 1, 4, 5
    let c0 = [y[0], y[1], y[4], y[5]];
    assert_relative_eq!(c0.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
  }

  #[test]
  fn batch_norm_eval() {
    let x = Tensor::new(&[1,2], vec![3.0, 3.0]).unwrap().trained();
    let mean = Tensor::vec(&[1.0, 2.0]);
    let var = Tensor::vec(&[4.0, 1.0]);
    let w = Tensor::vec(&[2.0, 1.0]);
    let y = x.batch_norm(Some(&mean), Some(&var), Some(&w), None, BatchNormOptions { eps: 1e-12, ..BatchNormOptions::eval() }).unwrap();
    assert_relative_eq!(y.data()[0], 2.0, epsilon = 1e-6);
    assert_relative_eq!(y.data()[1], 1.0, epsilon = 1e-6);
    y.sum().backward().unwrap();
    assert_relative_eq!(x.grad().unwrap().data()[0], 1.0, epsilon = 1e-6);
    assert_eq!(mean.data(), vec![1.0, 2.0]);

    let missing = x.batch_norm(None, Some(&var), None, None, BatchNormOptions::eval());
    assert!(matches!(missing, Err(Error::UnsupportedConfiguration { .. })));
  }

  #[test]
  fn batch_norm_rank_check() {
    let x = Tensor::zeros(&[2,2,2]);
    assert!(matches!(x.batch_norm(None, None, None, None, BatchNormOptions::default()), Err(Error::ShapeMismatch { .. })));
  }
}
