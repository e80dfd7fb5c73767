//! Convolutions over one, two or three spatial dimensions.
//!
//! Inputs are laid out `[batch, channels, *spatial]`. Forward convolution
//! weights are `[out_channels, in_channels, *kernel]`, transposed
//! convolution weights `[in_channels, out_channels, *kernel]`. Padding is
//! never materialized: taps that land outside the input are skipped.
//!
//! Every kernel hands disjoint slabs of its output to the parallel-for
//! primitive. Input gradients are partitioned by `(batch, channel)` and
//! weight gradients by the weight's leading channel, so no two workers
//! ever write the same element.

use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
  ops::wants,
};


/// For every position of `outer` and every kernel offset, the flat
/// position in `target` that the tap lands on, or `None` for padding.
/// Entries are laid out `[outer_position * kernel_size + kernel_offset]`.

pub(crate) fn receptive_field(outer: &[usize], kernel: &[usize], target: &[usize], stride: &[usize], padding: &[usize]) -> Vec<Option<usize>> {
  let outer_size: usize = outer.iter().product();
  let kernel_size: usize = kernel.iter().product();
  let rank = outer.len();
  let mut taps = Vec::with_capacity(outer_size * kernel_size);
  let mut o_idx = vec![0; rank];
  let mut k_idx = vec![0; rank];
  for o in 0..outer_size {
    unravel(o, outer, &mut o_idx);
    for k in 0..kernel_size {
      unravel(k, kernel, &mut k_idx);
      let mut flat = 0;
      let mut valid = true;
      for d in 0..rank {
        let pos = (o_idx[d] * stride[d] + k_idx[d]) as isize - padding[d] as isize;
        if pos < 0 || pos >= target[d] as isize {
          valid = false;
          break
        }
        flat = flat * target[d] + pos as usize;
      }
      taps.push(valid.then(|| flat ));
    }
  }
  taps
}

fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
  for d in (0..dims.len()).rev() {
    out[d] = flat % dims[d];
    flat /= dims[d];
  }
}


/// Everything needed to run a convolution, or to differentiate it.

#[derive(Debug, Clone)]
pub(crate) struct ConvGeometry {
  pub batch: usize,
  pub in_channels: usize,
  pub out_channels: usize,
  pub input: Vec<usize>,
  pub kernel: Vec<usize>,
  pub output: Vec<usize>,
  pub stride: Vec<usize>,
  pub padding: Vec<usize>,
  pub transposed: bool,
}

impl ConvGeometry {
  fn new(op: &'static str, input: &[usize], weight: &[usize], bias: Option<&[usize]>, stride: &[usize], padding: &[usize], transposed: bool) -> Result<Self> {
    let rank = stride.len();
    if rank == 0 || padding.len() != rank {
      return Err(Error::unsupported(op,
        format!("{rank} stride and {} padding values", padding.len())))
    }
    ensure_rank(op, input, rank + 2)?;
    ensure_rank(op, weight, rank + 2)?;
    if stride.iter().any(|&s| s == 0 ) {
      return Err(Error::invalid_shape(op, format!("non-positive stride {}", fmt_dims(stride))))
    }
    let (in_channels, out_channels) = if transposed {
      (weight[0], weight[1])
    } else {
      (weight[1], weight[0])
    };
    if in_channels != input[1] {
      return Err(Error::shape_mismatch(op, format!("input {} has {} channels, weight {} expects {in_channels}",
        fmt_dims(input), input[1], fmt_dims(weight))))
    }
    if let Some(bias) = bias {
      ensure_same_shape(op, bias, &[out_channels])?;
    }
    let kernel = weight[2..].to_vec();
    let spatial = &input[2..];
    let output = (0..rank).map(|d| {
      let (n, k, s, p) = (spatial[d] as isize, kernel[d] as isize, stride[d] as isize, padding[d] as isize);
      let size = if transposed {
        (n - 1) * s - 2 * p + k
      } else {
        let span = n + 2 * p - k;
        if span < 0 { 0 } else { span / s + 1 }
      };
      if size <= 0 {
        return Err(Error::invalid_shape(op, format!("input {} with kernel {}, stride {} and padding {} leaves no output",
          fmt_dims(input), fmt_dims(&kernel), fmt_dims(stride), fmt_dims(padding))))
      }
      Ok(size as usize)
    }).collect::<Result<Vec<_>>>()?;
    Ok(Self {
      batch: input[0],
      in_channels,
      out_channels,
      input: spatial.to_vec(),
      kernel,
      output,
      stride: stride.to_vec(),
      padding: padding.to_vec(),
      transposed,
    })
  }

  fn input_size(&self) -> usize {
    self.input.iter().product()
  }

  fn output_size(&self) -> usize {
    self.output.iter().product()
  }

  fn kernel_size(&self) -> usize {
    self.kernel.iter().product()
  }

  fn output_dims(&self) -> Vec<usize> {
    [vec![self.batch, self.out_channels], self.output.clone()].concat()
  }

  fn taps(&self) -> Vec<Option<usize>> {
    if self.transposed {
      receptive_field(&self.input, &self.kernel, &self.output, &self.stride, &self.padding)
    } else {
      receptive_field(&self.output, &self.kernel, &self.input, &self.stride, &self.padding)
    }
  }

  // Weight slab connecting one input and one output channel
  fn weight_offset(&self, ic: usize, oc: usize) -> usize {
    let pair = if self.transposed {
      ic * self.out_channels + oc
    } else {
      oc * self.in_channels + ic
    };
    pair * self.kernel_size()
  }

  fn forward(&self, x: &[f64], w: &[f64], bias: Option<&[f64]>) -> Vec<f64> {
    let taps = self.taps();
    let (in_size, out_size, k_size) = (self.input_size(), self.output_size(), self.kernel_size());
    let mut out = vec![0.0; self.batch * self.out_channels * out_size];
    parallel::split(&mut out, out_size, |first, slabs| {
      for (u, slab) in slabs.chunks_mut(out_size).enumerate() {
        let (n, oc) = ((first + u) / self.out_channels, (first + u) % self.out_channels);
        slab.fill(bias.map_or(0.0, |b| b[oc] ));
        for ic in 0..self.in_channels {
          let xs = &x[(n * self.in_channels + ic) * in_size..][..in_size];
          let ws = &w[self.weight_offset(ic, oc)..][..k_size];
          if self.transposed {
            // Scatter every input element into the output
            for (i, &xv) in xs.iter().enumerate() {
              for (kk, &wv) in ws.iter().enumerate() {
                if let Some(p) = taps[i * k_size + kk] { slab[p] += xv * wv }
              }
            }
          } else {
            for (o, value) in slab.iter_mut().enumerate() {
              let mut acc = 0.0;
              for (kk, &wv) in ws.iter().enumerate() {
                if let Some(p) = taps[o * k_size + kk] { acc += wv * xs[p] }
              }
              *value += acc;
            }
          }
        }
      }
    });
    out
  }

  fn input_grad(&self, g: &[f64], w: &[f64]) -> Vec<f64> {
    let taps = self.taps();
    let (in_size, out_size, k_size) = (self.input_size(), self.output_size(), self.kernel_size());
    let mut out = vec![0.0; self.batch * self.in_channels * in_size];
    parallel::split(&mut out, in_size, |first, slabs| {
      for (u, slab) in slabs.chunks_mut(in_size).enumerate() {
        let (n, ic) = ((first + u) / self.in_channels, (first + u) % self.in_channels);
        for oc in 0..self.out_channels {
          let gs = &g[(n * self.out_channels + oc) * out_size..][..out_size];
          let ws = &w[self.weight_offset(ic, oc)..][..k_size];
          if self.transposed {
            for (i, value) in slab.iter_mut().enumerate() {
              let mut acc = 0.0;
              for (kk, &wv) in ws.iter().enumerate() {
                if let Some(p) = taps[i * k_size + kk] { acc += gs[p] * wv }
              }
              *value += acc;
            }
          } else {
            for (o, &gv) in gs.iter().enumerate() {
              if gv == 0.0 { continue }
              for (kk, &wv) in ws.iter().enumerate() {
                if let Some(p) = taps[o * k_size + kk] { slab[p] += wv * gv }
              }
            }
          }
        }
      }
    });
    out
  }

  fn weight_grad(&self, g: &[f64], x: &[f64]) -> Vec<f64> {
    let taps = self.taps();
    let (in_size, out_size, k_size) = (self.input_size(), self.output_size(), self.kernel_size());
    // Slabs follow the weight's leading channel
    let (lead, trail) = if self.transposed {
      (self.in_channels, self.out_channels)
    } else {
      (self.out_channels, self.in_channels)
    };
    let mut out = vec![0.0; lead * trail * k_size];
    parallel::split(&mut out, trail * k_size, |first, slabs| {
      for (u, slab) in slabs.chunks_mut(trail * k_size).enumerate() {
        let l = first + u;
        for t in 0..trail {
          let (ic, oc) = if self.transposed { (l, t) } else { (t, l) };
          let ws = &mut slab[t * k_size..][..k_size];
          for n in 0..self.batch {
            let xs = &x[(n * self.in_channels + ic) * in_size..][..in_size];
            let gs = &g[(n * self.out_channels + oc) * out_size..][..out_size];
            if self.transposed {
              for (i, &xv) in xs.iter().enumerate() {
                for (kk, wv) in ws.iter_mut().enumerate() {
                  if let Some(p) = taps[i * k_size + kk] { *wv += xv * gs[p] }
                }
              }
            } else {
              for (o, &gv) in gs.iter().enumerate() {
                if gv == 0.0 { continue }
                for (kk, wv) in ws.iter_mut().enumerate() {
                  if let Some(p) = taps[o * k_size + kk] { *wv += xs[p] * gv }
                }
              }
            }
          }
        }
      }
    });
    out
  }

  fn bias_grad(&self, g: &[f64]) -> Vec<f64> {
    let out_size = self.output_size();
    let mut out = vec![0.0; self.out_channels];
    parallel::split(&mut out, 1, |first, sums| {
      for (u, sum) in sums.iter_mut().enumerate() {
        let oc = first + u;
        *sum = (0..self.batch)
          .map(|n| g[(n * self.out_channels + oc) * out_size..][..out_size].iter().sum::<f64>() )
          .sum();
      }
    });
    out
  }
}


impl Tensor {
  /// Convolution over `stride.len()` spatial dimensions.

  pub fn conv(&self, weight: &Tensor, bias: Option<&Tensor>, stride: &[usize], padding: &[usize]) -> Result<Tensor> {
    self.convolve("conv", weight, bias, stride, padding, false)
  }

  /// Transposed convolution over `stride.len()` spatial dimensions.

  pub fn conv_transpose(&self, weight: &Tensor, bias: Option<&Tensor>, stride: &[usize], padding: &[usize]) -> Result<Tensor> {
    self.convolve("conv_transpose", weight, bias, stride, padding, true)
  }

  pub fn conv1d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: usize, padding: usize) -> Result<Tensor> {
    self.convolve("conv1d", weight, bias, &[stride], &[padding], false)
  }

  /// 2D convolution of a `[batch, channels, height, width]` input.
  ///
  /// ```
  /// use densegrad::Tensor;
  ///
  /// let image = Tensor::ones(&[1, 1, 4, 4]);
  /// let kernel = Tensor::ones(&[2, 1, 3, 3]);
  /// let features = image.conv2d(&kernel, None, [1, 1], [1, 1]).unwrap();
  /// assert_eq!(features.shape(), &[1, 2, 4, 4]);
  /// ```

  pub fn conv2d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: [usize; 2], padding: [usize; 2]) -> Result<Tensor> {
    self.convolve("conv2d", weight, bias, &stride, &padding, false)
  }

  pub fn conv3d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: [usize; 3], padding: [usize; 3]) -> Result<Tensor> {
    self.convolve("conv3d", weight, bias, &stride, &padding, false)
  }

  pub fn conv_transpose1d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: usize, padding: usize) -> Result<Tensor> {
    self.convolve("conv_transpose1d", weight, bias, &[stride], &[padding], true)
  }

  pub fn conv_transpose2d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: [usize; 2], padding: [usize; 2]) -> Result<Tensor> {
    self.convolve("conv_transpose2d", weight, bias, &stride, &padding, true)
  }

  pub fn conv_transpose3d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: [usize; 3], padding: [usize; 3]) -> Result<Tensor> {
    self.convolve("conv_transpose3d", weight, bias, &stride, &padding, true)
  }

  fn convolve(&self, op: &'static str, weight: &Tensor, bias: Option<&Tensor>, stride: &[usize], padding: &[usize], transposed: bool) -> Result<Tensor> {
    let geometry = ConvGeometry::new(op, self.shape(), weight.shape(), bias.map(|b| b.shape() ), stride, padding, transposed)?;
    let data = self.read(|x| weight.read(|w| match bias {
      Some(bias) => bias.read(|b| geometry.forward(x, w, Some(b)) ),
      None => geometry.forward(x, w, None),
    }));
    let mut inputs = vec![self, weight];
    inputs.extend(bias);
    let dims = geometry.output_dims();
    Ok(Tensor::computed(&dims, data, &inputs, || Op::Conv(Box::new(geometry))))
  }
}


pub(crate) fn conv_backward(inputs: &[Tensor], grad: &Tensor, geometry: &ConvGeometry) -> Vec<Option<Tensor>> {
  let (x, w) = (&inputs[0], &inputs[1]);
  grad.read(|g| {
    let mut grads = vec![
      wants(inputs, 0).then(|| Tensor::build(x.shape(), w.read(|w| geometry.input_grad(g, w) )) ),
      wants(inputs, 1).then(|| Tensor::build(w.shape(), x.read(|x| geometry.weight_grad(g, x) )) ),
    ];
    if inputs.len() > 2 {
      grads.push(wants(inputs, 2).then(|| Tensor::build(&[geometry.out_channels], geometry.bias_grad(g)) ));
    }
    grads
  })
}
