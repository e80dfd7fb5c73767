use crate::{
  internal::*,
  parallel,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
  ops::conv::receptive_field,
};


/// Window placement of a 2D pooling over `[batch, channels, height, width]`.

#[derive(Debug, Clone)]
pub(crate) struct PoolGeometry {
  pub planes: usize,
  pub input: [usize; 2],
  pub output: [usize; 2],
  pub kernel: [usize; 2],
  pub stride: [usize; 2],
  pub padding: [usize; 2],
}

impl PoolGeometry {
  fn new(op: &'static str, dims: &[usize], kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Result<Self> {
    ensure_rank(op, dims, 4)?;
    if kernel.contains(&0) || stride.contains(&0) {
      return Err(Error::invalid_shape(op,
        format!("kernel {} and stride {} must be positive", fmt_dims(&kernel), fmt_dims(&stride))))
    }
    let mut output = [0; 2];
    for d in 0..2 {
      let span = dims[2 + d] as isize + 2 * padding[d] as isize - kernel[d] as isize;
      if span < 0 {
        return Err(Error::invalid_shape(op, format!("input {} with kernel {} and padding {} leaves no output",
          fmt_dims(dims), fmt_dims(&kernel), fmt_dims(&padding))))
      }
      output[d] = span as usize / stride[d] + 1;
    }
    Ok(Self {
      planes: dims[0] * dims[1],
      input: [dims[2], dims[3]],
      output,
      kernel,
      stride,
      padding,
    })
  }

  fn input_size(&self) -> usize {
    self.input[0] * self.input[1]
  }

  fn output_size(&self) -> usize {
    self.output[0] * self.output[1]
  }

  fn kernel_size(&self) -> usize {
    self.kernel[0] * self.kernel[1]
  }

  /// Window taps, checked to overlap the input everywhere.

  fn taps(&self, op: &'static str) -> Result<Vec<Option<usize>>> {
    let taps = receptive_field(&self.output, &self.kernel, &self.input, &self.stride, &self.padding);
    if taps.chunks(self.kernel_size()).any(|window| window.iter().all(Option::is_none) ) {
      return Err(Error::invalid_shape(op,
        format!("padding {} leaves a window without input", fmt_dims(&self.padding))))
    }
    Ok(taps)
  }

  fn output_dims(&self, dims: &[usize]) -> Vec<usize> {
    vec![dims[0], dims[1], self.output[0], self.output[1]]
  }
}


impl Tensor {
  /// 2D max pooling. The gradient of every window flows to the first
  /// occurrence of its maximum.

  pub fn max_pool2d(&self, kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Result<Tensor> {
    let geometry = PoolGeometry::new("max_pool2d", self.shape(), kernel, stride, padding)?;
    let taps = geometry.taps("max_pool2d")?;
    let (in_size, out_size, k_size) = (geometry.input_size(), geometry.output_size(), geometry.kernel_size());
    // Winning input position per window, then its value
    let (winners, data) = self.read(|x| {
      let mut winners = vec![0.0; geometry.planes * out_size];
      parallel::split(&mut winners, out_size, |first, planes| {
        for (u, plane) in planes.chunks_mut(out_size).enumerate() {
          let base = (first + u) * in_size;
          for (o, winner) in plane.iter_mut().enumerate() {
            let mut best: Option<usize> = None;
            for p in taps[o * k_size..][..k_size].iter().flatten() {
              if best.map_or(true, |b| x[base + p] > x[base + b] ) { best = Some(*p) }
            }
            *winner = (base + best.unwrap_or(0)) as f64;
          }
        }
      });
      let winners: Vec<usize> = winners.into_iter().map(|w| w as usize ).collect();
      let data = winners.iter().map(|&i| x[i] ).collect();
      (winners, data)
    });
    let dims = geometry.output_dims(self.shape());
    Ok(Tensor::computed(&dims, data, &[self], || Op::MaxPool2d { indices: winners }))
  }

  /// 2D average pooling. Windows that hang over the border average only
  /// the elements they cover.

  pub fn avg_pool2d(&self, kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Result<Tensor> {
    let geometry = PoolGeometry::new("avg_pool2d", self.shape(), kernel, stride, padding)?;
    let taps = geometry.taps("avg_pool2d")?;
    let (in_size, out_size, k_size) = (geometry.input_size(), geometry.output_size(), geometry.kernel_size());
    let data = self.read(|x| {
      let mut out = vec![0.0; geometry.planes * out_size];
      parallel::split(&mut out, out_size, |first, planes| {
        for (u, plane) in planes.chunks_mut(out_size).enumerate() {
          let xs = &x[(first + u) * in_size..][..in_size];
          for (o, value) in plane.iter_mut().enumerate() {
            let window = &taps[o * k_size..][..k_size];
            let count = window.iter().flatten().count();
            *value = window.iter().flatten().map(|&p| xs[p] ).sum::<f64>() / count as f64;
          }
        }
      });
      out
    });
    let dims = geometry.output_dims(self.shape());
    Ok(Tensor::computed(&dims, data, &[self], || Op::AvgPool2d(Box::new(geometry))))
  }
}


pub(crate) fn max_pool_backward(inputs: &[Tensor], grad: &Tensor, indices: &[usize]) -> Vec<Option<Tensor>> {
  let dims = inputs[0].shape();
  let planes = dims[0] * dims[1];
  let in_size = dims[2] * dims[3];
  let out_size = indices.len() / planes;
  let data = grad.read(|g| {
    let mut out = vec![0.0; planes * in_size];
    // Windows only ever pick from their own plane
    parallel::split(&mut out, in_size, |first, slabs| {
      for (u, slab) in slabs.chunks_mut(in_size).enumerate() {
        let plane = first + u;
        for o in plane * out_size..(plane + 1) * out_size {
          slab[indices[o] - plane * in_size] += g[o];
        }
      }
    });
    out
  });
  vec![Some(Tensor::build(dims, data))]
}

pub(crate) fn avg_pool_backward(inputs: &[Tensor], grad: &Tensor, geometry: &PoolGeometry) -> Vec<Option<Tensor>> {
  let taps = receptive_field(&geometry.output, &geometry.kernel, &geometry.input, &geometry.stride, &geometry.padding);
  let (in_size, out_size, k_size) = (geometry.input_size(), geometry.output_size(), geometry.kernel_size());
  let data = grad.read(|g| {
    let mut out = vec![0.0; geometry.planes * in_size];
    parallel::split(&mut out, in_size, |first, slabs| {
      for (u, slab) in slabs.chunks_mut(in_size).enumerate() {
        let gs = &g[(first + u) * out_size..][..out_size];
        for (o, &gv) in gs.iter().enumerate() {
          let window = &taps[o * k_size..][..k_size];
          let share = gv / window.iter().flatten().count() as f64;
          for &p in window.iter().flatten() {
            slab[p] += share;
          }
        }
      }
    });
    out
  });
  vec![Some(Tensor::build(inputs[0].shape(), data))]
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn max_pool_routes_to_maximum() {
    let x = Tensor::new(&[1,1,2,3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap().trained();
    let y = x.max_pool2d([2,2], [1,1], [0,0]).unwrap();
    assert_eq!(y.shape(), &[1,1,1,2]);
    assert_eq!(y.data(), vec![5.0, 6.0]);
    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
  }

  #[test]
  fn overlapping_windows_accumulate() {
    let x = Tensor::new(&[1,1,1,3], vec![0.0, 9.0, 1.0]).unwrap().trained();
    let y = x.max_pool2d([1,2], [1,1], [0,0]).unwrap();
    assert_eq!(y.data(), vec![9.0, 9.0]);
    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![0.0, 2.0, 0.0]);
  }

  #[test]
  fn max_pool_with_padding_ignores_border() {
    let x = Tensor::new(&[1,1,2,2], vec![-1.0, -2.0, -3.0, -4.0]).unwrap();
    let y = x.max_pool2d([2,2], [2,2], [1,1]).unwrap();
    assert_eq!(y.shape(), &[1,1,2,2]);
    assert_eq!(y.data(), vec![-1.0, -2.0, -3.0, -4.0]);
  }

  #[test]
  fn avg_pool_partial_windows() {
    let x = Tensor::new(&[1,1,2,2], vec![1.0, 2.0, 3.0, 4.0]).unwrap().trained();
    let y = x.avg_pool2d([2,2], [1,1], [1,1]).unwrap();
    assert_eq!(y.shape(), &[1,1,3,3]);
    assert_eq!(y.data(), vec![1.0, 1.5, 2.0, 2.0, 2.5, 3.0, 3.0, 3.5, 4.0]);
    y.sum().backward().unwrap();
    // Corner element: 1 + 1/2 + 1/2 + 1/4
    assert_eq!(x.grad().unwrap().data(), vec![2.25; 4]);
  }

  #[test]
  fn multiple_planes() {
    let x = Tensor::arange(&[2,2,2,2], 0.0, 1.0);
    let y = x.avg_pool2d([2,2], [2,2], [0,0]).unwrap();
    assert_eq!(y.shape(), &[2,2,1,1]);
    assert_eq!(y.data(), vec![1.5, 5.5, 9.5, 13.5]);
    let y = x.max_pool2d([2,2], [2,2], [0,0]).unwrap();
    assert_eq!(y.data(), vec![3.0, 7.0, 11.0, 15.0]);
  }

  #[test]
  fn rejects_bad_geometry() {
    let x = Tensor::ones(&[1,1,2,2]);
    assert!(matches!(x.max_pool2d([0,2], [1,1], [0,0]), Err(Error::InvalidShape { .. })));
    assert!(matches!(x.avg_pool2d([2,2], [1,0], [0,0]), Err(Error::InvalidShape { .. })));
    assert!(matches!(x.avg_pool2d([3,3], [1,1], [0,0]), Err(Error::InvalidShape { .. })));
    assert!(matches!(x.avg_pool2d([1,1], [1,1], [1,1]), Err(Error::InvalidShape { .. })));
    assert!(matches!(Tensor::ones(&[2,2]).max_pool2d([1,1], [1,1], [0,0]), Err(Error::ShapeMismatch { .. })));
  }
}
