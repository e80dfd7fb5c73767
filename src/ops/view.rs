use itertools::Itertools;

use crate::{
  internal::*,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
};


// Resolve a requested shape with at most one inferred (-1) dimension
fn resolve_dims(dims: &[isize], size: usize) -> Result<Vec<usize>> {
  if dims.is_empty() {
    return Err(Error::invalid_shape("reshape", "shape must have at least one dimension"))
  }
  if dims.iter().any(|&d| d == 0 || d < -1 ) {
    return Err(Error::invalid_shape("reshape", format!("invalid dimension in {dims:?}")))
  }
  let inferred: Vec<usize> = dims.iter().positions(|&d| d == -1 ).collect();
  if inferred.len() > 1 {
    return Err(Error::invalid_shape("reshape", format!("more than one inferred dimension in {dims:?}")))
  }
  let mut resolved: Vec<usize> = dims.iter().map(|&d| d.max(1) as usize ).collect();
  let known = element_count("reshape", &resolved)?;
  match inferred.first() {
    Some(&axis) if size % known == 0 => resolved[axis] = size / known,
    Some(_) => return Err(Error::shape_mismatch("reshape",
      format!("cannot infer a dimension of {dims:?} for {size} elements"))),
    None if known != size => return Err(Error::shape_mismatch("reshape",
      format!("{} holds {known} elements, got {size}", fmt_dims(&resolved)))),
    None => {},
  }
  Ok(resolved)
}

/// Gradient laid out as `dims`, sharing its buffer when possible.

fn reshape_grad(grad: &Tensor, dims: &[usize]) -> Tensor {
  match grad.layout().view(dims) {
    Some(shape) => grad.restrided(shape),
    None => Tensor::build(dims, grad.data()),
  }
}


impl Tensor {
  /// Same values under new dimensions. One dimension may be `-1` to be
  /// inferred from the element count.
  ///
  /// Contiguous tensors are reshaped as a view; others get copied.

  pub fn reshape(&self, dims: &[isize]) -> Result<Tensor> {
    let dims = resolve_dims(dims, self.numel())?;
    Ok(self.reshaped(&dims))
  }

  pub(crate) fn reshaped(&self, dims: &[usize]) -> Tensor {
    match self.layout().view(dims) {
      Some(shape) => self.view_with(shape, || Op::View),
      None => Tensor::computed(dims, self.data(), &[self], || Op::View),
    }
  }

  /// Collapse all but the first dimension, keeping a batch axis.
  /// Rank-1 tensors stay as they are.

  pub fn flatten(&self) -> Tensor {
    let dims = self.shape();
    if dims.len() < 2 { return self.reshaped(dims) }
    self.reshaped(&[dims[0], dims[1..].iter().product()])
  }

  /// Swap two dimensions as a strided view.

  pub fn transpose(&self, dim1: isize, dim2: isize) -> Result<Tensor> {
    let d1 = axis_index("transpose", dim1, self.rank())?;
    let d2 = axis_index("transpose", dim2, self.rank())?;
    Ok(self.view_with(self.layout().transpose(d1, d2), || Op::Transpose { d1, d2 }))
  }

  /// Matrix transpose of a rank-2 tensor.

  pub fn t(&self) -> Result<Tensor> {
    ensure_rank("t", self.shape(), 2)?;
    self.transpose(0, 1)
  }

  /// Remove the given size-1 axes, or every size-1 axis when `axes`
  /// is empty. A fully squeezed tensor keeps the shape `[1]`.

  pub fn squeeze(&self, axes: &[isize]) -> Result<Tensor> {
    let dims = self.shape();
    let remove: Vec<usize> = if axes.is_empty() {
      dims.iter().positions(|&n| n == 1 ).collect()
    } else {
      axes.iter().map(|&axis| {
        let axis = axis_index("squeeze", axis, dims.len())?;
        if dims[axis] != 1 {
          return Err(Error::invalid_shape("squeeze",
            format!("axis {axis} of {} has size {}", fmt_dims(dims), dims[axis])))
        }
        Ok(axis)
      }).collect::<Result<_>>()?
    };
    Ok(self.view_with(self.layout().squeeze_axes(&remove), || Op::View))
  }

  /// Insert a size-1 axis at `axis`, which may be one past the last axis.

  pub fn unsqueeze(&self, axis: isize) -> Result<Tensor> {
    let axis = insert_index("unsqueeze", axis, self.rank())?;
    Ok(self.view_with(self.layout().unsqueeze(axis), || Op::View))
  }

  /// `len` consecutive entries along `axis` starting at `start`, as a view.

  pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor> {
    let axis = axis_index("narrow", axis, self.rank())?;
    if len == 0 {
      return Err(Error::invalid_shape("narrow", "length must be positive"))
    }
    let size = self.shape()[axis];
    match start.checked_add(len) {
      Some(end) if end <= size => {},
      Some(end) => return Err(Error::out_of_range("narrow",
        format!("{start}..{end} exceeds axis {axis} of size {size}"))),
      None => return Err(Error::out_of_range("narrow",
        format!("{start} + {len} overflows axis {axis} of size {size}"))),
    }
    Ok(self.view_with(self.layout().narrow(axis, start, len), || Op::Narrow { axis, start }))
  }

  /// Rows `start..start + rows` of a rank-2 tensor, as a view.

  pub fn slice_rows(&self, start: usize, rows: usize) -> Result<Tensor> {
    ensure_rank("slice_rows", self.shape(), 2)?;
    self.narrow(0, start, rows)
  }
}


pub(crate) fn view_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  vec![Some(reshape_grad(grad, inputs[0].shape()))]
}

pub(crate) fn transpose_backward(grad: &Tensor, d1: usize, d2: usize) -> Vec<Option<Tensor>> {
  vec![Some(grad.restrided(grad.layout().transpose(d1, d2)))]
}

/// Place the gradient of a window back into zeros of the full input.

pub(crate) fn narrow_backward(inputs: &[Tensor], grad: &Tensor, axis: usize, start: usize) -> Vec<Option<Tensor>> {
  let full = Tensor::zeros(inputs[0].shape());
  let window = full.restrided(full.layout().narrow(axis, start, grad.shape()[axis]));
  grad.read(|g| window.update(|i, _| g[i] ));
  vec![Some(full)]
}
