use crate::internal::fmt_dims;


/// Layout of a [Tensor](crate::Tensor) inside its buffer.
///
/// Views share one buffer and differ only in their `Shape`: strides may be
/// zero (broadcast) or arbitrary (transpose, narrow), and `offset` locates
/// the first element.

#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
  pub dims: Vec<usize>,
  pub(crate) strides: Vec<isize>,
  pub(crate) offset: usize,
}

impl Shape {
  pub fn new(dims: &[usize]) -> Self {
    Self {
      dims: dims.to_vec(),
      strides: Self::make_strides(dims),
      offset: 0,
    }
  }

  pub(crate) fn make_strides(dims: &[usize]) -> Vec<isize> {
    if dims.is_empty() { return vec![] }
    let mut strides = vec![0; dims.len()];
    strides[dims.len() - 1] = 1;
    for i in (1..dims.len()).rev() {
      strides[i - 1] = dims[i] as isize * strides[i];
    }
    strides
  }

  pub fn size(&self) -> usize {
    self.dims.iter().product()
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  pub fn strides(&self) -> &[isize] {
    &self.strides
  }

  /// Whether elements are laid out densely in row-major order. Strides of
  /// size-1 dimensions never get used and are ignored.

  pub fn is_contiguous(&self) -> bool {
    let expected = Self::make_strides(&self.dims);
    self.dims.iter().zip(&self.strides).zip(&expected).all(|((&n, &s), &e)| n == 1 || s == e )
  }

  /// Buffer positions of all elements in row-major order.

  pub fn iter(&self) -> Box<dyn Iterator<Item=usize> + '_> {
    if self.is_contiguous() {
      Box::new(self.offset..self.offset + self.size())
    } else {
      Box::new(ShapeIterator::new(self))
    }
  }

  /// Reinterpret a contiguous layout with new dimensions.

  pub(crate) fn view(&self, dims: &[usize]) -> Option<Self> {
    if !self.is_contiguous() || dims.iter().product::<usize>() != self.size() { return None }
    Some(Self { dims: dims.to_vec(), strides: Self::make_strides(dims), offset: self.offset })
  }

  pub(crate) fn narrow(&self, axis: usize, start: usize, len: usize) -> Self {
    let mut shape = self.clone();
    shape.offset = (self.offset as isize + self.strides[axis] * start as isize) as usize;
    shape.dims[axis] = len;
    shape
  }

  pub(crate) fn squeeze_axes(&self, axes: &[usize]) -> Self {
    let mut dims = vec![];
    let mut strides = vec![];
    for (d, &n) in self.dims.iter().enumerate() {
      if !axes.contains(&d) {
        dims.push(n);
        strides.push(self.strides[d]);
      }
    }
    // Keep at least one dimension
    if dims.is_empty() {
      dims.push(1);
      strides.push(1);
    }
    Self { dims, strides, offset: self.offset }
  }

  pub(crate) fn unsqueeze(&self, axis: usize) -> Self {
    let mut shape = self.clone();
    shape.strides.insert(axis, if axis < shape.dims.len() {
      shape.strides[axis].abs() * shape.dims[axis] as isize
    } else { 1 });
    shape.dims.insert(axis, 1);
    shape
  }

  /// Expand to `target`, aligning dimensions from the right. Expanded
  /// and prepended dimensions get stride zero.

  pub(crate) fn broadcast_to(&self, target: &[usize]) -> Option<Self> {
    if target.len() < self.rank() { return None }
    let lead = target.len() - self.rank();
    let mut strides = vec![0; target.len()];
    for (d, (&n, &stride)) in self.dims.iter().zip(&self.strides).enumerate() {
      let t = target[lead + d];
      if n == t {
        strides[lead + d] = stride;
      } else if n != 1 {
        return None
      }
    }
    Some(Self { dims: target.to_vec(), strides, offset: self.offset })
  }

  pub(crate) fn transpose(&self, dim1: usize, dim2: usize) -> Self {
    let mut shape = self.clone();
    shape.dims.swap(dim1, dim2);
    shape.strides.swap(dim1, dim2);
    shape
  }
}

impl std::fmt::Display for Shape {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Shape{}", fmt_dims(&self.dims))
  }
}


/// Iterate through a [Shape]'s buffer positions.

pub struct ShapeIterator<'a> {
  shape: &'a Shape,
  counter: Vec<usize>,
  idx: isize,
  finished: bool,
}

impl<'a> ShapeIterator<'a> {
  fn new(shape: &'a Shape) -> Self {
    Self {
      counter: vec![0; shape.rank()],
      idx: shape.offset as isize,
      finished: shape.size() == 0,
      shape,
    }
  }
}

impl<'a> Iterator for ShapeIterator<'a> {
  type Item = usize;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished { return None }
    let out = self.idx as usize;
    // Odometer over dimensions, rightmost fastest
    for d in (0..self.counter.len()).rev() {
      if self.counter[d] + 1 < self.shape.dims[d] {
        self.counter[d] += 1;
        self.idx += self.shape.strides[d];
        return Some(out)
      }
      self.idx -= (self.shape.dims[d] as isize - 1) * self.shape.strides[d];
      self.counter[d] = 0;
    }
    self.finished = true;
    Some(out)
  }
}
