use std::rc::Rc;
use std::cell::{ Cell, RefCell };
use std::sync::atomic::{ AtomicUsize, Ordering };

use rand::Rng;

use crate::{
  internal::*,
  shape::Shape,
  autograd::Op,
  error::{ Error, Result },
};


/// Values shared by a tensor and all of its views. Every write through
/// [update](Tensor::update) bumps the version.

pub(crate) struct Storage {
  values: RefCell<Vec<f64>>,
  version: Cell<usize>,
}

pub(crate) type Buffer = Rc<Storage>;

fn storage(values: Vec<f64>) -> Buffer {
  Rc::new(Storage { values: RefCell::new(values), version: Cell::new(0) })
}

fn make_id() -> usize {
  static LAST_ID: AtomicUsize = AtomicUsize::new(0);
  LAST_ID.fetch_add(1, Ordering::Relaxed)
}


/// Operation that produced a tensor, together with the inputs it consumed.

pub(crate) struct GradFn {
  pub(crate) op: Op,
  pub(crate) inputs: Vec<Tensor>,
  // Storage versions of the inputs, then the output, at recording time
  versions: Vec<usize>,
}


struct Node {
  id: usize,
  shape: Shape,
  data: Buffer,
  requires_grad: Cell<bool>,
  grad: RefCell<Option<Tensor>>,
  grad_fn: Option<GradFn>,
}

// Long chains would otherwise drop one node per stack frame
impl Drop for Node {
  fn drop(&mut self) {
    let Some(grad_fn) = self.grad_fn.as_mut() else { return };
    let mut orphans = std::mem::take(&mut grad_fn.inputs);
    while let Some(tensor) = orphans.pop() {
      if let Ok(mut node) = Rc::try_unwrap(tensor.node) {
        if let Some(grad_fn) = node.grad_fn.as_mut() {
          orphans.append(&mut grad_fn.inputs);
        }
      }
    }
  }
}


/// Multidimensional array of `f64` that may take part in automatic
/// differentiation.
///
/// Cloning a tensor clones the handle: both clones share identity, data
/// and gradient. Views created by [reshape](Tensor::reshape),
/// [transpose](Tensor::transpose), [broadcast_to](Tensor::broadcast_to) and
/// friends share the buffer of their source.
///
/// Any operation with at least one input that [requires
/// gradients](Tensor::requires_grad) records itself on its output, so that
/// [backward](Tensor::backward) can later replay the graph in reverse.

#[derive(Clone)]
pub struct Tensor {
  node: Rc<Node>,
}

impl Tensor {
  pub(crate) fn from_shape(shape: Shape, data: Buffer) -> Self {
    Self::with_grad_fn(shape, data, None)
  }

  fn with_grad_fn(shape: Shape, data: Buffer, grad_fn: Option<GradFn>) -> Self {
    Self {
      node: Rc::new(Node {
        id: make_id(),
        requires_grad: Cell::new(grad_fn.is_some()),
        grad: RefCell::new(None),
        shape,
        data,
        grad_fn,
      }),
    }
  }

  /// Untracked contiguous tensor. Dimensions are trusted.

  pub(crate) fn build(dims: &[usize], data: Vec<f64>) -> Self {
    debug_assert_eq!(dims.iter().product::<usize>(), data.len());
    Self::from_shape(Shape::new(dims), storage(data))
  }

  /// Output of an operation. The operation only gets recorded if
  /// any of its inputs requires gradients.

  pub(crate) fn operation(shape: Shape, data: Buffer, inputs: &[&Tensor], op: impl FnOnce() -> Op) -> Self {
    let tracked = inputs.iter().any(|input| input.requires_grad() );
    let grad_fn = tracked.then(|| GradFn {
      op: op(),
      inputs: inputs.iter().map(|&input| input.clone() ).collect(),
      versions: inputs.iter().map(|input| input.version() ).chain([data.version.get()]).collect(),
    });
    Self::with_grad_fn(shape, data, grad_fn)
  }

  pub(crate) fn computed(dims: &[usize], data: Vec<f64>, inputs: &[&Tensor], op: impl FnOnce() -> Op) -> Self {
    debug_assert_eq!(dims.iter().product::<usize>(), data.len());
    Self::operation(Shape::new(dims), storage(data), inputs, op)
  }

  /// Like [computed](Self::computed), for operations that keep
  /// their own output for the backward pass.

  pub(crate) fn computed_with_output(dims: &[usize], data: Vec<f64>, inputs: &[&Tensor], op: impl FnOnce(Tensor) -> Op) -> Self {
    let shape = Shape::new(dims);
    let data = storage(data);
    let output = Self::from_shape(shape.clone(), data.clone());
    Self::operation(shape, data, inputs, || op(output) )
  }

  /// View of this tensor's buffer under a different layout.

  pub(crate) fn view_with(&self, shape: Shape, op: impl FnOnce() -> Op) -> Self {
    Self::operation(shape, self.node.data.clone(), &[self], op)
  }

  /// Untracked handle on this tensor's buffer under another layout.

  pub(crate) fn restrided(&self, shape: Shape) -> Self {
    Self::from_shape(shape, self.node.data.clone())
  }

  pub(crate) fn grad_fn(&self) -> Option<&GradFn> {
    self.node.grad_fn.as_ref()
  }

  fn version(&self) -> usize {
    self.node.data.version.get()
  }

  /// Fails if a buffer the recording operation saved was written to since.

  pub(crate) fn ensure_unmodified(&self) -> Result<()> {
    let Some(grad_fn) = self.grad_fn() else { return Ok(()) };
    let current = grad_fn.inputs.iter().map(|input| input.version() ).chain([self.version()]);
    if !current.eq(grad_fn.versions.iter().copied()) {
      return Err(Error::invariant(grad_fn.op.name(), "a tensor needed for the backward pass was modified in place"))
    }
    Ok(())
  }

  /// Create a tensor from row-major `data`.

  pub fn new(shape: &[usize], data: Vec<f64>) -> Result<Self> {
    let size = check_dims("new", shape)?;
    if size != data.len() {
      return Err(Error::shape_mismatch("new",
        format!("{} holds {size} elements, got {}", fmt_dims(shape), data.len())))
    }
    Ok(Self::build(shape, data))
  }

  pub fn scalar(value: f64) -> Self {
    Self::build(&[1], vec![value])
  }

  /// # Panics
  /// If `values` is empty. [new](Self::new) reports that as an error instead.

  pub fn vec(values: &[f64]) -> Self {
    assert!(!values.is_empty(), "Cannot create tensor from empty slice");
    Self::build(&[values.len()], values.to_vec())
  }

  /// # Panics
  /// If `shape` is empty or contains a zero.

  pub fn full(shape: &[usize], value: f64) -> Self {
    match check_dims("full", shape) {
      Ok(size) => Self::build(shape, vec![value; size]),
      Err(err) => panic!("{err}"),
    }
  }

  pub fn zeros(shape: &[usize]) -> Self {
    Self::full(shape, 0.0)
  }

  pub fn ones(shape: &[usize]) -> Self {
    Self::full(shape, 1.0)
  }

  pub fn arange(shape: &[usize], start: f64, step: f64) -> Self {
    let tensor = Self::zeros(shape);
    tensor.update(|i, _| start + i as f64 * step );
    tensor
  }

  /// Standard normal samples drawn from `rng`.

  pub fn random_normal(shape: &[usize], rng: &mut impl Rng) -> Self {
    let tensor = Self::zeros(shape);
    let len = tensor.numel();
    {
      let mut data = tensor.node.data.values.borrow_mut();
      for j in (0..len).step_by(2) {
        let (r1, r2) = randn(rng);
        data[j] = r1;
        if j + 1 < len { data[j + 1] = r2 }
      }
    }
    tensor
  }

  /// Samples drawn uniformly from `[low, high)`.

  pub fn random_uniform(shape: &[usize], low: f64, high: f64, rng: &mut impl Rng) -> Result<Self> {
    let size = check_dims("random_uniform", shape)?;
    if !(low < high) || !(high - low).is_finite() {
      return Err(Error::unsupported("random_uniform", format!("empty or unbounded range {low}..{high}")))
    }
    let data = (0..size).map(|_| rng.gen_range(low, high) ).collect();
    Ok(Self::build(shape, data))
  }

  pub fn id(&self) -> usize {
    self.node.id
  }

  pub fn shape(&self) -> &[usize] {
    &self.node.shape.dims
  }

  pub fn layout(&self) -> &Shape {
    &self.node.shape
  }

  pub fn strides(&self) -> &[isize] {
    &self.node.shape.strides
  }

  pub fn rank(&self) -> usize {
    self.node.shape.rank()
  }

  pub fn numel(&self) -> usize {
    self.node.shape.size()
  }

  pub fn is_contiguous(&self) -> bool {
    self.node.shape.is_contiguous()
  }

  /// Whether both tensors read from the same buffer.

  pub fn shares_storage(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.node.data, &other.node.data)
  }

  /// Call `f` with this tensor's values in row-major order. Views
  /// that are not contiguous get gathered into a temporary first.

  pub(crate) fn read<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
    let shape = &self.node.shape;
    let data = self.node.data.values.borrow();
    if shape.is_contiguous() {
      f(&data[shape.offset..shape.offset + shape.size()])
    } else {
      let values: Vec<f64> = shape.iter().map(|i| data[i] ).collect();
      drop(data);
      f(&values)
    }
  }

  /// Copy of all values in row-major order.

  pub fn data(&self) -> Vec<f64> {
    self.read(|data| data.to_vec() )
  }

  /// The single value of a one-element tensor.

  pub fn item(&self) -> Result<f64> {
    if self.numel() != 1 {
      return Err(Error::shape_mismatch("item",
        format!("expected a single element, got {}", fmt_dims(self.shape()))))
    }
    Ok(self.node.data.values.borrow()[self.node.shape.offset])
  }

  /// Overwrite all values in place. Views write through to their source.

  pub fn set_data(&self, values: &[f64]) -> Result<()> {
    if values.len() != self.numel() {
      return Err(Error::shape_mismatch("set_data",
        format!("{} holds {} elements, got {}", fmt_dims(self.shape()), self.numel(), values.len())))
    }
    self.update(|i, _| values[i] );
    Ok(())
  }

  /// Copy the values of `src` into `dst`. Both need identical dimensions.

  pub fn copy_into(dst: &Tensor, src: &Tensor) -> Result<()> {
    ensure_same_shape("copy_into", dst.shape(), src.shape())?;
    dst.set_data(&src.data())
  }

  // Rewrite every element through this tensor's layout
  pub(crate) fn update(&self, mut cb: impl FnMut(usize, f64) -> f64) {
    let storage = &self.node.data;
    storage.version.set(storage.version.get() + 1);
    let mut data = storage.values.borrow_mut();
    for (n, i) in self.node.shape.iter().enumerate() {
      let value = cb(n, data[i]);
      data[i] = value;
    }
  }

  /// Value-identical copy with a fresh buffer, cut off from the graph.

  pub fn detach(&self) -> Self {
    Self::build(self.shape(), self.data())
  }

  pub fn requires_grad(&self) -> bool {
    self.node.requires_grad.get()
  }

  pub fn set_requires_grad(&self, requires_grad: bool) {
    self.node.requires_grad.set(requires_grad);
  }

  /// Mark this tensor as a parameter whose gradient should be computed.

  pub fn trained(self) -> Self {
    self.set_requires_grad(true);
    self
  }

  /// Copy of the gradient accumulated so far.

  pub fn grad(&self) -> Option<Tensor> {
    self.node.grad.borrow().as_ref().map(|grad| grad.detach() )
  }

  pub fn zero_grad(&self) {
    self.node.grad.replace(None);
  }

  pub(crate) fn accumulate_grad(&self, incoming: &Tensor) {
    let mut slot = self.node.grad.borrow_mut();
    match slot.as_ref() {
      Some(grad) => {
        let incoming = incoming.data();
        grad.update(|i, a| a + incoming[i] );
      },
      None => *slot = Some(incoming.detach()),
    }
  }

  /// Multiply all values by `factor` in place.

  pub fn scale(&self, factor: f64) {
    self.update(|_, a| a * factor );
  }

  /// In-place `self += alpha * other`.

  pub fn add_scaled(&self, other: &Tensor, alpha: f64) -> Result<()> {
    ensure_same_shape("add_scaled", self.shape(), other.shape())?;
    let other = other.data();
    self.update(|i, a| a + alpha * other[i] );
    Ok(())
  }

  pub fn mul_in_place(&self, other: &Tensor) -> Result<()> {
    ensure_same_shape("mul_in_place", self.shape(), other.shape())?;
    let other = other.data();
    self.update(|i, a| a * other[i] );
    Ok(())
  }

  /// Sum of `|g|^norm` over the accumulated gradient, or zero without one.

  pub fn grad_pow_sum(&self, norm: f64) -> f64 {
    match self.node.grad.borrow().as_ref() {
      Some(grad) => grad.read(|g| g.iter().map(|v| v.abs().powf(norm) ).sum() ),
      None => 0.0,
    }
  }

  pub fn scale_grad(&self, factor: f64) {
    if let Some(grad) = self.node.grad.borrow().as_ref() {
      grad.scale(factor);
    }
  }

  /// Clamp gradient values to `[-limit, limit]`. Non-positive limits are ignored.

  pub fn clip_grad_value(&self, limit: f64) {
    if limit <= 0.0 { return }
    if let Some(grad) = self.node.grad.borrow().as_ref() {
      grad.update(|_, g| g.clamp(-limit, limit) );
    }
  }
}

impl PartialEq for Tensor {
  fn eq(&self, rhs: &Self) -> bool {
    self.shape() == rhs.shape() && self.data() == rhs.data()
  }
}

impl std::fmt::Debug for Tensor {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    f.debug_struct("Tensor")
      .field("id", &self.id())
      .field("shape", &self.shape())
      .field("requires_grad", &self.requires_grad())
      .field("op", &self.grad_fn().map(|grad_fn| grad_fn.op.name() ))
      .finish()
  }
}

impl std::fmt::Display for Tensor {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Tensor{} ", fmt_dims(self.shape()))?;
    self.read(|data| print_chunks(0, self.shape(), data, f) )
  }
}

fn print_chunks(idx: usize, dims: &[usize], vec: &[f64], f: &mut std::fmt::Formatter) -> std::fmt::Result {
  let indent = " ".repeat(idx * 2);
  if idx == dims.len() - 1 {
    writeln!(f, "{indent}{:?}", vec)?;
  } else {
    writeln!(f, "{indent}[")?;
    for chunk in vec.chunks(vec.len() / dims[idx]) {
      print_chunks(idx + 1, dims, chunk, f)?;
    }
    writeln!(f, "{indent}]")?;
  }
  Ok(())
}


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ SeedableRng, rngs::StdRng };

  #[test]
  fn construction() {
    let t = Tensor::new(&[2,3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert_eq!(t.shape(), &[2,3]);
    assert_eq!(t.strides(), &[3,1]);
    assert_eq!(t.numel(), 6);
    assert!(!t.requires_grad());
    assert!(t.grad().is_none());
  }

  #[test]
  fn construction_errors() {
    assert!(matches!(Tensor::new(&[2,3], vec![1.0; 5]), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(Tensor::new(&[2,0], vec![]), Err(Error::InvalidShape { .. })));
    assert!(matches!(Tensor::new(&[], vec![1.0]), Err(Error::InvalidShape { .. })));
    assert!(matches!(Tensor::new(&[usize::MAX, 2], vec![1.0]), Err(Error::InvalidShape { .. })));
  }

  #[test]
  #[should_panic(expected = "too many elements")]
  fn oversized_full_panics() {
    Tensor::ones(&[usize::MAX, 3]);
  }

  #[test]
  #[should_panic(expected = "empty slice")]
  fn empty_vec_panics() {
    Tensor::vec(&[]);
  }

  #[test]
  #[should_panic]
  fn zero_dimension_panics() {
    Tensor::zeros(&[3, 0]);
  }

  #[test]
  fn factories() {
    assert_eq!(Tensor::ones(&[2]).data(), vec![1.0, 1.0]);
    assert_eq!(Tensor::full(&[1,2], 7.0).data(), vec![7.0, 7.0]);
    assert_eq!(Tensor::arange(&[4], 1.0, 0.5).data(), vec![1.0, 1.5, 2.0, 2.5]);

    let mut rng = StdRng::seed_from_u64(1);
    let a = Tensor::random_normal(&[3, 3], &mut rng);
    let mut rng = StdRng::seed_from_u64(1);
    let b = Tensor::random_normal(&[3, 3], &mut rng);
    assert_eq!(a, b);

    let u = Tensor::random_uniform(&[100], -2.0, 2.0, &mut rng).unwrap();
    assert!(u.data().iter().all(|&v| (-2.0..2.0).contains(&v) ));
  }

  #[test]
  fn uniform_range_errors() {
    let mut rng = StdRng::seed_from_u64(1);
    assert!(matches!(Tensor::random_uniform(&[3], 1.0, 1.0, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(Tensor::random_uniform(&[3], 2.0, -2.0, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(Tensor::random_uniform(&[3], f64::NAN, 1.0, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(Tensor::random_uniform(&[3], 0.0, f64::INFINITY, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(Tensor::random_uniform(&[0], 0.0, 1.0, &mut rng), Err(Error::InvalidShape { .. })));
  }

  #[test]
  fn data_is_a_copy() {
    let t = Tensor::vec(&[1.0, 2.0]);
    let mut data = t.data();
    data[0] = 10.0;
    assert_eq!(t.data(), vec![1.0, 2.0]);
  }

  #[test]
  fn set_data_and_copy_into() {
    let t = Tensor::zeros(&[2,2]);
    t.set_data(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(t.data(), vec![1.0, 2.0, 3.0, 4.0]);
    assert!(t.set_data(&[1.0]).is_err());

    let dst = Tensor::zeros(&[2,2]);
    Tensor::copy_into(&dst, &t).unwrap();
    assert_eq!(dst, t);
    assert!(!dst.shares_storage(&t));
    assert!(matches!(Tensor::copy_into(&Tensor::zeros(&[4]), &t), Err(Error::ShapeMismatch { .. })));
  }

  #[test]
  fn writes_bump_shared_version() {
    let x = Tensor::arange(&[2,2], 0.0, 1.0);
    let t = x.t().unwrap();
    let before = x.version();
    t.scale(2.0);
    assert_eq!(x.version(), before + 1);
    x.set_data(&[0.0; 4]).unwrap();
    assert_eq!(t.version(), before + 2);
    assert_eq!(x.detach().version(), 0);
  }

  #[test]
  fn item() {
    assert_eq!(Tensor::scalar(3.5).item().unwrap(), 3.5);
    assert!(Tensor::zeros(&[2]).item().is_err());
  }

  #[test]
  fn detach_cuts_graph() {
    let x = Tensor::vec(&[1.0, 2.0]).trained();
    let y = x.detach();
    assert!(!y.requires_grad());
    assert!(!y.shares_storage(&x));
    assert_eq!(y.data(), x.data());
  }

  #[test]
  fn in_place_updates() {
    let w = Tensor::vec(&[1.0, 2.0, 3.0]);
    w.scale(2.0);
    assert_eq!(w.data(), vec![2.0, 4.0, 6.0]);
    w.add_scaled(&Tensor::vec(&[1.0, 1.0, 1.0]), -0.5).unwrap();
    assert_eq!(w.data(), vec![1.5, 3.5, 5.5]);
    w.mul_in_place(&Tensor::vec(&[2.0, 0.0, 1.0])).unwrap();
    assert_eq!(w.data(), vec![3.0, 0.0, 5.5]);
    assert!(w.add_scaled(&Tensor::zeros(&[2]), 1.0).is_err());
  }

  #[test]
  fn gradient_utilities() {
    let w = Tensor::vec(&[1.0, 2.0]).trained();
    assert_eq!(w.grad_pow_sum(2.0), 0.0);
    w.accumulate_grad(&Tensor::vec(&[3.0, -4.0]));
    assert_eq!(w.grad_pow_sum(2.0), 25.0);
    w.scale_grad(0.5);
    assert_eq!(w.grad().unwrap().data(), vec![1.5, -2.0]);
    w.clip_grad_value(1.0);
    assert_eq!(w.grad().unwrap().data(), vec![1.0, -1.0]);
    w.clip_grad_value(0.0);
    assert_eq!(w.grad().unwrap().data(), vec![1.0, -1.0]);
    w.accumulate_grad(&Tensor::vec(&[1.0, 1.0]));
    assert_eq!(w.grad().unwrap().data(), vec![2.0, 0.0]);
    w.zero_grad();
    assert!(w.grad().is_none());
  }

  #[test]
  fn display() {
    let t = Tensor::arange(&[2,2], 0.0, 1.0);
    assert_eq!(format!("{t}"), "Tensor[2, 2] [\n  [0.0, 1.0]\n  [2.0, 3.0]\n]\n");
  }
}
