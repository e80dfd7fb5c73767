//! Dense `f64` tensors with reverse-mode automatic differentiation.
//! CPU only. Stable Rust.
//!
//! # Features
//!
//! - **Eager graphs**: Every operation whose inputs require gradients records
//! itself on its output. Calling [backward](Tensor::backward) on a result
//! replays the recorded graph in reverse.
//!
//! - **Zero-copy views**: Tensors may be reshaped, transposed, narrowed,
//! squeezed and broadcasted without copying any data. Views share the
//! buffer of their source.
//!
//! - **Neural network kernels**: Matrix products, 1D/2D/3D convolutions and
//! their transposes, pooling, layer and batch normalization, softmax and
//! the usual losses, each with its own gradient rule.
//!
//! - **Parallel kernels**: Work on large tensors gets split over scoped
//! worker threads, see [parallel].
//!
//! # Examples
//!
//! ```
//! use densegrad::Tensor;
//!
//! # fn main() -> densegrad::Result<()> {
//! // Parameters are tensors that require gradients
//! let w = Tensor::new(&[1,1], vec![2.0])?.trained();
//!
//! let x = Tensor::vec(&[1.0, 2.0, 3.0]).reshape(&[3, 1])?;
//! let y = x.matmul(&w)?;
//! assert_eq!(y.data(), vec![2.0, 4.0, 6.0]);
//!
//! y.sum().backward()?;
//! assert_eq!(w.grad().unwrap().data(), vec![6.0]);
//! # Ok(())
//! # }
//! ```
//!
//! Classifying with a small convolutional network:
//! ```
//! use rand::{ SeedableRng, rngs::StdRng };
//! use densegrad::Tensor;
//!
//! # fn main() -> densegrad::Result<()> {
//! let mut rng = StdRng::seed_from_u64(0);
//! let kernel = Tensor::random_normal(&[4, 1, 3, 3], &mut rng).trained();
//! let images = Tensor::random_normal(&[2, 1, 8, 8], &mut rng);
//!
//! let features = images
//!   .conv2d(&kernel, None, [1, 1], [1, 1])?
//!   .relu()
//!   .max_pool2d([2, 2], [2, 2], [0, 0])?
//!   .flatten();
//! let loss = features.log_softmax(-1)?.mean().neg();
//! loss.backward()?;
//! assert_eq!(kernel.grad().unwrap().shape(), &[4, 1, 3, 3]);
//! # Ok(())
//! # }
//! ```
//!
//! # Optional features
//!
//! Some features can be toggled in your `Cargo.toml`.
//!
//! - `unsafe` *(default)*: Accelerated matrix math using [matrixmultiply] crate.
//! - `rayon`: Run parallel kernels on rayon's thread pool.

mod internal;
mod shape;
mod tensor;

pub mod error;
pub mod parallel;
pub mod autograd;
pub mod ops;
pub mod record;

pub use error::{ Error, Result };
pub use shape::Shape;
pub use tensor::Tensor;
pub use ops::BatchNormOptions;
pub use record::{ TensorRecord, save_tensors, load_tensors };
