/// Every failure an operation can report to its caller.
///
/// Variants carry the name of the operation that detected the problem
/// and a message describing the offending shapes or values.

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Operand ranks or dimensions are incompatible.
  #[error("{op}: shape mismatch, {reason}")]
  ShapeMismatch { op: &'static str, reason: String },

  /// A non-positive dimension, stride or kernel, or an empty output.
  #[error("{op}: invalid shape, {reason}")]
  InvalidShape { op: &'static str, reason: String },

  /// An element or axis index outside its bounds.
  #[error("{op}: index out of range, {reason}")]
  IndexOutOfRange { op: &'static str, reason: String },

  #[error("{op}: unsupported configuration, {reason}")]
  UnsupportedConfiguration { op: &'static str, reason: String },

  /// Differentiation requested on a tensor that is not tracked.
  #[error("{op}: {reason}")]
  InvariantViolation { op: &'static str, reason: String },

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(String),
}

impl Error {
  pub(crate) fn shape_mismatch(op: &'static str, reason: impl Into<String>) -> Self {
    Self::ShapeMismatch { op, reason: reason.into() }
  }

  pub(crate) fn invalid_shape(op: &'static str, reason: impl Into<String>) -> Self {
    Self::InvalidShape { op, reason: reason.into() }
  }

  pub(crate) fn out_of_range(op: &'static str, reason: impl Into<String>) -> Self {
    Self::IndexOutOfRange { op, reason: reason.into() }
  }

  pub(crate) fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
    Self::UnsupportedConfiguration { op, reason: reason.into() }
  }

  pub(crate) fn invariant(op: &'static str, reason: impl Into<String>) -> Self {
    Self::InvariantViolation { op, reason: reason.into() }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
