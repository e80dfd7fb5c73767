use rand::Rng;
use itertools::Itertools;

use crate::error::{ Error, Result };


/// Resolve a possibly negative index against `n`.
/// With `start_behind`, `-1` addresses the slot after the last element.

#[inline]
pub fn negative_index(i: isize, n: usize, start_behind: bool) -> Option<usize> {
  let n = n as isize + if start_behind { 1 } else { 0 };
  let i = if i < 0 { n + i } else { i };
  (0..n).contains(&i).then(|| i as usize )
}

pub fn axis_index(op: &'static str, axis: isize, rank: usize) -> Result<usize> {
  negative_index(axis, rank, false)
    .ok_or_else(|| Error::out_of_range(op, format!("axis {axis} for rank {rank}")) )
}

/// Like [axis_index], but for axes that get inserted.

pub fn insert_index(op: &'static str, axis: isize, rank: usize) -> Result<usize> {
  negative_index(axis, rank, true)
    .ok_or_else(|| Error::out_of_range(op, format!("axis {axis} for inserting into rank {rank}")) )
}

/// Validate dimensions of a new tensor, returning its element count.

pub fn check_dims(op: &'static str, dims: &[usize]) -> Result<usize> {
  if dims.is_empty() {
    return Err(Error::invalid_shape(op, "shape must have at least one dimension"))
  }
  if dims.iter().any(|&n| n == 0 ) {
    return Err(Error::invalid_shape(op, format!("non-positive dimension in {}", fmt_dims(dims))))
  }
  element_count(op, dims)
}

/// Number of elements in `dims`, failing if it does not fit a `usize`.

pub fn element_count(op: &'static str, dims: &[usize]) -> Result<usize> {
  dims.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n) )
    .ok_or_else(|| Error::invalid_shape(op, format!("{} has too many elements", fmt_dims(dims))) )
}

pub fn ensure_same_shape(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Result<()> {
  if lhs != rhs {
    return Err(Error::shape_mismatch(op, format!("{} vs {}", fmt_dims(lhs), fmt_dims(rhs))))
  }
  Ok(())
}

pub fn ensure_rank(op: &'static str, dims: &[usize], rank: usize) -> Result<()> {
  if dims.len() != rank {
    return Err(Error::shape_mismatch(op,
      format!("expected rank {rank}, got {}", fmt_dims(dims))))
  }
  Ok(())
}

pub fn fmt_dims(dims: &[usize]) -> String {
  format!("[{}]", dims.iter().join(", "))
}

/// Split `dims` around `axis` into (outer, axis, inner) element counts.

pub fn split_at_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
  let outer = dims[..axis].iter().product();
  let inner = dims[axis + 1..].iter().product();
  (outer, dims[axis], inner)
}


// Polar Box-Muller transformation

pub fn randn(rng: &mut impl Rng) -> (f64, f64) {
  loop {
    let u: f64 = rng.gen_range(-1.0, 1.0);
    let v: f64 = rng.gen_range(-1.0, 1.0);
    let r = u * u + v * v;
    // Try again if outside interval
    if r == 0.0 || r >= 1.0 { continue }
    let c = (-2.0 * r.ln() / r).sqrt();
    return (u * c, v * c)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ SeedableRng, rngs::StdRng };

  #[test]
  fn negative() {
    assert_eq!(negative_index(-1, 3, false), Some(2));
    assert_eq!(negative_index(-1, 3, true), Some(3));
    assert_eq!(negative_index(3, 3, false), None);
    assert_eq!(negative_index(-4, 3, false), None);
    assert!(axis_index("sum", 2, 2).is_err());
  }

  #[test]
  fn dims_validation() {
    assert_eq!(check_dims("new", &[2, 3]).unwrap(), 6);
    assert!(matches!(check_dims("new", &[]), Err(Error::InvalidShape { .. })));
    assert!(matches!(check_dims("new", &[usize::MAX, 2]), Err(Error::InvalidShape { .. })));
    assert_eq!(element_count("new", &[usize::MAX, 1]).unwrap(), usize::MAX);
  }

  #[test]
  fn outer_inner() {
    assert_eq!(split_at_axis(&[2, 3, 4], 1), (2, 3, 4));
    assert_eq!(split_at_axis(&[5], 0), (1, 5, 1));
  }

  #[test]
  fn normal_samples() {
    let mut rng = StdRng::seed_from_u64(7);
    let samples: Vec<f64> = (0..2000).flat_map(|_| {
      let (a, b) = randn(&mut rng);
      [a, b]
    }).collect();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let var = samples.iter().map(|x| (x - mean).powi(2) ).sum::<f64>() / samples.len() as f64;
    assert!(mean.abs() < 0.1);
    assert!((var - 1.0).abs() < 0.1);
  }
}
