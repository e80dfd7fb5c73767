use crate::{
  internal::*,
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
  ops::wants,
};


/// Row and column strides of a row-major `[rows, cols]` operand,
/// optionally read as its transpose.
fn strides(rows: usize, cols: usize, transposed: bool) -> (isize, isize) {
  if transposed {
    (1, rows as isize)
  } else {
    (cols as isize, 1)
  }
}

/// `[m, k] x [k, n]` product. With `trans_a`, `a` is stored as `[k, m]`;
/// with `trans_b`, `b` is stored as `[n, k]`.

#[cfg(feature = "unsafe")]
pub(crate) fn gemm(a: &[f64], b: &[f64], m: usize, k: usize, n: usize, trans_a: bool, trans_b: bool) -> Vec<f64> {
  let (rsa, csa) = strides(m, k, trans_a);
  let (rsb, csb) = strides(k, n, trans_b);
  debug_assert!(a.len() >= m * k && b.len() >= k * n);
  let mut data = vec![0.0; m * n];
  // Safety: operand slices cover m*k and k*n elements under the given strides
  unsafe {
    matrixmultiply::dgemm(
      m, k, n,
      1.0,
      a.as_ptr(), rsa, csa,
      b.as_ptr(), rsb, csb,
      0.0,
      data.as_mut_ptr(), n as isize, 1,
    );
  }
  data
}

#[cfg(not(feature = "unsafe"))]
pub(crate) fn gemm(a: &[f64], b: &[f64], m: usize, k: usize, n: usize, trans_a: bool, trans_b: bool) -> Vec<f64> {
  let (rsa, csa) = strides(m, k, trans_a);
  let (rsb, csb) = strides(k, n, trans_b);
  let (rsa, csa, rsb, csb) = (rsa as usize, csa as usize, rsb as usize, csb as usize);
  let mut data = vec![0.0; m * n];
  crate::parallel::split(&mut data, n, |first, rows| {
    for (r, row) in rows.chunks_mut(n).enumerate() {
      let i = first + r;
      for p in 0..k {
        let aip = a[i * rsa + p * csa];
        for (j, c) in row.iter_mut().enumerate() {
          *c += aip * b[p * rsb + j * csb];
        }
      }
    }
  });
  data
}


impl Tensor {
  /// Matrix product of two rank-2 tensors.

  pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
    ensure_rank("matmul", self.shape(), 2)?;
    ensure_rank("matmul", rhs.shape(), 2)?;
    let (m, k) = (self.shape()[0], self.shape()[1]);
    let (k2, n) = (rhs.shape()[0], rhs.shape()[1]);
    if k != k2 {
      return Err(Error::shape_mismatch("matmul",
        format!("{} x {}, inner dimensions differ", fmt_dims(self.shape()), fmt_dims(rhs.shape()))))
    }
    let data = self.read(|a| rhs.read(|b| gemm(a, b, m, k, n, false, false) ));
    Ok(Tensor::computed(&[m, n], data, &[self, rhs], || Op::MatMul))
  }
}


pub(crate) fn matmul_backward(inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
  let (lhs, rhs) = (&inputs[0], &inputs[1]);
  let (m, k) = (lhs.shape()[0], lhs.shape()[1]);
  let n = rhs.shape()[1];
  grad.read(|g| vec![
    // dA = G · Bᵗ
    wants(inputs, 0).then(|| {
      Tensor::build(&[m, k], rhs.read(|b| gemm(g, b, m, n, k, false, true) ))
    }),
    // dB = Aᵗ · G
    wants(inputs, 1).then(|| {
      Tensor::build(&[k, n], lhs.read(|a| gemm(a, g, k, m, n, true, false) ))
    }),
  ])
}
