use rand::Rng;

use crate::{
  tensor::Tensor,
  autograd::Op,
  error::{ Error, Result },
};


impl Tensor {
  /// Zero each element with probability `p` and scale the survivors by
  /// `1 / (1 - p)`. Outside of training, or with `p == 0`, values pass
  /// through unchanged.

  pub fn dropout(&self, p: f64, training: bool, rng: &mut impl Rng) -> Result<Tensor> {
    if !(0.0..1.0).contains(&p) {
      return Err(Error::unsupported("dropout", format!("probability {p} outside [0, 1)")))
    }
    if !training || p == 0.0 {
      return Ok(Tensor::computed(self.shape(), self.data(), &[self], || Op::View))
    }
    let scale = 1.0 / (1.0 - p);
    let mask: Vec<f64> = (0..self.numel())
      .map(|_| if rng.gen::<f64>() < p { 0.0 } else { scale } )
      .collect();
    let data = self.read(|x| x.iter().zip(&mask).map(|(v, m)| v * m ).collect() );
    Ok(Tensor::computed(self.shape(), data, &[self], || Op::Dropout { mask }))
  }
}


pub(crate) fn dropout_backward(grad: &Tensor, mask: &[f64]) -> Vec<Option<Tensor>> {
  let data = grad.read(|g| g.iter().zip(mask).map(|(g, m)| g * m ).collect() );
  vec![Some(Tensor::build(grad.shape(), data))]
}


#[cfg(test)]
mod tests {
  use super::*;
  use rand::{ SeedableRng, rngs::StdRng };

  #[test]
  fn training_masks_and_scales() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::ones(&[1000]).trained();
    let y = x.dropout(0.5, true, &mut rng).unwrap();
    let values = y.data();
    assert!(values.iter().all(|&v| v == 0.0 || v == 2.0 ));
    let kept = values.iter().filter(|&&v| v == 2.0 ).count();
    assert!(kept > 400 && kept < 600);

    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), values);
  }

  #[test]
  fn evaluation_is_identity() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::vec(&[1.0, 2.0]).trained();
    let y = x.dropout(0.9, false, &mut rng).unwrap();
    assert_eq!(y.data(), vec![1.0, 2.0]);
    assert!(!y.shares_storage(&x));
    y.sum().backward().unwrap();
    assert_eq!(x.grad().unwrap().data(), vec![1.0, 1.0]);
    assert_eq!(x.dropout(0.0, true, &mut rng).unwrap().data(), vec![1.0, 2.0]);
  }

  #[test]
  fn probability_range() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::ones(&[2]);
    assert!(matches!(x.dropout(1.0, true, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
    assert!(matches!(x.dropout(-0.1, false, &mut rng), Err(Error::UnsupportedConfiguration { .. })));
  }
}
