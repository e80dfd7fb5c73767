use crate::{
  tensor::Tensor,
  ops::{
    elementwise, activation, reduce, broadcast, matmul, conv, pool,
    norm, softmax, view, join, index, dropout,
    conv::ConvGeometry,
    pool::PoolGeometry,
  },
};


/// Differentiable operation recorded on the output of a computation,
/// together with whatever it saved from the forward pass.
///
/// Operations that keep their `output` hold an untracked handle on the
/// output buffer rather than the output tensor itself, so recording an
/// operation never creates a reference cycle.

pub(crate) enum Op {
  Add,
  Sub,
  Mul,
  Div,
  AddScalar,
  MulScalar(f64),
  Pow(f64),
  Exp { output: Tensor },
  Log,
  AddBias,

  Relu { output: Tensor },
  Sigmoid { output: Tensor },
  Tanh { output: Tensor },
  LeakyRelu(f64),
  Elu { alpha: f64, output: Tensor },
  Softplus(f64),
  Gelu,

  Sum,
  Mean,
  SumAxis { axis: usize },
  MeanAxis { axis: usize },
  Extremum { axis: usize, indices: Vec<usize> },

  BroadcastTo,
  ReduceTo,
  MatMul,
  Conv(Box<ConvGeometry>),
  MaxPool2d { indices: Vec<usize> },
  AvgPool2d(Box<PoolGeometry>),

  LayerNorm { xhat: Vec<f64>, inv_std: Vec<f64>, has_weight: bool, has_bias: bool },
  BatchNorm { xhat: Vec<f64>, inv_std: Vec<f64>, spatial: usize, training: bool, has_weight: bool, has_bias: bool },
  LogSoftmax { output: Tensor },

  /// Same values under other dimensions
  View,
  Transpose { d1: usize, d2: usize },
  Narrow { axis: usize, start: usize },
  Concat { axis: usize },
  Gather { sources: Vec<usize> },
  Embedding { rows: Vec<usize>, width: usize },
  Dropout { mask: Vec<f64> },
}

impl Op {
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Op::Add => "add",
      Op::Sub => "sub",
      Op::Mul => "mul",
      Op::Div => "div",
      Op::AddScalar => "add_scalar",
      Op::MulScalar(_) => "mul_scalar",
      Op::Pow(_) => "pow",
      Op::Exp { .. } => "exp",
      Op::Log => "log",
      Op::AddBias => "add_bias",
      Op::Relu { .. } => "relu",
      Op::Sigmoid { .. } => "sigmoid",
      Op::Tanh { .. } => "tanh",
      Op::LeakyRelu(_) => "leaky_relu",
      Op::Elu { .. } => "elu",
      Op::Softplus(_) => "softplus",
      Op::Gelu => "gelu",
      Op::Sum => "sum",
      Op::Mean => "mean",
      Op::SumAxis { .. } => "sum_axis",
      Op::MeanAxis { .. } => "mean_axis",
      Op::Extremum { .. } => "extremum",
      Op::BroadcastTo => "broadcast_to",
      Op::ReduceTo => "reduce_to_shape",
      Op::MatMul => "matmul",
      Op::Conv(geometry) => if geometry.transposed { "conv_transpose" } else { "conv" },
      Op::MaxPool2d { .. } => "max_pool2d",
      Op::AvgPool2d(_) => "avg_pool2d",
      Op::LayerNorm { .. } => "layer_norm",
      Op::BatchNorm { .. } => "batch_norm",
      Op::LogSoftmax { .. } => "log_softmax",
      Op::View => "view",
      Op::Transpose { .. } => "transpose",
      Op::Narrow { .. } => "narrow",
      Op::Concat { .. } => "concat",
      Op::Gather { .. } => "gather",
      Op::Embedding { .. } => "embedding",
      Op::Dropout { .. } => "dropout",
    }
  }

  /// Gradients with respect to every input, given the gradient of the
  /// output. Entries are `None` for inputs that need no gradient.

  pub(crate) fn derive(&self, inputs: &[Tensor], grad: &Tensor) -> Vec<Option<Tensor>> {
    match self {
      Op::Add => elementwise::add_backward(inputs, grad),
      Op::Sub => elementwise::sub_backward(inputs, grad),
      Op::Mul => elementwise::mul_backward(inputs, grad),
      Op::Div => elementwise::div_backward(inputs, grad),
      Op::AddScalar => elementwise::scale_backward(grad, 1.0),
      Op::MulScalar(factor) => elementwise::scale_backward(grad, *factor),
      Op::Pow(exponent) => elementwise::pow_backward(inputs, grad, *exponent),
      Op::Exp { output } => elementwise::exp_backward(grad, output),
      Op::Log => elementwise::log_backward(inputs, grad),
      Op::AddBias => elementwise::add_bias_backward(inputs, grad),

      Op::Relu { output } => activation::relu_backward(grad, output),
      Op::Sigmoid { output } => activation::sigmoid_backward(grad, output),
      Op::Tanh { output } => activation::tanh_backward(grad, output),
      Op::LeakyRelu(alpha) => activation::leaky_relu_backward(inputs, grad, *alpha),
      Op::Elu { alpha, output } => activation::elu_backward(inputs, grad, *alpha, output),
      Op::Softplus(beta) => activation::softplus_backward(inputs, grad, *beta),
      Op::Gelu => activation::gelu_backward(inputs, grad),

      Op::Sum => reduce::sum_backward(inputs, grad, 1.0),
      Op::Mean => reduce::sum_backward(inputs, grad, 1.0 / inputs[0].numel() as f64),
      Op::SumAxis { axis } => reduce::sum_axis_backward(inputs, grad, *axis, false),
      Op::MeanAxis { axis } => reduce::sum_axis_backward(inputs, grad, *axis, true),
      Op::Extremum { axis, indices } => reduce::extremum_backward(inputs, grad, *axis, indices),

      Op::BroadcastTo => broadcast::broadcast_backward(inputs, grad),
      Op::ReduceTo => broadcast::reduce_to_backward(inputs, grad),
      Op::MatMul => matmul::matmul_backward(inputs, grad),
      Op::Conv(geometry) => conv::conv_backward(inputs, grad, geometry),
      Op::MaxPool2d { indices } => pool::max_pool_backward(inputs, grad, indices),
      Op::AvgPool2d(geometry) => pool::avg_pool_backward(inputs, grad, geometry),

      Op::LayerNorm { xhat, inv_std, has_weight, has_bias } =>
        norm::layer_norm_backward(inputs, grad, xhat, inv_std, *has_weight, *has_bias),
      Op::BatchNorm { xhat, inv_std, spatial, training, has_weight, has_bias } =>
        norm::batch_norm_backward(inputs, grad, xhat, inv_std, *spatial, *training, *has_weight, *has_bias),
      Op::LogSoftmax { output } => softmax::log_softmax_backward(grad, output),

      Op::View => view::view_backward(inputs, grad),
      Op::Transpose { d1, d2 } => view::transpose_backward(grad, *d1, *d2),
      Op::Narrow { axis, start } => view::narrow_backward(inputs, grad, *axis, *start),
      Op::Concat { axis } => join::concat_backward(inputs, grad, *axis),
      Op::Gather { sources } => index::gather_backward(inputs, grad, sources),
      Op::Embedding { rows, width } => index::embedding_backward(inputs, grad, rows, *width),
      Op::Dropout { mask } => dropout::dropout_backward(grad, mask),
    }
  }
}
