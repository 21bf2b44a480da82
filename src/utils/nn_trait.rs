use crate::utils::mat::Matrix;

/// Per-sample shape of the activations flowing between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl Shape {
    pub fn len(&self) -> usize {
        match *self {
            Shape::Image {
                channels,
                height,
                width,
            } => channels * height * width,
            Shape::Flat(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensions without the leading batch axis.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            Shape::Image {
                channels,
                height,
                width,
            } => vec![channels, height, width],
            Shape::Flat(n) => vec![n],
        }
    }
}

/// A trainable tensor together with the gradient accumulated for it.
pub struct Parameter<'a> {
    pub value: &'a mut Matrix,
    pub grad: &'a mut Matrix,
}

/// Description of a stage for graph export.
pub enum LayerSpec<'a> {
    Conv {
        weight: &'a Matrix,
        bias: &'a Matrix,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        padding: usize,
    },
    Relu,
    MaxPool2x2,
    Dropout {
        p: f32,
    },
    Flatten,
    Linear {
        weight: &'a Matrix,
        bias: &'a Matrix,
    },
    LogSoftmax,
}

pub trait Layer {
    fn forward(&mut self, input: Matrix) -> Matrix;
    /// Propagates `d_loss` to the input and adds this batch's contribution
    /// to the parameter gradients.
    fn backward(&mut self, d_loss: Matrix) -> Matrix;
    fn output_shape(&self, input: Shape) -> Shape;
    fn spec(&self) -> LayerSpec<'_>;
    fn parameters(&mut self) -> Vec<Parameter<'_>> {
        Vec::new()
    }
    fn set_training(&mut self, _training: bool) {}
}

pub trait Head {
    /// Mean loss of the batch.
    fn forward(&mut self, input: &Matrix, target: &[u8]) -> f32;
    fn backward(&mut self) -> Matrix;
    fn eval_forward(&self, input: &Matrix) -> Vec<usize>;
}

pub trait DataSet: Sync {
    fn dim(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn fetch_item(&self, idx: usize) -> (&[f32], u8);
}

pub trait Optimizer {
    fn step(&mut self, params: Vec<Parameter<'_>>);
}
