use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Shape};

/// Collapses an image shape into features. Rows are already laid out as
/// flat `C*H*W` vectors so the data passes through untouched.
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Flatten
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Self::new()
    }
}

impl nn_trait::Layer for Flatten {
    fn forward(&mut self, input: Matrix) -> Matrix {
        input
    }

    fn backward(&mut self, d_loss: Matrix) -> Matrix {
        d_loss
    }

    fn output_shape(&self, input: Shape) -> Shape {
        Shape::Flat(input.len())
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::Flatten
    }
}
