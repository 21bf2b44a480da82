use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Shape};
use rayon::prelude::*;

pub struct ReluLayer {
    last_input: Matrix,
}

impl ReluLayer {
    pub fn new() -> Self {
        Self {
            last_input: Matrix::null(),
        }
    }
}

impl Default for ReluLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl nn_trait::Layer for ReluLayer {
    fn forward(&mut self, mut input: Matrix) -> Matrix {
        self.last_input = input.clone();
        input.as_mut_slice().par_iter_mut().for_each(|x| {
            if *x < 0.0 {
                *x = 0.0;
            }
        });
        input
    }

    fn backward(&mut self, mut d_loss: Matrix) -> Matrix {
        d_loss
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.last_input.as_slice().par_iter())
            .for_each(|(d, x)| {
                if *x <= 0.0 {
                    *d = 0.0;
                }
            });
        d_loss
    }

    fn output_shape(&self, input: Shape) -> Shape {
        input
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::Relu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::nn_trait::Layer;

    #[test]
    fn clamps_negatives_and_masks_gradient() {
        let mut relu = ReluLayer::new();
        let out = relu.forward(Matrix::from_vec(1, 4, vec![-1.0, 0.0, 2.0, -3.0]));
        assert_eq!(out.as_slice(), &[0.0, 0.0, 2.0, 0.0]);
        let d = relu.backward(Matrix::from_vec(1, 4, vec![1.0, 1.0, 1.0, 1.0]));
        assert_eq!(d.as_slice(), &[0.0, 0.0, 1.0, 0.0]);
    }
}
