use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Parameter, Shape};
use rand::Rng;

pub struct LinearLayer {
    last_input: Matrix,
    // [in_channels, out_channels]
    pub weight: Matrix,
    pub d_weight: Matrix,
    pub bias: Matrix,
    pub d_bias: Matrix,
}

impl LinearLayer {
    pub fn new<R: Rng>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_channels as f32).sqrt();
        let mut weight = Matrix::new(in_channels, out_channels);
        let mut bias = Matrix::new(1, out_channels);
        weight.uniform_init(bound, rng);
        bias.uniform_init(bound, rng);
        Self::from_weights(weight, bias)
    }

    pub fn from_weights(weight: Matrix, bias: Matrix) -> Self {
        let (in_channels, out_channels) = weight.shape();
        if bias.shape() != (1, out_channels) {
            panic!("linear bias does not match its weight");
        }
        Self {
            last_input: Matrix::null(),
            weight,
            d_weight: Matrix::new(in_channels, out_channels),
            bias,
            d_bias: Matrix::new(1, out_channels),
        }
    }
}

impl nn_trait::Layer for LinearLayer {
    fn forward(&mut self, input: Matrix) -> Matrix {
        let mut now = input.mul(&self.weight);
        now.add_with_vector(&self.bias);
        self.last_input = input;
        now
    }

    fn backward(&mut self, d_loss: Matrix) -> Matrix {
        self.d_bias.add_(&d_loss.sum_rows());
        self.d_weight
            .add_(&self.last_input.transpose().mul(&d_loss));
        d_loss.mul(&self.weight.transpose())
    }

    fn output_shape(&self, _input: Shape) -> Shape {
        Shape::Flat(self.weight.number_of_col())
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::Linear {
            weight: &self.weight,
            bias: &self.bias,
        }
    }

    fn parameters(&mut self) -> Vec<Parameter<'_>> {
        vec![
            Parameter {
                value: &mut self.weight,
                grad: &mut self.d_weight,
            },
            Parameter {
                value: &mut self.bias,
                grad: &mut self.d_bias,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::nn_trait::Layer;

    #[test]
    fn forward_and_gradients() {
        let weight = Matrix::from_vec(2, 3, vec![1.0, 0.0, -1.0, 2.0, 1.0, 0.5]);
        let bias = Matrix::from_vec(1, 3, vec![0.1, 0.2, 0.3]);
        let mut fc = LinearLayer::from_weights(weight, bias);

        let out = fc.forward(Matrix::from_vec(1, 2, vec![3.0, -1.0]));
        for (got, want) in out.as_slice().iter().zip([1.1, -0.8, -3.2]) {
            assert!((got - want).abs() < 1e-6);
        }

        let d_input = fc.backward(Matrix::from_vec(1, 3, vec![1.0, 1.0, 1.0]));
        assert_eq!(d_input.as_slice(), &[0.0, 3.5]);
        assert_eq!(fc.d_bias.as_slice(), &[1.0, 1.0, 1.0]);
        assert_eq!(fc.d_weight.as_slice(), &[3.0, 3.0, 3.0, -1.0, -1.0, -1.0]);

        // a second backward accumulates
        fc.backward(Matrix::from_vec(1, 3, vec![1.0, 1.0, 1.0]));
        assert_eq!(fc.d_bias.as_slice(), &[2.0, 2.0, 2.0]);
    }
}
