use crate::utils::conv3x3::Conv3x3;
use crate::utils::dropout::Dropout;
use crate::utils::flatten::Flatten;
use crate::utils::head::{LogSoftmax, NllLoss};
use crate::utils::linear::LinearLayer;
use crate::utils::mat::Matrix;
use crate::utils::maxpool2x2::MaxPool2x2;
use crate::utils::nn_trait::{Head, Layer, Parameter, Shape};
use crate::utils::relu::ReluLayer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const IMAGE_SIZE: usize = 28;
pub const NUM_CLASSES: usize = 10;

/// A fixed pipeline of stages followed by a loss head.
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    loss_fn: Box<dyn Head>,
    input_shape: Shape,
    training: bool,
}

impl Network {
    pub fn new(layers: Vec<Box<dyn Layer>>, loss_fn: Box<dyn Head>, input_shape: Shape) -> Self {
        let mut network = Self {
            layers,
            loss_fn,
            input_shape,
            training: true,
        };
        network.set_training(true);
        network
    }

    /// conv(1->32) relu conv(32->64) relu maxpool dropout(0.25) flatten
    /// fc(9216->128) relu dropout(0.5) fc(128->10) log-softmax
    pub fn digit_classifier(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(Conv3x3::new(1, 32, IMAGE_SIZE, IMAGE_SIZE, 1, 0, &mut rng)),
            Box::new(ReluLayer::new()),
            Box::new(Conv3x3::new(32, 64, 26, 26, 1, 0, &mut rng)),
            Box::new(ReluLayer::new()),
            Box::new(MaxPool2x2::new(64, 24, 24)),
            Box::new(Dropout::new(0.25, 12 * 12, rng.random())),
            Box::new(Flatten::new()),
            Box::new(LinearLayer::new(64 * 12 * 12, 128, &mut rng)),
            Box::new(ReluLayer::new()),
            Box::new(Dropout::new(0.5, 1, rng.random())),
            Box::new(LinearLayer::new(128, NUM_CLASSES, &mut rng)),
            Box::new(LogSoftmax::new()),
        ];
        let input_shape = Shape::Image {
            channels: 1,
            height: IMAGE_SIZE,
            width: IMAGE_SIZE,
        };
        Network::new(layers, Box::new(NllLoss::new()), input_shape)
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.layers
            .iter()
            .fold(self.input_shape, |shape, layer| layer.output_shape(shape))
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    pub fn forward(&mut self, mut x: Matrix) -> Matrix {
        if x.number_of_col() != self.input_shape.len() {
            panic!("network input does not match its input shape");
        }
        for layer in self.layers.iter_mut() {
            x = layer.forward(x);
        }
        x
    }

    /// Runs `x` through every stage and returns the per-sample shape seen
    /// after each one, checked against the width of the data that came out.
    pub fn trace(&mut self, mut x: Matrix) -> Vec<Shape> {
        let mut shape = self.input_shape;
        let mut shapes = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter_mut() {
            x = layer.forward(x);
            shape = layer.output_shape(shape);
            if x.number_of_col() != shape.len() {
                panic!("stage produced data that disagrees with its declared shape");
            }
            shapes.push(shape);
        }
        shapes
    }

    pub fn calc_loss(&mut self, pred: &Matrix, target: &[u8]) -> f32 {
        self.loss_fn.forward(pred, target)
    }

    pub fn get_result(&self, pred: &Matrix) -> Vec<usize> {
        self.loss_fn.eval_forward(pred)
    }

    pub fn backward(&mut self) {
        let mut x = self.loss_fn.backward();
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
    }

    pub fn zero_grad(&mut self) {
        for Parameter { grad, .. } in self.parameters() {
            grad.fill_(0.0);
        }
    }

    pub fn parameters(&mut self) -> Vec<Parameter<'_>> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.parameters())
            .collect()
    }

    pub fn parameter_values(&mut self) -> Vec<Matrix> {
        self.parameters()
            .into_iter()
            .map(|Parameter { value, .. }| value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_image_yields_a_distribution() {
        let mut network = Network::digit_classifier(42);
        network.set_training(false);
        let out = network.forward(Matrix::new(1, IMAGE_SIZE * IMAGE_SIZE));
        assert_eq!(out.shape(), (1, NUM_CLASSES));
        let total: f32 = out.row_at(0).iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn construction_is_reproducible_for_a_seed() {
        let a = Network::digit_classifier(3).parameter_values();
        let b = Network::digit_classifier(3).parameter_values();
        let c = Network::digit_classifier(4).parameter_values();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parameter_shapes_follow_the_architecture() {
        let mut network = Network::digit_classifier(0);
        let shapes: Vec<_> = network
            .parameter_values()
            .iter()
            .map(|m| m.shape())
            .collect();
        assert_eq!(
            shapes,
            vec![
                (9, 32),
                (1, 32),
                (288, 64),
                (1, 64),
                (9216, 128),
                (1, 128),
                (128, 10),
                (1, 10)
            ]
        );
        assert_eq!(network.output_shape(), Shape::Flat(NUM_CLASSES));
    }

    #[test]
    fn trace_reports_every_stage() {
        let mut network = Network::digit_classifier(1);
        network.set_training(false);
        let shapes = network.trace(Matrix::new(1, IMAGE_SIZE * IMAGE_SIZE));
        assert_eq!(shapes.len(), network.layers().len());
        assert_eq!(
            shapes[4],
            Shape::Image {
                channels: 64,
                height: 12,
                width: 12
            }
        );
        assert_eq!(shapes[6], Shape::Flat(9216));
        assert_eq!(shapes.last(), Some(&Shape::Flat(NUM_CLASSES)));
    }
}
