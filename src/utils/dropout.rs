use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Shape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Inverted dropout. Units are dropped in groups of `group` consecutive
/// features, so a group equal to `H*W` drops whole feature maps.
pub struct Dropout {
    p: f32,
    group: usize,
    training: bool,
    // per (row, group) scale of the last training forward
    mask: Vec<f32>,
    rng: StdRng,
}

impl Dropout {
    pub fn new(p: f32, group: usize, seed: u64) -> Self {
        if !(0.0..1.0).contains(&p) {
            panic!("dropout probability must be in [0, 1)");
        }
        Self {
            p,
            group: group.max(1),
            training: true,
            mask: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn apply(&self, x: &mut Matrix) {
        let group = self.group;
        for (val, scale) in x
            .as_mut_slice()
            .chunks_mut(group)
            .zip(self.mask.iter())
        {
            val.iter_mut().for_each(|v| *v *= scale);
        }
    }
}

impl nn_trait::Layer for Dropout {
    fn forward(&mut self, mut input: Matrix) -> Matrix {
        if !self.training || self.p == 0.0 {
            self.mask.clear();
            return input;
        }
        if input.number_of_col() % self.group != 0 {
            panic!("dropout group does not divide the feature count");
        }
        let keep = 1.0 / (1.0 - self.p);
        let groups = input.as_slice().len() / self.group;
        let p = self.p;
        let rng = &mut self.rng;
        self.mask = (0..groups)
            .map(|_| if rng.random::<f32>() < p { 0.0 } else { keep })
            .collect();
        self.apply(&mut input);
        input
    }

    fn backward(&mut self, mut d_loss: Matrix) -> Matrix {
        if !self.mask.is_empty() {
            self.apply(&mut d_loss);
        }
        d_loss
    }

    fn output_shape(&self, input: Shape) -> Shape {
        input
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::Dropout { p: self.p }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
