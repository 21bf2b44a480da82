use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{Optimizer, Parameter};
use rayon::prelude::*;

/// Adam with bias correction. Moment buffers are keyed by the position of
/// the parameter in the list handed to [`Optimizer::step`], which must
/// therefore stay in the same order between steps.
pub struct Adam {
    rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    moments: Vec<(Matrix, Matrix)>,
}

impl Adam {
    pub fn new(rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Adam::new(1e-3, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: Vec<Parameter<'_>>) {
        if self.moments.is_empty() {
            self.moments = params
                .iter()
                .map(|p| {
                    let (h, w) = p.value.shape();
                    (Matrix::new(h, w), Matrix::new(h, w))
                })
                .collect();
        }
        if self.moments.len() != params.len() {
            panic!("optimizer stepped with a different parameter set");
        }
        self.t += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let bias1 = 1.0 - beta1.powi(self.t);
        let bias2 = 1.0 - beta2.powi(self.t);
        let step_size = self.rate / bias1;

        for (Parameter { value, grad }, (m, v)) in params.into_iter().zip(self.moments.iter_mut()) {
            if value.shape() != m.shape() {
                panic!("optimizer parameter changed shape");
            }
            value
                .as_mut_slice()
                .par_iter_mut()
                .zip(grad.as_slice().par_iter())
                .zip(m.as_mut_slice().par_iter_mut())
                .zip(v.as_mut_slice().par_iter_mut())
                .for_each(|(((w, g), m), v)| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *w -= step_size * *m / ((*v / bias2).sqrt() + epsilon);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::default();
        let mut value = Matrix::from_vec(1, 3, vec![1.0, 1.0, 1.0]);
        let mut grad = Matrix::from_vec(1, 3, vec![0.5, -2.0, 0.0]);
        adam.step(vec![Parameter {
            value: &mut value,
            grad: &mut grad,
        }]);
        // with bias correction the first update is lr * sign(g)
        assert!((value.at(0, 0) - (1.0 - 1e-3)).abs() < 1e-6);
        assert!((value.at(0, 1) - (1.0 + 1e-3)).abs() < 1e-6);
        assert_eq!(value.at(0, 2), 1.0);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut value = Matrix::from_vec(1, 1, vec![5.0]);
        for _ in 0..500 {
            let mut grad = Matrix::from_vec(1, 1, vec![2.0 * (value.at(0, 0) - 2.0)]);
            adam.step(vec![Parameter {
                value: &mut value,
                grad: &mut grad,
            }]);
        }
        assert!((value.at(0, 0) - 2.0).abs() < 1e-2);
    }
}
