use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Shape};
use rayon::prelude::*;

/// Row-wise log-softmax. The last stage of the classifier, so the network
/// output is a vector of log-probabilities.
pub struct LogSoftmax {
    last_output: Matrix,
}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {
            last_output: Matrix::null(),
        }
    }
}

impl Default for LogSoftmax {
    fn default() -> Self {
        Self::new()
    }
}

impl nn_trait::Layer for LogSoftmax {
    fn forward(&mut self, mut input: Matrix) -> Matrix {
        let w = input.number_of_col();
        if w == 0 {
            return input;
        }
        input.as_mut_slice().par_chunks_mut(w).for_each(|row| {
            let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = row.iter().map(|x| (x - max_val).exp()).sum();
            let log_sum = max_val + sum.ln();
            row.iter_mut().for_each(|x| *x -= log_sum);
        });
        self.last_output = input.clone();
        input
    }

    // dx = g - softmax * sum(g)
    fn backward(&mut self, mut d_loss: Matrix) -> Matrix {
        let w = d_loss.number_of_col();
        if w == 0 {
            return d_loss;
        }
        d_loss
            .as_mut_slice()
            .par_chunks_mut(w)
            .zip(self.last_output.as_slice().par_chunks(w))
            .for_each(|(grad, out)| {
                let total: f32 = grad.iter().sum();
                for (g, o) in grad.iter_mut().zip(out) {
                    *g -= o.exp() * total;
                }
            });
        d_loss
    }

    fn output_shape(&self, input: Shape) -> Shape {
        input
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::LogSoftmax
    }
}

/// Mean negative log-likelihood over log-probabilities. Applied after
/// [`LogSoftmax`] this is the cross-entropy of the raw scores.
pub struct NllLoss {
    grad: Matrix,
}

impl NllLoss {
    pub fn new() -> Self {
        Self {
            grad: Matrix::null(),
        }
    }
}

impl Default for NllLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl nn_trait::Head for NllLoss {
    fn forward(&mut self, input: &Matrix, target: &[u8]) -> f32 {
        let (h, w) = input.shape();
        if target.len() != h {
            panic!("loss target count does not match the batch");
        }
        self.grad = Matrix::new(h, w);
        if h == 0 {
            return 0.0;
        }
        let scale = 1.0 / h as f32;
        let mut loss = 0.0;
        for (idx, &label) in target.iter().enumerate() {
            let label = label as usize;
            if label >= w {
                panic!("label {} out of range for {} classes", label, w);
            }
            loss -= input.at(idx, label);
            self.grad.set(idx, label, -scale);
        }
        loss * scale
    }

    fn backward(&mut self) -> Matrix {
        self.grad.clone()
    }

    fn eval_forward(&self, input: &Matrix) -> Vec<usize> {
        let (h, _) = input.shape();
        (0..h)
            .map(|idx| {
                input
                    .row_at(idx)
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |a, (i, &v)| if a.1 < v { (i, v) } else { a })
                    .0
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::nn_trait::{Head, Layer};

    #[test]
    fn log_softmax_rows_are_normalized() {
        let mut layer = LogSoftmax::new();
        let out = layer.forward(Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 100.0, 0.0, -100.0]));
        for i in 0..2 {
            let total: f32 = out.row_at(i).iter().map(|x| x.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        assert!(out.row_at(1)[0].abs() < 1e-5);
    }

    #[test]
    fn loss_gradient_is_softmax_minus_target() {
        let mut layer = LogSoftmax::new();
        let mut head = NllLoss::new();
        let logits = Matrix::from_vec(2, 3, vec![0.5, -1.0, 2.0, 0.0, 0.0, 0.0]);
        let log_probs = layer.forward(logits);
        let loss = head.forward(&log_probs, &[2, 0]);
        let expected = -(log_probs.at(0, 2) + log_probs.at(1, 0)) / 2.0;
        assert!((loss - expected).abs() < 1e-6);

        let grad = layer.backward(head.backward());
        for (i, label) in [2usize, 0].into_iter().enumerate() {
            for j in 0..3 {
                let target = if j == label { 1.0 } else { 0.0 };
                let want = (log_probs.at(i, j).exp() - target) / 2.0;
                assert!((grad.at(i, j) - want).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn eval_forward_is_argmax() {
        let head = NllLoss::new();
        let pred = Matrix::from_vec(2, 3, vec![-3.0, -0.1, -2.0, -0.2, -5.0, -1.0]);
        assert_eq!(head.eval_forward(&pred), vec![1, 0]);
    }
}
