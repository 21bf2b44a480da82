use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Parameter, Shape};
use rand::Rng;
use rayon::prelude::*;

/// 3x3 convolution over NCHW rows, lowered to a matmul with im2col.
pub struct Conv3x3 {
    pub in_channels: usize,
    pub out_channels: usize,
    pub im_row: usize,
    pub im_col: usize,
    pub stride: usize,
    pub padding: usize,

    pub feat_row: usize,
    pub feat_col: usize,

    // [9 * in_channels, out_channels], row index is c * 9 + ky * 3 + kx
    pub weight: Matrix,
    pub bias: Matrix,
    pub d_weight: Matrix,
    pub d_bias: Matrix,

    pinned_memory_for_im2col: Matrix,
}

impl Conv3x3 {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        im_row: usize,
        im_col: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / ((9 * in_channels) as f32).sqrt();
        let mut weight = Matrix::new(9 * in_channels, out_channels);
        let mut bias = Matrix::new(1, out_channels);
        weight.uniform_init(bound, rng);
        bias.uniform_init(bound, rng);
        Self::from_weights(in_channels, im_row, im_col, stride, padding, weight, bias)
    }

    pub fn from_weights(
        in_channels: usize,
        im_row: usize,
        im_col: usize,
        stride: usize,
        padding: usize,
        weight: Matrix,
        bias: Matrix,
    ) -> Self {
        if stride == 0 {
            panic!("conv stride must be positive");
        }
        if im_row + 2 * padding < 3 || im_col + 2 * padding < 3 {
            panic!("conv input smaller than its kernel");
        }
        let (rows, out_channels) = weight.shape();
        if rows != 9 * in_channels || bias.shape() != (1, out_channels) {
            panic!("conv weights do not match the channel counts");
        }
        let feat_row = (im_row + padding + padding - 3) / stride + 1;
        let feat_col = (im_col + padding + padding - 3) / stride + 1;
        Self {
            in_channels,
            out_channels,
            im_row,
            im_col,
            stride,
            padding,
            feat_row,
            feat_col,
            d_weight: Matrix::new(9 * in_channels, out_channels),
            d_bias: Matrix::new(1, out_channels),
            weight,
            bias,
            pinned_memory_for_im2col: Matrix::null(),
        }
    }

    fn positions(&self) -> usize {
        self.feat_row * self.feat_col
    }

    // B*CHW => BH'W'*9C
    fn im2col(&mut self, input: &Matrix) {
        let h = input.number_of_row();
        let positions = self.positions();
        let width = 9 * self.in_channels;
        let (im_row, im_col) = (self.im_row as isize, self.im_col as isize);
        let (feat_col, stride, padding) = (self.feat_col, self.stride, self.padding as isize);
        let in_channels = self.in_channels;

        self.pinned_memory_for_im2col = Matrix::new(h * positions, width);
        self.pinned_memory_for_im2col
            .as_mut_slice()
            .par_chunks_mut(positions * width)
            .enumerate()
            .for_each(|(batch, dst)| {
                let src = input.row_at(batch);
                for (pos, out) in dst.chunks_mut(width).enumerate() {
                    let fr = (pos / feat_col * stride) as isize - padding;
                    let fc = (pos % feat_col * stride) as isize - padding;
                    let mut ptr = 0;
                    for c in 0..in_channels {
                        let plane = c as isize * im_row * im_col;
                        for dy in 0..3 {
                            for dx in 0..3 {
                                let y = fr + dy;
                                let x = fc + dx;
                                out[ptr] = if y < 0 || y >= im_row || x < 0 || x >= im_col {
                                    0.0
                                } else {
                                    src[(plane + y * im_col + x) as usize]
                                };
                                ptr += 1;
                            }
                        }
                    }
                }
            });
    }

    // BH'W'*C => B*CH'W'
    fn col2im(&self, input: &Matrix) -> Matrix {
        let positions = self.positions();
        let out_channels = self.out_channels;
        let h = input.number_of_row() / positions;
        let mut ret = Matrix::new(h, out_channels * positions);
        ret.as_mut_slice()
            .par_chunks_mut(out_channels * positions)
            .enumerate()
            .for_each(|(batch, dst)| {
                for pos in 0..positions {
                    let src = input.row_at(batch * positions + pos);
                    for (o, v) in src.iter().enumerate() {
                        dst[o * positions + pos] = *v;
                    }
                }
            });
        ret
    }

    // B*CH'W' => BH'W'*C
    fn split_loss(&self, input: &Matrix) -> Matrix {
        let positions = self.positions();
        let out_channels = self.out_channels;
        let h = input.number_of_row();
        let mut ret = Matrix::new(h * positions, out_channels);
        ret.as_mut_slice()
            .par_chunks_mut(positions * out_channels)
            .enumerate()
            .for_each(|(batch, dst)| {
                let src = input.row_at(batch);
                for (pos, out) in dst.chunks_mut(out_channels).enumerate() {
                    for (o, v) in out.iter_mut().enumerate() {
                        *v = src[o * positions + pos];
                    }
                }
            });
        ret
    }

    // BH'W'*9C => B*CHW, overlapping windows accumulate
    fn merge_loss(&self, input: &Matrix) -> Matrix {
        let positions = self.positions();
        let h = input.number_of_row() / positions;
        let (im_row, im_col) = (self.im_row as isize, self.im_col as isize);
        let (feat_col, stride, padding) = (self.feat_col, self.stride, self.padding as isize);
        let in_channels = self.in_channels;

        let mut ret = Matrix::new(h, self.in_channels * self.im_row * self.im_col);
        if ret.number_of_col() == 0 {
            return ret;
        }
        let row_len = ret.number_of_col();
        ret.as_mut_slice()
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(batch, dst)| {
                for pos in 0..positions {
                    let src = input.row_at(batch * positions + pos);
                    let fr = (pos / feat_col * stride) as isize - padding;
                    let fc = (pos % feat_col * stride) as isize - padding;
                    let mut ptr = 0;
                    for c in 0..in_channels {
                        let plane = c as isize * im_row * im_col;
                        for dy in 0..3 {
                            for dx in 0..3 {
                                let y = fr + dy;
                                let x = fc + dx;
                                if !(y < 0 || y >= im_row || x < 0 || x >= im_col) {
                                    dst[(plane + y * im_col + x) as usize] += src[ptr];
                                }
                                ptr += 1;
                            }
                        }
                    }
                }
            });
        ret
    }
}

impl nn_trait::Layer for Conv3x3 {
    fn forward(&mut self, input: Matrix) -> Matrix {
        if input.number_of_col() != self.in_channels * self.im_row * self.im_col {
            panic!("conv input does not match its geometry");
        }
        self.im2col(&input);
        let mut res = self.pinned_memory_for_im2col.mul(&self.weight);
        res.add_with_vector(&self.bias);
        self.col2im(&res)
    }

    fn backward(&mut self, d_loss: Matrix) -> Matrix {
        let split_loss = self.split_loss(&d_loss);
        self.d_bias.add_(&split_loss.sum_rows());
        self.d_weight
            .add_(&self.pinned_memory_for_im2col.transpose().mul(&split_loss));
        let ret = split_loss.mul(&self.weight.transpose());
        self.merge_loss(&ret)
    }

    fn output_shape(&self, _input: Shape) -> Shape {
        Shape::Image {
            channels: self.out_channels,
            height: self.feat_row,
            width: self.feat_col,
        }
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::Conv {
            weight: &self.weight,
            bias: &self.bias,
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            stride: self.stride,
            padding: self.padding,
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
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn output_geometry_without_padding() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv3x3::new(1, 32, 28, 28, 1, 0, &mut rng);
        assert_eq!((conv.feat_row, conv.feat_col), (26, 26));
        let conv = Conv3x3::new(32, 64, 26, 26, 1, 0, &mut rng);
        assert_eq!(
            conv.output_shape(Shape::Flat(0)),
            Shape::Image {
                channels: 64,
                height: 24,
                width: 24
            }
        );
    }

    #[test]
    fn forward_computes_cross_correlation() {
        // single 3x3 kernel of ones over a 4x4 ramp
        let weight = Matrix::from_vec(9, 1, vec![1.0; 9]);
        let bias = Matrix::from_vec(1, 1, vec![0.5]);
        let mut conv = Conv3x3::from_weights(1, 4, 4, 1, 0, weight, bias);
        let input = Matrix::from_vec(1, 16, (0..16).map(|x| x as f32).collect());
        let out = conv.forward(input);
        assert_eq!(out.shape(), (1, 4));
        // window sums: 45, 54, 81, 90
        assert_eq!(out.as_slice(), &[45.5, 54.5, 81.5, 90.5]);
    }

    #[test]
    fn padding_keeps_spatial_size() {
        let weight = Matrix::from_vec(9, 1, vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        let bias = Matrix::new(1, 1);
        let mut conv = Conv3x3::from_weights(1, 3, 3, 1, 1, weight, bias);
        let input = Matrix::from_vec(1, 9, (1..=9).map(|x| x as f32).collect());
        let out = conv.forward(input.clone());
        assert_eq!(out, input);
    }

    #[test]
    fn backward_matches_numerical_gradient() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut conv = Conv3x3::new(2, 3, 5, 5, 1, 0, &mut rng);
        let mut input = Matrix::new(2, 2 * 5 * 5);
        input.uniform_init(1.0, &mut rng);

        // loss = sum(out * coeff)
        let out = conv.forward(input.clone());
        let mut coeff = Matrix::new(out.number_of_row(), out.number_of_col());
        coeff.uniform_init(1.0, &mut rng);
        let d_input = conv.backward(coeff.clone());

        let loss = |conv: &mut Conv3x3, input: &Matrix| -> f32 {
            let out = conv.forward(input.clone());
            out.as_slice()
                .iter()
                .zip(coeff.as_slice())
                .map(|(a, b)| a * b)
                .sum()
        };

        let eps = 1e-2;
        for idx in [0, 7, 24, 31, 49] {
            let mut plus = input.clone();
            plus.as_mut_slice()[idx] += eps;
            let mut minus = input.clone();
            minus.as_mut_slice()[idx] -= eps;
            let numeric = (loss(&mut conv, &plus) - loss(&mut conv, &minus)) / (2.0 * eps);
            let analytic = d_input.as_slice()[idx];
            assert!((numeric - analytic).abs() < 1e-2, "{numeric} vs {analytic}");
        }

        for idx in [0, 5, 17, 53] {
            let analytic = conv.d_weight.as_slice()[idx];
            conv.weight.as_mut_slice()[idx] += eps;
            let up = loss(&mut conv, &input);
            conv.weight.as_mut_slice()[idx] -= 2.0 * eps;
            let down = loss(&mut conv, &input);
            conv.weight.as_mut_slice()[idx] += eps;
            let numeric = (up - down) / (2.0 * eps);
            assert!((numeric - analytic).abs() < 1e-2, "{numeric} vs {analytic}");
        }
    }
}
