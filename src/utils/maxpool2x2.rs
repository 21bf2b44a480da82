use crate::utils::mat::Matrix;
use crate::utils::nn_trait::{self, LayerSpec, Shape};
use rayon::prelude::*;

/// 2x2 max pooling with stride 2 over NCHW rows. Odd trailing rows and
/// columns are dropped.
pub struct MaxPool2x2 {
    pub in_channels: usize,
    pub im_row: usize,
    pub im_col: usize,
    // for every output element, the input offset that won
    max_mask: Vec<usize>,
}

impl MaxPool2x2 {
    pub fn new(in_channels: usize, im_row: usize, im_col: usize) -> Self {
        Self {
            in_channels,
            im_row,
            im_col,
            max_mask: Vec::new(),
        }
    }

    fn feat(&self) -> (usize, usize) {
        (self.im_row / 2, self.im_col / 2)
    }

    fn in_size(&self) -> usize {
        self.in_channels * self.im_row * self.im_col
    }

    fn out_size(&self) -> usize {
        let (feat_row, feat_col) = self.feat();
        self.in_channels * feat_row * feat_col
    }
}

impl nn_trait::Layer for MaxPool2x2 {
    fn forward(&mut self, input: Matrix) -> Matrix {
        if input.number_of_col() != self.in_size() {
            panic!("maxpool input does not match its geometry");
        }
        let h = input.number_of_row();
        let out_size = self.out_size();
        let (feat_row, feat_col) = self.feat();
        let (im_row, im_col) = (self.im_row, self.im_col);

        let mut ret = Matrix::new(h, out_size);
        self.max_mask = vec![0; h * out_size];
        if out_size == 0 {
            return ret;
        }
        ret.as_mut_slice()
            .par_chunks_mut(out_size)
            .zip(self.max_mask.par_chunks_mut(out_size))
            .enumerate()
            .for_each(|(batch_index, (dst, mask))| {
                let src = input.row_at(batch_index);
                for (o, (val, arg)) in dst.iter_mut().zip(mask.iter_mut()).enumerate() {
                    let c = o / (feat_row * feat_col);
                    let i = o / feat_col % feat_row * 2;
                    let j = o % feat_col * 2;
                    let base = c * im_row * im_col;
                    let mut best = base + i * im_col + j;
                    for offset in [1, im_col, im_col + 1] {
                        let cand = base + i * im_col + j + offset;
                        if src[cand] > src[best] {
                            best = cand;
                        }
                    }
                    *val = src[best];
                    *arg = best;
                }
            });
        ret
    }

    fn backward(&mut self, d_loss: Matrix) -> Matrix {
        let h = d_loss.number_of_row();
        let in_size = self.in_size();
        let out_size = self.out_size();
        let mut ret = Matrix::new(h, in_size);
        if in_size == 0 || out_size == 0 {
            return ret;
        }
        ret.as_mut_slice()
            .par_chunks_mut(in_size)
            .zip(self.max_mask.par_chunks(out_size))
            .enumerate()
            .for_each(|(x, (dst, mask))| {
                for (d, &arg) in d_loss.row_at(x).iter().zip(mask) {
                    dst[arg] += *d;
                }
            });
        ret
    }

    fn output_shape(&self, _input: Shape) -> Shape {
        let (height, width) = self.feat();
        Shape::Image {
            channels: self.in_channels,
            height,
            width,
        }
    }

    fn spec(&self) -> LayerSpec<'_> {
        LayerSpec::MaxPool2x2
    }
}
