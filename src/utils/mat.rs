use rand::Rng;
use rayon::prelude::*;

/// Row-major `f32` matrix. A batch of samples is stored one sample per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    row: usize,
    col: usize,
}

impl Matrix {
    pub fn null() -> Self {
        Matrix::new(0, 0)
    }

    pub fn new(n: usize, m: usize) -> Self {
        Matrix {
            data: vec![0.0; n * m],
            row: n,
            col: m,
        }
    }

    pub fn from_vec(n: usize, m: usize, data: Vec<f32>) -> Self {
        if data.len() != n * m {
            panic!(
                "matrix of shape [{}, {}] built from {} values",
                n,
                m,
                data.len()
            );
        }
        Matrix { data, row: n, col: m }
    }

    /// Fills the matrix from `U(-bound, bound)`.
    pub fn uniform_init<R: Rng>(&mut self, bound: f32, rng: &mut R) {
        for val in self.data.iter_mut() {
            *val = rng.random_range(-bound..=bound);
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn number_of_row(&self) -> usize {
        self.row
    }

    pub fn number_of_col(&self) -> usize {
        self.col
    }

    pub fn row_at(&self, i: usize) -> &[f32] {
        if i >= self.row {
            panic!("matrix visit row over bound");
        }
        &self.data[i * self.col..(i + 1) * self.col]
    }

    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.col + j]
    }

    pub fn set(&mut self, i: usize, j: usize, val: f32) {
        self.data[i * self.col + j] = val;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn fill_(&mut self, val: f32) {
        self.data.par_iter_mut().for_each(|x| *x = val);
    }

    pub fn add_(&mut self, rhs: &Matrix) {
        if self.row != rhs.row || self.col != rhs.col {
            panic!("call add with unmatched matrix shape");
        }
        self.data
            .par_iter_mut()
            .zip(rhs.data.par_iter())
            .for_each(|(a, b)| *a += b);
    }

    /// Adds a `[1, col]` row vector to every row.
    pub fn add_with_vector(&mut self, rhs: &Matrix) {
        if rhs.row != 1 || self.col != rhs.col {
            panic!("call add_with_vector with unmatched matrix shape");
        }
        if self.col == 0 {
            return;
        }
        self.data.par_chunks_mut(self.col).for_each(|row| {
            for (a, b) in row.iter_mut().zip(rhs.data.iter()) {
                *a += b;
            }
        });
    }

    pub fn mul(&self, rhs: &Matrix) -> Matrix {
        if self.col != rhs.row {
            panic!("call mul with unmatched matrix shape");
        }
        let mut ret = Matrix::new(self.row, rhs.col);
        if self.col == 0 || rhs.col == 0 {
            return ret;
        }
        let inner = self.col;
        let width = rhs.col;
        ret.data
            .par_chunks_mut(width)
            .zip(self.data.par_chunks(inner))
            .for_each(|(dst, lhs)| {
                for (k, &a) in lhs.iter().enumerate() {
                    if a == 0.0 {
                        continue;
                    }
                    let src = &rhs.data[k * width..(k + 1) * width];
                    for (d, &b) in dst.iter_mut().zip(src) {
                        *d += a * b;
                    }
                }
            });
        ret
    }

    pub fn transpose(&self) -> Matrix {
        let mut ret = Matrix::new(self.col, self.row);
        if self.row == 0 || self.col == 0 {
            return ret;
        }
        let (row, col) = (self.row, self.col);
        ret.data
            .par_chunks_mut(row)
            .enumerate()
            .for_each(|(j, dst)| {
                for (i, d) in dst.iter_mut().enumerate() {
                    *d = self.data[i * col + j];
                }
            });
        ret
    }

    /// Column sums as a `[1, col]` matrix.
    pub fn sum_rows(&self) -> Matrix {
        let mut ret = Matrix::new(1, self.col);
        if self.col == 0 {
            return ret;
        }
        for row in self.data.chunks(self.col) {
            for (acc, v) in ret.data.iter_mut().zip(row) {
                *acc += v;
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_matches_hand_computed_product() {
        let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Matrix::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let c = a.mul(&b);
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.as_slice(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(t.transpose(), a);
    }

    #[test]
    fn bias_broadcast_and_column_sums() {
        let mut a = Matrix::new(3, 2);
        a.add_with_vector(&Matrix::from_vec(1, 2, vec![1.0, -2.0]));
        assert_eq!(a.row_at(2), &[1.0, -2.0]);
        assert_eq!(a.sum_rows().as_slice(), &[3.0, -6.0]);
    }

    #[test]
    #[should_panic(expected = "unmatched matrix shape")]
    fn mul_rejects_mismatched_shapes() {
        Matrix::new(2, 3).mul(&Matrix::new(2, 3));
    }
}
