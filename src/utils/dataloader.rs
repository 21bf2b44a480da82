use crate::utils::mat::Matrix;
use crate::utils::nn_trait::DataSet;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::cmp::min;

pub struct Batch {
    pub images: Matrix,
    pub labels: Vec<u8>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One shuffled pass over a dataset. The last batch holds whatever is left.
pub struct DataLoader<'a, T>
where
    T: DataSet,
{
    dataset: &'a T,
    batch_size: usize,
    count: usize,
    order: Vec<usize>,
}

impl<'a, T> DataLoader<'a, T>
where
    T: DataSet,
{
    pub fn new(dataset: &'a T, batch_size: usize, seed: u64) -> Self {
        if batch_size == 0 {
            panic!("batch size must be positive");
        }
        let mut order = (0..dataset.len()).collect::<Vec<_>>();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        Self {
            dataset,
            batch_size,
            count: 0,
            order,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn fetch_batch(&self, start: usize, len: usize) -> Batch {
        let dim = self.dataset.dim();
        let indices = &self.order[start..start + len];
        let mut images = Matrix::new(len, dim);
        if dim > 0 {
            images
                .as_mut_slice()
                .par_chunks_mut(dim)
                .zip(indices.par_iter())
                .for_each(|(to, &idx)| {
                    let (fetched_image, _) = self.dataset.fetch_item(idx);
                    to.copy_from_slice(fetched_image);
                });
        }
        let labels = indices
            .iter()
            .map(|&idx| self.dataset.fetch_item(idx).1)
            .collect();
        Batch { images, labels }
    }
}

impl<'a, T> Iterator for DataLoader<'a, T>
where
    T: DataSet,
{
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.count >= self.order.len() {
            None
        } else {
            let left = self.order.len() - self.count;
            let sz = min(left, self.batch_size);
            let ret = Some(self.fetch_batch(self.count, sz));
            self.count += sz;
            ret
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mnist::{MnistData, MEAN, STD};

    fn dataset(n: usize) -> MnistData {
        let images = (0..n * 784).map(|i| (i / 784) as u8).collect();
        let labels = (0..n).map(|i| (i % 10) as u8).collect();
        MnistData::from_raw(images, labels).unwrap()
    }

    #[test]
    fn batches_cover_the_dataset_once() {
        let data = dataset(130);
        let loader = DataLoader::new(&data, 64, 0);
        assert_eq!(loader.num_batches(), 3);
        let sizes: Vec<_> = loader.map(|b| b.len()).collect();
        assert_eq!(sizes, vec![64, 64, 2]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_batch() {
        let data = dataset(128);
        let loader = DataLoader::new(&data, 64, 0);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.count(), 2);
    }

    #[test]
    fn every_sample_appears_with_its_label() {
        let data = dataset(70);
        let mut seen = Vec::new();
        for batch in DataLoader::new(&data, 64, 9) {
            for (i, label) in batch.labels.iter().enumerate() {
                // pixels encode the sample index
                let pixel = batch.images.row_at(i)[0];
                let idx = ((pixel * STD + MEAN) * 255.0).round() as usize;
                assert_eq!(idx % 10, *label as usize);
                seen.push(idx);
            }
        }
        seen.sort();
        assert_eq!(seen, (0..70).collect::<Vec<_>>());
    }

    #[test]
    fn order_changes_between_seeds() {
        let data = dataset(64);
        let a = DataLoader::new(&data, 64, 1).next().unwrap().images;
        let b = DataLoader::new(&data, 64, 2).next().unwrap().images;
        assert_ne!(a, b);
    }
}
