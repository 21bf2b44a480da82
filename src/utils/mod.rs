pub mod dataloader;
pub mod downloader;
pub mod mat;
pub mod mnist;
pub mod nn_trait;

pub mod conv3x3;
pub mod dropout;
pub mod flatten;
pub mod head;
pub mod linear;
pub mod maxpool2x2;
pub mod network;
pub mod optimizer;
pub mod relu;
