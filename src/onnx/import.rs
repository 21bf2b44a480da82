use crate::onnx::{
    checker, tensor_proto::DataType, tensor_shape_proto::dimension, type_proto, AttributeProto,
    ModelProto, NodeProto, TensorProto, ValueInfoProto,
};
use crate::utils::conv3x3::Conv3x3;
use crate::utils::flatten::Flatten;
use crate::utils::head::{LogSoftmax, NllLoss};
use crate::utils::linear::LinearLayer;
use crate::utils::mat::Matrix;
use crate::utils::maxpool2x2::MaxPool2x2;
use crate::utils::network::Network;
use crate::utils::nn_trait::{Layer, Shape};
use crate::utils::relu::ReluLayer;
use anyhow::{anyhow, bail, ensure, Context, Result};
use protobuf::{Enum, Message};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub fn load_model(path: impl AsRef<Path>) -> Result<ModelProto> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    ModelProto::parse_from_bytes(&bytes)
        .with_context(|| format!("failed to parse ONNX model {}", path.display()))
}

/// Reads an exported model and rebuilds an inference network from it.
pub fn load_network(path: impl AsRef<Path>) -> Result<Network> {
    let path = path.as_ref();
    let model = load_model(path)?;
    checker::check_model(&model).with_context(|| format!("invalid model {}", path.display()))?;
    network_from_model(&model)
}

/// Rebuilds a network from a checked model. Only chains of the operators
/// the exporter writes are understood.
pub fn network_from_model(model: &ModelProto) -> Result<Network> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| anyhow!("model has no graph"))?;
    let initializers: HashMap<&str, &TensorProto> = graph
        .initializer
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();

    let input = graph
        .input
        .iter()
        .find(|i| !initializers.contains_key(i.name.as_str()))
        .ok_or_else(|| anyhow!("graph has no data input"))?;
    let input_shape = sample_shape(input)?;

    let mut layers: Vec<Box<dyn Layer>> = Vec::with_capacity(graph.node.len());
    let mut current = input.name.as_str();
    let mut shape = input_shape;
    for node in &graph.node {
        ensure!(
            node.input.first().map(String::as_str) == Some(current),
            "node `{}` does not continue the chain from `{current}`",
            node.name
        );
        let layer = build_layer(node, shape, &initializers)
            .with_context(|| format!("cannot rebuild node `{}`", node.name))?;
        shape = layer.output_shape(shape);
        debug!(node = %node.name, op = %node.op_type, ?shape, "rebuilt stage");
        layers.push(layer);
        current = node
            .output
            .first()
            .map(String::as_str)
            .ok_or_else(|| anyhow!("node `{}` has no output", node.name))?;
    }
    ensure!(
        graph.output.iter().any(|o| o.name == current),
        "last node output `{current}` is not a graph output"
    );

    let mut network = Network::new(layers, Box::new(NllLoss::new()), input_shape);
    network.set_training(false);
    Ok(network)
}

fn build_layer(
    node: &NodeProto,
    shape: Shape,
    initializers: &HashMap<&str, &TensorProto>,
) -> Result<Box<dyn Layer>> {
    let layer: Box<dyn Layer> = match node.op_type.as_str() {
        "Conv" => {
            let (channels, height, width) = image_dims(shape)?;
            let weight = initializer(node, 1, initializers)?;
            let dims = dims_of(weight);
            ensure!(
                dims.len() == 4 && dims[1] == channels && dims[2] == 3 && dims[3] == 3,
                "conv weight {dims:?} does not fit a 3x3 kernel over {channels} channels"
            );
            ensure!(attr_int(node, "group", 1) == 1, "grouped conv");
            ensure!(
                attr_ints(node, "dilations", &[1, 1]) == [1, 1],
                "dilated conv"
            );
            let stride = uniform(&attr_ints(node, "strides", &[1, 1]), "strides")?;
            ensure!(stride > 0, "conv stride must be positive");
            let padding = uniform(&attr_ints(node, "pads", &[0, 0, 0, 0]), "pads")?;
            let out_channels = dims[0];
            // [out, in, 3, 3] -> [9 * in, out]
            let weight =
                Matrix::from_vec(out_channels, channels * 9, float_values(weight)?).transpose();
            let bias = optional_bias(node, 2, out_channels, initializers)?;
            Box::new(Conv3x3::from_weights(
                channels, height, width, stride, padding, weight, bias,
            ))
        }
        "Relu" => Box::new(ReluLayer::new()),
        "MaxPool" => {
            let (channels, height, width) = image_dims(shape)?;
            ensure!(
                attr_ints(node, "kernel_shape", &[]) == [2, 2]
                    && attr_ints(node, "strides", &[1, 1]) == [2, 2]
                    && attr_ints(node, "pads", &[0, 0, 0, 0]) == [0, 0, 0, 0]
                    && attr_int(node, "ceil_mode", 0) == 0,
                "only 2x2 pooling with stride 2 is supported"
            );
            Box::new(MaxPool2x2::new(channels, height, width))
        }
        "Flatten" => {
            ensure!(attr_int(node, "axis", 1) == 1, "flatten must keep the batch axis");
            Box::new(Flatten::new())
        }
        "Gemm" => {
            let features = match shape {
                Shape::Flat(n) => n,
                Shape::Image { .. } => bail!("Gemm over an unflattened image"),
            };
            ensure!(
                attr_float(node, "alpha", 1.0) == 1.0 && attr_float(node, "beta", 1.0) == 1.0,
                "scaled Gemm"
            );
            ensure!(attr_int(node, "transA", 0) == 0, "transposed Gemm input");
            let weight = initializer(node, 1, initializers)?;
            let dims = dims_of(weight);
            ensure!(dims.len() == 2, "Gemm weight must be a matrix");
            let values = float_values(weight)?;
            let weight = if attr_int(node, "transB", 0) == 1 {
                Matrix::from_vec(dims[0], dims[1], values).transpose()
            } else {
                Matrix::from_vec(dims[0], dims[1], values)
            };
            ensure!(
                weight.number_of_row() == features,
                "Gemm weight expects {} features, got {features}",
                weight.number_of_row()
            );
            let bias = optional_bias(node, 2, weight.number_of_col(), initializers)?;
            Box::new(LinearLayer::from_weights(weight, bias))
        }
        "LogSoftmax" => {
            let axis = attr_int(node, "axis", -1);
            ensure!(axis == 1 || axis == -1, "LogSoftmax over axis {axis}");
            Box::new(LogSoftmax::new())
        }
        other => bail!("unsupported operator `{other}`"),
    };
    Ok(layer)
}

fn image_dims(shape: Shape) -> Result<(usize, usize, usize)> {
    match shape {
        Shape::Image {
            channels,
            height,
            width,
        } => Ok((channels, height, width)),
        Shape::Flat(_) => bail!("expected an image input, got {shape:?}"),
    }
}

fn uniform(values: &[i64], name: &str) -> Result<usize> {
    match values.first() {
        Some(&v) if v >= 0 && values.iter().all(|&x| x == v) => Ok(v as usize),
        _ => bail!("{name} {values:?} must be one non-negative value on every axis"),
    }
}

/// Per-sample shape of a graph input, skipping the batch axis.
fn sample_shape(info: &ValueInfoProto) -> Result<Shape> {
    let tensor = match info.type_.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor,
        _ => bail!("input `{}` is not a tensor", info.name),
    };
    let dims = tensor
        .shape
        .as_ref()
        .map(|shape| {
            shape
                .dim
                .iter()
                .skip(1)
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(v)) if *v > 0 => Ok(*v as usize),
                    _ => Err(anyhow!("input `{}` has a non-static sample axis", info.name)),
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    match dims[..] {
        [channels, height, width] => Ok(Shape::Image {
            channels,
            height,
            width,
        }),
        [n] => Ok(Shape::Flat(n)),
        _ => bail!("input `{}` has unsupported rank", info.name),
    }
}

fn initializer<'a>(
    node: &NodeProto,
    index: usize,
    initializers: &HashMap<&str, &'a TensorProto>,
) -> Result<&'a TensorProto> {
    let name = node
        .input
        .get(index)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| anyhow!("missing input {index}"))?;
    initializers
        .get(name.as_str())
        .copied()
        .ok_or_else(|| anyhow!("`{name}` is not an initializer"))
}

fn optional_bias(
    node: &NodeProto,
    index: usize,
    len: usize,
    initializers: &HashMap<&str, &TensorProto>,
) -> Result<Matrix> {
    if node.input.get(index).map_or(true, |n| n.is_empty()) {
        return Ok(Matrix::new(1, len));
    }
    let values = float_values(initializer(node, index, initializers)?)?;
    ensure!(values.len() == len, "bias holds {} values, expected {len}", values.len());
    Ok(Matrix::from_vec(1, len, values))
}

fn dims_of(tensor: &TensorProto) -> Vec<usize> {
    tensor.dims.iter().map(|&d| d as usize).collect()
}

fn float_values(tensor: &TensorProto) -> Result<Vec<f32>> {
    ensure!(
        DataType::from_i32(tensor.data_type) == Some(DataType::FLOAT),
        "tensor `{}` is not float",
        tensor.name
    );
    if tensor.raw_data.is_empty() {
        Ok(tensor.float_data.clone())
    } else {
        Ok(tensor
            .raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

fn attribute<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_int(node: &NodeProto, name: &str, default: i64) -> i64 {
    attribute(node, name).map_or(default, |a| a.i)
}

fn attr_float(node: &NodeProto, name: &str, default: f32) -> f32 {
    attribute(node, name).map_or(default, |a| a.f)
}

fn attr_ints(node: &NodeProto, name: &str, default: &[i64]) -> Vec<i64> {
    attribute(node, name).map_or_else(|| default.to_vec(), |a| a.ints.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::export::{export, to_model, ExportOptions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn batch(seed: u64) -> Matrix {
        let mut x = Matrix::new(3, 28 * 28);
        x.uniform_init(2.0, &mut StdRng::seed_from_u64(seed));
        x
    }

    fn assert_close(a: &Matrix, b: &Matrix) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }

    #[test]
    fn reloaded_network_computes_the_same_output() {
        let mut network = Network::digit_classifier(21);
        network.set_training(false);
        let model = to_model(&mut network, &ExportOptions::default()).unwrap();
        let mut reloaded = network_from_model(&model).unwrap();
        assert!(!reloaded.is_training());
        assert_eq!(reloaded.input_shape(), network.input_shape());
        assert_eq!(reloaded.parameter_values(), network.parameter_values());

        let x = batch(4);
        assert_close(&reloaded.forward(x.clone()), &network.forward(x));
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "digitnet-{}-loads_from_disk.onnx",
            std::process::id()
        ));
        let mut network = Network::digit_classifier(8);
        export(&mut network, &path, &ExportOptions::default()).unwrap();
        let mut reloaded = load_network(&path).unwrap();
        fs::remove_file(&path).unwrap();

        network.set_training(false);
        let x = batch(5);
        let expected = network.forward(x.clone());
        let got = reloaded.forward(x);
        assert_close(&got, &expected);
        assert_eq!(reloaded.get_result(&got), network.get_result(&expected));
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("digitnet-no-such-model.onnx");
        assert!(load_network(path).is_err());
    }

    #[test]
    fn rejects_unknown_operators() {
        let mut network = Network::digit_classifier(1);
        let mut model = to_model(&mut network, &ExportOptions::default()).unwrap();
        model.graph.as_mut().unwrap().node[1].op_type = "Sigmoid".to_string();
        assert!(network_from_model(&model).is_err());
    }
}
