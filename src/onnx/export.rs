use crate::onnx::{
    attribute_proto::AttributeType, checker, import, tensor_proto::DataType,
    tensor_shape_proto::{self, dimension},
    type_proto, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, BATCH_DIM, INPUT_NAME,
    IR_VERSION, OPSET_VERSION, OUTPUT_NAME,
};
use crate::utils::mat::Matrix;
use crate::utils::network::Network;
use crate::utils::nn_trait::{LayerSpec, Shape};
use anyhow::{bail, Context, Result};
use protobuf::{Enum, EnumOrUnknown, Message, MessageField};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub struct ExportOptions {
    pub opset_version: i64,
    /// Seed of the representative input traced through the network.
    pub seed: u64,
    pub graph_name: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            opset_version: OPSET_VERSION,
            seed: 0,
            graph_name: "main_graph".to_string(),
        }
    }
}

/// Writes `network` to `path` as an ONNX model, then reads the file back and
/// checks it. Returns the model as it was read from disk.
pub fn export(
    network: &mut Network,
    path: impl AsRef<Path>,
    options: &ExportOptions,
) -> Result<ModelProto> {
    let path = path.as_ref();
    let model = to_model(network, options)?;
    let bytes = model
        .write_to_bytes()
        .context("failed to serialize the ONNX model")?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;

    let reloaded = import::load_model(path)?;
    checker::check_model(&reloaded)
        .with_context(|| format!("exported model {} is invalid", path.display()))?;
    info!(path = %path.display(), "model exported to ONNX and validated");
    Ok(reloaded)
}

/// Builds the ONNX graph of `network` by tracing one random sample through
/// it in evaluation mode. The training flag is restored afterwards.
pub fn to_model(network: &mut Network, options: &ExportOptions) -> Result<ModelProto> {
    let input_shape = network.input_shape();
    let mut sample = Matrix::new(1, input_shape.len());
    sample.uniform_init(1.0, &mut StdRng::seed_from_u64(options.seed));

    let was_training = network.is_training();
    network.set_training(false);
    let shapes = network.trace(sample);
    network.set_training(was_training);

    let mut builder = GraphBuilder::default();
    let mut current = INPUT_NAME.to_string();
    let mut output_shape = input_shape;
    for (layer, shape) in network.layers().iter().zip(shapes) {
        let emitted = builder.emit(layer.spec(), &current);
        if let Some(output) = emitted {
            builder.value_info.push(value_info(&output, shape));
            current = output;
            output_shape = shape;
        }
    }
    if builder.nodes.is_empty() {
        bail!("network has no stage to export");
    }

    // the last activation becomes the graph output
    builder.value_info.pop();
    if let Some(last) = builder.nodes.last_mut() {
        last.output = vec![OUTPUT_NAME.to_string()];
    }

    let graph = GraphProto {
        name: options.graph_name.clone(),
        node: builder.nodes,
        initializer: builder.initializers,
        input: vec![value_info(INPUT_NAME, input_shape)],
        output: vec![value_info(OUTPUT_NAME, output_shape)],
        value_info: builder.value_info,
        ..Default::default()
    };
    Ok(ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: options.opset_version,
            ..Default::default()
        }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: MessageField::some(graph),
        ..Default::default()
    })
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    value_info: Vec<ValueInfoProto>,
    // occurrences of every node name and parameter scope
    counts: HashMap<String, usize>,
}

impl GraphBuilder {
    fn next(&mut self, key: &str) -> usize {
        let n = self.counts.entry(key.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn node_name(&mut self, scope: Option<&str>, op_type: &str) -> String {
        let base = match scope {
            Some(scope) => format!("/{scope}/{op_type}"),
            None => format!("/{op_type}"),
        };
        match self.next(&base) {
            1 => base,
            n => format!("{base}_{}", n - 1),
        }
    }

    fn add_initializer(&mut self, name: String, dims: &[usize], values: &[f32]) -> String {
        self.initializers.push(TensorProto {
            name: name.clone(),
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: DataType::FLOAT.value(),
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        });
        name
    }

    fn push_node(
        &mut self,
        scope: Option<&str>,
        op_type: &str,
        inputs: Vec<String>,
        attribute: Vec<AttributeProto>,
    ) -> String {
        let name = self.node_name(scope, op_type);
        let output = format!("{name}_output_0");
        self.nodes.push(NodeProto {
            input: inputs,
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute,
            ..Default::default()
        });
        output
    }

    /// Appends the nodes of one stage reading `input` and returns the name
    /// of the value it produces. Stages that are identities at inference
    /// time emit nothing.
    fn emit(&mut self, spec: LayerSpec<'_>, input: &str) -> Option<String> {
        let input = input.to_string();
        let output = match spec {
            LayerSpec::Conv {
                weight,
                bias,
                in_channels,
                out_channels,
                stride,
                padding,
            } => {
                let scope = format!("conv{}", self.next("conv"));
                // [9 * in, out] -> [out, in, 3, 3]
                let w = self.add_initializer(
                    format!("{scope}.weight"),
                    &[out_channels, in_channels, 3, 3],
                    weight.transpose().as_slice(),
                );
                let b = self.add_initializer(
                    format!("{scope}.bias"),
                    &[out_channels],
                    bias.as_slice(),
                );
                let (s, p) = (stride as i64, padding as i64);
                self.push_node(
                    Some(&scope),
                    "Conv",
                    vec![input, w, b],
                    vec![
                        attr_ints("dilations", &[1, 1]),
                        attr_int("group", 1),
                        attr_ints("kernel_shape", &[3, 3]),
                        attr_ints("pads", &[p, p, p, p]),
                        attr_ints("strides", &[s, s]),
                    ],
                )
            }
            LayerSpec::Relu => self.push_node(None, "Relu", vec![input], vec![]),
            LayerSpec::MaxPool2x2 => self.push_node(
                Some("max_pool2d"),
                "MaxPool",
                vec![input],
                vec![
                    attr_int("ceil_mode", 0),
                    attr_ints("kernel_shape", &[2, 2]),
                    attr_ints("pads", &[0, 0, 0, 0]),
                    attr_ints("strides", &[2, 2]),
                ],
            ),
            LayerSpec::Dropout { p } => {
                debug!(p, "dropout is an identity at inference, skipped");
                return None;
            }
            LayerSpec::Flatten => {
                self.push_node(None, "Flatten", vec![input], vec![attr_int("axis", 1)])
            }
            LayerSpec::Linear { weight, bias } => {
                let scope = format!("fc{}", self.next("fc"));
                let (in_features, out_features) = weight.shape();
                // stored as [in, out], exported transposed for transB
                let w = self.add_initializer(
                    format!("{scope}.weight"),
                    &[out_features, in_features],
                    weight.transpose().as_slice(),
                );
                let b = self.add_initializer(
                    format!("{scope}.bias"),
                    &[out_features],
                    bias.as_slice(),
                );
                self.push_node(
                    Some(&scope),
                    "Gemm",
                    vec![input, w, b],
                    vec![
                        attr_float("alpha", 1.0),
                        attr_float("beta", 1.0),
                        attr_int("transB", 1),
                    ],
                )
            }
            LayerSpec::LogSoftmax => {
                self.push_node(None, "LogSoftmax", vec![input], vec![attr_int("axis", 1)])
            }
        };
        Some(output)
    }
}

fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        type_: EnumOrUnknown::new(AttributeType::INT),
        i: value,
        ..Default::default()
    }
}

fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        type_: EnumOrUnknown::new(AttributeType::INTS),
        ints: values.to_vec(),
        ..Default::default()
    }
}

fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        type_: EnumOrUnknown::new(AttributeType::FLOAT),
        f: value,
        ..Default::default()
    }
}

fn dim(value: dimension::Value) -> tensor_shape_proto::Dimension {
    tensor_shape_proto::Dimension {
        value: Some(value),
        ..Default::default()
    }
}

/// A float tensor whose leading axis is the symbolic batch dimension.
fn value_info(name: &str, shape: Shape) -> ValueInfoProto {
    let mut dims = vec![dim(dimension::Value::DimParam(BATCH_DIM.to_string()))];
    dims.extend(
        shape
            .dims()
            .into_iter()
            .map(|d| dim(dimension::Value::DimValue(d as i64))),
    );
    let tensor = type_proto::Tensor {
        elem_type: DataType::FLOAT.value(),
        shape: MessageField::some(TensorShapeProto {
            dim: dims,
            ..Default::default()
        }),
        ..Default::default()
    };
    ValueInfoProto {
        name: name.to_string(),
        type_: MessageField::some(TypeProto {
            value: Some(type_proto::Value::TensorType(tensor)),
            ..Default::default()
        }),
        ..Default::default()
    }
}
