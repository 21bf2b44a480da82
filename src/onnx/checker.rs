use crate::onnx::{
    attribute_proto::AttributeType, tensor_proto::DataType, tensor_shape_proto::dimension,
    type_proto, GraphProto, ModelProto, NodeProto, TensorProto, ValueInfoProto,
};
use protobuf::Enum;
use std::collections::HashSet;

/// Newest IR version this checker understands.
pub const MAX_IR_VERSION: i64 = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckError {
    #[error("ir_version {0} is not supported")]
    UnsupportedIrVersion(i64),
    #[error("model does not import the default operator set")]
    MissingOpset,
    #[error("opset {0} is not supported")]
    UnsupportedOpset(i64),
    #[error("opset {opset} needs ir_version >= {required}, model declares {found}")]
    IrTooOld {
        opset: i64,
        required: i64,
        found: i64,
    },
    #[error("model has no graph")]
    MissingGraph,
    #[error("graph has no name")]
    UnnamedGraph,
    #[error("`{0}` is defined more than once")]
    DuplicateName(String),
    #[error("value `{0}` has no tensor type")]
    MissingType(String),
    #[error("value `{0}` has an undefined element type")]
    UndefinedElementType(String),
    #[error("value `{name}` has negative dimension {dim}")]
    NegativeDimension { name: String, dim: i64 },
    #[error("initializer has no name")]
    UnnamedInitializer,
    #[error("initializer `{name}` has unsupported data type {data_type}")]
    UnsupportedDataType { name: String, data_type: i32 },
    #[error("initializer `{name}` holds {found} values, its dims imply {expected}")]
    InitializerSize {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("dims of initializer `{0}` overflow the element count")]
    DimensionOverflow(String),
    #[error("node `{0}` has no op_type")]
    MissingOpType(String),
    #[error("operator `{0}` is not registered")]
    UnknownOperator(String),
    #[error("node `{node}` ({op_type}) takes {min} to {max} inputs, got {found}")]
    InputArity {
        node: String,
        op_type: String,
        min: usize,
        max: usize,
        found: usize,
    },
    #[error("node `{node}` ({op_type}) produces {min} to {max} outputs, got {found}")]
    OutputArity {
        node: String,
        op_type: String,
        min: usize,
        max: usize,
        found: usize,
    },
    #[error("node `{node}` reads `{input}` before it is produced")]
    UndefinedInput { node: String, input: String },
    #[error("node `{0}` has an attribute without a name")]
    UnnamedAttribute(String),
    #[error("attribute `{attribute}` of node `{node}` has no type")]
    UntypedAttribute { node: String, attribute: String },
    #[error("graph output `{0}` is never produced")]
    UnproducedOutput(String),
}

/// Oldest IR version able to carry a default-domain opset.
fn min_ir_version(opset: i64) -> Option<i64> {
    match opset {
        1..=8 => Some(3),
        9 => Some(4),
        10 => Some(5),
        11 => Some(6),
        12..=14 => Some(7),
        15..=18 => Some(8),
        19..=20 => Some(9),
        21 => Some(10),
        _ => None,
    }
}

// (min inputs, max inputs, min outputs, max outputs)
fn arity(op_type: &str) -> Option<(usize, usize, usize, usize)> {
    match op_type {
        "Conv" => Some((2, 3, 1, 1)),
        "Gemm" => Some((2, 3, 1, 1)),
        "MaxPool" => Some((1, 1, 1, 2)),
        "Relu" | "Flatten" | "LogSoftmax" | "Softmax" | "Dropout" | "Identity" => {
            Some((1, 1, 1, 1))
        }
        _ => None,
    }
}

/// Structural validation of a model: versions, graph wiring, tensor
/// payloads and node signatures. Values are not evaluated.
pub fn check_model(model: &ModelProto) -> Result<(), CheckError> {
    if model.ir_version < 3 || model.ir_version > MAX_IR_VERSION {
        return Err(CheckError::UnsupportedIrVersion(model.ir_version));
    }
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .ok_or(CheckError::MissingOpset)?
        .version;
    let required = min_ir_version(opset).ok_or(CheckError::UnsupportedOpset(opset))?;
    if model.ir_version < required {
        return Err(CheckError::IrTooOld {
            opset,
            required,
            found: model.ir_version,
        });
    }
    let graph = model.graph.as_ref().ok_or(CheckError::MissingGraph)?;
    check_graph(graph)
}

pub fn check_graph(graph: &GraphProto) -> Result<(), CheckError> {
    if graph.name.is_empty() {
        return Err(CheckError::UnnamedGraph);
    }

    let mut defined = HashSet::new();
    for init in &graph.initializer {
        check_initializer(init)?;
        if !defined.insert(init.name.as_str()) {
            return Err(CheckError::DuplicateName(init.name.clone()));
        }
    }
    for input in &graph.input {
        check_value_info(input)?;
        // an input may also carry a default through an initializer of the same name
        if !defined.insert(input.name.as_str()) && !is_initializer(graph, &input.name) {
            return Err(CheckError::DuplicateName(input.name.clone()));
        }
    }
    for info in graph.output.iter().chain(graph.value_info.iter()) {
        check_value_info(info)?;
    }

    for node in &graph.node {
        check_node(node)?;
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(CheckError::UndefinedInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output.as_str()) {
                return Err(CheckError::DuplicateName(output.clone()));
            }
        }
    }

    for output in &graph.output {
        if !defined.contains(output.name.as_str()) {
            return Err(CheckError::UnproducedOutput(output.name.clone()));
        }
    }
    Ok(())
}

fn is_initializer(graph: &GraphProto, name: &str) -> bool {
    graph.initializer.iter().any(|init| init.name == name)
}

fn check_node(node: &NodeProto) -> Result<(), CheckError> {
    if node.op_type.is_empty() {
        return Err(CheckError::MissingOpType(node.name.clone()));
    }
    if !node.domain.is_empty() && node.domain != "ai.onnx" {
        return Err(CheckError::UnknownOperator(format!(
            "{}::{}",
            node.domain, node.op_type
        )));
    }
    let (min_in, max_in, min_out, max_out) =
        arity(&node.op_type).ok_or_else(|| CheckError::UnknownOperator(node.op_type.clone()))?;
    // trailing empty names stand for omitted optional inputs
    let inputs = node
        .input
        .iter()
        .rposition(|i| !i.is_empty())
        .map_or(0, |last| last + 1);
    if inputs < min_in || inputs > max_in {
        return Err(CheckError::InputArity {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
            min: min_in,
            max: max_in,
            found: inputs,
        });
    }
    let outputs = node.output.len();
    if outputs < min_out || outputs > max_out {
        return Err(CheckError::OutputArity {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
            min: min_out,
            max: max_out,
            found: outputs,
        });
    }

    let mut seen = HashSet::new();
    for attr in &node.attribute {
        if attr.name.is_empty() {
            return Err(CheckError::UnnamedAttribute(node.name.clone()));
        }
        if !seen.insert(attr.name.as_str()) {
            return Err(CheckError::DuplicateName(format!(
                "{}.{}",
                node.name, attr.name
            )));
        }
        match attr.type_.enum_value() {
            Ok(AttributeType::UNDEFINED) | Err(_) => {
                return Err(CheckError::UntypedAttribute {
                    node: node.name.clone(),
                    attribute: attr.name.clone(),
                })
            }
            Ok(_) => {}
        }
    }
    Ok(())
}

fn check_value_info(info: &ValueInfoProto) -> Result<(), CheckError> {
    let tensor = match info.type_.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => tensor,
        _ => return Err(CheckError::MissingType(info.name.clone())),
    };
    match DataType::from_i32(tensor.elem_type) {
        None | Some(DataType::UNDEFINED) => {
            return Err(CheckError::UndefinedElementType(info.name.clone()))
        }
        Some(_) => {}
    }
    if let Some(shape) = tensor.shape.as_ref() {
        for dim in &shape.dim {
            if let Some(dimension::Value::DimValue(d)) = &dim.value {
                if *d < 0 {
                    return Err(CheckError::NegativeDimension {
                        name: info.name.clone(),
                        dim: *d,
                    });
                }
            }
        }
    }
    Ok(())
}

fn element_width(data_type: i32) -> Option<usize> {
    match DataType::from_i32(data_type)? {
        DataType::UINT8 | DataType::INT8 | DataType::BOOL => Some(1),
        DataType::UINT16 | DataType::INT16 | DataType::FLOAT16 | DataType::BFLOAT16 => Some(2),
        DataType::FLOAT | DataType::INT32 | DataType::UINT32 => Some(4),
        DataType::DOUBLE | DataType::INT64 | DataType::UINT64 | DataType::COMPLEX64 => Some(8),
        _ => None,
    }
}

fn check_initializer(init: &TensorProto) -> Result<(), CheckError> {
    if init.name.is_empty() {
        return Err(CheckError::UnnamedInitializer);
    }
    let width = element_width(init.data_type).ok_or_else(|| CheckError::UnsupportedDataType {
        name: init.name.clone(),
        data_type: init.data_type,
    })?;
    let mut expected = 1usize;
    for &d in &init.dims {
        if d < 0 {
            return Err(CheckError::NegativeDimension {
                name: init.name.clone(),
                dim: d,
            });
        }
        expected = usize::try_from(d)
            .ok()
            .and_then(|d| expected.checked_mul(d))
            .ok_or_else(|| CheckError::DimensionOverflow(init.name.clone()))?;
    }
    let found = if !init.raw_data.is_empty() {
        if init.raw_data.len() % width != 0 {
            return Err(CheckError::InitializerSize {
                name: init.name.clone(),
                expected,
                found: init.raw_data.len() / width,
            });
        }
        init.raw_data.len() / width
    } else {
        init.float_data.len()
            + init.int32_data.len()
            + init.int64_data.len()
            + init.double_data.len()
            + init.uint64_data.len()
    };
    if found != expected {
        return Err(CheckError::InitializerSize {
            name: init.name.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::export::{to_model, ExportOptions};
    use crate::utils::network::Network;
    use protobuf::{EnumOrUnknown, MessageField};

    fn model() -> ModelProto {
        let mut network = Network::digit_classifier(5);
        to_model(&mut network, &ExportOptions::default()).unwrap()
    }

    fn graph_mut(model: &mut ModelProto) -> &mut GraphProto {
        model.graph.as_mut().unwrap()
    }

    #[test]
    fn exported_model_passes() {
        assert_eq!(check_model(&model()), Ok(()));
    }

    #[test]
    fn rejects_missing_graph_and_versions() {
        let mut m = model();
        m.graph = MessageField::none();
        assert_eq!(check_model(&m), Err(CheckError::MissingGraph));

        let mut m = model();
        m.ir_version = 5;
        assert_eq!(
            check_model(&m),
            Err(CheckError::IrTooOld {
                opset: 11,
                required: 6,
                found: 5
            })
        );

        let mut m = model();
        m.opset_import.clear();
        assert_eq!(check_model(&m), Err(CheckError::MissingOpset));

        let mut m = model();
        m.opset_import[0].version = 99;
        assert_eq!(check_model(&m), Err(CheckError::UnsupportedOpset(99)));
    }

    #[test]
    fn rejects_truncated_initializer() {
        let mut m = model();
        let init = &mut graph_mut(&mut m).initializer[0];
        init.raw_data.truncate(8);
        assert!(matches!(
            check_model(&m),
            Err(CheckError::InitializerSize { found: 2, .. })
        ));
    }

    #[test]
    fn rejects_overflowing_initializer_dims() {
        let mut m = model();
        let mut init = TensorProto::new();
        init.name = "huge".to_string();
        init.data_type = DataType::FLOAT.value();
        init.dims = vec![1 << 32, 1 << 32];
        graph_mut(&mut m).initializer.push(init);
        assert_eq!(
            check_model(&m),
            Err(CheckError::DimensionOverflow("huge".to_string()))
        );
    }

    #[test]
    fn rejects_out_of_order_nodes() {
        let mut m = model();
        graph_mut(&mut m).node.swap(0, 1);
        assert!(matches!(
            check_model(&m),
            Err(CheckError::UndefinedInput { .. })
        ));
    }

    #[test]
    fn rejects_dangling_output_and_duplicates() {
        let mut m = model();
        graph_mut(&mut m).output[0].name = "nowhere".to_string();
        assert_eq!(
            check_model(&m),
            Err(CheckError::UnproducedOutput("nowhere".to_string()))
        );

        let mut m = model();
        let graph = graph_mut(&mut m);
        let first = graph.initializer[0].clone();
        graph.initializer.push(first);
        assert!(matches!(
            check_model(&m),
            Err(CheckError::DuplicateName(_))
        ));
    }

    #[test]
    fn rejects_bad_nodes() {
        let mut m = model();
        graph_mut(&mut m).node[0].op_type = "Frobnicate".to_string();
        assert_eq!(
            check_model(&m),
            Err(CheckError::UnknownOperator("Frobnicate".to_string()))
        );

        let mut m = model();
        graph_mut(&mut m).node[0].input.truncate(1);
        assert!(matches!(
            check_model(&m),
            Err(CheckError::InputArity { found: 1, .. })
        ));

        let mut m = model();
        graph_mut(&mut m).node[0].attribute[0].type_ =
            EnumOrUnknown::new(AttributeType::UNDEFINED);
        assert!(matches!(
            check_model(&m),
            Err(CheckError::UntypedAttribute { .. })
        ));
    }

    #[test]
    fn rejects_untyped_input() {
        let mut m = model();
        graph_mut(&mut m).input[0].type_ = MessageField::none();
        assert_eq!(
            check_model(&m),
            Err(CheckError::MissingType("input".to_string()))
        );
    }
}
