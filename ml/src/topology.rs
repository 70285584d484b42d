//! Serialized model description.
//!
//! The layout follows the functional-model JSON Keras writes: a list of layers, each with
//! its class name, its configuration and the layers it is called on, plus the names of
//! the model inputs and outputs. Layers are listed in graph order, so every inbound
//! reference points at an earlier layer.
use crate::{
    activation_functions::Activation,
    graph::{
        BatchNormParams, Conv2DParams, Conv2DTransposeParams, GraphError, GraphResult,
        LayerGraph, LayerKind, PoolingParams,
    },
};
use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fs, path::Path};

/// Indentation of the pretty printed description.
const INDENT: &[u8] = b"   ";

#[derive(Debug, Serialize, Deserialize)]
struct ModelDescription {
    class_name: String,
    config: ModelConfig,
    #[serde(default)]
    backend: Option<String>,
}

/// (layer name, node index, tensor index)
type TensorReference = (String, usize, usize);

#[derive(Debug, Serialize, Deserialize)]
struct ModelConfig {
    name: String,
    layers: Vec<LayerDescription>,
    input_layers: Vec<TensorReference>,
    output_layers: Vec<TensorReference>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerDescription {
    name: String,
    class_name: String,
    config: Value,
    /// One call of the layer, listing (layer name, node index, tensor index, call kwargs).
    inbound_nodes: Vec<Vec<(String, usize, usize, Map<String, Value>)>>,
}

#[derive(Serialize, Deserialize)]
struct InputConfig {
    batch_input_shape: Vec<Option<usize>>,
    dtype: String,
}

#[derive(Serialize, Deserialize)]
struct ActivationConfig {
    activation: Activation,
}

#[derive(Serialize, Deserialize)]
struct DropoutConfig {
    rate: f32,
}

#[derive(Serialize, Deserialize)]
struct ConcatenateConfig {
    axis: isize,
}

#[derive(Serialize, Deserialize)]
struct ReshapeConfig {
    target_shape: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct PermuteConfig {
    dims: Vec<usize>,
}

/// Serializes the layer configuration and adds the name and trainable flag Keras puts there.
fn layer_config<T: Serialize>(name: &str, params: &T) -> GraphResult<Value> {
    let mut config = serde_json::to_value(params)?;
    if let Value::Object(map) = &mut config {
        map.insert("name".to_string(), Value::String(name.to_string()));
        map.insert("trainable".to_string(), Value::Bool(true));
    }
    Ok(config)
}

fn describe(kind: &LayerKind, name: &str) -> GraphResult<Value> {
    match kind {
        LayerKind::Input { shape } => layer_config(
            name,
            &InputConfig {
                batch_input_shape: std::iter::once(None)
                    .chain(shape.iter().map(|&d| Some(d)))
                    .collect(),
                dtype: "float32".to_string(),
            },
        ),
        LayerKind::Conv2D(params) => layer_config(name, params),
        LayerKind::Conv2DTranspose(params) => layer_config(name, params),
        LayerKind::BatchNormalization(params) => layer_config(name, params),
        LayerKind::Activation(activation) => layer_config(
            name,
            &ActivationConfig {
                activation: *activation,
            },
        ),
        LayerKind::Dropout { rate } => layer_config(name, &DropoutConfig { rate: *rate }),
        LayerKind::MaxPooling2D(params) => layer_config(name, params),
        LayerKind::Concatenate { axis } => {
            layer_config(name, &ConcatenateConfig { axis: *axis })
        }
        LayerKind::Reshape { target_shape } => layer_config(
            name,
            &ReshapeConfig {
                target_shape: target_shape.clone(),
            },
        ),
        LayerKind::Permute { dims } => layer_config(name, &PermuteConfig { dims: dims.clone() }),
    }
}

fn parse<T: DeserializeOwned>(config: &Value) -> GraphResult<T> {
    Ok(T::deserialize(config)?)
}

fn layer_kind(class_name: &str, config: &Value) -> GraphResult<LayerKind> {
    Ok(match class_name {
        "InputLayer" => {
            let input: InputConfig = parse(config)?;
            let shape = input
                .batch_input_shape
                .iter()
                .skip(1)
                .map(|d| {
                    d.ok_or_else(|| {
                        GraphError::UnsupportedLayer(
                            "input layers need a fully defined shape".to_string(),
                        )
                    })
                })
                .collect::<GraphResult<Vec<_>>>()?;
            LayerKind::Input { shape }
        }
        "Conv2D" => LayerKind::Conv2D(parse::<Conv2DParams>(config)?),
        "Conv2DTranspose" => LayerKind::Conv2DTranspose(parse::<Conv2DTransposeParams>(config)?),
        "BatchNormalization" => LayerKind::BatchNormalization(parse::<BatchNormParams>(config)?),
        "Activation" => LayerKind::Activation(parse::<ActivationConfig>(config)?.activation),
        "Dropout" => LayerKind::Dropout {
            rate: parse::<DropoutConfig>(config)?.rate,
        },
        "MaxPooling2D" => LayerKind::MaxPooling2D(parse::<PoolingParams>(config)?),
        "Concatenate" => LayerKind::Concatenate {
            axis: parse::<ConcatenateConfig>(config)?.axis,
        },
        "Reshape" => LayerKind::Reshape {
            target_shape: parse::<ReshapeConfig>(config)?.target_shape,
        },
        "Permute" => LayerKind::Permute {
            dims: parse::<PermuteConfig>(config)?.dims,
        },
        other => return Err(GraphError::UnsupportedLayer(other.to_string())),
    })
}

/// Renders the graph as a model description, pretty printed with an indent of three spaces.
pub fn to_json(graph: &LayerGraph) -> GraphResult<String> {
    let nodes = graph.nodes();
    let reference = |id: usize| (nodes[id].name.clone(), 0, 0);

    let layers = nodes
        .iter()
        .map(|node| {
            let inbound: Vec<_> = node
                .inputs
                .iter()
                .map(|&i| (nodes[i].name.clone(), 0, 0, Map::new()))
                .collect();
            Ok(LayerDescription {
                name: node.name.clone(),
                class_name: node.kind.class_name().to_string(),
                config: describe(&node.kind, &node.name)?,
                inbound_nodes: if inbound.is_empty() {
                    vec![]
                } else {
                    vec![inbound]
                },
            })
        })
        .collect::<GraphResult<Vec<_>>>()?;

    let description = ModelDescription {
        class_name: "Model".to_string(),
        config: ModelConfig {
            name: graph.name().to_string(),
            layers,
            input_layers: graph.inputs().iter().map(|&i| reference(i)).collect(),
            output_layers: graph.outputs().iter().map(|&i| reference(i)).collect(),
        },
        backend: Some("ndarray".to_string()),
    };

    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    description.serialize(&mut serializer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Rebuilds the graph from a model description. Output shapes are inferred again,
/// so a description with inconsistent shapes is rejected.
pub fn from_json(raw: &str) -> GraphResult<LayerGraph> {
    let description: ModelDescription = serde_json::from_str(raw)?;
    if description.class_name != "Model" && description.class_name != "Functional" {
        return Err(GraphError::UnsupportedLayer(description.class_name));
    }
    let config = description.config;
    let mut graph = LayerGraph::new(config.name);

    for layer in &config.layers {
        let kind = layer_kind(&layer.class_name, &layer.config)?;
        let calls = layer.inbound_nodes.len();
        if calls > 1 {
            return Err(GraphError::UnsupportedLayer(format!(
                "{} is called {} times, shared layers are not supported",
                layer.name, calls
            )));
        }
        let inputs = layer
            .inbound_nodes
            .iter()
            .flatten()
            .map(|(name, _, _, _)| graph.node_by_name(name))
            .collect::<GraphResult<Vec<_>>>()?;
        graph.add_named(layer.name.clone(), kind, &inputs)?;
    }

    for (name, _, _) in &config.input_layers {
        let id = graph.node_by_name(name)?;
        graph.mark_input(id)?;
    }
    let outputs = config
        .output_layers
        .iter()
        .map(|(name, _, _)| graph.node_by_name(name))
        .collect::<GraphResult<Vec<_>>>()?;
    graph.set_outputs(outputs)?;
    Ok(graph)
}

/// Writes the model description to `path`.
pub fn save<P: AsRef<Path>>(graph: &LayerGraph, path: P) -> GraphResult<()> {
    let json = to_json(graph)?;
    fs::write(path.as_ref(), json)?;
    info!("wrote topology of {} to {}", graph.name(), path.as_ref().display());
    Ok(())
}

/// Reads a model description from `path`.
pub fn load<P: AsRef<Path>>(path: P) -> GraphResult<LayerGraph> {
    let raw = fs::read_to_string(path.as_ref())?;
    let graph = from_json(&raw)?;
    info!(
        "loaded topology of {} ({} layers) from {}",
        graph.name(),
        graph.len(),
        path.as_ref().display()
    );
    Ok(graph)
}
