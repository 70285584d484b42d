//! The layer graph: a DAG of tensor producing operations with a fixed shape contract per node.
//!
//! Nodes are stored in insertion order. A node can only consume nodes that already exist,
//! so the storage order is a topological order and the graph is evaluated front to back.
//! Shapes are per sample, the batch dimension is never part of them.
use crate::{
    activation_functions::Activation,
    convolutions::{conv_output_length, Padding},
    normalization::BATCH_NORM_EPSILON,
    transposed_convolutions::deconv_output_length,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;

pub type NodeId = usize;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Layer {layer} ({class_name}) rejected input shapes {inputs:?}: {reason}")]
    ShapeError {
        layer: String,
        class_name: &'static str,
        inputs: Vec<Vec<usize>>,
        reason: String,
    },
    #[error("A layer with name {0} already exists")]
    DuplicateName(String),
    #[error("No layer with name {0} found")]
    UnknownLayer(String),
    #[error("Node {0} does not exist")]
    UnknownNode(NodeId),
    #[error("No registry entry {step} in stage {stage}")]
    UnknownRegistryEntry { stage: String, step: String },
    #[error("Unsupported layer type {0}")]
    UnsupportedLayer(String),
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("Model description is not valid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Model description could not be accessed. Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
    #[error("Model description is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Only channels-last data is supported, Keras' "channels_first" is rejected when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    #[serde(rename = "channels_last")]
    ChannelsLast,
}

impl Default for DataFormat {
    fn default() -> Self {
        DataFormat::ChannelsLast
    }
}

/// Weight regularizer. Only recorded in the topology, inference ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config")]
pub enum Regularizer {
    L1L2 { l1: f32, l2: f32 },
}

impl Regularizer {
    pub fn l2(l2: f32) -> Self {
        Regularizer::L1L2 { l1: 0.0, l2 }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2DParams {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    pub padding: Padding,
    #[serde(default)]
    pub data_format: DataFormat,
    pub activation: Activation,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    pub kernel_initializer: String,
    #[serde(default)]
    pub kernel_regularizer: Option<Regularizer>,
}

impl Conv2DParams {
    /// A bias carrying, linear, he-uniform initialized convolution.
    pub fn new(filters: usize, kernel_size: (usize, usize), strides: (usize, usize)) -> Self {
        Self {
            filters,
            kernel_size,
            strides,
            padding: Padding::Same,
            data_format: DataFormat::ChannelsLast,
            activation: Activation::Linear,
            use_bias: true,
            kernel_initializer: "he_uniform".to_string(),
            kernel_regularizer: None,
        }
    }

    pub fn with_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.kernel_regularizer = Some(regularizer);
        self
    }
}

/// Transposed convolution. The shape hints are declared in channels-first order:
/// input `(channels, height, width)` and output `(batch, channels, height, width)`.
/// Only their spatial extents (and the output channel count) are checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2DTransposeParams {
    #[serde(flatten)]
    pub conv: Conv2DParams,
    #[serde(rename = "input_shape", default)]
    pub input_shape_hint: Option<Vec<Option<usize>>>,
    #[serde(rename = "output_shape", default)]
    pub output_shape_hint: Option<Vec<Option<usize>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    /// Axis including the batch dimension, Keras style. Has to be the channel axis.
    pub axis: isize,
    pub epsilon: f32,
    pub momentum: f32,
    #[serde(default)]
    pub gamma_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub beta_regularizer: Option<Regularizer>,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        Self {
            axis: -1,
            epsilon: BATCH_NORM_EPSILON,
            momentum: 0.99,
            gamma_regularizer: None,
            beta_regularizer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingParams {
    pub pool_size: (usize, usize),
    pub strides: (usize, usize),
    pub padding: Padding,
    #[serde(default)]
    pub data_format: DataFormat,
}

/// The operation a node performs.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input { shape: Vec<usize> },
    Conv2D(Conv2DParams),
    Conv2DTranspose(Conv2DTransposeParams),
    BatchNormalization(BatchNormParams),
    Activation(Activation),
    Dropout { rate: f32 },
    MaxPooling2D(PoolingParams),
    /// Axis including the batch dimension, negative values count from the back.
    Concatenate { axis: isize },
    Reshape { target_shape: Vec<usize> },
    /// 1-based permutation of the non-batch axes, as Keras' Permute layer takes it.
    Permute { dims: Vec<usize> },
}

impl LayerKind {
    /// Keras class name, used for serialization and summaries.
    pub fn class_name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "InputLayer",
            LayerKind::Conv2D(_) => "Conv2D",
            LayerKind::Conv2DTranspose(_) => "Conv2DTranspose",
            LayerKind::BatchNormalization(_) => "BatchNormalization",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Dropout { .. } => "Dropout",
            LayerKind::MaxPooling2D(_) => "MaxPooling2D",
            LayerKind::Concatenate { .. } => "Concatenate",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Permute { .. } => "Permute",
        }
    }

    /// Prefix for automatically generated names (`conv2d_1`, `conv2d_2`, ...).
    fn name_prefix(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "input",
            LayerKind::Conv2D(_) => "conv2d",
            LayerKind::Conv2DTranspose(_) => "conv2d_transpose",
            LayerKind::BatchNormalization(_) => "batch_normalization",
            LayerKind::Activation(_) => "activation",
            LayerKind::Dropout { .. } => "dropout",
            LayerKind::MaxPooling2D(_) => "max_pooling2d",
            LayerKind::Concatenate { .. } => "concatenate",
            LayerKind::Reshape { .. } => "reshape",
            LayerKind::Permute { .. } => "permute",
        }
    }

    /// Infers the per-sample output shape from the input shapes.
    /// The error message is wrapped into a [`GraphError::ShapeError`] by the caller.
    fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<usize>, String> {
        let expected_inputs = match self {
            LayerKind::Input { .. } => 0,
            LayerKind::Concatenate { .. } => inputs.len().max(2),
            _ => 1,
        };
        if inputs.len() != expected_inputs {
            return Err(format!(
                "expected {} inputs, got {}",
                expected_inputs,
                inputs.len()
            ));
        }

        match self {
            LayerKind::Input { shape } => {
                if shape.iter().any(|&d| d == 0) {
                    return Err("input extents must be positive".to_string());
                }
                Ok(shape.clone())
            }
            LayerKind::Conv2D(params) => {
                let (h, w, _) = image_shape(inputs[0])?;
                check_conv_params(params)?;
                let out_h =
                    conv_output_length(h, params.kernel_size.0, params.strides.0, params.padding);
                let out_w =
                    conv_output_length(w, params.kernel_size.1, params.strides.1, params.padding);
                if out_h == 0 || out_w == 0 {
                    return Err("kernel is larger than the input".to_string());
                }
                Ok(vec![out_h, out_w, params.filters])
            }
            LayerKind::Conv2DTranspose(params) => {
                let conv = &params.conv;
                let (h, w, _) = image_shape(inputs[0])?;
                check_conv_params(conv)?;
                let out_h =
                    deconv_output_length(h, conv.kernel_size.0, conv.strides.0, conv.padding);
                let out_w =
                    deconv_output_length(w, conv.kernel_size.1, conv.strides.1, conv.padding);
                if let Some(hint) = &params.input_shape_hint {
                    check_hint(hint, None, h, w, "input_shape")?;
                }
                if let Some(hint) = &params.output_shape_hint {
                    check_hint(hint, Some(conv.filters), out_h, out_w, "output_shape")?;
                }
                Ok(vec![out_h, out_w, conv.filters])
            }
            LayerKind::BatchNormalization(params) => {
                let shape = inputs[0];
                let axis = resolve_axis(params.axis, shape.len())?;
                if axis != shape.len() - 1 {
                    return Err(format!(
                        "normalization is only supported over the channel axis, got axis {}",
                        params.axis
                    ));
                }
                Ok(shape.to_vec())
            }
            LayerKind::Activation(_) => Ok(inputs[0].to_vec()),
            LayerKind::Dropout { rate } => {
                if !(0.0..1.0).contains(rate) {
                    return Err(format!("dropout rate {} is not in [0, 1)", rate));
                }
                Ok(inputs[0].to_vec())
            }
            LayerKind::MaxPooling2D(params) => {
                let (h, w, c) = image_shape(inputs[0])?;
                if params.strides.0 == 0 || params.strides.1 == 0 {
                    return Err("strides must be positive".to_string());
                }
                let out_h =
                    conv_output_length(h, params.pool_size.0, params.strides.0, params.padding);
                let out_w =
                    conv_output_length(w, params.pool_size.1, params.strides.1, params.padding);
                if out_h == 0 || out_w == 0 {
                    return Err("pool is larger than the input".to_string());
                }
                Ok(vec![out_h, out_w, c])
            }
            LayerKind::Concatenate { axis } => {
                let rank = inputs[0].len();
                if inputs.iter().any(|s| s.len() != rank) {
                    return Err("all inputs need the same rank".to_string());
                }
                let axis = resolve_axis(*axis, rank)?;
                let mut shape = inputs[0].to_vec();
                for other in &inputs[1..] {
                    for (d, (&a, &b)) in inputs[0].iter().zip(other.iter()).enumerate() {
                        if d != axis && a != b {
                            return Err(format!("extents differ on axis {} ({} vs {})", d, a, b));
                        }
                    }
                    shape[axis] += other[axis];
                }
                Ok(shape)
            }
            LayerKind::Reshape { target_shape } => {
                let have: usize = inputs[0].iter().product();
                let want: usize = target_shape.iter().product();
                if have != want {
                    return Err(format!(
                        "cannot reshape {} elements into {:?}",
                        have, target_shape
                    ));
                }
                Ok(target_shape.clone())
            }
            LayerKind::Permute { dims } => {
                let shape = inputs[0];
                let mut seen = vec![false; shape.len()];
                if dims.len() != shape.len() {
                    return Err(format!("permutation {:?} has the wrong length", dims));
                }
                for &d in dims {
                    if d == 0 || d > shape.len() || seen[d - 1] {
                        return Err(format!("{:?} is not a permutation of the axes", dims));
                    }
                    seen[d - 1] = true;
                }
                Ok(dims.iter().map(|&d| shape[d - 1]).collect())
            }
        }
    }

    /// Names and shapes of the trainable parameters this layer owns, given its input shapes.
    pub fn weight_shapes(&self, inputs: &[&[usize]]) -> Vec<(&'static str, Vec<usize>)> {
        let in_channels = || inputs.first().and_then(|s| s.last()).copied().unwrap_or(0);
        match self {
            LayerKind::Conv2D(p) => {
                let mut shapes = vec![(
                    "kernel",
                    vec![p.kernel_size.0, p.kernel_size.1, in_channels(), p.filters],
                )];
                if p.use_bias {
                    shapes.push(("bias", vec![p.filters]));
                }
                shapes
            }
            LayerKind::Conv2DTranspose(Conv2DTransposeParams { conv: p, .. }) => {
                let mut shapes = vec![(
                    "kernel",
                    vec![p.kernel_size.0, p.kernel_size.1, p.filters, in_channels()],
                )];
                if p.use_bias {
                    shapes.push(("bias", vec![p.filters]));
                }
                shapes
            }
            LayerKind::BatchNormalization(_) => {
                let c = in_channels();
                vec![
                    ("gamma", vec![c]),
                    ("beta", vec![c]),
                    ("moving_mean", vec![c]),
                    ("moving_variance", vec![c]),
                ]
            }
            _ => vec![],
        }
    }
}

fn image_shape(shape: &[usize]) -> Result<(usize, usize, usize), String> {
    match shape {
        [h, w, c] => Ok((*h, *w, *c)),
        _ => Err(format!(
            "expected a (height, width, channels) input, got rank {}",
            shape.len()
        )),
    }
}

fn check_conv_params(params: &Conv2DParams) -> Result<(), String> {
    if params.filters == 0 || params.kernel_size.0 == 0 || params.kernel_size.1 == 0 {
        return Err("filters and kernel extents must be positive".to_string());
    }
    if params.strides.0 == 0 || params.strides.1 == 0 {
        return Err("strides must be positive".to_string());
    }
    Ok(())
}

/// Checks a channels-first shape hint against the inferred extent. Leading entries
/// beyond (channels, height, width) and `None` entries are not checked.
fn check_hint(
    hint: &[Option<usize>],
    channels: Option<usize>,
    h: usize,
    w: usize,
    what: &str,
) -> Result<(), String> {
    if hint.len() < 3 {
        return Err(format!("{} hint {:?} is too short", what, hint));
    }
    let tail = &hint[hint.len() - 3..];
    let matches = |declared: Option<usize>, actual: Option<usize>| match (declared, actual) {
        (Some(d), Some(a)) => d == a,
        _ => true,
    };
    if !(matches(tail[0], channels) && matches(tail[1], Some(h)) && matches(tail[2], Some(w))) {
        return Err(format!(
            "{} hint {:?} disagrees with the inferred extent ({:?}, {}, {})",
            what, hint, channels, h, w
        ));
    }
    Ok(())
}

/// Maps a Keras axis (counting the batch dimension, negative from the back) to a per-sample axis.
pub(crate) fn resolve_axis(axis: isize, rank: usize) -> Result<usize, String> {
    let full_rank = rank as isize + 1;
    let resolved = if axis < 0 { axis + full_rank } else { axis };
    if resolved <= 0 || resolved >= full_rank {
        return Err(format!("axis {} is out of range or the batch axis", axis));
    }
    Ok(resolved as usize - 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<NodeId>,
    pub output_shape: Vec<usize>,
}

/// Directed acyclic graph of layers, see the module documentation.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    name: String,
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    name_counters: HashMap<&'static str, usize>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl PartialEq for LayerGraph {
    /// Structural equality: name, nodes (in order) and the declared inputs / outputs.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.nodes == other.nodes
            && self.inputs == other.inputs
            && self.outputs == other.outputs
    }
}

impl LayerGraph {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            by_name: HashMap::new(),
            name_counters: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an input layer and declares it as a model input.
    pub fn input(&mut self, shape: &[usize]) -> GraphResult<NodeId> {
        let id = self.add(
            LayerKind::Input {
                shape: shape.to_vec(),
            },
            &[],
        )?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Adds a layer with an automatically generated, Keras style name.
    pub fn add(&mut self, kind: LayerKind, inputs: &[NodeId]) -> GraphResult<NodeId> {
        let prefix = kind.name_prefix();
        let name = loop {
            let counter = self.name_counters.entry(prefix).or_insert(0);
            *counter += 1;
            let candidate = format!("{}_{}", prefix, counter);
            if !self.by_name.contains_key(&candidate) {
                break candidate;
            }
        };
        self.add_named(name, kind, inputs)
    }

    /// Adds a layer under the given name after inferring its output shape.
    pub fn add_named<S: Into<String>>(
        &mut self,
        name: S,
        kind: LayerKind,
        inputs: &[NodeId],
    ) -> GraphResult<NodeId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        let input_shapes = inputs
            .iter()
            .map(|&id| self.get(id).map(|n| n.output_shape.as_slice()))
            .collect::<GraphResult<Vec<_>>>()?;

        let output_shape = kind
            .infer_shape(&input_shapes)
            .map_err(|reason| GraphError::ShapeError {
                layer: name.clone(),
                class_name: kind.class_name(),
                inputs: input_shapes.iter().map(|s| s.to_vec()).collect(),
                reason,
            })?;
        debug!("{} ({}) -> {:?}", name, kind.class_name(), output_shape);

        let id = self.nodes.len();
        self.by_name.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            kind,
            inputs: inputs.to_vec(),
            output_shape,
        });
        Ok(id)
    }

    /// Declares an already existing input layer as model input.
    pub fn mark_input(&mut self, id: NodeId) -> GraphResult<()> {
        match self.get(id)?.kind {
            LayerKind::Input { .. } => {
                self.inputs.push(id);
                Ok(())
            }
            _ => Err(GraphError::UnsupportedLayer(format!(
                "{} can't be a model input",
                self.nodes[id].name
            ))),
        }
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) -> GraphResult<()> {
        for &id in &outputs {
            self.get(id)?;
        }
        self.outputs = outputs;
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(id).ok_or(GraphError::UnknownNode(id))
    }

    /// Panics on an unknown id, use [`LayerGraph::get`] for ids that didn't come from this graph.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn node_by_name(&self, name: &str) -> GraphResult<NodeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownLayer(name.to_string()))
    }

    pub fn output_shape(&self, id: NodeId) -> &[usize] {
        &self.nodes[id].output_shape
    }

    fn input_shapes(&self, id: NodeId) -> Vec<&[usize]> {
        self.nodes[id]
            .inputs
            .iter()
            .map(|&i| self.nodes[i].output_shape.as_slice())
            .collect()
    }

    /// Fully qualified weight names (`<layer>/<parameter>`) and shapes of a node.
    pub fn weight_shapes(&self, id: NodeId) -> Vec<(String, Vec<usize>)> {
        let node = &self.nodes[id];
        node.kind
            .weight_shapes(&self.input_shapes(id))
            .into_iter()
            .map(|(param, shape)| (weight_key(&node.name, param), shape))
            .collect()
    }

    pub fn parameter_count(&self, id: NodeId) -> usize {
        self.weight_shapes(id)
            .iter()
            .map(|(_, shape)| shape.iter().product::<usize>())
            .sum()
    }

    pub fn total_parameter_count(&self) -> usize {
        (0..self.len()).map(|id| self.parameter_count(id)).sum()
    }

    /// Keras-like summary table of the graph.
    pub fn summary(&self) -> String {
        let rule = "_".repeat(110);
        let mut s = String::new();
        let _ = writeln!(s, "Model: \"{}\"", self.name);
        let _ = writeln!(s, "{}", rule);
        let _ = writeln!(
            s,
            "{:<45}{:<22}{:>12}  {}",
            "Layer (type)", "Output Shape", "Param #", "Connected to"
        );
        let _ = writeln!(s, "{}", "=".repeat(110));
        for (id, node) in self.nodes.iter().enumerate() {
            let shape = std::iter::once("None".to_string())
                .chain(node.output_shape.iter().map(|d| d.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            let connected = node
                .inputs
                .iter()
                .map(|&i| self.nodes[i].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(
                s,
                "{:<45}{:<22}{:>12}  {}",
                format!("{} ({})", node.name, node.kind.class_name()),
                format!("({})", shape),
                self.parameter_count(id),
                connected
            );
        }
        let _ = writeln!(s, "{}", "=".repeat(110));
        let _ = writeln!(s, "Total params: {}", self.total_parameter_count());
        let _ = writeln!(s, "{}", rule);
        s
    }
}

/// Key under which a layer parameter is stored in weight files.
pub fn weight_key(layer: &str, param: &str) -> String {
    format!("{}/{}", layer, param)
}
