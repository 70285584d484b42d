//! Evaluation of a [`LayerGraph`] with attached weights.
use crate::{
    activation_functions::Activation,
    convolutions::ConvolutionLayer,
    graph::{resolve_axis, GraphError, LayerGraph, LayerKind, NodeId},
    models::{InternalDataRepresentation, SegmentationModel},
    normalization::BatchNormLayer,
    pooling::MaxPoolingLayer,
    transposed_convolutions::TransposedConvolutionLayer,
    weight_loader::{WeightError, WeightLoader},
    ConvKernel, ImagePrecision, WeightPrecision,
};
use log::{debug, info};
use ndarray::*;
use thiserror::Error;

pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Weight(#[from] WeightError),
    #[error("Layer {layer} failed: {source}")]
    Shape {
        layer: String,
        #[source]
        source: ShapeError,
    },
    #[error("Model input has shape {expected:?}, got {actual:?}")]
    InputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(
        "Model needs exactly one input and one output, has {inputs} inputs and {outputs} outputs"
    )]
    UnsupportedIo { inputs: usize, outputs: usize },
}

/// A graph node with its weights attached, ready to be evaluated.
enum Operation {
    Input,
    Convolution(ConvolutionLayer, Activation),
    TransposedConvolution(TransposedConvolutionLayer, Activation),
    BatchNorm(BatchNormLayer),
    Activation(Activation),
    /// Dropout is the identity at inference time.
    Identity,
    MaxPool(MaxPoolingLayer),
    Concatenate(Axis),
    Reshape(Vec<usize>),
    Permute(Vec<usize>),
}

/// A Tiramisu (or any other supported) graph with its weights, evaluated one sample at a time.
pub struct InferenceModel {
    graph: LayerGraph,
    operations: Vec<Operation>,
    /// For every node, the index of the last node consuming its output.
    last_use: Vec<NodeId>,
    input: NodeId,
    output: NodeId,
}

fn take_weight<L: WeightLoader>(
    loader: &mut L,
    shapes: &[(String, Vec<usize>)],
    index: usize,
) -> InferenceResult<ArrayD<WeightPrecision>> {
    let (name, shape) = &shapes[index];
    Ok(loader.get_weight(name, shape)?)
}

fn into_kernel(layer: &str, weight: ArrayD<WeightPrecision>) -> InferenceResult<ConvKernel> {
    weight
        .into_dimensionality::<Ix4>()
        .map_err(|source| InferenceError::Shape {
            layer: layer.to_string(),
            source,
        })
}

fn into_vector(
    layer: &str,
    weight: ArrayD<WeightPrecision>,
) -> InferenceResult<Array1<WeightPrecision>> {
    weight
        .into_dimensionality::<Ix1>()
        .map_err(|source| InferenceError::Shape {
            layer: layer.to_string(),
            source,
        })
}

fn image_view<'a>(
    layer: &str,
    x: &'a InternalDataRepresentation,
) -> InferenceResult<ArrayView3<'a, ImagePrecision>> {
    x.view()
        .into_dimensionality::<Ix3>()
        .map_err(|source| InferenceError::Shape {
            layer: layer.to_string(),
            source,
        })
}

impl InferenceModel {
    /// Attaches the weights of every parametrized layer. Weights are looked up by
    /// layer name and must have exactly the shape the graph requires.
    pub fn new<L: WeightLoader>(graph: LayerGraph, loader: &mut L) -> InferenceResult<Self> {
        if graph.inputs().len() != 1 || graph.outputs().len() != 1 {
            return Err(InferenceError::UnsupportedIo {
                inputs: graph.inputs().len(),
                outputs: graph.outputs().len(),
            });
        }

        let mut operations = Vec::with_capacity(graph.len());
        for (id, node) in graph.nodes().iter().enumerate() {
            let shapes = graph.weight_shapes(id);
            let operation = match &node.kind {
                LayerKind::Input { .. } => Operation::Input,
                LayerKind::Conv2D(params) => {
                    let kernel = into_kernel(&node.name, take_weight(loader, &shapes, 0)?)?;
                    let bias = if params.use_bias {
                        Some(into_vector(&node.name, take_weight(loader, &shapes, 1)?)?)
                    } else {
                        None
                    };
                    Operation::Convolution(
                        ConvolutionLayer::new(kernel, bias, params.strides, params.padding),
                        params.activation,
                    )
                }
                LayerKind::Conv2DTranspose(params) => {
                    let conv = &params.conv;
                    let kernel = into_kernel(&node.name, take_weight(loader, &shapes, 0)?)?;
                    let bias = if conv.use_bias {
                        Some(into_vector(&node.name, take_weight(loader, &shapes, 1)?)?)
                    } else {
                        None
                    };
                    Operation::TransposedConvolution(
                        TransposedConvolutionLayer::new(kernel, bias, conv.strides, conv.padding),
                        conv.activation,
                    )
                }
                LayerKind::BatchNormalization(params) => {
                    // gamma, beta, moving_mean, moving_variance
                    let mut vector = |index| -> InferenceResult<Array1<WeightPrecision>> {
                        into_vector(&node.name, take_weight(loader, &shapes, index)?)
                    };
                    let gamma = vector(0)?;
                    let beta = vector(1)?;
                    let moving_mean = vector(2)?;
                    let moving_variance = vector(3)?;
                    Operation::BatchNorm(BatchNormLayer::new(
                        gamma,
                        beta,
                        moving_mean,
                        moving_variance,
                        params.epsilon,
                    ))
                }
                LayerKind::Activation(activation) => Operation::Activation(*activation),
                LayerKind::Dropout { .. } => Operation::Identity,
                LayerKind::MaxPooling2D(params) => Operation::MaxPool(MaxPoolingLayer::new(
                    params.pool_size,
                    params.strides,
                    params.padding,
                )),
                LayerKind::Concatenate { axis } => {
                    let rank = graph.output_shape(node.inputs[0]).len();
                    let axis = resolve_axis(*axis, rank).map_err(|reason| GraphError::ShapeError {
                        layer: node.name.clone(),
                        class_name: node.kind.class_name(),
                        inputs: vec![graph.output_shape(node.inputs[0]).to_vec()],
                        reason,
                    })?;
                    Operation::Concatenate(Axis(axis))
                }
                LayerKind::Reshape { target_shape } => Operation::Reshape(target_shape.clone()),
                LayerKind::Permute { dims } => {
                    Operation::Permute(dims.iter().map(|d| d - 1).collect())
                }
            };
            debug!("attached {} ({})", node.name, node.kind.class_name());
            operations.push(operation);
        }

        let mut last_use: Vec<NodeId> = (0..graph.len()).collect();
        for (id, node) in graph.nodes().iter().enumerate() {
            for &input in &node.inputs {
                last_use[input] = last_use[input].max(id);
            }
        }
        let input = graph.inputs()[0];
        let output = graph.outputs()[0];
        info!(
            "model {} ready: {} layers, {} parameters",
            graph.name(),
            graph.len(),
            graph.total_parameter_count()
        );

        Ok(InferenceModel {
            graph,
            operations,
            last_use,
            input,
            output,
        })
    }

    pub fn graph(&self) -> &LayerGraph {
        &self.graph
    }

    /// Per-sample input shape.
    pub fn input_shape(&self) -> &[usize] {
        self.graph.output_shape(self.input)
    }

    /// Per-sample output shape.
    pub fn output_shape(&self) -> &[usize] {
        self.graph.output_shape(self.output)
    }

    pub fn summary(&self) -> String {
        self.graph.summary()
    }

    /// Evaluates the graph for one sample. Intermediate tensors are dropped as soon as
    /// their last consumer has run.
    pub fn forward(
        &self,
        sample: ArrayViewD<ImagePrecision>,
    ) -> InferenceResult<InternalDataRepresentation> {
        if sample.shape() != self.input_shape() {
            return Err(InferenceError::InputShape {
                expected: self.input_shape().to_vec(),
                actual: sample.shape().to_vec(),
            });
        }

        let nodes = self.graph.nodes();
        let mut values: Vec<Option<InternalDataRepresentation>> = vec![None; nodes.len()];
        for (id, (node, operation)) in nodes.iter().zip(&self.operations).enumerate() {
            let result = {
                let inputs: Vec<&InternalDataRepresentation> = node
                    .inputs
                    .iter()
                    .map(|&i| values[i].as_ref())
                    .collect::<Option<Vec<_>>>()
                    .ok_or(GraphError::UnknownNode(id))?;
                self.evaluate(&node.name, operation, &inputs, sample.view())?
            };
            debug_assert_eq!(result.shape(), node.output_shape.as_slice(), "{}", node.name);
            values[id] = Some(result);

            for &i in &node.inputs {
                if self.last_use[i] == id && i != self.output {
                    values[i] = None;
                }
            }
        }

        values[self.output]
            .take()
            .ok_or(InferenceError::Graph(GraphError::UnknownNode(self.output)))
    }

    fn evaluate(
        &self,
        layer: &str,
        operation: &Operation,
        inputs: &[&InternalDataRepresentation],
        sample: ArrayViewD<ImagePrecision>,
    ) -> InferenceResult<InternalDataRepresentation> {
        let shape_error = |source: ShapeError| InferenceError::Shape {
            layer: layer.to_string(),
            source,
        };

        Ok(match operation {
            Operation::Input => sample.to_owned(),
            Operation::Convolution(conv, activation) => {
                let image = image_view(layer, inputs[0])?;
                activation.activate(conv.convolve(image).into_dyn())
            }
            Operation::TransposedConvolution(conv, activation) => {
                let image = image_view(layer, inputs[0])?;
                activation.activate(conv.transposed_convolve(image).into_dyn())
            }
            Operation::BatchNorm(norm) => norm.normalize(inputs[0].clone()),
            Operation::Activation(activation) => activation.activate(inputs[0].clone()),
            Operation::Identity => inputs[0].clone(),
            Operation::MaxPool(pool) => pool.pool(image_view(layer, inputs[0])?).into_dyn(),
            Operation::Concatenate(axis) => {
                let views: Vec<_> = inputs.iter().map(|x| x.view()).collect();
                concatenate(*axis, &views).map_err(shape_error)?
            }
            Operation::Reshape(target_shape) => inputs[0]
                .as_standard_layout()
                .into_owned()
                .into_shape(IxDyn(target_shape))
                .map_err(shape_error)?,
            Operation::Permute(axes) => inputs[0]
                .view()
                .permuted_axes(IxDyn(axes))
                .as_standard_layout()
                .into_owned(),
        })
    }

    /// Runs every sample of a (N, height, width, channels) batch and stacks the results.
    pub fn predict(
        &self,
        batch: ArrayView4<ImagePrecision>,
    ) -> InferenceResult<InternalDataRepresentation> {
        let samples = batch.len_of(Axis(0));
        let mut outputs = Vec::with_capacity(samples);
        for (index, sample) in batch.outer_iter().enumerate() {
            debug!("predicting sample {} of {}", index + 1, samples);
            outputs.push(self.forward(sample.into_dyn())?);
        }
        info!("predicted {} samples", samples);

        if outputs.is_empty() {
            let mut shape = vec![0];
            shape.extend_from_slice(self.output_shape());
            return Ok(ArrayD::zeros(IxDyn(&shape)));
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        stack(Axis(0), &views).map_err(|source| InferenceError::Shape {
            layer: self.graph.node(self.output).name.clone(),
            source,
        })
    }
}

impl SegmentationModel for InferenceModel {
    type Error = InferenceError;

    fn forward_pass(
        &self,
        input: &Array3<ImagePrecision>,
    ) -> InferenceResult<InternalDataRepresentation> {
        self.forward(input.view().into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{Conv2DParams, LayerGraph},
        models::{tests::tiny_config, Tiramisu},
        weight_loader::MemoryWeightLoader,
    };

    /// Deterministic, non-trivial weights for every parameter of the graph.
    fn synthetic_weights(graph: &LayerGraph) -> MemoryWeightLoader {
        let mut loader = MemoryWeightLoader::new();
        for id in 0..graph.len() {
            for (name, shape) in graph.weight_shapes(id) {
                let fan: usize = shape.iter().take(shape.len().saturating_sub(1)).product();
                let scale = 1.0 / (fan.max(1) as f32).sqrt();
                let weight = if name.ends_with("moving_variance") || name.ends_with("gamma") {
                    ArrayD::from_elem(IxDyn(&shape), 1.0)
                } else {
                    ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                        let seed: usize = idx
                            .slice()
                            .iter()
                            .enumerate()
                            .map(|(a, b)| (a + 3) * b)
                            .sum();
                        (((seed % 7) as f32) - 3.0) * 0.3 * scale
                    })
                };
                loader.insert(name, weight);
            }
        }
        loader
    }

    fn tiny_model() -> InferenceModel {
        let topology = Tiramisu::create(&tiny_config()).unwrap();
        let mut loader = synthetic_weights(&topology.graph);
        InferenceModel::new(topology.graph, &mut loader).unwrap()
    }

    #[test]
    fn test_tiny_tiramisu_end_to_end() {
        let model = tiny_model();
        let batch = Array4::from_shape_fn((2, 32, 32, 3), |(n, h, w, c)| {
            ((n + h * 3 + w * 5 + c * 7) % 11) as f32 / 11.0
        });

        let prediction = model.predict(batch.view()).unwrap();

        assert_eq!(prediction.shape(), &[2, 32 * 32, 3]);
        for row in prediction.lanes(Axis(2)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
        // samples are evaluated independently
        let first = model.forward_pass(&batch.slice(s![0, .., .., ..]).to_owned()).unwrap();
        assert_eq!(first, prediction.index_axis(Axis(0), 0).to_owned());
    }

    #[test]
    fn test_wrong_input_shape() {
        let model = tiny_model();
        let batch = Array4::<f32>::zeros((1, 16, 16, 3));
        assert!(matches!(
            model.predict(batch.view()),
            Err(InferenceError::InputShape { .. })
        ));
    }

    #[test]
    fn test_missing_weight() {
        let topology = Tiramisu::create(&tiny_config()).unwrap();
        let mut loader = MemoryWeightLoader::new();
        assert!(matches!(
            InferenceModel::new(topology.graph, &mut loader),
            Err(InferenceError::Weight(WeightError::WeightKeyError(_)))
        ));
    }

    #[test]
    fn test_head_reshape_and_permute() {
        // 2x2 image with 3 channels: 1x1 identity conv, reshape to (3, 4), permute to (4, 3)
        let mut graph = LayerGraph::new("head");
        let input = graph.input(&[2, 2, 3]).unwrap();
        let conv = graph
            .add(LayerKind::Conv2D(Conv2DParams::new(3, (1, 1), (1, 1))), &[input])
            .unwrap();
        let reshape = graph
            .add(LayerKind::Reshape { target_shape: vec![3, 4] }, &[conv])
            .unwrap();
        let permute = graph
            .add(LayerKind::Permute { dims: vec![2, 1] }, &[reshape])
            .unwrap();
        graph.set_outputs(vec![permute]).unwrap();

        let mut loader = MemoryWeightLoader::new();
        let mut identity = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
        for c in 0..3 {
            identity[[0, 0, c, c]] = 1.0;
        }
        loader.insert("conv2d_1/kernel", identity);
        loader.insert("conv2d_1/bias", ArrayD::zeros(IxDyn(&[3])));
        let model = InferenceModel::new(graph, &mut loader).unwrap();

        let image = Array3::from_shape_vec((2, 2, 3), (0..12).map(|v| v as f32).collect()).unwrap();
        let out = model.forward_pass(&image).unwrap();

        // the reshape reinterprets the channels-last buffer row-major
        let expected = Array::from_shape_vec((3, 4), (0..12).map(|v| v as f32).collect())
            .unwrap()
            .reversed_axes()
            .as_standard_layout()
            .into_owned()
            .into_dyn();
        assert_eq!(out, expected);
    }
}
