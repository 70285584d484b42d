use crate::{
    activation_functions::Activation,
    convolutions::Padding,
    graph::{
        BatchNormParams, Conv2DParams, Conv2DTransposeParams, DataFormat, GraphError,
        GraphResult, LayerGraph, LayerKind, NodeId, PoolingParams, Regularizer,
    },
    ImagePrecision,
};
use log::info;
use ndarray::{Array3, ArrayD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data flowing between layers, one sample at a time without batch dimension.
pub type InternalDataRepresentation = ArrayD<ImagePrecision>;

/// File the topology of the default configuration is written to.
pub const TOPOLOGY_FILE_NAME: &str = "tiramisu_fc_dense67_model_12_func.json";

/// Stage name (e.g. "layer_3_down") -> step name (e.g. "conv3") -> node.
pub type LayerRegistry = BTreeMap<String, BTreeMap<String, NodeId>>;

/// General model trait for pixel-wise segmentation
pub trait SegmentationModel {
    type Error;

    /// Maps one (height, width, channels) image to per-pixel class probabilities.
    fn forward_pass(
        &self,
        input: &Array3<ImagePrecision>,
    ) -> Result<InternalDataRepresentation, Self::Error>;
}

/// Architecture parameters of the Tiramisu network. The default is FC-DenseNet67 with
/// 12 output classes on 224x224 RGB images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiramisuConfig {
    pub model_name: String,
    /// (height, width, channels)
    pub input_shape: (usize, usize, usize),
    pub first_conv_filters: usize,
    pub growth_rate: usize,
    /// Layers of the dense block in each encoder stage, the decoder mirrors them.
    pub down_block_layers: Vec<usize>,
    pub bottleneck_layers: usize,
    pub num_classes: usize,
    pub dropout_rate: f32,
    pub weight_decay: f32,
}

impl Default for TiramisuConfig {
    fn default() -> Self {
        Self {
            model_name: "model_1".to_string(),
            input_shape: (224, 224, 3),
            first_conv_filters: 48,
            growth_rate: 12,
            down_block_layers: vec![5; 5],
            bottleneck_layers: 15,
            num_classes: 12,
            dropout_rate: 0.2,
            weight_decay: 1e-4,
        }
    }
}

/// Filter counts of all blocks, derived from a [`TiramisuConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    /// Dense block and transition down filters of each encoder stage.
    pub encoder: Vec<usize>,
    pub bottleneck: usize,
    /// Transition up and dense block filters of each decoder stage (deepest first).
    pub decoder: Vec<usize>,
}

impl TiramisuConfig {
    pub fn validate(&self) -> GraphResult<()> {
        let invalid = |msg: String| Err(GraphError::InvalidConfig(msg));
        let stages = self.down_block_layers.len();
        if stages == 0 {
            return invalid("at least one encoder stage is needed".to_string());
        }
        if self.down_block_layers.iter().any(|&l| l == 0) || self.bottleneck_layers == 0 {
            return invalid("every dense block needs at least one layer".to_string());
        }
        let (h, w, c) = self.input_shape;
        let factor = 1usize.checked_shl(stages as u32).unwrap_or(0);
        if factor == 0 || h == 0 || w == 0 || c == 0 || h % factor != 0 || w % factor != 0 {
            return invalid(format!(
                "input extent {}x{} must be a positive multiple of {} for {} stages",
                h, w, factor, stages
            ));
        }
        if self.first_conv_filters == 0 || self.growth_rate == 0 || self.num_classes == 0 {
            return invalid("filter, growth and class counts must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return invalid(format!("dropout rate {} is not in [0, 1)", self.dropout_rate));
        }
        Ok(())
    }

    /// Each encoder stage adds `layers * growth_rate` filters to the previous stage.
    /// The bottleneck adds the last stage's growth once more, and every decoder stage
    /// has the filters of its mirrored encoder stage plus twice that stage's growth.
    pub fn channel_plan(&self) -> ChannelPlan {
        let growth = |layers: usize| layers * self.growth_rate;
        let encoder: Vec<usize> = self
            .down_block_layers
            .iter()
            .scan(self.first_conv_filters, |filters, &layers| {
                *filters += growth(layers);
                Some(*filters)
            })
            .collect();
        let last_layers = self.down_block_layers.last().copied().unwrap_or(0);
        let bottleneck = encoder.last().copied().unwrap_or(self.first_conv_filters)
            + growth(last_layers);
        let decoder = encoder
            .iter()
            .zip(&self.down_block_layers)
            .rev()
            .map(|(&filters, &layers)| filters + 2 * growth(layers))
            .collect();
        ChannelPlan {
            encoder,
            bottleneck,
            decoder,
        }
    }
}

/// Result of a topology construction: the graph plus the registry of named intermediate nodes.
#[derive(Debug, Clone)]
pub struct TiramisuTopology {
    pub graph: LayerGraph,
    pub registry: LayerRegistry,
}

/// Fully convolutional DenseNet ("The One Hundred Layers Tiramisu", Jégou et al. 2017,
/// https://arxiv.org/abs/1611.09326) as a U-shaped encoder / decoder with skip connections.
///
/// The dense blocks chain their steps: every step consumes the output of the previous one,
/// the block returns the last step's output.
pub struct Tiramisu<'a> {
    config: &'a TiramisuConfig,
    graph: LayerGraph,
    registry: LayerRegistry,
}

impl<'a> Tiramisu<'a> {
    /// Builds the complete topology for the given configuration.
    pub fn create(config: &'a TiramisuConfig) -> GraphResult<TiramisuTopology> {
        config.validate()?;
        let plan = config.channel_plan();
        let mut builder = Tiramisu {
            config,
            graph: LayerGraph::new(config.model_name.clone()),
            registry: LayerRegistry::new(),
        };
        let regularizer = Regularizer::l2(config.weight_decay);
        let (height, width, channels) = config.input_shape;

        let input_layer = builder.graph.input(&[height, width, channels])?;
        let first_conv = builder.graph.add(
            LayerKind::Conv2D(
                Conv2DParams::new(config.first_conv_filters, (3, 3), (1, 1))
                    .with_regularizer(regularizer),
            ),
            &[input_layer],
        )?;

        let mut previous = first_conv;
        for (stage, (&layers, &filters)) in
            config.down_block_layers.iter().zip(&plan.encoder).enumerate()
        {
            let stage = stage + 1;
            info!("encoder stage {}: {} layers, {} filters", stage, layers, filters);
            let block =
                builder.dense_block(layers, filters, previous, &format!("layer_{}_down", stage))?;
            previous =
                builder.transition_down(filters, block, &format!("layer_{}a_down", stage))?;
        }

        info!(
            "bottleneck: {} layers, {} filters",
            config.bottleneck_layers, plan.bottleneck
        );
        previous = builder.dense_block(
            config.bottleneck_layers,
            plan.bottleneck,
            previous,
            "layer_bottleneck",
        )?;

        let stages = config.down_block_layers.len();
        for (index, &filters) in plan.decoder.iter().enumerate() {
            let stage = index + 1;
            let mirrored = stages - index;
            let layers = config.down_block_layers[mirrored - 1];
            info!("decoder stage {}: {} layers, {} filters", stage, layers, filters);

            let (h, w) = {
                let shape = builder.graph.output_shape(previous);
                (shape[0], shape[1])
            };
            let upsampled = builder.transition_up(
                filters,
                vec![Some(filters), Some(h), Some(w)],
                vec![None, Some(filters), Some(2 * h), Some(2 * w)],
                previous,
                &format!("layer_{}_up", stage),
            )?;
            // skip connection to the last convolution of the mirrored encoder dense block
            let skip = builder.lookup(
                &format!("layer_{}_down", mirrored),
                &format!("conv{}", layers),
            )?;
            let concatenated = builder
                .graph
                .add(LayerKind::Concatenate { axis: -1 }, &[upsampled, skip])?;
            previous = builder.dense_block(
                layers,
                filters,
                concatenated,
                &format!("layer_{}a_up", stage),
            )?;
        }

        let last_conv = builder.graph.add(
            LayerKind::Conv2D(
                Conv2DParams::new(config.num_classes, (1, 1), (1, 1)).with_regularizer(regularizer),
            ),
            &[previous],
        )?;
        let reshape = builder.graph.add(
            LayerKind::Reshape {
                target_shape: vec![config.num_classes, height * width],
            },
            &[last_conv],
        )?;
        let perm = builder
            .graph
            .add(LayerKind::Permute { dims: vec![2, 1] }, &[reshape])?;
        let act = builder
            .graph
            .add(LayerKind::Activation(Activation::Softmax), &[perm])?;
        builder.graph.set_outputs(vec![act])?;

        info!(
            "built {} with {} layers and {} parameters",
            builder.graph.name(),
            builder.graph.len(),
            builder.graph.total_parameter_count()
        );
        Ok(TiramisuTopology {
            graph: builder.graph,
            registry: builder.registry,
        })
    }

    fn register(&mut self, level: &str, step: String, id: NodeId) {
        self.registry
            .entry(level.to_string())
            .or_default()
            .insert(step, id);
    }

    fn lookup(&self, level: &str, step: &str) -> GraphResult<NodeId> {
        self.registry
            .get(level)
            .and_then(|steps| steps.get(step))
            .copied()
            .ok_or_else(|| GraphError::UnknownRegistryEntry {
                stage: level.to_string(),
                step: step.to_string(),
            })
    }

    fn batch_norm(&self) -> LayerKind {
        let regularizer = Some(Regularizer::l2(self.config.weight_decay));
        LayerKind::BatchNormalization(BatchNormParams {
            axis: 3,
            gamma_regularizer: regularizer,
            beta_regularizer: regularizer,
            ..BatchNormParams::default()
        })
    }

    /// `layers_count` times {batch norm -> relu -> 3x3 conv -> dropout}, each step
    /// consuming the previous one. Returns the last dropout.
    fn dense_block(
        &mut self,
        layers_count: usize,
        filters: usize,
        mut previous: NodeId,
        level: &str,
    ) -> GraphResult<NodeId> {
        for i in 1..=layers_count {
            let normalization = self.batch_norm();
            let b_norm = self.graph.add(normalization, &[previous])?;
            self.register(level, format!("b_norm{}", i), b_norm);
            let act = self
                .graph
                .add(LayerKind::Activation(Activation::Relu), &[b_norm])?;
            self.register(level, format!("act{}", i), act);
            let conv = self.graph.add(
                LayerKind::Conv2D(Conv2DParams::new(filters, (3, 3), (1, 1))),
                &[act],
            )?;
            self.register(level, format!("conv{}", i), conv);
            let drop_out = self.graph.add(
                LayerKind::Dropout {
                    rate: self.config.dropout_rate,
                },
                &[conv],
            )?;
            self.register(level, format!("drop_out{}", i), drop_out);
            previous = drop_out;
        }
        Ok(previous)
    }

    /// batch norm -> relu -> 1x1 conv -> dropout -> 2x2 max pool, halving height and width.
    fn transition_down(
        &mut self,
        filters: usize,
        previous: NodeId,
        level: &str,
    ) -> GraphResult<NodeId> {
        let normalization = self.batch_norm();
        let b_norm = self.graph.add(normalization, &[previous])?;
        self.register(level, "b_norm".to_string(), b_norm);
        let act = self
            .graph
            .add(LayerKind::Activation(Activation::Relu), &[b_norm])?;
        self.register(level, "act".to_string(), act);
        let conv = self.graph.add(
            LayerKind::Conv2D(Conv2DParams::new(filters, (1, 1), (1, 1))),
            &[act],
        )?;
        self.register(level, "conv".to_string(), conv);
        let drop_out = self.graph.add(
            LayerKind::Dropout {
                rate: self.config.dropout_rate,
            },
            &[conv],
        )?;
        self.register(level, "drop_out".to_string(), drop_out);
        let max_pool = self.graph.add(
            LayerKind::MaxPooling2D(PoolingParams {
                pool_size: (2, 2),
                strides: (2, 2),
                padding: Padding::Valid,
                data_format: DataFormat::ChannelsLast,
            }),
            &[drop_out],
        )?;
        self.register(level, "max_pool".to_string(), max_pool);
        Ok(max_pool)
    }

    /// A single strided 3x3 transposed convolution, doubling height and width.
    fn transition_up(
        &mut self,
        filters: usize,
        input_shape: Vec<Option<usize>>,
        output_shape: Vec<Option<usize>>,
        previous: NodeId,
        level: &str,
    ) -> GraphResult<NodeId> {
        let conv = self.graph.add(
            LayerKind::Conv2DTranspose(Conv2DTransposeParams {
                conv: Conv2DParams::new(filters, (3, 3), (2, 2)),
                input_shape_hint: Some(input_shape),
                output_shape_hint: Some(output_shape),
            }),
            &[previous],
        )?;
        self.register(level, "conv".to_string(), conv);
        Ok(conv)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A miniature network with the same layout, cheap enough for forward passes in tests.
    pub(crate) fn tiny_config() -> TiramisuConfig {
        TiramisuConfig {
            model_name: "tiny".to_string(),
            input_shape: (32, 32, 3),
            first_conv_filters: 4,
            growth_rate: 2,
            down_block_layers: vec![1; 5],
            bottleneck_layers: 2,
            num_classes: 3,
            ..TiramisuConfig::default()
        }
    }

    fn count_kind(graph: &LayerGraph, class_name: &str) -> usize {
        graph
            .nodes()
            .iter()
            .filter(|n| n.kind.class_name() == class_name)
            .count()
    }

    #[test]
    fn test_default_channel_plan() {
        let plan = TiramisuConfig::default().channel_plan();
        assert_eq!(plan.encoder, vec![108, 168, 228, 288, 348]);
        assert_eq!(plan.bottleneck, 408);
        assert_eq!(plan.decoder, vec![468, 408, 348, 288, 228]);
        for pair in plan.encoder.windows(2) {
            assert_eq!(pair[1] - pair[0], 60);
        }
    }

    #[test]
    fn test_invalid_configs() {
        let odd_input = TiramisuConfig {
            input_shape: (100, 224, 3),
            ..TiramisuConfig::default()
        };
        assert!(matches!(
            Tiramisu::create(&odd_input),
            Err(GraphError::InvalidConfig(_))
        ));
        let empty_block = TiramisuConfig {
            down_block_layers: vec![5, 0, 5],
            ..TiramisuConfig::default()
        };
        assert!(empty_block.validate().is_err());
        let no_stages = TiramisuConfig {
            down_block_layers: vec![],
            ..TiramisuConfig::default()
        };
        assert!(no_stages.validate().is_err());
        assert!(TiramisuConfig::default().validate().is_ok());
    }

    #[test]
    fn test_encoder_stages() {
        let config = TiramisuConfig::default();
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;
        let registry = &topology.registry;

        let mut expected_in = 48;
        let mut extent = 224;
        for (stage, &filters) in [108, 168, 228, 288, 348].iter().enumerate() {
            let level = &registry[&format!("layer_{}_down", stage + 1)];
            // the dense block consumes the previous stage's transition down output
            let first_norm = graph.node(level["b_norm1"]);
            assert_eq!(
                graph.output_shape(first_norm.inputs[0]),
                &[extent, extent, expected_in]
            );
            assert_eq!(level.len(), 4 * 5);
            assert_eq!(graph.output_shape(level["conv5"]), &[extent, extent, filters]);

            let transition = &registry[&format!("layer_{}a_down", stage + 1)];
            extent /= 2;
            assert_eq!(
                graph.output_shape(transition["max_pool"]),
                &[extent, extent, filters]
            );
            expected_in = filters;
        }
    }

    #[test]
    fn test_bottleneck_follows_fifth_transition() {
        let config = TiramisuConfig::default();
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;
        let bottleneck = &topology.registry["layer_bottleneck"];

        assert_eq!(bottleneck.len(), 4 * 15);
        assert!(bottleneck.contains_key("drop_out15"));
        assert!(!bottleneck.contains_key("conv16"));
        let first_norm = graph.node(bottleneck["b_norm1"]);
        assert_eq!(
            first_norm.inputs[0],
            topology.registry["layer_5a_down"]["max_pool"]
        );
        assert_eq!(graph.output_shape(bottleneck["conv15"]), &[7, 7, 408]);
    }

    #[test]
    fn test_decoder_skip_connections() {
        let config = TiramisuConfig::default();
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;
        let registry = &topology.registry;

        let up_filters = [468, 408, 348, 288, 228];
        let skip_filters = [348, 288, 228, 168, 108];
        let extents = [14, 28, 56, 112, 224];
        for stage in 0..5 {
            let up = registry[&format!("layer_{}_up", stage + 1)]["conv"];
            assert_eq!(
                graph.output_shape(up),
                &[extents[stage], extents[stage], up_filters[stage]]
            );

            let block = &registry[&format!("layer_{}a_up", stage + 1)];
            let first_norm = graph.node(block["b_norm1"]);
            let concat = graph.node(first_norm.inputs[0]);
            assert_eq!(concat.kind, LayerKind::Concatenate { axis: -1 });
            let skip = registry[&format!("layer_{}_down", 5 - stage)]["conv5"];
            assert_eq!(concat.inputs, vec![up, skip]);
            assert_eq!(
                concat.output_shape,
                vec![
                    extents[stage],
                    extents[stage],
                    up_filters[stage] + skip_filters[stage]
                ]
            );
            // the decoder block's first convolution consumes the concatenated channels
            assert_eq!(
                graph.weight_shapes(block["conv1"])[0].1,
                vec![3, 3, up_filters[stage] + skip_filters[stage], up_filters[stage]]
            );
        }
    }

    #[test]
    fn test_head() {
        let config = TiramisuConfig::default();
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;

        assert_eq!(graph.outputs().len(), 1);
        let act = graph.node(graph.outputs()[0]);
        assert_eq!(act.kind, LayerKind::Activation(Activation::Softmax));
        let perm = graph.node(act.inputs[0]);
        assert_eq!(perm.kind, LayerKind::Permute { dims: vec![2, 1] });
        assert_eq!(perm.output_shape, vec![224 * 224, 12]);
        let reshape = graph.node(perm.inputs[0]);
        assert_eq!(reshape.output_shape, vec![12, 224 * 224]);
        let last_conv = graph.node(reshape.inputs[0]);
        assert_eq!(last_conv.output_shape, vec![224, 224, 12]);
    }

    #[test]
    fn test_layer_counts() {
        let config = TiramisuConfig::default();
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;

        // 5 * 5 encoder + 15 bottleneck + 5 * 5 decoder dense steps, 5 transitions down
        assert_eq!(count_kind(graph, "BatchNormalization"), 65 + 5);
        assert_eq!(count_kind(graph, "Conv2D"), 1 + 65 + 5 + 1);
        assert_eq!(count_kind(graph, "Conv2DTranspose"), 5);
        assert_eq!(count_kind(graph, "Concatenate"), 5);
        assert_eq!(count_kind(graph, "MaxPooling2D"), 5);
        assert_eq!(graph.node(0).name, "input_1");
        assert_eq!(graph.node(1).name, "conv2d_1");
    }

    #[test]
    fn test_tiny_topology() {
        let config = tiny_config();
        assert_eq!(
            config.channel_plan(),
            ChannelPlan {
                encoder: vec![6, 8, 10, 12, 14],
                bottleneck: 16,
                decoder: vec![18, 16, 14, 12, 10],
            }
        );
        let topology = Tiramisu::create(&config).unwrap();
        let graph = &topology.graph;
        assert_eq!(graph.output_shape(graph.outputs()[0]), &[32 * 32, 3]);
        assert_eq!(
            graph.output_shape(topology.registry["layer_bottleneck"]["conv2"]),
            &[1, 1, 16]
        );
    }
}
