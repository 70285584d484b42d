//! Glue between the command line and the `ml` crate: test data loading, weight files and
//! weight initialization.
use log::{debug, info};
use ml::{
    graph::{LayerGraph, LayerKind},
    inference::{InferenceModel, InferenceResult},
    weight_loader::{JsonWeightLoader, MemoryWeightLoader, NpzWeightLoader},
    ImagePrecision,
};
use ndarray::{Array4, ArrayD, IxDyn, ShapeError};
use ndarray_npy::{read_npy, ReadNpyError};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};
use std::{ffi::OsStr, path::Path};
use thiserror::Error;

pub const DEFAULT_WEIGHTS_PATH: &str =
    "weights/prop_tiramisu_weights_67_12_func_10-e7_decay150.npz";
pub const DEFAULT_DATA_PATH: &str = "./data/test_data.npy";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Test data not readable as f32, f64 or u8 npy array:\n {0}")]
    Npy(#[from] ReadNpyError),
    #[error("Test data has {available} values, {needed} are needed for the requested images")]
    NotEnoughData { needed: usize, available: usize },
    #[error("Test data holds no complete {height}x{width}x{channels} image")]
    Empty {
        height: usize,
        width: usize,
        channels: usize,
    },
    #[error("Model input {0:?} is not a (height, width, channels) image")]
    NotAnImage(Vec<usize>),
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Splits a per-sample model input shape into (height, width, channels).
pub fn image_shape(shape: &[usize]) -> Result<(usize, usize, usize), DataError> {
    match *shape {
        [height, width, channels] => Ok((height, width, channels)),
        _ => Err(DataError::NotAnImage(shape.to_vec())),
    }
}

/// Reads an npy array of any shape and element type f32, f64 or u8 and reinterprets it
/// (row-major) as `count` images of shape `(height, width, channels)`.
/// Without `count` all complete images are used.
pub fn load_test_data<P: AsRef<Path>>(
    path: P,
    count: Option<usize>,
    (height, width, channels): (usize, usize, usize),
) -> Result<Array4<ImagePrecision>, DataError> {
    let path = path.as_ref();
    let raw: ArrayD<ImagePrecision> = match read_npy::<_, ArrayD<f32>>(path) {
        Ok(arr) => arr,
        Err(first) => {
            debug!("{} is not f32 ({}), trying f64 and u8", path.display(), first);
            if let Ok(arr) = read_npy::<_, ArrayD<f64>>(path) {
                arr.mapv(|v| v as ImagePrecision)
            } else if let Ok(arr) = read_npy::<_, ArrayD<u8>>(path) {
                arr.mapv(ImagePrecision::from)
            } else {
                return Err(first.into());
            }
        }
    };

    let image_size = height * width * channels;
    let available = raw.len();
    let count = match count {
        Some(count) => count,
        None => available / image_size.max(1),
    };
    if count == 0 {
        return Err(DataError::Empty {
            height,
            width,
            channels,
        });
    }
    let needed = match count.checked_mul(image_size) {
        Some(needed) if needed <= available => needed,
        needed => {
            return Err(DataError::NotEnoughData {
                needed: needed.unwrap_or(usize::MAX),
                available,
            });
        }
    };

    info!(
        "loaded {} images of {}x{}x{} from {}",
        count,
        height,
        width,
        channels,
        path.display()
    );
    let values: Vec<ImagePrecision> = raw.iter().take(needed).copied().collect();
    Ok(Array4::from_shape_vec((count, height, width, channels), values)?)
}

/// Maximum and minimum of a prediction, `None` for an empty one.
pub fn prediction_range(prediction: &ArrayD<ImagePrecision>) -> Option<(f32, f32)> {
    prediction.iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((max, min)) => Some((max.max(v), min.min(v))),
    })
}

/// Attaches the weights in `path` to the graph. `.json` files are read as flattened
/// JSON weights, everything else as an npz archive.
pub fn build_model<P: AsRef<Path>>(graph: LayerGraph, path: P) -> InferenceResult<InferenceModel> {
    let path = path.as_ref();
    info!("loading weights from {}", path.display());
    match path.extension().and_then(OsStr::to_str) {
        Some("json") => InferenceModel::new(graph, &mut JsonWeightLoader::new(path)?),
        _ => InferenceModel::new(graph, &mut NpzWeightLoader::from_path(path)?),
    }
}

/// Uniform bound of a kernel initializer. Kernels are (kh, kw, a, b) with `a` the input
/// channels of a convolution and the output channels of a transposed convolution.
fn initializer_limit(initializer: &str, shape: &[usize]) -> f32 {
    let receptive_field: usize = shape[..2].iter().product();
    let fan_in = receptive_field * shape[2];
    let fan_out = receptive_field * shape[3];
    match initializer {
        "glorot_uniform" => (6.0 / (fan_in + fan_out) as f32).sqrt(),
        _ => (6.0 / fan_in as f32).sqrt(),
    }
}

/// Fresh weights for every parametrized layer of the graph: kernels drawn uniformly
/// from their initializer's range (He-uniform unless Glorot is declared), zero biases,
/// unit gamma and moving variance, zero beta and moving mean.
pub fn init_weights(graph: &LayerGraph, seed: u64) -> MemoryWeightLoader {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut weights = MemoryWeightLoader::new();

    for (id, node) in graph.nodes().iter().enumerate() {
        let initializer = match &node.kind {
            LayerKind::Conv2D(params) => params.kernel_initializer.as_str(),
            LayerKind::Conv2DTranspose(params) => params.conv.kernel_initializer.as_str(),
            _ => "",
        };
        for (name, shape) in graph.weight_shapes(id) {
            let weight = if name.ends_with("/kernel") {
                let limit = initializer_limit(initializer, &shape);
                let distribution = Uniform::new_inclusive(-limit, limit);
                ArrayD::from_shape_simple_fn(IxDyn(&shape), || rng.sample(distribution))
            } else if name.ends_with("/gamma") || name.ends_with("/moving_variance") {
                ArrayD::ones(IxDyn(&shape))
            } else {
                ArrayD::zeros(IxDyn(&shape))
            };
            weights.insert(name, weight);
        }
    }
    info!("initialized {} weight arrays with seed {}", weights.len(), seed);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml::{
        models::{Tiramisu, TiramisuConfig},
        weight_loader::WeightLoader,
    };
    use ndarray::{array, Array, Axis};
    use ndarray_npy::write_npy;
    use std::fs::File;
    use tempfile::tempdir;

    fn small_config() -> TiramisuConfig {
        TiramisuConfig {
            input_shape: (32, 32, 3),
            first_conv_filters: 4,
            growth_rate: 2,
            down_block_layers: vec![1; 5],
            bottleneck_layers: 1,
            num_classes: 2,
            ..TiramisuConfig::default()
        }
    }

    #[test]
    fn test_load_test_data_infers_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.npy");
        // 3 images of 2x2x1 plus a partial one
        let data = Array::from_shape_vec((14,), (0..14).map(|v| v as f32).collect()).unwrap();
        write_npy(&path, &data).unwrap();

        let images = load_test_data(&path, None, (2, 2, 1)).unwrap();
        assert_eq!(images.dim(), (3, 2, 2, 1));
        assert_eq!(images[[1, 0, 1, 0]], 5.0);

        let first = load_test_data(&path, Some(1), (2, 2, 1)).unwrap();
        assert_eq!(first.dim(), (1, 2, 2, 1));

        assert!(matches!(
            load_test_data(&path, Some(4), (2, 2, 1)),
            Err(DataError::NotEnoughData { needed: 16, available: 14 })
        ));
        assert!(matches!(
            load_test_data(&path, Some(usize::MAX / 2), (2, 2, 3)),
            Err(DataError::NotEnoughData { needed: usize::MAX, available: 14 })
        ));
        assert!(matches!(
            load_test_data(&path, None, (4, 4, 1)),
            Err(DataError::Empty { .. })
        ));
    }

    #[test]
    fn test_load_test_data_other_dtypes() {
        let dir = tempdir().unwrap();
        let f64_path = dir.path().join("f64.npy");
        write_npy(&f64_path, &array![[0.5f64, 1.5], [2.5, 3.5]]).unwrap();
        let u8_path = dir.path().join("u8.npy");
        write_npy(&u8_path, &array![0u8, 255, 7, 9]).unwrap();

        let from_f64 = load_test_data(&f64_path, None, (1, 2, 2)).unwrap();
        assert_eq!(from_f64.into_raw_vec(), vec![0.5, 1.5, 2.5, 3.5]);
        let from_u8 = load_test_data(&u8_path, None, (2, 2, 1)).unwrap();
        assert_eq!(from_u8.into_raw_vec(), vec![0.0, 255.0, 7.0, 9.0]);

        assert!(matches!(
            load_test_data(dir.path().join("missing.npy"), None, (1, 1, 1)),
            Err(DataError::Npy(_))
        ));
    }

    #[test]
    fn test_image_shape() {
        assert_eq!(image_shape(&[224, 224, 3]).unwrap(), (224, 224, 3));
        assert!(matches!(image_shape(&[50176, 12]), Err(DataError::NotAnImage(_))));
    }

    #[test]
    fn test_prediction_range() {
        let prediction = array![[0.25f32, 0.75], [0.1, 0.9]].into_dyn();
        assert_eq!(prediction_range(&prediction), Some((0.9, 0.1)));
        assert_eq!(prediction_range(&ArrayD::zeros(IxDyn(&[0, 3]))), None);
    }

    #[test]
    fn test_init_weights() {
        let topology = Tiramisu::create(&small_config()).unwrap();
        let graph = topology.graph;
        let mut weights = init_weights(&graph, 7);

        let expected: usize = (0..graph.len()).map(|id| graph.weight_shapes(id).len()).sum();
        assert_eq!(weights.len(), expected);

        // first convolution: 3x3x3 -> 4, He-uniform bound sqrt(6 / 27)
        let kernel = weights.get_weight("conv2d_1/kernel", &[3, 3, 3, 4]).unwrap();
        let limit = (6.0f32 / 27.0).sqrt();
        assert!(kernel.iter().all(|v| v.abs() <= limit));
        assert!(kernel.iter().any(|&v| v != 0.0));
        assert_eq!(
            weights.get_weight("conv2d_1/bias", &[4]).unwrap(),
            ArrayD::<f32>::zeros(IxDyn(&[4]))
        );
        let gamma = weights.get_weight("batch_normalization_1/gamma", &[4]).unwrap();
        assert!(gamma.iter().all(|&v| v == 1.0));

        // seeded
        let mut again = init_weights(&graph, 7);
        assert_eq!(
            again.get_weight("conv2d_1/kernel", &[3, 3, 3, 4]).unwrap(),
            kernel
        );
        let mut other = init_weights(&graph, 8);
        assert_ne!(
            other.get_weight("conv2d_1/kernel", &[3, 3, 3, 4]).unwrap(),
            kernel
        );
    }

    #[test]
    fn test_initialized_model_predicts() {
        let dir = tempdir().unwrap();
        let weights_path = dir.path().join("weights.npz");
        let topology = Tiramisu::create(&small_config()).unwrap();
        init_weights(&topology.graph, 0)
            .write_npz(File::create(&weights_path).unwrap())
            .unwrap();

        let model = build_model(topology.graph, &weights_path).unwrap();
        let batch = Array4::from_shape_fn((2, 32, 32, 3), |(n, h, w, c)| {
            ((n + h + 2 * w + 3 * c) % 5) as f32 / 5.0
        });
        let prediction = model.predict(batch.view()).unwrap();

        assert_eq!(prediction.shape(), &[2, 1024, 2]);
        for row in prediction.lanes(Axis(2)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        let (max, min) = prediction_range(&prediction).unwrap();
        assert!(max <= 1.0 && min >= 0.0);
    }
}
