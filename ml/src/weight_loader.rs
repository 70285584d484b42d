use crate::WeightPrecision;
use ndarray::{Array, ArrayD, IxDyn, ShapeError};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use serde_json::{self, Map, Value};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, Write};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict of pairs (key, flattened array of weights))")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not writable. Filesystem reported error\n {0}.")]
    WeightFileNpzWriteError(#[from] WriteNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
    #[error("Weight {name} has shape {actual:?}, the layer needs {expected:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Source of named layer parameters. Names are `<layer>/<parameter>`,
/// see [`crate::graph::weight_key`].
pub trait WeightLoader {
    /// Returns the weight with the given name, which has to have exactly the given shape.
    fn get_weight(&mut self, param_name: &str, shape: &[usize])
        -> WeightResult<ArrayD<WeightPrecision>>;
}

fn check_shape(
    name: &str,
    arr: ArrayD<WeightPrecision>,
    shape: &[usize],
) -> WeightResult<ArrayD<WeightPrecision>> {
    if arr.shape() != shape {
        return Err(WeightError::WeightShapeMismatch {
            name: name.to_string(),
            expected: shape.to_vec(),
            actual: arr.shape().to_vec(),
        });
    }
    Ok(arr)
}

pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        Self::from_str(&raw_file)
    }

    pub fn from_str(raw: &str) -> WeightResult<JsonWeightLoader> {
        let parsed: Value = serde_json::from_str(raw).map_err(|_| WeightError::WeightFormatError)?;
        match parsed {
            Value::Object(content) => Ok(JsonWeightLoader { content }),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

impl WeightLoader for JsonWeightLoader {
    /// Weights are stored in a FLATTENED form (to facilitate working with JSON,
    /// as then all arrays have the same nesting) and are reshaped here.
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let raw_arr = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        let raw_value_vector = match raw_arr {
            Value::Array(v) => v,
            _ => return Err(WeightError::WeightFormatError),
        };

        let weight_vector: Result<Vec<_>, _> = raw_value_vector
            .iter()
            .map(|j| {
                j.as_f64()
                    .map(|v| v as WeightPrecision)
                    .ok_or(WeightError::WeightFormatError)
            })
            .collect();
        let weight_vector = weight_vector?;

        let expected: usize = shape.iter().product();
        if weight_vector.len() != expected {
            return Err(WeightError::WeightShapeMismatch {
                name: param_name.to_string(),
                expected: shape.to_vec(),
                actual: vec![weight_vector.len()],
            });
        }
        Ok(Array::from_shape_vec(IxDyn(shape), weight_vector)?)
    }
}

/// Reads weights from a NumPy `.npz` archive.
pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    reader: NpzReader<R>,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader {
            reader: NpzReader::new(handle)?,
        })
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> WeightResult<NpzWeightLoader<Cursor<&'a [u8]>>> {
        Ok(NpzWeightLoader {
            reader: NpzReader::new(Cursor::new(bytes_array))?,
        })
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let arr: ArrayD<WeightPrecision> = self.reader.by_name(param_name)?;
        check_shape(param_name, arr, shape)
    }
}

/// Weights held in memory, e.g. freshly initialized ones.
#[derive(Debug, Default, Clone)]
pub struct MemoryWeightLoader {
    weights: HashMap<String, ArrayD<WeightPrecision>>,
}

impl MemoryWeightLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, weight: ArrayD<WeightPrecision>) {
        self.weights.insert(name.into(), weight);
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Writes all weights into an `.npz` archive, sorted by name.
    pub fn write_npz<W: Write + Seek>(&self, writer: W) -> WeightResult<()> {
        let mut npz = NpzWriter::new(writer);
        let mut names: Vec<&String> = self.weights.keys().collect();
        names.sort();
        for name in names {
            npz.add_array(name.as_str(), &self.weights[name])?;
        }
        npz.finish()?;
        Ok(())
    }
}

impl WeightLoader for MemoryWeightLoader {
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let arr = self
            .weights
            .get(param_name)
            .cloned()
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;
        check_shape(param_name, arr, shape)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;
    use ndarray::{array, Array1, Array2};
    use tempfile::tempdir;

    #[test]
    fn test_json_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.txt");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            // Rust escapes curly braces by doubling them
            "{{ \"conv2d_1/bias\": [0.0, 1e-3, 1.0], \"conv2d_1/kernel\": [0.0, 1.0, 2.0, 3.0]}}"
        )
        .unwrap();

        let mut loader = JsonWeightLoader::new(file_path).unwrap();

        assert_eq!(
            loader.get_weight("conv2d_1/bias", &[3]).unwrap(),
            array![0.0, 1e-3, 1.0].into_dyn()
        );
        assert_eq!(
            loader.get_weight("conv2d_1/kernel", &[2, 2]).unwrap(),
            array![[0.0, 1.0], [2.0, 3.0]].into_dyn()
        );
        assert!(matches!(
            loader.get_weight("conv2d_1/kernel", &[3, 2]),
            Err(WeightError::WeightShapeMismatch { .. })
        ));
        assert!(matches!(
            loader.get_weight("conv2d_2/kernel", &[2, 2]),
            Err(WeightError::WeightKeyError(_))
        ));

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_weight_loader_rejects_non_dict() {
        assert!(matches!(
            JsonWeightLoader::from_str("[1, 2, 3]"),
            Err(WeightError::WeightFormatError)
        ));
        let mut loader = JsonWeightLoader::from_str("{\"a\": [1, \"x\"]}").unwrap();
        assert!(matches!(
            loader.get_weight("a", &[2]),
            Err(WeightError::WeightFormatError)
        ));
    }

    #[test]
    fn test_npz_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = ndarray_npy::NpzWriter::new(file);
        let a: Array2<f32> = array![[1., 2., 3.], [4., 5., 6.]];
        let b: Array1<f32> = array![7., 8., 9.];
        npz.add_array("a", &a).unwrap();
        npz.add_array("b", &b).unwrap();
        npz.finish().unwrap();

        let mut loader = NpzWeightLoader::from_path(&file_path).unwrap();

        assert_eq!(loader.get_weight("a", &[2, 3]).unwrap(), a.into_dyn());
        assert_eq!(loader.get_weight("b", &[3]).unwrap(), b.into_dyn());
        assert!(matches!(
            loader.get_weight("b", &[4]),
            Err(WeightError::WeightShapeMismatch { .. })
        ));
        assert!(loader.get_weight("c", &[1]).is_err());

        dir.close().unwrap();
    }

    #[test]
    fn test_memory_loader_npz_round_trip() {
        let mut memory = MemoryWeightLoader::new();
        memory.insert("conv2d_1/kernel", array![[1., 2.], [3., 4.]].into_dyn());
        memory.insert("batch_normalization_1/gamma", array![1., 1.].into_dyn());
        assert_eq!(memory.len(), 2);

        let mut buffer = Cursor::new(Vec::new());
        memory.write_npz(&mut buffer).unwrap();
        let bytes = buffer.into_inner();

        let mut loader = NpzWeightLoader::from_buffer(&bytes).unwrap();
        assert_eq!(
            loader.get_weight("conv2d_1/kernel", &[2, 2]).unwrap(),
            memory.get_weight("conv2d_1/kernel", &[2, 2]).unwrap()
        );
        assert_eq!(
            loader
                .get_weight("batch_normalization_1/gamma", &[2])
                .unwrap(),
            array![1., 1.].into_dyn()
        );
    }
}
