//! This module provides the activation functions used by the segmentation network,
//! namely Relu and a softmax over the last (class) axis.
//!
//! All activation functions are exposed through the [`Activation`] enum as well as free functions.
use ndarray::*;
use serde::{Deserialize, Serialize};

use crate::{models::InternalDataRepresentation, ImagePrecision};

/// Activation applied by an activation layer or fused into a convolution.
/// Serialized with the lowercase names Keras uses ("linear", "relu", "softmax").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    pub fn activate(&self, x: InternalDataRepresentation) -> InternalDataRepresentation {
        match self {
            Activation::Linear => x,
            Activation::Relu => relu(x),
            Activation::Softmax => softmax(x),
        }
    }
}

/// Relu implementation
pub fn relu<D: Dimension>(mut data: Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv_inplace(|x| if x > 0. { x } else { 0. });
    data
}

/// Softmax over the last axis. Every lane along that axis sums to one afterwards.
///
/// The lane maximum is subtracted before exponentiation, so large logits don't overflow.
pub fn softmax<D: Dimension>(mut data: Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    if data.ndim() == 0 {
        return data.mapv(|_| 1.0);
    }
    let last = Axis(data.ndim() - 1);
    for mut lane in data.lanes_mut(last) {
        let max = lane.fold(ImagePrecision::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Array::from_shape_vec((1, 2, 2), vec![1., -2., 3., -4.]).unwrap();
        let out = Array::from_shape_vec((1, 2, 2), vec![1., 0., 3., 0.]).unwrap();
        assert_eq!(relu(x), out);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = array![[1., 2., 3.], [0., 0., 0.], [-5., 10., 2.]];
        let y = softmax(x);
        for row in y.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((y[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
        assert!(y[[0, 2]] > y[[0, 1]] && y[[0, 1]] > y[[0, 0]]);
    }

    #[test]
    fn test_softmax_large_logits() {
        let x = array![[1000., 1000.], [-1000., 0.]];
        let y = softmax(x);
        assert_eq!(y[[0, 0]], 0.5);
        assert_eq!(y[[1, 1]], 1.0);
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_activation_dispatch() {
        let x = array![-1., 2.].into_dyn();
        assert_eq!(Activation::Linear.activate(x.clone()), x);
        assert_eq!(Activation::Relu.activate(x), array![0., 2.].into_dyn());
        assert_eq!(
            serde_json::to_string(&Activation::Softmax).unwrap(),
            "\"softmax\""
        );
    }
}
