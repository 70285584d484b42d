//! Building blocks for the Tiramisu segmentation network: a layer graph with shape
//! inference, the numeric layers it is evaluated with, weight loading and the
//! topology builder itself.
pub mod activation_functions;
pub mod convolutions;
pub mod graph;
pub mod inference;
pub mod models;
pub mod normalization;
pub mod pooling;
pub mod topology;
pub mod transposed_convolutions;
pub mod weight_loader;

use ndarray::Array4;

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;
/// Convolution kernels, always stored in Keras layout with the spatial axes first.
pub type ConvKernel = Array4<WeightPrecision>;
