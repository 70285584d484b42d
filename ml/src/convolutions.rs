use crate::{ConvKernel, ImagePrecision, WeightPrecision};
use ndarray::*;
use serde::{Deserialize, Serialize};

/// Padding schemes as they are known from Keras / TensorFlow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// No padding, the kernel only visits positions fully inside the image.
    Valid,
    /// Zero padding so that the output extent is `ceil(input / stride)`.
    Same,
}

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// kernel height x kernel width x input channels x output channels
/// (to comply with the order in which Keras weights are saved).
/// Images are expected in channels-last layout (height, width, channels).
pub struct ConvolutionLayer {
    /// Kernel flattened to (kh * kw * input channels, output channels), matching the im2col rows
    kernel_matrix: Array2<WeightPrecision>,
    bias: Option<Array1<WeightPrecision>>,
    pub(crate) kernel_height: usize,
    pub(crate) kernel_width: usize,
    pub(crate) stride: (usize, usize),
    pub(crate) padding: Padding,
    pub(crate) num_input_channels: usize,
    pub(crate) num_output_channels: usize,
}

impl ConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Option<Array1<WeightPrecision>>,
        stride: (usize, usize),
        padding: Padding,
    ) -> ConvolutionLayer {
        let kernel_height = weights.len_of(Axis(0));
        let kernel_width = weights.len_of(Axis(1));
        let num_input_channels = weights.len_of(Axis(2));
        let num_output_channels = weights.len_of(Axis(3));

        debug_assert!(stride.0 > 0 && stride.1 > 0, "Stride of 0 passed");
        if let Some(b) = &bias {
            debug_assert_eq!(b.len(), num_output_channels);
        }

        // npz files written in fortran order come back with non-standard strides
        let kernel_matrix = weights
            .as_standard_layout()
            .into_owned()
            .into_shape((
                kernel_height * kernel_width * num_input_channels,
                num_output_channels,
            ))
            .expect("kernel is in standard layout");

        ConvolutionLayer {
            kernel_matrix,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            num_input_channels,
            num_output_channels,
        }
    }

    /// Output extent (height, width) for an input of the given extent.
    pub fn output_size(&self, im_height: usize, im_width: usize) -> (usize, usize) {
        (
            conv_output_length(im_height, self.kernel_height, self.stride.0, self.padding),
            conv_output_length(im_width, self.kernel_width, self.stride.1, self.padding),
        )
    }

    /// Returns (pad_top, pad_bottom, pad_left, pad_right) as TensorFlow computes them:
    /// the total padding is split with the odd pixel going to the bottom / right.
    pub(crate) fn get_padding_size(
        &self,
        im_height: usize,
        im_width: usize,
    ) -> (usize, usize, usize, usize) {
        if self.padding == Padding::Valid {
            return (0, 0, 0, 0);
        }
        let (out_h, out_w) = self.output_size(im_height, im_width);
        let pad_h = ((out_h - 1) * self.stride.0 + self.kernel_height).saturating_sub(im_height);
        let pad_w = ((out_w - 1) * self.stride.1 + self.kernel_width).saturating_sub(im_width);
        let pad_top = pad_h / 2;
        let pad_left = pad_w / 2;
        (pad_top, pad_h - pad_top, pad_left, pad_w - pad_left)
    }

    /// Performs a convolution on the given (height, width, channels) image using this layers parameters.
    ///
    /// The image is zero padded once, then every output row is computed as an im2col
    /// matrix product, which keeps the scratch memory at one row of patches.
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve<'a, V>(&self, image: V) -> Array3<ImagePrecision>
    where
        V: AsArray<'a, ImagePrecision, Ix3>,
    {
        let im_arr: ArrayView3<ImagePrecision> = image.into();
        let (im_height, im_width, im_channel) = im_arr.dim();
        debug_assert_eq!(im_channel, self.num_input_channels);

        let (new_im_height, new_im_width) = self.output_size(im_height, im_width);
        let (pad_top, pad_bottom, pad_left, pad_right) =
            self.get_padding_size(im_height, im_width);

        let mut padded: Array3<ImagePrecision> = Array::zeros((
            im_height + pad_top + pad_bottom,
            im_width + pad_left + pad_right,
            im_channel,
        ));
        padded
            .slice_mut(s![
                pad_top..pad_top + im_height,
                pad_left..pad_left + im_width,
                ..
            ])
            .assign(&im_arr);

        let mut output = Array::zeros((new_im_height, new_im_width, self.num_output_channels));
        for i in 0..new_im_height {
            let im_col = self.im2col_row(padded.view(), i, new_im_width);
            let mut row = im_col.dot(&self.kernel_matrix);
            if let Some(bias) = &self.bias {
                row += bias;
            }
            output.slice_mut(s![i, .., ..]).assign(&row);
        }
        output
    }

    /// Collects the patches of output row `row` into a (out_width, kh * kw * C) matrix.
    fn im2col_row(
        &self,
        padded: ArrayView3<ImagePrecision>,
        row: usize,
        new_im_width: usize,
    ) -> Array2<ImagePrecision> {
        let im_channel = padded.len_of(Axis(2));
        let patch_len = self.kernel_height * self.kernel_width * im_channel;
        let mut img_matrix: Array2<ImagePrecision> = Array::zeros((new_im_width, patch_len));

        let i_with_stride = row * self.stride.0;
        for j in 0..new_im_width {
            let j_with_stride = j * self.stride.1;
            let patch = padded.slice(s![
                i_with_stride..i_with_stride + self.kernel_height,
                j_with_stride..j_with_stride + self.kernel_width,
                ..
            ]);
            // logical iteration order is (kh, kw, c), the same as the kernel matrix rows
            for (dst, src) in img_matrix.row_mut(j).iter_mut().zip(patch.iter()) {
                *dst = *src;
            }
        }
        img_matrix
    }
}

/// Output length along one axis of a strided convolution or pooling window.
pub fn conv_output_length(input: usize, kernel: usize, stride: usize, padding: Padding) -> usize {
    match padding {
        Padding::Same => (input + stride - 1) / stride,
        Padding::Valid => {
            if input < kernel {
                0
            } else {
                (input - kernel) / stride + 1
            }
        }
    }
}
