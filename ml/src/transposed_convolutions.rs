/// Transposed convolutions (also wrongly called deconvolution layers)
/// are learnable upsampling maps.
/// More can be read here:
/// - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
/// - https://github.com/akutzer/numpy_cnn/blob/master/CNN/Layer/TransposedConv.py
/// - https://ieee.nitk.ac.in/blog/deconv/
use crate::{convolutions::Padding, ConvKernel, ImagePrecision, WeightPrecision};
use ndarray::*;

/// Analog to a Convolution Layer. The kernel is stored as Keras saves it:
/// kernel height x kernel width x output channels x input channels.
pub struct TransposedConvolutionLayer {
    /// Kernel rearranged to (input channels, kh * kw * output channels)
    kernel_matrix: Array2<WeightPrecision>,
    bias: Option<Array1<WeightPrecision>>,
    kernel_height: usize,
    kernel_width: usize,
    stride: (usize, usize),
    padding: Padding,
    num_output_channels: usize,
}

impl TransposedConvolutionLayer {
    pub fn new(
        weights: ConvKernel,
        bias: Option<Array1<WeightPrecision>>,
        stride: (usize, usize),
        padding: Padding,
    ) -> TransposedConvolutionLayer {
        let (kernel_height, kernel_width, num_output_channels, num_input_channels) = weights.dim();
        debug_assert!(stride.0 > 0 && stride.1 > 0, "Stride of 0 passed");

        // (kh, kw, out, in) -> (in, kh, kw, out), then flatten everything but the input channels
        let permuted = weights.permuted_axes([3, 0, 1, 2]);
        let kernel_matrix = Array::from_shape_vec(
            (
                num_input_channels,
                kernel_height * kernel_width * num_output_channels,
            ),
            permuted.iter().copied().collect(),
        )
        .expect("element count is preserved by the permutation");

        TransposedConvolutionLayer {
            kernel_matrix,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            num_output_channels,
        }
    }

    /// Output extent (height, width) for an input of the given extent.
    pub fn output_size(&self, im_height: usize, im_width: usize) -> (usize, usize) {
        (
            deconv_output_length(im_height, self.kernel_height, self.stride.0, self.padding),
            deconv_output_length(im_width, self.kernel_width, self.stride.1, self.padding),
        )
    }

    /// Performs a transposed convolution on the (height, width, channels) input image.
    /// This upsamples the image.
    ///
    /// Every input pixel scatters `kernel * pixel` into the output at `stride * position`.
    /// The full scatter result is then cropped the way TensorFlow crops for "same" padding:
    /// the surplus `kernel - stride` pixels are removed, the odd one from the bottom / right.
    pub fn transposed_convolve<'a, V>(&self, image: V) -> Array3<ImagePrecision>
    where
        V: AsArray<'a, ImagePrecision, Ix3>,
    {
        let im2d_arr: ArrayView3<ImagePrecision> = image.into();
        let (im_height, im_width, _) = im2d_arr.dim();
        let (sh, sw) = self.stride;
        let (kh, kw) = (self.kernel_height, self.kernel_width);
        let c_out = self.num_output_channels;

        let (new_im_height, new_im_width) = self.output_size(im_height, im_width);
        let (pad_top, pad_left) = match self.padding {
            Padding::Same => (kh.saturating_sub(sh) / 2, kw.saturating_sub(sw) / 2),
            Padding::Valid => (0, 0),
        };

        // H_full = (H - 1) * stride + HH, possibly extended when the stride exceeds the kernel
        let full_height = ((im_height - 1) * sh + kh).max(pad_top + new_im_height);
        let full_width = ((im_width - 1) * sw + kw).max(pad_left + new_im_width);
        let mut full: Array3<ImagePrecision> = Array::zeros((full_height, full_width, c_out));

        for i in 0..im_height {
            // (W, C_in) x (C_in, kh * kw * C_out)
            let contributions = im2d_arr.slice(s![i, .., ..]).dot(&self.kernel_matrix);
            let contributions = contributions
                .into_shape((im_width, kh, kw, c_out))
                .expect("row product has W * kh * kw * C_out elements");
            for j in 0..im_width {
                let mut window = full.slice_mut(s![i * sh..i * sh + kh, j * sw..j * sw + kw, ..]);
                window += &contributions.slice(s![j, .., .., ..]);
            }
        }

        let mut output = full
            .slice(s![
                pad_top..pad_top + new_im_height,
                pad_left..pad_left + new_im_width,
                ..
            ])
            .to_owned();
        if let Some(bias) = &self.bias {
            output += bias;
        }
        output
    }
}

/// Output length along one axis of a transposed convolution, as Keras computes it.
pub fn deconv_output_length(input: usize, kernel: usize, stride: usize, padding: Padding) -> usize {
    match padding {
        Padding::Same => input * stride,
        Padding::Valid => input * stride + kernel.saturating_sub(stride),
    }
}
