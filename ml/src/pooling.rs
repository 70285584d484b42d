use crate::{
    convolutions::{conv_output_length, Padding},
    ImagePrecision,
};
use ndarray::*;

/// Max pooling over (height, width, channels) images. Each channel is pooled on its own.
pub struct MaxPoolingLayer {
    pool_size: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
}

impl MaxPoolingLayer {
    pub fn new(pool_size: (usize, usize), stride: (usize, usize), padding: Padding) -> Self {
        debug_assert!(stride.0 > 0 && stride.1 > 0, "Stride of 0 passed");
        Self {
            pool_size,
            stride,
            padding,
        }
    }

    pub fn output_size(&self, im_height: usize, im_width: usize) -> (usize, usize) {
        (
            conv_output_length(im_height, self.pool_size.0, self.stride.0, self.padding),
            conv_output_length(im_width, self.pool_size.1, self.stride.1, self.padding),
        )
    }

    /// Pools the image. With "same" padding the padded positions never win the maximum.
    pub fn pool<'a, V>(&self, image: V) -> Array3<ImagePrecision>
    where
        V: AsArray<'a, ImagePrecision, Ix3>,
    {
        let im_arr: ArrayView3<ImagePrecision> = image.into();
        let (im_height, im_width, im_channel) = im_arr.dim();
        let (new_h, new_w) = self.output_size(im_height, im_width);

        let (pad_top, pad_left) = match self.padding {
            Padding::Valid => (0, 0),
            Padding::Same => {
                let pad_h = ((new_h.max(1) - 1) * self.stride.0 + self.pool_size.0)
                    .saturating_sub(im_height);
                let pad_w = ((new_w.max(1) - 1) * self.stride.1 + self.pool_size.1)
                    .saturating_sub(im_width);
                (pad_h / 2, pad_w / 2)
            }
        };

        let mut output = Array::from_elem((new_h, new_w, im_channel), ImagePrecision::NEG_INFINITY);
        for i in 0..new_h {
            let top = (i * self.stride.0).saturating_sub(pad_top);
            let bottom = (i * self.stride.0 + self.pool_size.0 - pad_top).min(im_height);
            for j in 0..new_w {
                let left = (j * self.stride.1).saturating_sub(pad_left);
                let right = (j * self.stride.1 + self.pool_size.1 - pad_left).min(im_width);
                let window = im_arr.slice(s![top..bottom, left..right, ..]);
                let mut target = output.slice_mut(s![i, j, ..]);
                for window_row in window.outer_iter() {
                    for pixel in window_row.outer_iter() {
                        Zip::from(&mut target)
                            .and(&pixel)
                            .for_each(|t, &v| *t = t.max(v));
                    }
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_pool_halves_extent() {
        let img = Array::from_shape_vec(
            (4, 4, 1),
            vec![
                1., 2., 5., 6., //
                3., 4., 7., 8., //
                -1., -2., 0., 0., //
                -3., -4., 0., 9.,
            ],
        )
        .unwrap();
        let layer = MaxPoolingLayer::new((2, 2), (2, 2), Padding::Valid);

        let pooled = layer.pool(&img);

        assert_eq!(
            pooled,
            Array::from_shape_vec((2, 2, 1), vec![4., 8., -1., 9.]).unwrap()
        );
    }

    #[test]
    fn test_max_pool_channels_independent() {
        let img = Array::from_shape_vec((2, 2, 2), vec![1., 10., 2., 20., 3., 30., 4., -40.])
            .unwrap();
        let layer = MaxPoolingLayer::new((2, 2), (2, 2), Padding::Same);

        assert_eq!(layer.pool(&img), array![[[4., 30.]]]);
    }

    #[test]
    fn test_max_pool_same_odd_extent() {
        let img = Array::from_shape_vec((3, 3, 1), (1..=9).map(|v| v as f32).collect()).unwrap();
        let layer = MaxPoolingLayer::new((2, 2), (2, 2), Padding::Same);

        let pooled = layer.pool(&img);

        assert_eq!(
            pooled,
            Array::from_shape_vec((2, 2, 1), vec![5., 6., 8., 9.]).unwrap()
        );
    }
}
