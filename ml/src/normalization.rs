use crate::{models::InternalDataRepresentation, WeightPrecision};
use ndarray::*;

/// Default epsilon of Keras' BatchNormalization layer.
pub const BATCH_NORM_EPSILON: f32 = 1e-3;

/// Batch normalization in inference mode: the moving statistics recorded during training
/// are applied to the last (channel) axis of the input.
///
/// y = gamma * (x - moving_mean) / sqrt(moving_variance + epsilon) + beta
pub struct BatchNormLayer {
    /// gamma / sqrt(moving_variance + epsilon)
    scale: Array1<WeightPrecision>,
    /// beta - moving_mean * scale
    shift: Array1<WeightPrecision>,
}

impl BatchNormLayer {
    pub fn new(
        gamma: Array1<WeightPrecision>,
        beta: Array1<WeightPrecision>,
        moving_mean: Array1<WeightPrecision>,
        moving_variance: Array1<WeightPrecision>,
        epsilon: f32,
    ) -> Self {
        debug_assert!(
            gamma.len() == beta.len()
                && gamma.len() == moving_mean.len()
                && gamma.len() == moving_variance.len()
        );
        let scale = &gamma / &moving_variance.mapv(|v| (v + epsilon).sqrt());
        let shift = &beta - &(&moving_mean * &scale);
        Self { scale, shift }
    }

    pub fn num_channels(&self) -> usize {
        self.scale.len()
    }

    pub fn normalize(&self, mut x: InternalDataRepresentation) -> InternalDataRepresentation {
        let last = Axis(x.ndim() - 1);
        debug_assert_eq!(x.len_of(last), self.num_channels());
        for mut lane in x.lanes_mut(last) {
            Zip::from(&mut lane)
                .and(&self.scale)
                .and(&self.shift)
                .for_each(|v, &a, &b| *v = *v * a + b);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_norm_per_channel() {
        let layer = BatchNormLayer::new(
            array![1., 2.],
            array![0., 1.],
            array![1., -1.],
            array![4., 1.],
            0.,
        );
        let x = array![[[3., 1.], [1., -1.]]].into_dyn();

        let y = layer.normalize(x);

        // channel 0: (x - 1) / 2, channel 1: 2 * (x + 1) + 1
        assert_eq!(y, array![[[1., 5.], [0., 1.]]].into_dyn());
    }

    #[test]
    fn test_batch_norm_epsilon() {
        let layer = BatchNormLayer::new(array![1.], array![0.], array![0.], array![0.], 0.25);
        let y = layer.normalize(array![[1.], [-2.]].into_dyn());
        assert_eq!(y, array![[2.], [-4.]].into_dyn());
    }
}
