use burn::prelude::*;
use burn::tensor::activation::log_sigmoid;
use burn::tensor::Distribution;

/// `0.5 * ln(2 * pi)`
pub const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// Normal distribution over a tensor of independent elements.
#[derive(Clone, Debug)]
pub struct Normal<B: Backend, const D: usize> {
    pub loc: Tensor<B, D>,
    pub scale: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Normal<B, D> {
    pub fn new(loc: Tensor<B, D>, scale: Tensor<B, D>) -> Self {
        Self { loc, scale }
    }

    /// Differentiable draw `loc + scale * eps` with `eps ~ N(0, 1)`.
    pub fn rsample(&self) -> Tensor<B, D> {
        let eps = Tensor::random(
            self.loc.shape(),
            Distribution::Normal(0.0, 1.0),
            &self.loc.device(),
        );
        self.loc.clone().add(self.scale.clone().mul(eps))
    }

    /// Draw detached from the autodiff graph.
    pub fn sample(&self) -> Tensor<B, D> {
        self.rsample().detach()
    }

    pub fn log_prob(&self, value: Tensor<B, D>) -> Tensor<B, D> {
        let z = value.sub(self.loc.clone()).div(self.scale.clone());
        z.square()
            .mul_scalar(-0.5)
            .sub(self.scale.clone().log())
            .sub_scalar(HALF_LN_2PI)
    }
}

/// Log-density of `value` under `N(0, 1)`.
pub fn standard_normal_log_prob<B: Backend, const D: usize>(value: Tensor<B, D>) -> Tensor<B, D> {
    value.square().mul_scalar(-0.5).sub_scalar(HALF_LN_2PI)
}

/// Negative-Binomial parameterized by `total_count` and success `logits`.
#[derive(Clone, Debug)]
pub struct NegativeBinomial<B: Backend, const D: usize> {
    pub total_count: Tensor<B, D>,
    pub logits: Tensor<B, D>,
}

impl<B: Backend, const D: usize> NegativeBinomial<B, D> {
    pub fn new(total_count: Tensor<B, D>, logits: Tensor<B, D>) -> Self {
        Self {
            total_count,
            logits,
        }
    }

    pub fn mean(&self) -> Tensor<B, D> {
        self.total_count.clone().mul(self.logits.clone().exp())
    }

    pub fn log_prob(&self, value: Tensor<B, D>) -> Tensor<B, D> {
        let r = self.total_count.clone();
        let unnormalized = r
            .clone()
            .mul(log_sigmoid(self.logits.clone().neg()))
            .add(value.clone().mul(log_sigmoid(self.logits.clone())));
        let normalization = lgamma(r.clone().add(value.clone()))
            .sub(lgamma(value.add_scalar(1.0)))
            .sub(lgamma(r));
        unnormalized.add(normalization)
    }
}

/// Differentiable `ln(Gamma(x))` for `x > 0`.
///
/// Shifts the argument by six with the recurrence
/// `lgamma(x) = lgamma(x + 6) - sum_k ln(x + k)` and evaluates the Stirling
/// series there, which keeps the error below 1e-9 for any positive input.
pub fn lgamma<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let mut shift = x.clone().log();
    for k in 1..6 {
        shift = shift.add(x.clone().add_scalar(k as f64).log());
    }

    let z = x.add_scalar(6.0);
    let inv = z.clone().recip();
    let inv2 = inv.clone().square();
    let series = inv2.clone().mul_scalar(-1.0 / 1680.0).add_scalar(1.0 / 1260.0);
    let series = inv2.clone().mul(series).neg().add_scalar(1.0 / 360.0);
    let series = inv2.mul(series).neg().add_scalar(1.0 / 12.0);
    let series = inv.mul(series);

    z.clone()
        .sub_scalar(0.5)
        .mul(z.clone().log())
        .sub(z)
        .add_scalar(HALF_LN_2PI)
        .add(series)
        .sub(shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn tensor(values: &[f32]) -> Tensor<TestBackend, 1> {
        Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), &Default::default())
    }

    fn values(t: Tensor<TestBackend, 1>) -> Vec<f32> {
        t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f64], tol: f64) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((*a as f64 - e).abs() < tol, "{a} != {e}");
        }
    }

    #[test]
    fn lgamma_matches_known_values() {
        let out = values(lgamma(tensor(&[1.0, 2.0, 5.0, 0.5, 10.5])));
        assert_close(
            &out,
            &[0.0, 0.0, 24f64.ln(), 0.572_364_942_924_7, 13.940_625_219_403_76],
            1e-4,
        );
    }

    #[test]
    fn lgamma_is_finite_near_zero() {
        let out = values(lgamma(tensor(&[1e-10])));
        assert!(out[0].is_finite());
        assert!((out[0] as f64 - 23.025_850_929_94).abs() < 1e-2);
    }

    #[test]
    fn normal_log_prob() {
        let normal = Normal::new(tensor(&[0.0, 1.0]), tensor(&[1.0, 2.0]));
        let out = values(normal.log_prob(tensor(&[0.0, 3.0])));
        assert_close(
            &out,
            &[-HALF_LN_2PI, -0.5 - 2f64.ln() - HALF_LN_2PI],
            1e-5,
        );
        let standard = values(standard_normal_log_prob(tensor(&[0.0])));
        assert_close(&standard, &[-HALF_LN_2PI], 1e-6);
    }

    #[test]
    fn negative_binomial_log_prob_and_mean() {
        // r = 2, p = sigmoid(0) = 0.5, k = 3: C(4, 3) * 0.5^2 * 0.5^3 = 4 / 32
        let nb = NegativeBinomial::new(tensor(&[2.0]), tensor(&[0.0]));
        let out = values(nb.log_prob(tensor(&[3.0])));
        assert_close(&out, &[(4.0f64 / 32.0).ln()], 1e-4);
        assert_close(&values(nb.mean()), &[2.0], 1e-6);
    }

    #[test]
    fn rsample_with_zero_scale_returns_loc() {
        let normal = Normal::new(tensor(&[1.5, -2.0]), tensor(&[0.0, 0.0]));
        assert_close(&values(normal.sample()), &[1.5, -2.0], 1e-6);
    }
}
