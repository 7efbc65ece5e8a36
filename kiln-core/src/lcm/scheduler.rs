//! Consistency-model sampling schedule.
//!
//! Latent consistency models are distilled on a coarse grid of the 1000
//! training timesteps. Inference picks `num_inference_steps` entries out of
//! an `origin_steps`-sized grid, runs the UNet once per entry, and blends
//! each epsilon prediction back to a clean-image estimate with the
//! boundary-condition coefficients `c_skip`/`c_out`.

use anyhow::{bail, Result};
use candle_core::Tensor;

const NUM_TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.000_85;
const BETA_END: f64 = 0.012;
const SIGMA_DATA: f64 = 0.5;
const TIMESTEP_SCALING: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ConsistencySchedule {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
}

impl ConsistencySchedule {
    pub fn new(steps: usize, origin_steps: usize) -> Result<Self> {
        if steps == 0 {
            bail!("num_inference_steps must be at least 1");
        }
        if origin_steps == 0 || origin_steps > NUM_TRAIN_TIMESTEPS {
            bail!("lcm_origin_steps must be between 1 and {NUM_TRAIN_TIMESTEPS}");
        }
        if steps > origin_steps {
            bail!("num_inference_steps ({steps}) cannot exceed lcm_origin_steps ({origin_steps})");
        }

        // Scaled-linear beta schedule, as trained.
        let sqrt_start = BETA_START.sqrt();
        let sqrt_end = BETA_END.sqrt();
        let mut alphas_cumprod = Vec::with_capacity(NUM_TRAIN_TIMESTEPS);
        let mut product = 1.0;
        for i in 0..NUM_TRAIN_TIMESTEPS {
            let frac = i as f64 / (NUM_TRAIN_TIMESTEPS - 1) as f64;
            let beta = (sqrt_start + frac * (sqrt_end - sqrt_start)).powi(2);
            product *= 1.0 - beta;
            alphas_cumprod.push(product);
        }

        // The distillation grid, then every `stride`-th entry from the top.
        let grid_step = NUM_TRAIN_TIMESTEPS / origin_steps;
        let grid: Vec<usize> = (0..origin_steps).map(|i| grid_step * (i + 1) - 1).collect();
        let stride = origin_steps / steps;
        let timesteps: Vec<usize> = grid.iter().rev().step_by(stride).take(steps).copied().collect();

        Ok(Self {
            timesteps,
            alphas_cumprod,
        })
    }

    /// Inference timesteps, descending.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn boundary_conditions(timestep: usize) -> (f64, f64) {
        let scaled = TIMESTEP_SCALING * timestep as f64;
        let c_skip = SIGMA_DATA.powi(2) / (scaled.powi(2) + SIGMA_DATA.powi(2));
        let c_out = scaled / (scaled.powi(2) + SIGMA_DATA.powi(2)).sqrt();
        (c_skip, c_out)
    }

    /// One consistency step. Returns the sample to feed into the next UNet
    /// call and the current clean-image estimate; after the final step the
    /// two are identical.
    pub fn step(
        &self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let timestep = self.timesteps[step_index];
        let alpha_prod = self.alphas_cumprod[timestep];
        let beta_prod = 1.0 - alpha_prod;

        let pred_x0 = ((sample - (model_output * beta_prod.sqrt())?)? / alpha_prod.sqrt())?;
        let (c_skip, c_out) = Self::boundary_conditions(timestep);
        let denoised = ((pred_x0 * c_out)? + (sample * c_skip)?)?;

        let prev_sample = match self.timesteps.get(step_index + 1) {
            Some(&next_timestep) => {
                let alpha_next = self.alphas_cumprod[next_timestep];
                let noise = sample.randn_like(0.0, 1.0)?;
                ((&denoised * alpha_next.sqrt())? + (noise * (1.0 - alpha_next).sqrt())?)?
            }
            None => denoised.clone(),
        };
        Ok((prev_sample, denoised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn timesteps_match_the_origin_grid() {
        let schedule = ConsistencySchedule::new(4, 50).unwrap();
        assert_eq!(schedule.timesteps(), &[999, 759, 519, 279]);

        let schedule = ConsistencySchedule::new(8, 8).unwrap();
        assert_eq!(
            schedule.timesteps(),
            &[999, 874, 749, 624, 499, 374, 249, 124]
        );
    }

    #[test]
    fn timesteps_are_descending_and_in_range() {
        let schedule = ConsistencySchedule::new(6, 50).unwrap();
        assert_eq!(schedule.timesteps().len(), 6);
        for pair in schedule.timesteps().windows(2) {
            assert!(pair[0] > pair[1], "{:?}", schedule.timesteps());
        }
        assert!(schedule.timesteps().iter().all(|&t| t < 1000));
    }

    #[test]
    fn invalid_step_counts_are_rejected() {
        assert!(ConsistencySchedule::new(0, 8).is_err());
        assert!(ConsistencySchedule::new(8, 0).is_err());
        assert!(ConsistencySchedule::new(9, 8).is_err());
        assert!(ConsistencySchedule::new(1, 1001).is_err());
    }

    #[test]
    fn boundary_conditions_collapse_at_zero() {
        let (c_skip, c_out) = ConsistencySchedule::boundary_conditions(0);
        assert!((c_skip - 1.0).abs() < 1e-9);
        assert!(c_out.abs() < 1e-9);

        let (late_skip, late_out) = ConsistencySchedule::boundary_conditions(999);
        assert!(late_skip < 1e-6);
        assert!(late_out > 0.999);
    }

    #[test]
    fn final_step_returns_the_denoised_estimate() {
        let schedule = ConsistencySchedule::new(1, 1).unwrap();
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();
        let output = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();

        let (prev, denoised) = schedule.step(&output, 0, &sample).unwrap();
        let prev = prev.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let denoised = denoised.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(prev, denoised);
        assert!(prev.iter().all(|v| v.is_finite()));
    }
}
