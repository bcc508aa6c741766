use crate::checkpoint::CheckpointStore;
use crate::data::{Slide, SlideTensors};
use crate::distributions::Normal;
use crate::error::HsslError;
use crate::interrupt::InterruptScope;
use crate::model::{elbo_terms, Histonet, ModelConfig, SCALE_FLOOR};
use crate::utils::{
    collect_scalars, format_diagnostics, mean_diagnostics, save_image, tensor_to_image,
    Diagnostics,
};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Training configuration, saved as `config.json` in the output directory.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 100)]
    pub report_interval: usize,
    #[config(default = 50000)]
    pub checkpoint_interval: usize,
    #[config(default = 42)]
    pub seed: u64,
    /// Ramp the KL weight linearly from 0 to 1 over `anneal_iterations`.
    #[config(default = false)]
    pub anneal_dkl: bool,
    #[config(default = 10000)]
    pub anneal_iterations: usize,
    #[config(default = false)]
    pub spike_prior: bool,
    /// Checkpoint file, or checkpoint directory to resume from its latest
    /// checkpoint.
    pub state: Option<String>,
    /// Stop after this iteration; unbounded when unset.
    pub max_iterations: Option<usize>,
}

impl TrainingConfig {
    /// Weight of the KL term at `iteration`.
    pub fn kl_weight(&self, iteration: usize) -> f64 {
        if self.anneal_dkl && self.anneal_iterations > 0 {
            (iteration as f64 / self.anneal_iterations as f64).min(1.0)
        } else {
            1.0
        }
    }
}

/// Output directories of a run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub images: PathBuf,
    pub noise: PathBuf,
    pub checkpoints: PathBuf,
}

impl OutputLayout {
    pub fn create(root: &Path) -> Result<Self> {
        let layout = Self {
            root: root.to_path_buf(),
            images: root.join("images"),
            noise: root.join("noise"),
            checkpoints: root.join("checkpoints"),
        };
        for dir in [&layout.root, &layout.images, &layout.noise, &layout.checkpoints] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(layout)
    }

    fn frame(dir: &Path, iteration: usize) -> PathBuf {
        dir.join(format!("iteration-{iteration:05}.jpg"))
    }
}

pub type HistonetOptimizer<B> = OptimizerAdaptor<Adam, Histonet<B>, B>;

/// Everything that changes from one iteration to the next.
pub struct TrainingState<B: AutodiffBackend> {
    /// Last completed iteration.
    pub iteration: usize,
    pub model: Histonet<B>,
    pub optimizer: HistonetOptimizer<B>,
    /// Latent sample decoded at every report.
    pub fixed_noise: Tensor<B::InnerBackend, 4>,
}

impl<B: AutodiffBackend> TrainingState<B> {
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        let model = config.model.init::<B>(device);
        let fixed_noise = Tensor::random(
            config.model.latent_shape(),
            Distribution::Normal(0.0, 1.0),
            device,
        );
        Self {
            iteration: 0,
            model,
            optimizer: config.optimizer.init::<B, Histonet<B>>(),
            fixed_noise,
        }
    }

    /// Load model and optimizer state from a checkpoint file.
    pub fn restore(&mut self, path: &Path, device: &B::Device) -> Result<()> {
        let store = CheckpointStore::new(path.parent().unwrap_or(Path::new(".")));
        self.iteration = store.restore(
            path,
            &mut self.model,
            std::slice::from_mut(&mut self.optimizer),
            device,
        )?;
        Ok(())
    }

    /// Run one optimization step and return its scalar diagnostics.
    pub fn step(&mut self, observed: &SlideTensors<B>, config: &TrainingConfig) -> Diagnostics {
        let iteration = self.iteration + 1;

        let (z, decoded) = self.model.forward();
        let dkl = self.model.kl_divergence(z, decoded.logit.clone());
        let terms = elbo_terms(decoded, observed, dkl, config.kl_weight(iteration));

        let grads = terms.loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(config.learning_rate, self.model.clone(), grads);
        self.iteration = iteration;

        collect_scalars(terms.diagnostics())
    }

    /// Decode a posterior sample and the fixed noise in evaluation mode and
    /// write a sampled image of each.
    pub fn write_samples(&self, layout: &OutputLayout) -> Result<()> {
        let model = self.model.valid();
        let image_shape = model.image_shape();

        let (_, decoded) = model.forward();
        let image = Normal::new(decoded.image_mean, decoded.image_scale.clamp_min(SCALE_FLOOR));
        save_image(
            &tensor_to_image(image.sample())?,
            &OutputLayout::frame(&layout.images, self.iteration),
        )?;

        let decoded = model
            .decode(self.fixed_noise.clone())
            .center_crop(image_shape);
        let image = Normal::new(decoded.image_mean, decoded.image_scale.clamp_min(SCALE_FLOOR));
        save_image(
            &tensor_to_image(image.sample())?,
            &OutputLayout::frame(&layout.noise, self.iteration),
        )?;
        Ok(())
    }
}

/// Iterate until `stop` is raised or the iteration limit is reached and
/// return the last completed iteration.
///
/// `stop` is checked only between iterations, so the update, diagnostics
/// and side effects of an iteration always complete.
pub fn run_loop<B: AutodiffBackend>(
    state: &mut TrainingState<B>,
    observed: &SlideTensors<B>,
    config: &TrainingConfig,
    layout: &OutputLayout,
    stop: &AtomicBool,
) -> Result<usize> {
    let store = CheckpointStore::new(&layout.checkpoints);
    let mut window: Vec<Diagnostics> = Vec::with_capacity(config.report_interval);

    loop {
        let diagnostics = state.step(observed, config);
        let iteration = state.iteration;
        info!("iteration {iteration}: {}", format_diagnostics(&diagnostics));
        window.push(diagnostics);

        if config.checkpoint_interval > 0 && iteration % config.checkpoint_interval == 0 {
            store.save::<B, _, _>(
                &state.model,
                std::slice::from_ref(&state.optimizer),
                iteration,
            )?;
        }

        if config.report_interval > 0 && iteration % config.report_interval == 0 {
            state.write_samples(layout)?;
            let means = mean_diagnostics(&window)?;
            info!(
                "iteration {iteration}: mean of last {}: {}",
                window.len(),
                format_diagnostics(&means)
            );
            window.clear();
        }

        if stop.load(Ordering::SeqCst) {
            info!("stopping after iteration {iteration}");
            return Ok(iteration);
        }
        if config.max_iterations.is_some_and(|limit| iteration >= limit) {
            return Ok(iteration);
        }
    }
}

/// Train on one slide, writing images and checkpoints below `output_dir`.
///
/// Returns the last completed iteration.
pub fn train<B: AutodiffBackend>(
    slide: &Slide,
    config: TrainingConfig,
    output_dir: &Path,
    device: B::Device,
) -> Result<usize> {
    if config.spike_prior {
        return Err(HsslError::Unsupported("spike prior".into()).into());
    }
    let model = &config.model;
    if model.num_genes != slide.num_genes()
        || [model.image_height, model.image_width] != [slide.height(), slide.width()]
    {
        return Err(HsslError::DimensionMismatch {
            what: "model config against slide (genes, height, width)",
            expected: vec![slide.num_genes(), slide.height(), slide.width()],
            found: vec![model.num_genes, model.image_height, model.image_width],
        }
        .into());
    }

    let layout = OutputLayout::create(output_dir)?;
    config
        .save(layout.root.join("config.json"))
        .context("failed to save config.json")?;

    B::seed(&device, config.seed);
    let observed = SlideTensors::<B>::from_slide(slide, &device);
    let mut state = TrainingState::<B>::new(&config, &device);

    if let Some(source) = &config.state {
        let source = PathBuf::from(source);
        let path = if source.is_dir() {
            CheckpointStore::new(&source)
                .latest::<B>()?
                .with_context(|| format!("no checkpoint found in {}", source.display()))?
        } else {
            source
        };
        state.restore(&path, &device)?;
    }
    info!("starting at iteration {}", state.iteration + 1);

    let stop = Arc::new(AtomicBool::new(false));
    let _scope = {
        let stop = stop.clone();
        InterruptScope::install(move || {
            warn!("interrupt received, stopping after the current iteration");
            stop.store(true, Ordering::SeqCst);
        })?
    };

    run_loop(&mut state, &observed, &config, &layout, &stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::{s, Array2, Array3};

    type TestBackend = Autodiff<NdArray<f32>>;

    fn slide() -> Slide {
        let mut label = Array2::zeros((20, 20));
        label.slice_mut(s![2..8, 2..8]).fill(1);
        label.slice_mut(s![10..18, 4..16]).fill(2);
        let counts = ndarray::arr2(&[[3.0, 0.0], [1.0, 7.0]]);
        Slide::new(Array3::from_elem((20, 20, 3), 128), label, counts).unwrap()
    }

    fn config() -> TrainingConfig {
        TrainingConfig::new(ModelConfig::new(2, 2, 20, 20).with_nf(2), AdamConfig::new())
    }

    #[test]
    fn kl_weight_warms_up_linearly() {
        let annealed = config().with_anneal_dkl(true).with_anneal_iterations(4);
        assert_eq!(annealed.kl_weight(1), 0.25);
        assert_eq!(annealed.kl_weight(4), 1.0);
        assert_eq!(annealed.kl_weight(9), 1.0);
        assert_eq!(config().kl_weight(1), 1.0);
    }

    #[test]
    fn raised_stop_runs_exactly_one_iteration() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::create(dir.path()).unwrap();
        let config = config();
        let observed = SlideTensors::<TestBackend>::from_slide(&slide(), &device);
        let mut state = TrainingState::<TestBackend>::new(&config, &device);

        let stop = AtomicBool::new(true);
        let last = run_loop(&mut state, &observed, &config, &layout, &stop).unwrap();
        assert_eq!(last, 1);
        assert_eq!(state.iteration, 1);
    }

    #[test]
    fn step_reports_finite_diagnostics() {
        let device = Default::default();
        let config = config();
        let observed = SlideTensors::<TestBackend>::from_slide(&slide(), &device);
        let mut state = TrainingState::<TestBackend>::new(&config, &device);

        let diagnostics = state.step(&observed, &config);
        let names: Vec<&str> = diagnostics.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["loss", "p(lab|z)", "rmse", "p(img|z)", "dqp"]);
        assert!(diagnostics.iter().all(|(_, value)| value.is_finite()));
    }

    #[test]
    fn reports_and_checkpoints_on_schedule() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::create(dir.path()).unwrap();
        let config = config()
            .with_report_interval(2)
            .with_checkpoint_interval(3)
            .with_max_iterations(Some(4));
        let observed = SlideTensors::<TestBackend>::from_slide(&slide(), &device);
        let mut state = TrainingState::<TestBackend>::new(&config, &device);

        let last = run_loop(&mut state, &observed, &config, &layout, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(last, 4);
        for iteration in [2, 4] {
            assert!(OutputLayout::frame(&layout.images, iteration).exists());
            assert!(OutputLayout::frame(&layout.noise, iteration).exists());
        }
        assert!(!OutputLayout::frame(&layout.images, 3).exists());

        let store = CheckpointStore::new(&layout.checkpoints);
        assert_eq!(
            store.latest::<TestBackend>().unwrap(),
            Some(store.path_for::<TestBackend>(3))
        );
    }

    #[test]
    fn spike_prior_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config().with_spike_prior(true);
        let err = train::<TestBackend>(&slide(), config, dir.path(), Default::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HsslError>(),
            Some(HsslError::Unsupported(_))
        ));
    }

    #[test]
    fn mismatched_model_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::new(ModelConfig::new(2, 3, 20, 20), AdamConfig::new());
        let err = train::<TestBackend>(&slide(), config, dir.path(), Default::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HsslError>(),
            Some(HsslError::DimensionMismatch { .. })
        ));
    }
}
