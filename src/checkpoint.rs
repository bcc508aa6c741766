use crate::error::{HsslError, Result};
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::record::{
    FileRecorder, FullPrecisionSettings, NamedMpkFileRecorder, PrecisionSettings, Record,
    Recorder,
};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Model state, optimizer states and iteration, stored as one record.
pub struct CheckpointRecord<MR, OR> {
    pub model: MR,
    pub optimizers: Vec<OR>,
    pub iteration: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct CheckpointItem<M, O> {
    model: M,
    optimizers: Vec<O>,
    iteration: usize,
}

impl<B, MR, OR> Record<B> for CheckpointRecord<MR, OR>
where
    B: Backend,
    MR: Record<B>,
    OR: Record<B>,
{
    type Item<S: PrecisionSettings> = CheckpointItem<MR::Item<S>, OR::Item<S>>;

    fn into_item<S: PrecisionSettings>(self) -> Self::Item<S> {
        CheckpointItem {
            model: <MR as Record<B>>::into_item::<S>(self.model),
            optimizers: self
                .optimizers
                .into_iter()
                .map(|record| <OR as Record<B>>::into_item::<S>(record))
                .collect(),
            iteration: self.iteration,
        }
    }

    fn from_item<S: PrecisionSettings>(item: Self::Item<S>, device: &B::Device) -> Self {
        Self {
            model: <MR as Record<B>>::from_item::<S>(item.model, device),
            optimizers: item
                .optimizers
                .into_iter()
                .map(|item| <OR as Record<B>>::from_item::<S>(item, device))
                .collect(),
            iteration: item.iteration,
        }
    }
}

/// Directory of `iteration-NNNNN` checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    recorder: CheckpointRecorder,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            recorder: CheckpointRecorder::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension<B: Backend>() -> &'static str {
        <CheckpointRecorder as FileRecorder<B>>::file_extension()
    }

    /// Path of the checkpoint for `iteration`.
    pub fn path_for<B: Backend>(&self, iteration: usize) -> PathBuf {
        self.dir
            .join(format!("iteration-{iteration:05}"))
            .with_extension(Self::extension::<B>())
    }

    /// Write a checkpoint for `iteration`.
    ///
    /// The record is written to a hidden file in the store directory and
    /// renamed into place, so a reader never sees a partial checkpoint.
    pub fn save<B, M, O>(&self, model: &M, optimizers: &[O], iteration: usize) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        std::fs::create_dir_all(&self.dir).map_err(|err| HsslError::io(&self.dir, err))?;

        let record = CheckpointRecord {
            model: model.clone().into_record(),
            optimizers: optimizers.iter().map(|optimizer| optimizer.to_record()).collect(),
            iteration,
        };

        let partial = self.dir.join(format!(".iteration-{iteration:05}-partial"));
        Recorder::<B>::record(&self.recorder, record, partial.clone()).map_err(|err| {
            HsslError::Recorder {
                path: partial.display().to_string(),
                message: format!("{err:?}"),
            }
        })?;

        let partial = partial.with_extension(Self::extension::<B>());
        let target = self.path_for::<B>(iteration);
        std::fs::rename(&partial, &target).map_err(|err| HsslError::io(&target, err))?;
        info!("saved checkpoint {}", target.display());
        Ok(target)
    }

    /// Restore `model` and `optimizers` from the checkpoint at `path` and
    /// return its iteration.
    ///
    /// Nothing is modified unless the whole record loads and holds exactly
    /// one optimizer state per optimizer given.
    pub fn restore<B, M, O>(
        &self,
        path: impl AsRef<Path>,
        model: &mut M,
        optimizers: &mut [O],
        device: &B::Device,
    ) -> Result<usize>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B> + Clone,
    {
        let path = path.as_ref();
        let record: CheckpointRecord<M::Record, O::Record> =
            Recorder::<B>::load(&self.recorder, path.to_path_buf(), device).map_err(|err| {
                HsslError::Recorder {
                    path: path.display().to_string(),
                    message: format!("{err:?}"),
                }
            })?;

        if record.optimizers.len() != optimizers.len() {
            return Err(HsslError::StateMismatch {
                stored: record.optimizers.len(),
                provided: optimizers.len(),
            });
        }

        *model = model.clone().load_record(record.model);
        for (optimizer, state) in optimizers.iter_mut().zip(record.optimizers) {
            *optimizer = optimizer.clone().load_record(state);
        }
        info!(
            "restored checkpoint {} at iteration {}",
            path.display(),
            record.iteration
        );
        Ok(record.iteration)
    }

    /// The highest-iteration checkpoint in the store, if any.
    pub fn latest<B: Backend>(&self) -> Result<Option<PathBuf>> {
        let pattern = self
            .dir
            .join(format!("iteration-*.{}", Self::extension::<B>()));
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|err| HsslError::Recorder {
            path: pattern.to_string(),
            message: err.to_string(),
        })?;

        Ok(paths
            .filter_map(std::result::Result::ok)
            .filter_map(|path| Some((iteration_of(&path)?, path)))
            .max_by_key(|(iteration, _)| *iteration)
            .map(|(_, path)| path))
    }
}

fn iteration_of(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("iteration-")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn latest_picks_highest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.latest::<TestBackend>().unwrap().is_none());

        for iteration in [5, 120, 40] {
            std::fs::write(store.path_for::<TestBackend>(iteration), b"").unwrap();
        }
        std::fs::write(dir.path().join(".iteration-00999-partial.mpk"), b"").unwrap();

        let latest = store.latest::<TestBackend>().unwrap().unwrap();
        assert_eq!(latest, store.path_for::<TestBackend>(120));
        assert_eq!(iteration_of(&latest), Some(120));
    }

    #[test]
    fn checkpoint_names_are_zero_padded() {
        let store = CheckpointStore::new("/tmp/run/checkpoints");
        let path = store.path_for::<TestBackend>(42);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            format!("iteration-00042.{}", CheckpointStore::extension::<TestBackend>())
        );
    }
}
