use std::path::{Path, PathBuf};

use ort::{ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{
    error::{ExtractError, Result},
    ExecutionProvider,
};

/// File looked up first inside a checkpoint directory.
pub const MODEL_FILE: &str = "model.onnx";

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

/// Resolves the ONNX graph stored in a checkpoint directory: `model.onnx` if
/// present, otherwise the first `*.onnx` file by name.
pub(crate) fn model_file(checkpoint_dir: &Path) -> Result<PathBuf> {
    if !checkpoint_dir.is_dir() {
        return Err(ExtractError::checkpoint(checkpoint_dir, "not a directory"));
    }
    let preferred = checkpoint_dir.join(MODEL_FILE);
    if preferred.is_file() {
        return Ok(preferred);
    }

    let mut candidates = std::fs::read_dir(checkpoint_dir)
        .map_err(|err| ExtractError::checkpoint(checkpoint_dir, err.to_string()))?
        .filter_map(|entry| entry.ok().map(|it| it.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "onnx"))
        .collect::<Vec<_>>();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ExtractError::checkpoint(checkpoint_dir, "no .onnx model found"))
}

#[instrument(level = "debug")]
pub(crate) fn build_session(
    model_path: &Path,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
) -> Result<Session> {
    #[cfg(feature = "directml")]
    let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
    #[cfg(not(feature = "directml"))]
    let parallel = true;

    let execution_providers = execution_providers
        .iter()
        .filter_map(|provider| -> Option<ExecutionProviderDispatch> {
            match provider {
                ExecutionProvider::Default => None,
                #[cfg(feature = "cuda")]
                ExecutionProvider::Cuda => Some(setup_cuda()),
                #[cfg(feature = "directml")]
                ExecutionProvider::DirectML => Some(setup_directml()),
                #[cfg(feature = "coreml")]
                ExecutionProvider::CoreML => Some(setup_coreml()),
            }
        })
        .collect::<Vec<_>>();

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_memory_pattern(parallel)?
        .with_parallel_execution(parallel)?
        .with_inter_threads(num_threads)?
        .with_intra_threads(num_threads)?
        .with_execution_providers(execution_providers)?
        .commit_from_file(model_path)?;

    log::debug!("Session inputs: {:?}", session.inputs);
    log::debug!("Session outputs: {:?}", session.outputs);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_model_onnx() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.onnx"), b"").unwrap();
        std::fs::write(dir.path().join(MODEL_FILE), b"").unwrap();
        assert_eq!(model_file(dir.path()).unwrap(), dir.path().join(MODEL_FILE));
    }

    #[test]
    fn falls_back_to_first_onnx_by_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.onnx"), b"").unwrap();
        std::fs::write(dir.path().join("a.onnx"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        assert_eq!(model_file(dir.path()).unwrap(), dir.path().join("a.onnx"));
    }

    #[test]
    fn empty_or_missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            model_file(dir.path()),
            Err(ExtractError::Checkpoint { .. })
        ));
        assert!(matches!(
            model_file(&dir.path().join("missing")),
            Err(ExtractError::Checkpoint { .. })
        ));
    }
}
