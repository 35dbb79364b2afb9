use std::path::Path;

use image::DynamicImage;
use ndarray::{Axis, Ix4};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    error::{ExtractError, Result},
    postprocess::{RawMaps, GEOMETRY_CHANNELS},
    session::{build_session, model_file},
    util::{to_hwc_tensor, ChannelOrder},
    ExecutionProvider, TextDetector,
};

/// EAST text detector exported to ONNX.
pub struct EastNet {
    session: Session,
    input_name: String,
}

impl EastNet {
    #[instrument(level = "debug")]
    pub fn init(
        checkpoint_dir: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> Result<Self> {
        log::info!("Loading EAST model from {checkpoint_dir:?}");
        let model_path = model_file(checkpoint_dir)?;
        let session = build_session(&model_path, num_threads, execution_providers)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ExtractError::checkpoint(&model_path, "graph has no inputs"))?;
        if session.outputs.len() < 2 {
            return Err(ExtractError::checkpoint(
                &model_path,
                "expected score and geometry outputs",
            ));
        }

        Ok(Self {
            session,
            input_name,
        })
    }
}

impl TextDetector for EastNet {
    #[instrument(level = "debug", skip(self, image))]
    fn infer(&self, image: &DynamicImage) -> Result<RawMaps> {
        let input = to_hwc_tensor(image, ChannelOrder::Rgb).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input]?)?;

        // Both maps are NHWC; the channel count tells them apart.
        let mut score = None;
        let mut geometry = None;
        for (name, value) in outputs.iter() {
            let tensor = value
                .try_extract_tensor::<f32>()?
                .into_dimensionality::<Ix4>()?;
            let maps = tensor.index_axis(Axis(0), 0);
            match maps.len_of(Axis(2)) {
                1 => score = Some(maps.index_axis(Axis(2), 0).to_owned()),
                GEOMETRY_CHANNELS => geometry = Some(maps.to_owned()),
                channels => log::debug!("Ignoring output {name} with {channels} channels"),
            }
        }

        match (score, geometry) {
            (Some(score), Some(geometry)) => {
                log::trace!("Score map size: {:?}", score.dim());
                RawMaps::new(score, geometry)
            }
            _ => Err(ExtractError::UnexpectedOutput(
                "EAST graph did not produce a score and a geometry map".to_string(),
            )),
        }
    }
}
