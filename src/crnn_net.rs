use std::path::Path;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Axis, Ix3};
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    charset::{ctc_greedy, Charset},
    error::{ExtractError, Result},
    session::{build_session, model_file},
    util::{to_hwc_tensor, ChannelOrder},
    ExecutionProvider, RecognitionOptions, TextRecognizer,
};

/// Vocabulary file expected next to the recognizer graph.
pub const CHARSET_FILE: &str = "char_dict.txt";

/// CRNN recognizer exported to ONNX, decoding with best-path CTC.
pub struct CrnnNet {
    session: Session,
    input_name: String,
    output_name: String,
    charset: Charset,
    dest_width: u32,
    dest_height: u32,
}

impl CrnnNet {
    #[instrument(level = "debug")]
    pub fn init(
        checkpoint_dir: &Path,
        options: RecognitionOptions,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> Result<Self> {
        log::info!("Loading CRNN model from {checkpoint_dir:?}");
        let model_path = model_file(checkpoint_dir)?;
        let charset = Charset::from_file(&checkpoint_dir.join(CHARSET_FILE))?;
        let session = build_session(&model_path, num_threads, execution_providers)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ExtractError::checkpoint(&model_path, "graph has no inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| ExtractError::checkpoint(&model_path, "graph has no outputs"))?;

        Ok(Self {
            session,
            input_name,
            output_name,
            charset,
            dest_width: options.input_width,
            dest_height: options.input_height,
        })
    }
}

impl TextRecognizer for CrnnNet {
    #[instrument(level = "trace", skip(self, image))]
    fn infer(&self, image: &DynamicImage) -> Result<String> {
        // The graph has a fixed input size, so the crop is stretched to fit.
        let image = image.resize_exact(self.dest_width, self.dest_height, FilterType::Triangle);
        let input = to_hwc_tensor(&image, ChannelOrder::Bgr).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input]?)?;
        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            ExtractError::UnexpectedOutput(format!("missing output {}", self.output_name))
        })?;

        // Time-major logits: (steps, batch, classes).
        let logits = output
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix3>()?;
        log::trace!("Output tensor size: {:?}", logits.dim());
        let classes = logits.len_of(Axis(2));
        if classes != self.charset.num_classes() {
            log::warn!(
                "CRNN emits {classes} classes but the charset has {}",
                self.charset.num_classes()
            );
        }

        let indices = ctc_greedy(logits.index_axis(Axis(1), 0), self.charset.blank());
        Ok(self.charset.decode(&indices))
    }
}
