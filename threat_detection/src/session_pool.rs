use crate::error::{InferenceError, InferenceResult};
use ndarray::{Array, ArrayD, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Round-robin pool of ONNX Runtime sessions over one model file.
#[derive(Clone)]
pub struct SessionPool {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    output_name: String,
}

impl SessionPool {
    pub fn new(
        model_path: &Path,
        num_instances: usize,
        output_name: &str,
    ) -> InferenceResult<Self> {
        let num_instances = num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let builder = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?;
                let builder = with_execution_providers(builder)?;
                let session = builder.commit_from_file(model_path)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions for {}",
            num_instances,
            model_path.display()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            output_name: output_name.to_string(),
        })
    }

    pub fn run(&self, input: &Array<f32, Ix4>) -> InferenceResult<ArrayD<f32>> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| InferenceError::internal(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| InferenceError::internal(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

#[cfg(feature = "tensorrt")]
fn with_execution_providers(
    builder: ort::session::builder::SessionBuilder,
) -> ort::Result<ort::session::builder::SessionBuilder> {
    use ort::execution_providers::TensorRTExecutionProvider;
    builder.with_execution_providers([TensorRTExecutionProvider::default()
        .with_engine_cache(true)
        .build()])
}

#[cfg(all(feature = "cuda", not(feature = "tensorrt")))]
fn with_execution_providers(
    builder: ort::session::builder::SessionBuilder,
) -> ort::Result<ort::session::builder::SessionBuilder> {
    use ort::execution_providers::CUDAExecutionProvider;
    builder.with_execution_providers([CUDAExecutionProvider::default().build()])
}

#[cfg(not(any(feature = "cuda", feature = "tensorrt")))]
fn with_execution_providers(
    builder: ort::session::builder::SessionBuilder,
) -> ort::Result<ort::session::builder::SessionBuilder> {
    Ok(builder)
}
