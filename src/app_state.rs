use std::sync::Arc;

use crate::motion::MotionData;
use crate::worker::Recorder;

/// Handles the HTTP layer reads from; cheap to clone into every request.
#[derive(Clone)]
pub struct AppState {
    pub motion_data: Arc<MotionData>,
    pub recorder: Arc<dyn Recorder>,
}

impl AppState {
    pub fn new(motion_data: Arc<MotionData>, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            motion_data,
            recorder,
        }
    }
}
