use crate::prediction::PredictionRecord;
use opencv::core::Mat;
use parking_lot::Mutex;

/// Latest downscaled frame and the predictions from the most recent
/// response. Predictions are replaced wholesale per response; there is no
/// cross-response identity beyond track identifier reuse by the service.
#[derive(Default)]
pub struct VideoState {
    latest_frame: Mutex<Option<Mat>>,
    predictions: Mutex<Vec<PredictionRecord>>,
}

impl VideoState {
    pub fn set_frame(&self, frame: Mat) {
        *self.latest_frame.lock() = Some(frame);
    }

    pub fn clear_frame(&self) {
        *self.latest_frame.lock() = None;
    }

    pub fn latest_frame(&self) -> Option<Mat> {
        self.latest_frame.lock().clone()
    }

    pub fn set_predictions(&self, predictions: Vec<PredictionRecord>) {
        *self.predictions.lock() = predictions;
    }

    pub fn predictions(&self) -> Vec<PredictionRecord> {
        self.predictions.lock().clone()
    }
}
