mod backend;
mod backends;
mod result;

pub use backend::{PlateDetector, PlateRecognizer};
pub use backends::{HttpDetector, HttpRecognizer, InferenceClient, StubDetector, StubRecognizer};
pub use result::{CharDetection, DetectionBox, Recognition};
