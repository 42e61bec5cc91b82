pub mod http;
pub mod stub;

pub use http::{HttpDetector, HttpRecognizer, InferenceClient};
pub use stub::{StubDetector, StubRecognizer};
