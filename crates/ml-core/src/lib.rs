//! Detector contract shared by the surveillance service and its model
//! backends. Enable the `with-tch` feature to pull in the TorchScript YOLO
//! detector built on `tch`.

pub mod detector;
pub mod labels;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{Detection, DetectorError, DetectorOutput, NoopDetector, ObjectDetector};

#[cfg(feature = "with-tch")]
pub use tch;
