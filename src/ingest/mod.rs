//! Frame ingestion: wire decoding and event classification.

pub mod classify;
pub mod frame;

pub use classify::{ClassifiedEvent, Classifier, ClassifyError};
pub use frame::{parse_frame, EventPacket, FrameError};
