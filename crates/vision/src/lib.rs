//! Frame-to-inference orchestration for the live classifier.
//!
//! Frames from a [`video_ingest::CameraProvider`] are preprocessed on the
//! capture thread, handed to a single background worker through a keep-latest
//! slot, classified by the active engine and published to one presentation
//! consumer. See [`pipeline`] for the individual stages.

pub mod pipeline;

pub use pipeline::*;
