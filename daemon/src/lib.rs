//! Ad detection fusion and blocking daemon for a live video pipeline.
//!
//! Two classifier tracks feed a [`detector::Detector`], which owns the
//! [`fusion::FusionEngine`] and the [`blocking::BlockingController`].
//! Each external process is kept alive by a [`watchdog::ResourceWatchdog`].

pub mod backoff;
pub mod blocking;
pub mod classifier;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod fusion;
pub mod logging;
pub mod observation;
pub mod resource;
pub mod sampler;
pub mod screenshots;
pub mod sink;
pub mod source;
pub mod stillness;
pub mod tasks;
pub mod transition;
pub mod watchdog;
