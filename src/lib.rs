#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like HDMI
#![allow(clippy::upper_case_acronyms)]

//! # hwcomposer: layer composition for embedded display controllers
//!
//! This crate decides, frame by frame, how the layers of an output are combined and puts
//! the result on screen. Layers are either blitted by a 2D engine ("device composition"),
//! left to the client, or scanned out directly by an overlay plane of the display
//! controller.
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains the interaction with the hardware: buffer allocation, the 2D
//!   engine, fences, vsync and the two presentation paths, DRM/KMS atomic mode setting
//!   and legacy framebuffer devices.
//! - [`display`] contains the per output [`Display`](display::Display), its layers and
//!   the composition decision engine.
//! - [`manager`] enumerates the outputs and owns the displays, [`context`] holds the
//!   process wide services and the boot settings.
//!
//! ## Frames
//!
//! A frame passes through
//! [`verify_layers`](display::Display::verify_layers),
//! [`compose_layers`](display::Display::compose_layers) and
//! [`update_screen`](display::Display::update_screen) of its display. All state of a
//! display lives behind one lock, so these calls may come from any thread.
//!
//! ### Logging
//!
//! The crate makes extensive use of [`tracing`] for its internal logging. Every display
//! and KMS device owns a span, the per-frame paths are instrumented at `trace` level.
//!
//! For release builds it is recommended to limit the log level during compile time:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod context;
pub mod display;
pub mod manager;
pub mod utils;
