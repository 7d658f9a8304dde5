//! Presentation outputs for the demo binary
//!
//! The engine itself only hands decoded frames and mixed audio out of
//! `tick()`; rendering is the embedder's job. This module provides the one
//! output the demo needs: a speaker sink for the mixed audio.

pub mod audio;

pub use audio::AudioSink;
