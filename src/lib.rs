//! Rust Recurrent Networks Library
//!
//! A Caffe-style layer engine centred on [`recurrent::RecurrentLayer`], an
//! LSTM/RNN layer that either unrolls itself into an internal [`net::Net`]
//! or drives the reference native RNN library.
//!
//! # Modules
//!
//! - `blob`: Tensor with paired data/diff storage and aliasing
//! - `layers`: Layer trait and the layer types of the unrolled graph
//! - `net`: Net descriptions, split insertion and the graph executor
//! - `recurrent`: The recurrent layer and its three backends
//! - `native`: Reference native RNN library (legacy and RNN8 APIs)
//! - `device`: Device memory, native handles and shared scratch buffers
//! - `optimizers`: SGD over parameter blobs
//! - `config`: Recurrent layer configuration loaded from JSON
//! - `utils`: RNG, activations and the cancellation token

pub mod blob;
pub mod config;
pub mod device;
pub mod error;
pub mod fillers;
pub mod layers;
pub mod native;
pub mod net;
pub mod optimizers;
pub mod recurrent;
pub mod utils;

pub use error::{NetError, Result};
