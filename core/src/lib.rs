//! mnn-bridge: safe bindings over the MNN tensor-inference C API.
//!
//! The C API is reached through a [`NativeApi`] table of entry points.
//! [`NativeApi::reference`] binds a small in-process engine that speaks the
//! same ABI, which is what the tests and the `fixture` command use; with the
//! `dynamic` feature, [`NativeApi::load`] binds a real MNN shared library.
//!
//! Every native object is owned by a wrapper that releases it on drop, and
//! borrows enforce teardown order: a [`Session`] cannot outlive the
//! [`Engine`] that created it, and a [`TensorRef`] cannot outlive its
//! session.
//!
//! # Features
//!
//! - **dynamic**: load the MNN C library at runtime through `libloading`
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mnn_bridge::{Engine, NativeApi, ScheduleConfig, Tensor};
//! use mnn_bridge::reference::ModelBuilder;
//! use mnn_bridge::buffer::HalideType;
//! use mnn_bridge::tensor::{DimensionType, TensorAccess};
//!
//! # fn main() -> mnn_bridge::Result<()> {
//! let model = ModelBuilder::new()
//!     .input("data", &[1, 4])
//!     .output("prob", &[1, 2])
//!     .op("fc", "InnerProduct", 0.1)
//!     .build();
//!
//! let api = Arc::new(NativeApi::reference());
//! let engine = Engine::from_buffer(api.clone(), &model)?;
//! let mut session = engine.create_session(&ScheduleConfig::default())?;
//!
//! let input = Tensor::host_from_f32(&api, &[1, 4], &[1.0, 2.0, 3.0, 4.0], DimensionType::Caffe)?;
//! session.bind_input(None, &input)?;
//! session.run()?;
//!
//! let output = session.read_output(None)?;
//! assert_eq!(output.shape()?, vec![1, 2]);
//! assert_eq!(output.halide_type()?, HalideType::f32());
//! assert_eq!(output.read_f32()?, vec![2.5, 2.5]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod callback;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod image;
pub mod marshal;
pub mod matrix;
pub mod module;
pub mod native;
pub mod pin;
pub mod reference;
pub mod schedule;
pub mod session;
pub mod tensor;

// Re-export commonly used types
pub use callback::OperatorInfo;
pub use engine::Engine;
pub use error::{BridgeError, ErrorCode, Result};
pub use native::NativeApi;
pub use schedule::{ForwardType, ScheduleConfig};
pub use session::{PendingRun, Session};
pub use tensor::{Tensor, TensorAccess, TensorRef};
