//! The `loom` module provides the foundational abstractions the layers compute on.
//! It offers a uniform blob and op interface across CPU and GPU devices, with deterministic release of device memory.
//!
//! ## Key Components
//! 1. **Blobs**:
//!    - Device-resident buffers of a fixed [`Shape`](shape::Shape), whose last axis is the batch axis.
//!    - Host copy-in/copy-out, device-side copy, and release on drop.
//!
//! 2. **Device Abstraction**:
//!    - Hardware-agnostic storage and execution via the `Device` trait.
//!    - Per-device op tables mapping each concrete op type to its kernel.
//!
//! 3. **Numerical System**:
//!    - Scalar types (`f32`, `f64`) and their data type metadata (`DataType`).
//!
//! 4. **Execution Model**:
//!    - Ops (`BlobOp`) describe the blobs they read and write.
//!    - Devices check the write uniqueness rule before running a kernel.

pub mod blob;
pub mod device;
pub mod num;
pub mod ops;
pub mod shape;
