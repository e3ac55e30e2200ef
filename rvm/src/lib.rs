// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Run Virtual Machine reference implementation.
//!
//! A client-side runtime for a Bitcoin-anchored jig protocol: creations
//! are deployed, called and upgraded through compact metadata payloads in
//! transactions, and materialized back to life either from cached
//! content-addressed state or by deterministic replay of the on-chain
//! action log.
//!
//! ## Logging
//!
//! This package emits logs using the log façade. Configure the logging
//! backend of your choice during the initialization of the consuming
//! application.

pub use heap::CreationId;
pub use kernel::{Event, EventKind, Kernel, KernelConfig};
pub use value::Value;

pub mod externs;
pub mod kernel;
pub mod lang;
pub mod membrane;
pub mod realm;
pub mod sandbox;

pub mod capture;
pub mod codec;
pub mod creation;
pub mod heap;
pub mod interp;
pub mod load;
pub mod record;
pub mod recreate;
pub mod replay;
pub mod timeout;
pub mod tx;
pub mod unify;
pub mod value;
