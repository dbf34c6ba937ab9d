#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod core;
mod error;
pub mod graph;
pub mod patch;
pub mod queue;
pub mod target;
mod utils;

pub use crate::cache::{ArtifactCache, CacheClient, LocalStore, RemoteStore, RetryPolicy};
pub use crate::config::{CacheOptions, MergeOptions, PatchOptions, QueueOptions, Settings};
pub use crate::core::Hash32;
pub use crate::error::*;
pub use crate::graph::{
    Assembler, Assembly, BuildEvent, Cmd, ConfigureError, Fragment, Graph, GraphNode, Identity,
    report_events,
};
pub use crate::patch::{Patcher, PatchOutcome, ProcessorRegistry, ToolchainProvider};
pub use crate::queue::{ChunkedQueue, ConsumeStats, Sweep};
pub use crate::target::semantic::{Annotation, Toolchain};
pub use crate::target::{TargetDescriptor, TargetIndex};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
