#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! Keeps a renderer-owned mirror scene consistent with an externally owned,
//! continuously edited source graph.
//!
//! Two strategies share one data model and one set of mutation primitives:
//!
//! - [`pull::Reconciler`]: full traversal, digest check and diff per cycle
//! - [`push::PushSync`]: notification-driven command queue applied in batches

pub mod diagnostics;
pub mod digest;
pub mod errors;
pub mod identity;
pub mod instancing;
pub mod mirror;
pub mod motion;
pub mod pull;
pub mod push;
pub mod record;
pub mod settings;
pub mod source;
pub mod traversal;
pub mod watch;

pub use diagnostics::{Diagnostics, LogSink, StatusSink, SyncPhase};
pub use digest::{ChangeDigest, TextureHasher, compute_digest};
pub use errors::{Result, SyncError};
pub use identity::{GeometryId, MaterialId, StableHandle};
pub use instancing::{BuildCache, DescriptorBuilder, GeometryBuilder, GeometryGroup, group_by_geometry};
pub use mirror::{
    BuiltGeometry, EntityClass, EntityKey, EntityKind, MemoryMirror, MirrorEntity, MirrorHandle, MirrorScene,
    ResetKind,
};
pub use motion::{Motion, sample_motion};
pub use pull::{CycleOutcome, Reconciler, SyncOptions};
pub use push::{ChangePart, Command, CommandQueue, Notification, PushSync, TickScheduler};
pub use record::{NodeRecord, RecordMap, ShapeInfo};
pub use settings::{MotionBlurSettings, RenderGlobals, SyncSettings, SyncSnapshot};
pub use source::{MemoryGraph, NodeFlags, NodeKind, SourceGraph, SourceNode};
