//! Clock primitives: the local monotonic clock abstraction, the rational
//! linear transform, and the common clock built on top of both.

pub mod common;
pub mod local;
pub mod transform;

pub use common::{CommonClock, COMMON_FREQ};
pub use local::{LocalClock, ManualLocalClock, SystemLocalClock};
pub use transform::LinearTransform;
