//! Convenience re-exports for common time service consumers.

pub use crate::clock::{CommonClock, LocalClock, SystemLocalClock, COMMON_FREQ};
pub use crate::packets::{TimePacket, PacketType};
pub use crate::recovery::ClockRecoveryLoop;
pub use crate::server::{CommonTimeServer, Role, ServerConfig};
pub use crate::service::{ClockService, ConfigService, TimelineListener};
pub use crate::{Result, TimeServiceError};
