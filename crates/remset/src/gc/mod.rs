//! Parallel collector infrastructure: the work gang, claim structures, lock
//! ordering and mark bitmaps.

pub mod claim;
pub mod mark;
pub mod sync;
pub mod work_gang;

pub use claim::{RegionClaimer, SequentialSubTasksDone, SubTasksDone};
pub use work_gang::{GangTask, WorkGang};
