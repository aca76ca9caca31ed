pub mod nzmask;

pub use nzmask::{local_mask, NonzeroMask, NzMaskReport};
