//! Wire protocol of the IMU sensor: the 20-byte sample frame and the
//! 5-byte register write packets.

mod command;
mod frame;

pub use command::{
  output_rate_code, rate_config_sequence, register_write, RegisterWrite, REG_OUTPUT_RATE,
  REG_SAVE, REG_UNLOCK, SAVE_VALUE, UNLOCK_VALUE,
};
pub use frame::{frame_bytes, FrameCodec, FRAME_HEADER, FRAME_LEN};
