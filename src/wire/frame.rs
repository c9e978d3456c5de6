use byteorder::{ByteOrder, LittleEndian};

use crate::sample::Sample;

/// Two-byte literal that starts every streaming sample frame.
pub const FRAME_HEADER: [u8; 2] = [0x55, 0x61];

/// Full frame length: header plus nine little-endian i16 channels.
pub const FRAME_LEN: usize = 20;

const ACCEL_FULL_SCALE_G: f64 = 16.0;
const GYRO_FULL_SCALE_DPS: f64 = 2000.0;
const ANGLE_FULL_SCALE_DEG: f64 = 180.0;

/// Streaming decoder for the sensor's framed byte stream.
///
/// The codec holds a partial-frame assembly buffer and resynchronizes at
/// byte granularity: a header mismatch discards exactly one byte, so a
/// corrupted or truncated frame can never desynchronize more than its
/// own bytes. The codec itself cannot fail; payloads are trusted and
/// emitted as-is, and downstream components judge plausibility.
#[derive(Debug)]
pub struct FrameCodec {
  assembly: Vec<u8>,
}

impl FrameCodec {
  pub fn new() -> Self {
    FrameCodec {
      assembly: Vec::with_capacity(FRAME_LEN),
    }
  }

  /// Feed one byte; returns a decoded [`Sample`] when it completes a
  /// frame.
  pub fn feed(&mut self, byte: u8) -> Option<Sample> {
    self.assembly.push(byte);

    if self.assembly.len() == 2
      && (self.assembly[0] != FRAME_HEADER[0] || self.assembly[1] != FRAME_HEADER[1])
    {
      // Byte-level resync: drop the oldest byte and keep scanning.
      self.assembly.remove(0);
      return None;
    }

    if self.assembly.len() == FRAME_LEN {
      let sample = decode_payload(&self.assembly[2..]);
      self.assembly.clear();
      return Some(sample);
    }

    None
  }

  /// Bytes currently buffered towards the next frame.
  pub fn pending(&self) -> usize {
    self.assembly.len()
  }

  pub fn reset(&mut self) {
    self.assembly.clear();
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    FrameCodec::new()
  }
}

fn decode_payload(payload: &[u8]) -> Sample {
  debug_assert_eq!(payload.len(), FRAME_LEN - 2);

  let ch = |i: usize| LittleEndian::read_i16(&payload[2 * i..2 * i + 2]) as f64 / 32768.0;

  Sample {
    acc_x: round3(ch(0) * ACCEL_FULL_SCALE_G),
    acc_y: round3(ch(1) * ACCEL_FULL_SCALE_G),
    acc_z: round3(ch(2) * ACCEL_FULL_SCALE_G),
    gyro_x: round3(ch(3) * GYRO_FULL_SCALE_DPS),
    gyro_y: round3(ch(4) * GYRO_FULL_SCALE_DPS),
    gyro_z: round3(ch(5) * GYRO_FULL_SCALE_DPS),
    angle_x: round3(ch(6) * ANGLE_FULL_SCALE_DEG),
    angle_y: round3(ch(7) * ANGLE_FULL_SCALE_DEG),
    angle_z: round3(ch(8) * ANGLE_FULL_SCALE_DEG),
  }
}

fn round3(v: f64) -> f64 {
  (v * 1000.0).round() / 1000.0
}

/// Encode a [`Sample`] back into a wire frame. Used by the radio
/// simulator and by round-trip tests; real sensors only ever produce
/// frames.
pub fn frame_bytes(sample: &Sample) -> [u8; FRAME_LEN] {
  let mut frame = [0u8; FRAME_LEN];
  frame[0] = FRAME_HEADER[0];
  frame[1] = FRAME_HEADER[1];

  let raw = |v: f64, full_scale: f64| -> i16 {
    let scaled = (v / full_scale * 32768.0).round();
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
  };

  let channels = [
    raw(sample.acc_x, ACCEL_FULL_SCALE_G),
    raw(sample.acc_y, ACCEL_FULL_SCALE_G),
    raw(sample.acc_z, ACCEL_FULL_SCALE_G),
    raw(sample.gyro_x, GYRO_FULL_SCALE_DPS),
    raw(sample.gyro_y, GYRO_FULL_SCALE_DPS),
    raw(sample.gyro_z, GYRO_FULL_SCALE_DPS),
    raw(sample.angle_x, ANGLE_FULL_SCALE_DEG),
    raw(sample.angle_y, ANGLE_FULL_SCALE_DEG),
    raw(sample.angle_z, ANGLE_FULL_SCALE_DEG),
  ];
  for (i, ch) in channels.iter().enumerate() {
    LittleEndian::write_i16(&mut frame[2 + 2 * i..4 + 2 * i], *ch);
  }
  frame
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  fn feed_all(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<Sample> {
    bytes.iter().filter_map(|b| codec.feed(*b)).collect()
  }

  #[test]
  fn byte_aligned_frame_decodes_acc_z() {
    // AccZ raw = 16384 = 0x4000 -> 16384/32768*16 = 8.0 g, rest zero.
    let frame: [u8; FRAME_LEN] = [
      0x55, 0x61, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
      0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let mut codec = FrameCodec::new();
    let samples = feed_all(&mut codec, &frame);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].acc_z, 8.0);
    assert_eq!(samples[0].acc_x, 0.0);
    assert_eq!(samples[0].gyro_x, 0.0);
    assert_eq!(codec.pending(), 0);
  }

  #[test]
  fn resync_discards_leading_garbage() {
    let mut bytes = vec![0xAA, 0xBB];
    bytes.extend_from_slice(&frame_bytes(&Sample::with_acc_z(1.5)));
    let mut codec = FrameCodec::new();
    let samples = feed_all(&mut codec, &bytes);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].acc_z, 1.5);
  }

  #[test]
  fn resync_survives_header_byte_inside_garbage() {
    // A stray 0x55 not followed by 0x61 must also be skipped.
    let mut bytes = vec![0x55, 0x00, 0x55];
    bytes.extend_from_slice(&frame_bytes(&Sample::with_acc_z(-2.0)));
    let mut codec = FrameCodec::new();
    let samples = feed_all(&mut codec, &bytes);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].acc_z, -2.0);
  }

  #[test]
  fn partial_frame_is_retained_across_feeds() {
    let frame = frame_bytes(&Sample::with_acc_z(3.25));
    let mut codec = FrameCodec::new();
    assert!(feed_all(&mut codec, &frame[..7]).is_empty());
    assert_eq!(codec.pending(), 7);
    let samples = feed_all(&mut codec, &frame[7..]);
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].acc_z, 3.25);
  }

  #[test]
  fn consecutive_frames_decode_independently() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&frame_bytes(&Sample::with_acc_z(0.5)));
    bytes.extend_from_slice(&frame_bytes(&Sample::with_acc_z(1.0)));
    let mut codec = FrameCodec::new();
    let samples = feed_all(&mut codec, &bytes);
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].acc_z, 0.5);
    assert_eq!(samples[1].acc_z, 1.0);
  }

  #[test_case(Sample { acc_x: 1.234, acc_y: -0.5, acc_z: 8.0,
                       gyro_x: 125.0, gyro_y: -250.0, gyro_z: 0.0,
                       angle_x: 45.0, angle_y: -90.0, angle_z: 179.995 }; "mixed channels")]
  #[test_case(Sample::with_acc_z(15.999); "near full scale")]
  #[test_case(Sample::with_acc_z(-16.0); "negative full scale")]
  #[test_case(Sample::ZERO; "all zero")]
  fn round_trip_within_rounding(sample: Sample) {
    let mut codec = FrameCodec::new();
    let decoded = feed_all(&mut codec, &frame_bytes(&sample));
    assert_eq!(decoded.len(), 1);
    let got = decoded[0];
    // One raw LSB is < 0.001 g / 0.07 deg/s / 0.006 deg; rounding to
    // three decimals bounds the error per channel accordingly.
    assert!((got.acc_x - sample.acc_x).abs() <= 0.001);
    assert!((got.acc_y - sample.acc_y).abs() <= 0.001);
    assert!((got.acc_z - sample.acc_z).abs() <= 0.001);
    assert!((got.gyro_x - sample.gyro_x).abs() <= 0.062);
    assert!((got.gyro_y - sample.gyro_y).abs() <= 0.062);
    assert!((got.gyro_z - sample.gyro_z).abs() <= 0.062);
    assert!((got.angle_x - sample.angle_x).abs() <= 0.006);
    assert!((got.angle_y - sample.angle_y).abs() <= 0.006);
    assert!((got.angle_z - sample.angle_z).abs() <= 0.006);
  }
}
