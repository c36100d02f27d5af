//! Wire-level constants shared by every rank.
//!
//! Sizing knobs that are not part of the wire format live in `config`.

/// Every frame starts with `[u64 sender_message_id][u32 sender_rank]`.
pub const FRAME_HEADER_BYTES: usize = 12;

/// Status-channel messages are a vector of little-endian i32 words: `[tag, ...payload]`.
pub const STATUS_WORD_BYTES: usize = 4;

/// Largest fixed part of a status message body, not counting per-domain words.
/// `Offload` is the widest: tag, destination rank, domain count.
pub const STATUS_FIXED_WORDS: usize = 3;

/// Curve-batch bodies start with a u32 curve count; each curve is preceded by its u32 length.
pub const CURVE_BATCH_HEADER_BYTES: usize = 4;
pub const CURVE_LEN_PREFIX_BYTES: usize = 4;

/// Fixed-size part of an encoded curve (everything except the step path).
/// id(8) seq(4) domain(4) timestep(4) status(1) position(24) time(8) step_size(8)
/// steps_taken(4) max_steps(4) path_len(4)
pub const CURVE_FIXED_BYTES: usize = 8 + 4 + 4 + 4 + 1 + 24 + 8 + 8 + 4 + 4 + 4;

/// Default limit for a single curve-batch payload.
pub const DEFAULT_MAX_CURVE_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Message tags on the status channel.
pub const TAG_STATUS: i32 = 1;
pub const TAG_DONE: i32 = 2;
pub const TAG_SEND_CURVES: i32 = 3;
pub const TAG_LOAD_DOMAIN: i32 = 4;
pub const TAG_OFFLOAD: i32 = 5;
pub const TAG_MASTER_STATUS: i32 = 6;
pub const TAG_FORCE_STATUS: i32 = 7;

const _: () = assert!(
    DEFAULT_MAX_CURVE_MESSAGE_BYTES > FRAME_HEADER_BYTES + CURVE_BATCH_HEADER_BYTES + CURVE_FIXED_BYTES,
    "default curve message limit cannot hold a single curve"
);
const _: () = assert!(CURVE_FIXED_BYTES == 73, "curve header layout changed");
