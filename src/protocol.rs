//! Wire codec for both channels.
//!
//! Status channel: `[u64 msg_id][u32 sender_rank]` followed by little-endian i32 words
//! `[tag, ...payload]`.
//! Curve channel: the same frame header followed by
//! `[u32 count]([u32 len][curve bytes])*`.

use crate::constants::{
    CURVE_BATCH_HEADER_BYTES, CURVE_LEN_PREFIX_BYTES, FRAME_HEADER_BYTES, STATUS_FIXED_WORDS,
    STATUS_WORD_BYTES, TAG_DONE, TAG_FORCE_STATUS, TAG_LOAD_DOMAIN, TAG_MASTER_STATUS,
    TAG_OFFLOAD, TAG_SEND_CURVES, TAG_STATUS,
};
use crate::curve::{Curve, SerializeFlags};
use crate::domain::{DomainId, DomainSpace};
use crate::fabric::Rank;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated frame: {needed} more bytes needed")]
    Truncated { needed: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(i32),
    #[error("unknown curve status {0}")]
    UnknownStatus(u8),
    #[error("domain index {0} outside the domain space")]
    DomainOutOfRange(i32),
    #[error("{0}")]
    Invalid(&'static str),
}

/// Control and status traffic. Curves never travel on this channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Slave to master: signed per-domain counts plus newly terminated curves.
    Status { counts: Vec<i32>, terminated: i32 },
    /// Stop after the current poll cycle.
    Done,
    /// Move up to `count` curves of `domain` to `dst`.
    SendCurves {
        dst: Rank,
        domain: DomainId,
        count: u32,
    },
    LoadDomain { domain: DomainId },
    /// Move waiting curves whose domain is in `domains` (any, if empty) to `dst`.
    Offload { dst: Rank, domains: Vec<DomainId> },
    /// Master to root: group-level status vector plus newly terminated curves.
    MasterStatus { counts: Vec<i32>, terminated: i32 },
    /// Send a status report on the next cycle even if nothing changed.
    ForceStatus,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Status { .. } => "status",
            Message::Done => "done",
            Message::SendCurves { .. } => "send_curves",
            Message::LoadDomain { .. } => "load_domain",
            Message::Offload { .. } => "offload",
            Message::MasterStatus { .. } => "master_status",
            Message::ForceStatus => "force_status",
        }
    }
}

/// Upper bound of an encoded status-channel frame for the given domain space.
pub fn max_status_frame_bytes(space: &DomainSpace) -> usize {
    FRAME_HEADER_BYTES + (STATUS_FIXED_WORDS + space.len()) * STATUS_WORD_BYTES
}

pub fn write_header(buf: &mut Vec<u8>, message_id: u64, sender: Rank) {
    buf.extend_from_slice(&message_id.to_le_bytes());
    buf.extend_from_slice(&(sender as u32).to_le_bytes());
}

/// Split a frame into `(message_id, sender_rank, body)`.
pub fn read_header(frame: &[u8]) -> Result<(u64, Rank, &[u8]), DecodeError> {
    let mut r = ByteReader::new(frame);
    let id = r.u64()?;
    let sender = r.u32()? as Rank;
    Ok((id, sender, r.rest()))
}

fn push_word(buf: &mut Vec<u8>, w: i32) {
    buf.extend_from_slice(&w.to_le_bytes());
}

fn push_domain(buf: &mut Vec<u8>, space: &DomainSpace, domain: DomainId) {
    push_word(buf, space.index(domain) as i32);
}

fn push_counts(buf: &mut Vec<u8>, counts: &[i32]) {
    buf.extend_from_slice(bytemuck::cast_slice(
        &counts.iter().map(|c| c.to_le()).collect::<Vec<i32>>(),
    ));
}

/// Append the body of `msg` (no frame header) to `buf`.
pub fn write_message(buf: &mut Vec<u8>, space: &DomainSpace, msg: &Message) {
    match msg {
        Message::Status { counts, terminated } => {
            push_word(buf, TAG_STATUS);
            push_word(buf, *terminated);
            push_counts(buf, counts);
        }
        Message::Done => push_word(buf, TAG_DONE),
        Message::SendCurves { dst, domain, count } => {
            push_word(buf, TAG_SEND_CURVES);
            push_word(buf, *dst as i32);
            push_domain(buf, space, *domain);
            push_word(buf, *count as i32);
        }
        Message::LoadDomain { domain } => {
            push_word(buf, TAG_LOAD_DOMAIN);
            push_domain(buf, space, *domain);
        }
        Message::Offload { dst, domains } => {
            push_word(buf, TAG_OFFLOAD);
            push_word(buf, *dst as i32);
            push_word(buf, domains.len() as i32);
            for d in domains {
                push_domain(buf, space, *d);
            }
        }
        Message::MasterStatus { counts, terminated } => {
            push_word(buf, TAG_MASTER_STATUS);
            push_word(buf, *terminated);
            push_counts(buf, counts);
        }
        Message::ForceStatus => push_word(buf, TAG_FORCE_STATUS),
    }
}

pub fn read_message(body: &[u8], space: &DomainSpace) -> Result<Message, DecodeError> {
    let mut r = ByteReader::new(body);
    let tag = r.i32()?;
    let msg = match tag {
        TAG_STATUS | TAG_MASTER_STATUS => {
            let terminated = r.i32()?;
            let counts = r.words(space.len())?;
            if tag == TAG_STATUS {
                Message::Status { counts, terminated }
            } else {
                Message::MasterStatus { counts, terminated }
            }
        }
        TAG_DONE => Message::Done,
        TAG_SEND_CURVES => {
            let dst = r.rank()?;
            let domain = r.domain(space)?;
            let count = r.i32()?;
            if count < 0 {
                return Err(DecodeError::Invalid("negative curve count"));
            }
            Message::SendCurves {
                dst,
                domain,
                count: count as u32,
            }
        }
        TAG_LOAD_DOMAIN => Message::LoadDomain {
            domain: r.domain(space)?,
        },
        TAG_OFFLOAD => {
            let dst = r.rank()?;
            let n = r.i32()?;
            if n < 0 || n as usize > space.len() {
                return Err(DecodeError::Invalid("offload domain list length"));
            }
            let domains = (0..n)
                .map(|_| r.domain(space))
                .collect::<Result<Vec<_>, _>>()?;
            Message::Offload { dst, domains }
        }
        TAG_FORCE_STATUS => Message::ForceStatus,
        other => return Err(DecodeError::UnknownTag(other)),
    };
    if !r.rest().is_empty() {
        return Err(DecodeError::Invalid("trailing bytes after message"));
    }
    Ok(msg)
}

/// Encode as many curves from the front of `curves` as fit in `limit` bytes (frame header
/// included) and return how many were consumed. The caller has already written the header.
pub fn write_curve_batch(
    buf: &mut Vec<u8>,
    curves: &[Curve],
    flags: SerializeFlags,
    limit: usize,
) -> usize {
    let count_at = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    let mut n = 0u32;
    for curve in curves {
        let need = CURVE_LEN_PREFIX_BYTES + curve.encoded_len(flags);
        if n > 0 && buf.len() + need > limit {
            break;
        }
        buf.extend_from_slice(&(curve.encoded_len(flags) as u32).to_le_bytes());
        curve.encode(buf, flags);
        n += 1;
    }
    buf[count_at..count_at + CURVE_BATCH_HEADER_BYTES].copy_from_slice(&n.to_le_bytes());
    n as usize
}

pub fn read_curve_batch(body: &[u8]) -> Result<Vec<Curve>, DecodeError> {
    let mut r = ByteReader::new(body);
    let n = r.u32()? as usize;
    let mut curves = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        let len = r.u32()? as usize;
        let bytes = r.take(len)?;
        let (curve, used) = Curve::decode(bytes)?;
        if used != len {
            return Err(DecodeError::Invalid("curve length prefix mismatch"));
        }
        curves.push(curve);
    }
    Ok(curves)
}

/// Little-endian cursor over a received buffer.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(DecodeError::Truncated {
                needed: n - remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        self.array().map(i32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        self.array().map(u64::from_le_bytes)
    }

    pub(crate) fn f64(&mut self) -> Result<f64, DecodeError> {
        self.array().map(f64::from_le_bytes)
    }

    fn words(&mut self, n: usize) -> Result<Vec<i32>, DecodeError> {
        let bytes = self.take(n * STATUS_WORD_BYTES)?;
        Ok(bytes
            .chunks_exact(STATUS_WORD_BYTES)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn rank(&mut self) -> Result<Rank, DecodeError> {
        let r = self.i32()?;
        if r < 0 {
            return Err(DecodeError::Invalid("negative rank"));
        }
        Ok(r as Rank)
    }

    fn domain(&mut self, space: &DomainSpace) -> Result<DomainId, DecodeError> {
        let idx = self.i32()?;
        if idx < 0 || idx as usize >= space.len() {
            return Err(DecodeError::DomainOutOfRange(idx));
        }
        Ok(space.id(idx as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveStatus;

    const SPACE: DomainSpace = DomainSpace::new(4, 2);

    fn round_trip(msg: Message) -> Message {
        let mut buf = Vec::new();
        write_message(&mut buf, &SPACE, &msg);
        read_message(&buf, &SPACE).expect("decode failed")
    }

    #[test]
    fn control_messages_decode_to_the_same_variant() {
        let msgs = vec![
            Message::Done,
            Message::ForceStatus,
            Message::LoadDomain {
                domain: DomainId::new(3, 1),
            },
            Message::SendCurves {
                dst: 7,
                domain: DomainId::new(1, 0),
                count: 25,
            },
            Message::Offload {
                dst: 2,
                domains: vec![DomainId::new(0, 0), DomainId::new(2, 1)],
            },
        ];
        for msg in msgs {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn status_message_carries_every_domain_word() {
        let counts: Vec<i32> = (0..SPACE.len() as i32).map(|i| i - 3).collect();
        let msg = Message::Status {
            counts: counts.clone(),
            terminated: 4,
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &SPACE, &msg);
        assert!(FRAME_HEADER_BYTES + buf.len() <= max_status_frame_bytes(&SPACE));
        assert_eq!(read_message(&buf, &SPACE).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = 99i32.to_le_bytes();
        assert_eq!(read_message(&buf, &SPACE), Err(DecodeError::UnknownTag(99)));
    }

    #[test]
    fn truncated_status_reports_missing_bytes() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &SPACE,
            &Message::Status {
                counts: vec![1; SPACE.len()],
                terminated: 0,
            },
        );
        buf.truncate(buf.len() - 3);
        assert_eq!(
            read_message(&buf, &SPACE),
            Err(DecodeError::Truncated { needed: 3 })
        );
    }

    #[test]
    fn out_of_range_domain_is_rejected() {
        let mut buf = Vec::new();
        push_word(&mut buf, TAG_LOAD_DOMAIN);
        push_word(&mut buf, SPACE.len() as i32);
        assert!(matches!(
            read_message(&buf, &SPACE),
            Err(DecodeError::DomainOutOfRange(_))
        ));
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        write_header(&mut buf, 41, 9);
        buf.extend_from_slice(b"xy");
        let (id, sender, body) = read_header(&buf).unwrap();
        assert_eq!((id, sender, body), (41, 9, &b"xy"[..]));
    }

    #[test]
    fn curve_batch_respects_limit_but_always_takes_one() {
        let curves: Vec<Curve> = (0..10)
            .map(|i| Curve::new(i, DomainId::new(1, 0), [1.5, 0.0, 0.0], 0.1, 100))
            .collect();
        let one = crate::constants::CURVE_LEN_PREFIX_BYTES
            + curves[0].encoded_len(SerializeFlags::MIGRATE);

        let mut buf = Vec::new();
        let taken = write_curve_batch(&mut buf, &curves, SerializeFlags::MIGRATE, 4 + 3 * one);
        assert_eq!(taken, 3);
        let decoded = read_curve_batch(&buf).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|c| c.status == CurveStatus::Active));

        let mut tiny = Vec::new();
        assert_eq!(
            write_curve_batch(&mut tiny, &curves, SerializeFlags::MIGRATE, 1),
            1
        );
    }
}
