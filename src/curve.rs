use bytemuck::{Pod, Zeroable};

use crate::constants::CURVE_FIXED_BYTES;
use crate::domain::DomainId;
use crate::protocol::{ByteReader, DecodeError};

pub type CurveId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CurveStatus {
    Active = 0,
    Terminated = 1,
    OutOfBounds = 2,
}

impl CurveStatus {
    fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(Self::Active),
            1 => Ok(Self::Terminated),
            2 => Ok(Self::OutOfBounds),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

/// One recorded integration step. Shipped as four little-endian `f64`s.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Step {
    pub position: [f64; 3],
    pub time: f64,
}

fn f64_swap_le(x: f64) -> f64 {
    f64::from_bits(x.to_bits().to_le())
}

impl Step {
    /// Byte-swap to or from wire order. A no-op on little-endian targets.
    fn swap_le(self) -> Self {
        Self {
            position: self.position.map(f64_swap_le),
            time: f64_swap_le(self.time),
        }
    }
}

const STEP_BYTES: usize = std::mem::size_of::<Step>();
const _: () = assert!(STEP_BYTES == 32, "Step must not contain padding");

/// Controls what `Curve::encode` writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SerializeFlags {
    /// Write `sequence_cnt + 1`: the encoded copy is the next fragment.
    pub increment_sequence: bool,
    /// Include the accumulated step path.
    pub include_steps: bool,
}

impl SerializeFlags {
    /// A migrating curve: endpoint state only, next sequence number.
    pub const MIGRATE: Self = Self {
        increment_sequence: true,
        include_steps: false,
    };
    /// A fragment shipped for reassembly: full path, sequence unchanged.
    pub const FRAGMENT: Self = Self {
        increment_sequence: false,
        include_steps: true,
    };
}

/// An integral curve: the unit of scheduled work.
#[derive(Clone, Debug, PartialEq)]
pub struct Curve {
    pub id: CurveId,
    pub sequence_cnt: u32,
    pub domain: DomainId,
    pub status: CurveStatus,
    pub position: [f64; 3],
    pub time: f64,
    pub step_size: f64,
    pub steps_taken: u32,
    pub max_steps: u32,
    pub path: Vec<Step>,
}

impl Curve {
    pub fn new(
        id: CurveId,
        domain: DomainId,
        position: [f64; 3],
        step_size: f64,
        max_steps: u32,
    ) -> Self {
        Self {
            id,
            sequence_cnt: 0,
            domain,
            status: CurveStatus::Active,
            position,
            time: 0.0,
            step_size,
            steps_taken: 0,
            max_steps,
            path: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &[f64; 3] {
        &self.position
    }

    pub fn is_terminated(&self) -> bool {
        self.status == CurveStatus::Terminated
    }

    pub fn encoded_len(&self, flags: SerializeFlags) -> usize {
        let steps = if flags.include_steps {
            self.path.len()
        } else {
            0
        };
        CURVE_FIXED_BYTES + steps * STEP_BYTES
    }

    pub fn encode(&self, out: &mut Vec<u8>, flags: SerializeFlags) {
        let seq = if flags.increment_sequence {
            self.sequence_cnt + 1
        } else {
            self.sequence_cnt
        };
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&seq.to_le_bytes());
        out.extend_from_slice(&self.domain.domain.to_le_bytes());
        out.extend_from_slice(&self.domain.timestep.to_le_bytes());
        out.push(self.status as u8);
        for p in self.position {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.step_size.to_le_bytes());
        out.extend_from_slice(&self.steps_taken.to_le_bytes());
        out.extend_from_slice(&self.max_steps.to_le_bytes());
        if flags.include_steps {
            out.extend_from_slice(&(self.path.len() as u32).to_le_bytes());
            let wire: Vec<Step> = self.path.iter().map(|s| s.swap_le()).collect();
            out.extend_from_slice(bytemuck::cast_slice(&wire));
        } else {
            out.extend_from_slice(&0u32.to_le_bytes());
        }
    }

    /// Decode one curve from the front of `buf`; returns the curve and bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Curve, usize), DecodeError> {
        let mut r = ByteReader::new(buf);
        let id = r.u64()?;
        let sequence_cnt = r.u32()?;
        let domain = DomainId::new(r.u32()?, r.u32()?);
        let status = CurveStatus::from_u8(r.u8()?)?;
        let position = [r.f64()?, r.f64()?, r.f64()?];
        let time = r.f64()?;
        let step_size = r.f64()?;
        let steps_taken = r.u32()?;
        let max_steps = r.u32()?;
        let path_len = r.u32()? as usize;
        let path = r
            .take(path_len * STEP_BYTES)?
            .chunks_exact(STEP_BYTES)
            .map(|b| bytemuck::pod_read_unaligned::<Step>(b).swap_le())
            .collect();
        Ok((
            Curve {
                id,
                sequence_cnt,
                domain,
                status,
                position,
                time,
                step_size,
                steps_taken,
                max_steps,
                path,
            },
            r.position(),
        ))
    }

    /// Join the fragments of one curve in sequence order. The fragment with the highest
    /// sequence number supplies the final state.
    pub fn merge_fragments(mut fragments: Vec<Curve>) -> Option<Curve> {
        fragments.sort_by_key(|c| c.sequence_cnt);
        let total: usize = fragments.iter().map(|c| c.path.len()).sum();
        let mut path = Vec::with_capacity(total);
        for f in &mut fragments {
            path.append(&mut f.path);
        }
        let mut last = fragments.pop()?;
        last.path = path;
        Some(last)
    }
}
