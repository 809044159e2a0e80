//! Deterministic encoding of instruction streams into CIL method body bytes.
//!
//! The encoder is the bridge between the index-based [`InstructionStream`] and the byte
//! layout a runtime would execute: instruction offsets are computed from encoded sizes,
//! branch operands become relative byte offsets, and exception regions become fat EH
//! clauses. String literals are interned into a per-body user string list and referenced
//! through `0x70` tokens.
//!
//! Encoding the same stream always yields the same bytes, which makes the SHA-1
//! [`Fingerprint`] of a body a cheap identity check for installed patches.
//!
//! # Layout
//!
//! ```text
//! fat header (12 bytes) | code | pad to 4 | EH section header (4 bytes) | clauses (24 bytes each)
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use sha1::{Digest, Sha1};

use crate::{
    assembly::{Immediate, Instruction, InstructionStream, Operand, OperandType, RegionKind},
    metadata::token::Token,
    Result,
};

/// Header flag: fat format
const FAT_FORMAT: u16 = 0x3;
/// Header flag: extra data sections follow the code
const MORE_SECTS: u16 = 0x8;
/// Header flag: zero-initialize locals
const INIT_LOCALS: u16 = 0x10;
/// Header size in dwords, stored in the top nibble
const FAT_HEADER_DWORDS: u16 = 3;
/// Section flag: exception table
const SECTION_EHTABLE: u8 = 0x1;
/// Section flag: fat clauses
const SECTION_FAT_FORMAT: u8 = 0x40;
/// Table id of stand-alone signatures (local variable signatures)
const STANDALONE_SIG: u8 = 0x11;
/// Size of one fat EH clause
const FAT_CLAUSE_SIZE: usize = 24;

/// An encoded method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    /// Header, code and exception section
    pub bytes: Vec<u8>,
    /// Interned user strings, token row `n` is `strings[n - 1]`
    pub strings: Vec<Arc<str>>,
    /// Byte offset of every instruction relative to the start of the code, plus the code
    /// size as the final entry
    pub offsets: Vec<u32>,
}

impl EncodedBody {
    /// SHA-1 over the body bytes and the interned strings.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha1::new();
        hasher.update(&self.bytes);
        for string in &self.strings {
            hasher.update((string.len() as u64).to_le_bytes());
            hasher.update(string.as_bytes());
        }
        let digest = hasher.finalize();

        let mut out = [0u8; 20];
        out.copy_from_slice(digest.as_slice());
        Fingerprint(out)
    }

    /// Size of the code section in bytes.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.offsets.last().copied().unwrap_or(0)
    }
}

/// SHA-1 identity of an encoded method body.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 20]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

#[derive(Default)]
struct StringHeap {
    strings: Vec<Arc<str>>,
    index: HashMap<Arc<str>, u32>,
}

impl StringHeap {
    fn intern(&mut self, value: &Arc<str>) -> Result<Token> {
        if let Some(row) = self.index.get(value) {
            return Ok(Token::from_parts(Token::USER_STRING, *row));
        }
        let row = u32::try_from(self.strings.len() + 1)
            .map_err(|_| malformed_error!("User string heap exceeds u32 range"))?;
        self.strings.push(value.clone());
        self.index.insert(value.clone(), row);
        Ok(Token::from_parts(Token::USER_STRING, row))
    }
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Computes instruction byte offsets. The final entry is the code size.
fn layout(stream: &InstructionStream) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(stream.len() + 1);
    let mut position = 0u32;
    for instruction in &stream.instructions {
        offsets.push(position);
        let size = u32::try_from(instruction.size())
            .map_err(|_| malformed_error!("Instruction size exceeds u32 range"))?;
        position = position
            .checked_add(size)
            .ok_or_else(|| malformed_error!("Code size exceeds u32 range"))?;
    }
    offsets.push(position);
    Ok(offsets)
}

fn relative(offsets: &[u32], target: usize, next: u32) -> Result<i32> {
    let target = *offsets
        .get(target)
        .ok_or_else(|| malformed_error!("Branch target {} out of range", target))?;
    let target = i64::from(target);
    i32::try_from(target - i64::from(next))
        .map_err(|_| malformed_error!("Branch displacement exceeds i32 range"))
}

fn encode_instruction(
    out: &mut Vec<u8>,
    instruction: &Instruction,
    index: usize,
    offsets: &[u32],
    heap: &mut StringHeap,
) -> Result<()> {
    if instruction.prefix != 0 {
        out.push(instruction.prefix);
    }
    out.push(instruction.opcode);

    let next = offsets[index + 1];
    match (&instruction.operand, instruction.info().operand) {
        (Operand::None, _) => {}
        (Operand::Immediate(imm), _) => match imm {
            Immediate::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Immediate::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Immediate::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Immediate::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
        },
        (Operand::Target(target), OperandType::ShortBranch) => {
            let displacement = relative(offsets, *target, next)?;
            let short = i8::try_from(displacement).map_err(|_| {
                malformed_error!(
                    "Short branch {} at {} cannot reach {} ({} bytes)",
                    instruction.mnemonic,
                    index,
                    target,
                    displacement
                )
            })?;
            out.extend_from_slice(&short.to_le_bytes());
        }
        (Operand::Target(target), _) => {
            let displacement = relative(offsets, *target, next)?;
            out.extend_from_slice(&displacement.to_le_bytes());
        }
        (Operand::Switch(targets), _) => {
            let count = u32::try_from(targets.len())
                .map_err(|_| malformed_error!("Switch table exceeds u32 range"))?;
            write_u32(out, count);
            for target in targets {
                let displacement = relative(offsets, *target, next)?;
                out.extend_from_slice(&displacement.to_le_bytes());
            }
        }
        (Operand::Local(index), _) | (Operand::Argument(index), _) => {
            let short = u8::try_from(*index)
                .map_err(|_| malformed_error!("Index {} exceeds short form", index))?;
            out.push(short);
        }
        (Operand::Method(method), _) => write_u32(out, method.token.value()),
        (Operand::Type(token), _) => write_u32(out, token.value()),
        (Operand::String(value), _) => write_u32(out, heap.intern(value)?.value()),
    }
    Ok(())
}

/// Encodes `stream` into a fat method body.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for short branches that cannot reach their target
/// and for bodies exceeding the 32-bit offset range.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{encode, StreamBuilder, InstructionEmitter};
///
/// let mut b = StreamBuilder::new();
/// b.ldstr("hello")?.pop()?.ret()?;
/// let body = encode(&b.build(0, false)?)?;
///
/// assert_eq!(body.code_size(), 7);
/// assert_eq!(body.strings.len(), 1);
/// # Ok::<(), dotpatch::Error>(())
/// ```
pub fn encode(stream: &InstructionStream) -> Result<EncodedBody> {
    let offsets = layout(stream)?;
    let code_size = offsets.last().copied().unwrap_or(0);
    let mut heap = StringHeap::default();

    let mut flags = FAT_FORMAT | (FAT_HEADER_DWORDS << 12);
    if !stream.regions.is_empty() {
        flags |= MORE_SECTS;
    }
    if stream.local_count > 0 {
        flags |= INIT_LOCALS;
    }
    let locals_token = if stream.local_count > 0 {
        Token::from_parts(STANDALONE_SIG, u32::from(stream.local_count))
    } else {
        Token::new(0)
    };

    let mut out = Vec::with_capacity(12 + code_size as usize);
    write_u16(&mut out, flags);
    write_u16(&mut out, stream.max_stack);
    write_u32(&mut out, code_size);
    write_u32(&mut out, locals_token.value());

    for (index, instruction) in stream.instructions.iter().enumerate() {
        encode_instruction(&mut out, instruction, index, &offsets, &mut heap)?;
    }

    if !stream.regions.is_empty() {
        while out.len() % 4 != 0 {
            out.push(0);
        }

        let data_size = 4 + FAT_CLAUSE_SIZE * stream.regions.len();
        if data_size > 0x00FF_FFFF {
            return Err(malformed_error!("Too many exception clauses"));
        }
        out.push(SECTION_EHTABLE | SECTION_FAT_FORMAT);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(data_size as u32).to_le_bytes()[..3]);

        let at = |index: usize| -> Result<u32> {
            offsets
                .get(index)
                .copied()
                .ok_or_else(|| malformed_error!("Region boundary {} out of range", index))
        };

        for region in &stream.regions {
            let try_offset = at(region.try_start)?;
            let handler_offset = at(region.handler_start)?;
            write_u32(&mut out, region.flags().bits());
            write_u32(&mut out, try_offset);
            write_u32(&mut out, at(region.try_end)? - try_offset);
            write_u32(&mut out, handler_offset);
            write_u32(&mut out, at(region.handler_end)? - handler_offset);
            let extra = match region.kind {
                RegionKind::Catch(token) => token.value(),
                RegionKind::Filter { filter_start } => at(filter_start)?,
                _ => 0,
            };
            write_u32(&mut out, extra);
        }
    }

    Ok(EncodedBody {
        bytes: out,
        strings: heap.strings,
        offsets,
    })
}

/// Encodes `stream` and returns its fingerprint.
///
/// # Errors
/// See [`encode`].
pub fn fingerprint(stream: &InstructionStream) -> Result<Fingerprint> {
    Ok(encode(stream)?.fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{InstructionEmitter, StreamBuilder},
        Error,
    };

    #[test]
    fn header_and_code() {
        let mut b = StreamBuilder::new();
        b.ldarg(0).unwrap().ret().unwrap();
        let body = encode(&b.build(1, true).unwrap()).unwrap();

        assert_eq!(&body.bytes[0..2], &0x3003u16.to_le_bytes());
        assert_eq!(&body.bytes[2..4], &1u16.to_le_bytes());
        assert_eq!(&body.bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&body.bytes[12..], &[0x02, 0x2A]);
        assert_eq!(body.offsets, vec![0, 1, 2]);
    }

    #[test]
    fn branch_displacements() {
        let mut b = StreamBuilder::new();
        let end = b.label();
        b.ldarg(0).unwrap();
        b.branch("brfalse.s", end).unwrap();
        b.op("nop").unwrap();
        b.mark(end).unwrap();
        b.ret().unwrap();
        let body = encode(&b.build(1, false).unwrap()).unwrap();

        // ldarg.0 | brfalse.s +1 | nop | ret
        assert_eq!(&body.bytes[12..], &[0x02, 0x2C, 0x01, 0x00, 0x2A]);
    }

    #[test]
    fn code_size_counts_short_forms() {
        let mut b = StreamBuilder::new();
        let end = b.label();
        b.ldarg(0).unwrap();
        b.branch("brtrue.s", end).unwrap();
        b.ldc_i4(0).unwrap().ret().unwrap();
        b.mark(end).unwrap();
        b.ldc_i4(1).unwrap().ret().unwrap();
        let body = encode(&b.build(1, true).unwrap()).unwrap();

        // ldarg.0 | brtrue.s +2 | ldc.i4.0 | ret | ldc.i4.1 | ret
        assert_eq!(body.code_size(), 7);
        assert_eq!(body.offsets, vec![0, 1, 3, 4, 5, 6, 7]);
        assert_eq!(&body.bytes[12..], &[0x02, 0x2D, 0x02, 0x16, 0x2A, 0x17, 0x2A]);
    }

    #[test]
    fn backward_long_branch() {
        let mut b = StreamBuilder::new();
        let top = b.here();
        b.op("nop").unwrap();
        b.branch("br", top).unwrap();
        let stream = b.build(0, false);
        // an infinite loop has no ret, but it never falls off the end either
        let body = encode(&stream.unwrap()).unwrap();
        assert_eq!(&body.bytes[13..18], &[0x38, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn short_branch_out_of_range() {
        let mut b = StreamBuilder::new();
        let end = b.label();
        b.branch("br.s", end).unwrap();
        for _ in 0..200 {
            b.op("nop").unwrap();
        }
        b.mark(end).unwrap();
        b.ret().unwrap();
        let stream = b.build(0, false).unwrap();
        assert!(matches!(encode(&stream), Err(Error::Malformed { .. })));
    }

    #[test]
    fn strings_are_interned() {
        let mut b = StreamBuilder::new();
        b.ldstr("a").unwrap().pop().unwrap();
        b.ldstr("b").unwrap().pop().unwrap();
        b.ldstr("a").unwrap().pop().unwrap();
        b.ret().unwrap();
        let body = encode(&b.build(0, false).unwrap()).unwrap();
        assert_eq!(body.strings.len(), 2);
        assert_eq!(&body.bytes[13..17], &0x7000_0001u32.to_le_bytes());
        assert_eq!(&body.bytes[19..23], &0x7000_0002u32.to_le_bytes());
        assert_eq!(&body.bytes[25..29], &0x7000_0001u32.to_le_bytes());
    }

    #[test]
    fn exception_section() {
        let mut b = StreamBuilder::new();
        let try_start = b.here();
        let exit = b.label();
        b.op("nop").unwrap();
        b.branch("leave.s", exit).unwrap();
        let handler = b.here();
        b.op("endfinally").unwrap();
        let handler_end = b.here();
        b.mark(exit).unwrap();
        b.ret().unwrap();
        b.protect(RegionKind::Finally, (try_start, handler), (handler, handler_end));
        let body = encode(&b.build(0, false).unwrap()).unwrap();

        // code: nop, leave.s, endfinally, ret = 5 bytes at 12..17, padded to 20
        let flags = u16::from_le_bytes([body.bytes[0], body.bytes[1]]);
        assert_eq!(flags & MORE_SECTS, MORE_SECTS);
        let section = &body.bytes[20..];
        assert_eq!(section[0], 0x41);
        assert_eq!(&section[1..4], &[28, 0, 0]);
        let clause = &section[4..];
        assert_eq!(&clause[0..4], &2u32.to_le_bytes());
        assert_eq!(&clause[4..8], &0u32.to_le_bytes());
        assert_eq!(&clause[8..12], &3u32.to_le_bytes());
        assert_eq!(&clause[12..16], &3u32.to_le_bytes());
        assert_eq!(&clause[16..20], &1u32.to_le_bytes());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let build = |value: &str| {
            let mut b = StreamBuilder::new();
            b.ldstr(value).unwrap().pop().unwrap().ret().unwrap();
            b.build(0, false).unwrap()
        };
        let a = fingerprint(&build("x")).unwrap();
        assert_eq!(a, fingerprint(&build("x")).unwrap());
        assert_ne!(a, fingerprint(&build("y")).unwrap());
        assert_eq!(format!("{a}").len(), 40);
    }
}
