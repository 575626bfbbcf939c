//! NameString and Target decoding.
//!
//! A NameString is the AML encoding of a namespace path: an optional root
//! (`\`) or parent-prefix (`^`) sequence followed by zero or more 4-byte
//! NameSegs, with dual- and multi-segment prefixes for paths of more than
//! one segment. A Target is the lvalue encoding that follows expression
//! opcodes.

use crate::{
    misc::{self, ArgNum, LocalNum},
    namespace::{AmlName, MAX_NAME},
    opcode, AmlError,
};
use alloc::string::String;

/// Decode the NameString at the start of `stream`, returning the (possibly
/// relative) name and the number of bytes consumed. A NullName decodes to an
/// empty name, which the caller must treat specially.
pub fn parse_name_string(stream: &[u8]) -> Result<(AmlName, usize), AmlError> {
    let mut name = String::new();
    let mut offset = 0;

    match *stream.first().ok_or(AmlError::UnexpectedEndOfStream)? {
        opcode::ROOT_CHAR => {
            name.push('\\');
            offset += 1;
        }
        opcode::PREFIX_CHAR => {
            while stream.get(offset) == Some(&opcode::PREFIX_CHAR) {
                name.push('^');
                offset += 1;
            }
        }
        _ => (),
    }

    let consumed = parse_name_path(&stream[offset..], &mut name)?;
    offset += consumed;

    if name.len() > MAX_NAME {
        return Err(AmlError::NameTooLong);
    }
    if name.is_empty() || name == "\\" {
        // NullName, or a bare root reference.
        return Ok((AmlName::root(), offset));
    }
    Ok((AmlName::from_str(&name)?, offset))
}

fn parse_name_path(stream: &[u8], name: &mut String) -> Result<usize, AmlError> {
    match *stream.first().ok_or(AmlError::UnexpectedEndOfStream)? {
        opcode::NULL_NAME => Ok(1),
        opcode::DUAL_NAME_PREFIX => {
            parse_name_seg(stream.get(1..5).ok_or(AmlError::UnexpectedEndOfStream)?, name)?;
            name.push('.');
            parse_name_seg(stream.get(5..9).ok_or(AmlError::UnexpectedEndOfStream)?, name)?;
            Ok(9)
        }
        opcode::MULTI_NAME_PREFIX => {
            let seg_count = *stream.get(1).ok_or(AmlError::UnexpectedEndOfStream)? as usize;
            if seg_count == 0 {
                return Err(AmlError::InvalidNameSeg);
            }
            let mut offset = 2;
            for i in 0..seg_count {
                if i > 0 {
                    name.push('.');
                }
                parse_name_seg(stream.get(offset..offset + 4).ok_or(AmlError::UnexpectedEndOfStream)?, name)?;
                offset += 4;
            }
            Ok(offset)
        }
        _ => {
            parse_name_seg(stream.get(0..4).ok_or(AmlError::UnexpectedEndOfStream)?, name)?;
            Ok(4)
        }
    }
}

pub(crate) fn parse_name_seg(bytes: &[u8], name: &mut String) -> Result<(), AmlError> {
    if !opcode::is_lead_name_char(bytes[0]) || !bytes[1..].iter().all(|&b| opcode::is_name_char(b)) {
        return Err(AmlError::InvalidNameSeg);
    }
    for &byte in bytes {
        name.push(byte as char);
    }
    Ok(())
}

/// An lvalue destination: where the result of an expression is written.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Target {
    /// NullName: the result is discarded.
    Null,
    Name(AmlName),
    Debug,
    Arg(ArgNum),
    Local(LocalNum),
}

/// Decode the Target encoding at the start of `stream`, returning it and the
/// number of bytes consumed.
pub fn parse_target(stream: &[u8]) -> Result<(Target, usize), AmlError> {
    let byte = *stream.first().ok_or(AmlError::UnexpectedEndOfStream)?;
    match byte {
        opcode::NULL_NAME => Ok((Target::Null, 1)),
        opcode::LOCAL0_OP..=opcode::LOCAL7_OP => Ok((Target::Local(misc::local_num(byte)?), 1)),
        opcode::ARG0_OP..=opcode::ARG6_OP => Ok((Target::Arg(misc::arg_num(byte)?), 1)),
        opcode::EXT_OPCODE_PREFIX => match stream.get(1) {
            Some(&opcode::EXT_DEBUG_OP) => Ok((Target::Debug, 2)),
            Some(&other) => Err(AmlError::UnexpectedByte(other)),
            None => Err(AmlError::UnexpectedEndOfStream),
        },
        // Index-style targets need reference plumbing the engine doesn't have.
        opcode::INDEX_OP => Err(AmlError::Unimplemented),
        _ if opcode::is_name_string_start(byte) => {
            let (name, consumed) = parse_name_string(stream)?;
            Ok((Target::Name(name), consumed))
        }
        byte => Err(AmlError::UnexpectedByte(byte)),
    }
}
