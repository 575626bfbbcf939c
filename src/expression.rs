//! The recursive expression evaluator. The execution engine assembles
//! arithmetic expressions as stack frames, but delegates here whenever it
//! needs a whole operand evaluated in one step: loop and If predicates,
//! `Return` expressions, method-invocation arguments, and any opcode the
//! dispatch table doesn't handle itself. This evaluator understands the
//! declarative data objects (strings, buffers, packages) as well as the
//! computational subset.

use crate::{
    exec, misc,
    name_object::{self, Target},
    opcode, pkg_length,
    state::CallState,
    term_object,
    value::AmlValue,
    AmlContext, AmlError,
};
use alloc::{string::String, vec, vec::Vec};

/// Read a literal integer at the start of `stream`: one of the const ops or
/// a `BytePrefix`/`WordPrefix`/`DWordPrefix`/`QWordPrefix` followed by the
/// little-endian payload. Returns the value and bytes consumed.
pub fn eval_integer(stream: &[u8]) -> Result<(u64, usize), AmlError> {
    let first = *stream.first().ok_or(AmlError::UnexpectedEndOfStream)?;
    match first {
        opcode::ZERO_OP => Ok((0, 1)),
        opcode::ONE_OP => Ok((1, 1)),
        opcode::ONES_OP => Ok((u64::MAX, 1)),
        opcode::BYTE_CONST => Ok((read_le(stream, 1)?, 2)),
        opcode::WORD_CONST => Ok((read_le(stream, 2)?, 3)),
        opcode::DWORD_CONST => Ok((read_le(stream, 4)?, 5)),
        opcode::QWORD_CONST => Ok((read_le(stream, 8)?, 9)),
        byte => Err(AmlError::UnexpectedByte(byte)),
    }
}

fn read_le(stream: &[u8], bytes: usize) -> Result<u64, AmlError> {
    let payload = stream.get(1..1 + bytes).ok_or(AmlError::UnexpectedEndOfStream)?;
    let mut value = 0u64;
    for (i, byte) in payload.iter().enumerate() {
        value |= (*byte as u64) << (i * 8);
    }
    Ok(value)
}

/// Evaluate one TermArg at the start of `stream` against the given
/// activation, returning the value and bytes consumed.
pub fn eval_operand(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<(AmlValue, usize), AmlError> {
    let first = *stream.first().ok_or(AmlError::UnexpectedEndOfStream)?;

    if opcode::is_name_string_start(first) {
        return exec::eval_name_reference(context, state, stream);
    }

    match first {
        opcode::ZERO_OP
        | opcode::ONE_OP
        | opcode::ONES_OP
        | opcode::BYTE_CONST
        | opcode::WORD_CONST
        | opcode::DWORD_CONST
        | opcode::QWORD_CONST => {
            let (value, consumed) = eval_integer(stream)?;
            Ok((AmlValue::Integer(value), consumed))
        }

        opcode::STRING_PREFIX => {
            let (string, consumed) = parse_string(&stream[1..])?;
            Ok((AmlValue::String(string), 1 + consumed))
        }

        opcode::BUFFER_OP => {
            let (buffer, consumed) = parse_buffer(context, state, &stream[1..])?;
            Ok((AmlValue::Buffer(buffer), 1 + consumed))
        }

        opcode::PACKAGE_OP => {
            let (package, consumed) = term_object::parse_package(context, state, &stream[1..])?;
            Ok((AmlValue::Package(package), 1 + consumed))
        }

        opcode::LOCAL0_OP..=opcode::LOCAL7_OP => {
            let value = state.local(misc::local_num(first)?)?.clone();
            Ok((value, 1))
        }

        opcode::ARG0_OP..=opcode::ARG6_OP => {
            let value = state.arg(misc::arg_num(first)?)?.clone();
            Ok((value, 1))
        }

        opcode::EXT_OPCODE_PREFIX => match stream.get(1) {
            Some(&opcode::EXT_REVISION_OP) => Ok((AmlValue::Integer(crate::AML_INTERPRETER_REVISION), 2)),
            Some(&other) => Err(AmlError::UnexpectedByte(other)),
            None => Err(AmlError::UnexpectedEndOfStream),
        },

        opcode::ADD_OP
        | opcode::SUBTRACT_OP
        | opcode::MULTIPLY_OP
        | opcode::AND_OP
        | opcode::OR_OP
        | opcode::XOR_OP
        | opcode::SHIFT_LEFT_OP
        | opcode::SHIFT_RIGHT_OP => {
            let mut offset = 1;
            let (left, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let (right, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let result = exec::reduce(first as u16, &mut [left, right])?;
            offset += store_through_target(context, state, &stream[offset..], &result)?;
            Ok((result, offset))
        }

        opcode::NOT_OP => {
            let (operand, consumed) = eval_operand(context, state, &stream[1..])?;
            let mut offset = 1 + consumed;
            let result = exec::reduce(first as u16, &mut [operand])?;
            offset += store_through_target(context, state, &stream[offset..], &result)?;
            Ok((result, offset))
        }

        opcode::STORE_OP => {
            let (value, consumed) = eval_operand(context, state, &stream[1..])?;
            let mut offset = 1 + consumed;
            let (target, consumed) = name_object::parse_target(&stream[offset..])?;
            offset += consumed;
            let stored = context.store(state, &target, value)?;
            Ok((stored, offset))
        }

        opcode::LAND_OP | opcode::LOR_OP => {
            let mut offset = 1;
            let (left, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let (right, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let left = left.as_bool()?;
            let right = right.as_bool()?;
            let result = if first == opcode::LAND_OP { left && right } else { left || right };
            Ok((logical(result), offset))
        }

        opcode::LNOT_OP => {
            let (operand, consumed) = eval_operand(context, state, &stream[1..])?;
            Ok((logical(!operand.as_bool()?), 1 + consumed))
        }

        opcode::LEQUAL_OP | opcode::LGREATER_OP | opcode::LLESS_OP => {
            let mut offset = 1;
            let (left, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let (right, consumed) = eval_operand(context, state, &stream[offset..])?;
            offset += consumed;
            let left = left.as_integer()?;
            let right = right.as_integer()?;
            let result = match first {
                opcode::LEQUAL_OP => left == right,
                opcode::LGREATER_OP => left > right,
                _ => left < right,
            };
            Ok((logical(result), offset))
        }

        opcode::SIZE_OF_OP => {
            let (value, consumed) = eval_operand(context, state, &stream[1..])?;
            let size = match value {
                AmlValue::String(ref string) => string.len() as u64,
                AmlValue::Buffer(ref bytes) => bytes.len() as u64,
                AmlValue::Package(ref elements) => elements.len() as u64,
                ref other => return Err(AmlError::InvalidSizeOfApplication(other.type_of())),
            };
            Ok((AmlValue::Integer(size), 1 + consumed))
        }

        byte => Err(AmlError::UnexpectedByte(byte)),
    }
}

/// Parse the Target following an expression and store `result` through it
/// unless it's a NullName. Returns the bytes the Target consumed.
fn store_through_target(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
    result: &AmlValue,
) -> Result<usize, AmlError> {
    let (target, consumed) = name_object::parse_target(stream)?;
    if target != Target::Null {
        context.store(state, &target, result.clone())?;
    }
    Ok(consumed)
}

fn logical(value: bool) -> AmlValue {
    if value {
        AmlValue::ones()
    } else {
        AmlValue::zero()
    }
}

/// Parse a string literal body: ASCII bytes up to and including a NUL.
fn parse_string(stream: &[u8]) -> Result<(String, usize), AmlError> {
    let nul = stream.iter().position(|&b| b == 0x00).ok_or(AmlError::UnterminatedStringConstant)?;
    let bytes = &stream[..nul];
    if !bytes.iter().all(|b| b.is_ascii()) {
        return Err(AmlError::InvalidStringConstant);
    }
    let string = bytes.iter().map(|&b| b as char).collect();
    Ok((string, nul + 1))
}

/// Parse a `DefBuffer` body (after the BufferOp byte): PkgLength, a size
/// TermArg, then initializer bytes, zero-padded up to the declared size.
fn parse_buffer(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<(Vec<u8>, usize), AmlError> {
    let pkg = pkg_length::parse_pkg_length(stream)?;
    let body_end = pkg.end_offset(0);
    if body_end > stream.len() {
        return Err(AmlError::UnexpectedEndOfStream);
    }

    let mut offset = pkg.consumed;
    let (size, consumed) = eval_operand(context, state, &stream[offset..body_end])?;
    offset += consumed;

    let size = size.as_integer()? as usize;
    let init = &stream[offset..body_end];
    if init.len() > size {
        return Err(AmlError::MalformedBuffer);
    }

    let mut buffer = vec![0u8; size];
    buffer[..init.len()].copy_from_slice(init);
    Ok((buffer, body_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_context;
    use crate::namespace::AmlName;

    fn fresh_state() -> CallState {
        CallState::new(AmlName::from_str("\\MTH_").unwrap())
    }

    #[test]
    fn test_literal_round_trips() {
        assert_eq!(eval_integer(&[opcode::ZERO_OP]).unwrap(), (0, 1));
        assert_eq!(eval_integer(&[opcode::ONE_OP]).unwrap(), (1, 1));
        assert_eq!(eval_integer(&[opcode::ONES_OP]).unwrap(), (u64::MAX, 1));
        assert_eq!(eval_integer(&[opcode::BYTE_CONST, 0x2a]).unwrap(), (0x2a, 2));
        assert_eq!(eval_integer(&[opcode::WORD_CONST, 0x34, 0x12]).unwrap(), (0x1234, 3));
        assert_eq!(eval_integer(&[opcode::DWORD_CONST, 0x78, 0x56, 0x34, 0x12]).unwrap(), (0x12345678, 5));
        assert_eq!(
            eval_integer(&[opcode::QWORD_CONST, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
            (0x0807060504030201, 9)
        );
    }

    #[test]
    fn test_truncated_literal() {
        assert_eq!(eval_integer(&[opcode::WORD_CONST, 0x34]), Err(AmlError::UnexpectedEndOfStream));
    }

    #[test]
    fn test_string_literal() {
        let mut context = make_context();
        let mut state = fresh_state();
        let stream = [&[opcode::STRING_PREFIX], b"PCI0".as_slice(), &[0x00]].concat();
        let (value, consumed) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(value.as_string().unwrap(), "PCI0");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_unterminated_string() {
        let mut context = make_context();
        let mut state = fresh_state();
        let stream = [opcode::STRING_PREFIX, b'A', b'B'];
        assert_eq!(
            eval_operand(&mut context, &mut state, &stream).unwrap_err(),
            AmlError::UnterminatedStringConstant
        );
    }

    #[test]
    fn test_buffer_zero_padded() {
        let mut context = make_context();
        let mut state = fresh_state();
        // Buffer(4) { 0xaa, 0xbb }
        let stream = [opcode::BUFFER_OP, 0x05, opcode::BYTE_CONST, 0x04, 0xaa, 0xbb];
        let (value, consumed) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(consumed, 6);
        match value {
            AmlValue::Buffer(bytes) => assert_eq!(bytes, vec![0xaa, 0xbb, 0x00, 0x00]),
            other => panic!("expected buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_with_nested_operands() {
        let mut context = make_context();
        let mut state = fresh_state();
        // Add(Add(3, 4), 5) with NullName targets
        let stream = [
            opcode::ADD_OP,
            opcode::ADD_OP,
            opcode::BYTE_CONST,
            0x03,
            opcode::BYTE_CONST,
            0x04,
            0x00,
            opcode::BYTE_CONST,
            0x05,
            0x00,
        ];
        let (value, consumed) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(consumed, stream.len());
        assert_eq!(value.as_integer().unwrap(), 12);
    }

    #[test]
    fn test_arithmetic_stores_to_local_target() {
        let mut context = make_context();
        let mut state = fresh_state();
        // Add(1, 2, Local3)
        let stream = [opcode::ADD_OP, opcode::ONE_OP, opcode::BYTE_CONST, 0x02, 0x63];
        let (value, _) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(value.as_integer().unwrap(), 3);
        assert_eq!(state.local(3).unwrap().as_integer().unwrap(), 3);
    }

    #[test]
    fn test_logical_ops() {
        let mut context = make_context();
        let mut state = fresh_state();
        // LEqual(5, 5)
        let stream = [opcode::LEQUAL_OP, opcode::BYTE_CONST, 0x05, opcode::BYTE_CONST, 0x05];
        let (value, _) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(value.as_integer().unwrap(), u64::MAX);

        // LNot(LLess(3, 2))
        let stream = [opcode::LNOT_OP, opcode::LLESS_OP, opcode::BYTE_CONST, 0x03, opcode::BYTE_CONST, 0x02];
        let (value, _) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(value.as_integer().unwrap(), u64::MAX);
    }

    #[test]
    fn test_sizeof() {
        let mut context = make_context();
        let mut state = fresh_state();
        state.store_local(0, AmlValue::Buffer(vec![1, 2, 3])).unwrap();
        let stream = [opcode::SIZE_OF_OP, 0x60];
        let (value, _) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(value.as_integer().unwrap(), 3);
    }

    #[test]
    fn test_revision_op() {
        let mut context = make_context();
        let mut state = fresh_state();
        let stream = [opcode::EXT_OPCODE_PREFIX, opcode::EXT_REVISION_OP];
        let (value, consumed) = eval_operand(&mut context, &mut state, &stream).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(value.as_integer().unwrap(), crate::AML_INTERPRETER_REVISION);
    }
}
