//! The execution engine: a non-recursive interpreter for control method
//! bodies. Control flow never recurses on the host stack; instead each
//! activation drives an explicit stack of [`Frame`]s. Expressions are
//! assembled incrementally: a binary or unary opcode opens an `Op` frame
//! recording where its operands will begin on the operand stack, subsequent
//! decode iterations push the operands, and the frame is reduced the moment
//! its operand count is met. Loops and conditionals are frames that redirect
//! the instruction pointer when it reaches their recorded offsets.
//!
//! Nested method invocations do recurse in Rust, one frame per *activation*
//! rather than per AML scope, mirroring how a kernel would call back into
//! the interpreter.

use crate::{
    expression, misc,
    name_object::{self, Target},
    namespace::AmlName,
    opcode, opregion, pkg_length,
    state::{CallState, Frame},
    term_object,
    value::{AmlType, AmlValue, Args},
    AmlContext, AmlError,
};
use log::debug;

/// Run a method body to completion in `state`. On success the method's
/// return value (explicit or the implicit `Integer(0)`) is left in
/// `state.retvalue`.
pub(crate) fn run_method(context: &mut AmlContext, state: &mut CallState, code: &[u8]) -> Result<(), AmlError> {
    debug!("Executing {} ({} bytes of AML)", state.handle, code.len());
    state.push_frame(Frame::MethodContext)?;
    run(context, state, code)?;
    state.retvalue = state.take_result()?;
    Ok(())
}

fn run(context: &mut AmlContext, state: &mut CallState, code: &[u8]) -> Result<(), AmlError> {
    let mut ip = 0;

    while let Some(top) = state.peek_frame().cloned() {
        match top {
            Frame::MethodContext => {
                if ip == code.len() {
                    // Implicit return: falling off the end of the method
                    // yields zero.
                    if state.operand_depth() != 0 {
                        return Err(AmlError::OperandStackNotEmpty);
                    }
                    state.push_operand(AmlValue::zero())?;
                    state.pop_frame();
                    continue;
                }
            }

            Frame::Op { opcode: op, opstack_base, num_operands, want_result } => {
                if state.operand_depth() == opstack_base + num_operands {
                    let result = reduce(op, &mut state.operands_mut()[opstack_base..])?;
                    state.pop_operands(num_operands);
                    if want_result {
                        state.push_operand(result.clone())?;
                    }
                    ip += write_back(context, state, &code[ip..], result)?;
                    state.pop_frame();
                    continue;
                }
            }

            Frame::Loop { pred_offset, end_offset } => {
                if ip == pred_offset {
                    let (pred, consumed) = expression::eval_operand(context, state, &code[ip..end_offset])?;
                    ip += consumed;
                    if !pred.as_bool()? {
                        ip = end_offset;
                        state.pop_frame();
                    }
                    continue;
                } else if ip == end_offset {
                    ip = pred_offset;
                    continue;
                }
                debug_assert!(ip <= end_offset);
            }

            Frame::Cond { taken, end_offset } => {
                if !taken {
                    // The If body was skipped; an attached Else body
                    // executes inline.
                    if code.get(ip) == Some(&opcode::ELSE_OP) {
                        let pkg = pkg_length::parse_pkg_length(&code[ip + 1..])?;
                        ip += 1 + pkg.consumed;
                    }
                    state.pop_frame();
                    continue;
                }
                if ip == end_offset {
                    // The taken If body is done; skip any attached Else.
                    if code.get(ip) == Some(&opcode::ELSE_OP) {
                        let pkg = pkg_length::parse_pkg_length(&code[ip + 1..])?;
                        ip += 1 + pkg.raw_length as usize;
                    }
                    state.pop_frame();
                    continue;
                }
            }
        }

        if ip >= code.len() {
            return Err(AmlError::UnexpectedEndOfStream);
        }
        ip = dispatch(context, state, code, ip)?;
    }

    Ok(())
}

/// Whether the expression decoded this iteration is consumed as an operand.
/// Pending `Loop`/`Cond` frames are transparent: only an unfilled `Op` frame
/// above the activation boundary wants a value.
fn wants_result(state: &CallState) -> bool {
    for frame in state.frames().iter().rev() {
        match frame {
            Frame::Op { opstack_base, num_operands, .. } => {
                return state.operand_depth() < opstack_base + num_operands;
            }
            Frame::Loop { .. } | Frame::Cond { .. } => continue,
            Frame::MethodContext => return false,
        }
    }
    false
}

/// Decode and execute one opcode at `code[ip]`, returning the new
/// instruction pointer.
fn dispatch(context: &mut AmlContext, state: &mut CallState, code: &[u8], ip: usize) -> Result<usize, AmlError> {
    let want_result = wants_result(state);
    let byte = code[ip];

    if opcode::is_name_string_start(byte) {
        let (value, consumed) = eval_name_reference(context, state, &code[ip..])?;
        if want_result {
            state.push_operand(value)?;
        }
        return Ok(ip + consumed);
    }

    match byte {
        opcode::ZERO_OP
        | opcode::ONE_OP
        | opcode::ONES_OP
        | opcode::BYTE_CONST
        | opcode::WORD_CONST
        | opcode::DWORD_CONST
        | opcode::QWORD_CONST => {
            let (value, consumed) = expression::eval_integer(&code[ip..])?;
            if want_result {
                state.push_operand(AmlValue::Integer(value))?;
            }
            Ok(ip + consumed)
        }

        opcode::NOOP_OP | opcode::BREAKPOINT_OP => Ok(ip + 1),

        opcode::LOCAL0_OP..=opcode::LOCAL7_OP => {
            if want_result {
                let value = state.local(misc::local_num(byte)?)?.clone();
                state.push_operand(value)?;
            }
            Ok(ip + 1)
        }

        opcode::ARG0_OP..=opcode::ARG6_OP => {
            if want_result {
                let value = state.arg(misc::arg_num(byte)?)?.clone();
                state.push_operand(value)?;
            }
            Ok(ip + 1)
        }

        opcode::STORE_OP | opcode::NOT_OP => {
            state.push_frame(Frame::Op {
                opcode: byte as u16,
                opstack_base: state.operand_depth(),
                num_operands: 1,
                want_result,
            })?;
            Ok(ip + 1)
        }

        opcode::ADD_OP
        | opcode::SUBTRACT_OP
        | opcode::MULTIPLY_OP
        | opcode::AND_OP
        | opcode::OR_OP
        | opcode::XOR_OP
        | opcode::SHIFT_LEFT_OP
        | opcode::SHIFT_RIGHT_OP => {
            state.push_frame(Frame::Op {
                opcode: byte as u16,
                opstack_base: state.operand_depth(),
                num_operands: 2,
                want_result,
            })?;
            Ok(ip + 1)
        }

        opcode::INCREMENT_OP | opcode::DECREMENT_OP => {
            let (target, consumed) = name_object::parse_target(&code[ip + 1..])?;
            let value = context.read_target(state, &target)?.as_integer()?;
            let value = if byte == opcode::INCREMENT_OP { value.wrapping_add(1) } else { value.wrapping_sub(1) };
            context.store(state, &target, AmlValue::Integer(value))?;
            if want_result {
                state.push_operand(AmlValue::Integer(value))?;
            }
            Ok(ip + 1 + consumed)
        }

        opcode::DIVIDE_OP => {
            // DivideOp Dividend Divisor RemainderTarget QuotientTarget
            let mut cursor = ip + 1;
            let (dividend, consumed) = expression::eval_operand(context, state, &code[cursor..])?;
            cursor += consumed;
            let (divisor, consumed) = expression::eval_operand(context, state, &code[cursor..])?;
            cursor += consumed;

            let dividend = dividend.as_integer()?;
            let divisor = divisor.as_integer()?;
            if divisor == 0 {
                return Err(AmlError::DivideByZero);
            }

            let (remainder_target, consumed) = name_object::parse_target(&code[cursor..])?;
            cursor += consumed;
            let (quotient_target, consumed) = name_object::parse_target(&code[cursor..])?;
            cursor += consumed;

            if remainder_target != Target::Null {
                context.store(state, &remainder_target, AmlValue::Integer(dividend % divisor))?;
            }
            let quotient = AmlValue::Integer(dividend / divisor);
            if quotient_target != Target::Null {
                context.store(state, &quotient_target, quotient.clone())?;
            }
            if want_result {
                state.push_operand(quotient)?;
            }
            Ok(cursor)
        }

        opcode::PACKAGE_OP => {
            let (elements, consumed) = term_object::parse_package(context, state, &code[ip + 1..])?;
            if want_result {
                state.push_operand(AmlValue::Package(elements))?;
            }
            Ok(ip + 1 + consumed)
        }

        opcode::IF_OP => {
            let pkg = pkg_length::parse_pkg_length(&code[ip + 1..])?;
            let end_offset = ip + 1 + pkg.raw_length as usize;
            if end_offset > code.len() {
                return Err(AmlError::UnexpectedEndOfStream);
            }
            let mut cursor = ip + 1 + pkg.consumed;
            let (pred, consumed) = expression::eval_operand(context, state, &code[cursor..end_offset])?;
            cursor += consumed;

            let taken = pred.as_bool()?;
            state.push_frame(Frame::Cond { taken, end_offset })?;
            Ok(if taken { cursor } else { end_offset })
        }

        // A bare Else is only legal immediately after an If body, where the
        // Cond frame's end logic consumes it before dispatch sees it.
        opcode::ELSE_OP => Err(AmlError::ElseWithoutIf),

        opcode::WHILE_OP => {
            let pkg = pkg_length::parse_pkg_length(&code[ip + 1..])?;
            let end_offset = ip + 1 + pkg.raw_length as usize;
            if end_offset > code.len() {
                return Err(AmlError::UnexpectedEndOfStream);
            }
            let pred_offset = ip + 1 + pkg.consumed;
            state.push_frame(Frame::Loop { pred_offset, end_offset })?;
            Ok(pred_offset)
        }

        opcode::BREAK_OP => {
            let (index, _, end_offset) =
                find_enclosing_loop(state).ok_or(AmlError::BreakInInvalidPosition)?;
            // The loop frame goes too.
            state.truncate_frames(index);
            Ok(end_offset)
        }

        opcode::CONTINUE_OP => {
            let (index, pred_offset, _) =
                find_enclosing_loop(state).ok_or(AmlError::ContinueInInvalidPosition)?;
            // The loop frame stays; everything above it goes.
            state.truncate_frames(index + 1);
            Ok(pred_offset)
        }

        opcode::RETURN_OP => {
            let (value, _) = expression::eval_operand(context, state, &code[ip + 1..])?;
            let index = state
                .frames()
                .iter()
                .rposition(|frame| *frame == Frame::MethodContext)
                .ok_or(AmlError::ReturnInInvalidPosition)?;
            if state.operand_depth() != 0 {
                return Err(AmlError::OperandStackNotEmpty);
            }
            state.push_operand(value)?;
            state.truncate_frames(index);
            // The activation is finished; the returned ip is never read.
            Ok(code.len())
        }

        opcode::NAME_OP => Ok(ip + 1 + term_object::parse_name_op(context, state, &code[ip + 1..])?),

        opcode::CREATE_BYTE_FIELD_OP | opcode::CREATE_WORD_FIELD_OP | opcode::CREATE_DWORD_FIELD_OP => {
            Ok(ip + 1 + term_object::parse_create_field(context, state, byte, &code[ip + 1..])?)
        }

        opcode::EXT_OPCODE_PREFIX => {
            let second = *code.get(ip + 1).ok_or(AmlError::UnexpectedEndOfStream)?;
            match second {
                opcode::EXT_SLEEP_OP => {
                    let (time, consumed) = expression::eval_operand(context, state, &code[ip + 2..])?;
                    // Sleep(0) still has to yield; round up to a millisecond.
                    let milliseconds = u64::max(time.as_integer()?, 1);
                    context.handler.sleep(milliseconds);
                    Ok(ip + 2 + consumed)
                }

                opcode::EXT_STALL_OP => {
                    let (time, consumed) = expression::eval_operand(context, state, &code[ip + 2..])?;
                    context.handler.stall(time.as_integer()?);
                    Ok(ip + 2 + consumed)
                }

                opcode::EXT_FATAL_OP => {
                    // FatalOp FatalType FatalCode FatalArg
                    let fatal_type = *code.get(ip + 2).ok_or(AmlError::UnexpectedEndOfStream)?;
                    let code_bytes = code.get(ip + 3..ip + 7).ok_or(AmlError::UnexpectedEndOfStream)?;
                    let fatal_code = u32::from_le_bytes([code_bytes[0], code_bytes[1], code_bytes[2], code_bytes[3]]);
                    let (arg, _) = expression::eval_operand(context, state, &code[ip + 7..])?;
                    context.handler.handle_fatal_error(fatal_type, fatal_code, arg.as_integer()?);
                    Err(AmlError::FatalError)
                }

                _ => delegate(context, state, code, ip, want_result),
            }
        }

        _ => delegate(context, state, code, ip, want_result),
    }
}

/// Fallback for opcodes the dispatch table doesn't handle itself:
/// declarative objects go to the term-object parser, everything else to the
/// expression evaluator.
fn delegate(
    context: &mut AmlContext,
    state: &mut CallState,
    code: &[u8],
    ip: usize,
    want_result: bool,
) -> Result<usize, AmlError> {
    debug!("Delegating opcode {:#04x} at offset {:#x}", code[ip], ip);
    match term_object::parse_term_object(context, state, &code[ip..]) {
        Ok(consumed) => Ok(ip + consumed),
        Err(AmlError::UnexpectedByte(_)) => {
            let (value, consumed) = expression::eval_operand(context, state, &code[ip..])?;
            if want_result {
                state.push_operand(value)?;
            }
            Ok(ip + consumed)
        }
        Err(err) => Err(err),
    }
}

/// The innermost pending `Loop`, as `(frame_index, pred_offset, end_offset)`.
fn find_enclosing_loop(state: &CallState) -> Option<(usize, usize, usize)> {
    state.frames().iter().enumerate().rev().find_map(|(index, frame)| match frame {
        Frame::Loop { pred_offset, end_offset } => Some((index, *pred_offset, *end_offset)),
        _ => None,
    })
}

/// Reduce a filled `Op` frame to its result value. Pure except for moving
/// the `Store` operand out of its slot.
pub(crate) fn reduce(op: u16, operands: &mut [AmlValue]) -> Result<AmlValue, AmlError> {
    let result = match ((op & 0xff) as u8, operands) {
        (opcode::STORE_OP, [value]) => value.take(),
        (opcode::NOT_OP, [value]) => AmlValue::Integer(!value.as_integer()?),
        (opcode::ADD_OP, [left, right]) => AmlValue::Integer(left.as_integer()?.wrapping_add(right.as_integer()?)),
        (opcode::SUBTRACT_OP, [left, right]) => {
            AmlValue::Integer(left.as_integer()?.wrapping_sub(right.as_integer()?))
        }
        (opcode::MULTIPLY_OP, [left, right]) => {
            AmlValue::Integer(left.as_integer()?.wrapping_mul(right.as_integer()?))
        }
        (opcode::AND_OP, [left, right]) => AmlValue::Integer(left.as_integer()? & right.as_integer()?),
        (opcode::OR_OP, [left, right]) => AmlValue::Integer(left.as_integer()? | right.as_integer()?),
        (opcode::XOR_OP, [left, right]) => AmlValue::Integer(left.as_integer()? ^ right.as_integer()?),
        // Shift counts are masked to 6 bits; AML shifts never overflow to
        // an unspecified value.
        (opcode::SHIFT_LEFT_OP, [left, right]) => {
            AmlValue::Integer(left.as_integer()? << (right.as_integer()? & 0x3f))
        }
        (opcode::SHIFT_RIGHT_OP, [left, right]) => {
            AmlValue::Integer(left.as_integer()? >> (right.as_integer()? & 0x3f))
        }
        _ => return Err(AmlError::UnknownOpcode(op)),
    };
    Ok(result)
}

/// Consume the Target encoding that follows a reduced expression and store
/// the result through it. Returns the bytes the Target occupied.
fn write_back(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
    result: AmlValue,
) -> Result<usize, AmlError> {
    let (target, consumed) = name_object::parse_target(stream)?;
    if target != Target::Null {
        context.store(state, &target, result)?;
    }
    Ok(consumed)
}

/// Evaluate a NameString reference in an expression or statement position:
/// a plain name reads its bound object, a method is invoked inline (its
/// arguments parsed against the caller's state), and field units read
/// through their operation region. Returns the value and total bytes
/// consumed (name plus any arguments).
pub(crate) fn eval_name_reference(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<(AmlValue, usize), AmlError> {
    let (name, consumed) = name_object::parse_name_string(stream)?;
    let path = context.namespace.search(&name, &context.current_scope)?;

    match context.namespace.get_by_path(&path)?.type_of() {
        AmlType::Method => {
            let (value, arg_bytes) = invoke_at(context, state, &path, &stream[consumed..])?;
            Ok((value, consumed + arg_bytes))
        }
        AmlType::FieldUnit | AmlType::BufferField => Ok((opregion::read_field(context, &path)?, consumed)),
        _ => Ok((context.namespace.get_by_path(&path)?.clone(), consumed)),
    }
}

/// Invoke the method at `path` from inside a running activation. The
/// caller's byte cursor sits just past the method's NameString;
/// `arg_count()` argument expressions are evaluated against the caller's
/// state. Returns the callee's result and the argument bytes consumed.
fn invoke_at(
    context: &mut AmlContext,
    caller: &mut CallState,
    path: &AmlName,
    arg_stream: &[u8],
) -> Result<(AmlValue, usize), AmlError> {
    let arg_count = match context.namespace.get_by_path(path)? {
        AmlValue::Method { flags, .. } => flags.arg_count(),
        // A constant "method" encoded as a bare value takes no arguments.
        _ => return Ok((context.namespace.get_by_path(path)?.clone(), 0)),
    };

    let mut args = Args::EMPTY;
    let mut offset = 0;
    for i in 0..arg_count {
        let (value, consumed) = expression::eval_operand(context, caller, &arg_stream[offset..])?;
        args.store_arg(i, value)?;
        offset += consumed;
    }

    let value = context.invoke_method(path, args)?;
    Ok((value, offset))
}
