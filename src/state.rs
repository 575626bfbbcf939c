//! Per-invocation interpreter state. Each method activation owns its
//! arguments, locals, return slot, and two fixed-depth stacks: the
//! execution stack of control frames and the operand stack of intermediate
//! values. Control flow is driven entirely by these stacks; the engine
//! never recurses on the host stack for If/While/Return.

use crate::{
    misc::{ArgNum, LocalNum},
    namespace::AmlName,
    value::{AmlValue, Args},
    AmlError,
};
use alloc::vec::Vec;

pub const EXECUTION_STACK_DEPTH: usize = 16;
pub const OPERAND_STACK_DEPTH: usize = 16;

/// A control frame on the execution stack.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Frame {
    /// The boundary of a method activation. Popped by `Return` or by the
    /// instruction pointer reaching the end of the method body.
    MethodContext,
    /// A partially-evaluated expression, reduced once `num_operands`
    /// operands have accumulated above `opstack_base`. `opstack_base` is an
    /// index, not a pointer: the operand stack may reallocate while the
    /// frame is pending.
    Op { opcode: u16, opstack_base: usize, num_operands: usize, want_result: bool },
    /// A `While` in progress. The predicate is re-evaluated each time the
    /// instruction pointer returns to `pred_offset`; `end_offset` is one
    /// past the loop body.
    Loop { pred_offset: usize, end_offset: usize },
    /// An `If` in progress. `end_offset` is one past the If body.
    Cond { taken: bool, end_offset: usize },
}

/// The state of one method invocation.
#[derive(Debug)]
pub struct CallState {
    /// Path of the method being executed.
    pub handle: AmlName,
    pub args: Args,
    pub locals: [AmlValue; 8],
    pub retvalue: AmlValue,
    stack: Vec<Frame>,
    opstack: Vec<AmlValue>,
}

impl CallState {
    /// A fresh activation: locals zero-initialized, both stacks empty.
    pub fn new(handle: AmlName) -> CallState {
        // `AmlValue` isn't `Copy`, so the array repeat needs a const rather than a value.
        const UNINITIALIZED: AmlValue = AmlValue::Uninitialized;

        CallState {
            handle,
            args: Args::EMPTY,
            locals: [UNINITIALIZED; 8],
            retvalue: AmlValue::Uninitialized,
            stack: Vec::new(),
            opstack: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), AmlError> {
        if self.stack.len() == EXECUTION_STACK_DEPTH {
            return Err(AmlError::ExecutionStackOverflow);
        }
        self.stack.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    pub fn peek_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.stack
    }

    /// Discard frames until the stack is `depth` deep.
    pub fn truncate_frames(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub fn push_operand(&mut self, value: AmlValue) -> Result<(), AmlError> {
        if self.opstack.len() == OPERAND_STACK_DEPTH {
            return Err(AmlError::OperandStackOverflow);
        }
        self.opstack.push(value);
        Ok(())
    }

    /// Release and discard the top `n` operands.
    pub fn pop_operands(&mut self, n: usize) {
        let new_len = self.opstack.len().saturating_sub(n);
        self.opstack.truncate(new_len);
    }

    /// Move the single remaining operand out. The operand stack must hold
    /// exactly one value; anything else is an engine invariant violation.
    pub fn take_result(&mut self) -> Result<AmlValue, AmlError> {
        if self.opstack.len() != 1 {
            return Err(AmlError::OperandStackNotEmpty);
        }
        Ok(self.opstack.pop().unwrap_or_default())
    }

    pub fn operands_mut(&mut self) -> &mut [AmlValue] {
        &mut self.opstack
    }

    pub fn operand_depth(&self) -> usize {
        self.opstack.len()
    }

    pub fn local(&self, num: LocalNum) -> Result<&AmlValue, AmlError> {
        self.locals.get(num as usize).ok_or(AmlError::InvalidLocalAccess(num))
    }

    pub fn store_local(&mut self, num: LocalNum, value: AmlValue) -> Result<(), AmlError> {
        *self.locals.get_mut(num as usize).ok_or(AmlError::InvalidLocalAccess(num))? = value;
        Ok(())
    }

    pub fn arg(&self, num: ArgNum) -> Result<&AmlValue, AmlError> {
        self.args.arg(num)
    }

    pub fn store_arg(&mut self, num: ArgNum, value: AmlValue) -> Result<(), AmlError> {
        self.args.store_arg(num, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CallState {
        CallState::new(AmlName::from_str("\\MTH_").unwrap())
    }

    #[test]
    fn test_locals_zero_initialized() {
        let state = state();
        for i in 0..8 {
            assert_eq!(state.local(i).unwrap().as_integer().unwrap(), 0);
        }
        assert!(state.local(8).is_err());
    }

    #[test]
    fn test_execution_stack_overflow() {
        let mut state = state();
        for _ in 0..EXECUTION_STACK_DEPTH {
            state.push_frame(Frame::MethodContext).unwrap();
        }
        assert_eq!(state.push_frame(Frame::MethodContext), Err(AmlError::ExecutionStackOverflow));
    }

    #[test]
    fn test_operand_stack_overflow() {
        let mut state = state();
        for i in 0..OPERAND_STACK_DEPTH {
            state.push_operand(AmlValue::Integer(i as u64)).unwrap();
        }
        assert_eq!(state.push_operand(AmlValue::zero()), Err(AmlError::OperandStackOverflow));
    }

    #[test]
    fn test_take_result_requires_exactly_one() {
        let mut state = state();
        assert_eq!(state.take_result().unwrap_err(), AmlError::OperandStackNotEmpty);
        state.push_operand(AmlValue::Integer(3)).unwrap();
        state.push_operand(AmlValue::Integer(4)).unwrap();
        assert_eq!(state.take_result().unwrap_err(), AmlError::OperandStackNotEmpty);
        state.pop_operands(1);
        assert_eq!(state.take_result().unwrap().as_integer().unwrap(), 3);
    }
}
