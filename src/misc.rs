//! Small shared types for `ArgObj` and `LocalObj` encodings.

use crate::{opcode, AmlError};

pub type ArgNum = u8;
pub type LocalNum = u8;

/// Decode an `ArgObj` byte (`Arg0Op`..`Arg6Op`) to its argument number.
pub fn arg_num(byte: u8) -> Result<ArgNum, AmlError> {
    if (opcode::ARG0_OP..=opcode::ARG6_OP).contains(&byte) {
        Ok(byte - opcode::ARG0_OP)
    } else {
        Err(AmlError::UnexpectedByte(byte))
    }
}

/// Decode a `LocalObj` byte (`Local0Op`..`Local7Op`) to its local number.
pub fn local_num(byte: u8) -> Result<LocalNum, AmlError> {
    if (opcode::LOCAL0_OP..=opcode::LOCAL7_OP).contains(&byte) {
        Ok(byte - opcode::LOCAL0_OP)
    } else {
        Err(AmlError::UnexpectedByte(byte))
    }
}
