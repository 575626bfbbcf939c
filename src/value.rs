//! The dynamic value model. AML is dynamically typed, so everything the
//! engine moves through locals, arguments, the operand stack, and the
//! namespace is an [`AmlValue`]. Named-object kinds (methods, fields,
//! operation regions) live in the same enum as data objects, as the
//! namespace stores both.

use crate::{misc::ArgNum, namespace::AmlName, AmlContext, AmlError};
use alloc::{string::String, vec::Vec};
use bit_field::BitField;
use bitflags::bitflags;
use core::fmt;

/// The largest number of elements a `Package` may carry. Firmware packages
/// are small; anything larger indicates a corrupt stream.
pub const MAX_PACKAGE_ENTRIES: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AmlType {
    Uninitialized,
    Integer,
    String,
    Buffer,
    Package,
    OpRegion,
    FieldUnit,
    BufferField,
    Method,
    Mutex,
    Device,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionSpace {
    SystemMemory,
    SystemIo,
    PciConfig,
    EmbeddedControl,
    SMBus,
    SystemCmos,
    PciBarTarget,
    IPMI,
    GeneralPurposeIo,
    GenericSerialBus,
    OemDefined(u8),
}

impl RegionSpace {
    pub fn from_byte(byte: u8) -> Result<RegionSpace, AmlError> {
        match byte {
            0x00 => Ok(RegionSpace::SystemMemory),
            0x01 => Ok(RegionSpace::SystemIo),
            0x02 => Ok(RegionSpace::PciConfig),
            0x03 => Ok(RegionSpace::EmbeddedControl),
            0x04 => Ok(RegionSpace::SMBus),
            0x05 => Ok(RegionSpace::SystemCmos),
            0x06 => Ok(RegionSpace::PciBarTarget),
            0x07 => Ok(RegionSpace::IPMI),
            0x08 => Ok(RegionSpace::GeneralPurposeIo),
            0x09 => Ok(RegionSpace::GenericSerialBus),
            space @ 0x80..=0xff => Ok(RegionSpace::OemDefined(space)),
            byte => Err(AmlError::InvalidRegionSpace(byte)),
        }
    }
}

bitflags! {
    /// The MethodFlags byte of a `DefMethod`. Bits 0..3 encode the argument
    /// count and are exposed through [`MethodFlags::arg_count`] rather than
    /// as individual flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MethodFlags: u8 {
        const SERIALIZED = 1 << 3;
    }
}

impl MethodFlags {
    pub fn from_byte(byte: u8) -> MethodFlags {
        MethodFlags::from_bits_retain(byte)
    }

    /// Number of arguments the method takes (0..=7).
    pub fn arg_count(&self) -> u8 {
        self.bits() & 0b111
    }

    pub fn sync_level(&self) -> u8 {
        self.bits() >> 4
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldAccessType {
    Any,
    Byte,
    Word,
    DWord,
    QWord,
    Buffer,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldUpdateRule {
    Preserve,
    WriteAsOnes,
    WriteAsZeros,
}

/// The FieldFlags byte of a `DefField`/`DefIndexField`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldFlags(u8);

impl FieldFlags {
    pub fn new(value: u8) -> FieldFlags {
        FieldFlags(value)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn access_type(&self) -> Result<FieldAccessType, AmlError> {
        match self.0.get_bits(0..4) {
            0 => Ok(FieldAccessType::Any),
            1 => Ok(FieldAccessType::Byte),
            2 => Ok(FieldAccessType::Word),
            3 => Ok(FieldAccessType::DWord),
            4 => Ok(FieldAccessType::QWord),
            5 => Ok(FieldAccessType::Buffer),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    pub fn lock_rule(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn field_update_rule(&self) -> Result<FieldUpdateRule, AmlError> {
        match self.0.get_bits(5..7) {
            0 => Ok(FieldUpdateRule::Preserve),
            1 => Ok(FieldUpdateRule::WriteAsOnes),
            2 => Ok(FieldUpdateRule::WriteAsZeros),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }
}

/// A native method is a Rust function registered in the namespace, invoked
/// with the caller-supplied arguments. `_OSI` is implemented this way.
pub type NativeMethod = fn(&mut AmlContext, &Args) -> Result<AmlValue, AmlError>;

#[derive(Clone)]
pub enum MethodCode {
    Aml(Vec<u8>),
    Native(NativeMethod),
}

impl fmt::Debug for MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodCode::Aml(code) => write!(f, "Aml({} bytes)", code.len()),
            MethodCode::Native(_) => write!(f, "Native(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum AmlValue {
    /// The zero/released state. Reads as `Integer(0)` where an integer is
    /// demanded.
    Uninitialized,
    Integer(u64),
    String(String),
    Buffer(Vec<u8>),
    Package(Vec<AmlValue>),
    OpRegion { region: RegionSpace, offset: u64, length: u64 },
    /// A field unit within an operation region. `offset` and `length` are in
    /// bits, relative to the start of the region.
    Field { region: AmlName, flags: FieldFlags, offset: u64, length: u64 },
    /// A field unit accessed indirectly through an index/data register pair.
    IndexField { index: AmlName, data: AmlName, flags: FieldFlags, offset: u64, length: u64 },
    /// A view over a named buffer, created by the `CreateXField` family.
    /// `offset` and `length` are in bits.
    BufferField { buffer: AmlName, offset: u64, length: u64 },
    Method { flags: MethodFlags, code: MethodCode },
    Mutex { sync_level: u8 },
    Device,
}

impl Default for AmlValue {
    fn default() -> AmlValue {
        AmlValue::Uninitialized
    }
}

impl AmlValue {
    pub fn zero() -> AmlValue {
        AmlValue::Integer(0)
    }

    pub fn one() -> AmlValue {
        AmlValue::Integer(1)
    }

    pub fn ones() -> AmlValue {
        AmlValue::Integer(u64::MAX)
    }

    pub fn native_method(arg_count: u8, code: NativeMethod) -> AmlValue {
        AmlValue::Method { flags: MethodFlags::from_byte(arg_count & 0b111), code: MethodCode::Native(code) }
    }

    pub fn type_of(&self) -> AmlType {
        match self {
            AmlValue::Uninitialized => AmlType::Uninitialized,
            AmlValue::Integer(_) => AmlType::Integer,
            AmlValue::String(_) => AmlType::String,
            AmlValue::Buffer(_) => AmlType::Buffer,
            AmlValue::Package(_) => AmlType::Package,
            AmlValue::OpRegion { .. } => AmlType::OpRegion,
            AmlValue::Field { .. } => AmlType::FieldUnit,
            AmlValue::IndexField { .. } => AmlType::FieldUnit,
            AmlValue::BufferField { .. } => AmlType::BufferField,
            AmlValue::Method { .. } => AmlType::Method,
            AmlValue::Mutex { .. } => AmlType::Mutex,
            AmlValue::Device => AmlType::Device,
        }
    }

    /// Move the value out, leaving `Uninitialized` behind. This is the
    /// engine's ownership-transfer primitive; `Return` uses it to deliver
    /// results without copying.
    pub fn take(&mut self) -> AmlValue {
        core::mem::take(self)
    }

    pub fn as_integer(&self) -> Result<u64, AmlError> {
        match self {
            AmlValue::Uninitialized => Ok(0),
            AmlValue::Integer(value) => Ok(*value),
            /*
             * A buffer converts to the integer formed from its first 8 bytes,
             * little-endian (§19.3.5.5 of the ACPI spec).
             */
            AmlValue::Buffer(bytes) => {
                let mut value = 0u64;
                for (i, byte) in bytes.iter().take(8).enumerate() {
                    value |= (*byte as u64) << (i * 8);
                }
                Ok(value)
            }
            _ => Err(AmlError::IncompatibleValueConversion { current: self.type_of(), target: AmlType::Integer }),
        }
    }

    pub fn as_string(&self) -> Result<&str, AmlError> {
        match self {
            AmlValue::String(string) => Ok(string),
            _ => Err(AmlError::IncompatibleValueConversion { current: self.type_of(), target: AmlType::String }),
        }
    }

    pub fn as_bool(&self) -> Result<bool, AmlError> {
        Ok(self.as_integer()? != 0)
    }

    /// Convert to the given type where a store demands it, per §19.3.5.8.
    /// Stores to an existing object keep the object's type, converting the
    /// incoming value if required.
    pub fn as_type(&self, typ: AmlType) -> Result<AmlValue, AmlError> {
        if self.type_of() == typ {
            return Ok(self.clone());
        }
        match typ {
            AmlType::Integer => self.as_integer().map(AmlValue::Integer),
            AmlType::Uninitialized => Ok(self.clone()),
            _ => Err(AmlError::IncompatibleValueConversion { current: self.type_of(), target: typ }),
        }
    }
}

/// Arguments passed to a method invocation. At most 7 may be supplied.
#[derive(Clone, Default, Debug)]
pub struct Args(pub [Option<AmlValue>; 7]);

impl Args {
    pub const EMPTY: Args = Args([None, None, None, None, None, None, None]);

    pub fn from_list(list: Vec<AmlValue>) -> Result<Args, AmlError> {
        if list.len() > 7 {
            return Err(AmlError::TooManyArgs);
        }
        let mut args = Args::EMPTY;
        for (i, arg) in list.into_iter().enumerate() {
            args.0[i] = Some(arg);
        }
        Ok(args)
    }

    pub fn arg(&self, num: ArgNum) -> Result<&AmlValue, AmlError> {
        if num > 6 {
            return Err(AmlError::InvalidArgAccess(num));
        }
        self.0[num as usize].as_ref().ok_or(AmlError::InvalidArgAccess(num))
    }

    pub fn store_arg(&mut self, num: ArgNum, value: AmlValue) -> Result<(), AmlError> {
        if num > 6 {
            return Err(AmlError::InvalidArgAccess(num));
        }
        self.0[num as usize] = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_method_flags() {
        let flags = MethodFlags::from_byte(0x03);
        assert_eq!(flags.arg_count(), 3);
        assert!(!flags.contains(MethodFlags::SERIALIZED));

        let flags = MethodFlags::from_byte(0x0a);
        assert_eq!(flags.arg_count(), 2);
        assert!(flags.contains(MethodFlags::SERIALIZED));
    }

    #[test]
    fn test_field_flags() {
        let flags = FieldFlags::new(0x01);
        assert_eq!(flags.access_type().unwrap(), FieldAccessType::Byte);
        assert_eq!(flags.field_update_rule().unwrap(), FieldUpdateRule::Preserve);

        let flags = FieldFlags::new(0b0100_0011);
        assert_eq!(flags.access_type().unwrap(), FieldAccessType::DWord);
        assert_eq!(flags.field_update_rule().unwrap(), FieldUpdateRule::WriteAsZeros);
    }

    #[test]
    fn test_integer_conversions() {
        assert_eq!(AmlValue::Uninitialized.as_integer().unwrap(), 0);
        assert_eq!(AmlValue::Integer(42).as_integer().unwrap(), 42);
        assert_eq!(AmlValue::Buffer(vec![0x34, 0x12]).as_integer().unwrap(), 0x1234);
        assert!(AmlValue::String("hello".into()).as_integer().is_err());
        assert!(AmlValue::Integer(1).as_bool().unwrap());
        assert!(!AmlValue::Integer(0).as_bool().unwrap());
    }

    #[test]
    fn test_take_releases_source() {
        let mut value = AmlValue::String("owned".into());
        let taken = value.take();
        assert_eq!(taken.as_string().unwrap(), "owned");
        assert_eq!(value.type_of(), AmlType::Uninitialized);
    }

    #[test]
    fn test_args_bounds() {
        let mut args = Args::EMPTY;
        assert!(args.store_arg(6, AmlValue::one()).is_ok());
        assert_eq!(args.store_arg(7, AmlValue::one()), Err(AmlError::InvalidArgAccess(7)));
        assert!(matches!(args.arg(0), Err(AmlError::InvalidArgAccess(0))));
        assert_eq!(args.arg(6).unwrap().as_integer().unwrap(), 1);
    }
}
