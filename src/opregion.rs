//! Operation Region field access. Field units name a bit range within an
//! operation region; reads and writes go through the [`Handler`] for the
//! region's address space. Index fields are accessed indirectly by writing
//! a byte offset to an index register field and transferring through a data
//! register field.

use crate::{
    namespace::AmlName,
    value::{AmlValue, FieldAccessType, FieldFlags, FieldUpdateRule, RegionSpace},
    AmlContext, AmlError,
};
use bit_field::BitField;

/// Read the field unit at `path`, returning its value as an integer object.
pub(crate) fn read_field(context: &mut AmlContext, path: &AmlName) -> Result<AmlValue, AmlError> {
    let field = context.namespace.get_by_path(path)?.clone();
    match field {
        AmlValue::Field { region, flags, offset, length } => {
            let (space, address) = region_address(context, &region, offset, length)?;
            let width = access_width_bits(flags, length)?;
            let shift = (offset % 8) as usize;
            if shift as u64 + length > width {
                return Err(AmlError::FieldInvalidAccessSize);
            }
            let raw = read_raw(context, space, address, width)?;
            Ok(AmlValue::Integer(raw.get_bits(shift..shift + length as usize)))
        }
        AmlValue::IndexField { index, data, flags, offset, length } => {
            read_indexed_field(context, &index, &data, flags, offset / 8, length)
        }
        AmlValue::BufferField { buffer, offset, length } => {
            let value = match context.namespace.get_by_path(&buffer)? {
                AmlValue::Buffer(bytes) => buffer_get_bits(bytes, offset, length)?,
                other => {
                    return Err(AmlError::IncompatibleValueConversion {
                        current: other.type_of(),
                        target: crate::value::AmlType::Buffer,
                    })
                }
            };
            Ok(AmlValue::Integer(value))
        }
        other => Err(AmlError::IncompatibleValueConversion {
            current: other.type_of(),
            target: crate::value::AmlType::FieldUnit,
        }),
    }
}

/// Write `value` to the field unit at `path`, honoring the field's update
/// rule for the bits around it.
pub(crate) fn write_field(context: &mut AmlContext, path: &AmlName, value: AmlValue) -> Result<(), AmlError> {
    let field = context.namespace.get_by_path(path)?.clone();
    match field {
        AmlValue::Field { region, flags, offset, length } => {
            let (space, address) = region_address(context, &region, offset, length)?;
            let width = access_width_bits(flags, length)?;
            if (offset % 8) + length > width {
                return Err(AmlError::FieldInvalidAccessSize);
            }

            let mut merged = match flags.field_update_rule()? {
                FieldUpdateRule::Preserve => read_raw(context, space, address, width)?,
                FieldUpdateRule::WriteAsOnes => u64::MAX,
                FieldUpdateRule::WriteAsZeros => 0,
            };
            let shift = (offset % 8) as usize;
            merged.set_bits(shift..shift + length as usize, value.as_integer()?.get_bits(0..length as usize));
            write_raw(context, space, address, width, merged)
        }
        AmlValue::IndexField { index, data, flags, offset, length } => {
            write_indexed_field(context, &index, &data, flags, offset / 8, length, value)
        }
        AmlValue::BufferField { buffer, offset, length } => {
            let raw = value.as_integer()?;
            match context.namespace.get_by_path_mut(&buffer)? {
                AmlValue::Buffer(bytes) => buffer_set_bits(bytes, offset, length, raw),
                other => Err(AmlError::IncompatibleValueConversion {
                    current: other.type_of(),
                    target: crate::value::AmlType::Buffer,
                }),
            }
        }
        other => Err(AmlError::IncompatibleValueConversion {
            current: other.type_of(),
            target: crate::value::AmlType::FieldUnit,
        }),
    }
}

/// Resolve a field's region and compute the byte address of the access that
/// covers the field's bit range.
fn region_address(
    context: &AmlContext,
    region: &AmlName,
    bit_offset: u64,
    bit_length: u64,
) -> Result<(RegionSpace, u64), AmlError> {
    match context.namespace.get_by_path(region)? {
        AmlValue::OpRegion { region: space, offset, length } => {
            if bit_offset + bit_length > length * 8 {
                return Err(AmlError::FieldInvalidAddress);
            }
            Ok((*space, offset + bit_offset / 8))
        }
        _ => Err(AmlError::FieldRegionIsNotOpRegion),
    }
}

/// The width of the access used to reach a field: the larger of the
/// region's minimum access size and the field length rounded up to a power
/// of two.
fn access_width_bits(flags: FieldFlags, length: u64) -> Result<u64, AmlError> {
    let minimum = match flags.access_type()? {
        FieldAccessType::Any => 8,
        FieldAccessType::Byte => 8,
        FieldAccessType::Word => 16,
        FieldAccessType::DWord => 32,
        FieldAccessType::QWord => 64,
        FieldAccessType::Buffer => 8,
    };
    let width = u64::max(minimum, length.next_power_of_two());
    if width > 64 {
        return Err(AmlError::FieldInvalidAccessSize);
    }
    Ok(width)
}

fn read_raw(context: &mut AmlContext, space: RegionSpace, address: u64, width: u64) -> Result<u64, AmlError> {
    match space {
        RegionSpace::SystemMemory => {
            let address = address as usize;
            Ok(match width {
                8 => context.handler.read_u8(address) as u64,
                16 => context.handler.read_u16(address) as u64,
                32 => context.handler.read_u32(address) as u64,
                64 => context.handler.read_u64(address),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            })
        }
        RegionSpace::SystemIo => {
            let port = address as u16;
            Ok(match width {
                8 => context.handler.read_io_u8(port) as u64,
                16 => context.handler.read_io_u16(port) as u64,
                32 => context.handler.read_io_u32(port) as u64,
                _ => return Err(AmlError::FieldInvalidAccessSize),
            })
        }
        RegionSpace::PciConfig => {
            let offset = address as u16;
            Ok(match width {
                8 => context.handler.read_pci_u8(0, 0, 0, 0, offset) as u64,
                16 => context.handler.read_pci_u16(0, 0, 0, 0, offset) as u64,
                32 => context.handler.read_pci_u32(0, 0, 0, 0, offset) as u64,
                _ => return Err(AmlError::FieldInvalidAccessSize),
            })
        }
        _ => Err(AmlError::Unimplemented),
    }
}

fn write_raw(
    context: &mut AmlContext,
    space: RegionSpace,
    address: u64,
    width: u64,
    value: u64,
) -> Result<(), AmlError> {
    match space {
        RegionSpace::SystemMemory => {
            let address = address as usize;
            match width {
                8 => context.handler.write_u8(address, value as u8),
                16 => context.handler.write_u16(address, value as u16),
                32 => context.handler.write_u32(address, value as u32),
                64 => context.handler.write_u64(address, value),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            }
            Ok(())
        }
        RegionSpace::SystemIo => {
            let port = address as u16;
            match width {
                8 => context.handler.write_io_u8(port, value as u8),
                16 => context.handler.write_io_u16(port, value as u16),
                32 => context.handler.write_io_u32(port, value as u32),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            }
            Ok(())
        }
        RegionSpace::PciConfig => {
            let offset = address as u16;
            match width {
                8 => context.handler.write_pci_u8(0, 0, 0, 0, offset, value as u8),
                16 => context.handler.write_pci_u16(0, 0, 0, 0, offset, value as u16),
                32 => context.handler.write_pci_u32(0, 0, 0, 0, offset, value as u32),
                _ => return Err(AmlError::FieldInvalidAccessSize),
            }
            Ok(())
        }
        _ => Err(AmlError::Unimplemented),
    }
}

fn read_indexed_field(
    context: &mut AmlContext,
    index: &AmlName,
    data: &AmlName,
    flags: FieldFlags,
    byte_offset: u64,
    length: u64,
) -> Result<AmlValue, AmlError> {
    let access_bytes = access_width_bits(flags, length)? / 8;

    let mut result = 0u64;
    for i in 0..access_bytes {
        // Select the byte through the index register, then read it back
        // through the data register.
        write_field(context, index, AmlValue::Integer(byte_offset + i))?;
        let byte = read_field(context, data)?.as_integer()?;
        result |= (byte & 0xff) << (i * 8);
    }
    Ok(AmlValue::Integer(result.get_bits(0..length as usize)))
}

fn write_indexed_field(
    context: &mut AmlContext,
    index: &AmlName,
    data: &AmlName,
    flags: FieldFlags,
    byte_offset: u64,
    length: u64,
    value: AmlValue,
) -> Result<(), AmlError> {
    let mut merged = match flags.field_update_rule()? {
        FieldUpdateRule::Preserve => {
            read_indexed_field(context, index, data, flags, byte_offset, length)?.as_integer()?
        }
        FieldUpdateRule::WriteAsOnes => u64::MAX,
        FieldUpdateRule::WriteAsZeros => 0,
    };
    merged.set_bits(0..length as usize, value.as_integer()?.get_bits(0..length as usize));

    let access_bytes = access_width_bits(flags, length)? / 8;
    for i in 0..access_bytes {
        write_field(context, index, AmlValue::Integer(byte_offset + i))?;
        write_field(context, data, AmlValue::Integer((merged >> (i * 8)) & 0xff))?;
    }
    Ok(())
}

fn buffer_get_bits(buffer: &[u8], bit_offset: u64, bit_length: u64) -> Result<u64, AmlError> {
    if bit_offset + bit_length > buffer.len() as u64 * 8 || bit_length > 64 {
        return Err(AmlError::BufferFieldIndexesOutOfBounds);
    }
    let mut value = 0u64;
    for i in 0..bit_length {
        let bit = bit_offset + i;
        if buffer[(bit / 8) as usize].get_bit((bit % 8) as usize) {
            value |= 1u64 << i;
        }
    }
    Ok(value)
}

fn buffer_set_bits(buffer: &mut [u8], bit_offset: u64, bit_length: u64, value: u64) -> Result<(), AmlError> {
    if bit_offset + bit_length > buffer.len() as u64 * 8 || bit_length > 64 {
        return Err(AmlError::BufferFieldIndexesOutOfBounds);
    }
    for i in 0..bit_length {
        let bit = bit_offset + i;
        buffer[(bit / 8) as usize].set_bit((bit % 8) as usize, value.get_bit(i as usize));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_context;
    use crate::value::AmlType;
    use alloc::vec;

    fn setup_io_field(context: &mut AmlContext) -> AmlName {
        let region = AmlName::from_str("\\GPIO").unwrap();
        context
            .namespace
            .add_value(region.clone(), AmlValue::OpRegion { region: RegionSpace::SystemIo, offset: 0x40, length: 4 })
            .unwrap();
        let field = AmlName::from_str("\\CTL_").unwrap();
        context
            .namespace
            .add_value(
                field.clone(),
                AmlValue::Field { region, flags: FieldFlags::new(0x01), offset: 0, length: 8 },
            )
            .unwrap();
        field
    }

    #[test]
    fn test_io_field_round_trip() {
        let mut context = make_context();
        let field = setup_io_field(&mut context);

        write_field(&mut context, &field, AmlValue::Integer(0xab)).unwrap();
        let value = read_field(&mut context, &field).unwrap();
        assert_eq!(value.as_integer().unwrap(), 0xab);
    }

    #[test]
    fn test_sub_byte_field_preserves_neighbours() {
        let mut context = make_context();
        let region = AmlName::from_str("\\GPIO").unwrap();
        context
            .namespace
            .add_value(region.clone(), AmlValue::OpRegion { region: RegionSpace::SystemIo, offset: 0x40, length: 4 })
            .unwrap();
        let low = AmlName::from_str("\\LOW_").unwrap();
        let high = AmlName::from_str("\\HIGH").unwrap();
        context
            .namespace
            .add_value(
                low.clone(),
                AmlValue::Field { region: region.clone(), flags: FieldFlags::new(0x01), offset: 0, length: 4 },
            )
            .unwrap();
        context
            .namespace
            .add_value(high.clone(), AmlValue::Field { region, flags: FieldFlags::new(0x01), offset: 4, length: 4 })
            .unwrap();

        write_field(&mut context, &low, AmlValue::Integer(0x5)).unwrap();
        write_field(&mut context, &high, AmlValue::Integer(0xa)).unwrap();
        assert_eq!(read_field(&mut context, &low).unwrap().as_integer().unwrap(), 0x5);
        assert_eq!(read_field(&mut context, &high).unwrap().as_integer().unwrap(), 0xa);
    }

    #[test]
    fn test_field_out_of_region_bounds() {
        let mut context = make_context();
        let region = AmlName::from_str("\\GPIO").unwrap();
        context
            .namespace
            .add_value(region.clone(), AmlValue::OpRegion { region: RegionSpace::SystemIo, offset: 0x40, length: 1 })
            .unwrap();
        let field = AmlName::from_str("\\BAD_").unwrap();
        context
            .namespace
            .add_value(field.clone(), AmlValue::Field { region, flags: FieldFlags::new(0x01), offset: 8, length: 8 })
            .unwrap();
        assert_eq!(read_field(&mut context, &field).unwrap_err(), AmlError::FieldInvalidAddress);
    }

    #[test]
    fn test_buffer_field_round_trip() {
        let mut context = make_context();
        let buffer = AmlName::from_str("\\BUF_").unwrap();
        context.namespace.add_value(buffer.clone(), AmlValue::Buffer(vec![0u8; 4])).unwrap();
        let field = AmlName::from_str("\\BF16").unwrap();
        context
            .namespace
            .add_value(field.clone(), AmlValue::BufferField { buffer: buffer.clone(), offset: 8, length: 16 })
            .unwrap();

        write_field(&mut context, &field, AmlValue::Integer(0xbeef)).unwrap();
        assert_eq!(read_field(&mut context, &field).unwrap().as_integer().unwrap(), 0xbeef);
        match context.namespace.get_by_path(&buffer).unwrap() {
            AmlValue::Buffer(bytes) => assert_eq!(bytes, &vec![0x00, 0xef, 0xbe, 0x00]),
            other => panic!("expected buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_read_field_rejects_non_field() {
        let mut context = make_context();
        let name = AmlName::from_str("\\INT_").unwrap();
        context.namespace.add_value(name.clone(), AmlValue::Integer(1)).unwrap();
        assert_eq!(
            read_field(&mut context, &name).unwrap_err(),
            AmlError::IncompatibleValueConversion { current: AmlType::Integer, target: AmlType::FieldUnit }
        );
    }
}
