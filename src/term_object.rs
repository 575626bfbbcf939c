//! Declarative term objects: the constructs that populate the namespace
//! rather than compute values. The table loader walks these at load time,
//! and the execution engine delegates here when a method body declares
//! names, packages, or buffer fields at run time.

use crate::{
    expression, name_object,
    namespace::AmlName,
    opcode,
    pkg_length::{self, PkgLength},
    state::CallState,
    value::{AmlType, AmlValue, FieldFlags, MethodCode, MethodFlags, RegionSpace, MAX_PACKAGE_ENTRIES},
    AmlContext, AmlError,
};
use alloc::{string::String, vec::Vec};
use log::debug;

/// Parse a `DefPackage` body (after the PackageOp byte): PkgLength, an
/// element count, then the elements. Elements past the encoded initializers
/// are left `Uninitialized`. Returns the elements and bytes consumed.
pub fn parse_package(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<(Vec<AmlValue>, usize), AmlError> {
    let pkg = pkg_length::parse_pkg_length(stream)?;
    let body_end = pkg.end_offset(0);
    if body_end > stream.len() {
        return Err(AmlError::UnexpectedEndOfStream);
    }

    let mut offset = pkg.consumed;
    if offset >= body_end {
        return Err(AmlError::MalformedPackage);
    }
    let num_elements = stream[offset] as usize;
    offset += 1;

    if num_elements > MAX_PACKAGE_ENTRIES {
        return Err(AmlError::MalformedPackage);
    }

    let mut elements = Vec::with_capacity(num_elements);
    while offset < body_end {
        if elements.len() == num_elements {
            return Err(AmlError::MalformedPackage);
        }
        let first = stream[offset];
        /*
         * Names inside packages are references, not invocations. They're kept
         * as strings and resolved when the package is consumed.
         */
        if opcode::is_name_string_start(first) {
            let (name, consumed) = name_object::parse_name_string(&stream[offset..])?;
            elements.push(AmlValue::String(name.as_str().into()));
            offset += consumed;
        } else {
            let (value, consumed) = expression::eval_operand(context, state, &stream[offset..body_end])?;
            elements.push(value);
            offset += consumed;
        }
    }

    elements.resize(num_elements, AmlValue::Uninitialized);
    Ok((elements, body_end))
}

/// Parse a `DefName` (after the NameOp byte): NameString + DataRefObject.
/// The new name is created under the current scope. Returns bytes consumed.
pub fn parse_name_op(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<usize, AmlError> {
    let (name, mut offset) = name_object::parse_name_string(stream)?;
    let (value, consumed) = expression::eval_operand(context, state, &stream[offset..])?;
    offset += consumed;

    let path = name.resolve(&context.current_scope)?;
    context.namespace.add_value(path, value)?;
    Ok(offset)
}

/// Parse one of the `CreateByteField`/`CreateWordField`/`CreateDWordField`
/// ops (after the opcode byte): SourceBuf ByteIndex NameString. The source
/// must be a named buffer. Returns bytes consumed.
pub fn parse_create_field(
    context: &mut AmlContext,
    state: &mut CallState,
    op: u8,
    stream: &[u8],
) -> Result<usize, AmlError> {
    let num_bits = match op {
        opcode::CREATE_BYTE_FIELD_OP => 8,
        opcode::CREATE_WORD_FIELD_OP => 16,
        opcode::CREATE_DWORD_FIELD_OP => 32,
        byte => return Err(AmlError::UnexpectedByte(byte)),
    };

    let first = *stream.first().ok_or(AmlError::UnexpectedEndOfStream)?;
    if !opcode::is_name_string_start(first) {
        // The buffer lives in an Arg/Local slot; there is no name to bind
        // the field to.
        return Err(AmlError::Unimplemented);
    }
    let (source, mut offset) = name_object::parse_name_string(stream)?;
    let buffer = context.namespace.search(&source, &context.current_scope)?;
    let source_type = context.namespace.get_by_path(&buffer)?.type_of();
    if source_type != AmlType::Buffer {
        return Err(AmlError::IncompatibleValueConversion { current: source_type, target: AmlType::Buffer });
    }

    let (index, consumed) = expression::eval_operand(context, state, &stream[offset..])?;
    offset += consumed;
    let (name, consumed) = name_object::parse_name_string(&stream[offset..])?;
    offset += consumed;

    let path = name.resolve(&context.current_scope)?;
    context.namespace.add_value(
        path,
        AmlValue::BufferField { buffer, offset: index.as_integer()? * 8, length: num_bits },
    )?;
    Ok(offset)
}

/// Walk a term list of declarative objects, populating the namespace. This
/// is the load-time path for DSDT/SSDT images; `state` is a scratch
/// activation used to evaluate data objects (region offsets, package
/// elements).
pub(crate) fn parse_term_list(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<(), AmlError> {
    let mut offset = 0;
    while offset < stream.len() {
        offset += parse_term_object(context, state, &stream[offset..])?;
    }
    Ok(())
}

pub(crate) fn parse_term_object(
    context: &mut AmlContext,
    state: &mut CallState,
    stream: &[u8],
) -> Result<usize, AmlError> {
    let first = *stream.first().ok_or(AmlError::UnexpectedEndOfStream)?;
    match first {
        opcode::SCOPE_OP => {
            let (pkg, name, offset) = parse_pkg_and_name(&stream[1..])?;
            let path = name.resolve(&context.current_scope)?;
            let body_end = pkg.end_offset(0);

            let old_scope = core::mem::replace(&mut context.current_scope, path);
            let result = parse_term_list(context, state, &stream[1 + offset..1 + body_end]);
            context.current_scope = old_scope;
            result?;
            Ok(1 + body_end)
        }

        opcode::METHOD_OP => {
            let (pkg, name, offset) = parse_pkg_and_name(&stream[1..])?;
            let body_end = pkg.end_offset(0);
            let flags = *stream.get(1 + offset).ok_or(AmlError::UnexpectedEndOfStream)?;
            let body = stream.get(1 + offset + 1..1 + body_end).ok_or(AmlError::UnexpectedEndOfStream)?;

            let path = name.resolve(&context.current_scope)?;
            debug!("Defining method {} ({} bytes of AML)", path, body.len());
            context.namespace.add_value(
                path,
                AmlValue::Method { flags: MethodFlags::from_byte(flags), code: MethodCode::Aml(body.to_vec()) },
            )?;
            Ok(1 + body_end)
        }

        opcode::NAME_OP => Ok(1 + parse_name_op(context, state, &stream[1..])?),

        opcode::CREATE_BYTE_FIELD_OP | opcode::CREATE_WORD_FIELD_OP | opcode::CREATE_DWORD_FIELD_OP => {
            Ok(1 + parse_create_field(context, state, first, &stream[1..])?)
        }

        opcode::NOOP_OP => Ok(1),

        opcode::EXT_OPCODE_PREFIX => {
            let second = *stream.get(1).ok_or(AmlError::UnexpectedEndOfStream)?;
            match second {
                opcode::EXT_DEVICE_OP => {
                    let (pkg, name, offset) = parse_pkg_and_name(&stream[2..])?;
                    let path = name.resolve(&context.current_scope)?;
                    let body_end = pkg.end_offset(0);
                    context.namespace.add_value(path.clone(), AmlValue::Device)?;

                    let old_scope = core::mem::replace(&mut context.current_scope, path);
                    let result = parse_term_list(context, state, &stream[2 + offset..2 + body_end]);
                    context.current_scope = old_scope;
                    result?;
                    Ok(2 + body_end)
                }

                opcode::EXT_PROCESSOR_OP => {
                    let (pkg, name, offset) = parse_pkg_and_name(&stream[2..])?;
                    let path = name.resolve(&context.current_scope)?;
                    let body_end = pkg.end_offset(0);
                    // ProcID (1) + PblkAddr (4) + PblkLen (1)
                    if offset + 6 > body_end {
                        return Err(AmlError::UnexpectedEndOfStream);
                    }
                    context.namespace.add_value(path.clone(), AmlValue::Device)?;

                    let old_scope = core::mem::replace(&mut context.current_scope, path);
                    let result = parse_term_list(context, state, &stream[2 + offset + 6..2 + body_end]);
                    context.current_scope = old_scope;
                    result?;
                    Ok(2 + body_end)
                }

                opcode::EXT_OP_REGION_OP => {
                    let (name, mut offset) = name_object::parse_name_string(&stream[2..])?;
                    let space = *stream.get(2 + offset).ok_or(AmlError::UnexpectedEndOfStream)?;
                    offset += 1;
                    let (region_offset, consumed) = expression::eval_operand(context, state, &stream[2 + offset..])?;
                    offset += consumed;
                    let (length, consumed) = expression::eval_operand(context, state, &stream[2 + offset..])?;
                    offset += consumed;

                    let path = name.resolve(&context.current_scope)?;
                    context.namespace.add_value(
                        path,
                        AmlValue::OpRegion {
                            region: RegionSpace::from_byte(space)?,
                            offset: region_offset.as_integer()?,
                            length: length.as_integer()?,
                        },
                    )?;
                    Ok(2 + offset)
                }

                opcode::EXT_FIELD_OP => {
                    let (pkg, region, offset) = parse_pkg_and_name(&stream[2..])?;
                    let body_end = pkg.end_offset(0);
                    if offset + 1 > body_end {
                        return Err(AmlError::UnexpectedEndOfStream);
                    }
                    let flags = stream[2 + offset];
                    let region = context.namespace.search(&region, &context.current_scope)?;

                    parse_field_list(context, &stream[2 + offset + 1..2 + body_end], flags, |flags, offset, length| {
                        AmlValue::Field { region: region.clone(), flags, offset, length }
                    })?;
                    Ok(2 + body_end)
                }

                opcode::EXT_INDEX_FIELD_OP => {
                    let pkg = pkg_length::parse_pkg_length(&stream[2..])?;
                    let body_end = pkg.end_offset(0);
                    if 2 + body_end > stream.len() {
                        return Err(AmlError::UnexpectedEndOfStream);
                    }
                    let mut offset = pkg.consumed;
                    let (index, consumed) = name_object::parse_name_string(&stream[2 + offset..])?;
                    offset += consumed;
                    let (data, consumed) = name_object::parse_name_string(&stream[2 + offset..])?;
                    offset += consumed;
                    if offset + 1 > body_end {
                        return Err(AmlError::UnexpectedEndOfStream);
                    }
                    let flags = stream[2 + offset];

                    let index = context.namespace.search(&index, &context.current_scope)?;
                    let data = context.namespace.search(&data, &context.current_scope)?;

                    parse_field_list(context, &stream[2 + offset + 1..2 + body_end], flags, |flags, offset, length| {
                        AmlValue::IndexField { index: index.clone(), data: data.clone(), flags, offset, length }
                    })?;
                    Ok(2 + body_end)
                }

                opcode::EXT_MUTEX_OP => {
                    let (name, offset) = name_object::parse_name_string(&stream[2..])?;
                    let sync_level = *stream.get(2 + offset).ok_or(AmlError::UnexpectedEndOfStream)?;
                    let path = name.resolve(&context.current_scope)?;
                    context.namespace.add_value(path, AmlValue::Mutex { sync_level: sync_level & 0x0f })?;
                    Ok(2 + offset + 1)
                }

                byte => Err(AmlError::UnexpectedByte(byte)),
            }
        }

        byte => Err(AmlError::UnexpectedByte(byte)),
    }
}

/// PkgLength followed by a NameString, the common header of most named
/// objects. The returned offset counts from the PkgLength's first byte.
fn parse_pkg_and_name(stream: &[u8]) -> Result<(PkgLength, AmlName, usize), AmlError> {
    let pkg = pkg_length::parse_pkg_length(stream)?;
    if pkg.end_offset(0) > stream.len() {
        return Err(AmlError::UnexpectedEndOfStream);
    }
    let (name, consumed) = name_object::parse_name_string(&stream[pkg.consumed..])?;
    if pkg.consumed + consumed > pkg.end_offset(0) {
        return Err(AmlError::UnexpectedEndOfStream);
    }
    Ok((pkg, name, pkg.consumed + consumed))
}

/// Walk a FieldList, handing each named element to `make_field` to build
/// the namespace value. Bit offsets accumulate across elements.
fn parse_field_list(
    context: &mut AmlContext,
    stream: &[u8],
    flags: u8,
    make_field: impl Fn(FieldFlags, u64, u64) -> AmlValue,
) -> Result<(), AmlError> {
    let mut flags = FieldFlags::new(flags);
    let mut bit_offset = 0u64;
    let mut offset = 0;

    while offset < stream.len() {
        match stream[offset] {
            // ReservedField: a gap of PkgLength bits.
            0x00 => {
                let pkg = pkg_length::parse_pkg_length(&stream[offset + 1..])?;
                bit_offset += pkg.raw_length as u64;
                offset += 1 + pkg.consumed;
            }
            // AccessField: changes the access type for following elements.
            0x01 => {
                let access_type = *stream.get(offset + 1).ok_or(AmlError::UnexpectedEndOfStream)?;
                let _access_attrib = *stream.get(offset + 2).ok_or(AmlError::UnexpectedEndOfStream)?;
                flags = FieldFlags::new((access_type & 0x0f) | (flags.raw() & 0xf0));
                offset += 3;
            }
            _ => {
                let mut name = String::new();
                let seg = stream.get(offset..offset + 4).ok_or(AmlError::UnexpectedEndOfStream)?;
                name_object::parse_name_seg(seg, &mut name)?;
                offset += 4;
                let pkg = pkg_length::parse_pkg_length(&stream[offset..])?;
                let length = pkg.raw_length as u64;
                offset += pkg.consumed;

                let path = AmlName::from_str(&name)?.resolve(&context.current_scope)?;
                context.namespace.add_value(path, make_field(flags, bit_offset, length))?;
                bit_offset += length;
            }
        }
    }
    Ok(())
}
