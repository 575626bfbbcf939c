//! `aml-exec` is a pure-Rust AML (ACPI Machine Language) execution engine,
//! used for running control methods from the DSDT and SSDT tables of ACPI.
//! Kernels use it to evaluate methods such as `_OSI`, device initializers,
//! and power-management handlers without tying themselves to any particular
//! platform's firmware quirks.
//!
//! ### Usage
//! Create an [`AmlContext`] with a [`Handler`] for your platform's memory,
//! port, and PCI access, feed it tables containing AML with
//! [`AmlContext::parse_table`], and invoke control methods by path: e.g.
//! ```ignore
//! let result = context.invoke_method(&AmlName::from_str("\\_SB.HPET._STA").unwrap(), Args::EMPTY)?;
//! ```
//!
//! ### About the engine
//! AML is a stack-less, prefix-opcoded bytecode. Rather than mirroring its
//! nesting with host-language recursion, the engine drives each method
//! activation from an explicit execution stack of tagged frames and an
//! operand stack of intermediate values (see the `exec` module). Control
//! flow (`If`/`While`/`Break`/`Continue`/`Return`) is expressed entirely as
//! frame manipulation, so deeply nested AML cannot exhaust the host stack;
//! only nested method *invocations* recurse, one host frame per activation.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod test_utils;

pub(crate) mod exec;
pub(crate) mod expression;
pub(crate) mod misc;
pub(crate) mod name_object;
pub mod namespace;
pub(crate) mod opcode;
pub(crate) mod opregion;
pub(crate) mod pkg_length;
pub(crate) mod state;
pub(crate) mod term_object;
pub mod value;

pub use crate::{
    namespace::{AmlName, Namespace},
    value::{AmlValue, Args},
};

use alloc::boxed::Box;
use log::{debug, error, warn};
use misc::{ArgNum, LocalNum};
use name_object::Target;
use namespace::MAX_NAME;
use state::CallState;
use value::{AmlType, MethodCode};

/// The value AML's `RevisionOp` evaluates to. It identifies the interpreter itself rather
/// than a version of the ACPI specification, and no firmware is known to depend on it.
pub const AML_INTERPRETER_REVISION: u64 = 0;

pub struct AmlContext {
    /// Platform access for operation regions and timing. Boxed so the handler type doesn't
    /// have to be threaded through the engine as a parameter.
    pub(crate) handler: Box<dyn Handler>,

    pub namespace: Namespace,

    /// The scope NameStrings are currently resolved against: the scope being
    /// populated during a table parse, or the executing method's path during
    /// an invocation.
    pub(crate) current_scope: AmlName,
}

impl AmlContext {
    /// Build a context around a platform `Handler`. A single context manages the whole
    /// namespace; feed it the DSDT and every SSDT before invoking control methods.
    pub fn new(handler: Box<dyn Handler>) -> AmlContext {
        let mut context =
            AmlContext { handler, namespace: Namespace::new(), current_scope: AmlName::root() };

        context.add_predefined_objects();
        context
    }

    /// Parse a table's AML byte stream, populating the namespace with the
    /// scopes, devices, methods, regions, and fields it declares.
    pub fn parse_table(&mut self, stream: &[u8]) -> Result<(), AmlError> {
        if stream.is_empty() {
            return Err(AmlError::UnexpectedEndOfStream);
        }

        /*
         * Data objects at the table level (region offsets, package contents)
         * are evaluated against a scratch activation; tables have no
         * arguments or locals.
         */
        let mut state = CallState::new(AmlName::root());
        let mut offset = 0;
        while offset < stream.len() {
            match term_object::parse_term_object(self, &mut state, &stream[offset..]) {
                Ok(consumed) => offset += consumed,
                Err(err) => {
                    error!("Failed to parse AML stream at offset {:#x}: {:?}", offset, err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Invoke the control method at `path` with the given arguments,
    /// returning its result. A method with no explicit `Return` yields
    /// `Integer(0)`.
    pub fn invoke_method(&mut self, path: &AmlName, args: Args) -> Result<AmlValue, AmlError> {
        match self.namespace.get_by_path(path)?.clone() {
            AmlValue::Method { flags: _, code } => match code {
                MethodCode::Aml(code) => {
                    /*
                     * Resolve names against the method's own scope while it
                     * runs, restoring the caller's scope afterwards so nested
                     * invocations resume correctly.
                     */
                    let old_scope = core::mem::replace(&mut self.current_scope, path.clone());

                    let mut state = CallState::new(path.clone());
                    state.args = args;
                    let result = exec::run_method(self, &mut state, &code);

                    self.current_scope = old_scope;

                    /*
                     * Names the method created under its own scope are
                     * destroyed on exit (§5.5.2.3 of the ACPI spec).
                     */
                    self.namespace.remove_level(path);

                    match result {
                        Ok(()) => Ok(state.retvalue.take()),
                        Err(err) => {
                            error!("Failed to execute control method {}: {:?}", path, err);
                            Err(err)
                        }
                    }
                }

                MethodCode::Native(method) => match method(self, &args) {
                    Ok(result) => Ok(result),
                    Err(err) => {
                        error!("Failed to execute control method {}: {:?}", path, err);
                        Err(err)
                    }
                },
            },

            /*
             * A name bound to a plain value is also invokable: tables encode trivial
             * methods (a fixed `_STA`, say) as the value itself, and evaluating one is
             * just a copy.
             */
            value => Ok(value),
        }
    }

    /// Read the object a `Target` currently refers to.
    pub(crate) fn read_target(&mut self, state: &CallState, target: &Target) -> Result<AmlValue, AmlError> {
        match target {
            Target::Null => Ok(AmlValue::Uninitialized),
            Target::Name(name) => {
                let path = self.namespace.search(name, &self.current_scope)?;
                match self.namespace.get_by_path(&path)?.type_of() {
                    AmlType::FieldUnit | AmlType::BufferField => opregion::read_field(self, &path),
                    _ => Ok(self.namespace.get_by_path(&path)?.clone()),
                }
            }
            Target::Debug => Ok(AmlValue::Uninitialized),
            Target::Arg(arg) => Ok(state.arg(*arg)?.clone()),
            Target::Local(local) => Ok(state.local(*local)?.clone()),
        }
    }

    /// Store a value through a `Target`, applying the implicit conversions of §19.3.5.8 of
    /// the ACPI spec. The value is returned as it ended up in the target: a store into a
    /// field unit can change it (truncation to the field width, update rules), so the
    /// caller must not assume the input survives unmodified.
    pub(crate) fn store(
        &mut self,
        state: &mut CallState,
        target: &Target,
        value: AmlValue,
    ) -> Result<AmlValue, AmlError> {
        match target {
            Target::Name(ref name) => {
                let path = self.namespace.search(name, &self.current_scope)?;

                match self.namespace.get_by_path(&path)?.type_of() {
                    AmlType::FieldUnit | AmlType::BufferField => {
                        opregion::write_field(self, &path, value)?;
                        opregion::read_field(self, &path)
                    }
                    typ => {
                        let converted = value.as_type(typ)?;
                        *self.namespace.get_by_path_mut(&path)? = converted;
                        Ok(self.namespace.get_by_path(&path)?.clone())
                    }
                }
            }

            Target::Debug => {
                debug!("Debug object <- {:?}", value);
                Ok(value)
            }

            // Arg and Local slots take the value as-is; no conversion applies.
            Target::Arg(arg) => {
                state.store_arg(*arg, value.clone())?;
                Ok(value)
            }

            Target::Local(local) => {
                state.store_local(*local, value.clone())?;
                Ok(value)
            }

            Target::Null => Ok(value),
        }
    }

    fn add_predefined_objects(&mut self) {
        /*
         * Firmware references the standard top-level scopes (`\_SB`, `\_GPE`, and friends)
         * without declaring them, so they have to exist before the first table is parsed.
         */
        self.namespace.add_value(AmlName::from_str("\\_GPE").unwrap(), AmlValue::Device).unwrap();
        self.namespace.add_value(AmlName::from_str("\\_SB").unwrap(), AmlValue::Device).unwrap();
        self.namespace.add_value(AmlName::from_str("\\_SI").unwrap(), AmlValue::Device).unwrap();
        self.namespace.add_value(AmlName::from_str("\\_PR").unwrap(), AmlValue::Device).unwrap();
        self.namespace.add_value(AmlName::from_str("\\_TZ").unwrap(), AmlValue::Device).unwrap();

        /*
         * `\_OS` is the ACPI 1.0 way for firmware to ask which OS it's running under.
         * Identifying as anything other than Windows sends tables down paths no vendor
         * ever exercised, so every mainstream kernel hands back the same Windows string.
         */
        self.namespace
            .add_value(AmlName::from_str("\\_OS").unwrap(), AmlValue::String("Microsoft Windows NT".into()))
            .unwrap();

        /*
         * `_OSI` superseded `\_OS` in ACPI 3.0 with per-capability queries, but in the
         * field it's used almost exclusively to probe for Windows releases. Accepting the
         * whole Windows list (and Darwin) keeps firmware on its best-tested behavior;
         * accepting "Linux" has historically broken machines, so that query gets a 'no'
         * and a logged warning.
         */
        self.namespace
            .add_value(
                AmlName::from_str("\\_OSI").unwrap(),
                AmlValue::native_method(1, |_context, args| {
                    // Windows releases from 2000 through 10 (19H1), spelled the way
                    // firmware queries them.
                    const WINDOWS_VERSIONS: &[&str] = &[
                        "Windows 2000",
                        "Windows 2001",
                        "Windows 2001 SP1",
                        "Windows 2001 SP2",
                        "Windows 2001.1",
                        "Windows 2001.1 SP1",
                        "Windows 2006",
                        "Windows 2006 SP1",
                        "Windows 2006 SP2",
                        "Windows 2006.1",
                        "Windows 2009",
                        "Windows 2012",
                        "Windows 2013",
                        "Windows 2015",
                        "Windows 2016",
                        "Windows 2017",
                        "Windows 2017.2",
                        "Windows 2018",
                        "Windows 2018.2",
                        "Windows 2019",
                    ];

                    let supported = match args.arg(0)?.as_string()? {
                        "Darwin" => true,
                        "Linux" => {
                            warn!("Firmware queried _OSI(\"Linux\"); answering 'not supported' to keep it on the Windows path.");
                            false
                        }
                        query => WINDOWS_VERSIONS.contains(&query),
                    };

                    // Support is the 32-bit all-ones value. Firmware compares against
                    // 0xFFFFFFFF even on systems with 64-bit integers.
                    Ok(if supported { AmlValue::Integer(0xffff_ffff) } else { AmlValue::zero() })
                }),
            )
            .unwrap();

        /*
         * `_REV` nominally reports which ACPI revision the interpreter implements, but
         * firmware abused honest answers to fingerprint the OS, so every modern
         * interpreter pins it at 2. So do we.
         */
        self.namespace.add_value(AmlName::from_str("\\_REV").unwrap(), AmlValue::Integer(2)).unwrap();
    }
}

/// The platform boundary. The embedder supplies one of these to give the engine access to
/// physical memory, port I/O, PCI configuration space, and timing; every operation-region
/// access and every `Sleep`/`Stall` in AML lands in one of its methods.
pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&mut self, address: usize, value: u8);
    fn write_u16(&mut self, address: usize, value: u16);
    fn write_u32(&mut self, address: usize, value: u32);
    fn write_u64(&mut self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u8;
    fn read_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u16;
    fn read_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u32;

    fn write_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u8);
    fn write_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u16);
    fn write_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u32);

    /// Busy-wait for at least `microseconds` without giving up the processor. AML is
    /// expected to keep stalls under 100us, so a spin loop is the right implementation.
    fn stall(&self, microseconds: u64);

    /// Block for at least `milliseconds`, yielding the processor in the meantime.
    /// Rounding up to the platform's timer granularity is fine.
    fn sleep(&self, milliseconds: u64);

    /// Called when AML executes a `Fatal` op, before the interpreter reports
    /// [`AmlError::FatalError`] to the caller.
    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        panic!(
            "AML executed a Fatal op: type={:#x}, code={:#x}, arg={:#x}",
            fatal_type, fatal_code, fatal_arg
        );
    }
}

/// Everything that can go wrong decoding, resolving, or executing AML. One activation's
/// error aborts that activation; there is no partial recovery.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AmlError {
    /*
     * Stream decoding.
     */
    UnexpectedEndOfStream,
    UnexpectedByte(u8),
    InvalidNameSeg,
    InvalidPkgLength,
    InvalidFieldFlags,
    UnterminatedStringConstant,
    InvalidStringConstant,
    InvalidRegionSpace(u8),
    /// Produced when a `DefPackage` contains more elements than its declared count (or more than
    /// [`value::MAX_PACKAGE_ENTRIES`]).
    MalformedPackage,
    /// A `DefBuffer`'s initializer is longer than its declared size.
    MalformedBuffer,
    /// AML executed a `Fatal` op. The details were delivered through
    /// [`Handler::handle_fatal_error`] before this was returned.
    FatalError,

    /*
     * Name handling.
     */
    EmptyNamesAreInvalid,
    /// Produced when a name exceeds [`MAX_NAME`] bytes once normalized.
    NameTooLong,
    /// Resolving a path walked above the namespace root (e.g. `\_SB.^^^PCI0`). Carries
    /// the offending name.
    InvalidNormalizedName(AmlName),
    RootHasNoParent,

    /*
     * Namespace lookups and declarations.
     */
    ValueDoesNotExist(AmlName),
    /// Two objects were declared at the same path.
    NameCollision(AmlName),

    /*
     * Method execution. All of these are fatal for the activation: they mean
     * either corrupt AML or an engine bug.
     */
    /// A method touched an argument slot it wasn't given (say, `Arg4` in a two-argument
    /// method). Carries the offending slot number.
    InvalidArgAccess(ArgNum),
    InvalidLocalAccess(LocalNum),
    /// More than 7 arguments were supplied to an invocation.
    TooManyArgs,
    /// The execution stack exceeded its fixed depth. Firmware methods never
    /// legitimately nest this deep.
    ExecutionStackOverflow,
    OperandStackOverflow,
    /// The operand stack held the wrong number of values at a method boundary
    /// (it must be empty at `Return`, and hold exactly the result afterwards).
    OperandStackNotEmpty,
    /// `Break` executed with no enclosing `While`.
    BreakInInvalidPosition,
    /// `Continue` executed with no enclosing `While`.
    ContinueInInvalidPosition,
    /// `Return` executed with no enclosing method activation.
    ReturnInInvalidPosition,
    /// A `DefElse` was encountered that no preceding `DefIfElse` claimed.
    ElseWithoutIf,
    /// An opcode reached the reducer that it has no rule for. This is an
    /// engine invariant violation, not a stream error.
    UnknownOpcode(u16),
    DivideByZero,

    /*
     * Value conversions and field access.
     */
    IncompatibleValueConversion {
        current: AmlType,
        target: AmlType,
    },
    /// `SizeOf` was applied to a value that has no size.
    InvalidSizeOfApplication(AmlType),
    FieldRegionIsNotOpRegion,
    FieldInvalidAddress,
    FieldInvalidAccessSize,
    BufferFieldIndexesOutOfBounds,

    /// Functionality the engine doesn't cover; reported as an error rather than aborting.
    Unimplemented,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_context;
    use alloc::vec;

    #[test]
    fn test_send_sync() {
        // Kernels move the context across threads behind a lock; it must stay Send + Sync.
        fn test_send_sync<T: Send + Sync>() {}
        test_send_sync::<AmlContext>();
    }

    #[test]
    fn test_osi_windows_string() {
        let mut context = make_context();
        let args = Args::from_list(vec![AmlValue::String("Windows 2015".into())]).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\_OSI").unwrap(), args).unwrap();
        assert_eq!(result.as_integer().unwrap(), 0xffff_ffff);
    }

    #[test]
    fn test_osi_linux_reports_no_support() {
        let mut context = make_context();
        let args = Args::from_list(vec![AmlValue::String("Linux".into())]).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\_OSI").unwrap(), args).unwrap();
        assert_eq!(result.as_integer().unwrap(), 0);
    }

    #[test]
    fn test_osi_unknown_string() {
        let mut context = make_context();
        let args = Args::from_list(vec![AmlValue::String("NotAnOS 3000".into())]).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\_OSI").unwrap(), args).unwrap();
        assert_eq!(result.as_integer().unwrap(), 0);
    }

    #[test]
    fn test_os_and_rev_objects() {
        let mut context = make_context();
        let os = context.invoke_method(&AmlName::from_str("\\_OS").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(os.as_string().unwrap(), "Microsoft Windows NT");

        let rev = context.invoke_method(&AmlName::from_str("\\_REV").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(rev.as_integer().unwrap(), 2);
    }

    #[test]
    fn test_parse_table_defines_invokable_method() {
        let mut context = make_context();
        // Method(GET5, 0) { Return(5) }
        let table = [
            0x14, // MethodOp
            0x09,
            b'G', b'E', b'T', b'5',
            0x00, // no arguments
            0xa4, // ReturnOp
            0x0a, 0x05, // BytePrefix 5
        ];
        context.parse_table(&table).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\GET5").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result.as_integer().unwrap(), 5);
    }

    #[test]
    fn test_parse_table_reports_garbage() {
        let mut context = make_context();
        assert_eq!(context.parse_table(&[0xfe, 0xfe]), Err(AmlError::UnexpectedByte(0xfe)));
        assert_eq!(context.parse_table(&[]), Err(AmlError::UnexpectedEndOfStream));
    }

    #[test]
    fn test_bare_value_invokes_as_constant_method() {
        let mut context = make_context();
        context.namespace.add_value(AmlName::from_str("\\_STA").unwrap(), AmlValue::Integer(0x0f)).unwrap();
        let result = context.invoke_method(&AmlName::from_str("\\_STA").unwrap(), Args::EMPTY).unwrap();
        assert_eq!(result.as_integer().unwrap(), 0x0f);
    }
}
