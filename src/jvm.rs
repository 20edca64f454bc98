//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! Only the subset of the class file format the interpreter consumes is
//! decoded into structured form: the constant pool, field and method
//! tables, `Code`, `ConstantValue` and `BootstrapMethods` attributes.
//! Everything else is skipped by length. The input is trusted, so a
//! malformed file is reported as an error rather than recovered from.
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};

use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};

pub const ACC_STATIC: u16 = 0x0008;

const MAGIC: u32 = 0xcafe_babe;

/// Entry in the constant pool, tagged per the class file format.
#[derive(Debug, Clone, PartialEq)]
pub enum CPInfo {
    ConstantUtf8 {
        bytes: String,
    },
    ConstantInteger {
        bytes: i32,
    },
    ConstantFloat {
        bytes: f32,
    },
    /// Longs and doubles are stored as their raw 64-bit pair.
    ConstantLongOrDouble {
        high_bytes: u32,
        low_bytes: u32,
    },
    ConstantClass {
        name_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantMethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    ConstantMethodType {
        descriptor_index: u16,
    },
    ConstantInvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    /// Second slot of a long or double entry, never addressed directly.
    Unusable,
}

/// Symbolic reference to a field or method, resolved from a
/// `Fieldref`/`Methodref` constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub class_name: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

/// Per-class table of symbolic and immediate values, addressed by 1-based
/// index. Read-only once the class is loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    entries: Vec<CPInfo>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, returning its 1-based index.
    pub fn push(&mut self, entry: CPInfo) -> u16 {
        self.entries.push(entry);
        self.entries.len() as u16
    }

    /// Returns the entry at a 1-based index.
    pub fn get(&self, index: u16) -> Result<&CPInfo> {
        index
            .checked_sub(1)
            .and_then(|i| self.entries.get(i as usize))
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::InvalidConstantIndex(index)))
    }

    /// Decodes a UTF-8 constant.
    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CPInfo::ConstantUtf8 { bytes } => Ok(bytes),
            _ => Err(self.unexpected(index, "Utf8")),
        }
    }

    /// Resolves a `Class` constant to the class name it refers to.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            CPInfo::ConstantClass { name_index } => self.utf8(*name_index),
            _ => Err(self.unexpected(index, "Class")),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            CPInfo::ConstantNameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(self.unexpected(index, "NameAndType")),
        }
    }

    /// Translates a `Methodref` index into its (class, name, descriptor)
    /// triple.
    pub fn method_ref(&self, index: u16) -> Result<MemberRef> {
        match self.get(index)? {
            CPInfo::ConstantMethodRef {
                class_index,
                name_and_type_index,
            }
            | CPInfo::ConstantInterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => self.member_ref(*class_index, *name_and_type_index),
            _ => Err(self.unexpected(index, "Methodref")),
        }
    }

    /// Translates a `Fieldref` index into its (class, name, descriptor)
    /// triple.
    pub fn field_ref(&self, index: u16) -> Result<MemberRef> {
        match self.get(index)? {
            CPInfo::ConstantFieldRef {
                class_index,
                name_and_type_index,
            } => self.member_ref(*class_index, *name_and_type_index),
            _ => Err(self.unexpected(index, "Fieldref")),
        }
    }

    /// Reassembles a long or double constant from its 64-bit pair.
    pub fn long_or_double(&self, index: u16) -> Result<i64> {
        match self.get(index)? {
            CPInfo::ConstantLongOrDouble {
                high_bytes,
                low_bytes,
            } => Ok(((u64::from(*high_bytes) << 32) | u64::from(*low_bytes)) as i64),
            _ => Err(self.unexpected(index, "Long")),
        }
    }

    pub fn method_handle(&self, index: u16) -> Result<(u8, u16)> {
        match self.get(index)? {
            CPInfo::ConstantMethodHandle {
                reference_kind,
                reference_index,
            } => Ok((*reference_kind, *reference_index)),
            _ => Err(self.unexpected(index, "MethodHandle")),
        }
    }

    /// Returns the (bootstrap method attribute index, name and type index)
    /// pair of an `InvokeDynamic` constant.
    pub fn invoke_dynamic(&self, index: u16) -> Result<(u16, u16)> {
        match self.get(index)? {
            CPInfo::ConstantInvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => Ok((*bootstrap_method_attr_index, *name_and_type_index)),
            _ => Err(self.unexpected(index, "InvokeDynamic")),
        }
    }

    fn member_ref(&self, class_index: u16, name_and_type_index: u16) -> Result<MemberRef> {
        let class_name = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Ok(MemberRef {
            class_name,
            name,
            descriptor,
        })
    }

    fn unexpected(&self, index: u16, expected: &'static str) -> RuntimeError {
        RuntimeError::new(RuntimeErrorKind::UnexpectedConstant { index, expected })
    }
}

/// `Code` attribute of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    /// `ConstantValue` attribute, present on final static fields.
    pub constant_value: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub code: Option<CodeAttribute>,
}

/// One entry of the `BootstrapMethods` class attribute, describing how to
/// materialize an `invokedynamic` call site.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapMethod {
    pub bootstrap_method_ref: u16,
    pub bootstrap_arguments: Vec<u16>,
}

/// Structured representation of a parsed class file.
#[derive(Debug, Clone, PartialEq)]
pub struct JVMClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
}

/// Reads a class file from disk into a byte buffer.
pub fn read_class_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|err| {
        RuntimeError::new(RuntimeErrorKind::ClassNotFound(format!(
            "{}: {}",
            path.display(),
            err
        )))
    })
}

/// Parser for JVM class files.
pub struct JVMParser;

impl JVMParser {
    pub fn parse(bytes: &[u8]) -> Result<JVMClassFile> {
        let mut reader = Cursor::new(bytes);
        let magic = read_u32(&mut reader)?;
        if magic != MAGIC {
            return Err(malformed(format!("bad magic number {magic:#x}")));
        }
        let minor_version = read_u16(&mut reader)?;
        let major_version = read_u16(&mut reader)?;

        let constant_pool = Self::parse_constant_pool(&mut reader)?;

        let access_flags = read_u16(&mut reader)?;
        let this_class = read_u16(&mut reader)?;
        let super_class = read_u16(&mut reader)?;

        let interfaces_count = read_u16(&mut reader)?;
        for _ in 0..interfaces_count {
            let _interface_index = read_u16(&mut reader)?;
        }

        let fields_count = read_u16(&mut reader)?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let access_flags = read_u16(&mut reader)?;
            let name_index = read_u16(&mut reader)?;
            let descriptor_index = read_u16(&mut reader)?;
            let attributes = Self::parse_attributes(&mut reader, &constant_pool)?;
            fields.push(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                constant_value: attributes.constant_value,
            });
        }

        let methods_count = read_u16(&mut reader)?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let access_flags = read_u16(&mut reader)?;
            let name_index = read_u16(&mut reader)?;
            let descriptor_index = read_u16(&mut reader)?;
            let attributes = Self::parse_attributes(&mut reader, &constant_pool)?;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                code: attributes.code,
            });
        }

        let attributes = Self::parse_attributes(&mut reader, &constant_pool)?;

        Ok(JVMClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            fields,
            methods,
            bootstrap_methods: attributes.bootstrap_methods,
        })
    }

    fn parse_constant_pool(reader: &mut Cursor<&[u8]>) -> Result<ConstantPool> {
        let constant_pool_count = read_u16(reader)?;
        let mut pool = ConstantPool::new();
        // Indices run from 1 to count - 1; longs and doubles occupy two
        // slots each.
        let mut index = 1;
        while index < constant_pool_count {
            let tag = read_u8(reader)?;
            let entry = match tag {
                1 => {
                    let length = read_u16(reader)?;
                    let mut buffer = vec![0u8; length as usize];
                    reader
                        .read_exact(&mut buffer)
                        .map_err(|_| malformed("truncated Utf8 constant".to_string()))?;
                    let bytes = String::from_utf8(buffer)
                        .map_err(|_| malformed("invalid Utf8 constant".to_string()))?;
                    CPInfo::ConstantUtf8 { bytes }
                }
                3 => CPInfo::ConstantInteger {
                    bytes: read_u32(reader)? as i32,
                },
                4 => CPInfo::ConstantFloat {
                    bytes: f32::from_bits(read_u32(reader)?),
                },
                5 | 6 => CPInfo::ConstantLongOrDouble {
                    high_bytes: read_u32(reader)?,
                    low_bytes: read_u32(reader)?,
                },
                7 => CPInfo::ConstantClass {
                    name_index: read_u16(reader)?,
                },
                8 => CPInfo::ConstantString {
                    string_index: read_u16(reader)?,
                },
                9 => CPInfo::ConstantFieldRef {
                    class_index: read_u16(reader)?,
                    name_and_type_index: read_u16(reader)?,
                },
                10 => CPInfo::ConstantMethodRef {
                    class_index: read_u16(reader)?,
                    name_and_type_index: read_u16(reader)?,
                },
                11 => CPInfo::ConstantInterfaceMethodRef {
                    class_index: read_u16(reader)?,
                    name_and_type_index: read_u16(reader)?,
                },
                12 => CPInfo::ConstantNameAndType {
                    name_index: read_u16(reader)?,
                    descriptor_index: read_u16(reader)?,
                },
                15 => CPInfo::ConstantMethodHandle {
                    reference_kind: read_u8(reader)?,
                    reference_index: read_u16(reader)?,
                },
                16 => CPInfo::ConstantMethodType {
                    descriptor_index: read_u16(reader)?,
                },
                18 => CPInfo::ConstantInvokeDynamic {
                    bootstrap_method_attr_index: read_u16(reader)?,
                    name_and_type_index: read_u16(reader)?,
                },
                other => {
                    return Err(malformed(format!("unsupported constant pool tag {other}")))
                }
            };
            let two_slots = matches!(entry, CPInfo::ConstantLongOrDouble { .. });
            pool.push(entry);
            index += 1;
            if two_slots {
                pool.push(CPInfo::Unusable);
                index += 1;
            }
        }
        Ok(pool)
    }

    fn parse_attributes(reader: &mut Cursor<&[u8]>, pool: &ConstantPool) -> Result<Attributes> {
        let attributes_count = read_u16(reader)?;
        let mut attributes = Attributes::default();
        for _ in 0..attributes_count {
            let name_index = read_u16(reader)?;
            let length = read_u32(reader)?;
            match pool.utf8(name_index)? {
                "Code" => {
                    let max_stack = read_u16(reader)?;
                    let max_locals = read_u16(reader)?;
                    let code_length = read_u32(reader)?;
                    let mut code = vec![0u8; code_length as usize];
                    reader
                        .read_exact(&mut code)
                        .map_err(|_| malformed("truncated Code attribute".to_string()))?;
                    let exception_table_length = read_u16(reader)?;
                    skip(reader, u64::from(exception_table_length) * 8)?;
                    // Attributes nested inside Code (line numbers, stack
                    // map frames) are not consumed by the interpreter.
                    let nested_count = read_u16(reader)?;
                    for _ in 0..nested_count {
                        let _name = read_u16(reader)?;
                        let nested_length = read_u32(reader)?;
                        skip(reader, u64::from(nested_length))?;
                    }
                    attributes.code = Some(CodeAttribute {
                        max_stack,
                        max_locals,
                        code,
                    });
                }
                "ConstantValue" => {
                    attributes.constant_value = Some(read_u16(reader)?);
                }
                "BootstrapMethods" => {
                    let num_bootstrap_methods = read_u16(reader)?;
                    for _ in 0..num_bootstrap_methods {
                        let bootstrap_method_ref = read_u16(reader)?;
                        let num_arguments = read_u16(reader)?;
                        let mut bootstrap_arguments =
                            Vec::with_capacity(num_arguments as usize);
                        for _ in 0..num_arguments {
                            bootstrap_arguments.push(read_u16(reader)?);
                        }
                        attributes.bootstrap_methods.push(BootstrapMethod {
                            bootstrap_method_ref,
                            bootstrap_arguments,
                        });
                    }
                }
                _ => {
                    skip(reader, u64::from(length))?;
                }
            }
        }
        Ok(attributes)
    }
}

/// Attributes the interpreter cares about, collected from one attribute
/// table.
#[derive(Debug, Default)]
struct Attributes {
    code: Option<CodeAttribute>,
    constant_value: Option<u16>,
    bootstrap_methods: Vec<BootstrapMethod>,
}

fn read_u8(reader: &mut Cursor<&[u8]>) -> Result<u8> {
    reader
        .read_u8()
        .map_err(|_| malformed("unexpected end of class file".to_string()))
}

fn read_u16(reader: &mut Cursor<&[u8]>) -> Result<u16> {
    reader
        .read_u16::<BigEndian>()
        .map_err(|_| malformed("unexpected end of class file".to_string()))
}

fn read_u32(reader: &mut Cursor<&[u8]>) -> Result<u32> {
    reader
        .read_u32::<BigEndian>()
        .map_err(|_| malformed("unexpected end of class file".to_string()))
}

fn skip(reader: &mut Cursor<&[u8]>, count: u64) -> Result<()> {
    let position = reader.position() + count;
    if position > reader.get_ref().len() as u64 {
        return Err(malformed("attribute extends past end of file".to_string()));
    }
    reader.set_position(position);
    Ok(())
}

fn malformed(reason: String) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::MalformedClass(reason))
}
