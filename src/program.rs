//! Run-time representation of loaded Java classes.
use std::cell::{Cell, RefCell};

use regex::Regex;

use crate::jvm::{BootstrapMethod, CPInfo, ConstantPool, JVMClassFile, ACC_STATIC};
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};
use crate::stack::Value;

/// A loaded class: constant pool, field and method tables, a reference to
/// the super class by name and the storage backing its static fields.
///
/// Classes are owned by the runtime's cache and shared by every call frame
/// referencing them; they live for the lifetime of the runtime. The
/// `initialized` flag is the idempotent gate for `<clinit>`.
#[derive(Debug)]
pub struct JavaClass {
    pub name: String,
    /// Super class name; `None` only for `java/lang/Object` itself.
    pub super_class: Option<String>,
    pub constant_pool: ConstantPool,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub bootstrap_methods: Vec<BootstrapMethod>,
    pub initialized: Cell<bool>,
    /// One slot per static field, indexed by `Field::static_slot`.
    pub statics: RefCell<Vec<Value>>,
}

/// Java class method representation for the interpreter. Immutable after
/// class load.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub num_params: u16,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    /// Index into the owning class's static storage, `None` for instance
    /// fields.
    pub static_slot: Option<usize>,
}

impl Method {
    pub fn new(
        name: String,
        descriptor: String,
        access_flags: u16,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Result<Self> {
        let num_params = count_parameters(&descriptor)?;
        Ok(Self {
            name,
            descriptor,
            access_flags,
            max_stack,
            max_locals,
            code,
            num_params,
        })
    }
}

impl Field {
    pub fn new(name: String, descriptor: String, access_flags: u16) -> Self {
        Self {
            name,
            descriptor,
            access_flags,
            static_slot: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// First character of the field descriptor, which encodes its kind.
    pub fn descriptor_char(&self) -> char {
        self.descriptor.chars().next().unwrap_or('I')
    }
}

impl JavaClass {
    /// Builds a class from its parts, assigning static storage slots to
    /// static fields in declaration order.
    pub fn new(
        name: String,
        super_class: Option<String>,
        constant_pool: ConstantPool,
        mut fields: Vec<Field>,
        methods: Vec<Method>,
        bootstrap_methods: Vec<BootstrapMethod>,
    ) -> Self {
        let mut statics = Vec::new();
        for field in &mut fields {
            if field.is_static() {
                field.static_slot = Some(statics.len());
                statics.push(zero_value(field.descriptor_char()));
            }
        }
        Self {
            name,
            super_class,
            constant_pool,
            fields,
            methods,
            bootstrap_methods,
            initialized: Cell::new(false),
            statics: RefCell::new(statics),
        }
    }

    /// Converts a parsed class file into its run-time representation.
    pub fn from_class_file(class_file: &JVMClassFile) -> Result<Self> {
        let pool = &class_file.constant_pool;
        let name = pool.class_name(class_file.this_class)?.to_string();
        let super_class = if class_file.super_class == 0 {
            None
        } else {
            Some(pool.class_name(class_file.super_class)?.to_string())
        };

        let mut fields = Vec::with_capacity(class_file.fields.len());
        for info in &class_file.fields {
            fields.push(Field::new(
                pool.utf8(info.name_index)?.to_string(),
                pool.utf8(info.descriptor_index)?.to_string(),
                info.access_flags,
            ));
        }

        let mut methods = Vec::with_capacity(class_file.methods.len());
        for info in &class_file.methods {
            let method_name = pool.utf8(info.name_index)?.to_string();
            let code = info.code.as_ref().ok_or_else(|| {
                RuntimeError::new(RuntimeErrorKind::MalformedClass(format!(
                    "method {method_name} has no Code attribute"
                )))
            })?;
            methods.push(Method::new(
                method_name,
                pool.utf8(info.descriptor_index)?.to_string(),
                info.access_flags,
                code.max_stack,
                code.max_locals,
                code.code.clone(),
            )?);
        }

        let class = Self::new(
            name,
            super_class,
            class_file.constant_pool.clone(),
            fields,
            methods,
            class_file.bootstrap_methods.clone(),
        );

        // Apply ConstantValue initializers to static fields; everything
        // else waits for <clinit>.
        for (info, field) in class_file.fields.iter().zip(&class.fields) {
            if let (Some(constant), Some(slot)) = (info.constant_value, field.static_slot) {
                let value = match class.constant_pool.get(constant)? {
                    CPInfo::ConstantInteger { bytes } => match field.descriptor_char() {
                        'B' | 'Z' => Value::Byte(*bytes as i8),
                        'C' | 'S' => Value::Short(*bytes as i16),
                        _ => Value::Int(*bytes),
                    },
                    CPInfo::ConstantLongOrDouble { .. } => {
                        Value::Long(class.constant_pool.long_or_double(constant)?)
                    }
                    // String constants need the heap, which does not exist
                    // at class load time; <clinit> covers them.
                    _ => continue,
                };
                class.statics.borrow_mut()[slot] = value;
            }
        }

        Ok(class)
    }

    /// Searches this class's own method table only; hierarchy walking is
    /// the runtime's job.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Searches this class's own field table only.
    pub fn find_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn instance_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_static())
    }

    /// Position of an instance field within this class's own field slice.
    pub fn instance_field_index(&self, name: &str) -> Option<usize> {
        self.instance_fields().position(|f| f.name == name)
    }
}

/// The zero value matching a field descriptor character, used to
/// initialize static storage and object field slices.
pub fn zero_value(descriptor_char: char) -> Value {
    match descriptor_char {
        'B' | 'Z' => Value::Byte(0),
        'C' | 'S' => Value::Short(0),
        'J' => Value::Long(0),
        'L' | '[' => Value::Ref(None),
        _ => Value::Int(0),
    }
}

/// Counts the parameters encoded in a method descriptor. Longs occupy a
/// single local slot in this interpreter, so every parameter counts as
/// one.
pub fn count_parameters(descriptor: &str) -> Result<u16> {
    let re = Regex::new(r"\(([^)]*)\)(.+)").unwrap();
    let caps = re
        .captures(descriptor)
        .ok_or_else(|| bad_descriptor(descriptor))?;
    let args = caps.get(1).map_or("", |m| m.as_str());

    let bytes = args.as_bytes();
    let mut count = 0u16;
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b'[' {
            i += 1;
        }
        match bytes.get(i) {
            Some(b'L') => {
                let end = args[i..]
                    .find(';')
                    .ok_or_else(|| bad_descriptor(descriptor))?;
                i += end + 1;
            }
            Some(b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z') => {
                i += 1;
            }
            _ => return Err(bad_descriptor(descriptor)),
        }
        count += 1;
    }
    Ok(count)
}

fn bad_descriptor(descriptor: &str) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::BadMethodDescriptor(
        descriptor.to_string(),
    ))
}
