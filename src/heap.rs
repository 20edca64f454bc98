//! Object and array heap.
//!
//! The heap is an arena of entries addressed by stable `HeapRef` indices;
//! a reference on the operand stack is a lookup key into the arena, never
//! a pointer. Entries are only ever appended, so a `HeapRef` stays valid
//! for the lifetime of the runtime: there is no garbage collection.
use std::collections::HashMap;
use std::rc::Rc;

use crate::program::{zero_value, JavaClass};
use crate::runtime::{Result, RuntimeError, RuntimeErrorKind};
use crate::stack::Value;

/// Stable index of a heap entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeapRef(u32);

#[derive(Debug)]
pub enum HeapEntry {
    Object(Object),
    Array(Array),
    /// A string object; usable as a reference value on the operand stack.
    Str(String),
}

/// An object instance: one field slice per ancestor class, most-derived
/// first. Field lookup searches a slice and then advances to the next
/// ancestor, mirroring the hierarchy the object was built with.
#[derive(Debug)]
pub struct Object {
    slices: Vec<FieldSlice>,
}

#[derive(Debug)]
struct FieldSlice {
    class: Rc<JavaClass>,
    values: Vec<Value>,
}

impl Object {
    /// The most-derived class of this object.
    pub fn class(&self) -> Option<&Rc<JavaClass>> {
        self.slices.first().map(|slice| &slice.class)
    }

    fn class_name(&self) -> String {
        self.class().map_or_else(
            || "java/lang/Object".to_string(),
            |class| class.name.clone(),
        )
    }
}

/// Element kind requested when allocating an array. Reference arrays carry
/// the element class name when it is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayKind {
    Byte,
    Short,
    Int,
    Long,
    Ref(Option<String>),
}

impl ArrayKind {
    /// Maps a `newarray` type operand to an element kind. Floats and
    /// doubles are stored by size, matching the integer kind of the same
    /// width.
    pub fn from_atype(atype: u8) -> Result<Self> {
        match atype {
            4 | 5 | 8 => Ok(Self::Byte),
            9 => Ok(Self::Short),
            6 | 10 => Ok(Self::Int),
            7 | 11 => Ok(Self::Long),
            other => Err(RuntimeError::new(RuntimeErrorKind::UnsupportedArrayType(
                other,
            ))),
        }
    }
}

#[derive(Debug)]
pub enum Array {
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Ref {
        element_class: Option<String>,
        elements: Vec<Option<HeapRef>>,
    },
}

impl Array {
    pub fn len(&self) -> usize {
        match self {
            Self::Byte(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Ref { elements, .. } => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide object/array heap. Only grows; references handed out
/// are never invalidated.
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<HeapEntry>,
    /// Intern table for string objects.
    strings: HashMap<String, HeapRef>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, entry: HeapEntry) -> HeapRef {
        let reference = HeapRef(self.entries.len() as u32);
        self.entries.push(entry);
        reference
    }

    pub fn get(&self, reference: HeapRef) -> &HeapEntry {
        &self.entries[reference.0 as usize]
    }

    fn get_mut(&mut self, reference: HeapRef) -> &mut HeapEntry {
        &mut self.entries[reference.0 as usize]
    }

    /// Allocates an object whose field slices follow the given ancestor
    /// chain, most-derived first. Every slot starts at the typed zero
    /// value of its field descriptor.
    pub fn alloc_object(&mut self, ancestors: Vec<Rc<JavaClass>>) -> HeapRef {
        let slices = ancestors
            .into_iter()
            .map(|class| FieldSlice {
                values: class
                    .instance_fields()
                    .map(|field| zero_value(field.descriptor_char()))
                    .collect(),
                class,
            })
            .collect();
        self.alloc(HeapEntry::Object(Object { slices }))
    }

    /// Allocates a one-dimensional array of `length` zeroed elements.
    pub fn alloc_array(&mut self, kind: ArrayKind, length: usize) -> HeapRef {
        let array = match kind {
            ArrayKind::Byte => Array::Byte(vec![0; length]),
            ArrayKind::Short => Array::Short(vec![0; length]),
            ArrayKind::Int => Array::Int(vec![0; length]),
            ArrayKind::Long => Array::Long(vec![0; length]),
            ArrayKind::Ref(element_class) => Array::Ref {
                element_class,
                elements: vec![None; length],
            },
        };
        self.alloc(HeapEntry::Array(array))
    }

    /// Builds a multi-dimensional array by recursive composition: each
    /// outer slot holds a reference to an inner array. `dimensions[0]` is
    /// the outermost dimension.
    pub fn alloc_multi_array(&mut self, kind: ArrayKind, dimensions: &[i32]) -> Result<HeapRef> {
        let (&length, rest) = dimensions.split_first().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::NegativeArraySize(-1))
        })?;
        if length < 0 {
            return Err(RuntimeError::new(RuntimeErrorKind::NegativeArraySize(
                i64::from(length),
            )));
        }
        if rest.is_empty() {
            return Ok(self.alloc_array(kind, length as usize));
        }
        let mut elements = Vec::with_capacity(length as usize);
        for _ in 0..length {
            elements.push(Some(self.alloc_multi_array(kind.clone(), rest)?));
        }
        Ok(self.alloc(HeapEntry::Array(Array::Ref {
            element_class: None,
            elements,
        })))
    }

    /// Returns the heap string object for `text`, allocating it on first
    /// use. Strings are interned: equal text yields the same reference.
    pub fn intern_string(&mut self, text: &str) -> HeapRef {
        if let Some(&reference) = self.strings.get(text) {
            return reference;
        }
        let reference = self.alloc(HeapEntry::Str(text.to_string()));
        self.strings.insert(text.to_string(), reference);
        reference
    }

    /// The text of a string entry, `None` if the entry is not a string.
    pub fn string(&self, reference: HeapRef) -> Option<&str> {
        match self.get(reference) {
            HeapEntry::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Reads an instance field, walking the object's ancestor chain
    /// most-derived first.
    pub fn field(&self, reference: HeapRef, name: &str) -> Result<Value> {
        let object = self.object(reference)?;
        for slice in &object.slices {
            if let Some(index) = slice.class.instance_field_index(name) {
                return Ok(slice.values[index]);
            }
        }
        Err(RuntimeError::new(RuntimeErrorKind::FieldNotFound {
            class: object.class_name(),
            name: name.to_string(),
        }))
    }

    /// Writes an instance field, walking the object's ancestor chain
    /// most-derived first.
    pub fn set_field(&mut self, reference: HeapRef, name: &str, value: Value) -> Result<()> {
        let entry = self.get_mut(reference);
        let object = match entry {
            HeapEntry::Object(object) => object,
            _ => return Err(not_an("object")),
        };
        for slice in &mut object.slices {
            if let Some(index) = slice.class.instance_field_index(name) {
                slice.values[index] = value;
                return Ok(());
            }
        }
        Err(RuntimeError::new(RuntimeErrorKind::FieldNotFound {
            class: object.class_name(),
            name: name.to_string(),
        }))
    }

    /// Loads an array element as a tagged value of the element kind.
    pub fn array_load(&self, reference: HeapRef, index: i64) -> Result<Value> {
        let array = self.array(reference)?;
        let i = check_bounds(index, array.len())?;
        Ok(match array {
            Array::Byte(v) => Value::Byte(v[i]),
            Array::Short(v) => Value::Short(v[i]),
            Array::Int(v) => Value::Int(v[i]),
            Array::Long(v) => Value::Long(v[i]),
            Array::Ref { elements, .. } => Value::Ref(elements[i]),
        })
    }

    /// Stores into an array element, narrowing integer values to the
    /// element width.
    pub fn array_store(&mut self, reference: HeapRef, index: i64, value: Value) -> Result<()> {
        let entry = self.get_mut(reference);
        let array = match entry {
            HeapEntry::Array(array) => array,
            _ => return Err(not_an("array")),
        };
        let i = check_bounds(index, array.len())?;
        match array {
            Array::Byte(v) => v[i] = int_payload(value)? as i8,
            Array::Short(v) => v[i] = int_payload(value)? as i16,
            Array::Int(v) => v[i] = int_payload(value)? as i32,
            Array::Long(v) => v[i] = int_payload(value)?,
            Array::Ref { elements, .. } => match value {
                Value::Ref(element) => elements[i] = element,
                other => {
                    return Err(RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                        expected: "reference",
                        found: other.kind_name(),
                    }))
                }
            },
        }
        Ok(())
    }

    pub fn object(&self, reference: HeapRef) -> Result<&Object> {
        match self.get(reference) {
            HeapEntry::Object(object) => Ok(object),
            _ => Err(not_an("object")),
        }
    }

    pub fn array(&self, reference: HeapRef) -> Result<&Array> {
        match self.get(reference) {
            HeapEntry::Array(array) => Ok(array),
            _ => Err(not_an("array")),
        }
    }
}

fn check_bounds(index: i64, length: usize) -> Result<usize> {
    if index < 0 || index as usize >= length {
        return Err(RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
            index,
            length,
        }));
    }
    Ok(index as usize)
}

fn int_payload(value: Value) -> Result<i64> {
    value.as_int().ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::TypeMismatch {
            expected: "integer",
            found: value.kind_name(),
        })
    })
}

fn not_an(expected: &'static str) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::TypeMismatch {
        expected,
        found: "heap entry",
    })
}
