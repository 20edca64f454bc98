//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
//!
//! The `Runtime` owns the class cache, static-field storage and the
//! object/array heap; every call frame borrows it. Method invocation is a
//! direct recursive call into [`Runtime::execute`], so the native call
//! stack mirrors the modeled JVM call stack. Recursion depth is bounded:
//! blowing past [`MAX_CALL_DEPTH`] is a reported error instead of a host
//! stack overflow.
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use log::{debug, trace};

use crate::bytecode::OPCode;
use crate::heap::{ArrayKind, Heap, HeapRef};
use crate::jvm::{read_class_file, CPInfo, JVMParser};
use crate::program::{JavaClass, Method};
use crate::stack::{OperandStack, Value};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Upper bound on the modeled call-stack depth.
pub const MAX_CALL_DEPTH: usize = 1024;

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during class loading and execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeErrorKind {
    ClassNotFound(String),
    MalformedClass(String),
    InvalidConstantIndex(u16),
    UnexpectedConstant {
        index: u16,
        expected: &'static str,
    },
    UnsupportedConstant(u16),
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },
    FieldNotFound {
        class: String,
        name: String,
    },
    BootstrapMethodNotFound(u16),
    UnsupportedInvokeDynamic(String),
    UnknownOpcode(u8),
    UnknownFieldDescriptor(char),
    BadMethodDescriptor(String),
    UnsupportedArrayType(u8),
    DivisionByZero,
    CallDepthExceeded,
    StackUnderflow,
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    NullReference,
    IndexOutOfBounds {
        index: i64,
        length: usize,
    },
    NegativeArraySize(i64),
    /// A method that must be void (`<clinit>`, a constructor, `main`)
    /// produced a value.
    UnexpectedReturnValue(String),
}

/// `RuntimeError` is a custom type used to handle and represent
/// possible execution failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &RuntimeErrorKind {
        &self.kind
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            RuntimeErrorKind::ClassNotFound(name) => {
                write!(f, "failed to load class {name}")
            }
            RuntimeErrorKind::MalformedClass(reason) => {
                write!(f, "malformed class file: {reason}")
            }
            RuntimeErrorKind::InvalidConstantIndex(index) => {
                write!(f, "invalid constant pool index {index}")
            }
            RuntimeErrorKind::UnexpectedConstant { index, expected } => {
                write!(f, "constant pool entry {index} is not a {expected}")
            }
            RuntimeErrorKind::UnsupportedConstant(index) => {
                write!(
                    f,
                    "ldc only supports int and string constants (index {index})"
                )
            }
            RuntimeErrorKind::MethodNotFound {
                class,
                name,
                descriptor,
            } => write!(f, "method {class}.{name}:{descriptor} not found"),
            RuntimeErrorKind::FieldNotFound { class, name } => {
                write!(f, "field {name} not found in {class} or its ancestors")
            }
            RuntimeErrorKind::BootstrapMethodNotFound(index) => {
                write!(f, "bootstrap method {index} not found")
            }
            RuntimeErrorKind::UnsupportedInvokeDynamic(name) => {
                write!(
                    f,
                    "invokedynamic only supports makeConcatWithConstants, got {name}"
                )
            }
            RuntimeErrorKind::UnknownOpcode(opcode) => {
                write!(f, "unknown instruction {opcode:#x}")
            }
            RuntimeErrorKind::UnknownFieldDescriptor(c) => {
                write!(f, "unknown field descriptor {c}")
            }
            RuntimeErrorKind::BadMethodDescriptor(descriptor) => {
                write!(f, "malformed method descriptor {descriptor}")
            }
            RuntimeErrorKind::UnsupportedArrayType(atype) => {
                write!(f, "unsupported array type {atype}")
            }
            RuntimeErrorKind::DivisionByZero => write!(f, "division by zero"),
            RuntimeErrorKind::CallDepthExceeded => {
                write!(f, "stack overflow: call depth exceeded {MAX_CALL_DEPTH}")
            }
            RuntimeErrorKind::StackUnderflow => write!(f, "operand stack underflow"),
            RuntimeErrorKind::TypeMismatch { expected, found } => {
                write!(f, "expected a {expected} value, found {found}")
            }
            RuntimeErrorKind::NullReference => write!(f, "null reference"),
            RuntimeErrorKind::IndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds for length {length}")
            }
            RuntimeErrorKind::NegativeArraySize(size) => {
                write!(f, "negative array size {size}")
            }
            RuntimeErrorKind::UnexpectedReturnValue(method) => {
                write!(f, "{method} must not return a value")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

/// `Runtime` represents an execution context for JVM programs: it owns
/// the class cache, the static-field storage hanging off each class and
/// the object/array heap, and interprets bytecode one frame at a time.
/// Multiple independent runtimes can coexist; nothing is process-global.
pub struct Runtime {
    /// Class-path prefix prepended to class names when loading files.
    prefix: String,
    /// Cache of loaded classes keyed by fully-qualified name.
    classes: HashMap<String, Rc<JavaClass>>,
    heap: Heap,
    depth: usize,
}

impl Runtime {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            classes: HashMap::new(),
            heap: Heap::new(),
            depth: 0,
        }
    }

    /// Registers an already-built class with the cache, e.g. the entry
    /// class or a synthetic class assembled in memory.
    pub fn register_class(&mut self, class: JavaClass) -> Rc<JavaClass> {
        let class = Rc::new(class);
        self.classes.insert(class.name.clone(), class.clone());
        class
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Looks a class up in the cache, loading and parsing its class file
    /// on a miss. At most one descriptor exists per class name for the
    /// lifetime of the runtime.
    pub fn load_class(&mut self, name: &str) -> Result<Rc<JavaClass>> {
        if let Some(class) = self.classes.get(name) {
            return Ok(class.clone());
        }
        let path = format!("{}{}.class", self.prefix, name);
        let bytes = read_class_file(Path::new(&path))?;
        let class_file = JVMParser::parse(&bytes)?;
        let class = JavaClass::from_class_file(&class_file)?;
        debug!("loaded class {} from {}", class.name, path);
        Ok(self.register_class(class))
    }

    /// Locates `main:([Ljava/lang/String;)V` in the named class and runs
    /// it with uninitialized locals; the result must carry no value.
    pub fn run_main(&mut self, class_name: &str) -> Result<()> {
        let class = self.load_class(class_name)?;
        let method = class
            .find_method("main", "([Ljava/lang/String;)V")
            .ok_or_else(|| {
                RuntimeError::new(RuntimeErrorKind::MethodNotFound {
                    class: class_name.to_string(),
                    name: "main".to_string(),
                    descriptor: "([Ljava/lang/String;)V".to_string(),
                })
            })?;
        let locals = vec![Value::None; method.max_locals as usize];
        match self.execute(&class, method, locals)? {
            Value::None => Ok(()),
            _ => Err(RuntimeError::new(RuntimeErrorKind::UnexpectedReturnValue(
                "main".to_string(),
            ))),
        }
    }

    /// Executes the opcode instructions of a method until it returns,
    /// yielding the tagged return value (`Value::None` for void).
    pub fn execute(
        &mut self,
        class: &Rc<JavaClass>,
        method: &Method,
        mut locals: Vec<Value>,
    ) -> Result<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::new(RuntimeErrorKind::CallDepthExceeded));
        }
        self.depth += 1;
        trace!(
            "executing {}.{}{} at depth {}",
            class.name,
            method.name,
            method.descriptor,
            self.depth
        );
        let result = self.run(class, method, &mut locals);
        self.depth -= 1;
        result
    }

    /// Walks the class hierarchy from `start` upward, returning the first
    /// class for which `matcher` succeeds together with the matched item.
    /// Returns `None` when the chain is exhausted. All member resolution
    /// (methods, static fields) goes through here.
    fn resolve_in_hierarchy<T>(
        &mut self,
        start: &str,
        matcher: impl Fn(&JavaClass) -> Option<T>,
    ) -> Result<Option<(Rc<JavaClass>, T)>> {
        let mut name = start.to_string();
        loop {
            let class = self.load_class(&name)?;
            if let Some(found) = matcher(&class) {
                return Ok(Some((class, found)));
            }
            match &class.super_class {
                Some(super_name) if super_name != "java/lang/Object" => {
                    name = super_name.clone();
                }
                _ => return Ok(None),
            }
        }
    }

    /// Resolves a method reference by walking from the statically
    /// referenced class upward through its superclasses.
    fn resolve_method(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(Rc<JavaClass>, usize)> {
        self.resolve_in_hierarchy(class_name, |class| {
            class
                .methods
                .iter()
                .position(|m| m.name == name && m.descriptor == descriptor)
        })?
        .ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::MethodNotFound {
                class: class_name.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
        })
    }

    /// Resolves a static field reference to its owning class and storage
    /// slot.
    fn resolve_static_field(
        &mut self,
        class_name: &str,
        name: &str,
    ) -> Result<(Rc<JavaClass>, usize)> {
        self.resolve_in_hierarchy(class_name, |class| {
            class.find_field(name).and_then(|f| f.static_slot)
        })?
        .ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::FieldNotFound {
                class: class_name.to_string(),
                name: name.to_string(),
            })
        })
    }

    /// Runs a class's static initializer if it has not run yet. The flag
    /// flips before `<clinit>` executes so self-referential statics do
    /// not recurse.
    fn ensure_initialized(&mut self, class: &Rc<JavaClass>) -> Result<()> {
        if class.initialized.get() {
            return Ok(());
        }
        class.initialized.set(true);
        if let Some(method) = class.find_method("<clinit>", "()V") {
            trace!("running <clinit> for {}", class.name);
            let locals = vec![Value::None; method.max_locals as usize];
            match self.execute(class, method, locals)? {
                Value::None => {}
                _ => {
                    return Err(RuntimeError::new(RuntimeErrorKind::UnexpectedReturnValue(
                        format!("{}.<clinit>", class.name),
                    )))
                }
            }
        }
        Ok(())
    }

    /// Pops call arguments off the caller's stack into a fresh locals
    /// array (plus the receiver into local 0 for instance calls) and
    /// recursively executes the callee, returning its tagged result.
    fn call_method(
        &mut self,
        target: &Rc<JavaClass>,
        method_index: usize,
        op_stack: &mut OperandStack,
        with_receiver: bool,
    ) -> Result<Value> {
        let method = &target.methods[method_index];
        let mut locals = vec![Value::None; method.max_locals as usize];
        let first = usize::from(with_receiver);
        for i in (first..first + method.num_params as usize).rev() {
            op_stack.pop_to_local(&mut locals, i)?;
        }
        if with_receiver {
            locals[0] = Value::Ref(op_stack.pop_ref()?);
        }
        self.execute(target, method, locals)
    }

    fn run(
        &mut self,
        class: &Rc<JavaClass>,
        method: &Method,
        locals: &mut [Value],
    ) -> Result<Value> {
        let code = &method.code;
        let mut op_stack = OperandStack::new(method.max_stack);

        // Position at the instruction to be run.
        let mut pc: usize = 0;
        while pc < code.len() {
            let current = code[pc];
            let opcode = OPCode::try_from(current)
                .map_err(|op| RuntimeError::new(RuntimeErrorKind::UnknownOpcode(op)))?;
            match opcode {
                OPCode::IReturn => {
                    return Ok(Value::Int(op_stack.pop_int()? as i32));
                }
                OPCode::LReturn => {
                    return Ok(Value::Long(op_stack.pop_int()?));
                }
                OPCode::AReturn => {
                    return Ok(Value::Ref(op_stack.pop_ref()?));
                }
                OPCode::Return => {
                    return Ok(Value::None);
                }

                // Constants.
                OPCode::IconstM1
                | OPCode::Iconst0
                | OPCode::Iconst1
                | OPCode::Iconst2
                | OPCode::Iconst3
                | OPCode::Iconst4
                | OPCode::Iconst5 => {
                    op_stack.push_int(i32::from(current) - i32::from(OPCode::Iconst0 as u8));
                    pc += 1;
                }
                OPCode::Lconst0 | OPCode::Lconst1 => {
                    op_stack.push_long(i64::from(current - OPCode::Lconst0 as u8));
                    pc += 1;
                }
                OPCode::BiPush => {
                    op_stack.push_byte(code[pc + 1] as i8);
                    pc += 2;
                }
                OPCode::SiPush => {
                    op_stack.push_short(operand_u16(code, pc) as i16);
                    pc += 3;
                }
                OPCode::Ldc => {
                    let index = u16::from(code[pc + 1]);
                    match class.constant_pool.get(index)? {
                        CPInfo::ConstantInteger { bytes } => {
                            op_stack.push_int(*bytes);
                        }
                        CPInfo::ConstantString { string_index } => {
                            let text = class.constant_pool.utf8(*string_index)?;
                            let reference = self.heap.intern_string(text);
                            op_stack.push_ref(Some(reference));
                        }
                        _ => {
                            return Err(RuntimeError::new(RuntimeErrorKind::UnsupportedConstant(
                                index,
                            )))
                        }
                    }
                    pc += 2;
                }
                OPCode::Ldc2W => {
                    let index = operand_u16(code, pc);
                    op_stack.push_long(class.constant_pool.long_or_double(index)?);
                    pc += 3;
                }

                // Loads from local variables.
                OPCode::ILoad => {
                    op_stack.push_int(local_int(locals, code[pc + 1] as usize)? as i32);
                    pc += 2;
                }
                OPCode::ILoad0 | OPCode::ILoad1 | OPCode::ILoad2 | OPCode::ILoad3 => {
                    let index = (current - OPCode::ILoad0 as u8) as usize;
                    op_stack.push_int(local_int(locals, index)? as i32);
                    pc += 1;
                }
                OPCode::LLoad => {
                    op_stack.push_long(local_int(locals, code[pc + 1] as usize)?);
                    pc += 2;
                }
                OPCode::LLoad0 | OPCode::LLoad1 | OPCode::LLoad2 | OPCode::LLoad3 => {
                    let index = (current - OPCode::LLoad0 as u8) as usize;
                    op_stack.push_long(local_int(locals, index)?);
                    pc += 1;
                }
                OPCode::ALoad => {
                    op_stack.push_ref(local_ref(locals, code[pc + 1] as usize)?);
                    pc += 2;
                }
                OPCode::ALoad0 | OPCode::ALoad1 | OPCode::ALoad2 | OPCode::ALoad3 => {
                    let index = (current - OPCode::ALoad0 as u8) as usize;
                    op_stack.push_ref(local_ref(locals, index)?);
                    pc += 1;
                }

                // Stores into local variables.
                OPCode::IStore => {
                    locals[code[pc + 1] as usize] = Value::Int(op_stack.pop_int()? as i32);
                    pc += 2;
                }
                OPCode::IStore0 | OPCode::IStore1 | OPCode::IStore2 | OPCode::IStore3 => {
                    let index = (current - OPCode::IStore0 as u8) as usize;
                    locals[index] = Value::Int(op_stack.pop_int()? as i32);
                    pc += 1;
                }
                OPCode::LStore => {
                    locals[code[pc + 1] as usize] = Value::Long(op_stack.pop_int()?);
                    pc += 2;
                }
                OPCode::LStore0 | OPCode::LStore1 | OPCode::LStore2 | OPCode::LStore3 => {
                    let index = (current - OPCode::LStore0 as u8) as usize;
                    locals[index] = Value::Long(op_stack.pop_int()?);
                    pc += 1;
                }
                OPCode::AStore => {
                    locals[code[pc + 1] as usize] = Value::Ref(op_stack.pop_ref()?);
                    pc += 2;
                }
                OPCode::AStore0 | OPCode::AStore1 | OPCode::AStore2 | OPCode::AStore3 => {
                    let index = (current - OPCode::AStore0 as u8) as usize;
                    locals[index] = Value::Ref(op_stack.pop_ref()?);
                    pc += 1;
                }

                // Array loads and stores. The element kind is carried by
                // the array itself, so the variants collapse into two
                // handlers; the index sits above the array reference.
                OPCode::IALoad
                | OPCode::LALoad
                | OPCode::AALoad
                | OPCode::BALoad
                | OPCode::CALoad
                | OPCode::SALoad => {
                    let index = op_stack.pop_int()?;
                    let array = op_stack
                        .pop_ref()?
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::NullReference))?;
                    op_stack.push(self.heap.array_load(array, index)?);
                    pc += 1;
                }
                OPCode::IAStore
                | OPCode::LAStore
                | OPCode::AAStore
                | OPCode::BAStore
                | OPCode::CAStore
                | OPCode::SAStore => {
                    let value = op_stack.pop()?;
                    let index = op_stack.pop_int()?;
                    let array = op_stack
                        .pop_ref()?
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::NullReference))?;
                    self.heap.array_store(array, index, value)?;
                    pc += 1;
                }

                // Stack manipulation.
                OPCode::Pop => {
                    op_stack.pop()?;
                    pc += 1;
                }
                OPCode::Dup => {
                    op_stack.dup()?;
                    pc += 1;
                }

                // Arithmetic. The right-hand operand is popped first;
                // results wrap on overflow.
                OPCode::IAdd => {
                    let op1 = op_stack.pop_int()? as i32;
                    let op2 = op_stack.pop_int()? as i32;
                    op_stack.push_int(op2.wrapping_add(op1));
                    pc += 1;
                }
                OPCode::ISub => {
                    let op1 = op_stack.pop_int()? as i32;
                    let op2 = op_stack.pop_int()? as i32;
                    op_stack.push_int(op2.wrapping_sub(op1));
                    pc += 1;
                }
                OPCode::IMul => {
                    let op1 = op_stack.pop_int()? as i32;
                    let op2 = op_stack.pop_int()? as i32;
                    op_stack.push_int(op2.wrapping_mul(op1));
                    pc += 1;
                }
                OPCode::IDiv => {
                    let op1 = op_stack.pop_int()? as i32;
                    let op2 = op_stack.pop_int()? as i32;
                    if op1 == 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                    }
                    op_stack.push_int(op2.wrapping_div(op1));
                    pc += 1;
                }
                OPCode::IRem => {
                    let op1 = op_stack.pop_int()? as i32;
                    let op2 = op_stack.pop_int()? as i32;
                    if op1 == 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                    }
                    op_stack.push_int(op2.wrapping_rem(op1));
                    pc += 1;
                }
                OPCode::INeg => {
                    let op1 = op_stack.pop_int()? as i32;
                    op_stack.push_int(op1.wrapping_neg());
                    pc += 1;
                }
                OPCode::LAdd => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    op_stack.push_long(op2.wrapping_add(op1));
                    pc += 1;
                }
                OPCode::LSub => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    op_stack.push_long(op2.wrapping_sub(op1));
                    pc += 1;
                }
                OPCode::LMul => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    op_stack.push_long(op2.wrapping_mul(op1));
                    pc += 1;
                }
                OPCode::LDiv => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    if op1 == 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                    }
                    op_stack.push_long(op2.wrapping_div(op1));
                    pc += 1;
                }
                OPCode::LRem => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    if op1 == 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::DivisionByZero));
                    }
                    op_stack.push_long(op2.wrapping_rem(op1));
                    pc += 1;
                }

                // Increment local variable by a signed byte constant.
                OPCode::IInc => {
                    let index = code[pc + 1] as usize;
                    let constant = code[pc + 2] as i8;
                    let value = local_int(locals, index)? as i32;
                    locals[index] = Value::Int(value.wrapping_add(i32::from(constant)));
                    pc += 3;
                }

                // Conversions.
                OPCode::I2L => {
                    let value = op_stack.pop_int()?;
                    op_stack.push_long(value);
                    pc += 1;
                }
                OPCode::L2I => {
                    let value = op_stack.pop_int()?;
                    op_stack.push_int(value as i32);
                    pc += 1;
                }

                // Three-way long comparison.
                OPCode::LCmp => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    if op2 > op1 {
                        op_stack.push_int(1);
                    } else if op2 == op1 {
                        op_stack.push_int(0);
                    } else {
                        op_stack.push_int(-1);
                    }
                    pc += 1;
                }

                // Branch if int comparison with zero succeeds. Branch
                // offsets are measured from the opcode's own address.
                OPCode::IfEq
                | OPCode::IfNe
                | OPCode::IfLt
                | OPCode::IfGe
                | OPCode::IfGt
                | OPCode::IfLe => {
                    let conditional = op_stack.pop_int()?;
                    let taken = match opcode {
                        OPCode::IfEq => conditional == 0,
                        OPCode::IfNe => conditional != 0,
                        OPCode::IfLt => conditional < 0,
                        OPCode::IfGe => conditional >= 0,
                        OPCode::IfGt => conditional > 0,
                        _ => conditional <= 0,
                    };
                    pc = if taken { branch_target(code, pc) } else { pc + 3 };
                }

                // Branch if int comparison succeeds.
                OPCode::IfICmpEq
                | OPCode::IfICmpNe
                | OPCode::IfICmpLt
                | OPCode::IfICmpGe
                | OPCode::IfICmpGt
                | OPCode::IfICmpLe => {
                    let op1 = op_stack.pop_int()?;
                    let op2 = op_stack.pop_int()?;
                    let taken = match opcode {
                        OPCode::IfICmpEq => op2 == op1,
                        OPCode::IfICmpNe => op2 != op1,
                        OPCode::IfICmpLt => op2 < op1,
                        OPCode::IfICmpGe => op2 >= op1,
                        OPCode::IfICmpGt => op2 > op1,
                        _ => op2 <= op1,
                    };
                    pc = if taken { branch_target(code, pc) } else { pc + 3 };
                }

                OPCode::Goto => {
                    pc = branch_target(code, pc);
                }

                // Get static field from class.
                OPCode::GetStatic => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.field_ref(index)?;
                    // java.lang.System fields are print-stream plumbing
                    // the interpreter approximates, not models.
                    if member.class_name != "java/lang/System" {
                        let (target, slot) =
                            self.resolve_static_field(member.class_name, member.name)?;
                        self.ensure_initialized(&target)?;
                        let value = target.statics.borrow()[slot];
                        op_stack.push(value);
                    }
                    pc += 3;
                }

                // Put static field to class.
                OPCode::PutStatic => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.field_ref(index)?;
                    if member.class_name == "java/lang/System" {
                        pc += 3;
                        continue;
                    }
                    let descriptor = descriptor_char(member.descriptor);
                    let (target, slot) =
                        self.resolve_static_field(member.class_name, member.name)?;
                    self.ensure_initialized(&target)?;
                    let value = store_as(op_stack.pop()?, descriptor)?;
                    target.statics.borrow_mut()[slot] = value;
                    pc += 3;
                }

                // Fetch field from object.
                OPCode::GetField => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.field_ref(index)?;
                    let object = op_stack
                        .pop_ref()?
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::NullReference))?;
                    op_stack.push(self.heap.field(object, member.name)?);
                    pc += 3;
                }

                // Set field in object.
                OPCode::PutField => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.field_ref(index)?;
                    let value = op_stack.pop()?;
                    let object = op_stack
                        .pop_ref()?
                        .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::NullReference))?;
                    let value = store_as(value, descriptor_char(member.descriptor))?;
                    self.heap.set_field(object, member.name, value)?;
                    pc += 3;
                }

                // Invoke a class (static) method.
                OPCode::InvokeStatic => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.method_ref(index)?;
                    let (target, method_index) =
                        self.resolve_method(member.class_name, member.name, member.descriptor)?;
                    self.ensure_initialized(&target)?;
                    let result = self.call_method(&target, method_index, &mut op_stack, false)?;
                    marshal_result(&mut op_stack, result);
                    pc += 3;
                }

                // Invoke instance method; dispatch based on class.
                OPCode::InvokeVirtual => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.method_ref(index)?;
                    // Approximate java.io.PrintStream by printing the top
                    // of stack; the receiver was never pushed because the
                    // System.out getstatic is a no-op.
                    if member.class_name == "java/io/PrintStream" {
                        self.print_top(&mut op_stack)?;
                        pc += 3;
                        continue;
                    }
                    let (target, method_index) =
                        self.resolve_method(member.class_name, member.name, member.descriptor)?;
                    self.ensure_initialized(&target)?;
                    let result = self.call_method(&target, method_index, &mut op_stack, true)?;
                    marshal_result(&mut op_stack, result);
                    pc += 3;
                }

                // Invoke object constructor method.
                OPCode::InvokeSpecial => {
                    let index = operand_u16(code, pc);
                    let member = class.constant_pool.method_ref(index)?;
                    // java.lang.Object is the root of every hierarchy;
                    // its constructor just consumes the receiver.
                    if member.class_name == "java/lang/Object" {
                        op_stack.pop_ref()?;
                        pc += 3;
                        continue;
                    }
                    let target = self.load_class(member.class_name)?;
                    self.ensure_initialized(&target)?;
                    let method_index = target
                        .methods
                        .iter()
                        .position(|m| m.name == member.name && m.descriptor == member.descriptor)
                        .ok_or_else(|| {
                            RuntimeError::new(RuntimeErrorKind::MethodNotFound {
                                class: member.class_name.to_string(),
                                name: member.name.to_string(),
                                descriptor: member.descriptor.to_string(),
                            })
                        })?;
                    let name = format!("{}.{}", target.name, member.name);
                    let result = self.call_method(&target, method_index, &mut op_stack, true)?;
                    if !matches!(result, Value::None) {
                        return Err(RuntimeError::new(RuntimeErrorKind::UnexpectedReturnValue(
                            name,
                        )));
                    }
                    pc += 3;
                }

                // Invoke a dynamic call site; string concatenation only.
                OPCode::InvokeDynamic => {
                    let index = operand_u16(code, pc);
                    self.concat_strings(class, index, &mut op_stack)?;
                    // Two bytes for the constant pool index, then two
                    // bytes that are always zero.
                    pc += 5;
                }

                // Create a new object.
                OPCode::New => {
                    let index = operand_u16(code, pc);
                    let mut name = class.constant_pool.class_name(index)?.to_string();
                    let mut ancestors = Vec::new();
                    while name != "java/lang/Object" {
                        let ancestor = self.load_class(&name)?;
                        let parent = ancestor.super_class.clone();
                        ancestors.push(ancestor);
                        match parent {
                            Some(parent) => name = parent,
                            None => break,
                        }
                    }
                    // Outstanding static initializers run base-most first.
                    for ancestor in ancestors.iter().rev() {
                        self.ensure_initialized(ancestor)?;
                    }
                    let object = self.heap.alloc_object(ancestors);
                    op_stack.push_ref(Some(object));
                    pc += 3;
                }

                // Create a new array of a primitive element type.
                OPCode::NewArray => {
                    let kind = ArrayKind::from_atype(code[pc + 1])?;
                    let count = op_stack.pop_int()?;
                    if count < 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::NegativeArraySize(
                            count,
                        )));
                    }
                    let array = self.heap.alloc_array(kind, count as usize);
                    op_stack.push_ref(Some(array));
                    pc += 2;
                }

                // Create a new array of references.
                OPCode::ANewArray => {
                    let index = operand_u16(code, pc);
                    let element_class = class.constant_pool.class_name(index)?.to_string();
                    let count = op_stack.pop_int()?;
                    if count < 0 {
                        return Err(RuntimeError::new(RuntimeErrorKind::NegativeArraySize(
                            count,
                        )));
                    }
                    let array = self
                        .heap
                        .alloc_array(ArrayKind::Ref(Some(element_class)), count as usize);
                    op_stack.push_ref(Some(array));
                    pc += 3;
                }

                // Create a new multidimensional array.
                OPCode::MultiANewArray => {
                    let index = operand_u16(code, pc);
                    let descriptor = class.constant_pool.class_name(index)?;
                    let kind = element_kind(descriptor)?;
                    let dimension_count = code[pc + 3] as usize;
                    // The innermost dimension is on top of the stack.
                    let mut dimensions = vec![0i32; dimension_count];
                    for slot in dimensions.iter_mut().rev() {
                        *slot = op_stack.pop_int()? as i32;
                    }
                    let array = self.heap.alloc_multi_array(kind, &dimensions)?;
                    op_stack.push_ref(Some(array));
                    pc += 4;
                }
            }
        }
        Ok(Value::None)
    }

    /// Prints the top of stack for the `java.io.PrintStream` shim.
    fn print_top(&mut self, op_stack: &mut OperandStack) -> Result<()> {
        match op_stack.top()? {
            Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) => {
                let value = op_stack.pop_int()?;
                println!("{value}");
            }
            Value::Ref(_) => match op_stack.pop_ref()? {
                None => println!("null"),
                Some(reference) => match self.heap.string(reference) {
                    Some(text) => println!("{text}"),
                    None => println!("print type is not supported"),
                },
            },
            Value::None => {
                op_stack.pop()?;
                println!("print type is not supported");
            }
        }
        Ok(())
    }

    /// Implements the `makeConcatWithConstants` bootstrap: the recipe
    /// string mixes literal characters with `\x01` (substitute the next
    /// stack value) and `\x02` (substitute the next bootstrap constant).
    fn concat_strings(
        &mut self,
        class: &Rc<JavaClass>,
        index: u16,
        op_stack: &mut OperandStack,
    ) -> Result<()> {
        let (bootstrap_index, _name_and_type) = class.constant_pool.invoke_dynamic(index)?;
        let bootstrap = class
            .bootstrap_methods
            .get(bootstrap_index as usize)
            .ok_or_else(|| {
                RuntimeError::new(RuntimeErrorKind::BootstrapMethodNotFound(bootstrap_index))
            })?;
        let (_kind, reference_index) = class
            .constant_pool
            .method_handle(bootstrap.bootstrap_method_ref)?;
        let member = class.constant_pool.method_ref(reference_index)?;
        if member.name != "makeConcatWithConstants" {
            return Err(RuntimeError::new(
                RuntimeErrorKind::UnsupportedInvokeDynamic(member.name.to_string()),
            ));
        }
        let recipe_index = *bootstrap.bootstrap_arguments.first().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::BootstrapMethodNotFound(bootstrap_index))
        })?;
        let recipe = class.constant_pool.utf8(recipe_index)?;

        // The stack holds the \x01 arguments in push order; pop and
        // reverse.
        let argument_count = recipe.chars().filter(|&c| c == '\u{1}').count();
        let mut arguments = Vec::with_capacity(argument_count);
        for _ in 0..argument_count {
            let text = match op_stack.top()? {
                Value::Byte(_) | Value::Short(_) | Value::Int(_) | Value::Long(_) => {
                    op_stack.pop_int()?.to_string()
                }
                Value::Ref(_) => match op_stack.pop_ref()? {
                    None => "null".to_string(),
                    Some(reference) => self
                        .heap
                        .string(reference)
                        .ok_or_else(|| {
                            RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                                expected: "string",
                                found: "reference",
                            })
                        })?
                        .to_string(),
                },
                other => {
                    return Err(RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                        expected: "integer or string",
                        found: other.kind_name(),
                    }))
                }
            };
            arguments.push(text);
        }
        arguments.reverse();

        let mut next_argument = arguments.into_iter();
        let mut next_constant = bootstrap.bootstrap_arguments[1..].iter();
        let mut result = String::new();
        for c in recipe.chars() {
            match c {
                '\u{1}' => {
                    let text = next_argument.next().ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::BootstrapMethodNotFound(
                            bootstrap_index,
                        ))
                    })?;
                    result.push_str(&text);
                }
                '\u{2}' => {
                    let constant = next_constant.next().ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::BootstrapMethodNotFound(
                            bootstrap_index,
                        ))
                    })?;
                    result.push_str(class.constant_pool.utf8(*constant)?);
                }
                literal => result.push(literal),
            }
        }

        let reference = self.heap.intern_string(&result);
        op_stack.push_ref(Some(reference));
        Ok(())
    }
}

/// Marshals a callee's tagged result back onto the caller's stack; byte
/// and short results widen to int, void pushes nothing.
fn marshal_result(op_stack: &mut OperandStack, result: Value) {
    match result {
        Value::Byte(v) => op_stack.push_int(i32::from(v)),
        Value::Short(v) => op_stack.push_int(i32::from(v)),
        Value::Int(v) => op_stack.push_int(v),
        Value::Long(v) => op_stack.push_long(v),
        Value::Ref(v) => op_stack.push_ref(v),
        Value::None => {}
    }
}

/// Coerces a popped value into the storage kind named by a field
/// descriptor character.
fn store_as(value: Value, descriptor: char) -> Result<Value> {
    let int = |value: Value| {
        value.as_int().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                expected: "integer",
                found: value.kind_name(),
            })
        })
    };
    match descriptor {
        'B' | 'Z' => Ok(Value::Byte(int(value)? as i8)),
        'C' | 'S' => Ok(Value::Short(int(value)? as i16)),
        'I' => Ok(Value::Int(int(value)? as i32)),
        'J' => Ok(Value::Long(int(value)?)),
        'L' | '[' => match value {
            Value::Ref(_) => Ok(value),
            other => Err(RuntimeError::new(RuntimeErrorKind::TypeMismatch {
                expected: "reference",
                found: other.kind_name(),
            })),
        },
        other => Err(RuntimeError::new(RuntimeErrorKind::UnknownFieldDescriptor(
            other,
        ))),
    }
}

/// Element kind of a multidimensional array descriptor such as `[[I` or
/// `[[Ljava/lang/String;`.
fn element_kind(descriptor: &str) -> Result<ArrayKind> {
    let element = descriptor.trim_start_matches('[');
    match element.chars().next() {
        Some('B' | 'C' | 'Z') => Ok(ArrayKind::Byte),
        Some('S') => Ok(ArrayKind::Short),
        Some('I') => Ok(ArrayKind::Int),
        Some('J') => Ok(ArrayKind::Long),
        Some('L') => Ok(ArrayKind::Ref(Some(
            element[1..element.len().saturating_sub(1)].to_string(),
        ))),
        other => Err(RuntimeError::new(RuntimeErrorKind::UnknownFieldDescriptor(
            other.unwrap_or('?'),
        ))),
    }
}

fn descriptor_char(descriptor: &str) -> char {
    descriptor.chars().next().unwrap_or('I')
}

/// Reads the unsigned 16-bit operand following the opcode at `pc`.
fn operand_u16(code: &[u8], pc: usize) -> u16 {
    (u16::from(code[pc + 1]) << 8) | u16::from(code[pc + 2])
}

/// Computes a branch target from the signed 16-bit offset following the
/// opcode at `pc`; offsets are relative to the opcode's own address.
fn branch_target(code: &[u8], pc: usize) -> usize {
    let offset = i16::from_be_bytes([code[pc + 1], code[pc + 2]]);
    (pc as i64 + i64::from(offset)) as usize
}

fn local_int(locals: &[Value], index: usize) -> Result<i64> {
    let value = locals[index];
    value.as_int().ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::TypeMismatch {
            expected: "integer",
            found: value.kind_name(),
        })
    })
}

fn local_ref(locals: &[Value], index: usize) -> Result<Option<HeapRef>> {
    match locals[index] {
        Value::Ref(reference) => Ok(reference),
        // An untouched slot reads as the null reference.
        Value::None => Ok(None),
        other => Err(RuntimeError::new(RuntimeErrorKind::TypeMismatch {
            expected: "reference",
            found: other.kind_name(),
        })),
    }
}
