//! End-to-end execution tests over classes assembled in memory.
use std::rc::Rc;

use ristretto::heap::Array;
use ristretto::jvm::{BootstrapMethod, CPInfo, ConstantPool, ACC_STATIC};
use ristretto::program::{Field, JavaClass, Method};
use ristretto::runtime::{Runtime, RuntimeErrorKind};
use ristretto::stack::Value;

fn utf8(pool: &mut ConstantPool, text: &str) -> u16 {
    pool.push(CPInfo::ConstantUtf8 {
        bytes: text.to_string(),
    })
}

fn class_ref(pool: &mut ConstantPool, name: &str) -> u16 {
    let name_index = utf8(pool, name);
    pool.push(CPInfo::ConstantClass { name_index })
}

fn name_and_type(pool: &mut ConstantPool, name: &str, descriptor: &str) -> u16 {
    let name_index = utf8(pool, name);
    let descriptor_index = utf8(pool, descriptor);
    pool.push(CPInfo::ConstantNameAndType {
        name_index,
        descriptor_index,
    })
}

fn field_ref(pool: &mut ConstantPool, class_index: u16, name: &str, descriptor: &str) -> u16 {
    let name_and_type_index = name_and_type(pool, name, descriptor);
    pool.push(CPInfo::ConstantFieldRef {
        class_index,
        name_and_type_index,
    })
}

fn method_ref(pool: &mut ConstantPool, class_index: u16, name: &str, descriptor: &str) -> u16 {
    let name_and_type_index = name_and_type(pool, name, descriptor);
    pool.push(CPInfo::ConstantMethodRef {
        class_index,
        name_and_type_index,
    })
}

fn static_method(
    name: &str,
    descriptor: &str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
) -> Method {
    Method::new(
        name.to_string(),
        descriptor.to_string(),
        ACC_STATIC,
        max_stack,
        max_locals,
        code,
    )
    .unwrap()
}

fn instance_method(
    name: &str,
    descriptor: &str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
) -> Method {
    Method::new(
        name.to_string(),
        descriptor.to_string(),
        0,
        max_stack,
        max_locals,
        code,
    )
    .unwrap()
}

/// Calls a static method of a registered class with the given arguments
/// as its leading locals.
fn call(
    runtime: &mut Runtime,
    class: &Rc<JavaClass>,
    name: &str,
    descriptor: &str,
    arguments: &[Value],
) -> ristretto::runtime::Result<Value> {
    let method = class.find_method(name, descriptor).unwrap();
    let mut locals = vec![Value::None; method.max_locals as usize];
    locals[..arguments.len()].copy_from_slice(arguments);
    runtime.execute(class, method, locals)
}

/// Builds a `Counter` class with a static int field, an incrementing
/// static method and a `<clinit>` that zeroes the counter.
fn counter_class(increment_in_clinit: bool) -> (JavaClass, u16) {
    let mut pool = ConstantPool::new();
    let class_index = class_ref(&mut pool, "Counter");
    let counter = field_ref(&mut pool, class_index, "counter", "I");
    let increment = method_ref(&mut pool, class_index, "increment", "()V");
    let [c1, c2] = counter.to_be_bytes();
    let [m1, m2] = increment.to_be_bytes();

    let clinit_code = if increment_in_clinit {
        // getstatic counter; iconst_1; iadd; putstatic counter; return
        vec![0xb2, c1, c2, 0x04, 0x60, 0xb3, c1, c2, 0xb1]
    } else {
        // iconst_0; putstatic counter; return
        vec![0x03, 0xb3, c1, c2, 0xb1]
    };
    // getstatic counter; iconst_1; iadd; putstatic counter; return
    let increment_code = vec![0xb2, c1, c2, 0x04, 0x60, 0xb3, c1, c2, 0xb1];
    // five increment calls
    let mut main_code = Vec::new();
    for _ in 0..5 {
        main_code.extend_from_slice(&[0xb8, m1, m2]);
    }
    main_code.push(0xb1);

    let class = JavaClass::new(
        "Counter".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        vec![Field::new("counter".to_string(), "I".to_string(), ACC_STATIC)],
        vec![
            static_method("<clinit>", "()V", 2, 0, clinit_code),
            static_method("increment", "()V", 2, 0, increment_code),
            static_method("main", "([Ljava/lang/String;)V", 1, 1, main_code),
        ],
        Vec::new(),
    );
    (class, counter)
}

#[test]
fn static_field_updates_are_visible_across_calls() {
    let mut runtime = Runtime::new("");
    let (class, _) = counter_class(false);
    let class = runtime.register_class(class);
    runtime.run_main("Counter").unwrap();
    assert_eq!(class.statics.borrow()[0], Value::Int(5));
}

#[test]
fn static_initializer_runs_at_most_once() {
    let mut runtime = Runtime::new("");
    let (class, counter) = counter_class(true);
    let class = runtime.register_class(class);
    let [c1, c2] = counter.to_be_bytes();
    // Two getstatics, both discarding the value; only the first one may
    // trigger <clinit>.
    let driver = static_method(
        "drive",
        "()V",
        1,
        0,
        vec![0xb2, c1, c2, 0x57, 0xb2, c1, c2, 0x57, 0xb1],
    );
    let result = runtime.execute(&class, &driver, Vec::new()).unwrap();
    assert_eq!(result, Value::None);
    assert_eq!(class.statics.borrow()[0], Value::Int(1));
}

#[test]
fn constructor_initializes_instance_fields() {
    let mut pool = ConstantPool::new();
    let point = class_ref(&mut pool, "Point");
    let object = class_ref(&mut pool, "java/lang/Object");
    let object_init = method_ref(&mut pool, object, "<init>", "()V");
    let x = field_ref(&mut pool, point, "x", "I");
    let y = field_ref(&mut pool, point, "y", "I");
    let init = method_ref(&mut pool, point, "<init>", "(II)V");
    let [p1, p2] = point.to_be_bytes();
    let [o1, o2] = object_init.to_be_bytes();
    let [x1, x2] = x.to_be_bytes();
    let [y1, y2] = y.to_be_bytes();
    let [i1, i2] = init.to_be_bytes();

    // aload_0; invokespecial Object.<init>; aload_0; iload_1;
    // putfield x; aload_0; iload_2; putfield y; return
    let init_code = vec![
        0x2a, 0xb7, o1, o2, 0x2a, 0x1b, 0xb5, x1, x2, 0x2a, 0x1c, 0xb5, y1, y2, 0xb1,
    ];
    // new Point; dup; iconst_1; iconst_2; invokespecial <init>; areturn
    let make_code = vec![0xbb, p1, p2, 0x59, 0x04, 0x05, 0xb7, i1, i2, 0xb0];

    let class = JavaClass::new(
        "Point".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        vec![
            Field::new("x".to_string(), "I".to_string(), 0),
            Field::new("y".to_string(), "I".to_string(), 0),
        ],
        vec![
            instance_method("<init>", "(II)V", 2, 3, init_code),
            static_method("make", "()LPoint;", 4, 0, make_code),
        ],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "make", "()LPoint;", &[]).unwrap();
    let reference = match result {
        Value::Ref(Some(reference)) => reference,
        other => panic!("expected an object reference, got {other:?}"),
    };
    assert_eq!(runtime.heap().field(reference, "x").unwrap(), Value::Int(1));
    assert_eq!(runtime.heap().field(reference, "y").unwrap(), Value::Int(2));
}

#[test]
fn field_access_walks_the_superclass_chain() {
    // A declares the instance field, B extends A and touches it through
    // a reference typed as B.
    let a = JavaClass::new(
        "A".to_string(),
        Some("java/lang/Object".to_string()),
        ConstantPool::new(),
        vec![Field::new("x".to_string(), "I".to_string(), 0)],
        Vec::new(),
        Vec::new(),
    );

    let mut pool = ConstantPool::new();
    let b = class_ref(&mut pool, "B");
    let x = field_ref(&mut pool, b, "x", "I");
    let [b1, b2] = b.to_be_bytes();
    let [x1, x2] = x.to_be_bytes();
    // new B; astore_1; aload_1; iload_0; putfield x; aload_1;
    // getfield x; ireturn
    let code = vec![
        0xbb, b1, b2, 0x4c, 0x2b, 0x1a, 0xb5, x1, x2, 0x2b, 0xb4, x1, x2, 0xac,
    ];
    let b = JavaClass::new(
        "B".to_string(),
        Some("A".to_string()),
        pool,
        Vec::new(),
        vec![static_method("roundtrip", "(I)I", 2, 2, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    runtime.register_class(a);
    let b = runtime.register_class(b);
    let result = call(&mut runtime, &b, "roundtrip", "(I)I", &[Value::Int(7)]).unwrap();
    assert_eq!(result, Value::Int(7));
}

#[test]
fn virtual_call_binds_the_receiver_to_local_zero() {
    let mut pool = ConstantPool::new();
    let adder = class_ref(&mut pool, "Adder");
    let v = field_ref(&mut pool, adder, "v", "I");
    let get = method_ref(&mut pool, adder, "get", "()I");
    let [a1, a2] = adder.to_be_bytes();
    let [v1, v2] = v.to_be_bytes();
    let [g1, g2] = get.to_be_bytes();

    // aload_0; getfield v; ireturn
    let get_code = vec![0x2a, 0xb4, v1, v2, 0xac];
    // new Adder; astore_1; aload_1; iload_0; putfield v; aload_1;
    // invokevirtual get; ireturn
    let run_code = vec![
        0xbb, a1, a2, 0x4c, 0x2b, 0x1a, 0xb5, v1, v2, 0x2b, 0xb6, g1, g2, 0xac,
    ];

    let class = JavaClass::new(
        "Adder".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        vec![Field::new("v".to_string(), "I".to_string(), 0)],
        vec![
            instance_method("get", "()I", 1, 1, get_code),
            static_method("run", "(I)I", 2, 2, run_code),
        ],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "run", "(I)I", &[Value::Int(5)]).unwrap();
    assert_eq!(result, Value::Int(5));
}

#[test]
fn static_call_passes_arguments_in_order() {
    let mut pool = ConstantPool::new();
    let calc = class_ref(&mut pool, "Calc");
    let sub = method_ref(&mut pool, calc, "sub", "(II)I");
    let [s1, s2] = sub.to_be_bytes();

    // iload_0; iload_1; isub; ireturn
    let sub_code = vec![0x1a, 0x1b, 0x64, 0xac];
    // bipush 10; iconst_4; invokestatic sub; ireturn
    let order_code = vec![0x10, 0x0a, 0x07, 0xb8, s1, s2, 0xac];

    let class = JavaClass::new(
        "Calc".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![
            static_method("sub", "(II)I", 2, 2, sub_code),
            static_method("order", "()I", 2, 0, order_code),
        ],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "order", "()I", &[]).unwrap();
    assert_eq!(result, Value::Int(6));
}

#[test]
fn recursion_computes_factorial() {
    let mut pool = ConstantPool::new();
    let fact_class = class_ref(&mut pool, "Fact");
    let fact = method_ref(&mut pool, fact_class, "fact", "(I)I");
    let [f1, f2] = fact.to_be_bytes();

    //  0: iload_0
    //  1: iconst_1
    //  2: if_icmpgt 7
    //  5: iconst_1
    //  6: ireturn
    //  7: iload_0
    //  8: iload_0
    //  9: iconst_1
    // 10: isub
    // 11: invokestatic fact
    // 14: imul
    // 15: ireturn
    let code = vec![
        0x1a, 0x04, 0xa3, 0x00, 0x05, 0x04, 0xac, 0x1a, 0x1a, 0x04, 0x64, 0xb8, f1, f2, 0x68,
        0xac,
    ];
    let class = JavaClass::new(
        "Fact".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("fact", "(I)I", 3, 1, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "fact", "(I)I", &[Value::Int(5)]).unwrap();
    assert_eq!(result, Value::Int(120));
}

#[test]
fn unbounded_recursion_is_reported_not_fatal() {
    let mut pool = ConstantPool::new();
    let loop_class = class_ref(&mut pool, "Loop");
    let spin = method_ref(&mut pool, loop_class, "spin", "()V");
    let [s1, s2] = spin.to_be_bytes();

    // invokestatic spin; return
    let code = vec![0xb8, s1, s2, 0xb1];
    let class = JavaClass::new(
        "Loop".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("spin", "()V", 0, 0, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let err = call(&mut runtime, &class, "spin", "()V", &[]).unwrap_err();
    assert_eq!(err.kind(), &RuntimeErrorKind::CallDepthExceeded);
}

#[test]
fn int_array_round_trips_through_the_heap() {
    // bipush 3; newarray int; astore_0; aload_0; iconst_1; bipush 7;
    // iastore; aload_0; iconst_1; iaload; ireturn
    let code = vec![
        0x10, 0x03, 0xbc, 0x0a, 0x4b, 0x2a, 0x04, 0x10, 0x07, 0x4f, 0x2a, 0x04, 0x2e, 0xac,
    ];
    let class = JavaClass::new(
        "Arrays".to_string(),
        Some("java/lang/Object".to_string()),
        ConstantPool::new(),
        Vec::new(),
        vec![static_method("f", "()I", 3, 1, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "f", "()I", &[]).unwrap();
    assert_eq!(result, Value::Int(7));
}

#[test]
fn out_of_bounds_array_access_is_reported() {
    // iconst_1; newarray int; astore_0; aload_0; iconst_5; iaload; ireturn
    let code = vec![0x04, 0xbc, 0x0a, 0x4b, 0x2a, 0x08, 0x2e, 0xac];
    let class = JavaClass::new(
        "Bounds".to_string(),
        Some("java/lang/Object".to_string()),
        ConstantPool::new(),
        Vec::new(),
        vec![static_method("f", "()I", 2, 1, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let err = call(&mut runtime, &class, "f", "()I", &[]).unwrap_err();
    assert_eq!(
        err.kind(),
        &RuntimeErrorKind::IndexOutOfBounds {
            index: 5,
            length: 1
        }
    );
}

#[test]
fn multi_dimensional_arrays_allocate_all_dimensions() {
    let mut pool = ConstantPool::new();
    let descriptor = class_ref(&mut pool, "[[I");
    let [d1, d2] = descriptor.to_be_bytes();

    // iconst_2; iconst_3; multianewarray [[I 2; areturn
    let code = vec![0x05, 0x06, 0xc5, d1, d2, 0x02, 0xb0];
    let class = JavaClass::new(
        "Grid".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("f", "()[[I", 2, 0, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "f", "()[[I", &[]).unwrap();
    let outer = match result {
        Value::Ref(Some(reference)) => reference,
        other => panic!("expected an array reference, got {other:?}"),
    };
    match runtime.heap().array(outer).unwrap() {
        Array::Ref { elements, .. } => {
            assert_eq!(elements.len(), 2);
            for inner in elements {
                let inner = inner.unwrap();
                match runtime.heap().array(inner).unwrap() {
                    Array::Int(values) => assert_eq!(values, &vec![0, 0, 0]),
                    other => panic!("expected an int array, got {other:?}"),
                }
            }
        }
        other => panic!("expected a reference array, got {other:?}"),
    }
}

#[test]
fn string_concat_substitutes_stack_values() {
    let mut pool = ConstantPool::new();
    let _concat_class = class_ref(&mut pool, "Concat");
    let factory = class_ref(&mut pool, "java/lang/invoke/StringConcatFactory");
    let make = method_ref(
        &mut pool,
        factory,
        "makeConcatWithConstants",
        "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/invoke/CallSite;",
    );
    let handle = pool.push(CPInfo::ConstantMethodHandle {
        reference_kind: 6,
        reference_index: make,
    });
    let recipe = utf8(&mut pool, "\u{1} and \u{1}");
    let site = name_and_type(
        &mut pool,
        "makeConcatWithConstants",
        "(Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
    );
    let indy = pool.push(CPInfo::ConstantInvokeDynamic {
        bootstrap_method_attr_index: 0,
        name_and_type_index: site,
    });
    let a_text = utf8(&mut pool, "A");
    let a = pool.push(CPInfo::ConstantString {
        string_index: a_text,
    });
    let b_text = utf8(&mut pool, "B");
    let b = pool.push(CPInfo::ConstantString {
        string_index: b_text,
    });
    let [i1, i2] = indy.to_be_bytes();

    // ldc "A"; ldc "B"; invokedynamic; areturn
    let code = vec![0x12, a as u8, 0x12, b as u8, 0xba, i1, i2, 0x00, 0x00, 0xb0];
    let class = JavaClass::new(
        "Concat".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("f", "()Ljava/lang/String;", 2, 0, code)],
        vec![BootstrapMethod {
            bootstrap_method_ref: handle,
            bootstrap_arguments: vec![recipe],
        }],
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "f", "()Ljava/lang/String;", &[]).unwrap();
    let reference = match result {
        Value::Ref(Some(reference)) => reference,
        other => panic!("expected a string reference, got {other:?}"),
    };
    assert_eq!(runtime.heap().string(reference), Some("A and B"));
}

#[test]
fn string_concat_substitutes_bootstrap_constants_and_ints() {
    let mut pool = ConstantPool::new();
    let _concat_class = class_ref(&mut pool, "Concat");
    let factory = class_ref(&mut pool, "java/lang/invoke/StringConcatFactory");
    let make = method_ref(
        &mut pool,
        factory,
        "makeConcatWithConstants",
        "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;[Ljava/lang/Object;)Ljava/lang/invoke/CallSite;",
    );
    let handle = pool.push(CPInfo::ConstantMethodHandle {
        reference_kind: 6,
        reference_index: make,
    });
    // One stack value, then a constant carried by the bootstrap method.
    let recipe = utf8(&mut pool, "n=\u{1}\u{2}");
    let suffix = utf8(&mut pool, "!");
    let site = name_and_type(
        &mut pool,
        "makeConcatWithConstants",
        "(I)Ljava/lang/String;",
    );
    let indy = pool.push(CPInfo::ConstantInvokeDynamic {
        bootstrap_method_attr_index: 0,
        name_and_type_index: site,
    });
    let [i1, i2] = indy.to_be_bytes();

    // bipush 42; invokedynamic; areturn
    let code = vec![0x10, 0x2a, 0xba, i1, i2, 0x00, 0x00, 0xb0];
    let class = JavaClass::new(
        "Concat".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("f", "()Ljava/lang/String;", 1, 0, code)],
        vec![BootstrapMethod {
            bootstrap_method_ref: handle,
            bootstrap_arguments: vec![recipe, suffix],
        }],
    );

    let mut runtime = Runtime::new("");
    let class = runtime.register_class(class);
    let result = call(&mut runtime, &class, "f", "()Ljava/lang/String;", &[]).unwrap();
    let reference = match result {
        Value::Ref(Some(reference)) => reference,
        other => panic!("expected a string reference, got {other:?}"),
    };
    assert_eq!(runtime.heap().string(reference), Some("n=42!"));
}

#[test]
fn system_out_println_consumes_the_printed_value() {
    let mut pool = ConstantPool::new();
    let system = class_ref(&mut pool, "java/lang/System");
    let out = field_ref(&mut pool, system, "out", "Ljava/io/PrintStream;");
    let stream = class_ref(&mut pool, "java/io/PrintStream");
    let println = method_ref(&mut pool, stream, "println", "(I)V");
    let [o1, o2] = out.to_be_bytes();
    let [p1, p2] = println.to_be_bytes();

    // getstatic System.out; bipush 42; invokevirtual println; return
    let code = vec![0xb2, o1, o2, 0x10, 0x2a, 0xb6, p1, p2, 0xb1];
    let class = JavaClass::new(
        "Hello".to_string(),
        Some("java/lang/Object".to_string()),
        pool,
        Vec::new(),
        vec![static_method("main", "([Ljava/lang/String;)V", 2, 1, code)],
        Vec::new(),
    );

    let mut runtime = Runtime::new("");
    runtime.register_class(class);
    runtime.run_main("Hello").unwrap();
}
