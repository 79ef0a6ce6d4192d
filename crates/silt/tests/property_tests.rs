//! Property-based round-trip laws for the wire encodings and the operand
//! stack.

use proptest::prelude::*;

use silt::module::rw::{Reader, Writer};
use silt::module::{BaseType, Constant, Module, VariableType};
use silt::stack::OperandStack;

fn base_type_strategy() -> impl Strategy<Value = BaseType> {
    prop_oneof![
        Just(BaseType::I8),
        Just(BaseType::I16),
        Just(BaseType::I32),
        Just(BaseType::I64),
        Just(BaseType::F32),
        Just(BaseType::F64),
        Just(BaseType::Str),
        "[a-z][a-z0-9_]{0,12}".prop_map(BaseType::Struct),
    ]
}

fn variable_type_strategy() -> impl Strategy<Value = VariableType> {
    (base_type_strategy(), 0usize..4, proptest::option::of(0usize..64)).prop_map(
        |(base, array_dims, import_index)| VariableType {
            base,
            array_dims,
            import_index,
            layout_id: None,
        },
    )
}

proptest! {
    #[test]
    fn prop_vle_round_trip(v in any::<i64>()) {
        let mut w = Writer::new();
        w.vle(v);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.vle().unwrap(), v);
        prop_assert!(r.is_at_end());
    }

    #[test]
    fn prop_string_round_trip(s in ".{0,64}") {
        let mut w = Writer::new();
        w.string(&s);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        prop_assert_eq!(r.string().unwrap(), s);
    }

    #[test]
    fn prop_type_encoding_round_trip(ty in variable_type_strategy()) {
        let mut w = Writer::new();
        ty.write(&mut w);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = VariableType::read(&mut r).unwrap();
        prop_assert!(r.is_at_end());
        prop_assert_eq!(&decoded, &ty);

        // Re-encoding reproduces the bytes exactly.
        let mut w2 = Writer::new();
        decoded.write(&mut w2);
        prop_assert_eq!(w2.into_bytes(), bytes);
    }

    #[test]
    fn prop_constant_pool_round_trip(values in proptest::collection::vec(any::<i32>(), 0..16)) {
        let mut module = Module::default();
        for v in &values {
            module.header.constants.push(Constant::I32(*v));
        }
        let parsed = Module::parse(&module.encode()).unwrap();
        let decoded: Vec<i32> = parsed
            .header
            .constants
            .iter()
            .map(|c| match c {
                Constant::I32(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn prop_stack_push_pop_i32(values in proptest::collection::vec(any::<i32>(), 0..32)) {
        let mut stack = OperandStack::new(values.len() * 4);
        for v in &values {
            stack.push_i32(*v).unwrap();
        }
        for v in values.iter().rev() {
            prop_assert_eq!(stack.pop_i32().unwrap(), *v);
        }
        prop_assert!(stack.is_empty());
    }

    #[test]
    fn prop_stack_mixed_categories(values in proptest::collection::vec(any::<(i32, i64)>(), 0..16)) {
        let mut stack = OperandStack::new(values.len() * 12);
        for (a, b) in &values {
            stack.push_i32(*a).unwrap();
            stack.push_i64(*b).unwrap();
        }
        for (a, b) in values.iter().rev() {
            prop_assert_eq!(stack.pop_i64().unwrap(), *b);
            prop_assert_eq!(stack.pop_i32().unwrap(), *a);
        }
    }
}
