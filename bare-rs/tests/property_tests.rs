use std::cmp::Ordering;

use proptest::prelude::*;
use bare::script::expr::parse_expression;
use bare::script::stmt::parse_script;
use bare::script::value::Value;
use bare::script::{run_script, ExecContext};

/// Source text for a well-formed expression.
fn expression_source() -> impl Strategy<Value = String> {
    let atom = prop_oneof![
        (0u32..1000).prop_map(|n| n.to_string()),
        "[a-z]{1,6}".prop_map(|s| format!("'{s}'")),
        prop::sample::select(vec!["a", "b", "count", "true", "null"]).prop_map(str::to_owned),
    ];
    let operand = (prop::sample::select(vec!["", "-", "!"]), atom).prop_map(|(op, a)| format!("{op}{a}"));
    operand.prop_recursive(4, 32, 3, |inner| {
        prop_oneof![
            (
                inner.clone(),
                prop::sample::select(vec!["**", "*", "/", "%", "+", "-", "<=", "<", ">=", ">", "==", "!=", "&&", "||"]),
                inner.clone(),
            )
                .prop_map(|(l, op, r)| format!("{l} {op} {r}")),
            inner.clone().prop_map(|e| format!("({e})")),
            prop::collection::vec(inner, 0..3).prop_map(|args| format!("f({})", args.join(", "))),
        ]
    })
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1e6f64..1e6).prop_map(Value::Number),
        "[a-z]{0,4}".prop_map(Value::Str),
    ]
}

/// Numeric arguments that are negative, fractional, tiny or far too large,
/// skipping the sizes that would legitimately build huge results.
fn hostile_number() -> impl Strategy<Value = f64> {
    prop_oneof![
        (-1000i32..1000).prop_map(f64::from),
        -1e3f64..1e3,
        1e12f64..1e300,
        -1e300f64..-1e12,
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(f64::NAN),
    ]
}

proptest! {
    /// Size and precision arguments never abort a script.
    #[test]
    fn sized_builtins_return_values(
        x in hostile_number(),
        call in prop::sample::select(vec![
            "stringRepeat('ab', x)",
            "arrayNewSize(x)",
            "arrayNewSize(x, 'v')",
            "numberToFixed(1.5, x)",
            "numberToFixed(x, 2)",
            "jsonStringify(arrayNew(1, 2), x)",
            "mathRound(2.5, x)",
            "stringSlice('hello', x)",
            "arraySlice(arrayNew(1, 2, 3), x)",
            "stringCharCodeAt('abc', x)",
            "datetimeNewUTC(2024, x, 1, x)",
            "datetimeAdd(datetimeNewUTC(2024, 1, 1), x)",
        ]),
    ) {
        let mut ctx = ExecContext::new().with_globals([("x".to_owned(), Value::Number(x))].into());
        let script = format!("return {call}");
        prop_assert!(run_script(&script, &mut ctx).is_ok());
    }

    /// Recursion past the call depth limit gives null instead of failing.
    #[test]
    fn recursion_depth_is_bounded(depth in 1usize..60, n in 0u32..100) {
        let src = format!(
            "function count(n):\n    return if(n > 0, count(n - 1) + 1, 0)\nendfunction\nreturn count({n})"
        );
        let mut ctx = ExecContext::new().with_max_call_depth(depth);
        let result = run_script(&src, &mut ctx).unwrap();
        if (n as usize) < depth {
            prop_assert_eq!(result, Value::Number(f64::from(n)));
        } else {
            prop_assert_eq!(result, Value::Null);
        }
    }
}

proptest! {
    /// The script parser returns Ok or Err on any input, never panics.
    #[test]
    fn parser_does_not_panic(s in "\\PC*") {
        let _ = parse_script(&s);
    }

    #[test]
    fn expression_parser_does_not_panic(s in "[ -~]{0,40}") {
        let _ = parse_expression(&s);
    }

    /// Rendering a parsed expression and parsing it again gives the same tree.
    #[test]
    fn expression_render_reparses(src in expression_source()) {
        let expr = parse_expression(&src).unwrap();
        let rendered = expr.to_string();
        prop_assert_eq!(parse_expression(&rendered).unwrap(), expr);
    }

    /// Desugaring produces identical statements for identical input.
    #[test]
    fn desugaring_is_deterministic(cond in expression_source(), body in expression_source()) {
        let src = format!("while {cond}:\n    if {body}:\n        break\n    endif\n    x = {body}\nendwhile\n");
        prop_assert_eq!(parse_script(&src).unwrap(), parse_script(&src).unwrap());
    }

    #[test]
    fn compare_is_reflexive(v in scalar()) {
        prop_assert_eq!(v.compare(&v), Ordering::Equal);
    }

    #[test]
    fn compare_is_antisymmetric(a in scalar(), b in scalar()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
    }

    /// `%` takes the sign of the divisor.
    #[test]
    fn modulo_is_floored(a in -1000i32..1000, b in prop_oneof![-50i32..-1, 1i32..50]) {
        let result = run_script(&format!("return {a} % {b}"), &mut ExecContext::new()).unwrap();
        let Value::Number(m) = result else { panic!("expected a number, got {result:?}") };
        prop_assert!(m == 0.0 || (m < 0.0) == (b < 0));
        prop_assert!(m.abs() < f64::from(b.abs()));
    }
}
