//! Signature resolver properties: idempotent lookup, canonical
//! re-serialization, overload identity and the rejection cases.

use obx_cil::pe::{Item, MemberHint, ObjectModel};
use obx_cil::sig::{parse_member_ref, parse_type_ref};

fn model() -> ObjectModel {
    ObjectModel::new("M")
}

#[test]
fn repeated_type_lookups_return_the_same_node() {
    let mut m = model();
    let a = parse_type_ref(&mut m, "class [mscorlib]System.Object").unwrap();
    let b = parse_type_ref(&mut m, "class [mscorlib]System.Object").unwrap();
    assert_eq!(a, b);

    let c = parse_type_ref(&mut m, "char[]").unwrap();
    let d = parse_type_ref(&mut m, "char []").unwrap();
    assert_eq!(c, d);
}

#[test]
fn parsing_then_reserializing_yields_the_canonical_form() {
    let mut m = model();
    let cases = &[
        ("class [mscorlib]System.Object", "[mscorlib]System.Object"),
        ("char[]", "char[]"),
        ("int32", "int32"),
        ("class [mscorlib]System.Object[]", "[mscorlib]System.Object[]"),
    ];
    for (input, canonical) in cases {
        let node = parse_type_ref(&mut m, input).unwrap();
        assert_eq!(&m.canonical_type_name(node), canonical, "for {}", input);
    }
}

#[test]
fn member_lookup_is_idempotent_and_canonical() {
    let mut m = model();
    let reference = "int32 [OBX.Runtime]OBX.Runtime::DIV(int32, int32)";
    let a = parse_member_ref(&mut m, reference, MemberHint::Static).unwrap();
    let b = parse_member_ref(&mut m, reference, MemberHint::Static).unwrap();
    assert_eq!(a, b);
    assert!(matches!(m.node(a).item, Item::Method(_)));
    assert_eq!(m.canonical_member_name(a), reference);
}

#[test]
fn methods_are_keyed_by_name_and_normalized_parameter_list() {
    let mut m = model();
    let one = parse_member_ref(
        &mut m,
        "int32 [OBX.Runtime]OBX.Runtime::MOD(int32, int32)",
        MemberHint::Static,
    )
    .unwrap();
    let two = parse_member_ref(
        &mut m,
        "int64 [OBX.Runtime]OBX.Runtime::MOD(int64, int64)",
        MemberHint::Static,
    )
    .unwrap();
    assert_ne!(one, two, "distinct parameter lists are distinct overloads");

    // whitespace does not participate in identity
    let three = parse_member_ref(
        &mut m,
        "int32 [OBX.Runtime]OBX.Runtime::MOD(int32,int32)",
        MemberHint::Static,
    )
    .unwrap();
    assert_eq!(one, three);
}

#[test]
fn byref_and_array_suffixes_are_idempotent() {
    let mut m = model();
    let a = parse_member_ref(
        &mut m,
        "void [OBX.Runtime]OBX.Runtime::UNPACK(float32&, int32&)",
        MemberHint::Static,
    )
    .unwrap();
    let b = parse_member_ref(
        &mut m,
        "void [OBX.Runtime]OBX.Runtime::UNPACK(float32&, int32&)",
        MemberHint::Static,
    )
    .unwrap();
    assert_eq!(a, b);
}

#[test]
fn quoted_names_resolve_like_plain_ones() {
    let mut m = model();
    let a = parse_member_ref(&mut m, "void 'M'::'ping#'()", MemberHint::Static).unwrap();
    let b = parse_member_ref(&mut m, "void 'M'::'ping#'()", MemberHint::Static).unwrap();
    assert_eq!(a, b);

    let nested = parse_type_ref(&mut m, "class 'M'/'R'").unwrap();
    let again = parse_type_ref(&mut m, "class 'M'/'R'").unwrap();
    assert_eq!(nested, again);
}

#[test]
fn malformed_references_are_rejected() {
    let mut m = model();
    // member shape without the double colon
    assert!(parse_member_ref(&mut m, "void Foo.Bar", MemberHint::Static).is_err());
    // unbalanced parameter list
    assert!(parse_member_ref(&mut m, "void 'M'::'p'(int32", MemberHint::Static).is_err());
    // unbalanced assembly bracket
    assert!(parse_type_ref(&mut m, "[mscorlib System.Object").is_err());
    // member reference on a non-class type
    assert!(parse_member_ref(&mut m, "void int32::m()", MemberHint::Static).is_err());
}

#[test]
fn member_kind_mismatches_are_rejected() {
    let mut m = model();
    parse_member_ref(&mut m, "int32 'M'::'x'", MemberHint::Static).unwrap();
    // the same member cannot later be used as a method
    assert!(parse_member_ref(&mut m, "int32 'M'::'x'()", MemberHint::Static).is_err());
}
