//! Token catalog properties: table round-trips and the greedy matcher's
//! longest-prefix behavior.

use obx_cil::token::{token_type_from_bytes, TokenClass, TokenType};

#[test]
fn literals_and_keywords_round_trip_through_the_matcher() {
    for &tt in TokenType::ALL {
        if !(tt.is_literal() || tt.is_keyword()) {
            continue;
        }
        let spelling = tt.spelling();
        let mut pos = 0;
        let got = token_type_from_bytes(spelling.as_bytes(), &mut pos);
        assert_eq!(got, tt, "matcher disagrees on {:?}", spelling);
        assert_eq!(pos, spelling.len(), "matcher length for {:?}", spelling);
    }
}

#[test]
fn classification_ranges_are_disjoint() {
    let mut literals = 0;
    let mut keywords = 0;
    let mut specials = 0;
    for &tt in TokenType::ALL {
        match tt.class() {
            TokenClass::Literal => literals += 1,
            TokenClass::Keyword => keywords += 1,
            TokenClass::Special => specials += 1,
        }
        assert_eq!(tt.is_literal() as u8 + tt.is_keyword() as u8 + tt.is_special() as u8, 1);
    }
    assert_eq!(literals, 32);
    assert_eq!(keywords, 44);
    // ident, integer, real, string, hexchar, hexstring, Comment, Eof, Invalid
    assert_eq!(specials, 9);
}

#[test]
fn longer_forms_win_over_prefixes() {
    let cases: &[(&str, TokenType, usize)] = &[
        ("..", TokenType::DotDot, 2),
        (".x", TokenType::Dot, 1),
        ("<=", TokenType::Leq, 2),
        ("<*", TokenType::LtStar, 2),
        ("<2", TokenType::Lt, 1),
        (":=", TokenType::ColonEq, 2),
        (":x", TokenType::Colon, 1),
        ("*)", TokenType::Ratt, 2),
        ("*>", TokenType::StarGt, 2),
        ("*7", TokenType::Star, 1),
        ("(*", TokenType::Latt, 2),
        ("((", TokenType::Lpar, 1),
        ("//", TokenType::SlashSlash, 2),
        ("/a", TokenType::Slash, 1),
        (">=", TokenType::Geq, 2),
    ];
    for (input, want, len) in cases {
        let mut pos = 0;
        let got = token_type_from_bytes(input.as_bytes(), &mut pos);
        assert_eq!(got, *want, "on {:?}", input);
        assert_eq!(pos, *len, "length on {:?}", input);
    }
}

#[test]
fn keyword_matching_is_prefix_greedy_but_never_partial() {
    // a shorter keyword wins when the longer form diverges early
    let mut pos = 0;
    assert_eq!(token_type_from_bytes(b"MODX", &mut pos), TokenType::Mod);
    assert_eq!(pos, 3);

    // but a failure past the shorter form yields no keyword at all
    pos = 0;
    assert_eq!(token_type_from_bytes(b"MODUL", &mut pos), TokenType::Invalid);

    pos = 0;
    assert_eq!(token_type_from_bytes(b"PROCX", &mut pos), TokenType::Proc);
    assert_eq!(pos, 4);

    pos = 0;
    assert_eq!(
        token_type_from_bytes(b"PROCEDURE", &mut pos),
        TokenType::Procedure
    );
    assert_eq!(pos, 9);

    // identifiers and unknown bytes are not this matcher's business
    pos = 0;
    assert_eq!(token_type_from_bytes(b"xyz", &mut pos), TokenType::Invalid);
}

#[test]
fn matcher_advances_a_caller_supplied_cursor() {
    let input = b"ARRAY OF CHAR";
    let mut pos = 0;
    assert_eq!(token_type_from_bytes(input, &mut pos), TokenType::Array);
    assert_eq!(pos, 5);
    pos += 1; // skip the blank
    assert_eq!(token_type_from_bytes(input, &mut pos), TokenType::Of);
    assert_eq!(pos, 8);
}
