//! Human-readable textual parser and printer for Viper IL modules
//! (§4.C, component C3): a line-oriented grammar that round-trips a
//! `Module` to text and back, used for tests, diffing, and tooling
//! interchange.

mod lexer;
mod parser;
mod printer;

pub use parser::{parse_module, ParseError};
pub use printer::print_module;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("i32")]
    #[test_case("i64")]
    #[test_case("f64")]
    fn extern_declarations_round_trip(ty: &str) {
        let src = format!("il 0.1.0\nextern @rt_helper({}) -> {}\n", ty, ty);
        let m = parse_module(&src).unwrap();
        let printed = print_module(&m);
        let reparsed = parse_module(&printed).unwrap();
        assert_eq!(m.externs, reparsed.externs);
    }

    #[test]
    fn rejects_missing_header() {
        let err = parse_module("func @f() -> void {\n}\n").unwrap_err();
        assert!(err.message.contains("il 0.1.0"));
    }

    #[test]
    fn rejects_unterminated_function() {
        let err = parse_module("il 0.1.0\nfunc @f() -> void {\nentry():\n  ret\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
