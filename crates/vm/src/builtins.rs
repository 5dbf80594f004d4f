//! Built-in VM functions, callable through the `Function` opcode.
//!
//! Outputs are freshly allocated values; implementations never keep
//! pointers into the argument slice past the call.

use common::{DbError, DbResult};
use types::TypedValue;

/// SQL LIKE with `%` wildcards. Arguments: `[pattern, text]`. Yields a u32
/// flag. Two-pointer matching with backtracking to the last `%`.
pub fn like(args: &[TypedValue]) -> DbResult<TypedValue> {
    if args.len() != 2 {
        return Err(DbError::Vm(format!("like takes 2 arguments, got {}", args.len())));
    }
    let pattern = args[0].as_str()?.as_bytes();
    let text = args[1].as_str()?.as_bytes();

    let mut t = 0usize;
    let mut p = 0usize;
    let mut star_p: Option<usize> = None;
    let mut star_t = 0usize;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'%' {
            star_p = Some(p);
            star_t = t;
            p += 1;
            continue;
        }
        if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
            continue;
        }
        if let Some(sp) = star_p {
            p = sp + 1;
            star_t += 1;
            t = star_t;
            continue;
        }
        return Ok(TypedValue::flag(false));
    }

    while p < pattern.len() && pattern[p] == b'%' {
        p += 1;
    }
    Ok(TypedValue::flag(p == pattern.len()))
}

/// Byte length of a string value, as a u32.
pub fn length(args: &[TypedValue]) -> DbResult<TypedValue> {
    if args.len() != 1 {
        return Err(DbError::Vm(format!(
            "length takes 1 argument, got {}",
            args.len()
        )));
    }
    Ok(TypedValue::from_u32(args[0].as_str()?.len() as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> TypedValue {
        TypedValue::from_char(s, 32)
    }

    fn matches(pattern: &str, text: &str) -> bool {
        like(&[pat(pattern), pat(text)]).unwrap().is_truthy()
    }

    #[test]
    fn like_literal_and_wildcards() {
        assert!(matches("hello", "hello"));
        assert!(!matches("hello", "hell"));
        assert!(matches("%", "anything"));
        assert!(matches("%", ""));
        assert!(matches("he%", "hello"));
        assert!(matches("%lo", "hello"));
        assert!(matches("%ell%", "hello"));
        assert!(!matches("%xyz%", "hello"));
        assert!(matches("h%l%o", "hello"));
        assert!(!matches("h%z%o", "hello"));
    }

    #[test]
    fn like_backtracks_over_repeats() {
        assert!(matches("%ab", "aab"));
        assert!(matches("%aab%", "aaaab"));
        assert!(!matches("%aab", "aba"));
    }

    #[test]
    fn like_arity_is_checked() {
        assert!(like(&[pat("x")]).is_err());
    }

    #[test]
    fn length_counts_payload_bytes() {
        let v = length(&[TypedValue::from_char("abcd", 16)]).unwrap();
        assert_eq!(v.as_u32().unwrap(), 4);
    }
}
