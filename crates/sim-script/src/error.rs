use thiserror::Error;

/// A failure from lexing, parsing, or evaluating behavior-script source.
///
/// `Syntax` and `Runtime` carry 1-based source positions. `Trace` is the
/// rendered trace text produced by the embedded interpreter; positions must
/// be recovered from the text itself (see the error mapper in sim-runner).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("syntax error: {message}")]
    Syntax { message: String, line: u32, column: u32 },
    #[error("{message}")]
    Runtime { message: String, line: u32, column: u32 },
    #[error("{0}")]
    Trace(String),
}

impl ScriptError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, ScriptError::Syntax { .. })
    }
}

/// Map a byte offset to a 1-based (line, column) pair.
pub fn line_col(src: &str, offset: usize) -> (u32, u32) {
    let clamped = offset.min(src.len());
    let mut line = 1u32;
    let mut col = 1u32;
    for ch in src[..clamped].chars() {
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_is_one_based() {
        let src = "a\nbb\nccc";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 2), (2, 1));
        assert_eq!(line_col(src, 6), (3, 2));
    }

    #[test]
    fn offsets_past_the_end_clamp() {
        assert_eq!(line_col("ab", 99), (1, 3));
    }
}
