//! Normalizes raw guest-code and kernel failures into [`Diagnostic`]s.
//!
//! The mapper itself never fails: when position extraction goes wrong the
//! diagnostic falls back to phase + message.

use sim_core::{ConfigError, Diagnostic, Phase};
use sim_script::ScriptError;

use crate::bridge::BridgeError;

pub fn normalize_bridge(err: &BridgeError) -> Diagnostic {
    match err {
        BridgeError::Config(config) => normalize_config(config),
        BridgeError::Script { filename, error } => normalize_script(filename, error),
        BridgeError::NotParsed { filename } => Diagnostic {
            phase: Phase::Running,
            message: "native behavior not parsed at this layer".to_string(),
            context: filename.clone(),
            line: None,
            column: None,
        },
        BridgeError::InitializerShape { filename } => Diagnostic {
            phase: Phase::Running,
            message: "init must return an array of agents".to_string(),
            context: filename.clone(),
            line: None,
            column: None,
        },
        BridgeError::JsonInit { filename, message } => Diagnostic {
            phase: Phase::Parsing,
            message: message.clone(),
            context: filename.clone(),
            line: None,
            column: None,
        },
    }
}

pub fn normalize_config(err: &ConfigError) -> Diagnostic {
    let (phase, context) = match err {
        ConfigError::InvalidJson { context, .. } => (Phase::Parsing, context.clone()),
        ConfigError::UnknownLanguage(file)
        | ConfigError::UnsupportedInitializer(file)
        | ConfigError::UnsupportedBehavior(file)
        | ConfigError::InterpreterDisabled(file) => (Phase::Running, file.clone()),
        ConfigError::InitializerCount(_) => (Phase::Running, "manifest.json".to_string()),
    };
    Diagnostic {
        phase,
        message: err.to_string(),
        context,
        line: None,
        column: None,
    }
}

/// Phase is `parsing` only for a syntax-shaped failure; everything else is a
/// running failure. Structured errors carry their position directly;
/// interpreter traces get scanned for `line N` tokens.
pub fn normalize_script(filename: &str, err: &ScriptError) -> Diagnostic {
    match err {
        ScriptError::Syntax {
            message,
            line,
            column,
        } => Diagnostic {
            phase: Phase::Parsing,
            message: message.clone(),
            context: filename.to_string(),
            line: Some(*line),
            column: Some(*column),
        },
        ScriptError::Runtime {
            message,
            line,
            column,
        } => Diagnostic {
            phase: Phase::Running,
            message: message.clone(),
            context: filename.to_string(),
            line: Some(*line),
            column: Some(*column),
        },
        ScriptError::Trace(trace) => trace_diagnostic(filename, trace),
    }
}

pub fn normalize_kernel(message: &str, context: &str) -> Diagnostic {
    Diagnostic {
        phase: Phase::Running,
        message: message.to_string(),
        context: context.to_string(),
        line: None,
        column: None,
    }
}

/// Recover a line number from interpreter trace text. Trailing host-side
/// call frames are stripped, then each remaining line is scanned for a
/// `line N` token; the frame for the behavior callable wins.
fn trace_diagnostic(filename: &str, trace: &str) -> Diagnostic {
    let lines: Vec<&str> = trace.lines().collect();
    let mut last = lines.len();
    while last > 0 && lines[last - 1].trim_start().starts_with("at ") {
        last -= 1;
    }
    if last == 0 {
        return Diagnostic {
            phase: Phase::Running,
            message: trace.to_string(),
            context: filename.to_string(),
            line: None,
            column: None,
        };
    }

    let mut behavior_line = None;
    let mut fixed = Vec::with_capacity(last);
    for line in &lines[..last] {
        match fix_frame(line) {
            Some((line_num, fixed_line)) => {
                if fixed_line.trim_end().ends_with(" behavior") {
                    behavior_line = Some(line_num);
                }
                fixed.push(fixed_line);
            }
            // Not every trace line is a stack frame.
            None => fixed.push(line.to_string()),
        }
    }

    Diagnostic {
        phase: Phase::Running,
        message: fixed.join("\n"),
        context: filename.to_string(),
        line: behavior_line,
        column: None,
    }
}

/// Parse one trace frame's `line N` token, returning the number and the
/// normalized frame text.
fn fix_frame(frame: &str) -> Option<(u32, String)> {
    const PREFIX: &str = "line ";
    let start = frame.find(PREFIX)? + PREFIX.len();
    let rest = &frame[start..];
    let end = rest.find(',').unwrap_or(rest.len());
    let line_num: u32 = rest[..end].trim().parse().ok()?;
    let fixed = format!("{}{}{}", &frame[..start], line_num, &rest[end..]);
    Some((line_num, fixed))
}
