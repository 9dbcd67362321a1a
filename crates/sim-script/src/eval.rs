use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use crate::ast::{BinOp, Expr, ExprKind, PathSeg, Spanned, Stmt, UnOp};
use crate::error::{line_col, ScriptError};
use crate::lexer::Span;
use crate::parser::parse;

/// The state accessor a behavior sees. Mutations land on the owning agent
/// (directly, or through the interpreter's per-call cache).
pub trait HostState {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn add_message(&mut self, to: Value, kind: String, data: Value);
}

/// The read-only context accessor: globals, datasets (keyed by shortname),
/// inbound messages, neighbors, and the current step index.
pub trait HostContext {
    fn globals(&self) -> Value;
    fn data(&self) -> Value;
    fn messages(&self) -> Value;
    fn neighbors(&self) -> Value;
    fn step(&self) -> u64;
}

/// A parsed behavior or initializer source, ready to invoke.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    src: String,
    program: Vec<Spanned<Stmt>>,
}

impl CompiledScript {
    pub fn compile(src: &str) -> Result<Self, ScriptError> {
        let program = parse(src)?;
        Ok(Self {
            src: src.to_string(),
            program,
        })
    }

    /// Evaluate the body in a fresh scope. Returns the explicit `return`
    /// value, or the value of the final expression statement.
    pub fn run(
        &self,
        state: &mut dyn HostState,
        context: &dyn HostContext,
    ) -> Result<Option<Value>, ScriptError> {
        let mut seed = HashMap::new();
        self.run_with_bindings(&mut seed, state, context)
    }

    /// Evaluate the body seeding (and afterwards re-capturing) top-level
    /// bindings, giving `.interp` files their persistent namespace.
    pub fn run_with_bindings(
        &self,
        bindings: &mut HashMap<String, Value>,
        state: &mut dyn HostState,
        context: &dyn HostContext,
    ) -> Result<Option<Value>, ScriptError> {
        let mut evaluator = Evaluator {
            src: &self.src,
            scopes: vec![bindings.clone()],
            state,
            context,
            last_value: None,
        };
        let mut returned = None;
        for stmt in &self.program {
            if let Flow::Return(value) = evaluator.exec(stmt)? {
                returned = Some(value);
                break;
            }
        }
        *bindings = evaluator.scopes.swap_remove(0);
        Ok(returned.or(evaluator.last_value))
    }
}

enum Flow {
    Normal,
    Return(Value),
}

enum EvaledSeg {
    Field(String),
    Index(usize),
}

struct Evaluator<'a> {
    src: &'a str,
    scopes: Vec<HashMap<String, Value>>,
    state: &'a mut dyn HostState,
    context: &'a dyn HostContext,
    last_value: Option<Value>,
}

impl<'a> Evaluator<'a> {
    fn err(&self, span: &Span, message: impl Into<String>) -> ScriptError {
        let (line, column) = line_col(self.src, span.start);
        ScriptError::Runtime {
            message: message.into(),
            line,
            column,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn exec(&mut self, stmt: &Spanned<Stmt>) -> Result<Flow, ScriptError> {
        match &stmt.node {
            Stmt::Let { name, value } => {
                let value = self.eval(value)?;
                self.scopes
                    .last_mut()
                    .expect("scope stack is never empty")
                    .insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Assign {
                root,
                segments,
                value,
            } => {
                let value = self.eval(value)?;
                self.assign(root, segments, value, &stmt.span)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let branch = if truthy(&self.eval(cond)?) {
                    then_branch
                } else {
                    else_branch
                };
                self.exec_block(branch)
            }
            Stmt::For { var, iter, body } => {
                let items = match self.eval(iter)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(self.err(
                            &iter.span,
                            format!("for loop needs an array, got {}", type_name(&other)),
                        ))
                    }
                };
                for item in items {
                    self.scopes.push(HashMap::from([(var.clone(), item)]));
                    let flow = self.exec_block_no_scope(body);
                    self.scopes.pop();
                    if let Flow::Return(value) = flow? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Expr(expr) => {
                let value = self.eval(expr)?;
                self.last_value = Some(value);
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_block(&mut self, block: &[Spanned<Stmt>]) -> Result<Flow, ScriptError> {
        self.scopes.push(HashMap::new());
        let flow = self.exec_block_no_scope(block);
        self.scopes.pop();
        flow
    }

    fn exec_block_no_scope(&mut self, block: &[Spanned<Stmt>]) -> Result<Flow, ScriptError> {
        for stmt in block {
            if let Flow::Return(value) = self.exec(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(
        &mut self,
        root: &str,
        segments: &[PathSeg],
        value: Value,
        span: &Span,
    ) -> Result<(), ScriptError> {
        let evaled = self.eval_segments(segments)?;
        if root == "state" {
            let (first, rest) = match evaled.split_first() {
                Some((EvaledSeg::Field(key), rest)) => (key.clone(), rest),
                Some((EvaledSeg::Index(_), _)) => {
                    return Err(self.err(span, "state is keyed by field name, not index"))
                }
                None => return Err(self.err(span, "state itself cannot be assigned")),
            };
            if rest.is_empty() {
                self.state.set(&first, value);
                return Ok(());
            }
            let mut current = self.state.get(&first).unwrap_or(Value::Null);
            self.write_path(&mut current, rest, value, span)?;
            self.state.set(&first, current);
            return Ok(());
        }
        if root == "context" {
            return Err(self.err(span, "context is read-only"));
        }
        let exists = self.lookup(root).is_some();
        if !exists {
            return Err(self.err(span, format!("unknown variable '{}'", root)));
        }
        if segments.is_empty() {
            for scope in self.scopes.iter_mut().rev() {
                if let Some(slot) = scope.get_mut(root) {
                    *slot = value;
                    return Ok(());
                }
            }
            unreachable!("existence checked above");
        }
        let mut current = self.lookup(root).cloned().expect("existence checked above");
        self.write_path(&mut current, &evaled, value, span)?;
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(root) {
                *slot = current;
                return Ok(());
            }
        }
        unreachable!("existence checked above");
    }

    fn eval_segments(&mut self, segments: &[PathSeg]) -> Result<Vec<EvaledSeg>, ScriptError> {
        segments
            .iter()
            .map(|seg| match seg {
                PathSeg::Field(name) => Ok(EvaledSeg::Field(name.clone())),
                PathSeg::Index(expr) => {
                    let value = self.eval(expr)?;
                    match value.as_u64() {
                        Some(idx) => Ok(EvaledSeg::Index(idx as usize)),
                        None => Err(self.err(&expr.span, "index must be a non-negative integer")),
                    }
                }
            })
            .collect()
    }

    fn write_path(
        &self,
        container: &mut Value,
        segments: &[EvaledSeg],
        value: Value,
        span: &Span,
    ) -> Result<(), ScriptError> {
        let (seg, rest) = segments.split_first().expect("write_path needs a segment");
        match seg {
            EvaledSeg::Field(name) => {
                if container.is_null() {
                    *container = Value::Object(Map::new());
                }
                let map = container
                    .as_object_mut()
                    .ok_or_else(|| self.err(span, format!("cannot set field '{}' on a non-object", name)))?;
                if rest.is_empty() {
                    map.insert(name.clone(), value);
                    return Ok(());
                }
                let entry = map.entry(name.clone()).or_insert(Value::Null);
                self.write_path(entry, rest, value, span)
            }
            EvaledSeg::Index(idx) => {
                let arr = container
                    .as_array_mut()
                    .ok_or_else(|| self.err(span, "cannot index into a non-array"))?;
                if *idx > arr.len() {
                    return Err(self.err(
                        span,
                        format!("index {} out of bounds (len {})", idx, arr.len()),
                    ));
                }
                if *idx == arr.len() {
                    arr.push(Value::Null);
                }
                if rest.is_empty() {
                    arr[*idx] = value;
                    return Ok(());
                }
                self.write_path(&mut arr[*idx], rest, value, span)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match &expr.kind {
            ExprKind::Number(n) => self.number(*n, &expr.span),
            ExprKind::Str(s) => Ok(Value::String(s.clone())),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Array(items) => {
                let values: Result<Vec<Value>, ScriptError> =
                    items.iter().map(|item| self.eval(item)).collect();
                Ok(Value::Array(values?))
            }
            ExprKind::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            ExprKind::Var(name) => {
                if name == "state" || name == "context" {
                    return Err(self.err(
                        &expr.span,
                        format!("'{}' cannot be used as a plain value", name),
                    ));
                }
                self.lookup(name)
                    .cloned()
                    .ok_or_else(|| self.err(&expr.span, format!("unknown variable '{}'", name)))
            }
            ExprKind::Field { base, name } => {
                if let ExprKind::Var(root) = &base.kind {
                    if root == "state" {
                        return Ok(self.state.get(name).unwrap_or(Value::Null));
                    }
                    if root == "context" {
                        return Err(self.err(
                            &expr.span,
                            format!("context has no field '{}'; call context.{}()", name, name),
                        ));
                    }
                }
                let base = self.eval(base)?;
                Ok(base.get(name).cloned().unwrap_or(Value::Null))
            }
            ExprKind::Index { base, index } => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                match (&base, &index) {
                    (Value::Array(items), _) => {
                        let idx = index.as_u64().ok_or_else(|| {
                            self.err(&expr.span, "array index must be a non-negative integer")
                        })?;
                        Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
                    }
                    (Value::Object(map), Value::String(key)) => {
                        Ok(map.get(key).cloned().unwrap_or(Value::Null))
                    }
                    _ => Err(self.err(
                        &expr.span,
                        format!("cannot index {} with {}", type_name(&base), type_name(&index)),
                    )),
                }
            }
            ExprKind::Call { base, name, args } => self.call(base.as_deref(), name, args, &expr.span),
            ExprKind::Unary { op, expr: inner } => {
                let value = self.eval(inner)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnOp::Neg => {
                        let n = value.as_f64().ok_or_else(|| {
                            self.err(&inner.span, format!("cannot negate {}", type_name(&value)))
                        })?;
                        self.number(-n, &expr.span)
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, &expr.span),
        }
    }

    fn binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        span: &Span,
    ) -> Result<Value, ScriptError> {
        if op == BinOp::And {
            let lhs = self.eval(lhs)?;
            if !truthy(&lhs) {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(truthy(&self.eval(rhs)?)));
        }
        if op == BinOp::Or {
            let lhs = self.eval(lhs)?;
            if truthy(&lhs) {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(truthy(&self.eval(rhs)?)));
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let (a, b) = self.numeric_operands(&left, &right, span)?;
                let result = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Rem => a % b,
                    _ => unreachable!(),
                };
                self.number(result, span)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if let (Value::String(a), Value::String(b)) = (&left, &right) {
                    return Ok(Value::Bool(match op {
                        BinOp::Lt => a < b,
                        BinOp::Le => a <= b,
                        BinOp::Gt => a > b,
                        BinOp::Ge => a >= b,
                        _ => unreachable!(),
                    }));
                }
                let (a, b) = self.numeric_operands(&left, &right, span)?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    _ => unreachable!(),
                }))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn numeric_operands(
        &self,
        left: &Value,
        right: &Value,
        span: &Span,
    ) -> Result<(f64, f64), ScriptError> {
        match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(self.err(
                span,
                format!(
                    "arithmetic needs numbers, got {} and {}",
                    type_name(left),
                    type_name(right)
                ),
            )),
        }
    }

    fn number(&self, n: f64, span: &Span) -> Result<Value, ScriptError> {
        Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| self.err(span, "arithmetic produced a non-finite number"))
    }

    fn call(
        &mut self,
        base: Option<&Expr>,
        name: &str,
        args: &[Expr],
        span: &Span,
    ) -> Result<Value, ScriptError> {
        match base {
            None => self.call_builtin(name, args, span),
            Some(base_expr) => {
                if let ExprKind::Var(root) = &base_expr.kind {
                    if root == "state" {
                        return self.call_state_method(name, args, span);
                    }
                    if root == "context" {
                        return self.call_context_method(name, args, span);
                    }
                }
                Err(self.err(span, format!("unknown method '{}'", name)))
            }
        }
    }

    fn call_state_method(
        &mut self,
        name: &str,
        args: &[Expr],
        span: &Span,
    ) -> Result<Value, ScriptError> {
        match name {
            "get" => {
                let key = self.string_arg(args, 0, "state.get", span)?;
                Ok(self.state.get(&key).unwrap_or(Value::Null))
            }
            "set" => {
                let key = self.string_arg(args, 0, "state.set", span)?;
                let value = self.arg(args, 1, "state.set", span)?;
                self.state.set(&key, value);
                Ok(Value::Bool(true))
            }
            "add_message" => self.call_add_message(args, span),
            _ => Err(self.err(span, format!("state has no method '{}'", name))),
        }
    }

    fn call_context_method(
        &mut self,
        name: &str,
        args: &[Expr],
        span: &Span,
    ) -> Result<Value, ScriptError> {
        if !args.is_empty() {
            return Err(self.err(span, format!("context.{} takes no arguments", name)));
        }
        match name {
            "globals" => Ok(self.context.globals()),
            "data" => Ok(self.context.data()),
            "messages" => Ok(self.context.messages()),
            "neighbors" => Ok(self.context.neighbors()),
            "step" => Ok(Value::Number(Number::from(self.context.step()))),
            _ => Err(self.err(span, format!("context has no method '{}'", name))),
        }
    }

    fn call_add_message(&mut self, args: &[Expr], span: &Span) -> Result<Value, ScriptError> {
        if args.len() < 2 || args.len() > 3 {
            return Err(self.err(span, "add_message takes (to, type) or (to, type, data)"));
        }
        let to = self.eval(&args[0])?;
        let kind = match self.eval(&args[1])? {
            Value::String(s) => s,
            other => {
                return Err(self.err(
                    &args[1].span,
                    format!("message type must be a string, got {}", type_name(&other)),
                ))
            }
        };
        let data = match args.get(2) {
            Some(expr) => self.eval(expr)?,
            None => Value::Null,
        };
        self.state.add_message(to, kind, data);
        Ok(Value::Bool(true))
    }

    fn call_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
        span: &Span,
    ) -> Result<Value, ScriptError> {
        match name {
            "add_message" => self.call_add_message(args, span),
            "range" => {
                let n = self.number_arg(args, 0, "range", span)?;
                if n < 0.0 {
                    return Err(self.err(span, "range needs a non-negative count"));
                }
                let values: Vec<Value> = (0..n as u64)
                    .map(|i| Value::Number(Number::from(i)))
                    .collect();
                Ok(Value::Array(values))
            }
            "len" => {
                let value = self.arg(args, 0, "len", span)?;
                let len = match &value {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(s) => s.chars().count(),
                    other => {
                        return Err(self.err(
                            span,
                            format!("len needs an array, object, or string, got {}", type_name(other)),
                        ))
                    }
                };
                Ok(Value::Number(Number::from(len as u64)))
            }
            "push" => {
                let arr = self.arg(args, 0, "push", span)?;
                let item = self.arg(args, 1, "push", span)?;
                match arr {
                    Value::Array(mut items) => {
                        items.push(item);
                        Ok(Value::Array(items))
                    }
                    other => Err(self.err(
                        span,
                        format!("push needs an array, got {}", type_name(&other)),
                    )),
                }
            }
            "str" => {
                let mut out = String::new();
                for arg in args {
                    let value = self.eval(arg)?;
                    match value {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Ok(Value::String(out))
            }
            "abs" => {
                let n = self.number_arg(args, 0, "abs", span)?;
                self.number(n.abs(), span)
            }
            "floor" => {
                let n = self.number_arg(args, 0, "floor", span)?;
                self.number(n.floor(), span)
            }
            "min" => {
                let a = self.number_arg(args, 0, "min", span)?;
                let b = self.number_arg(args, 1, "min", span)?;
                self.number(a.min(b), span)
            }
            "max" => {
                let a = self.number_arg(args, 0, "max", span)?;
                let b = self.number_arg(args, 1, "max", span)?;
                self.number(a.max(b), span)
            }
            _ => Err(self.err(span, format!("unknown function '{}'", name))),
        }
    }

    fn arg(
        &mut self,
        args: &[Expr],
        idx: usize,
        what: &str,
        span: &Span,
    ) -> Result<Value, ScriptError> {
        let expr = args
            .get(idx)
            .ok_or_else(|| self.err(span, format!("{} is missing argument {}", what, idx + 1)))?;
        self.eval(expr)
    }

    fn string_arg(
        &mut self,
        args: &[Expr],
        idx: usize,
        what: &str,
        span: &Span,
    ) -> Result<String, ScriptError> {
        match self.arg(args, idx, what, span)? {
            Value::String(s) => Ok(s),
            other => Err(self.err(
                span,
                format!("{} needs a string key, got {}", what, type_name(&other)),
            )),
        }
    }

    fn number_arg(
        &mut self,
        args: &[Expr],
        idx: usize,
        what: &str,
        span: &Span,
    ) -> Result<f64, ScriptError> {
        let value = self.arg(args, idx, what, span)?;
        value
            .as_f64()
            .ok_or_else(|| self.err(span, format!("{} needs a number, got {}", what, type_name(&value))))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
