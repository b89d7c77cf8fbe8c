use std::fmt;

use serde_sarif::sarif::{
    ArtifactLocation, Location, LogicalLocation, Message, PhysicalLocation, Region,
    Result as SarifResult, ResultLevel,
};

use crate::ir::{Annotation, Class, Method, SUPPRESS_WARNINGS, Span};

/// Suppression string matching every diagnostic.
pub(crate) const SUPPRESS_ALL: &str = "all";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }

    fn level(self) -> ResultLevel {
        match self {
            Severity::Error => ResultLevel::Error,
            Severity::Warning => ResultLevel::Warning,
        }
    }
}

/// One checker finding with its message arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Diagnostic {
    pub(crate) severity: Severity,
    pub(crate) checker: String,
    pub(crate) key: String,
    pub(crate) args: Vec<String>,
    pub(crate) path: String,
    pub(crate) span: Span,
    pub(crate) class: Option<String>,
    pub(crate) method: Option<String>,
}

impl Diagnostic {
    /// Human readable text of the message key filled with the arguments.
    pub(crate) fn message(&self) -> String {
        let Some(template) = message_template(&self.key) else {
            if self.args.is_empty() {
                return self.key.clone();
            }
            return format!("{}: {}", self.key, self.args.join(", "));
        };
        let mut text = template.to_string();
        for (index, arg) in self.args.iter().enumerate() {
            text = text.replace(&format!("{{{index}}}"), arg);
        }
        text
    }

    pub(crate) fn to_sarif(&self) -> SarifResult {
        let text = format!("[{}] {}", self.key, self.message());
        SarifResult::builder()
            .rule_id(self.checker.clone())
            .level(self.severity.level())
            .message(result_message(text))
            .locations(vec![self.location()])
            .build()
    }

    fn location(&self) -> Location {
        let logical = match (&self.class, &self.method) {
            (Some(class), Some(method)) => Some(
                LogicalLocation::builder()
                    .name(format!("{class}.{method}"))
                    .kind("function")
                    .build(),
            ),
            (Some(class), None) => Some(
                LogicalLocation::builder()
                    .name(class.clone())
                    .kind("type")
                    .build(),
            ),
            _ => None,
        };
        let artifact_location = ArtifactLocation::builder().uri(self.path.clone()).build();
        let physical = if self.span.line > 0 {
            let region = if self.span.column > 0 {
                Region::builder()
                    .start_line(self.span.line as i64)
                    .start_column(self.span.column as i64)
                    .build()
            } else {
                Region::builder().start_line(self.span.line as i64).build()
            };
            PhysicalLocation::builder()
                .artifact_location(artifact_location)
                .region(region)
                .build()
        } else {
            PhysicalLocation::builder()
                .artifact_location(artifact_location)
                .build()
        };
        match logical {
            Some(logical) => Location::builder()
                .logical_locations(vec![logical])
                .physical_location(physical)
                .build(),
            None => Location::builder().physical_location(physical).build(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: [{}] {}",
            self.path,
            self.span.line,
            self.severity.label(),
            self.key,
            self.message()
        )
    }
}

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

fn message_template(key: &str) -> Option<&'static str> {
    let template = match key {
        "assignment.type.incompatible" => {
            "incompatible types in assignment: found {0}, required {1}"
        }
        "argument.type.incompatible" => {
            "incompatible argument for parameter {0} of {1}: found {2}, required {3}"
        }
        "return.type.incompatible" => "incompatible types in return: found {0}, required {1}",
        "method.invocation.invalid" => {
            "call to {0} not allowed on the given receiver: found {1}, required {2}"
        }
        "override.return.invalid" => {
            "incompatible return type in {0} overriding {1}: found {2}, required {3}"
        }
        "override.param.invalid" => {
            "incompatible parameter type for {0} in {1} overriding {2}: found {3}, required {4}"
        }
        "override.receiver.invalid" => {
            "incompatible receiver type in {0} overriding {1}: found {2}, required {3}"
        }
        "type.argument.type.incompatible" => {
            "incompatible type argument for type parameter {0} of {1}: found {2}, required {3}"
        }
        "contracts.precondition.not.satisfied" => {
            "precondition of {0} is not satisfied: {1} must be {2}, found {3}"
        }
        "contracts.postcondition.not.satisfied" => {
            "postcondition of {0} is not satisfied: {1} must be {2}, found {3}"
        }
        "contracts.conditional.postcondition.not.satisfied" => {
            "postcondition of {0} is not satisfied when returning {1}: {2} must be {3}, found {4}"
        }
        "cast.unsafe" => "cast from {0} to {1} cannot be statically verified",
        "expression.unparsable.type.invalid" => {
            "expression in dependent type annotation cannot be parsed: {0} ({1})"
        }
        "dereference.of.nullable" => "dereference of possibly-null reference {0}",
        "not.interned" => "attempting to use a non-@Interned comparison operand {0}",
        "array.access.unsafe.high" => "index {0} may be too large for array {1}: found {2}",
        _ => return None,
    };
    Some(template)
}

/// True when one suppression string covers `checker` and `key`.
///
/// Matches `all`, the checker name, `checker:key`, the key itself, and key
/// prefixes that end at a `.` boundary, with or without the checker prefix.
pub(crate) fn suppression_matches(suppression: &str, checker: &str, key: &str) -> bool {
    let suppression = suppression.trim();
    if suppression == SUPPRESS_ALL || suppression == checker {
        return true;
    }
    let key_part = match suppression.split_once(':') {
        Some((prefix, rest)) => {
            if prefix != checker && prefix != SUPPRESS_ALL {
                return false;
            }
            rest
        }
        None => suppression,
    };
    key_part == key
        || (key.starts_with(key_part) && key[key_part.len()..].starts_with('.'))
}

fn suppressions_of(annotations: &[Annotation]) -> Vec<String> {
    annotations
        .iter()
        .filter(|annotation| annotation.name == SUPPRESS_WARNINGS)
        .flat_map(|annotation| annotation.values.iter().cloned())
        .collect()
}

/// Collects diagnostics of one checker over one compilation unit.
///
/// Scopes are entered for each class and method so `@SuppressWarnings`
/// applies to everything nested inside the annotated declaration.
pub(crate) struct Reporter {
    checker: String,
    path: String,
    global: Vec<String>,
    scopes: Vec<Vec<String>>,
    class: Option<String>,
    method: Option<String>,
    diagnostics: Vec<Diagnostic>,
    suppressed: usize,
}

impl Reporter {
    pub(crate) fn new(checker: &str, path: &str, global: &[String]) -> Self {
        Self {
            checker: checker.to_string(),
            path: path.to_string(),
            global: global.to_vec(),
            scopes: Vec::new(),
            class: None,
            method: None,
            diagnostics: Vec::new(),
            suppressed: 0,
        }
    }

    pub(crate) fn enter_class(&mut self, class: &Class) {
        self.scopes.push(suppressions_of(&class.annotations));
        self.class = Some(class.name.clone());
    }

    pub(crate) fn exit_class(&mut self) {
        self.scopes.pop();
        self.class = None;
    }

    pub(crate) fn enter_method(&mut self, method: &Method) {
        self.scopes.push(suppressions_of(&method.annotations));
        self.method = Some(method.name.clone());
    }

    pub(crate) fn exit_method(&mut self) {
        self.scopes.pop();
        self.method = None;
    }

    fn is_suppressed(&self, key: &str) -> bool {
        self.global
            .iter()
            .chain(self.scopes.iter().flatten())
            .any(|suppression| suppression_matches(suppression, &self.checker, key))
    }

    pub(crate) fn report(&mut self, severity: Severity, key: &str, span: Span, args: Vec<String>) {
        if self.is_suppressed(key) {
            self.suppressed += 1;
            return;
        }
        self.diagnostics.push(Diagnostic {
            severity,
            checker: self.checker.clone(),
            key: key.to_string(),
            args,
            path: self.path.clone(),
            span,
            class: self.class.clone(),
            method: self.method.clone(),
        });
    }

    pub(crate) fn error(&mut self, key: &str, span: Span, args: Vec<String>) {
        self.report(Severity::Error, key, span, args);
    }

    pub(crate) fn warning(&mut self, key: &str, span: Span, args: Vec<String>) {
        self.report(Severity::Warning, key, span, args);
    }

    pub(crate) fn suppressed(&self) -> usize {
        self.suppressed
    }

    pub(crate) fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub(crate) fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}
