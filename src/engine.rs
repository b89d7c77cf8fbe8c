use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde_sarif::sarif::{MultiformatMessageString, ReportingDescriptor, Result as SarifResult};
use tracing::info;

use crate::diagnostics::{Diagnostic, Severity};
use crate::factory::AnnotatedTypeFactory;
use crate::ir::{CompilationUnit, StubFile};
use crate::options::CheckerOptions;
use crate::telemetry::{Telemetry, checker_span, current_context, record_findings, unit_span};
use crate::type_system::TypeSystem;
use crate::visitor::check_unit;

/// Read-only inputs shared by every checker.
pub(crate) struct AnalysisContext {
    pub(crate) units: Vec<CompilationUnit>,
    pub(crate) stubs: Vec<StubFile>,
    telemetry: Option<Arc<Telemetry>>,
}

impl AnalysisContext {
    pub(crate) fn new(
        units: Vec<CompilationUnit>,
        stubs: Vec<StubFile>,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        Self {
            units,
            stubs,
            telemetry,
        }
    }

    pub(crate) fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_deref()
    }
}

/// Runs the selected type systems over the same compilation units.
pub(crate) struct Engine {
    systems: Vec<TypeSystem>,
    options: CheckerOptions,
}

impl Engine {
    pub(crate) fn new(mut systems: Vec<TypeSystem>, options: CheckerOptions) -> Self {
        systems.sort_by(|a, b| a.name.cmp(&b.name));
        Self { systems, options }
    }

    /// Checkers run in parallel; each owns its factory and stores.
    pub(crate) fn analyze(&self, context: &AnalysisContext) -> Result<EngineOutput> {
        let parent = current_context();
        let per_checker: Vec<CheckerOutput> = self
            .systems
            .par_iter()
            .map(|system| {
                checker_span(context.telemetry(), &parent, &system.name, || {
                    self.run_checker(system, context)
                })
                .with_context(|| format!("checker {} failed", system.name))
            })
            .collect::<Result<_>>()?;

        let mut output = EngineOutput::default();
        for checker in per_checker {
            info!(
                checker = checker.name.as_str(),
                errors = count(&checker.diagnostics, Severity::Error),
                warnings = count(&checker.diagnostics, Severity::Warning),
                suppressed = checker.suppressed,
                "checker finished"
            );
            output.rules.push(rule_descriptor(&checker.name));
            output.suppressed += checker.suppressed;
            output.diagnostics.extend(checker.diagnostics);
        }

        output.diagnostics.sort_by(|left, right| {
            left.checker
                .cmp(&right.checker)
                .then_with(|| left.path.cmp(&right.path))
                .then_with(|| left.span.cmp(&right.span))
                .then_with(|| left.message().cmp(&right.message()))
        });
        Ok(output)
    }

    fn run_checker(&self, system: &TypeSystem, context: &AnalysisContext) -> Result<CheckerOutput> {
        let factory =
            AnnotatedTypeFactory::new(system, &context.units, &context.stubs, &self.options);
        let mut output = CheckerOutput {
            name: system.name.clone(),
            diagnostics: Vec::new(),
            suppressed: 0,
        };
        for unit in &context.units {
            let reporter = unit_span(context.telemetry(), &system.name, &unit.path, || {
                let reporter = check_unit(&factory, unit)?;
                record_findings(
                    count(reporter.diagnostics(), Severity::Error),
                    count(reporter.diagnostics(), Severity::Warning),
                    reporter.suppressed(),
                );
                Ok::<_, anyhow::Error>(reporter)
            })?;
            output.suppressed += reporter.suppressed();
            output.diagnostics.extend(reporter.into_diagnostics());
        }
        Ok(output)
    }
}

struct CheckerOutput {
    name: String,
    diagnostics: Vec<Diagnostic>,
    suppressed: usize,
}

/// Diagnostics of every checker, ordered by checker, file and position.
#[derive(Default)]
pub(crate) struct EngineOutput {
    pub(crate) rules: Vec<ReportingDescriptor>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) suppressed: usize,
}

impl EngineOutput {
    pub(crate) fn error_count(&self) -> usize {
        count(&self.diagnostics, Severity::Error)
    }

    pub(crate) fn results(&self) -> Vec<SarifResult> {
        self.diagnostics.iter().map(Diagnostic::to_sarif).collect()
    }
}

fn count(diagnostics: &[Diagnostic], severity: Severity) -> usize {
    diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.severity == severity)
        .count()
}

fn rule_descriptor(checker: &str) -> ReportingDescriptor {
    ReportingDescriptor::builder()
        .id(checker)
        .name(checker)
        .short_description(
            MultiformatMessageString::builder()
                .text(format!("Qualifier errors reported by the {checker} checker"))
                .build(),
        )
        .build()
}
