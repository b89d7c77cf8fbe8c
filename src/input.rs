use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};
use tracing::{debug, warn};

use crate::hierarchy::HierarchyDecl;
use crate::ir::{CompilationUnit, StubFile, assign_expression_ids};
use crate::telemetry::{Telemetry, with_span};

/// Everything read from disk before analysis starts.
pub(crate) struct InputSet {
    pub(crate) artifacts: Vec<Artifact>,
    pub(crate) units: Vec<CompilationUnit>,
    pub(crate) stubs: Vec<StubFile>,
    pub(crate) hierarchies: Vec<HierarchyDecl>,
}

impl InputSet {
    pub(crate) fn class_count(&self) -> usize {
        self.units.iter().map(|unit| unit.classes.len()).sum()
    }
}

/// Load compilation units from `input` (a file or a directory walked in
/// sorted order), then stub overlays and hierarchy declarations.
pub(crate) fn load_inputs(
    input: &Path,
    stubs: &[PathBuf],
    hierarchies: &[PathBuf],
    telemetry: Option<&Telemetry>,
) -> Result<InputSet> {
    let mut set = InputSet {
        artifacts: Vec::new(),
        units: Vec::new(),
        stubs: Vec::new(),
        hierarchies: Vec::new(),
    };

    with_span(
        telemetry,
        "load_units",
        &[KeyValue::new("qualcheck.phase", "load_units")],
        || scan_path(input, true, &mut set),
    )?;

    let mut stub_paths = stubs.to_vec();
    stub_paths.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    for path in stub_paths {
        let data = read_file(&path)?;
        let stub: StubFile = parse_json(&data, &path)?;
        push_artifact(&path, data.len() as u64, None, &mut set.artifacts);
        set.stubs.push(stub);
    }

    for path in hierarchies {
        let data = read_file(path)?;
        set.hierarchies.push(parse_json(&data, path)?);
    }

    debug!(
        units = set.units.len(),
        stubs = set.stubs.len(),
        hierarchies = set.hierarchies.len(),
        "loaded inputs"
    );
    Ok(set)
}

fn scan_path(path: &Path, strict: bool, set: &mut InputSet) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, set);
    }
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "json" => scan_unit_file(path, set),
        _ if strict => anyhow::bail!("unsupported input file: {}", path.display()),
        _ => {
            warn!(path = %path.display(), "skipping non-JSON input");
            Ok(())
        }
    }
}

fn scan_dir(path: &Path, set: &mut InputSet) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    // Keep deterministic ordering across platforms.
    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, set)?;
        } else {
            scan_path(&entry, false, set)?;
        }
    }
    Ok(())
}

fn scan_unit_file(path: &Path, set: &mut InputSet) -> Result<()> {
    let data = read_file(path)?;
    let mut unit: CompilationUnit = parse_json(&data, path)?;
    assign_expression_ids(&mut unit);
    let roles = vec![
        serde_json::to_value(ArtifactRoles::AnalysisTarget)
            .context("serialize artifact role")?,
    ];
    push_artifact(path, data.len() as u64, Some(roles), &mut set.artifacts);
    set.units.push(unit);
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Deserialize with the JSON path of the first offending value in the error.
fn parse_json<T: DeserializeOwned>(data: &[u8], path: &Path) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(data);
    serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn push_artifact(path: &Path, len: u64, roles: Option<Vec<Value>>, artifacts: &mut Vec<Artifact>) {
    let location = ArtifactLocation::builder().uri(path_to_uri(path)).build();
    let artifact = match roles {
        Some(roles) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        None => Artifact::builder()
            .location(location)
            .length(len as i64)
            .build(),
    };
    artifacts.push(artifact);
}

fn path_to_uri(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("file://{}", absolute.to_string_lossy())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: &str = r#"{
        "path": "A.java",
        "classes": [{
            "name": "A",
            "methods": [{
                "name": "m",
                "return_type": "void",
                "body": [{"kind": {"expr": {"kind": {"call": {"method": "run"}}}}}]
            }]
        }]
    }"#;

    #[test]
    fn directory_inputs_are_read_in_sorted_order() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        fs::write(temp_dir.path().join("b.json"), UNIT.replace("A.java", "B.java"))
            .expect("write b");
        fs::write(temp_dir.path().join("a.json"), UNIT).expect("write a");
        fs::write(temp_dir.path().join("notes.txt"), "ignored").expect("write notes");

        let set = load_inputs(temp_dir.path(), &[], &[], None).expect("load");

        let paths: Vec<&str> = set.units.iter().map(|unit| unit.path.as_str()).collect();
        assert_eq!(paths, vec!["A.java", "B.java"]);
        assert_eq!(set.artifacts.len(), 2);
        assert_eq!(set.class_count(), 2);
    }

    #[test]
    fn expressions_are_numbered_on_load() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("a.json");
        fs::write(&path, UNIT).expect("write unit");

        let set = load_inputs(&path, &[], &[], None).expect("load");

        let body = set.units[0].classes[0].methods[0]
            .body
            .as_ref()
            .expect("body");
        let crate::ir::StmtKind::Expr(expr) = &body[0].kind else {
            panic!("expected expression statement");
        };
        assert_eq!(expr.id, 1);
    }

    #[test]
    fn parse_errors_name_the_offending_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, r#"{"path": "A.java", "classes": [{"name": 3}]}"#).expect("write unit");

        let error = match load_inputs(&path, &[], &[], None) {
            Ok(_) => panic!("malformed unit must fail"),
            Err(error) => error,
        };

        let rendered = format!("{error:#}");
        assert!(rendered.contains("bad.json"), "{rendered}");
        assert!(rendered.contains("classes[0].name"), "{rendered}");
    }

    #[test]
    fn unsupported_top_level_input_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("A.class");
        fs::write(&path, b"nope").expect("write class");

        assert!(load_inputs(&path, &[], &[], None).is_err());
    }

    #[test]
    fn stubs_and_hierarchies_are_loaded() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let unit = temp_dir.path().join("a.json");
        let stub = temp_dir.path().join("lib.stub.json");
        let hierarchy = temp_dir.path().join("units.hierarchy.json");
        fs::write(&unit, UNIT).expect("write unit");
        fs::write(&stub, r#"{"classes": [{"name": "Lib"}]}"#).expect("write stub");
        fs::write(
            &hierarchy,
            r#"{"name": "units", "qualifiers": [{"name": "Any"}, {"name": "Meter", "subtype_of": ["Any"]}]}"#,
        )
        .expect("write hierarchy");

        let set = load_inputs(&unit, &[stub], &[hierarchy], None).expect("load");

        assert_eq!(set.stubs[0].classes[0].name, "Lib");
        assert_eq!(set.hierarchies[0].name, "units");
        assert_eq!(set.artifacts.len(), 2);
    }
}
