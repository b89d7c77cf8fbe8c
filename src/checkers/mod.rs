use anyhow::{Result, bail};

use crate::hierarchy::HierarchyDecl;
use crate::type_system::TypeSystem;

pub(crate) mod interning;
pub(crate) mod nullness;
pub(crate) mod quotes;
pub(crate) mod tainting;
pub(crate) mod upper_bound;
pub(crate) mod value;

/// Names accepted by `--checker`.
pub(crate) const BUILTIN_CHECKERS: &[&str] = &[
    nullness::NAME,
    tainting::NAME,
    interning::NAME,
    quotes::NAME,
    value::NAME,
    upper_bound::NAME,
];

/// Type system of a built-in checker.
pub(crate) fn builtin(name: &str) -> Result<TypeSystem> {
    let system = match name {
        nullness::NAME => nullness::type_system()?,
        tainting::NAME => tainting::type_system()?,
        interning::NAME => interning::type_system()?,
        quotes::NAME => quotes::type_system()?,
        value::NAME => value::type_system()?,
        upper_bound::NAME => upper_bound::type_system()?,
        other => bail!(
            "unknown checker {other}; available: {}",
            BUILTIN_CHECKERS.join(", ")
        ),
    };
    Ok(system)
}

/// Type systems for the requested built-in names and declarative hierarchies.
pub(crate) fn resolve(names: &[String], declarations: &[HierarchyDecl]) -> Result<Vec<TypeSystem>> {
    let mut systems = Vec::new();
    for name in names {
        systems.push(builtin(name)?);
    }
    for decl in declarations {
        if systems.iter().any(|system| system.name == decl.name) {
            bail!("checker {} is declared twice", decl.name);
        }
        systems.push(TypeSystem::declarative(decl)?);
    }
    Ok(systems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_checker_builds() {
        for name in BUILTIN_CHECKERS {
            let system = builtin(name).expect("builtin checker");
            assert_eq!(&system.name, name);
        }
    }

    #[test]
    fn unknown_checker_is_an_error() {
        let error = builtin("units").expect_err("unknown checker");
        assert!(error.to_string().contains("unknown checker units"));
    }

    #[test]
    fn declarative_names_must_not_clash() {
        let decl: HierarchyDecl = serde_json::from_str(
            r#"{"name": "nullness", "qualifiers": [{"name": "Top"}]}"#,
        )
        .expect("parse declaration");
        assert!(resolve(&["nullness".to_string()], &[decl]).is_err());
    }
}
