//! Role system: role registry, role-skill matrix, read/write scope rules.
//!
//! A role's scope rules are ordered allow/deny glob lists evaluated
//! deny-first; an empty allow list means "everything not denied". Rules are
//! data, not behavior: validators receive the compiled policy and match
//! paths against it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::{DispatchError, Task};

/// Roles whose runs are expected to produce a patch and therefore must
/// declare at least one real (non-selftest) test command.
pub const PATCH_PRODUCING_ROLES: &[&str] = &[
    "engineer",
    "integrator",
    "qa",
    "doc",
    "designer",
    "architect",
];

/// Raw scope rules as found in `roles/registry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScopeRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Raw per-role policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RolePolicySpec {
    #[serde(default)]
    pub read: ScopeRules,
    #[serde(default)]
    pub write: ScopeRules,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct RoleRegistryFile {
    #[serde(default)]
    schema_version: String,
    #[serde(default)]
    roles: BTreeMap<String, RolePolicySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
struct SkillsRegistryFile {
    #[serde(default)]
    schema_version: String,
    #[serde(default)]
    skills: Vec<String>,
}

/// A role policy with compiled glob sets.
pub struct RolePolicy {
    pub spec: RolePolicySpec,
    read_allow: GlobSet,
    read_deny: GlobSet,
    write_allow: GlobSet,
    write_deny: GlobSet,
}

/// Which scope side a check failed on; maps to the coded violation strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCheck {
    Ok,
    DenyMatched,
    AllowMissed,
}

impl RolePolicy {
    fn compile(spec: RolePolicySpec) -> Result<Self, String> {
        Ok(Self {
            read_allow: compile_globs(&spec.read.allow)?,
            read_deny: compile_globs(&spec.read.deny)?,
            write_allow: compile_globs(&spec.write.allow)?,
            write_deny: compile_globs(&spec.write.deny)?,
            spec,
        })
    }

    pub fn check_read(&self, path: &str) -> ScopeCheck {
        check_scope(
            path,
            &self.read_deny,
            &self.read_allow,
            self.spec.read.allow.is_empty(),
        )
    }

    pub fn check_write(&self, path: &str) -> ScopeCheck {
        check_scope(
            path,
            &self.write_deny,
            &self.write_allow,
            self.spec.write.allow.is_empty(),
        )
    }
}

fn check_scope(path: &str, deny: &GlobSet, allow: &GlobSet, allow_empty: bool) -> ScopeCheck {
    let candidate = Path::new(path);
    if deny.is_match(candidate) {
        return ScopeCheck::DenyMatched;
    }
    if !allow_empty && !allow.is_match(candidate) {
        return ScopeCheck::AllowMissed;
    }
    ScopeCheck::Ok
}

fn compile_globs(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("bad glob {pattern}: {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| e.to_string())
}

/// The loaded role system: role policies + skill allowlists.
pub struct RoleSystem {
    roles: BTreeMap<String, RolePolicy>,
    role_skills: BTreeMap<String, BTreeSet<String>>,
    known_skills: BTreeSet<String>,
}

impl RoleSystem {
    /// Load from the three registry files. Missing files yield an empty
    /// system (every dispatch then fails `invalid_role`, which is the safe
    /// posture).
    pub fn load(
        registry_path: &Path,
        matrix_path: &Path,
        skills_path: &Path,
    ) -> Result<Self, String> {
        let registry: RoleRegistryFile = read_json_or_default(registry_path)?;
        let matrix: BTreeMap<String, Vec<String>> = read_json_or_default(matrix_path)?;
        let skills: SkillsRegistryFile = read_json_or_default(skills_path)?;

        let mut roles = BTreeMap::new();
        for (name, spec) in registry.roles {
            roles.insert(name, RolePolicy::compile(spec)?);
        }

        Ok(Self {
            roles,
            role_skills: matrix
                .into_iter()
                .map(|(role, skills)| (role, skills.into_iter().collect()))
                .collect(),
            known_skills: skills.skills.into_iter().collect(),
        })
    }

    /// Build directly from specs (tests, embedded defaults).
    pub fn from_specs(
        roles: BTreeMap<String, RolePolicySpec>,
        role_skills: BTreeMap<String, Vec<String>>,
        known_skills: Vec<String>,
    ) -> Result<Self, String> {
        let mut compiled = BTreeMap::new();
        for (name, spec) in roles {
            compiled.insert(name, RolePolicy::compile(spec)?);
        }
        Ok(Self {
            roles: compiled,
            role_skills: role_skills
                .into_iter()
                .map(|(role, skills)| (role, skills.into_iter().collect()))
                .collect(),
            known_skills: known_skills.into_iter().collect(),
        })
    }

    pub fn role(&self, name: &str) -> Option<&RolePolicy> {
        self.roles.get(name)
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn skill_allowed(&self, role: &str, skill: &str) -> bool {
        if !self.known_skills.is_empty() && !self.known_skills.contains(skill) {
            return false;
        }
        match self.role_skills.get(role) {
            Some(allowed) => allowed.contains(skill),
            // No matrix row: any known skill is acceptable.
            None => true,
        }
    }

    /// Dispatch-time role/skill validation.
    pub fn validate_task(&self, task: &Task) -> Result<(), DispatchError> {
        if !self.has_role(&task.role) {
            return Err(DispatchError::InvalidRole(task.role.clone()));
        }
        for skill in &task.skills {
            if !self.skill_allowed(&task.role, skill) {
                return Err(DispatchError::SkillNotAllowed {
                    role: task.role.clone(),
                    skill: skill.clone(),
                });
            }
        }
        Ok(())
    }
}

pub fn is_patch_producing_role(role: &str) -> bool {
    PATCH_PRODUCING_ROLES.contains(&role)
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, String> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| format!("parse {} failed: {e}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(format!("read {} failed: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engineer_system() -> RoleSystem {
        let mut roles = BTreeMap::new();
        roles.insert(
            "engineer".to_string(),
            RolePolicySpec {
                read: ScopeRules::default(),
                write: ScopeRules {
                    allow: vec!["src/**".to_string(), "tests/**".to_string()],
                    deny: vec!["src/generated/**".to_string()],
                },
            },
        );
        roles.insert("doc".to_string(), RolePolicySpec::default());

        let mut matrix = BTreeMap::new();
        matrix.insert("engineer".to_string(), vec!["refactor".to_string()]);

        RoleSystem::from_specs(roles, matrix, vec!["refactor".to_string(), "adr".to_string()])
            .expect("compile")
    }

    #[test]
    fn test_write_scope_checks() {
        let system = engineer_system();
        let role = system.role("engineer").expect("role");

        assert_eq!(role.check_write("src/a.ts"), ScopeCheck::Ok);
        assert_eq!(role.check_write("tests/a.test.ts"), ScopeCheck::Ok);
        assert_eq!(
            role.check_write("src/generated/x.ts"),
            ScopeCheck::DenyMatched
        );
        assert_eq!(role.check_write("docs/README.md"), ScopeCheck::AllowMissed);
    }

    #[test]
    fn test_empty_allow_means_everything_not_denied() {
        let system = engineer_system();
        let role = system.role("doc").expect("role");
        assert_eq!(role.check_write("anything/goes.md"), ScopeCheck::Ok);
        assert_eq!(role.check_read("src/deep/file.rs"), ScopeCheck::Ok);
    }

    #[test]
    fn test_validate_task_role_and_skills() {
        let system = engineer_system();

        let mut task = Task::new_atomic("t", "engineer");
        assert!(system.validate_task(&task).is_ok());

        task.skills = vec!["refactor".to_string()];
        assert!(system.validate_task(&task).is_ok());

        task.skills = vec!["adr".to_string()];
        assert!(matches!(
            system.validate_task(&task),
            Err(DispatchError::SkillNotAllowed { .. })
        ));

        task.role = "ghost".to_string();
        assert!(matches!(
            system.validate_task(&task),
            Err(DispatchError::InvalidRole(_))
        ));
    }

    #[test]
    fn test_patch_producing_roles() {
        assert!(is_patch_producing_role("engineer"));
        assert!(is_patch_producing_role("doc"));
        assert!(!is_patch_producing_role("pinser"));
        assert!(!is_patch_producing_role("auditor"));
    }
}
