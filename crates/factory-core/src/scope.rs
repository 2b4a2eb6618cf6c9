//! Patch scope validation: touched files vs pins and role write policy.

use serde::{Deserialize, Serialize};

use crate::domain::{PatchStats, Pins};
use crate::roles::{RolePolicy, ScopeCheck};

/// Ordered violation codes, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeViolationCode {
    OutsideAllowPaths,
    ForbiddenPaths,
    RolePolicyDenyPaths,
    RolePolicyAllowPaths,
    MaxFilesExceeded,
    MaxLocExceeded,
}

impl ScopeViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeViolationCode::OutsideAllowPaths => "outside_allow_paths",
            ScopeViolationCode::ForbiddenPaths => "forbidden_paths",
            ScopeViolationCode::RolePolicyDenyPaths => "role_policy_deny_paths",
            ScopeViolationCode::RolePolicyAllowPaths => "role_policy_allow_paths",
            ScopeViolationCode::MaxFilesExceeded => "max_files_exceeded",
            ScopeViolationCode::MaxLocExceeded => "max_loc_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolation {
    pub code: ScopeViolationCode,
    pub detail: String,
}

/// A pins allow entry covers a path when it is equal to it or the path sits
/// underneath it as a directory (a trailing `/**` grants the subtree).
pub fn pin_covers(allow: &str, path: &str) -> bool {
    let base = allow.trim_end_matches("/**").trim_end_matches('/');
    path == base || path.starts_with(&format!("{base}/"))
}

/// Validate touched files against pins and role write policy, then the
/// size caps. Violations come back in a stable order: path-level checks in
/// touched-file order, then `max_files`, then `max_loc`.
pub fn validate_patch_scope(
    touched_files: &[String],
    patch_stats: Option<&PatchStats>,
    pins: &Pins,
    role_policy: Option<&RolePolicy>,
) -> Vec<ScopeViolation> {
    let mut violations = Vec::new();

    for path in touched_files {
        if !pins.allowed_paths.iter().any(|allow| pin_covers(allow, path)) {
            violations.push(ScopeViolation {
                code: ScopeViolationCode::OutsideAllowPaths,
                detail: path.clone(),
            });
            continue;
        }
        if pins
            .forbidden_paths
            .iter()
            .any(|forbid| pin_covers(forbid, path))
        {
            violations.push(ScopeViolation {
                code: ScopeViolationCode::ForbiddenPaths,
                detail: path.clone(),
            });
            continue;
        }
        if let Some(policy) = role_policy {
            match policy.check_write(path) {
                ScopeCheck::DenyMatched => violations.push(ScopeViolation {
                    code: ScopeViolationCode::RolePolicyDenyPaths,
                    detail: path.clone(),
                }),
                ScopeCheck::AllowMissed => violations.push(ScopeViolation {
                    code: ScopeViolationCode::RolePolicyAllowPaths,
                    detail: path.clone(),
                }),
                ScopeCheck::Ok => {}
            }
        }
    }

    if let Some(max_files) = pins.max_files {
        if touched_files.len() as u32 > max_files {
            violations.push(ScopeViolation {
                code: ScopeViolationCode::MaxFilesExceeded,
                detail: format!("{} > {max_files}", touched_files.len()),
            });
        }
    }
    if let (Some(max_loc), Some(stats)) = (pins.max_loc, patch_stats) {
        let loc = stats.added + stats.removed;
        if loc > max_loc {
            violations.push(ScopeViolation {
                code: ScopeViolationCode::MaxLocExceeded,
                detail: format!("{loc} > {max_loc}"),
            });
        }
    }

    violations
}
