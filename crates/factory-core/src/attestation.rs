//! Context Pack v1 attestation: nonce-bound hash proofs.
//!
//! A worker completing a job must prove it saw the exact rendered pack and
//! task-bundle bytes the gateway bound to the claim. Every hash comes in a
//! plain form (`sha256(file)`) and a salted form (`sha256(nonce_utf8 ||
//! file)`); the nonce is minted per job at dispatch/claim time, so replayed
//! proofs from another claim never verify.

use std::collections::BTreeMap;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use factory_state::{ContentDigest, FactoryPaths};

use crate::domain::{ContextPackProof, HashPair, Job};

/// Bundle files that must be attested on every completion.
pub const REQUIRED_BUNDLE_FILES: &[&str] =
    &["manifest.json", "pins.json", "preflight.json", "task.json"];

/// Bundle files that are attested only when present.
pub const OPTIONAL_BUNDLE_FILES: &[&str] = &["replay_bundle.json"];

/// Mint a fresh 128-bit attestation nonce (hex).
pub fn mint_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The attestation fields of a worker's Complete payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttestationPayload {
    #[serde(default)]
    pub context_pack_v1_id: String,
    #[serde(default)]
    pub attestation_nonce: String,
    #[serde(default)]
    pub context_pack_v1_json_sha256: String,
    #[serde(default)]
    pub context_pack_v1_json_attest_sha256: String,
    #[serde(default)]
    pub task_bundle_manifest_sha256: String,
    #[serde(default)]
    pub task_bundle_files_sha256: BTreeMap<String, String>,
    #[serde(default)]
    pub task_bundle_files_attest_sha256: BTreeMap<String, String>,
}

/// Verify a completion payload against the files on disk and the job's
/// bound pack id + nonce. Returns the proof artifact (always recorded) and
/// the ordered violation codes (empty means verified).
pub fn verify_completion(
    paths: &FactoryPaths,
    job: &Job,
    payload: &AttestationPayload,
) -> ContextPackProof {
    let mut proof = ContextPackProof::default();
    let mut violations = Vec::new();

    let Some(pack_id) = &job.context_pack_v1_id else {
        proof.violations = vec!["context_pack_v1_missing".to_string()];
        proof.verified = false;
        return proof;
    };
    proof.pack_id = Some(pack_id.clone());

    if payload.context_pack_v1_id != *pack_id {
        violations.push("context_pack_v1_id_mismatch".to_string());
    }

    let nonce = job.attestation_nonce.clone().unwrap_or_default();
    proof.nonce = Some(nonce.clone());
    if payload.attestation_nonce != nonce {
        violations.push("attestation_nonce_mismatch".to_string());
    }

    // Rendered pack bytes
    let pack_path = paths.rendered_pack_file(pack_id);
    match std::fs::read(&pack_path) {
        Ok(bytes) => {
            proof.pack_json = pair(&payload.context_pack_v1_json_sha256, plain_hash(&bytes));
            proof.pack_json_attest = pair(
                &payload.context_pack_v1_json_attest_sha256,
                salted_hash(&nonce, &bytes),
            );
            if !proof.pack_json.matches() {
                violations.push("context_pack_v1_sha256_mismatch".to_string());
            }
            if !proof.pack_json_attest.matches() {
                violations.push("context_pack_v1_attest_sha256_mismatch".to_string());
            }
        }
        Err(_) => violations.push("context_pack_v1_missing".to_string()),
    }

    // Task bundle files
    let bundle_dir = paths.task_bundle_dir(pack_id);
    let mut names: Vec<&str> = REQUIRED_BUNDLE_FILES.to_vec();
    for optional in OPTIONAL_BUNDLE_FILES {
        if bundle_dir.join(optional).exists() {
            names.push(optional);
        }
    }

    for name in names {
        let key = name.trim_end_matches(".json").to_string();
        match std::fs::read(bundle_dir.join(name)) {
            Ok(bytes) => {
                let plain = pair(
                    payload
                        .task_bundle_files_sha256
                        .get(&key)
                        .map(String::as_str)
                        .unwrap_or(""),
                    plain_hash(&bytes),
                );
                let attest = pair(
                    payload
                        .task_bundle_files_attest_sha256
                        .get(&key)
                        .map(String::as_str)
                        .unwrap_or(""),
                    salted_hash(&nonce, &bytes),
                );
                if !plain.matches() {
                    violations.push(format!("task_bundle_file_sha256_mismatch:{name}"));
                }
                if !attest.matches() {
                    violations.push(format!("task_bundle_file_attest_sha256_mismatch:{name}"));
                }
                if name == "manifest.json"
                    && payload.task_bundle_manifest_sha256 != plain.local.clone().unwrap_or_default()
                {
                    violations.push("task_bundle_manifest_sha256_mismatch".to_string());
                }
                proof.bundle_files.insert(key.clone(), plain);
                proof.bundle_files_attest.insert(key, attest);
            }
            Err(_) => violations.push(format!("task_bundle_file_missing:{name}")),
        }
    }

    proof.verified = violations.is_empty();
    proof.violations = violations;
    proof
}

/// Worker-side proof computation over the same files, used by the worker
/// simulator and the end-to-end tests.
pub fn compute_payload(
    paths: &FactoryPaths,
    pack_id: &str,
    nonce: &str,
) -> std::io::Result<AttestationPayload> {
    let pack_bytes = std::fs::read(paths.rendered_pack_file(pack_id))?;
    let mut payload = AttestationPayload {
        context_pack_v1_id: pack_id.to_string(),
        attestation_nonce: nonce.to_string(),
        context_pack_v1_json_sha256: plain_hash(&pack_bytes),
        context_pack_v1_json_attest_sha256: salted_hash(nonce, &pack_bytes),
        ..AttestationPayload::default()
    };

    let bundle_dir = paths.task_bundle_dir(pack_id);
    for name in REQUIRED_BUNDLE_FILES.iter().chain(OPTIONAL_BUNDLE_FILES) {
        let path = bundle_dir.join(name);
        if !path.exists() {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        let key = name.trim_end_matches(".json").to_string();
        let hash = plain_hash(&bytes);
        if *name == "manifest.json" {
            payload.task_bundle_manifest_sha256 = hash.clone();
        }
        payload.task_bundle_files_sha256.insert(key.clone(), hash);
        payload
            .task_bundle_files_attest_sha256
            .insert(key, salted_hash(nonce, &bytes));
    }
    Ok(payload)
}

fn plain_hash(bytes: &[u8]) -> String {
    ContentDigest::from_bytes(bytes).as_str().to_string()
}

fn salted_hash(nonce: &str, bytes: &[u8]) -> String {
    ContentDigest::from_bytes_with_prefix(nonce.as_bytes(), bytes)
        .as_str()
        .to_string()
}

fn pair(payload: &str, local: String) -> HashPair {
    HashPair {
        payload: if payload.is_empty() {
            None
        } else {
            Some(payload.to_string())
        },
        local: Some(local),
    }
}

/// Write the bundle files the worker will attest over.
pub fn write_task_bundle(
    paths: &FactoryPaths,
    pack_id: &str,
    manifest: &serde_json::Value,
    pins: &serde_json::Value,
    preflight: &serde_json::Value,
    task: &serde_json::Value,
    replay_bundle: Option<&serde_json::Value>,
) -> std::io::Result<()> {
    let dir = paths.task_bundle_dir(pack_id);
    std::fs::create_dir_all(&dir)?;
    write_canonical(&dir.join("manifest.json"), manifest)?;
    write_canonical(&dir.join("pins.json"), pins)?;
    write_canonical(&dir.join("preflight.json"), preflight)?;
    write_canonical(&dir.join("task.json"), task)?;
    if let Some(bundle) = replay_bundle {
        write_canonical(&dir.join("replay_bundle.json"), bundle)?;
    }
    Ok(())
}

fn write_canonical(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes)
}
