//! Deterministic translation from (project, branch) to the identifiers the
//! Storage and Container drivers key off. No I/O, no state — pure functions.

const CONTAINER_PREFIX: &str = "pgforge";

/// Lowercase, collapse runs of non-`[a-z0-9-]` to a single `-`, trim leading
/// and trailing `-`. Returns the canonical form and whether it differs from
/// the input, so callers can tell the user "interpreted as X" without this
/// module owning any presentation concern.
pub fn canonicalize(input: &str) -> (String, bool) {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }

    let trimmed = out.trim_matches('-').to_string();
    let changed = trimmed != input;
    (trimmed, changed)
}

/// `"<prefix>-<project>-<branch>"`. Inputs must already be canonical.
pub fn container_name(project: &str, branch: &str) -> String {
    format!("{CONTAINER_PREFIX}-{project}-{branch}")
}

/// `"<project>-<branch>"`, the dataset leaf (spec §3: `zfsDatasetName`).
pub fn dataset_name(project: &str, branch: &str) -> String {
    format!("{project}-{branch}")
}

/// `"<pool>/<base>/<datasetName>"`, the full dataset path (spec §3: `zfsDataset`).
pub fn dataset_path(pool: &str, base: &str, project: &str, branch: &str) -> String {
    format!("{pool}/{base}/{}", dataset_name(project, branch))
}

/// `"<datasetPath>@<snapName>"`.
pub fn snapshot_ref(dataset_path: &str, snap_name: &str) -> String {
    format!("{dataset_path}@{snap_name}")
}

/// `"<project>/<branch>"`, the fully qualified branch name (spec §3).
pub fn branch_namespace(project: &str, branch: &str) -> String {
    format!("{project}/{branch}")
}

/// Splits a `"<project>/<branch>"` namespace into its parts.
pub fn split_namespace(namespace: &str) -> Option<(&str, &str)> {
    namespace.split_once('/')
}

/// `YYYY-MM-DDTHH-MM-SS[-<label>]`, sortable, colons replaced with dashes
/// (spec §6 Naming surface).
pub fn snapshot_name(created_at: chrono::DateTime<chrono::Utc>, label: Option<&str>) -> String {
    let stamp = created_at.format("%Y-%m-%dT%H-%M-%S").to_string();
    match label {
        Some(label) => {
            let (label, _) = canonicalize(label);
            format!("{stamp}-{label}")
        }
        None => stamp,
    }
}
