//! Persisted layout of the control plane inside the coordination store.

pub const LB_CONFIGS_PATH: &str = "/lb-configs";
pub const HEALTH_PATH: &str = "/health";
pub const LEADER_PATH: &str = "/orchestrator/leader";
pub const WORKERS_PATH: &str = "/orchestrator/workers";
pub const LB_NODES_PATH: &str = "/lb-nodes";

/// Join path segments with `/`, trimming stray separators.
pub fn join_path(parts: &[&str]) -> String {
    let mut path = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        path.push('/');
        path.push_str(trimmed);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

pub fn group_config_path(group: &str) -> String {
    join_path(&[LB_CONFIGS_PATH, group])
}

pub fn group_health_path(group: &str) -> String {
    join_path(&[HEALTH_PATH, group])
}

pub fn backend_health_path(group: &str, backend_id: &str) -> String {
    join_path(&[HEALTH_PATH, group, backend_id])
}

pub fn worker_path(worker_id: &str) -> String {
    join_path(&[WORKERS_PATH, worker_id])
}

pub fn lb_node_path(node_id: &str) -> String {
    join_path(&[LB_NODES_PATH, node_id])
}

/// Last segment of a path (`/health/api/b1` -> `b1`).
pub fn leaf(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Segments below `prefix` (`/health/api/b1` under `/health` -> `["api", "b1"]`).
pub fn segments_under<'a>(prefix: &str, path: &'a str) -> Vec<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => {
            rest.split('/').filter(|s| !s.is_empty()).collect()
        }
        _ => Vec::new(),
    }
}
