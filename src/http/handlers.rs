use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::Rejection;
use crate::discovery::{ResolvedAddress, VipRole};
use crate::http::server::AppState;
use crate::load_balancer::BackendStats;
use crate::orchestrator::{LeadershipState, WorkerStatus};

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub locality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub version: u64,
    pub algorithm: String,
    pub backends: usize,
    pub eligible: usize,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub version: &'static str,
    pub leadership: Option<LeadershipState>,
    pub worker: Option<WorkerStatus>,
    pub vip: Option<VipRole>,
    pub lb_nodes: Option<usize>,
    pub groups: Vec<GroupSummary>,
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Serialize)]
pub struct GroupDetail {
    pub name: String,
    pub version: u64,
    pub store_version: u64,
    pub algorithm: String,
    pub backends: Vec<BackendStats>,
}

pub async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<Vec<ResolvedAddress>>, (StatusCode, &'static str)> {
    let Some(resolver) = &state.resolver else {
        return Err((StatusCode::NOT_FOUND, "discovery is not enabled on this node"));
    };
    Ok(Json(resolver.resolve(query.locality.as_deref())))
}

pub async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    let (groups, rejections) = match &state.cache {
        Some(cache) => {
            let table = cache.table();
            let mut groups: Vec<GroupSummary> = table
                .groups()
                .map(|g| GroupSummary {
                    name: g.name().to_string(),
                    version: g.version(),
                    algorithm: g.algorithm().to_string(),
                    backends: g.backends().len(),
                    eligible: g.eligible().len(),
                })
                .collect();
            groups.sort_by(|a, b| a.name.cmp(&b.name));
            (groups, cache.rejections())
        }
        None => (Vec::new(), Vec::new()),
    };

    Json(NodeStatus {
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        leadership: state.leadership.as_ref().map(|rx| rx.borrow().clone()),
        worker: state.worker.as_ref().map(|rx| rx.borrow().clone()),
        vip: state.vip.as_ref().map(|rx| *rx.borrow()),
        lb_nodes: state.resolver.as_ref().map(|r| r.nodes().len()),
        groups,
        rejections,
    })
}

pub async fn group(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<GroupDetail>, (StatusCode, String)> {
    let snapshot = state
        .cache
        .as_ref()
        .and_then(|cache| cache.group(&name))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("group {} not found", name)))?;

    Ok(Json(GroupDetail {
        name: snapshot.name().to_string(),
        version: snapshot.version(),
        store_version: snapshot.store_version(),
        algorithm: snapshot.algorithm().to_string(),
        backends: snapshot.backends().iter().map(|b| b.stats()).collect(),
    }))
}
