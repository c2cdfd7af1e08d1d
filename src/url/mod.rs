use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Planner ids are url-safe base64 strings, 28 characters in practice.
static RE_PLANNER_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{16,64}$").unwrap());

const PLANNER_HOSTS: [&str; 3] = [
    "tasks.office.com",
    "planner.cloud.microsoft",
    "tasks.microsoft.com",
];

/// Parsed information from a Planner web URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerUrlInfo {
    Plan {
        plan_id: String,
    },
    Task {
        task_id: String,
        plan_id: Option<String>,
    },
}

/// Parse a Planner web URL into its identifiers.
///
/// Supported URL patterns:
/// - `https://tasks.office.com/<tenant>/Home/PlanViews/<plan_id>`
/// - `https://tasks.office.com/<tenant>/Home/Planner/#/plantaskboard?groupId=<g>&planId=<plan_id>`
/// - `https://tasks.office.com/<tenant>/Home/Task/<task_id>`
/// - `https://planner.cloud.microsoft/webui/plan/<plan_id>/view/board`
/// - `https://planner.cloud.microsoft/webui/plan/<plan_id>/view/board/task/<task_id>`
///
/// Query parameters are read from both the query string and the fragment,
/// since the classic web app keeps its route in the fragment.
pub fn parse_planner_url(input: &str) -> Result<PlannerUrlInfo> {
    let url = url::Url::parse(input)?;

    let host = url.host_str().unwrap_or("");
    if !PLANNER_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h)) {
        return Err(Error::UrlParse(format!("not a Planner URL: {input}")));
    }

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if let Some((_, query)) = url.fragment().and_then(|f| f.split_once('?')) {
        params.extend(
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
    }
    let param = |name: &str| {
        params
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(name) && is_planner_id(v))
            .map(|(_, v)| v.clone())
    };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let after = |marker: &str| {
        segments
            .iter()
            .position(|s| s.eq_ignore_ascii_case(marker))
            .and_then(|i| segments.get(i + 1))
            .filter(|s| is_planner_id(s))
            .map(|s| s.to_string())
    };

    let plan_id = param("planId")
        .or_else(|| after("plan"))
        .or_else(|| after("PlanViews"));
    let task_id = param("taskId").or_else(|| after("task"));

    match (task_id, plan_id) {
        (Some(task_id), plan_id) => Ok(PlannerUrlInfo::Task { task_id, plan_id }),
        (None, Some(plan_id)) => Ok(PlannerUrlInfo::Plan { plan_id }),
        (None, None) => Err(Error::UrlParse(format!("no plan id in URL: {input}"))),
    }
}

/// Check if a string looks like a Planner entity id.
pub fn is_planner_id(s: &str) -> bool {
    RE_PLANNER_ID.is_match(s)
}

/// Extract a board (plan) id from either a raw id or a Planner URL.
pub fn resolve_board_id(input: &str) -> Result<String> {
    let input = input.trim();
    if is_planner_id(input) {
        return Ok(input.to_string());
    }
    if !input.contains("://") {
        return Err(Error::UrlParse(format!("not a board id or URL: {input}")));
    }
    match parse_planner_url(input)? {
        PlannerUrlInfo::Plan { plan_id } | PlannerUrlInfo::Task { plan_id: Some(plan_id), .. } => {
            Ok(plan_id)
        }
        PlannerUrlInfo::Task { task_id, plan_id: None } => Err(Error::UrlParse(format!(
            "URL names task {task_id} but not its board: {input}"
        ))),
    }
}
