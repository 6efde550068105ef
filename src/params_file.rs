#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConvParams {
    #[serde(default = "default_projects")]
    pub(crate) projects: Vec<String>,
    #[serde(rename = "cross-project-commits", default = "false_")]
    pub(crate) cross_project_commits: bool,
    #[serde(rename = "cross-branch-commits", default = "false_")]
    pub(crate) cross_branch_commits: bool,
    #[serde(rename = "trunk-only", default = "false_")]
    pub(crate) trunk_only: bool,
    #[serde(rename = "commit-threshold-seconds", default = "default_commit_threshold")]
    pub(crate) commit_threshold_seconds: i64,
    #[serde(default = "default_encodings")]
    pub(crate) encodings: Vec<String>,
    #[serde(rename = "forced-branches", default = "Vec::new")]
    pub(crate) forced_branches: Vec<String>,
    #[serde(rename = "forced-tags", default = "Vec::new")]
    pub(crate) forced_tags: Vec<String>,
    #[serde(rename = "excluded-symbols", default = "Vec::new")]
    pub(crate) excluded_symbols: Vec<String>,
    #[serde(rename = "symbol-default", default = "default_symbol_default")]
    pub(crate) symbol_default: String,
    #[serde(rename = "keep-cvsignore", default = "false_")]
    pub(crate) keep_cvsignore: bool,
}

#[inline(always)]
fn false_() -> bool {
    false
}

fn default_projects() -> Vec<String> {
    vec![String::new()]
}

fn default_commit_threshold() -> i64 {
    300
}

fn default_encodings() -> Vec<String> {
    vec!["utf-8".into(), "latin1".into()]
}

fn default_symbol_default() -> String {
    "heuristic".into()
}
