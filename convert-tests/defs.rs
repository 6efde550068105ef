use std::collections::BTreeMap;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Test {
    /// RCS files to materialize, keyed by repository-relative path
    /// (including the `,v` suffix and any `Attic/` component).
    #[serde(rename = "rcs-files")]
    pub(crate) rcs_files: BTreeMap<String, String>,
    #[serde(rename = "conv-params")]
    pub(crate) conv_params: String,
    #[serde(rename = "failed", default = "false_")]
    pub(crate) failed: bool,
    /// Substrings that must appear in the conversion log.
    #[serde(rename = "log-contains", default = "Vec::new")]
    pub(crate) log_contains: Vec<String>,
    /// Exact expected commit timestamps, in commit order.
    #[serde(rename = "timestamps")]
    pub(crate) timestamps: Option<Vec<i64>>,
    #[serde(rename = "min-commits")]
    pub(crate) min_commits: Option<usize>,
    #[serde(rename = "max-commits")]
    pub(crate) max_commits: Option<usize>,
    /// Substrings that must appear in the commit plan, in this order.
    #[serde(rename = "plan-sequence", default = "Vec::new")]
    pub(crate) plan_sequence: Vec<String>,
    /// Substrings that must not appear in the commit plan at all.
    #[serde(rename = "plan-absent", default = "Vec::new")]
    pub(crate) plan_absent: Vec<String>,
    /// Exact occurrence counts of commit plan substrings.
    #[serde(rename = "plan-counts", default = "Vec::new")]
    pub(crate) plan_counts: Vec<PlanCount>,
    /// Also convert in two stages (passes 1-6, then 7-12) and require
    /// byte-identical outputs.
    #[serde(rename = "two-stage", default = "false_")]
    pub(crate) two_stage: bool,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PlanCount {
    pub(crate) contains: String,
    pub(crate) count: usize,
}

#[inline(always)]
fn false_() -> bool {
    false
}
