use serde::{Deserialize, Serialize};

/// Build provenance attached to register and heartbeat messages as `app_version`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub git_version: String,
    pub git_commit: String,
    pub git_tree_state: String,
    pub build_date: String,
    pub rust_version: String,
    pub compiler: String,
    pub platform: String,
}

impl BuildInfo {
    /// Build info for the running binary.
    ///
    /// Git fields come from `NODESYNC_GIT_VERSION`, `NODESYNC_GIT_COMMIT`,
    /// `NODESYNC_GIT_TREE_STATE` and `NODESYNC_BUILD_DATE` when they are set
    /// at compile time.
    pub fn current() -> Self {
        Self {
            git_version: option_env!("NODESYNC_GIT_VERSION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            git_commit: option_env!("NODESYNC_GIT_COMMIT")
                .unwrap_or("unknown")
                .to_string(),
            git_tree_state: option_env!("NODESYNC_GIT_TREE_STATE")
                .unwrap_or("unknown")
                .to_string(),
            build_date: option_env!("NODESYNC_BUILD_DATE")
                .unwrap_or("unknown")
                .to_string(),
            rust_version: option_env!("NODESYNC_RUST_VERSION")
                .unwrap_or("unknown")
                .to_string(),
            compiler: "rustc".to_string(),
            platform: platform(),
        }
    }

    pub fn with_git(mut self, version: impl Into<String>, commit: impl Into<String>) -> Self {
        self.git_version = version.into();
        self.git_commit = commit.into();
        self
    }

    pub fn with_tree_state(mut self, state: impl Into<String>) -> Self {
        self.git_tree_state = state.into();
        self
    }

    pub fn with_build_date(mut self, date: impl Into<String>) -> Self {
        self.build_date = date.into();
        self
    }
}

/// `<os>/<arch>` of the running binary
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_snake_case_fields() {
        let info = BuildInfo::current().with_git("v1.2.0", "abc123");
        let value = serde_json::to_value(&info).unwrap();

        assert_eq!(value["git_version"], "v1.2.0");
        assert_eq!(value["git_commit"], "abc123");
        assert_eq!(value["compiler"], "rustc");
        assert_eq!(value["platform"], platform());
        assert!(value.get("gitVersion").is_none());
    }
}
