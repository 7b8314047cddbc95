//! Candidate filtering.
//!
//! An empty allow-list admits everyone; block-lists always win. Rules can
//! be overridden per command basename.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scan::ProcessInfo;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub uid_allow: Vec<u32>,
    pub uid_block: Vec<u32>,
    pub ppid_allow: Vec<i32>,
    pub ppid_block: Vec<i32>,
    /// Skip processes younger than this; too-short-lived work is not
    /// worth a cgroup.
    pub min_age_secs: Option<u64>,
    /// Skip processes older than this; attaching limits to something that
    /// has run unbounded for hours only causes surprises.
    pub max_age_secs: Option<u64>,
    pub cwd_allow: Vec<PathBuf>,
    pub cwd_block: Vec<PathBuf>,
}

impl FilterRules {
    pub fn admits(&self, p: &ProcessInfo) -> bool {
        if self.uid_block.contains(&p.uid) {
            return false;
        }
        if !self.uid_allow.is_empty() && !self.uid_allow.contains(&p.uid) {
            return false;
        }

        if self.ppid_block.contains(&p.ppid) {
            return false;
        }
        if !self.ppid_allow.is_empty() && !self.ppid_allow.contains(&p.ppid) {
            return false;
        }

        let age = p.age.as_secs();
        if let Some(min) = self.min_age_secs {
            if age < min {
                return false;
            }
        }
        if let Some(max) = self.max_age_secs {
            if age > max {
                return false;
            }
        }

        if let Some(cwd) = &p.cwd {
            if self.cwd_block.iter().any(|prefix| cwd.starts_with(prefix)) {
                return false;
            }
            if !self.cwd_allow.is_empty()
                && !self.cwd_allow.iter().any(|prefix| cwd.starts_with(prefix))
            {
                return false;
            }
        } else if !self.cwd_allow.is_empty() {
            // Unknown cwd cannot prove membership in the allow-list.
            return false;
        }

        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub default: FilterRules,
    /// Keyed by command basename; a present entry replaces the default
    /// rules for that command entirely.
    pub per_command: HashMap<String, FilterRules>,
}

impl Filter {
    pub fn admits(&self, p: &ProcessInfo) -> bool {
        self.per_command
            .get(&p.comm)
            .unwrap_or(&self.default)
            .admits(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn proc(uid: u32, ppid: i32, age_secs: u64, cwd: Option<&str>) -> ProcessInfo {
        ProcessInfo {
            pid: 100,
            ppid,
            uid,
            comm: "ffmpeg".into(),
            cmdline: vec!["ffmpeg".into()],
            cwd: cwd.map(PathBuf::from),
            age: Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn test_empty_rules_admit_everything() {
        let rules = FilterRules::default();
        assert!(rules.admits(&proc(0, 1, 0, None)));
    }

    #[test]
    fn test_uid_lists() {
        let rules = FilterRules {
            uid_allow: vec![1000],
            uid_block: vec![0],
            ..Default::default()
        };
        assert!(rules.admits(&proc(1000, 1, 0, None)));
        assert!(!rules.admits(&proc(33, 1, 0, None)));
        // Block wins even when also allowed.
        let rules = FilterRules {
            uid_allow: vec![0],
            uid_block: vec![0],
            ..Default::default()
        };
        assert!(!rules.admits(&proc(0, 1, 0, None)));
    }

    #[test]
    fn test_age_window() {
        let rules = FilterRules {
            min_age_secs: Some(10),
            max_age_secs: Some(3600),
            ..Default::default()
        };
        assert!(!rules.admits(&proc(0, 1, 5, None)));
        assert!(rules.admits(&proc(0, 1, 60, None)));
        assert!(!rules.admits(&proc(0, 1, 7200, None)));
    }

    #[test]
    fn test_cwd_prefixes() {
        let rules = FilterRules {
            cwd_allow: vec![PathBuf::from("/srv/media")],
            cwd_block: vec![PathBuf::from("/srv/media/tmp")],
            ..Default::default()
        };
        assert!(rules.admits(&proc(0, 1, 0, Some("/srv/media/job1"))));
        assert!(!rules.admits(&proc(0, 1, 0, Some("/srv/media/tmp/x"))));
        assert!(!rules.admits(&proc(0, 1, 0, Some("/home/op"))));
        assert!(!rules.admits(&proc(0, 1, 0, None)));
    }

    #[test]
    fn test_per_command_override_replaces_default() {
        let filter = Filter {
            default: FilterRules {
                uid_block: vec![33],
                ..Default::default()
            },
            per_command: [(
                "ffmpeg".to_string(),
                FilterRules {
                    min_age_secs: Some(30),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
        };
        // The override has no uid_block, so uid 33 is admitted once old
        // enough.
        assert!(filter.admits(&proc(33, 1, 60, None)));
        assert!(!filter.admits(&proc(33, 1, 5, None)));
    }
}
