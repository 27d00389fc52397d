use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};

use super::rsptag::{RspImageTag, RspImageTagCollection, RspImageType, TagVersion};

/// Display policy for one image category.
///
/// All specified criteria apply together: with both an age and a cutoff
/// version set, an image must be newer than the age and at or above the
/// cutoff to be displayed. An empty policy displays everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageFilterPolicy {
    /// Number of images to display.
    #[serde(default)]
    pub number: Option<usize>,
    /// Maximum age in seconds of images to display.
    #[serde(default)]
    pub age: Option<u64>,
    /// Minimum version to display (`major.minor.patch`). Ignored for tags
    /// with no parseable version.
    #[serde(default)]
    pub cutoff_version: Option<String>,
}

impl ImageFilterPolicy {
    fn cutoff(&self) -> Option<TagVersion> {
        let cutoff = self.cutoff_version.as_deref()?;
        let mut parts = cutoff.split('.');
        Some(TagVersion {
            major: parts.next()?.parse().ok()?,
            minor: parts.next()?.parse().ok()?,
            patch: parts.next()?.parse().ok()?,
            candidate: None,
        })
    }

    /// Whether a tag at the given position within its category passes.
    fn keep(&self, tag: &RspImageTag, index: usize, now: DateTime<Utc>) -> bool {
        if let Some(number) = self.number
            && index >= number
        {
            return false;
        }
        if let Some(age) = self.age {
            let Some(date) = tag.date else { return false };
            let cutoff = (now - Duration::seconds(age as i64)).date_naive();
            if date < cutoff {
                return false;
            }
        }
        if let Some(cutoff) = self.cutoff()
            && let Some(version) = tag.version
            && version < cutoff
        {
            return false;
        }
        true
    }
}

/// Display policy across all categories.
///
/// Aliases are always displayed and unknown tags never are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RspImageFilterPolicy {
    #[serde(default)]
    pub release: ImageFilterPolicy,
    #[serde(default)]
    pub weekly: ImageFilterPolicy,
    #[serde(default)]
    pub daily: ImageFilterPolicy,
    #[serde(default)]
    pub release_candidate: ImageFilterPolicy,
    #[serde(default)]
    pub experimental: ImageFilterPolicy,
}

impl RspImageFilterPolicy {
    fn policy_for(&self, image_type: RspImageType) -> Option<&ImageFilterPolicy> {
        match image_type {
            RspImageType::Release => Some(&self.release),
            RspImageType::Weekly => Some(&self.weekly),
            RspImageType::Daily => Some(&self.daily),
            RspImageType::Candidate => Some(&self.release_candidate),
            RspImageType::Experimental => Some(&self.experimental),
            RspImageType::Alias | RspImageType::Unknown => None,
        }
    }

    /// Whether a tag should be displayed, given its position within its
    /// category (newest first).
    pub fn keep(&self, tag: &RspImageTag, index: usize, now: DateTime<Utc>) -> bool {
        match tag.image_type {
            RspImageType::Alias => true,
            RspImageType::Unknown => false,
            image_type => self
                .policy_for(image_type)
                .map(|policy| policy.keep(tag, index, now))
                .unwrap_or(true),
        }
    }
}

/// Apply a display policy to a tag collection.
pub fn filter_tags(
    collection: &RspImageTagCollection,
    policy: &RspImageFilterPolicy,
    now: DateTime<Utc>,
) -> Vec<RspImageTag> {
    let mut kept = Vec::new();
    let mut index = 0;
    let mut current_type: Option<RspImageType> = None;
    for tag in collection.all_tags() {
        if current_type != Some(tag.image_type) {
            current_type = Some(tag.image_type);
            index = 0;
        }
        if policy.keep(tag, index, now) {
            kept.push(tag.clone());
        }
        index += 1;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn collection() -> RspImageTagCollection {
        let names: Vec<String> = [
            "recommended",
            "r22_0_0",
            "r21_0_1",
            "w_2077_46",
            "w_2077_45",
            "d_2077_10_21",
            "oddball",
        ]
        .iter()
        .map(|t| t.to_string())
        .collect();
        RspImageTagCollection::from_tag_names(&names, &HashSet::new(), None)
    }

    #[test]
    fn test_empty_policy_hides_only_unknown() {
        let policy = RspImageFilterPolicy::default();
        let kept = filter_tags(&collection(), &policy, Utc::now());
        let names: Vec<&str> = kept.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(
            names,
            ["recommended", "r22_0_0", "r21_0_1", "w_2077_46", "w_2077_45", "d_2077_10_21"]
        );
    }

    #[test]
    fn test_number_policy() {
        let policy = RspImageFilterPolicy {
            release: ImageFilterPolicy { number: Some(1), ..Default::default() },
            ..Default::default()
        };
        let kept = filter_tags(&collection(), &policy, Utc::now());
        let names: Vec<&str> = kept.iter().map(|t| t.tag.as_str()).collect();
        assert!(names.contains(&"r22_0_0"));
        assert!(!names.contains(&"r21_0_1"));
    }

    #[test]
    fn test_cutoff_version_policy() {
        let policy = RspImageFilterPolicy {
            release: ImageFilterPolicy {
                cutoff_version: Some("22.0.0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let kept = filter_tags(&collection(), &policy, Utc::now());
        let names: Vec<&str> = kept.iter().map(|t| t.tag.as_str()).collect();
        assert!(names.contains(&"r22_0_0"));
        assert!(!names.contains(&"r21_0_1"));
        // Weeklies are untouched by the release policy.
        assert!(names.contains(&"w_2077_45"));
    }

    #[test]
    fn test_age_policy() {
        // Tags from 2077 are in the future relative to the test run, so an
        // age policy keeps them; a tag before the cutoff is dropped.
        let names: Vec<String> =
            ["d_2077_10_21".to_string(), "d_2001_01_01".to_string()].to_vec();
        let collection = RspImageTagCollection::from_tag_names(&names, &HashSet::new(), None);
        let policy = RspImageFilterPolicy {
            daily: ImageFilterPolicy { age: Some(86400 * 30), ..Default::default() },
            ..Default::default()
        };
        let kept = filter_tags(&collection, &policy, Utc::now());
        let names: Vec<&str> = kept.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, ["d_2077_10_21"]);
    }
}
