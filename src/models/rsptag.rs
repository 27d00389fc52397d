use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::{Display, EnumIter};

use crate::errors::ControllerError;

/// Default tag to use when a tag string is empty.
const DOCKER_DEFAULT_TAG: &str = "latest";

/// Category of an image tag.
///
/// The variant order doubles as the display order: aliases always come
/// first, unknown tags always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
pub enum RspImageType {
    #[strum(serialize = "Alias")]
    Alias,
    #[strum(serialize = "Release")]
    Release,
    #[strum(serialize = "Weekly")]
    Weekly,
    #[strum(serialize = "Daily")]
    Daily,
    #[strum(serialize = "Release Candidate")]
    Candidate,
    #[strum(serialize = "Experimental")]
    Experimental,
    #[strum(serialize = "Unknown")]
    Unknown,
}

/// Semantic version extracted from a tag, used only for ordering within a
/// single category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Release-candidate number, set only for the candidate category.
    pub candidate: Option<u32>,
}

static RELEASE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^r(\d+)_(\d+)_(\d+)(?:_rc(\d+))?(?:_(.*))?$").unwrap());
static WEEKLY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^w_(\d+)_(\d+)(?:_(.*))?$").unwrap());
static DAILY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^d_(\d+)_(\d+)_(\d+)(?:_(.*))?$").unwrap());
static CYCLE_FRAGMENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^c(\d+)(?:\.(\d+))?$").unwrap());
static RSP_BUILD_FRAGMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rsp(\d+)$").unwrap());
static TRAILING_CYCLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)_c(\d+)(?:\.(\d+))?$").unwrap());

/// Optional fragments trailing the base form of a tag.
#[derive(Debug, Default)]
struct TagSuffix {
    cycle: Option<u32>,
    cycle_str: Option<String>,
    cycle_build: Option<u32>,
    cycle_build_str: Option<String>,
    rsp_build: Option<u32>,
    extra: Option<String>,
}

impl TagSuffix {
    /// Parse the `_`-separated fragments after the base tag form. The cycle
    /// (`cNNNN.NNN`) and RSP build (`rspNN`) fragments are recognized
    /// anywhere; everything else joins into a display-only extra string.
    fn parse(rest: &str) -> Self {
        let mut suffix = TagSuffix::default();
        let mut extra: Vec<&str> = Vec::new();
        for fragment in rest.split('_') {
            if suffix.cycle.is_none()
                && let Some(captures) = CYCLE_FRAGMENT_REGEX.captures(fragment)
            {
                suffix.cycle = captures[1].parse().ok();
                suffix.cycle_str = Some(captures[1].to_string());
                if let Some(build) = captures.get(2) {
                    suffix.cycle_build = build.as_str().parse().ok();
                    suffix.cycle_build_str = Some(build.as_str().to_string());
                }
            } else if suffix.rsp_build.is_none()
                && let Some(captures) = RSP_BUILD_FRAGMENT_REGEX.captures(fragment)
            {
                suffix.rsp_build = captures[1].parse().ok();
            } else {
                extra.push(fragment);
            }
        }
        if !extra.is_empty() {
            suffix.extra = Some(extra.join("_"));
        }
        suffix
    }

    /// Display decoration for the suffix fragments, appended to the base
    /// display name of the tag.
    fn display(&self) -> String {
        let mut display = String::new();
        if let Some(rsp_build) = self.rsp_build {
            display.push_str(&format!(" (RSP Build {rsp_build})"));
        }
        if let Some(cycle) = &self.cycle_str {
            match &self.cycle_build_str {
                Some(build) => display.push_str(&format!(" (SAL Cycle {cycle}, Build {build})")),
                None => display.push_str(&format!(" (SAL Cycle {cycle})")),
            }
        }
        if let Some(extra) = &self.extra {
            display.push_str(&format!(" [{extra}]"));
        }
        display
    }
}

/// A parsed Docker tag in the science platform tag taxonomy.
///
/// Two tags of the same category admit a total order; ordering across
/// categories is undefined and reported as an error rather than silently
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RspImageTag {
    /// The tag string itself.
    pub tag: String,
    /// Category the tag belongs to.
    pub image_type: RspImageType,
    /// Version for ordering, present for dated and versioned categories.
    pub version: Option<TagVersion>,
    /// SAL cycle number, if the tag carries one.
    pub cycle: Option<u32>,
    /// Build number within the SAL cycle.
    pub cycle_build: Option<u32>,
    /// RSP build number, if the tag carries one.
    pub rsp_build: Option<u32>,
    /// Display-only suffix with no other meaning.
    pub extra: Option<String>,
    /// Human-readable name shown on the spawner menu.
    pub display_name: String,
    /// Date encoded in the tag (the daily's date or the weekly's Monday).
    pub date: Option<NaiveDate>,
}

impl RspImageTag {
    /// Parse a tag string. Unparseable tags are classified as unknown with
    /// the tag itself as the display name.
    pub fn from_str(tag: &str) -> Self {
        let tag = if tag.is_empty() { DOCKER_DEFAULT_TAG } else { tag };
        if let Some(rest) = tag.strip_prefix("exp_") {
            return Self::experimental(tag, rest);
        }
        Self::from_base(tag).unwrap_or_else(|| Self::unknown(tag))
    }

    /// Construct an alias tag. The tag itself is not parseable, but a
    /// trailing cycle fragment is recognized and the rest becomes a
    /// title-cased display name.
    pub fn alias(tag: &str) -> Self {
        let (base, suffix) = match TRAILING_CYCLE_REGEX.captures(tag) {
            Some(captures) => {
                let mut suffix = TagSuffix::default();
                suffix.cycle = captures[2].parse().ok();
                suffix.cycle_str = Some(captures[2].to_string());
                if let Some(build) = captures.get(3) {
                    suffix.cycle_build = build.as_str().parse().ok();
                    suffix.cycle_build_str = Some(build.as_str().to_string());
                }
                (captures[1].to_string(), suffix)
            }
            None => (tag.to_string(), TagSuffix::default()),
        };
        let display_name = format!("{}{}", titlecase(&base), suffix.display());
        RspImageTag {
            tag: tag.to_string(),
            image_type: RspImageType::Alias,
            version: None,
            cycle: suffix.cycle,
            cycle_build: suffix.cycle_build,
            rsp_build: None,
            extra: suffix.extra,
            display_name,
            date: None,
        }
    }

    /// Compare two tags of the same category.
    ///
    /// `Greater` means `self` is newer. Tags of different categories cannot
    /// be ordered and return an error instead.
    pub fn cmp_same_type(&self, other: &Self) -> Result<Ordering, ControllerError> {
        if self.image_type != other.image_type {
            return Err(ControllerError::IncomparableImageTypes);
        }
        Ok(self.sort_key().cmp(&other.sort_key()))
    }

    pub(crate) fn sort_key(
        &self,
    ) -> (Option<TagVersion>, Option<u32>, Option<u32>, Option<u32>, &Option<String>, &str) {
        (
            self.version,
            self.rsp_build,
            self.cycle,
            self.cycle_build,
            &self.extra,
            &self.tag,
        )
    }

    fn from_base(tag: &str) -> Option<Self> {
        if let Some(captures) = RELEASE_REGEX.captures(tag) {
            let major: u32 = captures[1].parse().ok()?;
            let minor: u32 = captures[2].parse().ok()?;
            let patch: u32 = captures[3].parse().ok()?;
            let candidate: Option<u32> = captures.get(4).and_then(|m| m.as_str().parse().ok());
            let suffix = captures
                .get(5)
                .map(|m| TagSuffix::parse(m.as_str()))
                .unwrap_or_default();
            let (image_type, display) = match candidate {
                Some(rc) => (
                    RspImageType::Candidate,
                    format!("Release Candidate r{major}.{minor}.{patch}-rc{rc}"),
                ),
                None => (RspImageType::Release, format!("Release r{major}.{minor}.{patch}")),
            };
            return Some(Self::from_parts(
                tag,
                image_type,
                TagVersion { major, minor, patch, candidate },
                display,
                suffix,
                None,
            ));
        }
        if let Some(captures) = WEEKLY_REGEX.captures(tag) {
            let year: u32 = captures[1].parse().ok()?;
            let week: u32 = captures[2].parse().ok()?;
            let suffix = captures
                .get(3)
                .map(|m| TagSuffix::parse(m.as_str()))
                .unwrap_or_default();
            let display = format!("Weekly {}_{}", &captures[1], &captures[2]);
            let date = NaiveDate::from_isoywd_opt(year as i32, week, Weekday::Mon);
            return Some(Self::from_parts(
                tag,
                RspImageType::Weekly,
                TagVersion { major: year, minor: week, patch: 0, candidate: None },
                display,
                suffix,
                date,
            ));
        }
        if let Some(captures) = DAILY_REGEX.captures(tag) {
            let year: u32 = captures[1].parse().ok()?;
            let month: u32 = captures[2].parse().ok()?;
            let day: u32 = captures[3].parse().ok()?;
            let suffix = captures
                .get(4)
                .map(|m| TagSuffix::parse(m.as_str()))
                .unwrap_or_default();
            let display = format!("Daily {}_{}_{}", &captures[1], &captures[2], &captures[3]);
            let date = NaiveDate::from_ymd_opt(year as i32, month, day);
            return Some(Self::from_parts(
                tag,
                RspImageType::Daily,
                TagVersion { major: year, minor: month, patch: day, candidate: None },
                display,
                suffix,
                date,
            ));
        }
        None
    }

    fn from_parts(
        tag: &str,
        image_type: RspImageType,
        version: TagVersion,
        base_display: String,
        suffix: TagSuffix,
        date: Option<NaiveDate>,
    ) -> Self {
        RspImageTag {
            tag: tag.to_string(),
            image_type,
            version: Some(version),
            cycle: suffix.cycle,
            cycle_build: suffix.cycle_build,
            rsp_build: suffix.rsp_build,
            display_name: format!("{base_display}{}", suffix.display()),
            extra: suffix.extra,
            date,
        }
    }

    fn experimental(tag: &str, rest: &str) -> Self {
        let inner = Self::from_base(rest).unwrap_or_else(|| Self::unknown(rest));
        RspImageTag {
            tag: tag.to_string(),
            image_type: RspImageType::Experimental,
            version: inner.version,
            cycle: inner.cycle,
            cycle_build: inner.cycle_build,
            rsp_build: inner.rsp_build,
            extra: inner.extra,
            display_name: format!("Experimental {}", inner.display_name),
            date: inner.date,
        }
    }

    fn unknown(tag: &str) -> Self {
        // Even unparseable tags can carry a cycle, which matters for the
        // cycle filter on instruments that are pinned to a SAL cycle.
        let (cycle, cycle_build) = match TRAILING_CYCLE_REGEX.captures(tag) {
            Some(captures) => (
                captures[2].parse().ok(),
                captures.get(3).and_then(|m| m.as_str().parse().ok()),
            ),
            None => (None, None),
        };
        RspImageTag {
            tag: tag.to_string(),
            image_type: RspImageType::Unknown,
            version: None,
            cycle,
            cycle_build,
            rsp_build: None,
            extra: None,
            display_name: tag.to_string(),
            date: None,
        }
    }
}

impl PartialOrd for RspImageTag {
    /// `None` when the tags belong to different categories.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.cmp_same_type(other).ok()
    }
}

fn titlecase(tag: &str) -> String {
    tag.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a tag name should be treated as an alias.
///
/// Aliases are the configured set plus anything that looks like a floating
/// pointer into the taxonomy.
pub fn is_alias_tag(tag: &str, aliases: &HashSet<String>) -> bool {
    aliases.contains(tag) || tag.contains("recommended") || tag.contains("latest")
}

/// An ordered collection of parsed tags.
///
/// Iteration yields aliases first, then each category newest first, with
/// unknown tags last in reverse lexical order.
#[derive(Debug, Clone, Default)]
pub struct RspImageTagCollection {
    by_type: BTreeMap<RspImageType, Vec<RspImageTag>>,
}

impl RspImageTagCollection {
    pub fn new(tags: Vec<RspImageTag>) -> Self {
        let mut by_type: BTreeMap<RspImageType, Vec<RspImageTag>> = BTreeMap::new();
        for tag in tags {
            by_type.entry(tag.image_type).or_default().push(tag);
        }
        for tags in by_type.values_mut() {
            tags.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        }
        RspImageTagCollection { by_type }
    }

    /// Parse a set of tag names into a collection, identifying aliases and
    /// optionally dropping everything outside one SAL cycle.
    pub fn from_tag_names(
        names: &[String],
        aliases: &HashSet<String>,
        cycle: Option<u32>,
    ) -> Self {
        let tags = names
            .iter()
            .map(|name| {
                if is_alias_tag(name, aliases) {
                    RspImageTag::alias(name)
                } else {
                    RspImageTag::from_str(name)
                }
            })
            .filter(|tag| cycle.is_none() || tag.cycle == cycle)
            .collect();
        Self::new(tags)
    }

    pub fn all_tags(&self) -> impl Iterator<Item = &RspImageTag> {
        self.by_type.values().flatten()
    }

    pub fn tag_for_tag_name(&self, name: &str) -> Option<&RspImageTag> {
        self.all_tags().find(|tag| tag.tag == name)
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(Vec::is_empty)
    }

    /// Restrict the collection to the latest tags per dated category, plus
    /// any tag named in `include`.
    pub fn subset(
        &self,
        releases: usize,
        weeklies: usize,
        dailies: usize,
        include: &HashSet<String>,
    ) -> Self {
        let mut tags = Vec::new();
        for (image_type, count) in [
            (RspImageType::Release, releases),
            (RspImageType::Weekly, weeklies),
            (RspImageType::Daily, dailies),
        ] {
            if let Some(candidates) = self.by_type.get(&image_type) {
                tags.extend(candidates.iter().take(count).cloned());
            }
        }
        let included: Vec<_> = self
            .all_tags()
            .filter(|tag| include.contains(&tag.tag))
            .filter(|tag| !tags.iter().any(|t| t.tag == tag.tag))
            .cloned()
            .collect();
        tags.extend(included);
        Self::new(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashset;

    #[test]
    fn test_tag_ordering() {
        let one = RspImageTag::from_str("r21_0_1");
        let two = RspImageTag::from_str("r21_0_2");
        assert_eq!(one, one.clone());
        assert!(one < two);
        assert!(two > one);

        let three = RspImageTag::from_str("d_2023_02_09");
        assert_ne!(one, three);
        assert!(one.partial_cmp(&three).is_none());
        assert!(one.cmp_same_type(&three).is_err());

        let four = RspImageTag::from_str("d_2023_02_10_c0030.004");
        assert!(three < four);
        let five = RspImageTag::from_str("d_2023_02_10_c0031.004");
        assert!(four < five);
        let six = RspImageTag::from_str("d_2023_02_10_c0031.005");
        assert!(five < six);

        let seven = RspImageTag::from_str("r21_0_1_rsp29");
        assert!(one < seven);
        let eight = RspImageTag::from_str("r21_0_1_rsp103");
        assert!(seven < eight);
        let nine = RspImageTag::from_str("r21_0_1_rsp103_extra");
        assert!(eight < nine);
        let ten = RspImageTag::from_str("r21_0_1_rsp103_foo");
        assert!(nine < ten);
        assert_eq!(ten, RspImageTag::from_str("r21_0_1_rsp103_foo"));

        let exp_one = RspImageTag::from_str("exp_20230209");
        let exp_two = RspImageTag::from_str("exp_random");
        assert!(exp_one < exp_two);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(RspImageTag::from_str("r21_0_1").display_name, "Release r21.0.1");
        assert_eq!(
            RspImageTag::from_str("r22_0_0_rc1").display_name,
            "Release Candidate r22.0.0-rc1"
        );
        assert_eq!(RspImageTag::from_str("w_2021_22").display_name, "Weekly 2021_22");
        assert_eq!(
            RspImageTag::from_str("d_2021_05_27").display_name,
            "Daily 2021_05_27"
        );
        assert_eq!(
            RspImageTag::from_str("exp_w_2021_22").display_name,
            "Experimental Weekly 2021_22"
        );
        assert_eq!(
            RspImageTag::from_str("d_2021_05_27_rsp19_c0020.001_random").display_name,
            "Daily 2021_05_27 (RSP Build 19) (SAL Cycle 0020, Build 001) [random]"
        );
        assert_eq!(
            RspImageTag::from_str("MiXeD_CaSe_TaG").display_name,
            "MiXeD_CaSe_TaG"
        );

        let empty = RspImageTag::from_str("");
        assert_eq!(empty.tag, "latest");
        assert_eq!(empty.image_type, RspImageType::Unknown);
    }

    #[test]
    fn test_parsed_fields() {
        let tag = RspImageTag::from_str("w_2077_40_c0027.001");
        assert_eq!(tag.image_type, RspImageType::Weekly);
        assert_eq!(tag.cycle, Some(27));
        assert_eq!(tag.cycle_build, Some(1));
        assert_eq!(
            tag.version,
            Some(TagVersion { major: 2077, minor: 40, patch: 0, candidate: None })
        );

        let tag = RspImageTag::from_str("d_2021_05_27");
        assert_eq!(tag.date, NaiveDate::from_ymd_opt(2021, 5, 27));
        let tag = RspImageTag::from_str("w_2021_22");
        assert_eq!(tag.date, NaiveDate::from_isoywd_opt(2021, 22, Weekday::Mon));
    }

    #[test]
    fn test_alias() {
        let tag = RspImageTag::alias("recommended");
        assert_eq!(tag.image_type, RspImageType::Alias);
        assert_eq!(tag.display_name, "Recommended");
        assert_eq!(tag.cycle, None);

        let tag = RspImageTag::alias("latest_weekly_c0046");
        assert_eq!(tag.display_name, "Latest Weekly (SAL Cycle 0046)");
        assert_eq!(tag.cycle, Some(46));
    }

    #[test]
    fn test_collection() {
        // Expected iteration order: aliases, then each category newest
        // first, unknown tags last.
        let tags = [
            "recommended_c0027",
            "recommended",
            "r21_0_1",
            "r20_0_1_c0027.001",
            "w_2077_46",
            "w_2077_45",
            "w_2077_44",
            "w_2077_43",
            "w_2077_42",
            "w_2077_40_c0027.001",
            "w_2077_40_c0026.001",
            "d_2077_10_21",
            "d_2077_10_20",
            "r22_0_0_rc1",
            "exp_w_2021_22",
        ];
        let mut shuffled: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        shuffled.reverse();

        let collection = RspImageTagCollection::from_tag_names(&shuffled, &HashSet::new(), None);
        let ordered: Vec<&str> = collection.all_tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(ordered, tags);

        assert!(collection.tag_for_tag_name("w_2077_46").is_some());
        assert!(collection.tag_for_tag_name("w_2080_01").is_none());

        // Filter by cycle.
        let collection = RspImageTagCollection::from_tag_names(&shuffled, &HashSet::new(), Some(27));
        let ordered: Vec<&str> = collection.all_tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(
            ordered,
            ["recommended_c0027", "r20_0_1_c0027.001", "w_2077_40_c0027.001"]
        );

        // Subsetting.
        let collection = RspImageTagCollection::from_tag_names(&shuffled, &HashSet::new(), None);
        let subset = collection.subset(1, 3, 1, &HashSet::new());
        let ordered: Vec<&str> = subset.all_tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(ordered, ["r21_0_1", "w_2077_46", "w_2077_45", "w_2077_44", "d_2077_10_21"]);

        let subset = collection.subset(1, 3, 1, &hashset! {"recommended".to_string()});
        let ordered: Vec<&str> = subset.all_tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(
            ordered,
            ["recommended", "r21_0_1", "w_2077_46", "w_2077_45", "w_2077_44", "d_2077_10_21"]
        );

        let subset = subset.subset(0, 0, 1, &HashSet::new());
        let ordered: Vec<&str> = subset.all_tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(ordered, ["d_2077_10_21"]);
    }

    #[test]
    fn test_round_trip() {
        for tag in ["r21_0_1", "w_2077_46", "d_2077_10_21_c0027.001", "exp_w_2021_22", "oddball"] {
            let parsed = RspImageTag::from_str(tag);
            assert_eq!(parsed.tag, tag);
            assert_eq!(RspImageTag::from_str(&parsed.tag), parsed);
        }
    }
}
