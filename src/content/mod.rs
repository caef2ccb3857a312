//! Domain content loading: the `Activity`, `Levels`, and `Rewards` JSON
//! documents that drive admission limits, grading, and reward pools.
//!
//! `Content::load` is the abstract collaborator named in spec §1; this
//! module provides its one concrete implementation, [`JsonContent`],
//! which reads and validates three JSON files from a directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Errors loading or validating content documents.
#[derive(Debug, Error)]
pub enum ContentError {
    /// A content file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A content file was not valid JSON for its expected shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// The file that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// Level ids are not contiguous starting at 1.
    #[error("level ids must be contiguous starting at 1, found {0:?}")]
    NonContiguousLevels(Vec<i64>),
    /// A level references a pool that doesn't exist.
    #[error("level {level_id} references unknown reward_pool_id {pool_id:?}")]
    UnknownPool {
        /// The offending level.
        level_id: i64,
        /// The pool id it referenced.
        pool_id: String,
    },
    /// A JD_ECARD item was configured with `max_claims_per_item != 1`.
    #[error("item {item_id:?} is JD_ECARD and must have max_claims_per_item = 1")]
    JdEcardMustBeSingleUse {
        /// The offending item.
        item_id: String,
    },
    /// An ALIPAY_CODE item was configured with `max_claims_per_item < 1`.
    #[error("item {item_id:?} is ALIPAY_CODE and must have max_claims_per_item >= 1 or \"unlimited\"")]
    AlipayMustAllowAtLeastOne {
        /// The offending item.
        item_id: String,
    },
    /// A level's keyword match policy was regex but the pattern doesn't compile.
    #[error("level {level_id} has an invalid regex target_phrase: {source}")]
    InvalidRegex {
        /// The offending level.
        level_id: i64,
        /// Underlying regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// The full set of documents a `Content` load produces.
#[derive(Debug, Clone)]
pub struct LoadedContent {
    /// The activity document.
    pub activity: Activity,
    /// Levels, in ascending `level_id` order.
    pub levels: Vec<Level>,
    /// Reward pools.
    pub pools: Vec<RewardPool>,
}

impl LoadedContent {
    /// Look up a level by id.
    pub fn level(&self, level_id: i64) -> Option<&Level> {
        self.levels.iter().find(|l| l.level_id == level_id)
    }

    /// Look up a pool by id.
    pub fn pool(&self, pool_id: &str) -> Option<&RewardPool> {
        self.pools.iter().find(|p| p.pool_id == pool_id)
    }

    /// The smallest level id, i.e. the first level of the activity.
    pub fn first_level_id(&self) -> Option<i64> {
        self.levels.iter().map(|l| l.level_id).min()
    }
}

/// Abstract collaborator loading domain content (spec §1, §6).
#[async_trait]
pub trait Content: Send + Sync {
    /// Load (or reload) the activity/levels/rewards documents.
    async fn load(&self) -> Result<LoadedContent, ContentError>;
}

/// Loads content from three JSON files in a directory:
/// `activity.json`, `levels.json`, `rewards.json`.
pub struct JsonContent {
    dir: PathBuf,
}

impl JsonContent {
    /// Create a loader rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, filename: &str) -> Result<T, ContentError> {
        let path = self.dir.join(filename);
        let raw = std::fs::read_to_string(&path).map_err(|source| ContentError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ContentError::Parse { path, source })
    }
}

#[async_trait]
impl Content for JsonContent {
    async fn load(&self) -> Result<LoadedContent, ContentError> {
        let activity_doc: ActivityDoc = self.read_json("activity.json")?;
        let levels_doc: Vec<LevelDoc> = self.read_json("levels.json")?;
        let rewards_doc: RewardsDoc = self.read_json("rewards.json")?;

        validate(&levels_doc, &rewards_doc)?;

        let levels = levels_doc
            .into_iter()
            .map(Level::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let mut levels = levels;
        levels.sort_by_key(|l| l.level_id);

        let pools = rewards_doc.reward_pools.into_iter().map(RewardPool::from).collect();

        Ok(LoadedContent {
            activity: activity_doc.into(),
            levels,
            pools,
        })
    }
}

fn validate(levels: &[LevelDoc], rewards: &RewardsDoc) -> Result<(), ContentError> {
    let mut ids: Vec<i64> = levels.iter().map(|l| l.level_id).collect();
    ids.sort_unstable();
    let expected: Vec<i64> = (1..=ids.len() as i64).collect();
    if ids != expected {
        return Err(ContentError::NonContiguousLevels(ids));
    }

    let pool_ids: HashSet<&str> = rewards
        .reward_pools
        .iter()
        .map(|p| p.pool_id.as_str())
        .collect();
    for level in levels {
        if !pool_ids.contains(level.reward_pool_id.as_str()) {
            return Err(ContentError::UnknownPool {
                level_id: level.level_id,
                pool_id: level.reward_pool_id.clone(),
            });
        }
        if level.grading.keyword.match_policy == MatchPolicyKind::Regex {
            Regex::new(&level.grading.keyword.target_phrase).map_err(|source| {
                ContentError::InvalidRegex {
                    level_id: level.level_id,
                    source,
                }
            })?;
        }
    }

    for pool in &rewards.reward_pools {
        for item in &pool.items {
            match item.kind {
                RewardKindDoc::JdEcard => {
                    if item.max_claims_per_item != Some(1) {
                        return Err(ContentError::JdEcardMustBeSingleUse {
                            item_id: item.item_id.clone(),
                        });
                    }
                }
                RewardKindDoc::AlipayCode => {
                    if matches!(item.max_claims_per_item, Some(n) if n < 1) {
                        return Err(ContentError::AlipayMustAllowAtLeastOne {
                            item_id: item.item_id.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

// ── Wire (on-disk JSON) shapes ──────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct ActivityDoc {
    activity_id: String,
    enabled: bool,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    channel: ChannelDoc,
    global_limits: GlobalLimitsDoc,
    llm: LlmConfigDoc,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelDoc {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GlobalLimitsDoc {
    #[serde(default = "default_max_inflight")]
    max_inflight_per_user: u32,
    queue_max_length: usize,
    worker_concurrency: usize,
}

fn default_max_inflight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct LlmConfigDoc {
    model: String,
    timeout_seconds: u64,
    default_max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct LevelDoc {
    level_id: i64,
    name: String,
    enabled: bool,
    prompt: PromptDoc,
    limits: LevelLimitsDoc,
    grading: GradingDoc,
    reward_pool_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PromptDoc {
    system_prompt: String,
    intro_message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LevelLimitsDoc {
    max_input_chars: usize,
    max_turns: i64,
    cooldown_seconds_after_fail: i64,
    max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct GradingDoc {
    keyword: KeywordGradingDoc,
    judge: JudgeGradingDoc,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordGradingDoc {
    target_phrase: String,
    match_policy: MatchPolicyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MatchPolicyKind {
    ExactSubstring,
    CaseInsensitiveSubstring,
    Regex,
}

#[derive(Debug, Clone, Deserialize)]
struct JudgeGradingDoc {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    policy: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct RewardsDoc {
    reward_pools: Vec<RewardPoolDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct RewardPoolDoc {
    pool_id: String,
    enabled: bool,
    send_message_template: String,
    items: Vec<RewardItemDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct RewardItemDoc {
    item_id: String,
    kind: RewardKindDoc,
    code: String,
    /// `None` means "unlimited"; only valid for `ALIPAY_CODE`.
    max_claims_per_item: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RewardKindDoc {
    AlipayCode,
    JdEcard,
}

// ── Domain-facing shapes ────────────────────────────────────────

/// The loaded, validated activity document.
#[derive(Debug, Clone)]
pub struct Activity {
    /// Activity identifier.
    pub activity_id: String,
    /// Whether the activity currently accepts submissions.
    pub enabled: bool,
    /// Activity window start.
    pub start_at: DateTime<Utc>,
    /// Activity window end.
    pub end_at: DateTime<Utc>,
    /// Channel name (e.g. `"telegram"`).
    pub channel_name: String,
    /// Max simultaneously-inflight attempts per user (normally 1).
    pub max_inflight_per_user: u32,
    /// Max rows the persistent queue may hold at once.
    pub queue_max_length: usize,
    /// Number of worker tasks draining the queue.
    pub worker_concurrency: usize,
    /// LLM model identifier.
    pub llm_model: String,
    /// Per-call LLM timeout.
    pub llm_timeout_seconds: u64,
    /// Default max output tokens when a level doesn't override it.
    pub llm_default_max_output_tokens: u32,
}

impl From<ActivityDoc> for Activity {
    fn from(doc: ActivityDoc) -> Self {
        Self {
            activity_id: doc.activity_id,
            enabled: doc.enabled,
            start_at: doc.start_at,
            end_at: doc.end_at,
            channel_name: doc.channel.name,
            max_inflight_per_user: doc.global_limits.max_inflight_per_user,
            queue_max_length: doc.global_limits.queue_max_length,
            worker_concurrency: doc.global_limits.worker_concurrency,
            llm_model: doc.llm.model,
            llm_timeout_seconds: doc.llm.timeout_seconds,
            llm_default_max_output_tokens: doc.llm.default_max_output_tokens,
        }
    }
}

/// How a level's keyword stage matches `target_phrase` against LLM output.
#[derive(Debug, Clone)]
pub enum MatchPolicy {
    /// Verbatim substring match.
    ExactSubstring(String),
    /// Case-insensitive substring match.
    CaseInsensitiveSubstring(String),
    /// Regex match, compiled once at load time.
    Regex(Regex),
}

impl MatchPolicy {
    /// Whether `haystack` satisfies this policy.
    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            Self::ExactSubstring(needle) => haystack.contains(needle.as_str()),
            Self::CaseInsensitiveSubstring(needle) => {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            Self::Regex(re) => re.is_match(haystack),
        }
    }
}

/// A loaded, validated level.
#[derive(Debug, Clone)]
pub struct Level {
    /// 1-based, contiguous level id.
    pub level_id: i64,
    /// Display name.
    pub name: String,
    /// Whether the level currently accepts submissions.
    pub enabled: bool,
    /// System prompt used for `LLM.Generate`.
    pub system_prompt: String,
    /// Intro message shown when a session for this level is created.
    pub intro_message: String,
    /// Max characters accepted in a submission.
    pub max_input_chars: usize,
    /// Max fail turns before `FAILED_OUT`.
    pub max_turns: i64,
    /// Cooldown duration after a failed turn.
    pub cooldown_seconds_after_fail: i64,
    /// Max output tokens requested from the LLM.
    pub max_output_tokens: u32,
    /// Keyword match policy and phrase.
    pub match_policy: MatchPolicy,
    /// Whether the judge stage is enabled (spec always invokes it; this
    /// flag is carried through from config but the engine still calls the
    /// judge per spec §4.C step 2 — reserved for future policy overrides).
    pub judge_enabled: bool,
    /// The pool this level's reward is drawn from.
    pub reward_pool_id: String,
}

impl TryFrom<LevelDoc> for Level {
    type Error = ContentError;

    fn try_from(doc: LevelDoc) -> Result<Self, Self::Error> {
        let match_policy = match doc.grading.keyword.match_policy {
            MatchPolicyKind::ExactSubstring => {
                MatchPolicy::ExactSubstring(doc.grading.keyword.target_phrase.clone())
            }
            MatchPolicyKind::CaseInsensitiveSubstring => {
                MatchPolicy::CaseInsensitiveSubstring(doc.grading.keyword.target_phrase.clone())
            }
            MatchPolicyKind::Regex => {
                let re = Regex::new(&doc.grading.keyword.target_phrase).map_err(|source| {
                    ContentError::InvalidRegex {
                        level_id: doc.level_id,
                        source,
                    }
                })?;
                MatchPolicy::Regex(re)
            }
        };

        Ok(Self {
            level_id: doc.level_id,
            name: doc.name,
            enabled: doc.enabled,
            system_prompt: doc.prompt.system_prompt,
            intro_message: doc.prompt.intro_message,
            max_input_chars: doc.limits.max_input_chars,
            max_turns: doc.limits.max_turns,
            cooldown_seconds_after_fail: doc.limits.cooldown_seconds_after_fail,
            max_output_tokens: doc.limits.max_output_tokens,
            match_policy,
            judge_enabled: doc.grading.judge.enabled,
            reward_pool_id: doc.reward_pool_id,
        })
    }
}

/// A loaded reward pool.
#[derive(Debug, Clone)]
pub struct RewardPool {
    /// Pool identifier.
    pub pool_id: String,
    /// Whether the pool currently accepts claims.
    pub enabled: bool,
    /// Template rendered on successful claim (`{reward_code}`, `{level_id}`,
    /// `{level_name}`, `{username}`).
    pub send_message_template: String,
    /// Items in this pool, as configured (claim counts are tracked in
    /// storage, not here — this is the config-time view).
    pub items: Vec<RewardItemConfig>,
}

impl From<RewardPoolDoc> for RewardPool {
    fn from(doc: RewardPoolDoc) -> Self {
        Self {
            pool_id: doc.pool_id,
            enabled: doc.enabled,
            send_message_template: doc.send_message_template,
            items: doc.items.into_iter().map(RewardItemConfig::from).collect(),
        }
    }
}

/// Config-time view of a reward item (before it's merged with persisted
/// `claimed_count` in storage).
#[derive(Debug, Clone)]
pub struct RewardItemConfig {
    /// Item identifier.
    pub item_id: String,
    /// Reward kind.
    pub kind: crate::types::RewardKind,
    /// Opaque reward code.
    pub code: String,
    /// `None` means unlimited (`ALIPAY_CODE` only).
    pub max_claims: Option<i64>,
}

impl From<RewardItemDoc> for RewardItemConfig {
    fn from(doc: RewardItemDoc) -> Self {
        Self {
            item_id: doc.item_id,
            kind: match doc.kind {
                RewardKindDoc::AlipayCode => crate::types::RewardKind::AlipayCode,
                RewardKindDoc::JdEcard => crate::types::RewardKind::JdEcard,
            },
            code: doc.code,
            max_claims: doc.max_claims_per_item,
        }
    }
}

/// Render a reward message template with the standard placeholder set.
pub fn render_template(
    template: &str,
    reward_code: &str,
    level_id: i64,
    level_name: &str,
    username: &str,
) -> String {
    template
        .replace("{reward_code}", reward_code)
        .replace("{level_id}", &level_id.to_string())
        .replace("{level_name}", level_name)
        .replace("{username}", username)
}

/// Load content from a directory at a given path, convenience wrapper.
pub fn loader(dir: impl AsRef<Path>) -> JsonContent {
    JsonContent::new(dir.as_ref().to_path_buf())
}
