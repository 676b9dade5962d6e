// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Generation entries and their states.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::JobRequest;

/// User-editable generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    /// Explicit seed. `None` draws a random one.
    #[serde(default)]
    pub seed: Option<u32>,
    pub steps: u32,
    pub guidance: f32,
    /// Image to start from (image-to-image).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<PathBuf>,
    /// How far to move away from `source_image`, 0.0 to 1.0.
    #[serde(default = "default_strength")]
    pub strength: f32,
}

fn default_strength() -> f32 {
    EntryParams::DEFAULT_STRENGTH
}

impl EntryParams {
    pub const MIN_STEPS: u32 = 2;
    pub const DEFAULT_STEPS: u32 = 25;
    pub const DEFAULT_GUIDANCE: f32 = 7.5;
    pub const DEFAULT_STRENGTH: f32 = 0.75;

    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Clamp steps to at least [`Self::MIN_STEPS`] and strength to `[0, 1]`.
    pub fn normalized(mut self) -> Self {
        self.steps = self.steps.max(Self::MIN_STEPS);
        self.strength = if self.strength.is_nan() {
            Self::DEFAULT_STRENGTH
        } else {
            self.strength.clamp(0.0, 1.0)
        };
        self
    }
}

impl Default for EntryParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            seed: None,
            steps: Self::DEFAULT_STEPS,
            guidance: Self::DEFAULT_GUIDANCE,
            source_image: None,
            strength: Self::DEFAULT_STRENGTH,
        }
    }
}

/// Lifecycle state of an entry.
///
/// Persisted as a plain tag. `Queued` and `Rendering` both persist as
/// `"queued"`, and `Cloning` drops its highlight flag, so an interrupted render
/// comes back as a queued job after restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "PersistedState", from = "PersistedState")]
pub enum EntryState {
    Queued,
    /// `step` inference steps of `total` are done.
    Rendering { step: u32, total: u32 },
    Done,
    Cancelled,
    Error,
    /// Template for new entries; never queued itself.
    Creating,
    /// Editable copy of a finished entry, not yet submitted.
    Cloning { needs_highlight: bool },
    /// Output rejected by a safety check.
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PersistedState {
    Queued,
    Done,
    Cancelled,
    Error,
    Creating,
    Cloning,
    Blocked,
}

impl From<EntryState> for PersistedState {
    fn from(state: EntryState) -> Self {
        match state {
            EntryState::Queued | EntryState::Rendering { .. } => PersistedState::Queued,
            EntryState::Done => PersistedState::Done,
            EntryState::Cancelled => PersistedState::Cancelled,
            EntryState::Error => PersistedState::Error,
            EntryState::Creating => PersistedState::Creating,
            EntryState::Cloning { .. } => PersistedState::Cloning,
            EntryState::Blocked => PersistedState::Blocked,
        }
    }
}

impl From<PersistedState> for EntryState {
    fn from(state: PersistedState) -> Self {
        match state {
            PersistedState::Queued => EntryState::Queued,
            PersistedState::Done => EntryState::Done,
            PersistedState::Cancelled => EntryState::Cancelled,
            PersistedState::Error => EntryState::Error,
            PersistedState::Creating => EntryState::Creating,
            PersistedState::Cloning => EntryState::Cloning {
                needs_highlight: false,
            },
            PersistedState::Blocked => EntryState::Blocked,
        }
    }
}

impl EntryState {
    /// Only queued and rendering entries belong in the job queue.
    pub fn stays_in_queue(&self) -> bool {
        matches!(self, EntryState::Queued | EntryState::Rendering { .. })
    }

    /// Finished states a late cancellation must not overwrite.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryState::Done | EntryState::Cancelled | EntryState::Error | EntryState::Blocked
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryState::Queued => "queued",
            EntryState::Rendering { .. } => "rendering",
            EntryState::Done => "done",
            EntryState::Cancelled => "cancelled",
            EntryState::Error => "error",
            EntryState::Creating => "creating",
            EntryState::Cloning { .. } => "cloning",
            EntryState::Blocked => "blocked",
        }
    }
}

/// One unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    id: Uuid,
    params: EntryParams,
    generated_seed: u32,
    pub(crate) state: EntryState,
    created_at: DateTime<Utc>,
}

/// Uniform draw over the whole `u32` range.
fn random_seed() -> u32 {
    rand::thread_rng().gen::<u32>()
}

fn resolve_seed(params: &EntryParams) -> u32 {
    params.seed.unwrap_or_else(random_seed)
}

impl Entry {
    /// A new queued entry.
    pub fn new(params: EntryParams) -> Self {
        Self::with_state(params, EntryState::Queued)
    }

    /// A `Creating` template entry.
    pub fn prototype(params: EntryParams) -> Self {
        Self::with_state(params, EntryState::Creating)
    }

    fn with_state(params: EntryParams, state: EntryState) -> Self {
        let params = params.normalized();
        Self {
            id: Uuid::new_v4(),
            generated_seed: resolve_seed(&params),
            params,
            state,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &EntryParams {
        &self.params
    }

    /// The seed the job renders with: the explicit seed or the random fallback.
    pub fn generated_seed(&self) -> u32 {
        self.generated_seed
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replace the parameters and resolve the seed again.
    pub fn set_params(&mut self, params: EntryParams) {
        self.params = params.normalized();
        self.generated_seed = resolve_seed(&self.params);
    }

    /// Artifact file name, derived from the id.
    pub fn output_file_name(&self) -> String {
        output_file_name(self.id)
    }

    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.output_file_name())
    }

    /// New queued job with this entry's parameters and a fresh random seed.
    ///
    /// A seed pinned on the prototype is dropped.
    pub fn clone_as_queued(&self) -> Entry {
        let mut params = self.params.clone();
        params.seed = None;
        Entry::new(params)
    }

    /// Same parameters, new random seed.
    pub fn random_variant(&self) -> Entry {
        let mut params = self.params.clone();
        params.seed = None;
        Entry::new(params)
    }

    /// Editable copy pinned to this entry's seed so tweaks stay comparable.
    pub fn editable_prototype(&self) -> Entry {
        let mut params = self.params.clone();
        params.seed = Some(self.generated_seed);
        Entry::with_state(
            params,
            EntryState::Cloning {
                needs_highlight: true,
            },
        )
    }

    pub(crate) fn to_request(&self) -> JobRequest {
        JobRequest {
            id: self.id,
            prompt: self.params.prompt.clone(),
            negative_prompt: self.params.negative_prompt.clone(),
            seed: self.generated_seed,
            steps: self.params.steps,
            guidance: self.params.guidance,
            source_image: self.params.source_image.clone(),
            strength: self.params.strength,
        }
    }
}

pub(crate) fn output_file_name(id: Uuid) -> String {
    format!("{}.png", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_seed_copied() {
        let mut params = EntryParams::new("a lighthouse");
        params.seed = Some(42);
        let entry = Entry::new(params);
        assert_eq!(entry.generated_seed(), 42);
    }

    #[test]
    fn test_random_seed_stable_until_update() {
        let mut entry = Entry::new(EntryParams::new("a lighthouse"));
        let seed = entry.generated_seed();
        assert_eq!(entry.generated_seed(), seed);
        assert_eq!(entry.clone().generated_seed(), seed);

        let mut params = entry.params().clone();
        params.seed = Some(7);
        entry.set_params(params);
        assert_eq!(entry.generated_seed(), 7);
    }

    #[test]
    fn test_random_seeds_cover_upper_range() {
        // 2000 uniform draws all landing below 2^31 has probability 2^-2000.
        let high = (0..2000)
            .map(|_| Entry::new(EntryParams::new("x")).generated_seed())
            .any(|seed| seed > u32::MAX / 2);
        assert!(high);
    }

    #[test]
    fn test_params_clamped() {
        let mut params = EntryParams::new("x");
        params.steps = 0;
        params.strength = 1.7;
        let entry = Entry::new(params);
        assert_eq!(entry.params().steps, EntryParams::MIN_STEPS);
        assert_eq!(entry.params().strength, 1.0);

        let mut params = EntryParams::new("x");
        params.strength = -0.5;
        assert_eq!(params.normalized().strength, 0.0);
    }

    #[test]
    fn test_output_path_derived_from_id() {
        let entry = Entry::new(EntryParams::new("x"));
        let path = entry.output_path(Path::new("/out"));
        assert_eq!(path, PathBuf::from(format!("/out/{}.png", entry.id())));
    }

    #[test]
    fn test_factories() {
        let mut params = EntryParams::new("a fox");
        params.seed = Some(99);
        let mut done = Entry::new(params);
        done.state = EntryState::Done;

        let variant = done.random_variant();
        assert_ne!(variant.id(), done.id());
        assert_eq!(variant.state(), EntryState::Queued);
        assert_eq!(variant.params().prompt, "a fox");
        assert_eq!(variant.params().seed, None);

        let editable = done.editable_prototype();
        assert_eq!(
            editable.state(),
            EntryState::Cloning {
                needs_highlight: true
            }
        );
        assert_eq!(editable.generated_seed(), 99);

        let prototype = Entry::prototype(EntryParams::new("template"));
        let queued = prototype.clone_as_queued();
        assert_eq!(queued.state(), EntryState::Queued);
        assert_eq!(queued.params().prompt, "template");
        assert_ne!(queued.id(), prototype.id());

        let committed = editable.clone_as_queued();
        assert_eq!(committed.params().seed, None);
        assert_eq!(committed.params().prompt, "a fox");
    }

    #[test]
    fn test_state_persisted_many_to_one() {
        let rendering = serde_json::to_string(&EntryState::Rendering { step: 3, total: 20 })
            .expect("serialize");
        let queued = serde_json::to_string(&EntryState::Queued).expect("serialize");
        assert_eq!(rendering, "\"queued\"");
        assert_eq!(rendering, queued);

        let back: EntryState = serde_json::from_str(&rendering).expect("deserialize");
        assert_eq!(back, EntryState::Queued);

        let cloning: EntryState = serde_json::from_str(
            &serde_json::to_string(&EntryState::Cloning {
                needs_highlight: true,
            })
            .expect("serialize"),
        )
        .expect("deserialize");
        assert_eq!(
            cloning,
            EntryState::Cloning {
                needs_highlight: false
            }
        );
    }
}
