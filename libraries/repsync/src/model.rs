//! Exercise entities as the cache and the remote store see them.
//!
//! [`ExerciseData`] is the field bag both sides share. Its four per-set arrays
//! (weights, completions, notes, actual reps) always have exactly `sets` entries:
//! every mutation goes through [`ExerciseData::resize_sets`] or [`ExerciseData::apply`],
//! and anything read off the wire is passed through [`ExerciseData::normalize`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

pub const DEFAULT_ACCENT_COLOR: &str = "#0A84FF";

/// Locally generated identity. Stable for the lifetime of the entity, including across reloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExerciseId(Uuid);

impl ExerciseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExerciseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExerciseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the remote store on the first successful save.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque reference to the workout an exercise belongs to. Also the throttle group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkoutRef(String);

impl WorkoutRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkoutRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkoutRef {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseData {
    pub(crate) name: String,
    pub(crate) sets: usize,
    pub(crate) reps: u32,
    pub(crate) set_weights: Vec<f64>,
    pub(crate) set_completions: Vec<bool>,
    pub(crate) set_notes: Vec<String>,
    pub(crate) set_actual_reps: Vec<u32>,
    #[serde(rename = "exerciseNote")]
    pub(crate) note: String,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) accent_color_hex: String,
    pub(crate) sort_index: usize,
}

impl ExerciseData {
    pub fn new(name: impl Into<String>, sets: usize, reps: u32) -> Self {
        Self {
            name: name.into(),
            sets,
            reps,
            set_weights: vec![0.0; sets],
            set_completions: vec![false; sets],
            set_notes: vec![String::new(); sets],
            set_actual_reps: vec![0; sets],
            note: String::new(),
            timestamp: Utc::now(),
            accent_color_hex: DEFAULT_ACCENT_COLOR.to_string(),
            sort_index: 0,
        }
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Self {
        self.set_weights = weights;
        self.normalize();
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn with_accent_color(mut self, hex: impl Into<String>) -> Self {
        self.accent_color_hex = hex.into();
        self
    }

    pub fn with_sort_index(mut self, sort_index: usize) -> Self {
        self.sort_index = sort_index;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sets(&self) -> usize {
        self.sets
    }

    pub fn reps(&self) -> u32 {
        self.reps
    }

    pub fn set_weights(&self) -> &[f64] {
        &self.set_weights
    }

    pub fn set_completions(&self) -> &[bool] {
        &self.set_completions
    }

    pub fn set_notes(&self) -> &[String] {
        &self.set_notes
    }

    pub fn set_actual_reps(&self) -> &[u32] {
        &self.set_actual_reps
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn accent_color_hex(&self) -> &str {
        &self.accent_color_hex
    }

    pub fn sort_index(&self) -> usize {
        self.sort_index
    }

    /// Change the set count, padding or truncating all four per-set arrays in one step.
    pub fn resize_sets(&mut self, sets: usize) {
        self.sets = sets;
        self.set_weights.resize(sets, 0.0);
        self.set_completions.resize(sets, false);
        self.set_notes.resize(sets, String::new());
        self.set_actual_reps.resize(sets, 0);
    }

    /// Bring the per-set arrays back to `sets` entries.
    pub fn normalize(&mut self) {
        self.resize_sets(self.sets);
    }

    pub fn arrays_consistent(&self) -> bool {
        self.set_weights.len() == self.sets
            && self.set_completions.len() == self.sets
            && self.set_notes.len() == self.sets
            && self.set_actual_reps.len() == self.sets
    }

    pub(crate) fn touch(&mut self) {
        self.timestamp = Utc::now();
    }

    /// Apply one edit. Nothing is mutated if the edit is rejected.
    pub fn apply(&mut self, delta: &FieldDelta) -> Result<(), SyncError> {
        if let Some(index) = delta.set_index().filter(|index| *index >= self.sets) {
            return Err(SyncError::SetIndexOutOfRange {
                index,
                sets: self.sets,
            });
        }

        match delta {
            FieldDelta::Name(name) => self.name = name.clone(),
            FieldDelta::Sets(sets) => self.resize_sets(*sets),
            FieldDelta::Reps(reps) => self.reps = *reps,
            FieldDelta::Weights(weights) => {
                self.set_weights = weights.clone();
                self.normalize();
            }
            FieldDelta::Weight { set, value } => self.set_weights[*set] = *value,
            FieldDelta::ActualReps(reps) => {
                self.set_actual_reps = reps.clone();
                self.normalize();
            }
            FieldDelta::ActualRep { set, value } => self.set_actual_reps[*set] = *value,
            FieldDelta::SetNotes(notes) => {
                self.set_notes = notes.clone();
                self.normalize();
            }
            FieldDelta::SetNote { set, note } => self.set_notes[*set] = note.clone(),
            FieldDelta::Note(note) => self.note = note.clone(),
            FieldDelta::AccentColor(hex) => self.accent_color_hex = hex.clone(),
            FieldDelta::Completions(completions) => {
                self.set_completions = completions.clone();
                self.normalize();
            }
            FieldDelta::ToggleCompletion(set) => {
                self.set_completions[*set] = !self.set_completions[*set]
            }
        }
        self.touch();
        Ok(())
    }
}

/// Which debounced writer an edit belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Name,
    Sets,
    Reps,
    Weights,
    ActualReps,
    SetNotes,
    Note,
    AccentColor,
    Completions,
}

/// A single edit to one exercise field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldDelta {
    Name(String),
    Sets(usize),
    Reps(u32),
    Weights(Vec<f64>),
    Weight { set: usize, value: f64 },
    ActualReps(Vec<u32>),
    ActualRep { set: usize, value: u32 },
    SetNotes(Vec<String>),
    SetNote { set: usize, note: String },
    Note(String),
    AccentColor(String),
    Completions(Vec<bool>),
    ToggleCompletion(usize),
}

impl FieldDelta {
    pub fn field(&self) -> Field {
        match self {
            FieldDelta::Name(_) => Field::Name,
            FieldDelta::Sets(_) => Field::Sets,
            FieldDelta::Reps(_) => Field::Reps,
            FieldDelta::Weights(_) | FieldDelta::Weight { .. } => Field::Weights,
            FieldDelta::ActualReps(_) | FieldDelta::ActualRep { .. } => Field::ActualReps,
            FieldDelta::SetNotes(_) | FieldDelta::SetNote { .. } => Field::SetNotes,
            FieldDelta::Note(_) => Field::Note,
            FieldDelta::AccentColor(_) => Field::AccentColor,
            FieldDelta::Completions(_) | FieldDelta::ToggleCompletion(_) => Field::Completions,
        }
    }

    fn set_index(&self) -> Option<usize> {
        match self {
            FieldDelta::Weight { set, .. }
            | FieldDelta::ActualRep { set, .. }
            | FieldDelta::SetNote { set, .. }
            | FieldDelta::ToggleCompletion(set) => Some(*set),
            _ => None,
        }
    }

    /// The whole-field edit that carries `data`'s current value for this delta's field.
    /// This is what a debounced flush sends, so only the latest value ever leaves the device.
    pub(crate) fn settled(field: Field, data: &ExerciseData) -> FieldDelta {
        match field {
            Field::Name => FieldDelta::Name(data.name.clone()),
            Field::Sets => FieldDelta::Sets(data.sets),
            Field::Reps => FieldDelta::Reps(data.reps),
            Field::Weights => FieldDelta::Weights(data.set_weights.clone()),
            Field::ActualReps => FieldDelta::ActualReps(data.set_actual_reps.clone()),
            Field::SetNotes => FieldDelta::SetNotes(data.set_notes.clone()),
            Field::Note => FieldDelta::Note(data.note.clone()),
            Field::AccentColor => FieldDelta::AccentColor(data.accent_color_hex.clone()),
            Field::Completions => FieldDelta::Completions(data.set_completions.clone()),
        }
    }
}

/// An exercise as held by the cache.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    pub(crate) id: ExerciseId,
    pub(crate) record_id: Option<RecordId>,
    pub(crate) temp_id: Option<String>,
    pub(crate) workout: WorkoutRef,
    #[serde(flatten)]
    pub(crate) data: ExerciseData,
}

impl Exercise {
    pub(crate) fn local(workout: WorkoutRef, data: ExerciseData) -> Self {
        Self {
            id: ExerciseId::new(),
            record_id: None,
            temp_id: Some(Uuid::new_v4().to_string()),
            workout,
            data,
        }
    }

    pub(crate) fn from_record(id: ExerciseId, record: ExerciseRecord) -> Self {
        let mut data = record.data;
        data.normalize();
        Self {
            id,
            record_id: record.id,
            temp_id: None,
            workout: record.workout,
            data,
        }
    }

    pub fn id(&self) -> ExerciseId {
        self.id
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        self.record_id.as_ref()
    }

    pub fn temp_id(&self) -> Option<&str> {
        self.temp_id.as_deref()
    }

    pub fn workout(&self) -> &WorkoutRef {
        &self.workout
    }

    pub fn data(&self) -> &ExerciseData {
        &self.data
    }

    pub fn is_local_only(&self) -> bool {
        self.record_id.is_none()
    }

    pub fn to_record(&self) -> ExerciseRecord {
        ExerciseRecord {
            id: self.record_id.clone(),
            workout: self.workout.clone(),
            data: self.data.clone(),
        }
    }
}

/// The remote store's schema for an exercise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseRecord {
    pub id: Option<RecordId>,
    #[serde(rename = "parentWorkoutRef")]
    pub workout: WorkoutRef,
    #[serde(flatten)]
    pub data: ExerciseData,
}
