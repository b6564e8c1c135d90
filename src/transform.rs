//! The user extension boundary: the `Transform` capability set, the batch
//! emitter, and adapters for the common transform shapes.

use crate::error::PipelineError;
use crate::generation::Gens;
use crate::notify::{Key, Notification, State, Value};
use std::time::Duration;

/// Result of applying a simple 1:1 transform to one key.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome<V> {
    /// The value is unchanged; nothing is emitted downstream.
    Unchanged,
    /// Replace the value. Emitting a value equal to the input is suppressed.
    Value(V),
    /// Delete the key.
    Delete,
}

/// The capability set every pipeline stage implements.
///
/// The simple 1:1 shape is covered by [`MapTransform`]; implement `process`
/// directly when a stage needs to add, rename, or delete keys, or derive one
/// output from several inputs.
pub trait Transform<K: Key, V: Value>: Send + Sync + 'static {
    /// Keys this stage is interested in. Non-matching keys are never handed
    /// to `process`, but their values still pass through the stage.
    fn matches(&self, _key: &K) -> bool {
        true
    }

    /// Eager stages run speculatively on upstream's current-best value.
    /// Return false to defer all work until every predecessor is finalized.
    fn eager(&self) -> bool {
        true
    }

    /// Optional cap on concurrently running batches for this stage.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Optional per-batch time limit; overrides the run-wide default.
    /// An overrunning batch is treated as failed and unwound.
    fn batch_timeout(&self) -> Option<Duration> {
        None
    }

    /// Called once per stage before its first batch. A failure fails that
    /// first batch; later batches proceed without retrying.
    fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one batch of accepted notifications, pushing derived
    /// notifications through `out`. Tombstoned inputs are not batched.
    fn process(
        &self,
        batch: &[Notification<K, V>],
        out: &mut BatchOutput<K, V>,
    ) -> anyhow::Result<()>;
}

/// Checks the merge-and-bump rule on an emitted vector: right length, own
/// slot populated, nothing claimed for stages that have not run yet.
pub(crate) fn validate_emission<K: Key, V: Value>(
    stage_index: usize,
    stage_count: usize,
    n: &Notification<K, V>,
) -> Result<(), PipelineError> {
    let gens = &n.state.gens;
    if gens.len() != stage_count {
        return Err(PipelineError::GensLength {
            expected: stage_count,
            found: gens.len(),
        });
    }
    if gens.slot(stage_index) == 0 {
        return Err(PipelineError::protocol(
            stage_index,
            "emitted vector does not bump the stage's own slot",
        ));
    }
    if (stage_index + 1..stage_count).any(|i| gens.slot(i) != 0) {
        return Err(PipelineError::protocol(
            stage_index,
            "emitted vector claims generations for later stages",
        ));
    }
    Ok(())
}

/// Push emitter handed to [`Transform::process`]. Buffers emissions for one
/// batch; vectors are derived with the merge-and-bump rule using the batch's
/// local generation.
pub struct BatchOutput<K, V> {
    stage_index: usize,
    stage_count: usize,
    generation: u64,
    emitted: Vec<Notification<K, V>>,
    suppressed: u64,
}

impl<K: Key, V: Value> BatchOutput<K, V> {
    pub(crate) fn new(stage_index: usize, stage_count: usize, generation: u64) -> Self {
        Self {
            stage_index,
            stage_count,
            generation,
            emitted: Vec::new(),
            suppressed: 0,
        }
    }

    /// The local generation number allocated to this batch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Emit a changed value for the key of `from`, derived from `from`'s
    /// vector. Values equal to the input are silently dropped: downstream
    /// already knows the pre-existing value.
    pub fn emit(&mut self, from: &Notification<K, V>, value: V) {
        if from.state.value.as_ref() == Some(&value) {
            self.suppressed += 1;
            return;
        }
        let gens = from.state.gens.bump(self.stage_index, self.generation);
        self.push(from.key.clone(), State::new(value, gens));
    }

    /// Emit a deletion for the key of `from`.
    pub fn delete(&mut self, from: &Notification<K, V>) {
        if from.state.is_deleted() {
            self.suppressed += 1;
            return;
        }
        let gens = from.state.gens.bump(self.stage_index, self.generation);
        self.push(from.key.clone(), State::tombstone(gens));
    }

    /// Emit a value for `key` derived from several inputs: the vector is the
    /// componentwise maximum of all inputs' vectors with this stage's slot
    /// bumped. Use this for renames, fan-ins, and stage-created keys.
    pub fn emit_merged(&mut self, from: &[&Notification<K, V>], key: K, value: V) {
        let mut gens = Gens::zero(self.stage_count);
        for n in from {
            gens = gens.merge_max(&n.state.gens);
        }
        let gens = gens.bump(self.stage_index, self.generation);
        self.push(key, State::new(value, gens));
    }

    /// Emit a pre-built notification. The vector must follow the
    /// merge-and-bump rule; violations are rejected here and, if one slips
    /// through, abort the run.
    pub fn emit_raw(&mut self, n: Notification<K, V>) -> crate::Result<()> {
        validate_emission(self.stage_index, self.stage_count, &n)?;
        self.emitted.push(Notification {
            origin: Some(self.stage_index),
            ..n
        });
        Ok(())
    }

    fn push(&mut self, key: K, state: State<V>) {
        self.emitted.push(Notification {
            key,
            state,
            origin: Some(self.stage_index),
        });
    }

    pub(crate) fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub(crate) fn into_emitted(self) -> Vec<Notification<K, V>> {
        self.emitted
    }
}

type MapFn<K, V> = dyn Fn(&K, &V) -> anyhow::Result<MapOutcome<V>> + Send + Sync;
type MatchFn<K> = dyn Fn(&K) -> bool + Send + Sync;

/// The simple transform shape: one function applied per key, plus optional
/// match predicate and scheduling flags.
pub struct MapTransform<K, V> {
    func: Box<MapFn<K, V>>,
    matcher: Option<Box<MatchFn<K>>>,
    eager: bool,
    max_concurrency: Option<usize>,
    batch_timeout: Option<Duration>,
}

impl<K: Key, V: Value> MapTransform<K, V> {
    /// Wrap an infallible per-key function.
    pub fn new(func: impl Fn(&K, &V) -> MapOutcome<V> + Send + Sync + 'static) -> Self {
        Self::fallible(move |k, v| Ok(func(k, v)))
    }

    /// Wrap a per-key function that can fail. A failure drops the whole
    /// batch: the stage is skipped for those keys.
    pub fn fallible(
        func: impl Fn(&K, &V) -> anyhow::Result<MapOutcome<V>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Box::new(func),
            matcher: None,
            eager: true,
            max_concurrency: None,
            batch_timeout: None,
        }
    }

    /// Restrict the stage to keys the predicate accepts; other keys pass
    /// through untouched.
    pub fn with_match(mut self, matcher: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Some(Box::new(matcher));
        self
    }

    /// Defer all work until every predecessor stage is finalized.
    pub fn deliberate(mut self) -> Self {
        self.eager = false;
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }

    pub fn with_batch_timeout(mut self, limit: Duration) -> Self {
        self.batch_timeout = Some(limit);
        self
    }
}

impl<K: Key, V: Value> Transform<K, V> for MapTransform<K, V> {
    fn matches(&self, key: &K) -> bool {
        self.matcher.as_ref().map_or(true, |m| m(key))
    }

    fn eager(&self) -> bool {
        self.eager
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }

    fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout
    }

    fn process(
        &self,
        batch: &[Notification<K, V>],
        out: &mut BatchOutput<K, V>,
    ) -> anyhow::Result<()> {
        for n in batch {
            let Some(value) = n.state.value.as_ref() else {
                continue;
            };
            match (self.func)(&n.key, value)? {
                MapOutcome::Unchanged => {}
                MapOutcome::Value(v) => out.emit(n, v),
                MapOutcome::Delete => out.delete(n),
            }
        }
        Ok(())
    }
}

/// Interested in everything, changes nothing. Useful as an absorbing sink at
/// the end of a pipeline.
pub struct NullTransform;

impl<K: Key, V: Value> Transform<K, V> for NullTransform {
    fn process(
        &self,
        _batch: &[Notification<K, V>],
        _out: &mut BatchOutput<K, V>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(key: &str, value: &str, gens: Vec<u64>) -> Notification<String, String> {
        Notification::new(
            key.to_string(),
            State::new(value.to_string(), gens.into()),
            None,
        )
    }

    #[test]
    fn test_emit_bumps_own_slot() {
        let mut out = BatchOutput::new(1, 3, 7);
        out.emit(&note("k", "old", vec![2, 0, 0]), "new".to_string());
        let emitted = out.into_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state.gens.as_slice(), &[2, 7, 0]);
        assert_eq!(emitted[0].origin, Some(1));
    }

    #[test]
    fn test_equal_value_suppressed() {
        let mut out = BatchOutput::new(0, 2, 1);
        out.emit(&note("k", "same", vec![0, 0]), "same".to_string());
        assert_eq!(out.suppressed(), 1);
        assert!(out.into_emitted().is_empty());
    }

    #[test]
    fn test_emit_merged_takes_componentwise_max() {
        let mut out = BatchOutput::new(2, 4, 5);
        let a = note("a", "x", vec![3, 0, 0, 0]);
        let b = note("b", "y", vec![1, 4, 0, 0]);
        out.emit_merged(&[&a, &b], "joined".to_string(), "xy".to_string());
        let emitted = out.into_emitted();
        assert_eq!(emitted[0].state.gens.as_slice(), &[3, 4, 5, 0]);
    }

    #[test]
    fn test_emit_raw_validation() {
        let mut out = BatchOutput::new(1, 3, 2);

        // Wrong length
        let bad_len = note("k", "v", vec![0, 1]);
        assert!(matches!(
            out.emit_raw(bad_len),
            Err(PipelineError::GensLength { expected: 3, .. })
        ));

        // Own slot not bumped
        let no_bump = note("k", "v", vec![1, 0, 0]);
        assert!(matches!(
            out.emit_raw(no_bump),
            Err(PipelineError::Protocol { stage: 1, .. })
        ));

        // Nonzero slot right of the stage
        let future = note("k", "v", vec![0, 1, 9]);
        assert!(out.emit_raw(future).is_err());

        // Well-formed
        let good = note("k", "v", vec![4, 2, 0]);
        assert!(out.emit_raw(good).is_ok());
        assert_eq!(out.into_emitted().len(), 1);
    }

    #[test]
    fn test_map_transform_outcomes() {
        let t: MapTransform<String, String> = MapTransform::new(|_k, v: &String| {
            if v == "drop" {
                MapOutcome::Delete
            } else if v == "keep" {
                MapOutcome::Unchanged
            } else {
                MapOutcome::Value(v.to_uppercase())
            }
        });

        let batch = vec![
            note("a", "hello", vec![0, 0]),
            note("b", "keep", vec![0, 0]),
            note("c", "drop", vec![0, 0]),
        ];
        let mut out = BatchOutput::new(0, 2, 1);
        t.process(&batch, &mut out).unwrap();
        let emitted = out.into_emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].state.value.as_deref(), Some("HELLO"));
        assert!(emitted[1].state.is_deleted());
    }

    #[test]
    fn test_map_transform_match() {
        let t: MapTransform<String, i32> = MapTransform::new(|_k, v| MapOutcome::Value(v + 1))
            .with_match(|k: &String| k.starts_with("tmp_"));
        assert!(t.matches(&"tmp_x".to_string()));
        assert!(!t.matches(&"other".to_string()));
    }

    #[test]
    fn test_null_transform_emits_nothing() {
        let t = NullTransform;
        let batch = vec![note("a", "x", vec![0])];
        let mut out = BatchOutput::new(0, 1, 1);
        Transform::<String, String>::process(&t, &batch, &mut out).unwrap();
        assert!(out.into_emitted().is_empty());
    }
}
