//! Operator topology graph.
//!
//! Directed graph of unit identifiers with per-unit settings. Adjacency is
//! kept as identifier sets in both directions, never as live unit
//! references, so replacement cannot leave stale pointers behind; all
//! mutation funnels through [`TopologyGraph`]. Structural violations
//! (duplicate unit, duplicate edge, missing endpoint) are reported to the
//! caller as errors, since they indicate a broken invariant.

use crate::message::UnitId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

/// Error type for topology operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TopologyError {
    /// A unit with this id is already present.
    #[error("unit already exists: {0}")]
    DuplicateUnit(UnitId),
    /// No unit with this id.
    #[error("unknown unit: {0}")]
    UnknownUnit(UnitId),
    /// The edge already exists.
    #[error("edge already exists: {0} -> {1}")]
    DuplicateEdge(UnitId, UnitId),
    /// No such edge.
    #[error("unknown edge: {0} -> {1}")]
    UnknownEdge(UnitId, UnitId),
    /// The settings registry already has this child.
    #[error("child already registered: {0}")]
    DuplicateChild(UnitId),
    /// The settings registry has no such child.
    #[error("unknown child: {0}")]
    UnknownChild(UnitId),
    /// Source units never receive edges from other units.
    #[error("source unit {0} cannot be a downstream target")]
    SourceCannotBeDownstream(UnitId),
}

/// Role of a processing unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitRole {
    /// Ingress point; assigns batch ids, no upstream edges.
    Source,
    /// Per-message transformation, no keyed state.
    Stateless,
    /// Keyed aggregation with reverse/incremental logs.
    Stateful,
}

/// Per-unit settings, created at activation and mutated whenever the topology
/// connects a new downstream unit.
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// Path of the unit's durable state log, if it persists state.
    pub log_path: Option<PathBuf>,
    /// Role of the owning unit.
    pub role: UnitRole,
    /// Registry of immediate downstream units, keyed by id.
    pub children: BTreeMap<UnitId, UnitRole>,
}

impl OperatorSettings {
    /// Creates settings for a unit of the given role with no children.
    pub fn new(role: UnitRole) -> Self {
        Self {
            log_path: None,
            role,
            children: BTreeMap::new(),
        }
    }

    /// Sets the durable log path.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Registers a downstream child. Double insertion is a protocol violation.
    pub fn add_child(&mut self, id: UnitId, role: UnitRole) -> Result<(), TopologyError> {
        if self.children.contains_key(&id) {
            return Err(TopologyError::DuplicateChild(id));
        }
        self.children.insert(id, role);
        Ok(())
    }

    /// Removes a downstream child. Removing an absent child is a violation.
    pub fn remove_child(&mut self, id: &UnitId) -> Result<(), TopologyError> {
        if self.children.remove(id).is_none() {
            return Err(TopologyError::UnknownChild(id.clone()));
        }
        Ok(())
    }

    /// Downstream ids in deterministic order.
    pub fn child_ids(&self) -> Vec<UnitId> {
        self.children.keys().cloned().collect()
    }
}

/// A unit record in the topology graph.
#[derive(Clone, Debug)]
pub struct TopologyUnit {
    /// Unit identifier.
    pub id: UnitId,
    /// Unit role.
    pub role: UnitRole,
    /// Settings snapshot for the unit.
    pub settings: OperatorSettings,
    /// Identifiers of immediate upstream units (lookup-only back-references).
    pub upstream: BTreeSet<UnitId>,
    /// Identifiers of immediate downstream units.
    pub downstream: BTreeSet<UnitId>,
}

impl TopologyUnit {
    /// Creates a fresh unit record with no edges.
    pub fn new(id: UnitId, role: UnitRole, settings: OperatorSettings) -> Self {
        Self {
            id,
            role,
            settings,
            upstream: BTreeSet::new(),
            downstream: BTreeSet::new(),
        }
    }
}

/// Directed graph of processing units.
#[derive(Debug, Default)]
pub struct TopologyGraph {
    units: HashMap<UnitId, TopologyUnit>,
    /// Replacement generation counter, used to mint fresh identifiers.
    generation: u64,
}

impl TopologyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit. Fails if the identifier is already present.
    pub fn add_unit(&mut self, unit: TopologyUnit) -> Result<(), TopologyError> {
        if self.units.contains_key(&unit.id) {
            return Err(TopologyError::DuplicateUnit(unit.id));
        }
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// Removes a unit and detaches it from all neighbours. Fails if absent.
    pub fn remove_unit(&mut self, id: &UnitId) -> Result<TopologyUnit, TopologyError> {
        let removed = self
            .units
            .remove(id)
            .ok_or_else(|| TopologyError::UnknownUnit(id.clone()))?;
        for up in &removed.upstream {
            if let Some(unit) = self.units.get_mut(up) {
                unit.downstream.remove(id);
                let _ = unit.settings.remove_child(id);
            }
        }
        for down in &removed.downstream {
            if let Some(unit) = self.units.get_mut(down) {
                unit.upstream.remove(id);
            }
        }
        Ok(removed)
    }

    /// Connects `up` to `down`, recording the adjacency on both ends and
    /// registering `down` in `up`'s settings. Fails if either endpoint is
    /// missing, the edge already exists, or `down` is a Source.
    pub fn connect(&mut self, up: &UnitId, down: &UnitId) -> Result<(), TopologyError> {
        let down_role = self
            .units
            .get(down)
            .map(|u| u.role)
            .ok_or_else(|| TopologyError::UnknownUnit(down.clone()))?;
        if down_role == UnitRole::Source {
            return Err(TopologyError::SourceCannotBeDownstream(down.clone()));
        }
        let up_unit = self
            .units
            .get_mut(up)
            .ok_or_else(|| TopologyError::UnknownUnit(up.clone()))?;
        if up_unit.downstream.contains(down) {
            return Err(TopologyError::DuplicateEdge(up.clone(), down.clone()));
        }
        up_unit.downstream.insert(down.clone());
        up_unit.settings.add_child(down.clone(), down_role)?;
        self.units
            .get_mut(down)
            .ok_or_else(|| TopologyError::UnknownUnit(down.clone()))?
            .upstream
            .insert(up.clone());
        Ok(())
    }

    /// Removes the edge from `up` to `down`. Fails if it does not exist.
    pub fn disconnect(&mut self, up: &UnitId, down: &UnitId) -> Result<(), TopologyError> {
        let up_unit = self
            .units
            .get_mut(up)
            .ok_or_else(|| TopologyError::UnknownUnit(up.clone()))?;
        if !up_unit.downstream.remove(down) {
            return Err(TopologyError::UnknownEdge(up.clone(), down.clone()));
        }
        up_unit.settings.remove_child(down)?;
        self.units
            .get_mut(down)
            .ok_or_else(|| TopologyError::UnknownUnit(down.clone()))?
            .upstream
            .remove(up);
        Ok(())
    }

    /// Replaces a unit's settings snapshot. Fails if the id is missing.
    pub fn update_settings(&mut self, id: &UnitId, settings: OperatorSettings) -> Result<(), TopologyError> {
        let unit = self
            .units
            .get_mut(id)
            .ok_or_else(|| TopologyError::UnknownUnit(id.clone()))?;
        unit.settings = settings;
        Ok(())
    }

    /// Looks up a unit record.
    pub fn get(&self, id: &UnitId) -> Option<&TopologyUnit> {
        self.units.get(id)
    }

    /// Snapshot of all unit ids in deterministic order, for the error
    /// detector's poll loop. Restartable: each call produces a fresh sequence.
    pub fn all_units(&self) -> Vec<UnitId> {
        let mut ids: Vec<UnitId> = self.units.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// True when the graph has no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Replaces a failed unit with a fresh instance of the same role and
    /// settings under a generation-suffixed identifier, rewiring every
    /// upstream and downstream edge and discarding the old record. In-flight
    /// wave tracking that references the old identifier is abandoned; the
    /// next barrier or recovery cycle restores consistency.
    pub fn replace_unit(&mut self, failed: &UnitId) -> Result<UnitId, TopologyError> {
        let old = self
            .units
            .remove(failed)
            .ok_or_else(|| TopologyError::UnknownUnit(failed.clone()))?;
        self.generation += 1;
        let new_id = UnitId::new(format!("{}-r{}", failed.as_str(), self.generation));

        let mut fresh = TopologyUnit::new(new_id.clone(), old.role, old.settings.clone());
        fresh.upstream = old.upstream.clone();
        fresh.downstream = old.downstream.clone();

        for up in &old.upstream {
            if let Some(unit) = self.units.get_mut(up) {
                unit.downstream.remove(failed);
                unit.downstream.insert(new_id.clone());
                let _ = unit.settings.remove_child(failed);
                let _ = unit.settings.add_child(new_id.clone(), old.role);
            }
        }
        for down in &old.downstream {
            if let Some(unit) = self.units.get_mut(down) {
                unit.upstream.remove(failed);
                unit.upstream.insert(new_id.clone());
            }
        }

        self.units.insert(new_id.clone(), fresh);
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, role: UnitRole) -> TopologyUnit {
        TopologyUnit::new(UnitId::from(id), role, OperatorSettings::new(role))
    }

    fn three_tier() -> TopologyGraph {
        let mut graph = TopologyGraph::new();
        graph.add_unit(unit("source-0", UnitRole::Source)).unwrap();
        graph.add_unit(unit("stateless-0", UnitRole::Stateless)).unwrap();
        graph.add_unit(unit("stateful-0", UnitRole::Stateful)).unwrap();
        graph
            .connect(&UnitId::from("source-0"), &UnitId::from("stateless-0"))
            .unwrap();
        graph
            .connect(&UnitId::from("stateless-0"), &UnitId::from("stateful-0"))
            .unwrap();
        graph
    }

    #[test]
    fn duplicate_unit_rejected() {
        let mut graph = three_tier();
        let err = graph.add_unit(unit("source-0", UnitRole::Source)).unwrap_err();
        assert_eq!(err, TopologyError::DuplicateUnit(UnitId::from("source-0")));
    }

    #[test]
    fn duplicate_edge_rejected() {
        let mut graph = three_tier();
        let err = graph
            .connect(&UnitId::from("source-0"), &UnitId::from("stateless-0"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateEdge(_, _)));
    }

    #[test]
    fn source_cannot_be_downstream() {
        let mut graph = three_tier();
        let err = graph
            .connect(&UnitId::from("stateful-0"), &UnitId::from("source-0"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::SourceCannotBeDownstream(_)));
    }

    #[test]
    fn connect_updates_settings_registry() {
        let graph = three_tier();
        let source = graph.get(&UnitId::from("source-0")).unwrap();
        assert_eq!(
            source.settings.child_ids(),
            vec![UnitId::from("stateless-0")]
        );
    }

    #[test]
    fn remove_unit_detaches_neighbours() {
        let mut graph = three_tier();
        graph.remove_unit(&UnitId::from("stateless-0")).unwrap();
        let source = graph.get(&UnitId::from("source-0")).unwrap();
        assert!(source.downstream.is_empty());
        assert!(source.settings.children.is_empty());
        let sink = graph.get(&UnitId::from("stateful-0")).unwrap();
        assert!(sink.upstream.is_empty());
    }

    #[test]
    fn disconnect_unknown_edge_fails() {
        let mut graph = three_tier();
        let err = graph
            .disconnect(&UnitId::from("source-0"), &UnitId::from("stateful-0"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::UnknownEdge(_, _)));
    }

    #[test]
    fn replacement_rewires_all_edges() {
        let mut graph = three_tier();
        let new_id = graph.replace_unit(&UnitId::from("stateless-0")).unwrap();
        assert_eq!(new_id, UnitId::from("stateless-0-r1"));
        assert!(graph.get(&UnitId::from("stateless-0")).is_none());

        let source = graph.get(&UnitId::from("source-0")).unwrap();
        assert!(source.downstream.contains(&new_id));
        assert!(source.settings.children.contains_key(&new_id));
        assert!(!source.settings.children.contains_key(&UnitId::from("stateless-0")));

        let replacement = graph.get(&new_id).unwrap();
        assert_eq!(replacement.role, UnitRole::Stateless);
        assert!(replacement.upstream.contains(&UnitId::from("source-0")));
        assert!(replacement.downstream.contains(&UnitId::from("stateful-0")));

        let sink = graph.get(&UnitId::from("stateful-0")).unwrap();
        assert!(sink.upstream.contains(&new_id));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn replacing_unknown_unit_fails() {
        let mut graph = three_tier();
        let err = graph.replace_unit(&UnitId::from("ghost")).unwrap_err();
        assert_eq!(err, TopologyError::UnknownUnit(UnitId::from("ghost")));
    }
}
